//! Launch configuration
//!
//! The front end sends one JSON object with the `launch` request; camelCase
//! keys, everything optional except the firmware image. Tool paths resolve
//! through the toolchain prefix when not given explicitly.

use crate::mi::GdbSessionConfig;
use crate::server::{GdbServerConfig, ServerType};
use crate::symbols::SymbolLoaderConfig;
use serde::Deserialize;
use std::ops::Range;
use std::path::PathBuf;
use std::time::Duration;

fn default_gdb() -> String {
    "gdb-multiarch".to_string()
}

fn default_server_type() -> ServerType {
    ServerType::External
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_port_base() -> u16 {
    50000
}

fn default_port_count() -> u16 {
    100
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchConfig {
    /// Firmware image (ELF) to debug.
    pub executable: PathBuf,

    #[serde(default = "default_gdb")]
    pub gdb_path: String,
    #[serde(default)]
    pub gdb_args: Vec<String>,
    /// Extra MI commands after the standard session setup.
    #[serde(default)]
    pub init_commands: Vec<String>,

    /// e.g. `arm-none-eabi-`; used to find objdump and nm.
    #[serde(default)]
    pub toolchain_prefix: Option<String>,
    #[serde(default)]
    pub objdump_path: Option<PathBuf>,
    #[serde(default)]
    pub nm_path: Option<PathBuf>,

    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Applied to every symbol address, for images copied at runtime.
    #[serde(default)]
    pub load_offset: u64,

    #[serde(default = "default_server_type")]
    pub server_type: ServerType,
    #[serde(default)]
    pub server_path: Option<String>,
    #[serde(default)]
    pub server_args: Option<Vec<String>>,
    #[serde(default)]
    pub server_init_match: Option<String>,

    #[serde(default)]
    pub helper_path: Option<PathBuf>,
    #[serde(default)]
    pub helper_args: Vec<String>,

    #[serde(default = "default_timeout_secs")]
    pub launch_timeout_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_port_base")]
    pub port_base: u16,
    #[serde(default = "default_port_count")]
    pub port_count: u16,
}

impl LaunchConfig {
    fn tool(&self, explicit: &Option<PathBuf>, name: &str) -> PathBuf {
        if let Some(path) = explicit {
            return path.clone();
        }
        match &self.toolchain_prefix {
            Some(prefix) => PathBuf::from(format!("{}{}", prefix, name)),
            None => PathBuf::from(name),
        }
    }

    pub fn objdump(&self) -> PathBuf {
        self.tool(&self.objdump_path, "objdump")
    }

    pub fn nm(&self) -> PathBuf {
        self.tool(&self.nm_path, "nm")
    }

    pub fn port_range(&self) -> Range<u16> {
        self.port_base..self.port_base.saturating_add(self.port_count)
    }

    pub fn session_config(&self) -> GdbSessionConfig {
        let defaults = GdbSessionConfig::default();
        let mut init_commands = defaults.init_commands;
        init_commands.extend(self.init_commands.iter().cloned());
        // Explicit arguments replace the stock MI invocation entirely.
        let gdb_args = if self.gdb_args.is_empty() {
            defaults.gdb_args
        } else {
            self.gdb_args.clone()
        };
        GdbSessionConfig {
            gdb_path: self.gdb_path.clone(),
            gdb_args,
            cwd: self.cwd.clone(),
            init_commands,
            launch_timeout: Duration::from_secs(self.launch_timeout_secs),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
        }
    }

    pub fn server_config(&self) -> GdbServerConfig {
        let mut config = GdbServerConfig::new(self.server_type);
        config.executable = self.server_path.clone();
        config.arguments = self.server_args.clone();
        config.init_match = self.server_init_match.clone();
        config.cwd = self.cwd.clone();
        config.startup_timeout = Duration::from_secs(self.launch_timeout_secs);
        config
    }

    pub fn symbol_config(&self) -> SymbolLoaderConfig {
        SymbolLoaderConfig {
            objdump_path: self.objdump(),
            nm_path: self.nm(),
            executable: self.executable.clone(),
            load_offset: self.load_offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: LaunchConfig =
            serde_json::from_str(r#"{"executable": "firmware.elf"}"#).unwrap();
        assert_eq!(config.gdb_path, "gdb-multiarch");
        assert_eq!(config.server_type, ServerType::External);
        assert_eq!(config.load_offset, 0);
        assert_eq!(config.port_range(), 50000..50100);
        assert_eq!(config.objdump(), PathBuf::from("objdump"));
    }

    #[test]
    fn toolchain_prefix_names_the_dump_tools() {
        let config: LaunchConfig = serde_json::from_str(
            r#"{"executable": "fw.elf", "toolchainPrefix": "arm-none-eabi-"}"#,
        )
        .unwrap();
        assert_eq!(config.objdump(), PathBuf::from("arm-none-eabi-objdump"));
        assert_eq!(config.nm(), PathBuf::from("arm-none-eabi-nm"));
    }

    #[test]
    fn explicit_tool_paths_beat_the_prefix() {
        let config: LaunchConfig = serde_json::from_str(
            r#"{
                "executable": "fw.elf",
                "toolchainPrefix": "arm-none-eabi-",
                "objdumpPath": "/opt/tools/llvm-objdump"
            }"#,
        )
        .unwrap();
        assert_eq!(config.objdump(), PathBuf::from("/opt/tools/llvm-objdump"));
        assert_eq!(config.nm(), PathBuf::from("arm-none-eabi-nm"));
    }

    #[test]
    fn camel_case_fields_round_trip_into_session_config() {
        let config: LaunchConfig = serde_json::from_str(
            r#"{
                "executable": "fw.elf",
                "gdbPath": "riscv64-unknown-elf-gdb",
                "serverType": "openocd",
                "commandTimeoutSecs": 3,
                "initCommands": ["target-select extended-remote :3333"]
            }"#,
        )
        .unwrap();
        let session = config.session_config();
        assert_eq!(session.gdb_path, "riscv64-unknown-elf-gdb");
        assert_eq!(session.command_timeout, Duration::from_secs(3));
        assert!(session
            .init_commands
            .last()
            .unwrap()
            .starts_with("target-select"));
        assert_eq!(config.server_type, ServerType::Openocd);
    }
}
