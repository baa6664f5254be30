//! Vendor gdb-server orchestration
//!
//! Each supported server family carries a capability record: default
//! executable, argument template, readiness banner, and how many TCP ports
//! it needs. Launch renders `{portN}` placeholders from the reserved port
//! block, then waits for readiness by banner match or, lacking one, by a
//! grace delay and a connect probe.

pub mod ports;

use crate::error::{EngineError, Result};
use ports::PortLock;
use regex::Regex;
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    Openocd,
    Jlink,
    Stlink,
    Qemu,
    /// A server the user starts and stops outside the engine.
    External,
}

/// What the engine knows about a server family.
#[derive(Debug, Clone)]
pub struct ServerCapability {
    pub executable: Option<&'static str>,
    pub arguments: &'static [&'static str],
    /// Banner line that signals the GDB port is open.
    pub init_match: Option<&'static str>,
    /// Reserve an extra port after the vendor block for the RTT decoder.
    pub allocate_rtt_ports: bool,
    pub ports_needed: u16,
}

impl ServerCapability {
    /// Vendor ports plus the trailing RTT port, when supported.
    pub fn total_ports(&self) -> u16 {
        self.ports_needed + u16::from(self.allocate_rtt_ports)
    }
}

impl ServerType {
    pub fn capability(&self) -> ServerCapability {
        match self {
            ServerType::Openocd => ServerCapability {
                executable: Some("openocd"),
                arguments: &["-c", "gdb_port {port0}", "-c", "tcl_port {port1}", "-c", "telnet_port {port2}"],
                init_match: Some(r"Listening on port \d+ for gdb connections"),
                allocate_rtt_ports: true,
                ports_needed: 3,
            },
            ServerType::Jlink => ServerCapability {
                executable: Some("JLinkGDBServerCLExe"),
                arguments: &["-port", "{port0}", "-swoport", "{port1}", "-telnetport", "{port2}"],
                init_match: Some(r"Waiting for GDB connection"),
                allocate_rtt_ports: true,
                ports_needed: 3,
            },
            ServerType::Stlink => ServerCapability {
                executable: Some("ST-LINK_gdbserver"),
                arguments: &["-p", "{port0}"],
                init_match: Some(r"Listening at \*"),
                allocate_rtt_ports: false,
                ports_needed: 1,
            },
            ServerType::Qemu => ServerCapability {
                executable: Some("qemu-system-arm"),
                arguments: &["-gdb", "tcp::{port0}", "-S"],
                init_match: None,
                allocate_rtt_ports: false,
                ports_needed: 1,
            },
            ServerType::External => ServerCapability {
                executable: None,
                arguments: &[],
                init_match: None,
                allocate_rtt_ports: false,
                ports_needed: 0,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct GdbServerConfig {
    pub server_type: ServerType,
    /// Override the capability's executable.
    pub executable: Option<String>,
    /// Override the capability's argument template.
    pub arguments: Option<Vec<String>>,
    /// Override the readiness banner.
    pub init_match: Option<String>,
    pub cwd: Option<PathBuf>,
    pub startup_timeout: Duration,
    /// Settle time before probing a server with no banner.
    pub ready_grace: Duration,
}

impl GdbServerConfig {
    pub fn new(server_type: ServerType) -> GdbServerConfig {
        GdbServerConfig {
            server_type,
            executable: None,
            arguments: None,
            init_match: None,
            cwd: None,
            startup_timeout: Duration::from_secs(10),
            ready_grace: Duration::from_secs(1),
        }
    }
}

/// Substitute `{portN}` placeholders in an argument template.
pub fn render_args(template: &[String], ports: &[u16]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            let mut arg = arg.clone();
            for (n, port) in ports.iter().enumerate() {
                arg = arg.replace(&format!("{{port{}}}", n), &port.to_string());
            }
            arg
        })
        .collect()
}

/// A running (or external) gdb-server holding its reserved ports.
pub struct GdbServer {
    child: Option<Child>,
    ports: Vec<PortLock>,
    pub server_type: ServerType,
}

impl GdbServer {
    /// Launch the server and wait for it to accept GDB connections.
    pub async fn launch(config: GdbServerConfig, ports: Vec<PortLock>) -> Result<GdbServer> {
        let cap = config.server_type.capability();

        if config.server_type == ServerType::External && config.executable.is_none() {
            info!("using externally managed gdb-server");
            return Ok(GdbServer {
                child: None,
                ports,
                server_type: config.server_type,
            });
        }

        let exe = config
            .executable
            .clone()
            .or_else(|| cap.executable.map(str::to_string))
            .ok_or_else(|| EngineError::StartupFailure {
                what: "gdb-server".to_string(),
                reason: "no executable configured".to_string(),
            })?;
        let template: Vec<String> = config
            .arguments
            .clone()
            .unwrap_or_else(|| cap.arguments.iter().map(|s| s.to_string()).collect());
        let port_numbers: Vec<u16> = ports.iter().map(PortLock::port).collect();
        let args = render_args(&template, &port_numbers);

        info!("starting {}: {:?}", exe, args);
        let mut cmd = tokio::process::Command::new(&exe);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }
        let mut child = cmd.spawn().map_err(|e| EngineError::StartupFailure {
            what: exe.clone(),
            reason: e.to_string(),
        })?;

        let (tx, mut rx) = mpsc::channel::<String>(64);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx));
        }

        let deadline = Instant::now() + config.startup_timeout;
        let banner = config
            .init_match
            .clone()
            .or_else(|| cap.init_match.map(str::to_string));
        match banner {
            Some(pattern) => {
                let re = Regex::new(&pattern).map_err(|e| EngineError::StartupFailure {
                    what: exe.clone(),
                    reason: format!("bad readiness pattern {:?}: {}", pattern, e),
                })?;
                wait_for_banner(&exe, &re, &mut rx, deadline).await?;
            }
            None => {
                tokio::time::sleep(config.ready_grace).await;
                if let Some(port) = port_numbers.first() {
                    wait_for_connect(&exe, *port, deadline).await?;
                }
            }
        }

        // Keep draining so a chatty server never fills its pipe.
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                debug!("server: {}", line);
            }
        });

        info!("{} ready", exe);
        Ok(GdbServer {
            child: Some(child),
            ports,
            server_type: config.server_type,
        })
    }

    /// Port at index `i` of the reserved block.
    pub fn port(&self, i: usize) -> Option<u16> {
        self.ports.get(i).map(PortLock::port)
    }

    pub fn gdb_port(&self) -> Option<u16> {
        self.port(0)
    }

    /// RTT decoder port, reserved right after the vendor's own block for
    /// families that support RTT.
    pub fn rtt_port(&self) -> Option<u16> {
        let cap = self.server_type.capability();
        if cap.allocate_rtt_ports {
            self.port(cap.ports_needed as usize)
        } else {
            None
        }
    }

    /// Kill the managed child, if any. Ports release when the server drops.
    pub async fn shutdown(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill().await;
            info!("gdb-server stopped");
        }
        self.child = None;
    }
}

async fn forward_lines(
    stream: impl tokio::io::AsyncRead + Unpin,
    tx: mpsc::Sender<String>,
) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).await.is_err() {
            break;
        }
    }
}

async fn wait_for_banner(
    exe: &str,
    re: &Regex,
    rx: &mut mpsc::Receiver<String>,
    deadline: Instant,
) -> Result<()> {
    let mut tail: VecDeque<String> = VecDeque::with_capacity(20);
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(line)) => {
                debug!("server: {}", line);
                if re.is_match(&line) {
                    return Ok(());
                }
                if tail.len() == 20 {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            // Output closed: the server exited before becoming ready.
            Ok(None) => {
                return Err(EngineError::StartupFailure {
                    what: exe.to_string(),
                    reason: format!(
                        "exited before becoming ready; last output: {}",
                        tail.iter().cloned().collect::<Vec<_>>().join(" | ")
                    ),
                });
            }
            Err(_) => {
                warn!("{} readiness banner not seen in time", exe);
                return Err(EngineError::StartupFailure {
                    what: exe.to_string(),
                    reason: "not ready before timeout".to_string(),
                });
            }
        }
    }
}

async fn wait_for_connect(exe: &str, port: u16, deadline: Instant) -> Result<()> {
    loop {
        match tokio::net::TcpStream::connect(("127.0.0.1", port)).await {
            Ok(_) => return Ok(()),
            Err(_) if Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
            Err(e) => {
                return Err(EngineError::StartupFailure {
                    what: exe.to_string(),
                    reason: format!("port {} never accepted a connection: {}", port, e),
                });
            }
        }
    }
}
