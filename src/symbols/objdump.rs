//! objdump output parser
//!
//! Runs `objdump -h -t -C -w` on the firmware image and parses the section
//! headers and the symbol table. This is the authoritative symbol source;
//! nm output only supplements it with file attribution for globals.

use crate::error::{EngineError, Result};
use regex::Regex;
use std::path::Path;
use tracing::{debug, warn};

/// Scope column of an objdump symbol line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawScope {
    Local,
    Global,
    /// `!`: both local and global (rare, linker-generated).
    Both,
    /// Blank scope column.
    Neither,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawKind {
    Function,
    Object,
    File,
    Other,
}

/// One symbol table line, before classification.
#[derive(Debug, Clone)]
pub struct RawSymbol {
    pub name: String,
    pub address: u64,
    pub length: u64,
    pub section: String,
    pub scope: RawScope,
    pub kind: RawKind,
    /// Set from the preceding `df` file symbol for local symbols.
    pub file: Option<String>,
    pub hidden: bool,
}

/// A loadable section from the `-h` header dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub name: String,
    pub size: u64,
    pub vma: u64,
    pub lma: u64,
}

impl MemoryRegion {
    pub fn contains(&self, address: u64) -> bool {
        address >= self.vma && address < self.vma.saturating_add(self.size)
    }
}

#[derive(Debug, Default)]
pub struct ObjdumpOutput {
    pub regions: Vec<MemoryRegion>,
    pub symbols: Vec<RawSymbol>,
}

/// Run objdump on `executable` and parse its output.
pub async fn load(objdump_path: &Path, executable: &Path) -> Result<ObjdumpOutput> {
    let output = tokio::process::Command::new(objdump_path)
        .args(["-h", "-t", "-C", "-w"])
        .arg(executable)
        .output()
        .await
        .map_err(|_| EngineError::ToolUnavailable {
            tool: "objdump".to_string(),
            path: objdump_path.to_path_buf(),
        })?;
    if !output.status.success() {
        warn!(
            "objdump exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
        return Err(EngineError::ToolUnavailable {
            tool: "objdump".to_string(),
            path: objdump_path.to_path_buf(),
        });
    }
    Ok(parse(&String::from_utf8_lossy(&output.stdout)))
}

/// Is this an ARM/AArch64 mapping marker (`$t`, `$a`, `$d`, `$x`, with an
/// optional `.<n>` suffix)? They carry no data and pollute range queries.
fn is_mapping_marker(name: &str) -> bool {
    let base = name.split('.').next().unwrap_or(name);
    matches!(base, "$t" | "$a" | "$d" | "$x")
}

/// Parse complete `objdump -h -t -C -w` output.
///
/// Two-state scan: section header lines until the `SYMBOL TABLE:` sentinel,
/// symbol lines after it. Unrecognized lines are skipped.
pub fn parse(text: &str) -> ObjdumpOutput {
    // " 0 .text  00010000  08000000  08000000  00010074  2**2  CONTENTS, ALLOC, ..."
    let section_re =
        Regex::new(r"^\s*\d+\s+(\S+)\s+([0-9a-fA-F]+)\s+([0-9a-fA-F]+)\s+([0-9a-fA-F]+)\s+[0-9a-fA-F]+\s+2\*\*\d+\s+(.*)$")
            .unwrap();
    // "08000100 l     F .text\t00000040 main"
    let symbol_re =
        Regex::new(r"^([0-9a-fA-F]+)\s(.{7})\s+(\S+)\s+([0-9a-fA-F]+)\s+(.+)$").unwrap();

    let mut out = ObjdumpOutput::default();
    let mut in_symbols = false;
    let mut current_file: Option<String> = None;

    for line in text.lines() {
        if line.starts_with("SYMBOL TABLE:") {
            in_symbols = true;
            continue;
        }
        if !in_symbols {
            if let Some(caps) = section_re.captures(line) {
                let flags = &caps[5];
                let size = u64::from_str_radix(&caps[2], 16).unwrap_or(0);
                if size > 0 && flags.contains("ALLOC") {
                    out.regions.push(MemoryRegion {
                        name: caps[1].to_string(),
                        size,
                        vma: u64::from_str_radix(&caps[3], 16).unwrap_or(0),
                        lma: u64::from_str_radix(&caps[4], 16).unwrap_or(0),
                    });
                }
            }
            continue;
        }

        let Some(caps) = symbol_re.captures(line) else {
            continue;
        };
        let flags = &caps[2];
        let section = caps[3].to_string();
        if section == "*UND*" {
            continue;
        }
        let address = match u64::from_str_radix(&caps[1], 16) {
            Ok(a) => a,
            Err(_) => continue,
        };
        let length = u64::from_str_radix(&caps[4], 16).unwrap_or(0);

        let mut name = caps[5].trim().to_string();
        let hidden = if let Some(rest) = name.strip_prefix(".hidden ") {
            name = rest.to_string();
            true
        } else {
            false
        };

        let scope = match flags.chars().next() {
            Some('l') => RawScope::Local,
            Some('g') | Some('u') => RawScope::Global,
            Some('!') => RawScope::Both,
            _ => RawScope::Neither,
        };
        let kind = match flags.chars().nth(6) {
            Some('F') => RawKind::Function,
            Some('O') => RawKind::Object,
            Some('f') => RawKind::File,
            _ => RawKind::Other,
        };

        if kind == RawKind::File {
            // A file symbol opens a new local-attribution context.
            current_file = Some(name.clone());
            continue;
        }
        if length == 0 && is_mapping_marker(&name) {
            continue;
        }

        let file = match scope {
            RawScope::Local => current_file.clone(),
            _ => None,
        };
        out.symbols.push(RawSymbol {
            name,
            address,
            length,
            section,
            scope,
            kind,
            file,
            hidden,
        });
    }

    debug!(
        "objdump: {} sections, {} symbols",
        out.regions.len(),
        out.symbols.len()
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\n\
firmware.elf:     file format elf32-littlearm\n\
\n\
Sections:\n\
Idx Name          Size      VMA       LMA       File off  Algn  Flags\n\
  0 .text         00010000  08000000  08000000  00010000  2**2  CONTENTS, ALLOC, LOAD, READONLY, CODE\n\
  1 .data         00000200  20000000  08010000  00020000  2**2  CONTENTS, ALLOC, LOAD, DATA\n\
  2 .comment      0000001c  00000000  00000000  00020200  2**0  CONTENTS, READONLY\n\
SYMBOL TABLE:\n\
00000000 l    df *ABS*\t00000000 main.c\n\
08000100 l     F .text\t00000040 helper\n\
08000200 l     O .data\t00000004 counter\n\
08000150 l       .text\t00000000 $t\n\
00000000 l    df *ABS*\t00000000 timer.c\n\
08000300 l     F .text\t00000020 tick\n\
08000400 g     F .text\t00000080 main\n\
20000000 g     O .data\t00000004 g_state\n\
00000000         *UND*\t00000000 memcpy\n\
08000500  w    F .text\t00000010 HardFault_Handler\n\
";

    #[test]
    fn sections_need_alloc_and_size() {
        let out = parse(SAMPLE);
        let names: Vec<&str> = out.regions.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec![".text", ".data"]);
        assert_eq!(out.regions[1].vma, 0x2000_0000);
        assert_eq!(out.regions[1].lma, 0x0801_0000);
        assert!(out.regions[0].contains(0x0800_ffff));
        assert!(!out.regions[0].contains(0x0801_0000));
    }

    #[test]
    fn file_symbols_attribute_following_locals() {
        let out = parse(SAMPLE);
        let helper = out.symbols.iter().find(|s| s.name == "helper").unwrap();
        assert_eq!(helper.file.as_deref(), Some("main.c"));
        let tick = out.symbols.iter().find(|s| s.name == "tick").unwrap();
        assert_eq!(tick.file.as_deref(), Some("timer.c"));
        // Globals are not attributed by objdump.
        let main = out.symbols.iter().find(|s| s.name == "main").unwrap();
        assert_eq!(main.file, None);
        assert_eq!(main.scope, RawScope::Global);
        assert_eq!(main.kind, RawKind::Function);
        assert_eq!(main.length, 0x80);
    }

    #[test]
    fn mapping_markers_und_and_file_symbols_dropped() {
        let out = parse(SAMPLE);
        assert!(out.symbols.iter().all(|s| s.name != "$t"));
        assert!(out.symbols.iter().all(|s| s.name != "memcpy"));
        assert!(out.symbols.iter().all(|s| s.name != "main.c"));
    }

    #[test]
    fn weak_symbol_has_blank_scope() {
        let out = parse(SAMPLE);
        let hf = out
            .symbols
            .iter()
            .find(|s| s.name == "HardFault_Handler")
            .unwrap();
        assert_eq!(hf.scope, RawScope::Neither);
        assert_eq!(hf.kind, RawKind::Function);
    }

    #[test]
    fn garbage_lines_are_skipped() {
        let out = parse("SYMBOL TABLE:\nnot a symbol line\nzzzz l F .text 10 x\n");
        assert!(out.symbols.is_empty());
    }

    #[test]
    fn hidden_marker_is_stripped() {
        let out = parse(
            "SYMBOL TABLE:\n08000600 g     F .text\t00000010 .hidden __aeabi_uldivmod\n",
        );
        let s = &out.symbols[0];
        assert!(s.hidden);
        assert_eq!(s.name, "__aeabi_uldivmod");
    }
}
