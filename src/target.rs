//! Target introspection
//!
//! Scrapes architecture, pointer width and the live memory map out of the
//! debugger after connecting. Every probe degrades independently: a server
//! that implements none of them still yields a usable `TargetInfo`.

use crate::mi::GdbSession;
use crate::symbols::SymbolTable;
use regex::Regex;
use tracing::{debug, warn};

/// One row of the debugger's `info mem` map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetMemoryRegion {
    pub start: u64,
    /// Exclusive upper bound, as the debugger reports it.
    pub end: u64,
    pub attrs: String,
}

impl TargetMemoryRegion {
    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end
    }
}

#[derive(Debug, Clone)]
pub struct TargetInfo {
    /// Bytes per pointer; embedded default is 4.
    pub pointer_size: u32,
    /// Architecture name as the debugger spells it, e.g. `armv7e-m`.
    pub architecture: Option<String>,
    /// Live memory map from the server; often empty.
    pub regions: Vec<TargetMemoryRegion>,
}

impl Default for TargetInfo {
    fn default() -> Self {
        Self {
            pointer_size: 4,
            architecture: None,
            regions: Vec::new(),
        }
    }
}

impl TargetInfo {
    /// Probe the connected target. Failed probes leave defaults in place.
    pub async fn discover(session: &GdbSession) -> TargetInfo {
        let mut info = TargetInfo::default();

        match session
            .command_ok("data-evaluate-expression sizeof($pc)")
            .await
        {
            Ok(record) => {
                if let Some(size) = crate::mi::types::find(&record.results, "value")
                    .and_then(|v| v.as_u64())
                {
                    if size == 4 || size == 8 {
                        info.pointer_size = size as u32;
                    }
                }
            }
            Err(e) => warn!("pointer width probe failed: {}", e),
        }

        match session.execute_console("show architecture").await {
            Ok(text) => info.architecture = parse_architecture(&text),
            Err(e) => warn!("architecture probe failed: {}", e),
        }

        match session.execute_console("info mem").await {
            Ok(text) => info.regions = parse_mem_regions(&text),
            Err(e) => warn!("memory map probe failed: {}", e),
        }

        debug!(
            "target: {:?}, {}-bit pointers, {} live regions",
            info.architecture,
            info.pointer_size * 8,
            info.regions.len()
        );
        info
    }

    /// Can the address be read without faulting the server?
    ///
    /// The live map and the image's loadable sections are OR-ed: vendor
    /// servers underreport peripheral windows, and images know nothing
    /// about RAM the linker never touched. With no evidence either way
    /// the address is allowed through.
    pub fn is_accessible(&self, address: u64, table: &SymbolTable) -> bool {
        if self.regions.is_empty() && table.regions().is_empty() {
            return true;
        }
        self.regions.iter().any(|r| r.contains(address)) || table.in_loadable_region(address)
    }
}

/// `The target architecture is set to "auto" (currently armv7e-m).`
/// or `The target architecture is set to "arm".`
fn parse_architecture(text: &str) -> Option<String> {
    let current = Regex::new(r#"currently\s+([^")\s.]+)"#).unwrap();
    if let Some(caps) = current.captures(text) {
        return Some(caps[1].to_string());
    }
    let quoted = Regex::new(r#"set to\s+"([^"]+)""#).unwrap();
    let arch = quoted.captures(text).map(|c| c[1].to_string())?;
    if arch == "auto" {
        None
    } else {
        Some(arch)
    }
}

/// `Num Enb Low Addr   High Addr  Attrs` rows; only enabled rows count.
fn parse_mem_regions(text: &str) -> Vec<TargetMemoryRegion> {
    let row = Regex::new(r"^\s*\d+\s+(y|n)\s+0x([0-9a-fA-F]+)\s+0x([0-9a-fA-F]+)\s*(.*)$")
        .unwrap();
    let mut out = Vec::new();
    for line in text.lines() {
        let Some(caps) = row.captures(line) else {
            continue;
        };
        if &caps[1] != "y" {
            continue;
        }
        let (Ok(start), Ok(end)) = (
            u64::from_str_radix(&caps[2], 16),
            u64::from_str_radix(&caps[3], 16),
        ) else {
            continue;
        };
        if end <= start {
            continue;
        }
        out.push(TargetMemoryRegion {
            start,
            end,
            attrs: caps[4].trim().to_string(),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::SymbolTable;

    #[test]
    fn architecture_prefers_the_current_value() {
        let text = "The target architecture is set to \"auto\" (currently armv7e-m).\n";
        assert_eq!(parse_architecture(text).as_deref(), Some("armv7e-m"));
        let text = "The target architecture is set to \"riscv:rv32\".\n";
        assert_eq!(parse_architecture(text).as_deref(), Some("riscv:rv32"));
        assert_eq!(parse_architecture("The target architecture is set to \"auto\".\n"), None);
        assert_eq!(parse_architecture("nonsense"), None);
    }

    #[test]
    fn mem_rows_parse_and_disabled_rows_drop() {
        let text = "\
Using memory regions provided by the target.
Num Enb Low Addr   High Addr  Attrs
0   y  \t0x08000000 0x08100000 flash blocksize 0x800 nocache
1   y  \t0x20000000 0x20020000 rw nocache
2   n  \t0x40000000 0x50000000 rw
";
        let regions = parse_mem_regions(text);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].start, 0x0800_0000);
        assert!(regions[0].contains(0x080f_ffff));
        assert!(!regions[0].contains(0x0810_0000));
        assert!(regions[1].attrs.contains("rw"));
    }

    #[test]
    fn accessibility_ors_live_and_static_maps() {
        let mut info = TargetInfo::default();
        let table = SymbolTable::default();
        // No evidence at all: permissive.
        assert!(info.is_accessible(0xdead_beef, &table));

        info.regions.push(TargetMemoryRegion {
            start: 0x2000_0000,
            end: 0x2002_0000,
            attrs: String::new(),
        });
        assert!(info.is_accessible(0x2000_1000, &table));
        assert!(!info.is_accessible(0x6000_0000, &table));
    }
}
