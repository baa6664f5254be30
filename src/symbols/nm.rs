//! nm output parser
//!
//! Runs `nm --defined-only -S -l -n -C` to recover which source file defines
//! each symbol. objdump attributes locals through `df` context lines but
//! says nothing about globals; nm's `-l` column fills that gap. The merge
//! is keyed purely by address.

use crate::error::{EngineError, Result};
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

/// Run nm on `executable` and collect an address -> defining file map.
pub async fn load(nm_path: &Path, executable: &Path) -> Result<HashMap<u64, String>> {
    let output = tokio::process::Command::new(nm_path)
        .args(["--defined-only", "-S", "-l", "-n", "-C"])
        .arg(executable)
        .output()
        .await
        .map_err(|_| EngineError::ToolUnavailable {
            tool: "nm".to_string(),
            path: nm_path.to_path_buf(),
        })?;
    if !output.status.success() {
        warn!(
            "nm exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
        return Err(EngineError::ToolUnavailable {
            tool: "nm".to_string(),
            path: nm_path.to_path_buf(),
        });
    }
    Ok(parse(&String::from_utf8_lossy(&output.stdout)))
}

/// Parse nm output. Lines without a file column contribute nothing.
pub fn parse(text: &str) -> HashMap<u64, String> {
    // "08000400 00000080 T main" (size column optional).
    let head_re = Regex::new(r"^([0-9a-fA-F]+)(?:\s+[0-9a-fA-F]+)?\s+\S\s+\S").unwrap();
    let mut map = HashMap::new();

    for line in text.lines() {
        // -l appends "\t<file>:<line>"; everything before the tab is the
        // symbol head, which may itself contain spaces once demangled.
        let Some((head, location)) = line.split_once('\t') else {
            continue;
        };
        let Some(caps) = head_re.captures(head) else {
            continue;
        };
        let Ok(address) = u64::from_str_radix(&caps[1], 16) else {
            continue;
        };
        let file = match location.rsplit_once(':') {
            Some((path, line_no)) if line_no.chars().all(|c| c.is_ascii_digit()) => path,
            _ => location,
        };
        if !file.is_empty() {
            map.insert(address, file.to_string());
        }
    }

    debug!("nm: {} attributed addresses", map.len());
    map
}
