//! Windowed disassembly adapter
//!
//! The engine never decodes machine code itself. It asks an instruction
//! source (the helper, in production) for a window around a reference
//! address and reshapes the compact reply (integer-indexed function and
//! file tables) into self-contained rows for the front end.

use crate::error::{EngineError, Result};
use crate::target::TargetInfo;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Longest symbol name shown untruncated in a disassembly row.
const SYMBOL_DISPLAY_CHARS: usize = 22;
/// A source span attached to one instruction never exceeds this many lines.
const MAX_SPAN_LINES: u32 = 5;

/// A window query: `count` instructions around `reference`, shifted by a
/// byte offset applied first and an instruction offset applied second.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowRequest {
    pub reference: u64,
    pub byte_offset: i64,
    pub instruction_offset: i64,
    pub count: u64,
}

/// One decoded instruction as the source reports it. `function` and `file`
/// index into the response's name tables.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawInstruction {
    pub address: u64,
    #[serde(default)]
    pub bytes: String,
    pub text: String,
    #[serde(default)]
    pub function: Option<u32>,
    #[serde(default)]
    pub file: Option<u32>,
    #[serde(default)]
    pub start_line: Option<u32>,
    #[serde(default)]
    pub end_line: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowResponse {
    pub instructions: Vec<RawInstruction>,
    #[serde(default)]
    pub function_names: Vec<String>,
    #[serde(default)]
    pub file_names: Vec<String>,
}

/// Where decoded instruction windows come from. Mocked in tests.
#[async_trait]
pub trait InstructionSource: Send + Sync {
    async fn fetch_window(&self, request: WindowRequest) -> Result<WindowResponse>;
}

/// Source location of one instruction, expanded from the index tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpan {
    pub file: String,
    pub start_line: u32,
    pub end_line: u32,
}

/// One row as presented to the front end.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Instruction {
    /// Zero-padded hex address at the target's pointer width.
    pub address: String,
    pub instruction_bytes: String,
    pub instruction: String,
    /// Containing symbol, possibly shortened from the left.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceSpan>,
}

/// What the engine assumes about an instruction set when windowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchHint {
    pub name: &'static str,
    pub min_insn: u8,
    pub max_insn: u8,
    /// References are aligned down to this before querying.
    pub alignment: u8,
}

/// Map an architecture name (as the debugger spells it) to the hint the
/// instruction source understands.
pub fn arch_hint(architecture: &str) -> Option<ArchHint> {
    let arch = architecture.to_ascii_lowercase();
    if arch.starts_with("aarch64") {
        Some(ArchHint { name: "aarch64", min_insn: 4, max_insn: 4, alignment: 4 })
    } else if arch.starts_with("arm") {
        // Thumb-2: mixed 16/32-bit, halfword aligned.
        Some(ArchHint { name: "arm", min_insn: 2, max_insn: 4, alignment: 2 })
    } else if arch.starts_with("riscv") {
        Some(ArchHint { name: "riscv", min_insn: 2, max_insn: 4, alignment: 2 })
    } else if arch.starts_with("xtensa") {
        Some(ArchHint { name: "xtensa", min_insn: 2, max_insn: 3, alignment: 1 })
    } else {
        None
    }
}

fn shorten_symbol(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    if chars.len() <= SYMBOL_DISPLAY_CHARS {
        name.to_string()
    } else {
        let tail: String = chars[chars.len() - SYMBOL_DISPLAY_CHARS..].iter().collect();
        format!("\u{2026}{}", tail)
    }
}

pub struct DisassemblyAdapter {
    source: std::sync::Arc<dyn InstructionSource>,
    hint: ArchHint,
    /// Hex digits in a rendered address.
    addr_digits: usize,
}

impl DisassemblyAdapter {
    /// Bind a source to the discovered target. Fails when the architecture
    /// is not in the hint table; the caller then disables disassembly.
    pub fn initialize(
        source: std::sync::Arc<dyn InstructionSource>,
        target: &TargetInfo,
    ) -> Result<DisassemblyAdapter> {
        let name = target
            .architecture
            .as_deref()
            .ok_or_else(|| EngineError::ArchitectureUnsupported("unknown".to_string()))?;
        let hint = arch_hint(name)
            .ok_or_else(|| EngineError::ArchitectureUnsupported(name.to_string()))?;
        debug!(
            "disassembly adapter: {} ({}-bit)",
            hint.name,
            target.pointer_size * 8
        );
        Ok(DisassemblyAdapter {
            source,
            hint,
            addr_digits: target.pointer_size as usize * 2,
        })
    }

    pub fn architecture(&self) -> &'static str {
        self.hint.name
    }

    /// Fetch and render a window of `count` instructions around `reference`.
    pub async fn disassemble(
        &self,
        reference: u64,
        byte_offset: i64,
        instruction_offset: i64,
        count: u64,
    ) -> Result<Vec<Instruction>> {
        // A misaligned reference (e.g. a Thumb function pointer with its
        // LSB set) would shift every decoded instruction.
        let reference = reference & !(u64::from(self.hint.alignment) - 1);
        let window = self
            .source
            .fetch_window(WindowRequest {
                reference,
                byte_offset,
                instruction_offset,
                count,
            })
            .await?;

        let mut out = Vec::with_capacity(window.instructions.len());
        for raw in window.instructions {
            let symbol = raw
                .function
                .and_then(|i| window.function_names.get(i as usize))
                .map(|name| shorten_symbol(name));
            let location = raw
                .file
                .and_then(|i| window.file_names.get(i as usize))
                .map(|file| {
                    let start_line = raw.start_line.unwrap_or(1);
                    let end_line = raw
                        .end_line
                        .unwrap_or(start_line)
                        .clamp(start_line, start_line + MAX_SPAN_LINES);
                    SourceSpan {
                        file: file.clone(),
                        start_line,
                        end_line,
                    }
                });
            out.push(Instruction {
                address: format!("0x{:0width$x}", raw.address, width = self.addr_digits),
                instruction_bytes: raw.bytes,
                instruction: raw.text,
                symbol,
                location,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct MockSource {
        response: WindowResponse,
    }

    #[async_trait]
    impl InstructionSource for MockSource {
        async fn fetch_window(&self, request: WindowRequest) -> Result<WindowResponse> {
            // Synthesize `count` 4-byte instructions starting at the shifted
            // reference, as a real decoder would.
            if !self.response.instructions.is_empty() {
                return Ok(self.response.clone());
            }
            let base = (request.reference as i64
                + request.byte_offset
                + request.instruction_offset * 4) as u64;
            let instructions = (0..request.count)
                .map(|i| RawInstruction {
                    address: base + i * 4,
                    bytes: "00 bf".to_string(),
                    text: "nop".to_string(),
                    function: None,
                    file: None,
                    start_line: None,
                    end_line: None,
                })
                .collect();
            Ok(WindowResponse {
                instructions,
                function_names: Vec::new(),
                file_names: Vec::new(),
            })
        }
    }

    fn arm_target() -> TargetInfo {
        TargetInfo {
            pointer_size: 4,
            architecture: Some("armv7e-m".to_string()),
            regions: Vec::new(),
        }
    }

    fn adapter_with(response: WindowResponse) -> DisassemblyAdapter {
        DisassemblyAdapter::initialize(Arc::new(MockSource { response }), &arm_target()).unwrap()
    }

    #[tokio::test]
    async fn window_centers_on_reference() {
        let adapter = adapter_with(WindowResponse::default());
        let rows = adapter.disassemble(0x1000, 0, -5, 10).await.unwrap();
        assert_eq!(rows.len(), 10);
        // Five instructions before the reference, the reference itself sixth.
        assert_eq!(rows[5].address, "0x00001000");
        assert_eq!(rows[0].address, "0x00000fec");
    }

    #[tokio::test]
    async fn long_symbols_truncate_from_the_left() {
        let response = WindowResponse {
            instructions: vec![
                RawInstruction {
                    address: 0x100,
                    bytes: String::new(),
                    text: "bx lr".to_string(),
                    function: Some(0),
                    file: None,
                    start_line: None,
                    end_line: None,
                },
                RawInstruction {
                    address: 0x104,
                    bytes: String::new(),
                    text: "nop".to_string(),
                    function: Some(1),
                    file: None,
                    start_line: None,
                    end_line: None,
                },
            ],
            function_names: vec![
                "HAL_UART_TransmitReceive_IT".to_string(),
                "main".to_string(),
            ],
            file_names: Vec::new(),
        };
        let adapter = adapter_with(response);
        let rows = adapter.disassemble(0x100, 0, 0, 2).await.unwrap();
        let long = rows[0].symbol.as_deref().unwrap();
        assert!(long.starts_with('\u{2026}'));
        assert!(long.ends_with("TransmitReceive_IT"));
        assert_eq!(long.chars().count(), SYMBOL_DISPLAY_CHARS + 1);
        assert_eq!(rows[1].symbol.as_deref(), Some("main"));
    }

    #[tokio::test]
    async fn source_spans_clamp_to_five_lines() {
        let response = WindowResponse {
            instructions: vec![RawInstruction {
                address: 0x200,
                bytes: String::new(),
                text: "bl memset".to_string(),
                function: None,
                file: Some(0),
                start_line: Some(10),
                end_line: Some(90),
            }],
            function_names: Vec::new(),
            file_names: vec!["src/main.c".to_string()],
        };
        let adapter = adapter_with(response);
        let rows = adapter.disassemble(0x200, 0, 0, 1).await.unwrap();
        let span = rows[0].location.as_ref().unwrap();
        assert_eq!(span.file, "src/main.c");
        assert_eq!(span.start_line, 10);
        assert_eq!(span.end_line, 15);
    }

    #[tokio::test]
    async fn wide_pointers_render_wide_addresses() {
        let target = TargetInfo {
            pointer_size: 8,
            architecture: Some("aarch64".to_string()),
            regions: Vec::new(),
        };
        let adapter = DisassemblyAdapter::initialize(
            Arc::new(MockSource {
                response: WindowResponse::default(),
            }),
            &target,
        )
        .unwrap();
        let rows = adapter.disassemble(0x4000_0000, 0, 0, 1).await.unwrap();
        assert_eq!(rows[0].address, "0x0000000040000000");
    }

    #[test]
    fn unknown_architecture_is_rejected() {
        let target = TargetInfo {
            pointer_size: 4,
            architecture: Some("m68k".to_string()),
            regions: Vec::new(),
        };
        let err = DisassemblyAdapter::initialize(
            Arc::new(MockSource {
                response: WindowResponse::default(),
            }),
            &target,
        )
        .err()
        .unwrap();
        assert!(matches!(err, EngineError::ArchitectureUnsupported(_)));
    }

    #[test]
    fn hint_table_covers_known_families() {
        assert_eq!(arch_hint("armv7e-m").map(|h| h.name), Some("arm"));
        assert_eq!(arch_hint("aarch64").map(|h| h.name), Some("aarch64"));
        assert_eq!(arch_hint("riscv:rv32").map(|h| h.name), Some("riscv"));
        assert_eq!(arch_hint("xtensa").map(|h| h.name), Some("xtensa"));
        assert_eq!(arch_hint("i386"), None);
        assert_eq!(arch_hint("arm").map(|h| h.alignment), Some(2));
    }

    #[tokio::test]
    async fn thumb_references_align_down() {
        let adapter = adapter_with(WindowResponse::default());
        let rows = adapter.disassemble(0x1001, 0, 0, 1).await.unwrap();
        assert_eq!(rows[0].address, "0x00001000");
    }
}
