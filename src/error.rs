//! Engine Error Taxonomy
//!
//! Component-local failures (a dump tool dying, one malformed frame) are
//! handled at the component boundary and degrade the affected feature.
//! Only `StartupFailure` and an explicit stop end a session.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the debug engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The debugger or a managed subprocess failed to come up. Fatal to the session.
    #[error("failed to start {what}: {reason}")]
    StartupFailure { what: String, reason: String },

    /// An MI command got no matching result record in time. Recoverable.
    #[error("MI command {token} timed out after {secs}s")]
    CommandTimeout { token: u64, secs: u64 },

    /// A helper request got no matching response in time. Recoverable.
    #[error("helper request {seq} timed out after {secs}s")]
    RequestTimeout { seq: u64, secs: u64 },

    /// A peer sent something outside the wire contract. Logged and skipped.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A dump utility is missing or exited non-zero. Degrades one feature.
    #[error("{tool} unavailable (looked for {})", .path.display())]
    ToolUnavailable { tool: String, path: PathBuf },

    /// Architecture not in the hint table. Disables disassembly/address-width features.
    #[error("unsupported architecture: {0}")]
    ArchitectureUnsupported(String),

    /// Uniform rejection for anything issued during shutdown.
    #[error("session is stopping")]
    SessionStopping,

    /// A queued request was cancelled by a later resume-class request.
    #[error("request cancelled by a resume request")]
    Cancelled,

    /// The debugger reported an error result for a command.
    #[error("debugger error: {0}")]
    CommandFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
