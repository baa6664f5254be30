//! GDB/MI transport: line parser, typed records, and the session layer
//! that owns the debugger child process.

pub mod parser;
pub mod session;
pub mod types;

pub use session::{GdbSession, GdbSessionConfig, SessionEvent};
pub use types::{MiRecord, MiValue, ResultClass, ResultRecord, StreamKind};
