//! Length-prefixed JSON transport to the analysis helper process.

pub mod frame;
pub mod transport;

pub use frame::{encode_frame, FrameDecoder, BATCH_LIMIT};
pub use transport::{HelperEvent, HelperTransport};
