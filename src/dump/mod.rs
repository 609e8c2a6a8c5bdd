//! The dump pipeline: streaming framework, sinks, and the NSP / gamecard
//! image builders.

pub mod nsp;
pub mod sink;
pub mod stream;
pub mod usb;
pub mod xci;

pub use sink::{FileSink, RecordingSink, Sink};
pub use stream::{StreamSession, TRANSFER_BLOCK_SIZE, run_transfer};
