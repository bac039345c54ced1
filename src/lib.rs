//! Async driver for serial ID card RFID reader/writers.
//!
//! Commands are framed as `AA DD 00 len | opcode | stuffed payload | xor`,
//! responses as `AA DD len(2) | opcode | status | stuffed data | xor`. One
//! command is in flight at a time; concurrent callers queue in arrival order.
//!
//! # Features
//!
//! - `serial` - Serial port channel for desktop using serialport crate
//!
//! # Example
//!
//! ```ignore
//! use idcard_rfid::{ReaderSession, SerialChannel, Tag};
//!
//! let reader = ReaderSession::new(SerialChannel::new("/dev/ttyUSB0"));
//! reader.connect().await?;
//!
//! let tag = reader.read_tag(true).await?;
//! println!("Found tag: {}", tag);
//!
//! reader.write_tag(&"01 02 03 04 05".parse()?, true).await?;
//! reader.disconnect().await;
//! ```

pub mod codec;
mod command;
mod reader;
mod semaphore;
mod transport;
mod types;

#[cfg(feature = "serial")]
mod serial;

// Re-exports
pub use codec::FrameDecoder;
pub use command::{Command, WriteVariant};
pub use reader::{ReaderConfig, ReaderSession, SessionState};
pub use semaphore::{SemaphorePermit, TransactionSemaphore};
pub use transport::ByteChannel;
pub use types::{IndicatorColor, Response, RfidError, Status, Tag, TAG_LEN};

#[cfg(feature = "serial")]
pub use serial::SerialChannel;
