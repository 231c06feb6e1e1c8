//! Channel abstraction for message I/O.

pub mod channel;
pub mod memory;
pub mod telegram;

pub use channel::*;
pub use memory::{MemoryTransport, SentItem};
pub use telegram::TelegramChannel;
