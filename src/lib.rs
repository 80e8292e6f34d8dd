// RustyQueue - a lock-free, unbounded, byte-payload FIFO queue
// Core library module

pub mod concurrent;
pub mod error;

pub use concurrent::{ByteQueue, QueueStats};
pub use error::{DbError, Result};

/// Crate version, as reported by the demonstration binary's startup banner.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
