// src/transport/mod.rs
//! Transport bindings for encoded discovery data
//!
//! - **File Sink**: synchronous writes with absolute offset tracking
//! - **Socket Sink**: bounded queue drained by a dedicated writer task
//! - **Buffer Queue**: the producer side of that queue, with statistics
//! - **Wire**: message framing of the live socket protocol
//!
//! # Architecture
//!
//! ```text
//! test_finished() → encode → Sink::write_all
//!                              │
//!            ┌─────────────────┴──────────────────┐
//!            ▼                                    ▼
//!        FileSink                         SocketSink
//!    (caller's thread)      Bounded Queue (10) → Writer Task
//!                                                 │ await writable
//!                                                 ▼
//!                                          partial try_write
//! ```

pub mod buffer_queue;
pub mod file_sink;
pub mod socket_sink;
pub mod wire;

use crate::utils::errors::Result;

pub use buffer_queue::{BufferQueue, QueueStats};
pub use file_sink::FileSink;
pub use socket_sink::SocketSink;
pub use wire::{WireMessage, WIRE_VERSION};

/// Destination for an ordered byte stream
pub trait Sink {
    /// Append `data` after everything written so far
    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Absolute offset of the next byte to be written
    fn position(&self) -> u64;

    /// Whether readers can seek within the finished stream. Framings that
    /// point backwards (the deferred footer) need this.
    fn is_seekable(&self) -> bool;

    /// Signal that no further bytes follow
    fn close(&mut self) -> Result<()>;
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        (**self).write_all(data)
    }

    fn position(&self) -> u64 {
        (**self).position()
    }

    fn is_seekable(&self) -> bool {
        (**self).is_seekable()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}
