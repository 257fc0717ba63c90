// src/transport/buffer_queue.rs
//! Bounded buffer queue between the instrumented program and the writer task
//!
//! Unlike a lossy event queue, a full queue never drops data: the producer
//! blocks until the writer has made room. Blocking uses plain channel waits,
//! so producers may run on any thread, including async runtime workers.

use crate::utils::errors::{DiscoveryError, Result};
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Counters shared between the producer and the writer
#[derive(Debug, Default)]
pub(crate) struct QueueCounters {
    pub(crate) enqueued: AtomicU64,
    pub(crate) bytes_enqueued: AtomicU64,
    pub(crate) written: AtomicU64,
    pub(crate) bytes_written: AtomicU64,
    pub(crate) blocked: AtomicU64,
}

/// Producer side of the bounded queue
#[derive(Debug)]
pub struct BufferQueue {
    sender: Option<Sender<Bytes>>,
    capacity: usize,
    counters: Arc<QueueCounters>,
}

impl BufferQueue {
    /// Create a queue holding at most `capacity` buffers; returns the
    /// consumer end for the writer task
    pub fn new(capacity: usize) -> (Self, Receiver<Bytes>) {
        let capacity = capacity.max(1);
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        let queue = Self {
            sender: Some(sender),
            capacity,
            counters: Arc::new(QueueCounters::default()),
        };
        (queue, receiver)
    }

    /// Enqueue a buffer, blocking while the queue is full
    pub fn push(&self, buffer: Bytes) -> Result<()> {
        let sender = self.sender.as_ref().ok_or(DiscoveryError::SessionClosed)?;
        let len = buffer.len() as u64;

        match sender.try_send(buffer) {
            Ok(()) => {}
            Err(TrySendError::Full(buffer)) => {
                self.counters.blocked.fetch_add(1, Ordering::Relaxed);
                trace!("Buffer queue full, waiting for the writer");
                sender.send(buffer).map_err(|_| writer_gone())?;
            }
            Err(TrySendError::Disconnected(_)) => return Err(writer_gone()),
        }

        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_enqueued.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    /// Stop accepting buffers; the writer exits once it has drained the rest
    pub fn close(&mut self) {
        self.sender.take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_none()
    }

    /// Buffers currently waiting for the writer
    pub fn len(&self) -> usize {
        self.sender.as_ref().map_or(0, Sender::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            bytes_enqueued: self.counters.bytes_enqueued.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
            bytes_written: self.counters.bytes_written.load(Ordering::Relaxed),
            blocked: self.counters.blocked.load(Ordering::Relaxed),
            current_size: self.len(),
            capacity: self.capacity,
        }
    }

    pub(crate) fn counters(&self) -> Arc<QueueCounters> {
        Arc::clone(&self.counters)
    }
}

fn writer_gone() -> DiscoveryError {
    DiscoveryError::TransportFailed("socket writer is no longer accepting data".to_string())
}

/// Queue statistics
#[derive(Debug, Clone)]
pub struct QueueStats {
    /// Buffers accepted from the producer
    pub enqueued: u64,

    pub bytes_enqueued: u64,

    /// Buffers fully written to the socket
    pub written: u64,

    pub bytes_written: u64,

    /// Times the producer had to wait for room
    pub blocked: u64,

    pub current_size: usize,

    pub capacity: usize,
}

impl QueueStats {
    pub fn fill_percentage(&self) -> f64 {
        (self.current_size as f64 / self.capacity as f64) * 100.0
    }

    /// Buffers accepted but not yet fully written
    pub fn in_flight(&self) -> u64 {
        self.enqueued.saturating_sub(self.written)
    }
}
