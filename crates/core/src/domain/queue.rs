//! Per-source audio queue
//!
//! Producers push from any thread; the device owner's render callback pops
//! without blocking. Which unit reads the queue is decided by the binding
//! protocol, not by the queue.

use crossbeam::channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};

use super::audio::{AudioError, Result};
use super::buffer::AudioBuffer;

/// Bounded multi-producer queue of [`AudioBuffer`]s for one logical source
#[derive(Debug, Clone)]
pub struct SourceQueue {
    tx: Sender<AudioBuffer>,
    rx: Receiver<AudioBuffer>,
}

impl SourceQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self { tx, rx }
    }

    /// Enqueue a buffer, blocking while the queue is full
    pub fn push(&self, buffer: AudioBuffer) {
        // Both ends live in `self`, so the channel cannot be disconnected.
        let _ = self.tx.send(buffer);
    }

    /// Enqueue a buffer without blocking
    pub fn try_push(&self, buffer: AudioBuffer) -> Result<()> {
        match self.tx.try_send(buffer) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                Err(AudioError::QueueFull)
            }
        }
    }

    /// Dequeue the oldest buffer, if any. Never blocks.
    pub fn try_pop(&self) -> Option<AudioBuffer> {
        match self.rx.try_recv() {
            Ok(buffer) => Some(buffer),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Discard everything pending, returning how many buffers were dropped
    pub fn flush(&self) -> usize {
        self.rx.try_iter().count()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.rx.capacity().unwrap_or(usize::MAX)
    }
}
