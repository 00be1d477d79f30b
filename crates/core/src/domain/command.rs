//! Control commands delivered to a unit's control loop

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use super::audio::DeviceId;

/// Commands understood by the control loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Re-run the attach logic for a device
    SetOutputDevice(DeviceId),
    /// Run the sample-rate change protocol
    SetSampleRate(u32),
}

/// Thread-safe command queue with a heartbeat-bounded blocking pop
#[derive(Debug, Clone)]
pub struct CommandChannel {
    tx: Sender<Command>,
    rx: Receiver<Command>,
}

impl CommandChannel {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn push(&self, command: Command) {
        let _ = self.tx.send(command);
    }

    /// Wait up to `timeout` for a command. `None` is a heartbeat.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Command> {
        match self.rx.recv_timeout(timeout) {
            Ok(command) => Some(command),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_pop(&self) -> Option<Command> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for CommandChannel {
    fn default() -> Self {
        Self::new()
    }
}
