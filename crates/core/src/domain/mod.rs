//! Domain entities and business rules

pub mod audio;
pub mod buffer;
pub mod command;
pub mod config;
pub mod control;
pub mod mixer;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod queue;
pub mod registry;

pub use audio::{
    AudioEnumerator, AudioError, CallbackResult, DeviceId, DeviceInfo, OutputBackend,
    OutputStream, RenderCallback, Result, SampleFormat, StreamParams, StreamStatus,
};
pub use buffer::AudioBuffer;
pub use command::{Command, CommandChannel};
pub use config::{ConfigError, MixerConfig};
pub use mixer::{MixerUnit, Role, UnitId, MAX_GAIN, MIN_GAIN};
pub use queue::SourceQueue;
pub use registry::{DeviceRegistry, RateObserver};
