//! Mixdown core: multi-source mixing and output-device sharing
//!
//! Logical sources push [`AudioBuffer`]s into their queues, bind to the unit
//! that owns a physical device, and that owner mixes every bound source into a
//! single stereo stream from its hardware callback. Hardware access goes
//! through the [`OutputBackend`] trait so the whole engine runs against the
//! in-memory `domain::mock::MockBackend` in tests (enable the `test-util`
//! feature to use it from other crates).

pub mod domain;

pub use domain::{
    AudioBuffer, AudioEnumerator, AudioError, CallbackResult, Command, CommandChannel, DeviceId,
    DeviceInfo, DeviceRegistry, MixerConfig, MixerUnit, OutputBackend, OutputStream,
    RateObserver, Result, SampleFormat, SourceQueue, StreamParams, StreamStatus, UnitId,
};
