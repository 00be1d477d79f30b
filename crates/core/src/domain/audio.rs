//! Audio device abstractions and domain models
//!
//! This module defines the platform-agnostic seam between the mixing engine
//! and the audio hardware: device descriptors, the enumeration trait, and the
//! output stream primitives (open/start/stop/close) the device owners drive.
//! The cpal implementation lives in the `infra` crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors that can occur in the audio subsystem
#[derive(Debug, Error)]
pub enum AudioError {
    /// Requested audio device was not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device could not be opened or configured for output
    #[error("Failed to open device {device}: {reason}")]
    HardwareOpen { device: String, reason: String },

    /// Error while starting, stopping or running a stream
    #[error("Stream error: {0}")]
    StreamError(String),

    /// Invalid configuration for audio device
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Input/Output error at the OS level
    #[error("OS error: {0}")]
    OsError(String),

    /// Device does not support the requested configuration
    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// A bounded source queue had no room left
    #[error("Source queue is full")]
    QueueFull,

    /// The unit was terminated and refuses further work
    #[error("Unit {0} is terminated")]
    Terminated(u64),

    /// The control loop thread could not be started
    #[error("Failed to spawn control loop: {0}")]
    ThreadSpawn(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AudioError>;

/// Unique identifier for an audio device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Native sample formats a device can accept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleFormat {
    I8,
    I16,
    I24,
    I32,
    F32,
    F64,
}

impl SampleFormat {
    /// Human readable description, as shown in device listings
    pub fn describe(&self) -> &'static str {
        match self {
            SampleFormat::I8 => "8-bit signed integer",
            SampleFormat::I16 => "16-bit signed integer",
            SampleFormat::I24 => "24-bit signed integer",
            SampleFormat::I32 => "32-bit signed integer",
            SampleFormat::F32 => "32-bit float normalized between plus/minus 1.0",
            SampleFormat::F64 => "64-bit float normalized between plus/minus 1.0",
        }
    }
}

/// Capabilities of a physical audio device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    pub max_input_channels: u16,
    pub max_output_channels: u16,
    pub sample_rates: Vec<u32>,
    pub formats: Vec<SampleFormat>,
    pub is_default_output: bool,
    pub preferred_sample_rate: Option<u32>,
}

impl DeviceInfo {
    pub fn supports_rate(&self, rate: u32) -> bool {
        self.sample_rates.contains(&rate)
    }

    pub fn is_output(&self) -> bool {
        self.max_output_channels > 0
    }
}

/// Trait for enumerating available audio devices
pub trait AudioEnumerator: Send + Sync {
    /// List all available audio devices
    fn devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Get all devices able to play audio
    fn output_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.devices()?.into_iter().filter(DeviceInfo::is_output).collect())
    }

    /// Get the default output device
    fn default_output_device(&self) -> Result<DeviceInfo>;

    /// Find a device by its ID
    fn device_by_id(&self, id: &DeviceId) -> Result<DeviceInfo> {
        self.devices()?
            .into_iter()
            .find(|d| d.id == *id)
            .ok_or_else(|| AudioError::DeviceNotFound(id.to_string()))
    }
}

/// Parameters of an output stream; output is always interleaved stereo f32
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParams {
    pub sample_rate: u32,
    pub channels: u16,
    pub buffer_frames: u32,
    pub name: String,
}

impl StreamParams {
    pub fn stereo(sample_rate: u32, buffer_frames: u32, name: impl Into<String>) -> Self {
        Self {
            sample_rate,
            channels: 2,
            buffer_frames,
            name: name.into(),
        }
    }
}

/// Status flags handed to the render callback for one period
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStatus {
    /// The hardware missed a period before this one
    pub underflow: bool,
}

/// What the render callback asks of the engine after one period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackResult {
    Continue,
    /// The engine may stop calling back
    Stop,
}

impl CallbackResult {
    /// Numeric status code, 0 meaning continue
    pub fn code(self) -> i32 {
        match self {
            CallbackResult::Continue => 0,
            CallbackResult::Stop => 1,
        }
    }
}

/// Real-time render callback: fills an interleaved stereo buffer
pub type RenderCallback = Box<dyn FnMut(&mut [f32], StreamStatus) -> CallbackResult + Send>;

/// An open hardware output stream. Dropping it closes the stream.
pub trait OutputStream: Send {
    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    fn is_running(&self) -> bool;
}

/// Hardware subsystem able to open output streams on devices
pub trait OutputBackend: AudioEnumerator {
    /// Open (but do not start) an output stream driving `callback`
    fn open_stream(
        &self,
        device: &DeviceId,
        params: &StreamParams,
        callback: RenderCallback,
    ) -> Result<Box<dyn OutputStream>>;
}
