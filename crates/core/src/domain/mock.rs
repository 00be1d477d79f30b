//! In-memory output backend for testing without hardware.
//!
//! Streams opened on a [`MockBackend`] never run on their own: tests drive
//! them one period at a time through a [`MockStreamHandle`], which makes the
//! render callback fully deterministic.
//!
//! Compiled for this crate's own tests and, for other crates, behind the
//! `test-util` feature.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use mixdown_core::domain::mock::MockBackend;
//! use mixdown_core::{AudioBuffer, DeviceId, DeviceRegistry, MixerConfig};
//!
//! let backend = Arc::new(MockBackend::new());
//! let registry = DeviceRegistry::new(backend.clone(), MixerConfig::default());
//! let device = DeviceId::new("mock:0");
//!
//! let source = registry.new_source("tone");
//! source.attach_to_device(&registry, &device).unwrap();
//! source.push(AudioBuffer::new(vec![0.25; 1024], 48000, 1));
//!
//! let out = backend.latest_stream(&device).unwrap().render(false).unwrap();
//! assert_eq!(out[0], 0.25);
//! registry.teardown();
//! ```

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::audio::{
    AudioEnumerator, AudioError, CallbackResult, DeviceId, DeviceInfo, OutputBackend,
    OutputStream, RenderCallback, Result, SampleFormat, StreamParams, StreamStatus,
};

struct MockStreamState {
    device: DeviceId,
    params: StreamParams,
    callback: Mutex<Option<RenderCallback>>,
    running: AtomicBool,
    closed: AtomicBool,
    stopped_by_callback: AtomicBool,
}

/// Test-side view of a stream opened on the mock backend
#[derive(Clone)]
pub struct MockStreamHandle(Arc<MockStreamState>);

impl MockStreamHandle {
    pub fn device(&self) -> &DeviceId {
        &self.0.device
    }

    pub fn params(&self) -> &StreamParams {
        &self.0.params
    }

    pub fn is_running(&self) -> bool {
        self.0.running.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::SeqCst)
    }

    /// Whether the callback asked to stop being called
    pub fn stop_requested(&self) -> bool {
        self.0.stopped_by_callback.load(Ordering::SeqCst)
    }

    /// Run one period of `buffer_frames` frames
    pub fn render(&self, underflow: bool) -> Option<Vec<f32>> {
        self.render_frames(self.0.params.buffer_frames as usize, underflow)
    }

    /// Run one period of `frames` frames.
    ///
    /// Returns `None` when no callback happens: the stream is closed, not
    /// started, or its callback already asked to stop.
    pub fn render_frames(&self, frames: usize, underflow: bool) -> Option<Vec<f32>> {
        if !self.is_running() || self.stop_requested() {
            return None;
        }
        let mut callback = self.0.callback.lock();
        let callback = callback.as_mut()?;

        let mut out = vec![0.0; frames * self.0.params.channels as usize];
        if callback(&mut out, StreamStatus { underflow }) == CallbackResult::Stop {
            self.0.stopped_by_callback.store(true, Ordering::SeqCst);
        }
        Some(out)
    }
}

struct MockStream(Arc<MockStreamState>);

impl OutputStream for MockStream {
    fn start(&mut self) -> Result<()> {
        if self.0.closed.load(Ordering::SeqCst) {
            return Err(AudioError::StreamError("stream is closed".to_string()));
        }
        self.0.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.0.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.0.running.load(Ordering::SeqCst)
    }
}

impl Drop for MockStream {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::SeqCst);
        self.0.closed.store(true, Ordering::SeqCst);
        // Waits for an in-progress render, like a real close does.
        self.0.callback.lock().take();
    }
}

/// Output backend whose devices and streams exist only in memory
pub struct MockBackend {
    devices: Vec<DeviceInfo>,
    failing: Mutex<HashSet<DeviceId>>,
    streams: Mutex<Vec<MockStreamHandle>>,
}

impl MockBackend {
    /// Two stereo devices, `mock:0` (default) and `mock:1`
    pub fn new() -> Self {
        Self::with_devices(vec![
            Self::device_info("mock:0", true),
            Self::device_info("mock:1", false),
        ])
    }

    pub fn with_devices(devices: Vec<DeviceInfo>) -> Self {
        Self {
            devices,
            failing: Mutex::new(HashSet::new()),
            streams: Mutex::new(Vec::new()),
        }
    }

    pub fn device_info(id: &str, is_default_output: bool) -> DeviceInfo {
        DeviceInfo {
            id: DeviceId::new(id),
            name: format!("Mock Output {}", id),
            max_input_channels: 0,
            max_output_channels: 2,
            sample_rates: vec![44100, 48000, 96000],
            formats: vec![SampleFormat::F32, SampleFormat::I16],
            is_default_output,
            preferred_sample_rate: Some(48000),
        }
    }

    /// Make every following open of `device` fail
    pub fn fail_open(&self, device: &DeviceId) {
        self.failing.lock().insert(device.clone());
    }

    pub fn allow_open(&self, device: &DeviceId) {
        self.failing.lock().remove(device);
    }

    /// Every stream ever opened, oldest first
    pub fn streams(&self) -> Vec<MockStreamHandle> {
        self.streams.lock().clone()
    }

    pub fn latest_stream(&self, device: &DeviceId) -> Option<MockStreamHandle> {
        self.streams
            .lock()
            .iter()
            .rev()
            .find(|s| s.device() == device)
            .cloned()
    }

    pub fn open_count(&self, device: &DeviceId) -> usize {
        self.streams.lock().iter().filter(|s| s.device() == device).count()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioEnumerator for MockBackend {
    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.devices.clone())
    }

    fn default_output_device(&self) -> Result<DeviceInfo> {
        self.devices
            .iter()
            .find(|d| d.is_default_output)
            .or_else(|| self.devices.first())
            .cloned()
            .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string()))
    }
}

impl OutputBackend for MockBackend {
    fn open_stream(
        &self,
        device: &DeviceId,
        params: &StreamParams,
        callback: RenderCallback,
    ) -> Result<Box<dyn OutputStream>> {
        if !self.devices.iter().any(|d| d.id == *device) {
            return Err(AudioError::DeviceNotFound(device.to_string()));
        }
        if self.failing.lock().contains(device) {
            return Err(AudioError::HardwareOpen {
                device: device.to_string(),
                reason: "mock device refused to open".to_string(),
            });
        }

        let state = Arc::new(MockStreamState {
            device: device.clone(),
            params: params.clone(),
            callback: Mutex::new(Some(callback)),
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stopped_by_callback: AtomicBool::new(false),
        });
        self.streams.lock().push(MockStreamHandle(Arc::clone(&state)));
        Ok(Box::new(MockStream(state)))
    }
}
