//! Hardware output stream hosted on a dedicated thread
//!
//! A CPAL stream is not `Send`, while device owners move their stream
//! between threads. [`CpalStream`] builds the CPAL stream on its own thread
//! and talks to it over channels: play and pause are requests answered by
//! that thread, and dropping the handle closes the stream.

use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use mixdown_core::domain::audio::{
    AudioError, CallbackResult, DeviceId, OutputStream, RenderCallback, Result, StreamParams,
    StreamStatus,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

use super::cpal_backend::find_device;

enum StreamRequest {
    Play(Sender<Result<()>>),
    Pause(Sender<Result<()>>),
}

/// Handle to a CPAL output stream living on its own thread
pub struct CpalStream {
    device: DeviceId,
    requests: Option<Sender<StreamRequest>>,
    thread: Option<JoinHandle<()>>,
    running: bool,
}

impl CpalStream {
    /// Build the stream on a new thread and wait until it is ready.
    /// The stream starts paused.
    pub fn open(
        host_id: cpal::HostId,
        device: DeviceId,
        params: StreamParams,
        callback: RenderCallback,
    ) -> Result<Self> {
        info!(
            "Creating output stream: device={}, rate={}, frames={}",
            device, params.sample_rate, params.buffer_frames
        );

        let (ready_tx, ready_rx) = bounded(1);
        let (requests_tx, requests_rx) = unbounded();

        let thread_device = device.clone();
        let thread = thread::Builder::new()
            .name(format!("mixdown-stream-{}", device))
            .spawn(move || {
                host_stream(host_id, thread_device, params, callback, ready_tx, requests_rx)
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                device,
                requests: Some(requests_tx),
                thread: Some(thread),
                running: false,
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioError::StreamError(format!(
                    "stream thread for {} exited before the stream was built",
                    device
                )))
            }
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    fn request(&self, make: fn(Sender<Result<()>>) -> StreamRequest) -> Result<()> {
        let requests = self
            .requests
            .as_ref()
            .ok_or_else(|| AudioError::StreamError("stream is closed".to_string()))?;
        let (reply_tx, reply_rx) = bounded(1);
        requests
            .send(make(reply_tx))
            .map_err(|_| AudioError::StreamError("stream thread is gone".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| AudioError::StreamError("stream thread did not answer".to_string()))?
    }
}

impl OutputStream for CpalStream {
    fn start(&mut self) -> Result<()> {
        self.request(StreamRequest::Play)?;
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.request(StreamRequest::Pause)?;
        self.running = false;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        // Disconnecting the request channel ends the stream thread.
        self.requests.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(device = %self.device, "Stream thread panicked");
            }
        }
        debug!(device = %self.device, "Output stream closed");
    }
}

fn host_stream(
    host_id: cpal::HostId,
    device: DeviceId,
    params: StreamParams,
    callback: RenderCallback,
    ready: Sender<Result<()>>,
    requests: Receiver<StreamRequest>,
) {
    let stream = match build_stream(host_id, &device, &params, callback) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        return;
    }

    for request in requests.iter() {
        match request {
            StreamRequest::Play(reply) => {
                let result = stream
                    .play()
                    .map_err(|e| AudioError::StreamError(format!("Failed to start stream: {}", e)));
                let _ = reply.send(result);
            }
            StreamRequest::Pause(reply) => {
                let result = stream
                    .pause()
                    .map_err(|e| AudioError::StreamError(format!("Failed to pause stream: {}", e)));
                let _ = reply.send(result);
            }
        }
    }
}

fn build_stream(
    host_id: cpal::HostId,
    device: &DeviceId,
    params: &StreamParams,
    mut callback: RenderCallback,
) -> Result<cpal::Stream> {
    let host = cpal::host_from_id(host_id).map_err(|e| AudioError::OsError(e.to_string()))?;
    let cpal_device = find_device(&host, device)?;

    let config = cpal::StreamConfig {
        channels: params.channels,
        sample_rate: params.sample_rate,
        buffer_size: cpal::BufferSize::Fixed(params.buffer_frames),
    };

    // Set from the error callback, reported with the next period.
    let underflow = Arc::new(AtomicBool::new(false));
    let flagged = Arc::clone(&underflow);
    let err_device = device.clone();
    let mut stopped = false;

    cpal_device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                if stopped {
                    data.fill(0.0);
                    return;
                }
                let status = StreamStatus {
                    underflow: underflow.swap(false, Ordering::Relaxed),
                };
                if callback(data, status) == CallbackResult::Stop {
                    stopped = true;
                }
            },
            move |err| {
                flagged.store(true, Ordering::Relaxed);
                error!(device = %err_device, "Output stream error: {}", err);
            },
            None,
        )
        .map_err(|e| AudioError::StreamError(format!("Failed to build stream: {}", e)))
}
