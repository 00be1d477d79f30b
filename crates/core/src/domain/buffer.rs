//! Immutable units of produced audio

use std::sync::Arc;

/// A block of interleaved samples handed from a producer to a source queue.
///
/// Samples are shared, so cloning is cheap and the buffer never changes once
/// built. A buffer with zero channels or no samples is valid to enqueue but
/// is skipped by the mixer.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    samples: Arc<[f32]>,
    sample_rate: u32,
    channels: u16,
    peak: f32,
}

impl AudioBuffer {
    /// Build a buffer, measuring its peak amplitude from the samples
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        let peak = samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
        Self::with_peak(samples, sample_rate, channels, peak)
    }

    /// Build a buffer with a peak the producer already measured
    pub fn with_peak(samples: Vec<f32>, sample_rate: u32, channels: u16, peak: f32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            channels,
            peak: if peak.is_finite() { peak.max(0.0) } else { 0.0 },
        }
    }

    /// Interleaved samples
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn peak(&self) -> f32 {
        self.peak
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of whole frames held (0 for an invalid buffer)
    pub fn frames(&self) -> usize {
        match self.channels {
            0 => 0,
            n => self.samples.len() / n as usize,
        }
    }

    /// Whether the mixer can play anything from this buffer
    pub fn is_playable(&self) -> bool {
        self.channels > 0 && !self.samples.is_empty()
    }
}
