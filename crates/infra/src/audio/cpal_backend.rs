//! CPAL-based device enumeration and output backend
//!
//! Devices are identified by their CPAL name. Streams are opened through
//! [`CpalStream`], which keeps the non-`Send` CPAL stream on its own thread.

use cpal::traits::{DeviceTrait, HostTrait};
use mixdown_core::domain::audio::{
    AudioEnumerator, AudioError, DeviceId, DeviceInfo, OutputBackend, OutputStream,
    RenderCallback, Result, SampleFormat, StreamParams,
};
use std::fmt;
use tracing::{debug, info, warn};

use super::stream::CpalStream;

/// Rates checked against the ranges a device advertises
const STANDARD_RATES: [u32; 11] = [
    8000, 11025, 16000, 22050, 32000, 44100, 48000, 88200, 96000, 176400, 192000,
];

/// Output backend over the default CPAL host
pub struct CpalBackend {
    host_id: cpal::HostId,
}

impl Default for CpalBackend {
    fn default() -> Self {
        info!("Initializing CPAL backend");
        Self::new()
    }
}

impl CpalBackend {
    pub fn new() -> Self {
        let host_id = cpal::default_host().id();
        debug!("Using audio host: {:?}", host_id);
        Self { host_id }
    }

    pub(crate) fn host(&self) -> Result<cpal::Host> {
        cpal::host_from_id(self.host_id).map_err(|e| AudioError::OsError(e.to_string()))
    }

    /// Describe every device at info level: default flag, channel counts,
    /// native formats and sample rates
    pub fn log_devices(&self) -> Result<Vec<DeviceInfo>> {
        let devices = self.devices()?;
        for (index, device) in devices.iter().enumerate() {
            info!(
                "Audio device #{} {} (default output: {}, input channels: {}, output channels: {})",
                index,
                device.name,
                if device.is_default_output { "yes" } else { "no" },
                device.max_input_channels,
                device.max_output_channels,
            );
            for format in &device.formats {
                info!("    native format: {}", format.describe());
            }
            let rates: Vec<String> =
                device.sample_rates.iter().map(|r| format!("{}hz", r)).collect();
            info!("    sample rates: {}", rates.join(", "));
        }
        Ok(devices)
    }
}

impl fmt::Debug for CpalBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpalBackend")
            .field("host", &self.host_id)
            .finish()
    }
}

#[allow(deprecated)]
pub(crate) fn device_name(device: &cpal::Device) -> Option<String> {
    device.name().ok()
}

/// Find the CPAL device called `id`
pub(crate) fn find_device(host: &cpal::Host, id: &DeviceId) -> Result<cpal::Device> {
    host.devices()
        .map_err(|e| AudioError::OsError(e.to_string()))?
        .find(|d| device_name(d).as_deref() == Some(id.as_str()))
        .ok_or_else(|| AudioError::DeviceNotFound(id.to_string()))
}

fn convert_format(format: cpal::SampleFormat) -> Option<SampleFormat> {
    match format {
        cpal::SampleFormat::I8 => Some(SampleFormat::I8),
        cpal::SampleFormat::I16 => Some(SampleFormat::I16),
        cpal::SampleFormat::I32 => Some(SampleFormat::I32),
        cpal::SampleFormat::F32 => Some(SampleFormat::F32),
        cpal::SampleFormat::F64 => Some(SampleFormat::F64),
        _ => None,
    }
}

fn describe_device(device: &cpal::Device, default_name: Option<&str>) -> Option<DeviceInfo> {
    let name = device_name(device).unwrap_or_else(|| "Unknown Device".to_string());

    let mut max_input_channels = 0;
    if let Ok(configs) = device.supported_input_configs() {
        for config in configs {
            max_input_channels = max_input_channels.max(config.channels());
        }
    }

    let mut max_output_channels = 0;
    let mut sample_rates = Vec::new();
    let mut formats = Vec::new();
    if let Ok(configs) = device.supported_output_configs() {
        for config in configs {
            max_output_channels = max_output_channels.max(config.channels());
            let (min, max) = (config.min_sample_rate(), config.max_sample_rate());
            sample_rates.extend(STANDARD_RATES.iter().copied().filter(|r| (min..=max).contains(r)));
            sample_rates.push(min);
            sample_rates.push(max);
            if let Some(format) = convert_format(config.sample_format()) {
                formats.push(format);
            }
        }
    }

    if max_input_channels == 0 && max_output_channels == 0 {
        debug!(device = %name, "Skipping device without inputs or outputs");
        return None;
    }

    sample_rates.sort_unstable();
    sample_rates.dedup();
    formats.sort_by_key(|f| *f as u8);
    formats.dedup();

    let preferred_sample_rate = device
        .default_output_config()
        .ok()
        .map(|config| config.sample_rate());

    Some(DeviceInfo {
        id: DeviceId::new(name.clone()),
        is_default_output: default_name == Some(name.as_str()),
        name,
        max_input_channels,
        max_output_channels,
        sample_rates,
        formats,
        preferred_sample_rate,
    })
}

/// Check that `device` can play interleaved stereo f32 at `rate`
fn supports_params(device: &cpal::Device, params: &StreamParams) -> Result<()> {
    let configs = device
        .supported_output_configs()
        .map_err(|e| AudioError::UnsupportedConfiguration(e.to_string()))?;
    let supported = configs.into_iter().any(|config| {
        config.channels() == params.channels
            && config.sample_format() == cpal::SampleFormat::F32
            && (config.min_sample_rate()..=config.max_sample_rate()).contains(&params.sample_rate)
    });
    if supported {
        Ok(())
    } else {
        Err(AudioError::UnsupportedConfiguration(format!(
            "{} channels of f32 at {}hz",
            params.channels, params.sample_rate
        )))
    }
}

impl AudioEnumerator for CpalBackend {
    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        info!("Enumerating all audio devices");
        let host = self.host()?;
        let default_name = host.default_output_device().as_ref().and_then(device_name);

        let devices: Vec<DeviceInfo> = host
            .devices()
            .map_err(|e| AudioError::OsError(e.to_string()))?
            .filter_map(|device| describe_device(&device, default_name.as_deref()))
            .inspect(|info| debug!("Found device: {}", info.name))
            .collect();

        info!("Found {} audio devices", devices.len());
        Ok(devices)
    }

    fn default_output_device(&self) -> Result<DeviceInfo> {
        let host = self.host()?;
        let device = host
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string()))?;
        let name = device_name(&device);

        describe_device(&device, name.as_deref()).ok_or_else(|| {
            AudioError::UnsupportedConfiguration("Device has no outputs".to_string())
        })
    }
}

impl OutputBackend for CpalBackend {
    fn open_stream(
        &self,
        device: &DeviceId,
        params: &StreamParams,
        callback: RenderCallback,
    ) -> Result<Box<dyn OutputStream>> {
        {
            let host = self.host()?;
            let cpal_device = find_device(&host, device)?;
            if let Err(e) = supports_params(&cpal_device, params) {
                warn!(%device, error = %e, "Device does not advertise the requested configuration");
                return Err(e);
            }
        }

        let stream = CpalStream::open(self.host_id, device.clone(), params.clone(), callback)?;
        Ok(Box::new(stream))
    }
}
