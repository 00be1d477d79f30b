//! Registry of physical devices in use
//!
//! Maps each device to the unit that owns its hardware stream, to the sample
//! rate last configured for it, and to the thread running the owner's control
//! loop. Entries appear the first time a device is attached and stay until
//! [`DeviceRegistry::teardown`].

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info};

use super::audio::{AudioError, DeviceId, OutputBackend, Result, StreamParams};
use super::command::Command;
use super::config::MixerConfig;
use super::control;
use super::mixer::MixerUnit;

/// Told whenever the sample rate of a device changes, so that producers
/// routed to it can adapt the format of what they enqueue.
pub trait RateObserver: Send + Sync {
    fn sample_rate_changed(&self, device: &DeviceId, rate: u32);
}

impl<F> RateObserver for F
where
    F: Fn(&DeviceId, u32) + Send + Sync,
{
    fn sample_rate_changed(&self, device: &DeviceId, rate: u32) {
        self(device, rate)
    }
}

#[derive(Default)]
struct DeviceMaps {
    owners: HashMap<DeviceId, Arc<MixerUnit>>,
    rates: HashMap<DeviceId, u32>,
    threads: HashMap<DeviceId, JoinHandle<()>>,
}

struct RegistryInner {
    backend: Arc<dyn OutputBackend>,
    config: MixerConfig,
    maps: RwLock<DeviceMaps>,
    observers: RwLock<Vec<Arc<dyn RateObserver>>>,
    // Serializes owner creation so two sources racing for a new device
    // open its hardware once.
    creation: Mutex<()>,
}

/// Shared handle to the device registry. Cloning is cheap.
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

impl DeviceRegistry {
    pub fn new(backend: Arc<dyn OutputBackend>, config: MixerConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                backend,
                config,
                maps: RwLock::new(DeviceMaps::default()),
                observers: RwLock::new(Vec::new()),
                creation: Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &MixerConfig {
        &self.inner.config
    }

    pub fn backend(&self) -> &Arc<dyn OutputBackend> {
        &self.inner.backend
    }

    /// Create an unbound logical source sized by the configuration
    pub fn new_source(&self, name: impl Into<String>) -> Arc<MixerUnit> {
        MixerUnit::new(name, self.inner.config.queue_capacity)
    }

    pub(crate) fn stream_params(&self, rate: u32) -> StreamParams {
        let config = &self.inner.config;
        StreamParams::stereo(rate, config.buffer_frames, config.stream_name.clone())
    }

    /// Unit currently owning `device`
    pub fn owner(&self, device: &DeviceId) -> Option<Arc<MixerUnit>> {
        self.inner.maps.read().owners.get(device).cloned()
    }

    pub fn is_owner(&self, device: &DeviceId, unit: &MixerUnit) -> bool {
        self.inner
            .maps
            .read()
            .owners
            .get(device)
            .map_or(false, |owner| std::ptr::eq(Arc::as_ptr(owner), unit))
    }

    /// Sample rate last configured for `device`
    pub fn sample_rate(&self, device: &DeviceId) -> Option<u32> {
        self.inner.maps.read().rates.get(device).copied()
    }

    pub(crate) fn sample_rate_or_default(&self, device: &DeviceId) -> u32 {
        if let Some(rate) = self.sample_rate(device) {
            return rate;
        }
        let default = self.inner.config.default_sample_rate;
        let rate = *self
            .inner
            .maps
            .write()
            .rates
            .entry(device.clone())
            .or_insert(default);
        debug!(%device, rate, "Device had no configured rate, using default");
        rate
    }

    pub(crate) fn record_sample_rate(&self, device: &DeviceId, rate: u32) {
        self.inner.maps.write().rates.insert(device.clone(), rate);
    }

    /// Request a new sample rate for `device`.
    ///
    /// With an owner in place the change is queued on its control loop;
    /// otherwise the rate is recorded for the first attach to use.
    pub fn set_device_sample_rate(&self, device: &DeviceId, rate: u32) -> Result<()> {
        if rate == 0 {
            return Err(AudioError::InvalidConfiguration(
                "sample rate must be positive".to_string(),
            ));
        }
        match self.owner(device).filter(|owner| !owner.is_terminated()) {
            Some(owner) => owner.send(Command::SetSampleRate(rate)),
            None => {
                self.record_sample_rate(device, rate);
                Ok(())
            }
        }
    }

    /// Devices that currently have an owner
    pub fn devices_in_use(&self) -> Vec<DeviceId> {
        let mut devices: Vec<_> = self.inner.maps.read().owners.keys().cloned().collect();
        devices.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        devices
    }

    pub fn has_control_loop(&self, device: &DeviceId) -> bool {
        self.inner.maps.read().threads.contains_key(device)
    }

    pub fn subscribe(&self, observer: Arc<dyn RateObserver>) {
        self.inner.observers.write().push(observer);
    }

    pub(crate) fn notify_rate_change(&self, device: &DeviceId, rate: u32) {
        let observers = self.inner.observers.read().clone();
        for observer in observers {
            observer.sample_rate_changed(device, rate);
        }
    }

    /// Owner of `device`, creating it (hardware stream and control loop
    /// included) when there is none or the previous one was terminated
    pub(crate) fn owner_or_create(&self, device: &DeviceId, rate: u32) -> Result<Arc<MixerUnit>> {
        if let Some(owner) = self.owner(device).filter(|o| !o.is_terminated()) {
            return Ok(owner);
        }

        let _creating = self.inner.creation.lock();
        let previous = match self.owner(device) {
            Some(owner) if !owner.is_terminated() => return Ok(owner),
            other => other,
        };

        let owner = MixerUnit::new_owner(device.clone(), rate);
        owner.start_stream(self, device, rate)?;
        let handle = control::spawn(Arc::clone(&owner), self.clone())?;

        let stale_thread = {
            let mut maps = self.inner.maps.write();
            maps.owners.insert(device.clone(), Arc::clone(&owner));
            maps.rates.insert(device.clone(), rate);
            maps.threads.insert(device.clone(), handle)
        };

        if let Some(previous) = previous {
            let moved = self.adopt_sources(&previous, &owner);
            info!(%device, moved, "Replaced terminated device owner");
        }
        if let Some(handle) = stale_thread {
            if handle.join().is_err() {
                error!(%device, "Previous control loop panicked");
            }
        }

        info!(%device, rate, owner = %owner.id(), "Created device owner");
        Ok(owner)
    }

    fn adopt_sources(&self, previous: &MixerUnit, owner: &Arc<MixerUnit>) -> usize {
        let mut moved = 0;
        for source in previous.bound_sources() {
            previous.unbind(&source);
            if source.is_terminated() || !source.retarget(previous, owner) {
                continue;
            }
            owner.bind(&source);
            moved += 1;
        }
        moved
    }

    /// Terminate every device owner and wait for their control loops.
    ///
    /// Each owner flushes and closes its hardware stream; all entries are
    /// removed.
    pub fn teardown(&self) {
        let (owners, threads) = {
            let mut maps = self.inner.maps.write();
            let owners: Vec<_> = maps.owners.drain().collect();
            let threads: Vec<_> = maps.threads.drain().collect();
            maps.rates.clear();
            (owners, threads)
        };

        info!(devices = owners.len(), "Tearing down device owners");
        for (_, owner) in &owners {
            owner.terminate();
        }
        for (device, handle) in threads {
            if handle.join().is_err() {
                error!(%device, "Control loop panicked");
            }
        }
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.devices_in_use())
            .finish()
    }
}
