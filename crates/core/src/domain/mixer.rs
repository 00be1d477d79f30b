//! Mixer units: logical sources and the device owners that mix them
//!
//! Every logical source is a [`MixerUnit`] with its own queue. The first time
//! a physical device is used, the registry creates a dedicated owner unit for
//! it; the owner holds the hardware stream and mixes all of its bound sources
//! from the render callback. Owner and source are roles of the same type.
//!
//! Lock order is always owner, then bound source. A unit never locks its
//! owner while holding its own lock, and hardware open/stop/close always run
//! with no unit lock held.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

use super::audio::{
    AudioError, CallbackResult, DeviceId, OutputStream, RenderCallback, Result, StreamStatus,
};
use super::buffer::AudioBuffer;
use super::command::{Command, CommandChannel};
use super::queue::SourceQueue;
use super::registry::DeviceRegistry;

pub const MIN_GAIN: f32 = 0.0;
pub const MAX_GAIN: f32 = 2.0;

static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a mixer unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(u64);

impl UnitId {
    fn next() -> Self {
        Self(NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit-{}", self.0)
    }
}

/// What a unit currently does with respect to a physical device
#[derive(Debug, Clone, Default)]
pub enum Role {
    #[default]
    Unbound,
    /// Mixed by the owner of `device`
    Source {
        device: DeviceId,
        owner: Weak<MixerUnit>,
    },
    /// Holds the hardware stream of `device`
    Owner { device: DeviceId },
}

impl Role {
    pub fn device(&self) -> Option<&DeviceId> {
        match self {
            Role::Unbound => None,
            Role::Source { device, .. } | Role::Owner { device } => Some(device),
        }
    }

    pub fn is_owner(&self) -> bool {
        matches!(self, Role::Owner { .. })
    }
}

/// In-flight buffer of a source.
///
/// `Playing` always holds a playable buffer whose cursor is inside it; an
/// exhausted buffer goes straight back to `Idle`.
#[derive(Debug, Default)]
enum Playhead {
    #[default]
    Idle,
    Playing { buffer: AudioBuffer, cursor: usize },
}

impl Playhead {
    /// Make sure a playable buffer at `rate` is loaded.
    ///
    /// A loaded buffer of another rate is dropped, then buffers are popped
    /// until one matches; mismatched and invalid ones are discarded.
    fn load(&mut self, queue: &SourceQueue, rate: u32) -> bool {
        if let Playhead::Playing { buffer, .. } = &*self {
            if buffer.sample_rate() == rate {
                return true;
            }
        }
        *self = Playhead::Idle;
        while let Some(buffer) = queue.try_pop() {
            if buffer.sample_rate() == rate && buffer.is_playable() {
                *self = Playhead::Playing { buffer, cursor: 0 };
                return true;
            }
        }
        false
    }

    /// Add this source's audio into `out`, continuing across queued buffers.
    ///
    /// Returns the largest `peak * gain` among the buffers that contributed.
    fn mix(&mut self, queue: &SourceQueue, rate: u32, gain: f32, out: &mut [f32]) -> f32 {
        let mut peak = 0.0f32;
        let mut pos = 0;

        while pos < out.len() {
            let Playhead::Playing { buffer, cursor } = &mut *self else {
                break;
            };
            peak = peak.max(buffer.peak() * gain);

            let samples = buffer.samples();
            if buffer.channels() == 1 {
                while pos < out.len() && *cursor < samples.len() {
                    let v = samples[*cursor] * gain;
                    out[pos] += v;
                    if pos + 1 < out.len() {
                        out[pos + 1] += v;
                    }
                    pos += 2;
                    *cursor += 1;
                }
            } else {
                let n = (out.len() - pos).min(samples.len() - *cursor);
                for (o, s) in out[pos..pos + n].iter_mut().zip(&samples[*cursor..*cursor + n]) {
                    *o += s * gain;
                }
                pos += n;
                *cursor += n;
            }

            if *cursor >= samples.len() {
                *self = Playhead::Idle;
                if !self.load(queue, rate) {
                    break;
                }
            }
        }

        peak
    }
}

struct UnitState {
    role: Role,
    active: bool,
    gain: f32,
    sample_rate: u32,
    playhead: Playhead,
    bound: Vec<Weak<MixerUnit>>,
    stream: Option<Box<dyn OutputStream>>,
}

/// A logical audio source, or the owner of a physical output device
pub struct MixerUnit {
    id: UnitId,
    name: String,
    queue: SourceQueue,
    commands: Option<CommandChannel>,
    terminated: AtomicBool,
    underflows: AtomicU64,
    state: Mutex<UnitState>,
}

impl MixerUnit {
    /// Create an unbound logical source
    pub fn new(name: impl Into<String>, queue_capacity: usize) -> Arc<Self> {
        Arc::new(Self::with_role(name.into(), queue_capacity, Role::Unbound, 0, false))
    }

    /// Create the owner unit of `device`; only the registry does this
    pub(crate) fn new_owner(device: DeviceId, sample_rate: u32) -> Arc<Self> {
        let name = format!("owner:{}", device);
        Arc::new(Self::with_role(name, 1, Role::Owner { device }, sample_rate, true))
    }

    fn with_role(
        name: String,
        queue_capacity: usize,
        role: Role,
        rate: u32,
        active: bool,
    ) -> Self {
        Self {
            id: UnitId::next(),
            name,
            queue: SourceQueue::with_capacity(queue_capacity),
            commands: role.is_owner().then(CommandChannel::new),
            terminated: AtomicBool::new(false),
            underflows: AtomicU64::new(0),
            state: Mutex::new(UnitState {
                role,
                active,
                gain: 1.0,
                sample_rate: rate,
                playhead: Playhead::Idle,
                bound: Vec::new(),
                stream: None,
            }),
        }
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue producers push this source's audio into
    pub fn queue(&self) -> &SourceQueue {
        &self.queue
    }

    /// Enqueue a buffer, blocking while the queue is full
    pub fn push(&self, buffer: AudioBuffer) {
        self.queue.push(buffer);
    }

    /// Command channel read by a device owner's control loop; sources have none
    pub fn commands(&self) -> Option<&CommandChannel> {
        self.commands.as_ref()
    }

    /// Deliver a command to this unit's control loop.
    ///
    /// Only device owners run a control loop. A source has nothing that would
    /// ever read the command, so it is refused; call `attach_to_device` or
    /// `change_sample_rate` on the source instead.
    pub fn send(&self, command: Command) -> Result<()> {
        match &self.commands {
            Some(commands) => {
                commands.push(command);
                Ok(())
            }
            None => Err(AudioError::InvalidConfiguration(format!(
                "{} has no control loop to receive {:?}",
                self.id, command
            ))),
        }
    }

    pub fn role(&self) -> Role {
        self.state.lock().role.clone()
    }

    pub fn device(&self) -> Option<DeviceId> {
        self.state.lock().role.device().cloned()
    }

    pub fn is_owner(&self) -> bool {
        self.state.lock().role.is_owner()
    }

    pub fn sample_rate(&self) -> u32 {
        self.state.lock().sample_rate
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub fn underflow_count(&self) -> u64 {
        self.underflows.load(Ordering::Relaxed)
    }

    pub fn has_stream(&self) -> bool {
        self.state.lock().stream.is_some()
    }

    pub fn is_streaming(&self) -> bool {
        self.state
            .lock()
            .stream
            .as_ref()
            .map_or(false, |s| s.is_running())
    }

    pub fn gain(&self) -> f32 {
        self.state.lock().gain
    }

    /// Set the mixing gain, clamped to `[MIN_GAIN, MAX_GAIN]`
    pub fn set_gain(&self, gain: f32) {
        let gain = if gain.is_nan() {
            MIN_GAIN
        } else {
            gain.clamp(MIN_GAIN, MAX_GAIN)
        };
        self.state.lock().gain = gain;
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Turn participation in mixing on or off. Pending input is discarded.
    ///
    /// The unit stays bound to its owner either way: an inactive source is
    /// still listed by the owner's `bound_sources` and is skipped while
    /// rendering. Use `attach_to_device` and `unbind` to change bindings.
    pub fn set_active(&self, active: bool) {
        let mut state = self.state.lock();
        let dropped = self.queue.flush();
        state.playhead = Playhead::Idle;
        state.active = active;
        debug!(unit = %self.id, active, dropped, "Activity changed");
    }

    /// Drop all pending buffers and the in-flight one
    pub fn flush(&self) -> usize {
        let mut state = self.state.lock();
        state.playhead = Playhead::Idle;
        self.queue.flush()
    }

    /// Bound sources that are still alive, in registration order
    pub fn bound_sources(&self) -> Vec<Arc<MixerUnit>> {
        self.state.lock().bound.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn bound_count(&self) -> usize {
        self.state.lock().bound.iter().filter(|w| w.strong_count() > 0).count()
    }

    /// Register `other` to be mixed by this unit. Returns false if it was
    /// already bound or is this unit.
    pub fn bind(&self, other: &Arc<MixerUnit>) -> bool {
        if std::ptr::eq(self, Arc::as_ptr(other)) {
            warn!(unit = %self.id, "Refusing to bind a unit to itself");
            return false;
        }
        debug_assert!(!other.is_owner(), "device owners are never bound sources");

        let mut state = self.state.lock();
        state.bound.retain(|w| w.strong_count() > 0);
        if state.bound.iter().any(|w| w.as_ptr() == Arc::as_ptr(other)) {
            return false;
        }
        state.bound.push(Arc::downgrade(other));
        debug!(owner = %self.id, source = %other.id, "Bound source");
        true
    }

    /// Stop mixing `other`. Returns false if it was not bound.
    pub fn unbind(&self, other: &MixerUnit) -> bool {
        let mut state = self.state.lock();
        let before = state.bound.len();
        state
            .bound
            .retain(|w| w.strong_count() > 0 && !std::ptr::eq(w.as_ptr(), other));
        let removed = state.bound.len() < before;
        if removed {
            debug!(owner = %self.id, source = %other.id, "Unbound source");
        }
        removed
    }

    /// Route this unit's output to `device`.
    ///
    /// The first unit to use a device makes the registry create its owner and
    /// open the hardware; later units just bind to that owner. On failure the
    /// previous binding is left untouched.
    pub fn attach_to_device(
        self: &Arc<Self>,
        registry: &DeviceRegistry,
        device: &DeviceId,
    ) -> Result<()> {
        if self.is_terminated() {
            return Err(AudioError::Terminated(self.id.get()));
        }

        if let Role::Owner { device: own } = self.role() {
            if own != *device {
                return Err(AudioError::InvalidConfiguration(format!(
                    "owner of {} cannot move to {}",
                    own, device
                )));
            }
            let rate = registry.sample_rate_or_default(device);
            self.start_stream(registry, device, rate)?;
            let mut state = self.state.lock();
            state.sample_rate = rate;
            state.active = true;
            return Ok(());
        }

        let rate = registry.sample_rate_or_default(device);
        let owner = registry.owner_or_create(device, rate)?;

        let previous = match &self.state.lock().role {
            Role::Source { owner, .. } => owner.upgrade(),
            _ => None,
        };
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, &owner) {
                previous.unbind(self);
            }
        }

        {
            let mut state = self.state.lock();
            state.role = Role::Source {
                device: device.clone(),
                owner: Arc::downgrade(&owner),
            };
            state.sample_rate = rate;
            state.active = true;
        }
        owner.bind(self);

        info!(unit = %self.id, name = %self.name, %device, rate, "Attached to device");
        Ok(())
    }

    /// Point this source at a replacement owner, if it followed `previous`
    pub(crate) fn retarget(&self, previous: &MixerUnit, owner: &Arc<MixerUnit>) -> bool {
        let mut state = self.state.lock();
        match &mut state.role {
            Role::Source { owner: current, .. } if std::ptr::eq(current.as_ptr(), previous) => {
                *current = Arc::downgrade(owner);
                true
            }
            _ => false,
        }
    }

    /// Change the sample rate this unit runs at.
    ///
    /// For the owner of a device this reconfigures the hardware: the stream
    /// is closed, every bound source adopts the rate, the registry records it,
    /// observers are told, and the stream is reopened. Any other unit only
    /// records the rate.
    pub fn change_sample_rate(&self, registry: &DeviceRegistry, rate: u32) -> Result<()> {
        if rate == 0 {
            return Err(AudioError::InvalidConfiguration(
                "sample rate must be positive".to_string(),
            ));
        }

        let device = match self.role() {
            Role::Owner { device } if registry.is_owner(&device, self) => device,
            _ => {
                self.adopt_sample_rate(rate);
                return Ok(());
            }
        };
        if self.is_terminated() {
            return Err(AudioError::Terminated(self.id.get()));
        }

        info!(%device, rate, "Changing device sample rate");
        self.stop_stream();

        {
            let mut state = self.state.lock();
            state.sample_rate = rate;
            for source in state.bound.iter().filter_map(Weak::upgrade) {
                source.adopt_sample_rate(rate);
            }
        }

        registry.record_sample_rate(&device, rate);
        registry.notify_rate_change(&device, rate);

        let owner = registry
            .owner(&device)
            .ok_or_else(|| AudioError::DeviceNotFound(device.to_string()))?;
        owner.start_stream(registry, &device, rate)
    }

    fn adopt_sample_rate(&self, rate: u32) {
        let mut state = self.state.lock();
        state.sample_rate = rate;
        if let Playhead::Playing { buffer, .. } = &state.playhead {
            if buffer.sample_rate() != rate {
                state.playhead = Playhead::Idle;
            }
        }
    }

    /// Request termination.
    ///
    /// Owners are unwound by their control loop at its next heartbeat; a
    /// source has no loop of its own and unwinds immediately.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(unit = %self.id, "Termination requested");
        if !self.is_owner() {
            self.unwind();
        }
    }

    /// Release everything a terminated unit holds
    pub(crate) fn unwind(&self) {
        let (role, stream, dropped) = {
            let mut state = self.state.lock();
            let dropped = self.queue.flush();
            state.playhead = Playhead::Idle;
            state.active = false;
            let role = match state.role {
                Role::Owner { .. } => state.role.clone(),
                _ => std::mem::take(&mut state.role),
            };
            (role, state.stream.take(), dropped)
        };

        match role {
            Role::Owner { device } => {
                close_stream(stream);
                info!(%device, unit = %self.id, dropped, "Device owner released");
            }
            Role::Source { device, owner } => {
                if let Some(owner) = owner.upgrade() {
                    owner.unbind(self);
                }
                debug!(%device, unit = %self.id, dropped, "Source detached");
            }
            Role::Unbound => {}
        }
    }

    /// Open and start this unit's hardware stream at `rate`, replacing any
    /// stream it already had
    pub(crate) fn start_stream(
        self: &Arc<Self>,
        registry: &DeviceRegistry,
        device: &DeviceId,
        rate: u32,
    ) -> Result<()> {
        if self.is_terminated() {
            return Err(AudioError::Terminated(self.id.get()));
        }
        self.stop_stream();

        let unit = Arc::downgrade(self);
        let callback: RenderCallback = Box::new(move |out, status| match unit.upgrade() {
            Some(unit) => unit.render(out, status),
            None => {
                out.fill(0.0);
                CallbackResult::Stop
            }
        });

        let params = registry.stream_params(rate);
        let mut stream = registry
            .backend()
            .open_stream(device, &params, callback)
            .map_err(|e| hardware_open(device, e))?;
        stream.start().map_err(|e| hardware_open(device, e))?;

        info!(%device, rate, frames = params.buffer_frames, "Output stream started");
        self.state.lock().stream = Some(stream);
        Ok(())
    }

    fn stop_stream(&self) {
        let stream = self.state.lock().stream.take();
        close_stream(stream);
    }

    /// Real-time render callback of a device owner.
    ///
    /// Fills `out` (interleaved stereo) with the mix of all bound sources and
    /// scales it down when the summed source peaks exceed unity. Never
    /// allocates, never waits on a queue.
    pub fn render(&self, out: &mut [f32], status: StreamStatus) -> CallbackResult {
        out.fill(0.0);

        if self.is_terminated() {
            return CallbackResult::Stop;
        }

        let state = self.state.lock();
        if status.underflow {
            self.underflows.fetch_add(1, Ordering::Relaxed);
        }
        if state.bound.is_empty() || out.is_empty() {
            return CallbackResult::Continue;
        }

        let mut peak = 0.0f32;
        for source in state.bound.iter().filter_map(Weak::upgrade) {
            peak += source.mix_into(out, state.sample_rate);
        }

        if peak > 1.0 {
            let inv_peak = 1.0 / peak;
            out.iter_mut().for_each(|s| *s *= inv_peak);
        }

        CallbackResult::Continue
    }

    fn mix_into(&self, out: &mut [f32], rate: u32) -> f32 {
        let mut state = self.state.lock();
        if self.is_terminated() || !state.active {
            return 0.0;
        }
        let gain = state.gain;
        if !state.playhead.load(&self.queue, rate) {
            return 0.0;
        }
        state.playhead.mix(&self.queue, rate, gain, out)
    }
}

impl fmt::Debug for MixerUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MixerUnit")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

fn close_stream(stream: Option<Box<dyn OutputStream>>) {
    if let Some(mut stream) = stream {
        if stream.is_running() {
            if let Err(e) = stream.stop() {
                error!(error = %e, "Failed to stop output stream");
            }
        }
    }
}

fn hardware_open(device: &DeviceId, err: AudioError) -> AudioError {
    match err {
        AudioError::HardwareOpen { .. } => err,
        other => AudioError::HardwareOpen {
            device: device.to_string(),
            reason: other.to_string(),
        },
    }
}
