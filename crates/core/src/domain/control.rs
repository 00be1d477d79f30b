//! Control loop of a device owner
//!
//! Runs on its own thread, apart from the real-time callback. It waits on the
//! owner's command channel with a heartbeat timeout, applies device and
//! sample-rate commands, and unwinds the owner once it is terminated.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use super::audio::Result;
use super::command::Command;
use super::mixer::MixerUnit;
use super::registry::DeviceRegistry;

pub(crate) fn spawn(unit: Arc<MixerUnit>, registry: DeviceRegistry) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("mixdown-{}", unit.id()))
        .spawn(move || run(&unit, &registry))
}

fn run(unit: &Arc<MixerUnit>, registry: &DeviceRegistry) {
    let Some(commands) = unit.commands() else {
        error!(unit = %unit.id(), "Only device owners run a control loop");
        return;
    };
    let heartbeat = registry.config().heartbeat();
    let mut reported_underflows = 0;
    debug!(unit = %unit.id(), name = unit.name(), "Control loop started");

    while !unit.is_terminated() {
        let command = commands.pop_timeout(heartbeat);
        reported_underflows = report_underflows(unit, reported_underflows);

        let Some(command) = command else {
            continue;
        };
        if unit.is_terminated() {
            break;
        }
        if let Err(e) = apply(unit, registry, &command) {
            error!(unit = %unit.id(), ?command, error = %e, "Command failed");
        }
    }

    unit.unwind();
    info!(unit = %unit.id(), name = unit.name(), "Control loop stopped");
}

/// Apply one command to `unit`
pub(crate) fn apply(
    unit: &Arc<MixerUnit>,
    registry: &DeviceRegistry,
    command: &Command,
) -> Result<()> {
    match command {
        Command::SetOutputDevice(device) => unit.attach_to_device(registry, device),
        Command::SetSampleRate(rate) => unit.change_sample_rate(registry, *rate),
    }
}

fn report_underflows(unit: &MixerUnit, reported: u64) -> u64 {
    let count = unit.underflow_count();
    if count > reported {
        warn!(
            unit = %unit.id(),
            device = ?unit.device(),
            new = count - reported,
            total = count,
            "Audio buffer underflow"
        );
    }
    count
}
