//! Integration tests for the mixing engine
//!
//! These tests drive complete device lifecycles through the in-memory backend:
//! sharing one device between sources, sample-rate switches while audio is
//! queued, owner termination and replacement, and registry teardown.

use mixdown_core::domain::mock::{MockBackend, MockStreamHandle};
use mixdown_core::{
    AudioBuffer, AudioError, Command, DeviceId, DeviceRegistry, MixerConfig, MixerUnit,
    OutputBackend,
};
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const FRAMES: u32 = 512;

fn setup() -> (Arc<MockBackend>, DeviceRegistry) {
    let backend = Arc::new(MockBackend::new());
    let config = MixerConfig {
        buffer_frames: FRAMES,
        heartbeat_ms: 5,
        ..MixerConfig::default()
    };
    (backend.clone(), DeviceRegistry::new(backend, config))
}

fn device(id: &str) -> DeviceId {
    DeviceId::new(id)
}

fn stream(backend: &MockBackend, device: &DeviceId) -> MockStreamHandle {
    backend.latest_stream(device).expect("device has a stream")
}

fn attached(registry: &DeviceRegistry, name: &str, device: &DeviceId) -> Arc<MixerUnit> {
    let source = registry.new_source(name);
    source.attach_to_device(registry, device).unwrap();
    source
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

fn left(out: &[f32]) -> Vec<f32> {
    out.iter().step_by(2).copied().collect()
}

// ============================================================================
// DEVICE SHARING
// ============================================================================

#[test]
fn test_sources_share_one_owner_per_device() {
    let (backend, registry) = setup();
    let d0 = device("mock:0");
    let a = attached(&registry, "a", &d0);
    let b = attached(&registry, "b", &d0);

    assert_eq!(backend.open_count(&d0), 1);
    let owner = registry.owner(&d0).unwrap();
    assert!(owner.is_owner());
    assert!(owner.is_streaming());
    assert_eq!(owner.bound_count(), 2);
    assert!(!a.is_owner() && !b.is_owner());
    assert_eq!(a.device(), Some(d0.clone()));
    assert!(a.is_active() && b.is_active());

    registry.teardown();
}

#[test]
fn test_each_device_gets_its_own_owner() {
    let (backend, registry) = setup();
    let (d0, d1) = (device("mock:0"), device("mock:1"));
    let a = attached(&registry, "a", &d0);
    let b = attached(&registry, "b", &d1);

    a.push(AudioBuffer::new(vec![0.25; FRAMES as usize], 48000, 1));
    b.push(AudioBuffer::new(vec![0.5; FRAMES as usize], 48000, 1));

    let out0 = stream(&backend, &d0).render(false).unwrap();
    let out1 = stream(&backend, &d1).render(false).unwrap();
    assert!(out0.iter().all(|&s| s == 0.25));
    assert!(out1.iter().all(|&s| s == 0.5));
    assert_eq!(registry.devices_in_use(), vec![d0, d1]);

    registry.teardown();
}

#[test]
fn test_moving_a_source_between_devices() {
    let (_, registry) = setup();
    let (d0, d1) = (device("mock:0"), device("mock:1"));
    let source = attached(&registry, "mover", &d0);
    let stay = attached(&registry, "stay", &d0);

    source.attach_to_device(&registry, &d1).unwrap();
    let owner0 = registry.owner(&d0).unwrap();
    let owner1 = registry.owner(&d1).unwrap();
    assert_eq!(owner0.bound_count(), 1);
    assert!(Arc::ptr_eq(&owner0.bound_sources()[0], &stay));
    assert!(Arc::ptr_eq(&owner1.bound_sources()[0], &source));
    assert_eq!(source.device(), Some(d1));

    registry.teardown();
}

#[test]
fn test_failed_attach_keeps_previous_binding() {
    let (backend, registry) = setup();
    let (d0, d1) = (device("mock:0"), device("mock:1"));
    let source = attached(&registry, "s", &d0);
    backend.fail_open(&d1);

    let result = source.attach_to_device(&registry, &d1);
    assert!(matches!(result, Err(AudioError::HardwareOpen { .. })));
    assert!(registry.owner(&d1).is_none());
    assert!(!registry.has_control_loop(&d1));
    assert_eq!(source.device(), Some(d0.clone()));
    assert_eq!(registry.owner(&d0).unwrap().bound_count(), 1);

    registry.teardown();
}

#[test]
fn test_failed_first_attach_leaves_source_inactive() {
    let (backend, registry) = setup();
    let d0 = device("mock:0");
    backend.fail_open(&d0);

    let source = registry.new_source("s");
    assert!(source.attach_to_device(&registry, &d0).is_err());
    assert!(!source.is_active());
    assert!(source.device().is_none());
    assert!(registry.devices_in_use().is_empty());

    backend.allow_open(&d0);
    source.attach_to_device(&registry, &d0).unwrap();
    assert!(source.is_active());
    registry.teardown();
}

#[test]
fn test_unknown_device_is_reported() {
    let (_, registry) = setup();
    let source = registry.new_source("s");
    let err = source.attach_to_device(&registry, &device("nowhere")).unwrap_err();
    assert!(matches!(err, AudioError::HardwareOpen { .. }));
    assert!(err.to_string().contains("nowhere"));
}

#[test]
fn test_source_cannot_be_routed_by_command() {
    let (backend, registry) = setup();
    let (d0, d1) = (device("mock:0"), device("mock:1"));
    let source = attached(&registry, "s", &d0);

    let err = source.send(Command::SetOutputDevice(d1.clone())).unwrap_err();
    assert!(matches!(err, AudioError::InvalidConfiguration(_)));

    thread::sleep(Duration::from_millis(20));
    assert_eq!(source.device(), Some(d0.clone()));
    assert!(registry.owner(&d1).is_none());
    assert_eq!(backend.open_count(&d1), 0);

    registry.teardown();
}

// ============================================================================
// MIXING THROUGH THE HARDWARE CALLBACK
// ============================================================================

#[test]
fn test_mono_scenario_without_scaling() {
    let (backend, registry) = setup();
    let d0 = device("mock:0");
    let source = attached(&registry, "mono", &d0);

    let samples: Vec<f32> = (0..FRAMES)
        .map(|i| 0.5 * (i as f32 * 0.05).sin())
        .collect();
    source.push(AudioBuffer::with_peak(samples.clone(), 48000, 1, 0.5));

    let out = stream(&backend, &d0).render(false).unwrap();
    assert_eq!(out.len(), FRAMES as usize * 2);
    for (frame, &input) in samples.iter().enumerate() {
        assert_eq!(out[frame * 2], input);
        assert_eq!(out[frame * 2 + 1], input);
    }

    registry.teardown();
}

#[test]
fn test_two_loud_sources_are_scaled() {
    let (backend, registry) = setup();
    let d0 = device("mock:0");
    let a = attached(&registry, "a", &d0);
    let b = attached(&registry, "b", &d0);
    a.push(AudioBuffer::new(vec![0.8; FRAMES as usize], 48000, 1));
    b.push(AudioBuffer::new(vec![-0.8; FRAMES as usize], 48000, 1));
    b.push(AudioBuffer::new(vec![0.8; FRAMES as usize], 48000, 1));

    let handle = stream(&backend, &d0);
    let first = handle.render(false).unwrap();
    assert!(first.iter().all(|&s| s.abs() < 1e-6));

    a.push(AudioBuffer::new(vec![0.8; FRAMES as usize], 48000, 1));
    let second = handle.render(false).unwrap();
    let peak = second.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
    assert!(peak <= 1.0 + 1e-6);
    assert!(second.iter().all(|&s| (s - 1.0).abs() < 1e-6));

    registry.teardown();
}

#[test]
fn test_empty_source_contributes_nothing() {
    let (backend, registry) = setup();
    let d0 = device("mock:0");
    let playing = attached(&registry, "playing", &d0);
    let _silent = attached(&registry, "silent", &d0);

    let samples: Vec<f32> = (0..FRAMES).map(|i| (i % 7) as f32 / 10.0 - 0.3).collect();
    playing.push(AudioBuffer::new(samples.clone(), 48000, 1));

    let out = stream(&backend, &d0).render(false).unwrap();
    assert_eq!(left(&out), samples);

    registry.teardown();
}

#[test]
fn test_gain_and_activity_through_callback() {
    let (backend, registry) = setup();
    let d0 = device("mock:0");
    let loud = attached(&registry, "loud", &d0);
    let muted = attached(&registry, "muted", &d0);
    loud.set_gain(0.5);
    muted.push(AudioBuffer::new(vec![0.3; FRAMES as usize], 48000, 1));
    muted.set_active(false);
    assert!(muted.queue().is_empty());

    loud.push(AudioBuffer::new(vec![0.6; FRAMES as usize], 48000, 1));
    muted.push(AudioBuffer::new(vec![0.3; FRAMES as usize], 48000, 1));

    let out = stream(&backend, &d0).render(false).unwrap();
    assert!(out.iter().all(|&s| (s - 0.3).abs() < 1e-6));
    assert_eq!(muted.queue().len(), 1);
    assert_eq!(registry.owner(&d0).unwrap().bound_count(), 2);
    assert_eq!(muted.device(), Some(d0.clone()));

    registry.teardown();
}

#[test]
fn test_underflows_are_counted_on_owner() {
    let (backend, registry) = setup();
    let d0 = device("mock:0");
    let _source = attached(&registry, "s", &d0);
    let handle = stream(&backend, &d0);

    handle.render(true);
    handle.render(false);
    handle.render(true);
    assert_eq!(registry.owner(&d0).unwrap().underflow_count(), 2);

    registry.teardown();
}

// ============================================================================
// SAMPLE RATE SWITCHING
// ============================================================================

#[test]
fn test_rate_switch_propagates_and_discards_stale_buffers() {
    let (backend, registry) = setup();
    let d0 = device("mock:0");
    let sources: Vec<_> = (0..3)
        .map(|i| attached(&registry, &format!("s{}", i), &d0))
        .collect();
    for source in &sources {
        source.push(AudioBuffer::new(vec![0.9; FRAMES as usize], 48000, 1));
        source.push(AudioBuffer::new(vec![0.9; FRAMES as usize], 48000, 1));
    }
    let old = stream(&backend, &d0);
    old.render(false).unwrap();

    let owner = registry.owner(&d0).unwrap();
    owner.change_sample_rate(&registry, 44100).unwrap();

    assert!(old.is_closed());
    assert_eq!(registry.sample_rate(&d0), Some(44100));
    assert!(sources.iter().all(|s| s.sample_rate() == 44100));

    let new = stream(&backend, &d0);
    assert_eq!(new.params().sample_rate, 44100);
    assert!(new.is_running());

    sources[0].push(AudioBuffer::new(vec![0.2; FRAMES as usize], 44100, 1));
    let out = new.render(false).unwrap();
    assert!(out.iter().all(|&s| (s - 0.2).abs() < 1e-6));
    assert!(sources.iter().all(|s| s.queue().is_empty()));

    registry.teardown();
}

#[test]
fn test_rate_switch_through_control_loop_notifies_observers() {
    let (backend, registry) = setup();
    let d0 = device("mock:0");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    registry.subscribe(Arc::new(move |device: &DeviceId, rate: u32| {
        sink.lock().unwrap().push((device.clone(), rate));
    }));

    let source = attached(&registry, "s", &d0);
    registry.set_device_sample_rate(&d0, 96000).unwrap();

    assert!(wait_until(|| source.sample_rate() == 96000));
    assert!(wait_until(|| stream(&backend, &d0).params().sample_rate == 96000
        && stream(&backend, &d0).is_running()));
    assert_eq!(*seen.lock().unwrap(), vec![(d0.clone(), 96000)]);
    assert_eq!(backend.open_count(&d0), 2);

    registry.teardown();
}

#[test]
fn test_late_joiner_inherits_device_rate() {
    let (_, registry) = setup();
    let d0 = device("mock:0");
    let _first = attached(&registry, "first", &d0);
    registry.owner(&d0).unwrap().change_sample_rate(&registry, 44100).unwrap();

    let late = attached(&registry, "late", &d0);
    assert_eq!(late.sample_rate(), 44100);
    registry.teardown();
}

#[test]
fn test_non_owner_rate_change_is_local() {
    let (backend, registry) = setup();
    let d0 = device("mock:0");
    let source = attached(&registry, "s", &d0);

    source.change_sample_rate(&registry, 22050).unwrap();
    assert_eq!(source.sample_rate(), 22050);
    assert_eq!(registry.sample_rate(&d0), Some(48000));
    assert_eq!(backend.open_count(&d0), 1);

    registry.teardown();
}

#[test]
fn test_rate_switches_while_producing_and_rendering() {
    let (backend, registry) = setup();
    let d0 = device("mock:0");
    let sources: Vec<_> = (0..4)
        .map(|i| attached(&registry, &format!("producer-{}", i), &d0))
        .collect();
    let owner = registry.owner(&d0).unwrap();
    let running = Arc::new(AtomicBool::new(true));

    let producers: Vec<_> = sources
        .iter()
        .map(|source| {
            let source = Arc::clone(source);
            let running = Arc::clone(&running);
            thread::spawn(move || {
                while running.load(Ordering::Acquire) {
                    let samples = vec![0.9; FRAMES as usize];
                    let buffer = AudioBuffer::new(samples, source.sample_rate(), 1);
                    if source.queue().try_push(buffer).is_err() {
                        thread::sleep(Duration::from_micros(200));
                    }
                }
            })
        })
        .collect();

    let renderer = {
        let backend = Arc::clone(&backend);
        let running = Arc::clone(&running);
        let d0 = d0.clone();
        thread::spawn(move || {
            let mut periods = 0usize;
            while running.load(Ordering::Acquire) {
                match backend.latest_stream(&d0).and_then(|s| s.render(false)) {
                    Some(out) => {
                        let peak = out.iter().fold(0.0f32, |m, s| m.max(s.abs()));
                        assert!(peak <= 1.0 + 1e-5, "peak {}", peak);
                        periods += 1;
                    }
                    None => thread::yield_now(),
                }
            }
            periods
        })
    };

    let rates = [44100, 48000];
    for i in 0..100 {
        owner.change_sample_rate(&registry, rates[i % 2]).unwrap();
        thread::sleep(Duration::from_millis(1));
    }
    let last = rates[99 % 2];

    running.store(false, Ordering::Release);
    for producer in producers {
        producer.join().unwrap();
    }
    let periods = renderer.join().unwrap();
    assert!(periods > 0);

    assert!(sources.iter().all(|s| s.sample_rate() == last));
    assert_eq!(owner.sample_rate(), last);
    assert_eq!(registry.sample_rate(&d0), Some(last));
    let current = stream(&backend, &d0);
    assert_eq!(current.params().sample_rate, last);
    assert!(current.is_running());
    assert_eq!(backend.open_count(&d0), 101);

    registry.teardown();
}

// ============================================================================
// TERMINATION AND TEARDOWN
// ============================================================================

#[test]
fn test_teardown_closes_streams_and_silences_callbacks() {
    let (backend, registry) = setup();
    let (d0, d1) = (device("mock:0"), device("mock:1"));
    let a = attached(&registry, "a", &d0);
    let _b = attached(&registry, "b", &d1);
    a.push(AudioBuffer::new(vec![0.5; FRAMES as usize], 48000, 1));
    let owners: Vec<_> = [&d0, &d1].iter().map(|d| registry.owner(d).unwrap()).collect();

    registry.teardown();

    assert!(backend.streams().iter().all(|s| s.is_closed()));
    assert!(stream(&backend, &d0).render(false).is_none());
    assert!(registry.devices_in_use().is_empty());
    for owner in &owners {
        assert!(owner.is_terminated());
        assert!(!owner.has_stream());
        let mut out = vec![1.0; 8];
        owner.render(&mut out, Default::default());
        assert!(out.iter().all(|&s| s == 0.0));
    }
}

#[test]
fn test_terminated_owner_is_replaced_and_sources_adopted() {
    let (backend, registry) = setup();
    let d0 = device("mock:0");
    let early = attached(&registry, "early", &d0);
    let old_owner = registry.owner(&d0).unwrap();
    let old_stream = stream(&backend, &d0);

    old_owner.terminate();
    assert!(wait_until(|| old_stream.is_closed()));

    let late = attached(&registry, "late", &d0);
    let new_owner = registry.owner(&d0).unwrap();
    assert!(!Arc::ptr_eq(&new_owner, &old_owner));
    assert_eq!(new_owner.bound_count(), 2);
    assert_eq!(backend.open_count(&d0), 2);

    early.push(AudioBuffer::new(vec![0.25; FRAMES as usize], 48000, 1));
    late.push(AudioBuffer::new(vec![0.25; FRAMES as usize], 48000, 1));
    let out = stream(&backend, &d0).render(false).unwrap();
    assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-6));

    registry.teardown();
}

#[test]
fn test_terminated_source_is_detached() {
    let (_, registry) = setup();
    let d0 = device("mock:0");
    let source = attached(&registry, "s", &d0);
    source.push(AudioBuffer::new(vec![0.5; FRAMES as usize], 48000, 1));

    source.terminate();
    assert!(source.queue().is_empty());
    assert!(source.device().is_none());
    assert_eq!(registry.owner(&d0).unwrap().bound_count(), 0);
    assert!(matches!(
        source.attach_to_device(&registry, &d0),
        Err(AudioError::Terminated(_))
    ));

    registry.teardown();
}

// ============================================================================
// CONFIGURATION AND BACKENDS
// ============================================================================

#[tokio::test]
async fn test_config_file_drives_stream_params() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    tokio::fs::write(&path, "buffer_frames = 128\ndefault_sample_rate = 44100\n")
        .await
        .unwrap();
    let config = MixerConfig::load_from_file(&path).await.unwrap();

    let backend = Arc::new(MockBackend::new());
    let registry = DeviceRegistry::new(backend.clone(), config);
    let d0 = device("mock:0");
    let source = attached(&registry, "s", &d0);

    let params = stream(&backend, &d0).params().clone();
    assert_eq!(params.buffer_frames, 128);
    assert_eq!(params.sample_rate, 44100);
    assert_eq!(params.channels, 2);
    assert_eq!(source.sample_rate(), 44100);

    tokio::task::spawn_blocking(move || registry.teardown())
        .await
        .unwrap();
}

#[test]
fn test_cpal_backend_plugs_into_registry() {
    let backend: Arc<dyn OutputBackend> = Arc::new(mixdown_infra::CpalBackend::new());
    let registry = DeviceRegistry::new(backend, MixerConfig::default());
    assert!(registry.devices_in_use().is_empty());
    registry.teardown();
}

proptest! {
    #[test]
    fn prop_bind_unbind_restores_bound_set(count in 1usize..6, pick in 0usize..6) {
        let (_, registry) = setup();
        let d0 = device("mock:0");
        let sources: Vec<_> = (0..count)
            .map(|i| attached(&registry, &format!("s{}", i), &d0))
            .collect();
        let owner = registry.owner(&d0).unwrap();
        let before: Vec<_> = owner.bound_sources().iter().map(|s| s.id()).collect();

        let extra = registry.new_source("extra");
        prop_assert!(owner.bind(&extra));
        prop_assert!(!owner.bind(&extra));
        prop_assert_eq!(owner.bound_count(), count + 1);
        prop_assert!(owner.unbind(&extra));

        let rebound = &sources[pick % count];
        prop_assert!(!owner.bind(rebound));

        let after: Vec<_> = owner.bound_sources().iter().map(|s| s.id()).collect();
        prop_assert_eq!(before, after);
        registry.teardown();
    }
}
