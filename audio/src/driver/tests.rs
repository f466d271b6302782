//! Driver tests against a scripted in-memory PCM device

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use super::callback::CallbackState;
use super::polling::PollingLoop;
use super::*;
use crate::device::{AsyncHandler, PcmStream};
use crate::error::DeviceError;
use crate::mixer::FRAME_BYTES;
use crate::sound::Sound;

const PERIOD: usize = 4;

/// One scripted response to `write_interleaved`
enum Step {
    /// Accept at most this many frames
    Accept(usize),
    Fail(DeviceError),
}

#[derive(Default)]
struct MockLog {
    written: Vec<u8>,
    writes: usize,
    prepares: usize,
    resumes: usize,
    started: bool,
    closed: bool,
    unregistered: bool,
}

/// Device state shared between the mock device, its streams, and the test
#[derive(Default)]
struct MockShared {
    log: Mutex<MockLog>,
    /// Write script; once empty every write is accepted in full
    writes: Mutex<VecDeque<Step>>,
    /// Resume script; once empty resume succeeds
    resumes: Mutex<VecDeque<Result<(), DeviceError>>>,
    prepare_error: Mutex<Option<DeviceError>>,
    avail: Mutex<usize>,
    /// Errors returned by `avail` before it reports space again
    avail_errors: Mutex<VecDeque<DeviceError>>,
    handler: Mutex<Option<AsyncHandler>>,
}

impl MockShared {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script(&self, steps: impl IntoIterator<Item = Step>) {
        self.writes.lock().unwrap().extend(steps);
    }

    fn script_resumes(&self, results: impl IntoIterator<Item = Result<(), DeviceError>>) {
        self.resumes.lock().unwrap().extend(results);
    }

    fn set_avail(&self, frames: usize) {
        *self.avail.lock().unwrap() = frames;
    }

    /// Invoke the registered async handler the way a device thread would
    fn fire(self: &Arc<Self>) {
        let mut handler = self.handler.lock().unwrap();
        let handler = handler.as_mut().expect("no async handler registered");
        let mut io = MockStream {
            shared: self.clone(),
        };
        handler(&mut io);
    }

    fn written(&self) -> Vec<u8> {
        self.log.lock().unwrap().written.clone()
    }
}

struct MockStream {
    shared: Arc<MockShared>,
}

impl PcmStream for MockStream {
    fn avail(&mut self) -> Result<usize, DeviceError> {
        if let Some(e) = self.shared.avail_errors.lock().unwrap().pop_front() {
            return Err(e);
        }
        Ok(*self.shared.avail.lock().unwrap())
    }

    fn write_interleaved(&mut self, bytes: &[u8]) -> Result<usize, DeviceError> {
        let offered = bytes.len() / FRAME_BYTES;
        let step = self.shared.writes.lock().unwrap().pop_front();
        let frames = match step {
            Some(Step::Accept(max)) => offered.min(max),
            Some(Step::Fail(e)) => return Err(e),
            None => {
                // Pace unscripted writes like a real device would
                thread::sleep(Duration::from_millis(1));
                offered
            }
        };

        let mut log = self.shared.log.lock().unwrap();
        log.writes += 1;
        log.written.extend_from_slice(&bytes[..frames * FRAME_BYTES]);
        let mut avail = self.shared.avail.lock().unwrap();
        *avail = avail.saturating_sub(frames);
        Ok(frames)
    }

    fn prepare(&mut self) -> Result<(), DeviceError> {
        self.shared.log.lock().unwrap().prepares += 1;
        match self.shared.prepare_error.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn resume(&mut self) -> Result<(), DeviceError> {
        self.shared.log.lock().unwrap().resumes += 1;
        self.shared
            .resumes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }
}

struct MockDevice {
    shared: Arc<MockShared>,
    async_supported: bool,
}

impl MockDevice {
    fn boxed(shared: &Arc<MockShared>, async_supported: bool) -> Box<dyn PcmDevice> {
        Box::new(Self {
            shared: shared.clone(),
            async_supported,
        })
    }
}

impl PcmDevice for MockDevice {
    fn name(&self) -> &str {
        "mock"
    }

    fn negotiated(&self) -> Negotiated {
        Negotiated {
            rate: crate::SAMPLE_RATE,
            period_frames: PERIOD,
            buffer_frames: PERIOD * 4,
            fixed_period: true,
        }
    }

    fn stream(&mut self) -> Result<Box<dyn PcmStream>, DeviceError> {
        Ok(Box::new(MockStream {
            shared: self.shared.clone(),
        }))
    }

    fn register_async(&mut self, handler: AsyncHandler) -> Result<(), DeviceError> {
        if !self.async_supported {
            return Err(DeviceError::NotSupported);
        }
        *self.shared.handler.lock().unwrap() = Some(handler);
        Ok(())
    }

    fn unregister_async(&mut self) -> Result<(), DeviceError> {
        self.shared.handler.lock().unwrap().take();
        self.shared.log.lock().unwrap().unregistered = true;
        Ok(())
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        self.shared.log.lock().unwrap().started = true;
        Ok(())
    }

    fn close(&mut self) {
        self.shared.log.lock().unwrap().closed = true;
    }
}

/// Ramp source: frame i = (i * 100, -(i * 100))
fn ramp(frames: usize) -> Arc<Sound> {
    let samples = (0..frames as i16)
        .flat_map(|i| [i * 100, -(i * 100)])
        .collect();
    Arc::new(Sound::from_interleaved(samples))
}

fn le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Loop at unity master volume with one ramp playing
fn polling_loop(frames: usize) -> (PollingLoop, Arc<Sound>) {
    let mixer = Mixer::new(1.0);
    let sound = ramp(frames);
    mixer.play(sound.clone(), 1.0);
    (PollingLoop::new(mixer, PERIOD, Duration::ZERO), sound)
}

fn first_period(sound: &Sound) -> Vec<u8> {
    le_bytes(&sound.samples()[..PERIOD * crate::CHANNELS])
}

fn config(backend: BackendMode) -> AudioConfig {
    AudioConfig {
        master_volume: 1.0,
        backend,
        resume_retry_ms: 0,
        ..AudioConfig::default()
    }
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

// ============================================================================
// Polling loop
// ============================================================================

#[test]
fn test_polling_underrun_prepares_and_rewrites() {
    let shared = MockShared::new();
    shared.script([Step::Fail(DeviceError::Underrun)]);
    let mut stream = MockStream {
        shared: shared.clone(),
    };
    let (mut looper, sound) = polling_loop(16);

    looper.step(&mut stream).unwrap();

    assert_eq!(shared.log.lock().unwrap().prepares, 1);
    assert_eq!(looper.metrics.underruns, 1);
    assert_eq!(shared.written(), first_period(&sound));
}

#[test]
fn test_polling_partial_writes_complete_the_period() {
    let shared = MockShared::new();
    shared.script([Step::Accept(1), Step::Accept(2), Step::Accept(10)]);
    let mut stream = MockStream {
        shared: shared.clone(),
    };
    let (mut looper, sound) = polling_loop(16);

    looper.step(&mut stream).unwrap();

    assert_eq!(shared.log.lock().unwrap().writes, 3);
    assert_eq!(shared.written(), first_period(&sound));
}

#[test]
fn test_polling_would_block_retries() {
    let shared = MockShared::new();
    shared.script([
        Step::Fail(DeviceError::WouldBlock),
        Step::Fail(DeviceError::WouldBlock),
    ]);
    let mut stream = MockStream {
        shared: shared.clone(),
    };
    let (mut looper, sound) = polling_loop(16);

    looper.step(&mut stream).unwrap();

    assert_eq!(looper.metrics.retries, 2);
    assert_eq!(shared.written(), first_period(&sound));
}

#[test]
fn test_polling_suspend_waits_for_resume() {
    let shared = MockShared::new();
    shared.script([Step::Fail(DeviceError::Suspended)]);
    shared.script_resumes([Err(DeviceError::WouldBlock), Err(DeviceError::WouldBlock), Ok(())]);
    let mut stream = MockStream {
        shared: shared.clone(),
    };
    let (mut looper, sound) = polling_loop(16);

    looper.step(&mut stream).unwrap();

    let log = shared.log.lock().unwrap();
    assert_eq!(log.resumes, 3);
    assert_eq!(log.prepares, 0);
    assert_eq!(looper.metrics.suspends, 1);
    assert_eq!(log.written, first_period(&sound));
}

#[test]
fn test_polling_failed_resume_falls_back_to_prepare() {
    let shared = MockShared::new();
    shared.script([Step::Fail(DeviceError::Suspended)]);
    shared.script_resumes([Err(DeviceError::Stream("lost".into()))]);
    let mut stream = MockStream {
        shared: shared.clone(),
    };
    let (mut looper, sound) = polling_loop(16);

    looper.step(&mut stream).unwrap();

    let log = shared.log.lock().unwrap();
    assert_eq!(log.resumes, 1);
    assert_eq!(log.prepares, 1);
    assert_eq!(log.written, first_period(&sound));
}

#[test]
fn test_polling_failed_prepare_is_fatal() {
    let shared = MockShared::new();
    shared.script([Step::Fail(DeviceError::Underrun)]);
    *shared.prepare_error.lock().unwrap() = Some(DeviceError::Closed);
    let mut stream = MockStream {
        shared: shared.clone(),
    };
    let (mut looper, _sound) = polling_loop(16);

    let err = looper.step(&mut stream).unwrap_err();
    assert!(matches!(
        err,
        DriverError::Recovery {
            action: "underrun",
            source: DeviceError::Closed,
        }
    ));
}

#[test]
fn test_polling_other_write_error_is_fatal() {
    let shared = MockShared::new();
    shared.script([Step::Fail(DeviceError::Stream("unplugged".into()))]);
    let mut stream = MockStream {
        shared: shared.clone(),
    };
    let (mut looper, _sound) = polling_loop(16);

    let err = looper.step(&mut stream).unwrap_err();
    assert!(matches!(err, DriverError::Device(DeviceError::Stream(_))));
    assert!(shared.written().is_empty());
}

#[test]
fn test_polling_gives_up_waiting_on_shutdown() {
    let shared = MockShared::new();
    shared.script([Step::Fail(DeviceError::Suspended), Step::Fail(DeviceError::WouldBlock)]);
    shared.script_resumes([Err(DeviceError::WouldBlock)]);
    let mut stream = MockStream {
        shared: shared.clone(),
    };
    let mixer = Mixer::new(1.0);
    mixer.play(ramp(16), 1.0);
    let mut looper = PollingLoop::new(mixer.clone(), PERIOD, Duration::ZERO);
    mixer.request_shutdown();

    // Suspended, resume says "not yet", shutdown seen: step returns early
    looper.step(&mut stream).unwrap();
    // "Try again" with shutdown pending also returns early
    looper.step(&mut stream).unwrap();

    assert!(shared.written().is_empty());
    assert_eq!(looper.metrics.suspends, 0);
}

#[test]
fn test_polling_loop_consumes_sound_across_periods() {
    let shared = MockShared::new();
    let mut stream = MockStream {
        shared: shared.clone(),
    };
    let (mut looper, sound) = polling_loop(PERIOD * 2 + 1);

    for _ in 0..4 {
        looper.step(&mut stream).unwrap();
    }

    let written = shared.written();
    assert_eq!(written.len(), 4 * PERIOD * FRAME_BYTES);
    let played = le_bytes(sound.samples());
    assert_eq!(&written[..played.len()], &played[..]);
    assert!(written[played.len()..].iter().all(|&b| b == 0));
    assert!(!sound.is_playing());
}

// ============================================================================
// Callback servicing
// ============================================================================

#[test]
fn test_callback_fills_whole_periods_only() {
    let shared = MockShared::new();
    shared.set_avail(PERIOD * 2 + PERIOD / 2);
    let mixer = Mixer::new(1.0);
    let sound = ramp(64);
    mixer.play(sound.clone(), 1.0);
    let mut state = CallbackState::new(mixer, PERIOD);
    let mut io = MockStream {
        shared: shared.clone(),
    };

    state.service(&mut io).unwrap();

    let log = shared.log.lock().unwrap();
    assert_eq!(log.writes, 2);
    assert_eq!(log.written, le_bytes(&sound.samples()[..PERIOD * 2 * 2]));
    assert_eq!(*shared.avail.lock().unwrap(), PERIOD / 2);
}

#[test]
fn test_callback_short_write_is_an_error() {
    let shared = MockShared::new();
    shared.set_avail(PERIOD);
    shared.script([Step::Accept(1)]);
    let mut state = CallbackState::new(Mixer::new(1.0), PERIOD);
    let mut io = MockStream {
        shared: shared.clone(),
    };

    let err = state.service(&mut io).unwrap_err();
    assert!(matches!(
        err,
        DriverError::ShortWrite {
            expected: PERIOD,
            written: 1,
        }
    ));
}

fn callback_state(frames: usize) -> (CallbackState, Arc<Sound>) {
    let mixer = Mixer::new(1.0);
    let sound = ramp(frames);
    mixer.play(sound.clone(), 1.0);
    (CallbackState::new(mixer, PERIOD), sound)
}

#[test]
fn test_callback_resumes_after_suspend() {
    let shared = MockShared::new();
    shared.set_avail(PERIOD);
    shared.avail_errors.lock().unwrap().push_back(DeviceError::Suspended);
    let (mut state, sound) = callback_state(64);
    let mut io = MockStream {
        shared: shared.clone(),
    };

    state.service(&mut io).unwrap();

    let log = shared.log.lock().unwrap();
    assert_eq!(log.resumes, 1);
    assert_eq!(log.prepares, 0);
    assert_eq!(state.metrics.suspends, 1);
    assert_eq!(log.written, first_period(&sound));
}

#[test]
fn test_callback_suspend_retried_on_next_callback() {
    let shared = MockShared::new();
    shared.set_avail(PERIOD);
    shared.avail_errors.lock().unwrap().push_back(DeviceError::Suspended);
    shared.script_resumes([Err(DeviceError::WouldBlock)]);
    let (mut state, sound) = callback_state(64);
    let mut io = MockStream {
        shared: shared.clone(),
    };

    // Still suspended: nothing mixed, the sound keeps its place
    state.service(&mut io).unwrap();
    assert!(shared.written().is_empty());
    assert_eq!(state.mixer.positions(&sound), vec![0]);

    // Next callback finds the device back
    state.service(&mut io).unwrap();
    assert_eq!(shared.written(), first_period(&sound));
    assert_eq!(state.mixer.positions(&sound), vec![PERIOD]);
}

#[test]
fn test_callback_failed_resume_falls_back_to_prepare() {
    let shared = MockShared::new();
    shared.set_avail(PERIOD);
    shared.avail_errors.lock().unwrap().push_back(DeviceError::Suspended);
    shared.script_resumes([Err(DeviceError::Stream("lost".into()))]);
    let (mut state, sound) = callback_state(64);
    let mut io = MockStream {
        shared: shared.clone(),
    };

    state.service(&mut io).unwrap();

    let log = shared.log.lock().unwrap();
    assert_eq!(log.prepares, 1);
    assert_eq!(log.written, first_period(&sound));
}

#[test]
fn test_callback_underrun_prepares() {
    let shared = MockShared::new();
    shared.set_avail(PERIOD);
    shared.avail_errors.lock().unwrap().push_back(DeviceError::Underrun);
    let (mut state, sound) = callback_state(64);
    let mut io = MockStream {
        shared: shared.clone(),
    };

    state.service(&mut io).unwrap();

    assert_eq!(shared.log.lock().unwrap().prepares, 1);
    assert_eq!(state.metrics.underruns, 1);
    assert_eq!(shared.written(), first_period(&sound));
}

#[test]
fn test_callback_recovers_once_per_call() {
    let shared = MockShared::new();
    shared.set_avail(PERIOD);
    shared
        .avail_errors
        .lock()
        .unwrap()
        .extend([DeviceError::Underrun, DeviceError::Underrun]);
    let (mut state, _sound) = callback_state(64);
    let mut io = MockStream {
        shared: shared.clone(),
    };

    state.service(&mut io).unwrap();
    assert_eq!(shared.log.lock().unwrap().prepares, 1);
    assert!(shared.written().is_empty());
}

#[test]
fn test_callback_does_nothing_after_shutdown() {
    let shared = MockShared::new();
    shared.set_avail(PERIOD * 8);
    let mixer = Mixer::new(1.0);
    mixer.request_shutdown();
    let mut state = CallbackState::new(mixer, PERIOD);
    let mut io = MockStream {
        shared: shared.clone(),
    };

    state.service(&mut io).unwrap();
    assert_eq!(shared.log.lock().unwrap().writes, 0);
}

// ============================================================================
// SoundMixer lifecycle
// ============================================================================

#[test]
fn test_auto_prefers_async_callback() {
    let shared = MockShared::new();
    let mut sound_mixer =
        SoundMixer::start_with_device(MockDevice::boxed(&shared, true), &config(BackendMode::Auto))
            .unwrap();

    assert_eq!(sound_mixer.state(), DriverState::Running);
    assert_eq!(sound_mixer.backend_kind(), Some(BackendKind::Callback));
    {
        let log = shared.log.lock().unwrap();
        assert!(log.started);
        // Three silent periods primed before start
        assert_eq!(log.writes, 3);
        assert_eq!(log.written, vec![0; 3 * PERIOD * FRAME_BYTES]);
    }

    let sound = ramp(64);
    sound_mixer.play(sound.clone(), 1.0);
    shared.set_avail(PERIOD);
    shared.fire();

    let written = shared.written();
    assert_eq!(written.len(), 4 * PERIOD * FRAME_BYTES);
    assert_eq!(&written[3 * PERIOD * FRAME_BYTES..], &first_period(&sound)[..]);

    sound_mixer.shutdown().unwrap();
    assert_eq!(sound_mixer.state(), DriverState::Closed);
    assert_eq!(sound_mixer.backend_kind(), None);
    let log = shared.log.lock().unwrap();
    assert!(log.unregistered);
    assert!(log.closed);
    assert!(shared.handler.lock().unwrap().is_none());
}

#[test]
fn test_auto_falls_back_to_polling() {
    let shared = MockShared::new();
    let mut sound_mixer =
        SoundMixer::start_with_device(MockDevice::boxed(&shared, false), &config(BackendMode::Auto))
            .unwrap();
    assert_eq!(sound_mixer.backend_kind(), Some(BackendKind::Polling));
    assert!(shared.log.lock().unwrap().started);

    let sound = ramp(PERIOD * 3);
    sound_mixer.play(sound.clone(), 1.0);
    wait_for("sound to finish", || !sound.is_playing());

    sound_mixer.shutdown().unwrap();
    assert!(shared.log.lock().unwrap().closed);

    let written = shared.written();
    let played = le_bytes(sound.samples());
    assert!(
        written
            .windows(played.len())
            .any(|window| window == &played[..])
    );
}

#[test]
fn test_polling_mode_ignores_async_support() {
    let shared = MockShared::new();
    let sound_mixer = SoundMixer::start_with_device(
        MockDevice::boxed(&shared, true),
        &config(BackendMode::Polling),
    )
    .unwrap();

    assert_eq!(sound_mixer.backend_kind(), Some(BackendKind::Polling));
    assert!(shared.handler.lock().unwrap().is_none());
}

#[test]
fn test_callback_mode_requires_async_support() {
    let shared = MockShared::new();
    let result = SoundMixer::start_with_device(
        MockDevice::boxed(&shared, false),
        &config(BackendMode::Callback),
    );

    assert!(matches!(result, Err(DriverError::BackendUnavailable)));
    let log = shared.log.lock().unwrap();
    assert!(log.closed);
    assert!(!log.started);
}

#[test]
fn test_polling_thread_survives_underrun() {
    let shared = MockShared::new();
    shared.script([Step::Accept(PERIOD), Step::Fail(DeviceError::Underrun)]);
    let mut sound_mixer = SoundMixer::start_with_device(
        MockDevice::boxed(&shared, false),
        &config(BackendMode::Polling),
    )
    .unwrap();

    wait_for("writes after the underrun", || {
        let log = shared.log.lock().unwrap();
        log.prepares == 1 && log.writes >= 4
    });

    sound_mixer.shutdown().unwrap();
    assert_eq!(sound_mixer.state(), DriverState::Closed);
}

#[test]
fn test_second_shutdown_reports_already_stopped() {
    let shared = MockShared::new();
    let mut sound_mixer = SoundMixer::start_with_device(
        MockDevice::boxed(&shared, false),
        &config(BackendMode::Polling),
    )
    .unwrap();

    sound_mixer.shutdown().unwrap();
    assert!(matches!(
        sound_mixer.shutdown(),
        Err(DriverError::AlreadyStopped)
    ));
}

#[test]
fn test_control_api_delegates_to_mixer() {
    let shared = MockShared::new();
    let sound_mixer = SoundMixer::start_with_device(
        MockDevice::boxed(&shared, true),
        &config(BackendMode::Callback),
    )
    .unwrap();

    sound_mixer.set_master_volume(0.25);
    assert_eq!(sound_mixer.master_volume(), 0.25);
    assert_eq!(sound_mixer.negotiated().period_frames, PERIOD);

    let sound = ramp(64);
    sound_mixer.play(sound.clone(), 1.0);
    sound_mixer.play(sound.clone(), 0.5);
    assert_eq!(sound_mixer.mixer().slot_count(&sound), 2);
    assert_eq!(sound.play_count(), 2);

    sound_mixer.stop(&sound);
    assert_eq!(sound_mixer.mixer().active_count(), 0);
    assert!(!sound.is_playing());
}

#[test]
fn test_drop_shuts_down() {
    let shared = MockShared::new();
    let sound_mixer = SoundMixer::start_with_device(
        MockDevice::boxed(&shared, false),
        &config(BackendMode::Auto),
    )
    .unwrap();
    drop(sound_mixer);
    assert!(shared.log.lock().unwrap().closed);
}
