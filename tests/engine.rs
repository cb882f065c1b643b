//! End-to-end tests driving a full engine against the mock device backend.
//!
//! The mock device has no clock; tests advance playback by marking buffers
//! consumed through [`MockDeviceHandle::complete`].

use rillaudio::buffer::AudioBuffer;
use rillaudio::decoder::Decoder;
use rillaudio::device::{AudioDevice, SourceHandle};
use rillaudio::{
    AudioEngine, AudioError, DecoderFactory, EngineConfig, MemoryStreamSource, MockDevice,
    MockDeviceHandle, PcmSpec, RawPcmDecoder, SingleStreamSource, SourceEvent, SourceId,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const MONO16: PcmSpec = PcmSpec {
    channels: 1,
    sample_rate: 8000,
    bits_per_sample: 16,
};

fn pcm_bytes(samples: usize) -> Vec<u8> {
    (0..samples).flat_map(|s| (s as i16).to_le_bytes()).collect()
}

fn engine_with_mock() -> (AudioEngine, MockDeviceHandle) {
    let _ = env_logger::builder().is_test(true).try_init();
    let device = MockDevice::new();
    let handle = device.handle();
    let engine = AudioEngine::with_device_factory(
        EngineConfig::new().refresh_period(Duration::from_millis(1)),
        Box::new(move || Ok(Box::new(device) as Box<dyn AudioDevice>)),
    )
    .unwrap();
    (engine, handle)
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("timed out waiting for {what}");
}

/// Collects every non-tick event the engine emits for one source.
fn record_events(engine: &AudioEngine, id: SourceId) -> Arc<Mutex<Vec<SourceEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    engine
        .register_callback(id, move |_, event| {
            if *event != SourceEvent::Tick {
                sink.lock().unwrap().push(event.clone());
            }
        })
        .unwrap();
    events
}

fn device_handle(mock: &MockDeviceHandle) -> SourceHandle {
    mock.source_handles()[0]
}

#[test]
fn streaming_source_plays_the_whole_stream() {
    let (engine, mock) = engine_with_mock();
    let stream = Arc::new(MemoryStreamSource::new(pcm_bytes(20_000)));
    let id = engine
        .new_streaming_source_with(stream, RawPcmDecoder::factory(MONO16), 4096, 3, false)
        .unwrap();
    let events = record_events(&engine, id);

    // Creation prefetches the first buffer.
    wait_until("prefetch", || !engine.buffers(id).unwrap().is_empty());
    assert!(!engine.is_playing(id).unwrap());

    engine.play(id).unwrap();
    let dev = device_handle(&mock);
    wait_until("completion", || {
        mock.complete(dev, 1);
        events
            .lock()
            .unwrap()
            .contains(&SourceEvent::Completed)
    });

    // 20000 samples in 4096-sample chunks: four full buffers and a 3616
    // sample tail, 40000 PCM bytes in total.
    assert_eq!(mock.upload_count(), 5);
    assert_eq!(mock.uploaded_bytes(), 40_000);
    assert_eq!(engine.offset(id).unwrap(), 20_000);
    assert!(!engine.is_playing(id).unwrap());
    assert!(engine.buffers(id).unwrap().is_empty());

    let events = events.lock().unwrap();
    let loaded: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            SourceEvent::BufferLoaded { samples } => Some(*samples),
            _ => None,
        })
        .collect();
    assert_eq!(loaded, vec![4096, 4096, 4096, 4096, 3616]);
    let processed: usize = events
        .iter()
        .filter_map(|e| match e {
            SourceEvent::BufferProcessed { samples } => Some(*samples),
            _ => None,
        })
        .sum();
    assert_eq!(processed, 20_000);
}

#[test]
fn gain_is_the_product_of_master_and_source_volume() {
    let (engine, mock) = engine_with_mock();
    engine.set_master_volume(0.5).unwrap();
    let id = engine.new_manual_source().unwrap();
    let dev = device_handle(&mock);
    assert!((mock.gain(dev) - 0.5).abs() < 1e-6);

    engine.set_volume(id, 0.5).unwrap();
    assert!((mock.gain(dev) - 0.25).abs() < 1e-6);

    engine.set_master_volume(1.0).unwrap();
    assert!((mock.gain(dev) - 0.5).abs() < 1e-6);
    assert_eq!(engine.volume(id).unwrap(), 0.5);
    assert_eq!(engine.master_volume().unwrap(), 1.0);
}

#[test]
fn fade_ramps_linearly_and_settles_on_the_target() {
    let (engine, mock) = engine_with_mock();
    let id = engine.new_manual_source().unwrap();
    engine.set_volume(id, 0.0).unwrap();

    engine.fade(id, 0.0, 1.0, Duration::from_millis(400)).unwrap();
    std::thread::sleep(Duration::from_millis(200));
    let mid = engine.volume(id).unwrap();
    assert!((0.2..=0.8).contains(&mid), "midpoint volume was {mid}");

    wait_until("fade settles", || engine.volume(id).unwrap() == 1.0);
    let dev = device_handle(&mock);
    assert!((mock.gain(dev) - 1.0).abs() < 1e-6);
}

#[test]
fn explicit_volume_cancels_a_running_fade() {
    let (engine, _mock) = engine_with_mock();
    let id = engine.new_manual_source().unwrap();
    engine.fade(id, 1.0, 0.0, Duration::from_secs(60)).unwrap();
    engine.set_volume(id, 0.8).unwrap();
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(engine.volume(id).unwrap(), 0.8);
}

struct SlowDecoder {
    inner: RawPcmDecoder,
    delay: Duration,
}

impl Decoder for SlowDecoder {
    fn spec(&self) -> PcmSpec {
        self.inner.spec()
    }
    fn total_size(&self) -> i64 {
        self.inner.total_size()
    }
    fn read_chunk(&mut self, max_samples: usize) -> rillaudio::Result<AudioBuffer> {
        std::thread::sleep(self.delay);
        self.inner.read_chunk(max_samples)
    }
    fn read_all(&mut self) -> rillaudio::Result<AudioBuffer> {
        std::thread::sleep(self.delay);
        self.inner.read_all()
    }
    fn is_stream_over(&self) -> bool {
        self.inner.is_stream_over()
    }
}

fn slow_factory(delay: Duration) -> DecoderFactory {
    Arc::new(move |stream| {
        Ok(Box::new(SlowDecoder {
            inner: RawPcmDecoder::new(stream, MONO16),
            delay,
        }) as Box<dyn Decoder>)
    })
}

#[test]
fn deleting_a_source_while_its_decode_is_in_flight_is_clean() {
    let (engine, mock) = engine_with_mock();
    let stream = Arc::new(MemoryStreamSource::new(pcm_bytes(10_000)));
    let id = engine
        .new_streaming_source_with(stream, slow_factory(Duration::from_millis(100)), 2048, 3, false)
        .unwrap();

    engine.delete_source(id).unwrap();
    assert!(engine.sources().unwrap().is_empty());
    assert_eq!(mock.source_count(), 0);

    // The orphaned outcome lands after the delete and is discarded.
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(mock.live_buffers(), 0);
    assert_eq!(mock.uploaded_bytes(), 0);
}

#[test]
fn seek_inside_the_buffered_window_moves_the_device_cursor() {
    let (engine, mock) = engine_with_mock();
    let stream = Arc::new(MemoryStreamSource::new(pcm_bytes(20_000)));
    let id = engine
        .new_streaming_source_with(stream, RawPcmDecoder::factory(MONO16), 4096, 3, false)
        .unwrap();

    engine.play(id).unwrap();
    wait_until("window full", || engine.buffers(id).unwrap().len() == 3);
    engine.pause(id).unwrap();
    assert_eq!(mock.upload_count(), 3);

    // 5000 is inside the queued window [0, 12288).
    engine.set_offset(id, 5000).unwrap();
    assert_eq!(engine.offset(id).unwrap(), 5000);
    assert_eq!(mock.upload_count(), 3, "in-window seek decodes nothing");
}

#[test]
fn seek_outside_the_window_restarts_the_decode() {
    let (engine, mock) = engine_with_mock();
    let stream = Arc::new(MemoryStreamSource::new(pcm_bytes(20_000)));
    let id = engine
        .new_streaming_source_with(stream, RawPcmDecoder::factory(MONO16), 4096, 3, false)
        .unwrap();
    let events = record_events(&engine, id);

    engine.play(id).unwrap();
    wait_until("window full", || engine.buffers(id).unwrap().len() == 3);
    engine.pause(id).unwrap();

    engine.set_offset(id, 15_000).unwrap();
    wait_until("seek lands", || engine.offset(id).unwrap() == 15_000);

    // The stale window was dropped and exactly one buffer decoded from the
    // seek target.
    let buffers = engine.buffers(id).unwrap();
    assert_eq!(buffers.len(), 1);
    assert_eq!(buffers[0].samples, 4096);
    assert_eq!(mock.live_buffers(), 1);
    assert!(
        events
            .lock()
            .unwrap()
            .contains(&SourceEvent::LoadingStarted { skipped: 15_000 })
    );
}

#[test]
fn single_buffer_streaming_ring_still_plays() {
    let (engine, mock) = engine_with_mock();
    let stream = Arc::new(MemoryStreamSource::new(pcm_bytes(6000)));
    let id = engine
        .new_streaming_source_with(stream, RawPcmDecoder::factory(MONO16), 4096, 1, false)
        .unwrap();
    let events = record_events(&engine, id);

    engine.play(id).unwrap();
    let dev = device_handle(&mock);
    wait_until("completion", || {
        mock.complete(dev, 1);
        events.lock().unwrap().contains(&SourceEvent::Completed)
    });

    // With a ring of one, each refill waits for the previous buffer to be
    // released: 4096 then 1904 samples.
    assert_eq!(mock.upload_count(), 2);
    assert_eq!(engine.offset(id).unwrap(), 6000);
}

#[test]
fn a_second_seek_supersedes_one_still_decoding() {
    let (engine, mock) = engine_with_mock();
    let stream = Arc::new(MemoryStreamSource::new(pcm_bytes(20_000)));
    let id = engine
        .new_streaming_source_with(stream, slow_factory(Duration::from_millis(40)), 2048, 3, false)
        .unwrap();

    engine.play(id).unwrap();
    wait_until("window full", || engine.buffers(id).unwrap().len() == 3);
    engine.pause(id).unwrap();
    let uploads = mock.upload_count();

    // The second seek lands while the first seek's decode is still running
    // and supersedes it.
    engine.set_offset(id, 10_000).unwrap();
    engine.set_offset(id, 4_000).unwrap();
    wait_until("surviving seek lands", || engine.offset(id).unwrap() == 4_000);
    wait_until("jobs drain", || !engine.is_loading(id).unwrap());
    std::thread::sleep(Duration::from_millis(100));

    // The stale outcome was discarded: only the surviving seek's chunk was
    // uploaded and the window starts at its target.
    assert_eq!(mock.upload_count(), uploads + 1);
    assert_eq!(engine.buffers(id).unwrap().len(), 1);
    assert_eq!(engine.offset(id).unwrap(), 4_000);
    assert!(engine.last_error().is_none());
}

#[test]
fn in_window_seek_leaves_a_running_refill_alone() {
    let (engine, mock) = engine_with_mock();
    let stream = Arc::new(MemoryStreamSource::new(pcm_bytes(20_000)));
    let id = engine
        .new_streaming_source_with(stream, slow_factory(Duration::from_millis(40)), 2048, 3, false)
        .unwrap();
    let events = record_events(&engine, id);

    engine.play(id).unwrap();
    wait_until("first buffer", || !engine.buffers(id).unwrap().is_empty());

    // A refill is in flight; the in-window seek only moves the device
    // cursor and must not restart decoding.
    engine.set_offset(id, 500).unwrap();
    assert_eq!(engine.offset(id).unwrap(), 500);

    wait_until("window full", || engine.buffers(id).unwrap().len() == 3);
    assert_eq!(mock.upload_count(), 3);
    let skipped: Vec<usize> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            SourceEvent::LoadingStarted { skipped } => Some(*skipped),
            _ => None,
        })
        .collect();
    assert_eq!(skipped, vec![0, 0, 0]);
}

#[test]
fn at_most_one_decode_job_runs_per_source() {
    let (engine, mock) = engine_with_mock();

    let busy = Arc::new(AtomicBool::new(false));
    let overlapped = Arc::new(AtomicBool::new(false));
    struct GuardedDecoder {
        inner: RawPcmDecoder,
        busy: Arc<AtomicBool>,
        overlapped: Arc<AtomicBool>,
    }
    impl Decoder for GuardedDecoder {
        fn spec(&self) -> PcmSpec {
            self.inner.spec()
        }
        fn total_size(&self) -> i64 {
            self.inner.total_size()
        }
        fn read_chunk(&mut self, max_samples: usize) -> rillaudio::Result<AudioBuffer> {
            if self.busy.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_millis(3));
            let out = self.inner.read_chunk(max_samples);
            self.busy.store(false, Ordering::SeqCst);
            out
        }
        fn read_all(&mut self) -> rillaudio::Result<AudioBuffer> {
            self.inner.read_all()
        }
        fn is_stream_over(&self) -> bool {
            self.inner.is_stream_over()
        }
    }
    let factory: DecoderFactory = {
        let busy = busy.clone();
        let overlapped = overlapped.clone();
        Arc::new(move |stream| {
            Ok(Box::new(GuardedDecoder {
                inner: RawPcmDecoder::new(stream, MONO16),
                busy: busy.clone(),
                overlapped: overlapped.clone(),
            }) as Box<dyn Decoder>)
        })
    };

    let stream = Arc::new(MemoryStreamSource::new(pcm_bytes(4000)));
    let id = engine
        .new_streaming_source_with(stream, factory, 512, 3, true)
        .unwrap();
    engine.play(id).unwrap();

    let dev = device_handle(&mock);
    for round in 0..50 {
        mock.complete(dev, 1);
        match round % 4 {
            0 => engine.pause(id).unwrap(),
            1 => engine.play(id).unwrap(),
            2 => engine.set_volume(id, 0.5).unwrap(),
            _ => engine.play(id).unwrap(),
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    assert!(
        !overlapped.load(Ordering::SeqCst),
        "two decode jobs ran concurrently for one source"
    );
}

#[test]
fn looping_a_consumed_single_use_stream_reports_unreadable() {
    let (engine, mock) = engine_with_mock();
    let stream = Arc::new(SingleStreamSource::new(Box::new(std::io::Cursor::new(
        pcm_bytes(6000),
    ))));
    let id = engine
        .new_streaming_source_with(stream, RawPcmDecoder::factory(MONO16), 4096, 3, true)
        .unwrap();
    engine.play(id).unwrap();

    let dev = device_handle(&mock);
    wait_until("unreadable restart", || {
        mock.complete(dev, 1);
        matches!(engine.last_error(), Some(AudioError::CannotReadStream(_)))
    });

    // The latch stops further decode attempts instead of spinning.
    assert!(!engine.is_loading(id).unwrap());
    let uploads = mock.upload_count();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(mock.upload_count(), uploads);
    assert_eq!(engine.loop_count(id).unwrap(), 0);
}

#[test]
fn looping_streams_restart_and_count() {
    let (engine, mock) = engine_with_mock();
    let stream = Arc::new(MemoryStreamSource::new(pcm_bytes(6000)));
    let id = engine
        .new_streaming_source_with(stream, RawPcmDecoder::factory(MONO16), 4096, 3, true)
        .unwrap();
    let events = record_events(&engine, id);
    assert!(engine.is_looping(id).unwrap());
    engine.play(id).unwrap();

    let dev = device_handle(&mock);
    wait_until("two loops", || {
        mock.complete(dev, 1);
        engine.loop_count(id).unwrap() >= 2
    });
    assert!(
        events
            .lock()
            .unwrap()
            .contains(&SourceEvent::Looped { count: 1 })
    );

    // Disabling looping resets the counter.
    engine.set_looping(id, false).unwrap();
    assert_eq!(engine.loop_count(id).unwrap(), 0);
}

#[test]
fn one_shot_source_completes_and_replays() {
    let (engine, mock) = engine_with_mock();
    let stream = Arc::new(MemoryStreamSource::new(pcm_bytes(1000)));
    let id = engine
        .new_sound_source_with(stream, RawPcmDecoder::factory(MONO16), None, false)
        .unwrap();
    let events = record_events(&engine, id);

    wait_until("decode", || !engine.buffers(id).unwrap().is_empty());
    assert_eq!(mock.uploaded_bytes(), 2000);

    engine.play(id).unwrap();
    assert!(engine.is_playing(id).unwrap());

    let dev = device_handle(&mock);
    mock.complete(dev, 1);
    wait_until("completion", || {
        events.lock().unwrap().contains(&SourceEvent::Completed)
    });
    assert!(!engine.is_playing(id).unwrap());

    // The buffer stays queued, so replay needs no decode.
    assert_eq!(engine.buffers(id).unwrap().len(), 1);
    engine.play(id).unwrap();
    assert!(engine.is_playing(id).unwrap());
    assert_eq!(mock.upload_count(), 1);
}

#[test]
fn manual_source_plays_pushed_buffers() {
    let (engine, mock) = engine_with_mock();
    let id = engine.new_manual_source().unwrap();
    let events = record_events(&engine, id);

    engine.push_buffer(id, pcm_bytes(100), MONO16).unwrap();
    engine.push_buffer(id, pcm_bytes(50), MONO16).unwrap();
    engine.play(id).unwrap();
    assert!(engine.is_playing(id).unwrap());

    let dev = device_handle(&mock);
    mock.complete(dev, 2);
    wait_until("drained", || engine.buffers(id).unwrap().is_empty());
    assert_eq!(engine.offset(id).unwrap(), 0);

    // Intent survives the underrun; the next push resumes playback.
    engine.push_buffer(id, pcm_bytes(25), MONO16).unwrap();
    assert!(engine.is_playing(id).unwrap());

    let processed: usize = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            SourceEvent::BufferProcessed { samples } => Some(*samples),
            _ => None,
        })
        .sum();
    assert_eq!(processed, 150);
}

#[test]
fn push_buffer_rejects_partial_frames() {
    let (engine, _mock) = engine_with_mock();
    let id = engine.new_manual_source().unwrap();
    let err = engine.push_buffer(id, vec![0u8; 3], MONO16).unwrap_err();
    assert!(matches!(err, AudioError::InvalidValue(_)));
    assert!(matches!(
        engine.last_error(),
        Some(AudioError::InvalidValue(_))
    ));
}

#[test]
fn unknown_source_is_recorded_not_fatal() {
    let (engine, _mock) = engine_with_mock();
    engine.play(SourceId::new_v4()).unwrap();
    assert!(matches!(
        engine.last_error(),
        Some(AudioError::UnknownSource(_))
    ));
    assert!(engine.last_error().is_none(), "slot clears on read");
}

#[test]
fn invalid_arguments_are_rejected_before_submission() {
    let (engine, _mock) = engine_with_mock();
    let id = engine.new_manual_source().unwrap();

    assert!(engine.set_volume(id, 1.5).is_err());
    assert!(engine.set_master_volume(-0.1).is_err());
    assert!(engine.set_pitch(id, 3.0).is_err());
    assert!(engine.fade(id, 0.0, 2.0, Duration::from_secs(1)).is_err());
    assert_eq!(engine.volume(id).unwrap(), 1.0, "state was untouched");

    engine.set_pitch(id, 1.5).unwrap();
    assert_eq!(engine.pitch(id).unwrap(), 1.5);
}

#[test]
fn shutdown_is_idempotent_and_commands_fail_afterwards() {
    let (mut engine, mock) = engine_with_mock();
    let id = engine.new_manual_source().unwrap();
    engine.push_buffer(id, pcm_bytes(10), MONO16).unwrap();

    engine.shutdown().unwrap();
    engine.shutdown().unwrap();
    assert!(!engine.is_running());
    assert_eq!(mock.source_count(), 0, "teardown deleted every source");
    assert_eq!(mock.live_buffers(), 0);

    assert!(matches!(
        engine.play(id),
        Err(AudioError::SystemNotRunning)
    ));
}

#[test]
fn decoder_info_appears_after_the_first_decode() {
    let (engine, _mock) = engine_with_mock();
    let stream = Arc::new(MemoryStreamSource::new(pcm_bytes(5000)));
    let id = engine
        .new_streaming_source_with(stream, RawPcmDecoder::factory(MONO16), 1024, 3, false)
        .unwrap();

    wait_until("info", || engine.decoder_info(id).unwrap().is_some());
    let info = engine.decoder_info(id).unwrap().unwrap();
    assert_eq!(info.spec, MONO16);
    assert_eq!(info.total_size, -1);
}
