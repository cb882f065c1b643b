//! The public engine facade.
//!
//! [`AudioEngine`] owns a control thread and forwards every call to it as a
//! command, blocking until the command has executed. Calls are therefore safe
//! from any thread and cheap to reason about: by the time a call returns, the
//! control thread has applied it.

use crate::buffer::{BufferInfo, PcmSpec};
use crate::command::{Command, SourceDesc};
use crate::config::EngineConfig;
use crate::control::{self, ControlParams};
use crate::decoder::{DecoderFactory, DecoderInfo};
use crate::device::{AudioDevice, CpalDevice, DeviceFactory};
use crate::error::{AudioError, ErrorSlot, Result};
use crate::events::SourceEvent;
use crate::pending::PendingSet;
use crate::stream::InputStreamSource;
use crossbeam_channel::{Sender, bounded};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use uuid::Uuid;

/// Stable identifier of a source, valid until the source is deleted.
pub type SourceId = Uuid;

struct Defaults {
    streaming_buffer_size: usize,
    streaming_buffer_count: usize,
    sound_buffer_size: Option<usize>,
    decoder: DecoderFactory,
}

pub struct AudioEngine {
    commands: Arc<PendingSet<Command>>,
    wake: Sender<()>,
    errors: Arc<ErrorSlot>,
    thread: Option<JoinHandle<()>>,
    defaults: Mutex<Defaults>,
}

impl AudioEngine {
    /// Starts the engine on the default output device.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_device_factory(
            config,
            Box::new(|| Ok(Box::new(CpalDevice::new()?) as Box<dyn AudioDevice>)),
        )
    }

    /// Starts the engine on a caller-provided device backend. The factory
    /// runs on the control thread, which then owns the device exclusively.
    pub fn with_device_factory(
        config: EngineConfig,
        device_factory: DeviceFactory,
    ) -> Result<Self> {
        let commands = Arc::new(PendingSet::new());
        let errors = Arc::new(ErrorSlot::new());
        let (wake_tx, wake_rx) = bounded(1);
        let (ready_tx, ready_rx) = bounded(1);

        let defaults = Defaults {
            streaming_buffer_size: config.streaming_buffer_size,
            streaming_buffer_count: config.streaming_buffer_count,
            sound_buffer_size: config.sound_buffer_size,
            decoder: config.default_decoder.clone(),
        };

        let params = ControlParams {
            config,
            device_factory,
            commands: commands.clone(),
            errors: errors.clone(),
            wake_tx: wake_tx.clone(),
            wake_rx,
            ready: ready_tx,
        };
        let thread = std::thread::Builder::new()
            .name("rillaudio-control".into())
            .spawn(move || control::run(params))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(AudioError::SystemNotRunning);
            }
        }

        Ok(Self {
            commands,
            wake: wake_tx,
            errors,
            thread: Some(thread),
            defaults: Mutex::new(defaults),
        })
    }

    fn submit<R>(&self, build: impl FnOnce(Sender<R>) -> Command) -> Result<R> {
        if self.thread.is_none() {
            return Err(AudioError::SystemNotRunning);
        }
        let (reply_tx, reply_rx) = bounded(1);
        self.commands.add(build(reply_tx));
        let _ = self.wake.try_send(());
        reply_rx.recv().map_err(|_| AudioError::SystemNotRunning)
    }

    fn invalid(&self, message: String) -> AudioError {
        self.errors.record(AudioError::InvalidValue(message.clone()));
        AudioError::InvalidValue(message)
    }

    // ------------------------------------------------------------------
    // Source creation
    // ------------------------------------------------------------------

    /// Creates a non-looping streaming source with the engine's current
    /// defaults.
    pub fn new_streaming_source(&self, stream: Arc<dyn InputStreamSource>) -> Result<SourceId> {
        let (factory, size, count) = {
            let d = self.defaults.lock().unwrap();
            (
                d.decoder.clone(),
                d.streaming_buffer_size,
                d.streaming_buffer_count,
            )
        };
        self.new_streaming_source_with(stream, factory, size, count, false)
    }

    /// Creates a streaming source: decoded in `buffer_size`-sample chunks
    /// with a ring of `buffer_count` buffers queued ahead of the play
    /// position.
    pub fn new_streaming_source_with(
        &self,
        stream: Arc<dyn InputStreamSource>,
        factory: DecoderFactory,
        buffer_size: usize,
        buffer_count: usize,
        looping: bool,
    ) -> Result<SourceId> {
        if buffer_size == 0 {
            return Err(self.invalid("streaming buffer size must be positive".into()));
        }
        if buffer_count < 1 {
            return Err(self.invalid("streaming sources need at least one buffer".into()));
        }
        self.submit(|reply| Command::CreateSource {
            desc: SourceDesc::Streaming {
                stream,
                factory,
                buffer_size,
                buffer_count,
                looping,
            },
            reply,
        })?
    }

    /// Creates a non-looping one-shot source with the engine's current
    /// defaults.
    pub fn new_sound_source(&self, stream: Arc<dyn InputStreamSource>) -> Result<SourceId> {
        let (factory, size) = {
            let d = self.defaults.lock().unwrap();
            (d.decoder.clone(), d.sound_buffer_size)
        };
        self.new_sound_source_with(stream, factory, size, false)
    }

    /// Creates a one-shot source decoded into a single buffer. `buffer_size`
    /// caps the decode in samples; `None` takes the whole stream.
    pub fn new_sound_source_with(
        &self,
        stream: Arc<dyn InputStreamSource>,
        factory: DecoderFactory,
        buffer_size: Option<usize>,
        looping: bool,
    ) -> Result<SourceId> {
        if buffer_size == Some(0) {
            return Err(self.invalid("sound buffer size must be positive".into()));
        }
        self.submit(|reply| Command::CreateSource {
            desc: SourceDesc::OneShot {
                stream,
                factory,
                buffer_size,
                looping,
            },
            reply,
        })?
    }

    /// Creates a source fed by [`push_buffer`](Self::push_buffer) instead of
    /// a decoder.
    pub fn new_manual_source(&self) -> Result<SourceId> {
        self.submit(|reply| Command::CreateSource {
            desc: SourceDesc::Manual,
            reply,
        })?
    }

    pub fn delete_source(&self, id: SourceId) -> Result<()> {
        self.submit(|reply| Command::DeleteSource { id, reply })
    }

    // ------------------------------------------------------------------
    // Playback
    // ------------------------------------------------------------------

    pub fn play(&self, id: SourceId) -> Result<()> {
        self.submit(|reply| Command::Play { id, reply })
    }

    /// Toggles: pauses a playing source keeping its position, resumes a
    /// paused one.
    pub fn pause(&self, id: SourceId) -> Result<()> {
        self.submit(|reply| Command::Pause { id, reply })
    }

    /// Halts playback and releases the queued window. For streaming sources
    /// a later `play` resumes from the decode position, not the beginning.
    pub fn stop(&self, id: SourceId) -> Result<()> {
        self.submit(|reply| Command::Stop { id, reply })
    }

    pub fn is_playing(&self, id: SourceId) -> Result<bool> {
        self.submit(|reply| Command::IsPlaying { id, reply })
    }

    /// True while a decode job is out for this source.
    pub fn is_loading(&self, id: SourceId) -> Result<bool> {
        self.submit(|reply| Command::IsLoading { id, reply })
    }

    // ------------------------------------------------------------------
    // Volume, pitch, fades
    // ------------------------------------------------------------------

    /// Sets the source's relative volume in `[0, 1]`. The device gain is the
    /// product of this and the master volume.
    pub fn set_volume(&self, id: SourceId, volume: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(self.invalid(format!("volume {volume} outside [0, 1]")));
        }
        self.submit(|reply| Command::SetVolume { id, volume, reply })
    }

    pub fn volume(&self, id: SourceId) -> Result<f32> {
        self.submit(|reply| Command::GetVolume { id, reply })
    }

    pub fn set_master_volume(&self, volume: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(self.invalid(format!("master volume {volume} outside [0, 1]")));
        }
        self.submit(|reply| Command::SetMasterVolume { volume, reply })
    }

    pub fn master_volume(&self) -> Result<f32> {
        self.submit(|reply| Command::GetMasterVolume { reply })
    }

    /// Pitch in `[0.5, 2.0]`; also scales playback speed.
    pub fn set_pitch(&self, id: SourceId, pitch: f32) -> Result<()> {
        if !(0.5..=2.0).contains(&pitch) {
            return Err(self.invalid(format!("pitch {pitch} outside [0.5, 2.0]")));
        }
        self.submit(|reply| Command::SetPitch { id, pitch, reply })
    }

    pub fn pitch(&self, id: SourceId) -> Result<f32> {
        self.submit(|reply| Command::GetPitch { id, reply })
    }

    /// Ramps the source's relative volume linearly from `from` to `to` over
    /// `duration`. A later fade or explicit `set_volume` replaces it.
    pub fn fade(&self, id: SourceId, from: f32, to: f32, duration: Duration) -> Result<()> {
        for value in [from, to] {
            if !(0.0..=1.0).contains(&value) {
                return Err(self.invalid(format!("fade volume {value} outside [0, 1]")));
            }
        }
        self.submit(|reply| Command::Fade {
            id,
            from,
            to,
            duration,
            reply,
        })
    }

    // ------------------------------------------------------------------
    // Position and looping
    // ------------------------------------------------------------------

    /// Seeks to an absolute position, in samples from the stream start.
    pub fn set_offset(&self, id: SourceId, samples: usize) -> Result<()> {
        self.submit(|reply| Command::SetOffset { id, samples, reply })
    }

    /// Current position, in samples from the stream start.
    pub fn offset(&self, id: SourceId) -> Result<usize> {
        self.submit(|reply| Command::GetOffset { id, reply })
    }

    pub fn set_looping(&self, id: SourceId, looping: bool) -> Result<()> {
        self.submit(|reply| Command::SetLooping { id, looping, reply })
    }

    pub fn is_looping(&self, id: SourceId) -> Result<bool> {
        self.submit(|reply| Command::IsLooping { id, reply })
    }

    /// Completed loops since looping was last enabled. Reset by
    /// `set_looping(id, false)`, not by `stop`.
    pub fn loop_count(&self, id: SourceId) -> Result<u32> {
        self.submit(|reply| Command::LoopCount { id, reply })
    }

    // ------------------------------------------------------------------
    // Introspection and manual feeding
    // ------------------------------------------------------------------

    /// Snapshot of the source's queued buffers, oldest first.
    pub fn buffers(&self, id: SourceId) -> Result<Vec<BufferInfo>> {
        self.submit(|reply| Command::BufferSnapshot { id, reply })
    }

    /// Format and total size reported by the source's decoder; `None` until
    /// the first decode completes.
    pub fn decoder_info(&self, id: SourceId) -> Result<Option<DecoderInfo>> {
        self.submit(|reply| Command::GetDecoderInfo { id, reply })
    }

    /// Queues raw PCM on a manual source.
    pub fn push_buffer(&self, id: SourceId, pcm: Vec<u8>, spec: PcmSpec) -> Result<()> {
        if spec.frame_size() == 0 {
            return Err(self.invalid("zero-sized PCM frames".into()));
        }
        if pcm.len() % spec.frame_size() != 0 {
            return Err(self.invalid(format!(
                "PCM length {} is not a whole number of {}-byte frames",
                pcm.len(),
                spec.frame_size()
            )));
        }
        self.submit(|reply| Command::PushBuffer {
            id,
            pcm,
            spec,
            reply,
        })
    }

    /// Registers a callback invoked on the control thread for this source's
    /// events. Keep it cheap.
    pub fn register_callback(
        &self,
        id: SourceId,
        callback: impl FnMut(SourceId, &SourceEvent) + Send + 'static,
    ) -> Result<()> {
        self.submit(|reply| Command::RegisterCallback {
            id,
            callback: Box::new(callback),
            reply,
        })
    }

    /// Live source ids, in creation order.
    pub fn sources(&self) -> Result<Vec<SourceId>> {
        self.submit(|reply| Command::Sources { reply })
    }

    /// Takes the last recorded asynchronous error, clearing the slot.
    pub fn last_error(&self) -> Option<AudioError> {
        self.errors.take()
    }

    // ------------------------------------------------------------------
    // Defaults
    // ------------------------------------------------------------------

    /// Changes the buffering defaults applied to sources created after this
    /// call. Existing sources keep their settings.
    pub fn set_default_streaming_buffer(&self, size: usize, count: usize) -> Result<()> {
        if size == 0 {
            return Err(self.invalid("streaming buffer size must be positive".into()));
        }
        if count < 1 {
            return Err(self.invalid("streaming sources need at least one buffer".into()));
        }
        let mut d = self.defaults.lock().unwrap();
        d.streaming_buffer_size = size;
        d.streaming_buffer_count = count;
        Ok(())
    }

    pub fn set_default_sound_buffer_size(&self, samples: Option<usize>) -> Result<()> {
        if samples == Some(0) {
            return Err(self.invalid("sound buffer size must be positive".into()));
        }
        self.defaults.lock().unwrap().sound_buffer_size = samples;
        Ok(())
    }

    pub fn set_default_decoder(&self, factory: DecoderFactory) {
        self.defaults.lock().unwrap().decoder = factory;
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Deletes every source, stops the workers and joins the control thread.
    /// Idempotent; also invoked by `Drop`.
    pub fn shutdown(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        let (reply_tx, reply_rx) = bounded(1);
        self.commands.add(Command::Shutdown { reply: reply_tx });
        let _ = self.wake.try_send(());
        let _ = reply_rx.recv();
        thread
            .join()
            .map_err(|_| AudioError::Device("control thread panicked".into()))
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("shutdown failed: {e}");
        }
    }
}
