//! The control thread.
//!
//! The device backend is thread-hostile, so exactly one thread ever touches
//! it. That thread runs the loop below: poll the device for consumed buffers,
//! apply decode outcomes, execute queued commands, advance fades, and sleep
//! until the next refresh or an explicit wake.

use crate::buffer::{AudioBuffer, BufferInfo};
use crate::command::{Command, SourceDesc};
use crate::config::EngineConfig;
use crate::decoder::DecoderInfo;
use crate::device::{AudioDevice, DeviceFactory};
use crate::engine::SourceId;
use crate::error::{AudioError, ErrorSlot, Result};
use crate::events::SourceEvent;
use crate::fade::FadeJob;
use crate::pending::PendingSet;
use crate::source::{Source, SourceKind};
use crate::worker::{DecodeJob, DecodeOutcome, DecodePool};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

pub(crate) struct ControlParams {
    pub config: EngineConfig,
    pub device_factory: DeviceFactory,
    pub commands: Arc<PendingSet<Command>>,
    pub errors: Arc<ErrorSlot>,
    pub wake_tx: Sender<()>,
    pub wake_rx: Receiver<()>,
    /// Startup handshake; carries the first device or pool failure back to
    /// the constructor.
    pub ready: Sender<Result<()>>,
}

/// Body of the control thread. Returns when a shutdown command lands.
pub(crate) fn run(params: ControlParams) {
    let ControlParams {
        config,
        device_factory,
        commands,
        errors,
        wake_tx,
        wake_rx,
        ready,
    } = params;

    // The device must be constructed on the thread that will use it.
    let device = match device_factory() {
        Ok(device) => device,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let (outcome_tx, outcome_rx) = unbounded();
    let pool = match DecodePool::new(config.decode_workers, outcome_tx, wake_tx.clone()) {
        Ok(pool) => pool,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));
    log::info!("control thread started ({} decode workers)", config.decode_workers);

    let refresh_period = config.refresh_period;
    let mut state = ControlState {
        device,
        pool: Some(pool),
        sources: Vec::new(),
        fades: Vec::new(),
        master_volume: 1.0,
        errors,
        running: true,
    };

    let mut next_refresh = Instant::now();
    while state.running {
        let now = Instant::now();
        if now >= next_refresh {
            state.poll_sources();
            state.advance_fades(now);
            state.emit_ticks();
            next_refresh = now + refresh_period;
        }
        while let Ok(outcome) = outcome_rx.try_recv() {
            state.apply_outcome(outcome);
        }
        state.drain_commands(&commands);
        if !state.running {
            break;
        }
        let timeout = next_refresh.saturating_duration_since(Instant::now());
        let _ = wake_rx.recv_timeout(timeout);
    }

    state.teardown();
    log::info!("control thread stopped");
}

fn note<T>(errors: &ErrorSlot, result: Result<T>) {
    if let Err(e) = result {
        errors.record(e);
    }
}

struct ControlState {
    device: Box<dyn AudioDevice>,
    pool: Option<DecodePool>,
    sources: Vec<Source>,
    fades: Vec<FadeJob>,
    master_volume: f32,
    errors: Arc<ErrorSlot>,
    running: bool,
}

impl ControlState {
    fn find(&self, id: SourceId) -> Option<usize> {
        self.sources.iter().position(|s| s.id == id)
    }

    fn find_or_note(&self, id: SourceId) -> Option<usize> {
        let idx = self.find(id);
        if idx.is_none() {
            self.errors.record(AudioError::UnknownSource(id));
        }
        idx
    }

    // ------------------------------------------------------------------
    // Polling pass
    // ------------------------------------------------------------------

    fn poll_sources(&mut self) {
        for i in 0..self.sources.len() {
            match self.sources[i].kind {
                SourceKind::OneShot { .. } => self.poll_one_shot(i),
                SourceKind::Streaming { .. } => self.poll_streaming(i),
                SourceKind::Manual => self.release_processed(i),
            }
        }
    }

    /// One-shot buffers stay queued for replay; completion is the device
    /// stopping on its own.
    fn poll_one_shot(&mut self, i: usize) {
        let handle = self.sources[i].handle;
        let src = &mut self.sources[i];
        if src.should_play
            && !src.in_flight
            && !src.looping
            && !src.queue.is_empty()
            && !self.device.is_playing(handle)
        {
            src.should_play = false;
            src.emit(&SourceEvent::Completed);
        }
    }

    fn poll_streaming(&mut self, i: usize) {
        self.release_processed(i);

        if self.sources[i].wants_decode() {
            self.schedule_decode(i, 0, false);
        } else {
            let src = &mut self.sources[i];
            if src.should_play
                && src.stream_over
                && !src.looping
                && !src.in_flight
                && src.queue.is_empty()
            {
                src.should_play = false;
                src.emit(&SourceEvent::Completed);
            }
        }

        // Resume after an underrun once data is queued again.
        let src = &self.sources[i];
        if src.should_play && !src.queue.is_empty() && !self.device.is_playing(src.handle) {
            note(&self.errors, self.device.play(src.handle));
        }
    }

    /// Unqueues every buffer the device has finished with and releases it.
    fn release_processed(&mut self, i: usize) {
        let handle = self.sources[i].handle;
        loop {
            let popped = match self.device.unqueue_buffer(handle) {
                Ok(Some(h)) => h,
                Ok(None) => break,
                Err(e) => {
                    self.errors.record(e);
                    break;
                }
            };
            let src = &mut self.sources[i];
            if let Some(buffer) = src.queue.pop_front() {
                debug_assert_eq!(buffer.device_handle(), Some(popped));
                let samples = buffer.samples();
                src.consumed_samples += samples;
                src.emit(&SourceEvent::BufferProcessed { samples });
            }
            note(&self.errors, self.device.delete_buffer(popped));
        }
    }

    // ------------------------------------------------------------------
    // Decode scheduling and outcomes
    // ------------------------------------------------------------------

    fn schedule_decode(&mut self, i: usize, to_skip: usize, seek: bool) {
        let src = &mut self.sources[i];
        let (Some(stream), Some(factory)) = (src.stream.clone(), src.factory.clone()) else {
            return;
        };
        let buffer_size = match src.kind {
            SourceKind::Streaming { buffer_size, .. } => Some(buffer_size),
            SourceKind::OneShot { buffer_size } => buffer_size,
            SourceKind::Manual => return,
        };

        src.in_flight = true;
        src.seek_in_flight = seek;
        let job = DecodeJob {
            source_id: src.id,
            generation: src.generation,
            to_skip,
            decoder: src.decoder.take(),
            stream,
            factory,
            buffer_size,
            restart_at_end: src.looping && src.is_streaming(),
        };
        src.emit(&SourceEvent::LoadingStarted { skipped: to_skip });
        if let Some(pool) = &self.pool {
            pool.submit(job);
        }
    }

    fn apply_outcome(&mut self, outcome: DecodeOutcome) {
        let Some(i) = self.find(outcome.source_id) else {
            log::debug!("dropping outcome for deleted source {}", outcome.source_id);
            return;
        };
        if outcome.generation != self.sources[i].generation {
            // Superseded by a seek; a current-generation job is still out, so
            // in_flight stays set.
            return;
        }
        let was_seek = self.sources[i].seek_in_flight;
        self.sources[i].in_flight = false;
        self.sources[i].seek_in_flight = false;

        let chunk = match outcome.result {
            Ok(chunk) => chunk,
            Err(e) => {
                if matches!(e, AudioError::CannotReadStream(_)) {
                    self.sources[i].unreadable = true;
                }
                self.errors.record(e);
                return;
            }
        };

        let handle = self.sources[i].handle;
        {
            let src = &mut self.sources[i];
            src.info = Some(DecoderInfo::of(chunk.decoder.as_ref()));
            src.stream_over = chunk.decoder.is_stream_over();
            src.decoder = Some(chunk.decoder);
            if chunk.restarted {
                src.loop_count += 1;
                let count = src.loop_count;
                src.emit(&SourceEvent::Looped { count });
            }
        }

        if was_seek {
            // Seek landing: everything queued belongs before the skip point.
            note(&self.errors, self.device.stop(handle));
            self.release_all(i);
            self.sources[i].consumed_samples = outcome.to_skip;
        }

        if !chunk.buffer.is_empty() {
            self.upload(i, chunk.buffer);
        }

        let src = &self.sources[i];
        if src.should_play && !src.queue.is_empty() && !self.device.is_playing(handle) {
            note(&self.errors, self.device.play(handle));
        }
        if self.sources[i].wants_decode() {
            self.schedule_decode(i, 0, false);
        }
    }

    /// Uploads a decoded buffer, queues it on the device and appends it to
    /// the source's window.
    fn upload(&mut self, i: usize, mut buffer: AudioBuffer) {
        let handle = self.sources[i].handle;
        match self.device.create_buffer(buffer.bytes(), buffer.spec()) {
            Ok(device_buffer) => {
                buffer.set_device_handle(device_buffer);
                note(&self.errors, self.device.queue_buffer(handle, device_buffer));
                let samples = buffer.samples();
                let src = &mut self.sources[i];
                src.queue.push_back(buffer);
                src.emit(&SourceEvent::BufferLoaded { samples });
            }
            Err(e) => self.errors.record(e),
        }
    }

    /// Stops must precede this; a stopped source reports its whole queue
    /// processed, so the drain below takes everything.
    fn release_all(&mut self, i: usize) {
        let handle = self.sources[i].handle;
        loop {
            match self.device.unqueue_buffer(handle) {
                Ok(Some(device_buffer)) => {
                    note(&self.errors, self.device.delete_buffer(device_buffer))
                }
                Ok(None) => break,
                Err(e) => {
                    self.errors.record(e);
                    break;
                }
            }
        }
        self.sources[i].queue.clear();
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn drain_commands(&mut self, commands: &PendingSet<Command>) {
        let drained: Vec<Command> = commands.snapshot().drain(..).collect();
        for command in drained {
            log::trace!("command: {}", command.name());
            self.handle_command(command);
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::CreateSource { desc, reply } => {
                let _ = reply.send(self.create_source(desc));
            }
            Command::DeleteSource { id, reply } => {
                if let Some(i) = self.find_or_note(id) {
                    self.teardown_source(i);
                }
                let _ = reply.send(());
            }
            Command::Play { id, reply } => {
                if let Some(i) = self.find_or_note(id) {
                    self.resume(i);
                }
                let _ = reply.send(());
            }
            Command::Pause { id, reply } => {
                // Toggles: a paused source resumes, a playing one pauses in
                // place.
                if let Some(i) = self.find_or_note(id) {
                    if self.sources[i].should_play {
                        let src = &mut self.sources[i];
                        src.should_play = false;
                        note(&self.errors, self.device.pause(src.handle));
                    } else {
                        self.resume(i);
                    }
                }
                let _ = reply.send(());
            }
            Command::Stop { id, reply } => {
                if let Some(i) = self.find_or_note(id) {
                    let src = &mut self.sources[i];
                    src.should_play = false;
                    note(&self.errors, self.device.stop(src.handle));
                }
                let _ = reply.send(());
            }
            Command::SetVolume { id, volume, reply } => {
                if let Some(i) = self.find_or_note(id) {
                    self.sources[i].volume = volume;
                    let handle = self.sources[i].handle;
                    let gain = self.master_volume * volume;
                    note(&self.errors, self.device.set_gain(handle, gain));
                    // An explicit set wins over a running fade.
                    self.fades.retain(|f| f.source_id != id);
                }
                let _ = reply.send(());
            }
            Command::GetVolume { id, reply } => {
                let volume = self.find_or_note(id).map_or(0.0, |i| self.sources[i].volume);
                let _ = reply.send(volume);
            }
            Command::SetPitch { id, pitch, reply } => {
                if let Some(i) = self.find_or_note(id) {
                    let handle = self.sources[i].handle;
                    note(&self.errors, self.device.set_pitch(handle, pitch));
                }
                let _ = reply.send(());
            }
            Command::GetPitch { id, reply } => {
                let pitch = self
                    .find_or_note(id)
                    .map_or(1.0, |i| self.device.pitch(self.sources[i].handle));
                let _ = reply.send(pitch);
            }
            Command::SetMasterVolume { volume, reply } => {
                self.master_volume = volume;
                for i in 0..self.sources.len() {
                    let handle = self.sources[i].handle;
                    let gain = volume * self.sources[i].volume;
                    note(&self.errors, self.device.set_gain(handle, gain));
                }
                let _ = reply.send(());
            }
            Command::GetMasterVolume { reply } => {
                let _ = reply.send(self.master_volume);
            }
            Command::SetOffset { id, samples, reply } => {
                if let Some(i) = self.find_or_note(id) {
                    self.seek(i, samples);
                }
                let _ = reply.send(());
            }
            Command::GetOffset { id, reply } => {
                let mut offset = 0;
                if let Some(i) = self.find_or_note(id) {
                    let src = &self.sources[i];
                    offset = self.device.sample_offset(src.handle);
                    if src.is_streaming() {
                        offset += src.consumed_samples;
                    }
                }
                let _ = reply.send(offset);
            }
            Command::SetLooping { id, looping, reply } => {
                if let Some(i) = self.find_or_note(id) {
                    let src = &mut self.sources[i];
                    src.looping = looping;
                    src.unreadable = false;
                    if !looping {
                        src.loop_count = 0;
                    }
                    if src.is_one_shot() || src.is_manual() {
                        // Non-streaming sources loop at the device level.
                        note(&self.errors, self.device.set_looping(src.handle, looping));
                    }
                }
                let _ = reply.send(());
            }
            Command::IsLooping { id, reply } => {
                let looping = self
                    .find_or_note(id)
                    .is_some_and(|i| self.sources[i].looping);
                let _ = reply.send(looping);
            }
            Command::LoopCount { id, reply } => {
                let count = self.find_or_note(id).map_or(0, |i| self.sources[i].loop_count);
                let _ = reply.send(count);
            }
            Command::IsPlaying { id, reply } => {
                let mut playing = false;
                if let Some(i) = self.find_or_note(id) {
                    let src = &self.sources[i];
                    // A deferred start counts: intent is set and the first
                    // buffer is on its way.
                    playing = self.device.is_playing(src.handle)
                        || (src.should_play && src.in_flight && src.queue.is_empty());
                }
                let _ = reply.send(playing);
            }
            Command::IsLoading { id, reply } => {
                let loading = self
                    .find_or_note(id)
                    .is_some_and(|i| self.sources[i].in_flight);
                let _ = reply.send(loading);
            }
            Command::BufferSnapshot { id, reply } => {
                let buffers = self.find_or_note(id).map_or_else(Vec::new, |i| {
                    self.sources[i].queue.iter().map(BufferInfo::from).collect()
                });
                let _ = reply.send(buffers);
            }
            Command::GetDecoderInfo { id, reply } => {
                let info = self.find_or_note(id).and_then(|i| self.sources[i].info);
                let _ = reply.send(info);
            }
            Command::PushBuffer {
                id,
                pcm,
                spec,
                reply,
            } => {
                if let Some(i) = self.find_or_note(id) {
                    if self.sources[i].is_manual() {
                        let len = pcm.len();
                        self.upload(i, AudioBuffer::new(pcm, len, spec));
                        let src = &self.sources[i];
                        if src.should_play && !self.device.is_playing(src.handle) {
                            note(&self.errors, self.device.play(src.handle));
                        }
                    } else {
                        self.errors.record(AudioError::InvalidValue(
                            "push_buffer requires a manual source".into(),
                        ));
                    }
                }
                let _ = reply.send(());
            }
            Command::Fade {
                id,
                from,
                to,
                duration,
                reply,
            } => {
                if self.find_or_note(id).is_some() {
                    self.fades.retain(|f| f.source_id != id);
                    self.fades.push(FadeJob::new(id, from, to, duration));
                }
                let _ = reply.send(());
            }
            Command::RegisterCallback {
                id,
                callback,
                reply,
            } => {
                if let Some(i) = self.find_or_note(id) {
                    self.sources[i].callbacks.push(callback);
                }
                let _ = reply.send(());
            }
            Command::Sources { reply } => {
                let _ = reply.send(self.sources.iter().map(|s| s.id).collect());
            }
            Command::Shutdown { reply } => {
                self.running = false;
                let _ = reply.send(());
            }
        }
    }

    fn resume(&mut self, i: usize) {
        self.sources[i].should_play = true;
        let src = &self.sources[i];
        if !src.queue.is_empty() {
            note(&self.errors, self.device.play(src.handle));
        }
        // Empty queue: playback starts when the next buffer lands.
        if self.sources[i].wants_decode() {
            self.schedule_decode(i, 0, false);
        }
    }

    fn create_source(&mut self, desc: SourceDesc) -> Result<SourceId> {
        let handle = self.device.create_source()?;
        let id = Uuid::new_v4();
        let (mut source, looping) = match desc {
            SourceDesc::Streaming {
                stream,
                factory,
                buffer_size,
                buffer_count,
                looping,
            } => (
                Source::new(
                    id,
                    handle,
                    SourceKind::Streaming {
                        buffer_size,
                        buffer_count,
                    },
                    Some(stream),
                    Some(factory),
                ),
                looping,
            ),
            SourceDesc::OneShot {
                stream,
                factory,
                buffer_size,
                looping,
            } => (
                Source::new(
                    id,
                    handle,
                    SourceKind::OneShot { buffer_size },
                    Some(stream),
                    Some(factory),
                ),
                looping,
            ),
            SourceDesc::Manual => (Source::new(id, handle, SourceKind::Manual, None, None), false),
        };
        source.looping = looping;
        if looping && source.is_one_shot() {
            note(&self.errors, self.device.set_looping(handle, true));
        }
        note(&self.errors, self.device.set_gain(handle, self.master_volume));
        self.sources.push(source);

        // Prefetch the first buffer so play starts promptly.
        let i = self.sources.len() - 1;
        if !self.sources[i].is_manual() {
            self.schedule_decode(i, 0, false);
        }
        log::debug!("created source {id}");
        Ok(id)
    }

    fn teardown_source(&mut self, i: usize) {
        let id = self.sources[i].id;
        let handle = self.sources[i].handle;
        note(&self.errors, self.device.stop(handle));
        self.release_all(i);
        note(&self.errors, self.device.delete_source(handle));
        self.fades.retain(|f| f.source_id != id);
        self.sources.remove(i);
        log::debug!("deleted source {id}");
    }

    /// Seeks to `target` samples from the stream start.
    fn seek(&mut self, i: usize, target: usize) {
        let handle = self.sources[i].handle;
        if !self.sources[i].is_streaming() {
            note(&self.errors, self.device.set_sample_offset(handle, target));
            return;
        }

        let src = &mut self.sources[i];
        src.unreadable = false;
        let window_start = src.consumed_samples;
        let window_end = window_start + src.queued_samples();
        if !src.seek_in_flight && target >= window_start && target < window_end {
            // Still queued: just move the device cursor.
            note(
                &self.errors,
                self.device.set_sample_offset(handle, target - window_start),
            );
            return;
        }

        // Outside the window (or the window itself is in motion): re-decode
        // from the stream start, discarding whatever job is out.
        let retrievable = src.stream.as_ref().is_some_and(|s| s.can_be_retrieved());
        if !retrievable {
            self.errors.record(AudioError::CannotReadStream(
                "stream cannot be reopened for seeking".into(),
            ));
            return;
        }
        src.generation += 1;
        src.stream_over = false;
        src.decoder = None;
        self.schedule_decode(i, target, true);
    }

    // ------------------------------------------------------------------
    // Fades and callbacks
    // ------------------------------------------------------------------

    fn advance_fades(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.fades.len() {
            let (id, value, done) = {
                let fade = &self.fades[i];
                (fade.source_id, fade.value_at(now), fade.finished(now))
            };
            match self.find(id) {
                Some(s) => {
                    self.sources[s].volume = value;
                    let handle = self.sources[s].handle;
                    let gain = self.master_volume * value;
                    note(&self.errors, self.device.set_gain(handle, gain));
                    if done {
                        self.fades.remove(i);
                    } else {
                        i += 1;
                    }
                }
                None => {
                    self.fades.remove(i);
                }
            }
        }
    }

    fn emit_ticks(&mut self) {
        for src in &mut self.sources {
            if !src.callbacks.is_empty() {
                src.emit(&SourceEvent::Tick);
            }
        }
    }

    fn teardown(&mut self) {
        while !self.sources.is_empty() {
            self.teardown_source(self.sources.len() - 1);
        }
        if let Some(pool) = self.pool.take() {
            pool.shutdown();
        }
    }
}
