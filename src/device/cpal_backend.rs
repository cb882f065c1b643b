//! Output backend on top of cpal.
//!
//! Buffers are decoded PCM converted to f32 at upload. A voice walks its
//! buffer queue with a fractional frame cursor; the cursor step folds the
//! source/output rate ratio and the pitch factor together, so pitch also
//! changes playback speed.

use super::{AudioDevice, BufferHandle, SourceHandle};
use crate::buffer::PcmSpec;
use crate::error::{AudioError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SizedSample};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

struct RenderBuffer {
    samples: Vec<f32>,
    channels: usize,
    sample_rate: u32,
}

impl RenderBuffer {
    fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels
        }
    }
}

struct Voice {
    queue: VecDeque<BufferHandle>,
    /// Finished buffers at the front of the queue, not yet unqueued.
    processed: usize,
    playing: bool,
    looping: bool,
    gain: f32,
    pitch: f32,
    /// Queue index of the buffer under the cursor.
    cursor_buf: usize,
    /// Fractional frame position within the current buffer.
    cursor_frame: f64,
    sample_rate: u32,
}

impl Voice {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            processed: 0,
            playing: false,
            looping: false,
            gain: 1.0,
            pitch: 1.0,
            cursor_buf: 0,
            cursor_frame: 0.0,
            sample_rate: 0,
        }
    }
}

#[derive(Default)]
struct RenderState {
    voices: HashMap<SourceHandle, Voice>,
    buffers: HashMap<BufferHandle, Arc<RenderBuffer>>,
}

pub struct CpalDevice {
    state: Arc<Mutex<RenderState>>,
    _stream: cpal::Stream,
    out_rate: u32,
    next_source: u32,
    next_buffer: u32,
}

impl CpalDevice {
    /// Opens the default output device and starts its stream.
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| AudioError::Device("no default output device available".into()))?;
        let default_config = device
            .default_output_config()
            .map_err(|e| AudioError::Device(format!("failed to get default config: {e}")))?;

        let config: cpal::StreamConfig = default_config.config();
        let out_rate = config.sample_rate.0;
        let out_channels = config.channels as usize;
        let state = Arc::new(Mutex::new(RenderState::default()));

        let stream = match default_config.sample_format() {
            cpal::SampleFormat::F32 => {
                create_stream::<f32>(&device, &config, state.clone(), out_rate, out_channels)?
            }
            cpal::SampleFormat::I16 => {
                create_stream::<i16>(&device, &config, state.clone(), out_rate, out_channels)?
            }
            cpal::SampleFormat::U16 => {
                create_stream::<u16>(&device, &config, state.clone(), out_rate, out_channels)?
            }
            other => {
                return Err(AudioError::Device(format!(
                    "unsupported sample format {other}"
                )));
            }
        };

        stream
            .play()
            .map_err(|e| AudioError::Device(format!("failed to start stream: {e}")))?;
        log::info!("output stream open: {out_rate} Hz, {out_channels} channels");

        Ok(Self {
            state,
            _stream: stream,
            out_rate,
            next_source: 0,
            next_buffer: 0,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RenderState> {
        // A panic inside the render callback is already fatal for playback.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn with_voice<R>(
        &mut self,
        source: SourceHandle,
        f: impl FnOnce(&mut Voice) -> R,
    ) -> Result<R> {
        let mut state = self.lock();
        let voice = state.voices.get_mut(&source).ok_or_else(|| {
            AudioError::Device(format!("unknown device source {source:?}"))
        })?;
        Ok(f(voice))
    }

    fn read_voice<R: Default>(&self, source: SourceHandle, f: impl FnOnce(&Voice) -> R) -> R {
        let state = self.lock();
        state.voices.get(&source).map(f).unwrap_or_default()
    }
}

fn create_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    state: Arc<Mutex<RenderState>>,
    out_rate: u32,
    out_channels: usize,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let mut scratch: Vec<f32> = Vec::new();

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.clear();
                scratch.resize(data.len(), 0.0);

                // Never block the render thread on the control thread.
                if let Ok(mut state) = state.try_lock() {
                    render(&mut state, &mut scratch, out_channels, out_rate);
                }

                for (out, mixed) in data.iter_mut().zip(scratch.iter()) {
                    *out = T::from_sample(*mixed);
                }
            },
            move |err| {
                log::error!("audio stream error: {err}");
            },
            None,
        )
        .map_err(|e| AudioError::Device(format!("failed to build stream: {e}")))?;

    Ok(stream)
}

/// Mixes every playing voice into `out` (interleaved, `out_channels` wide).
fn render(state: &mut RenderState, out: &mut [f32], out_channels: usize, out_rate: u32) {
    let RenderState { voices, buffers } = state;
    let frames = out.len() / out_channels;

    for voice in voices.values_mut() {
        if !voice.playing || voice.queue.is_empty() {
            continue;
        }
        let step = voice.sample_rate as f64 / out_rate as f64 * voice.pitch as f64;

        'frames: for frame in 0..frames {
            let buffer = loop {
                let Some(handle) = voice.queue.get(voice.cursor_buf) else {
                    voice.playing = false;
                    break 'frames;
                };
                let Some(buffer) = buffers.get(handle) else {
                    voice.playing = false;
                    break 'frames;
                };
                if (voice.cursor_frame as usize) < buffer.frames() {
                    break buffer;
                }
                voice.cursor_frame -= buffer.frames() as f64;
                if !advance_buffer(voice) {
                    break 'frames;
                }
            };

            let src_frame = voice.cursor_frame as usize;
            let base = src_frame * buffer.channels;
            for ch in 0..out_channels {
                let src_ch = ch.min(buffer.channels - 1);
                out[frame * out_channels + ch] += buffer.samples[base + src_ch] * voice.gain;
            }
            voice.cursor_frame += step;
        }
    }
}

/// Moves the cursor to the next buffer in the queue. Returns false when the
/// voice ran out of data and stopped.
fn advance_buffer(voice: &mut Voice) -> bool {
    if voice.cursor_buf + 1 < voice.queue.len() {
        if !voice.looping {
            voice.processed = voice.processed.max(voice.cursor_buf + 1);
        }
        voice.cursor_buf += 1;
        true
    } else if voice.looping {
        voice.cursor_buf = 0;
        true
    } else {
        voice.processed = voice.queue.len();
        voice.playing = false;
        voice.cursor_frame = 0.0;
        voice.cursor_buf = 0;
        false
    }
}

fn pcm_to_f32(pcm: &[u8], spec: PcmSpec) -> Result<Vec<f32>> {
    match spec.bits_per_sample {
        16 => Ok(pcm
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
            .collect()),
        8 => Ok(pcm.iter().map(|&b| (b as f32 - 128.0) / 128.0).collect()),
        bits => Err(AudioError::Device(format!(
            "unsupported sample width: {bits} bits"
        ))),
    }
}

impl AudioDevice for CpalDevice {
    fn create_source(&mut self) -> Result<SourceHandle> {
        self.next_source += 1;
        let handle = SourceHandle(self.next_source);
        self.lock().voices.insert(handle, Voice::new());
        Ok(handle)
    }

    fn delete_source(&mut self, source: SourceHandle) -> Result<()> {
        self.lock()
            .voices
            .remove(&source)
            .map(|_| ())
            .ok_or_else(|| AudioError::Device(format!("unknown device source {source:?}")))
    }

    fn create_buffer(&mut self, pcm: &[u8], spec: PcmSpec) -> Result<BufferHandle> {
        let samples = pcm_to_f32(pcm, spec)?;
        self.next_buffer += 1;
        let handle = BufferHandle(self.next_buffer);
        self.lock().buffers.insert(
            handle,
            Arc::new(RenderBuffer {
                samples,
                channels: spec.channels.max(1) as usize,
                sample_rate: spec.sample_rate,
            }),
        );
        Ok(handle)
    }

    fn delete_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        self.lock()
            .buffers
            .remove(&buffer)
            .map(|_| ())
            .ok_or_else(|| AudioError::Device(format!("unknown device buffer {buffer:?}")))
    }

    fn queue_buffer(&mut self, source: SourceHandle, buffer: BufferHandle) -> Result<()> {
        let mut state = self.lock();
        let rate = state
            .buffers
            .get(&buffer)
            .map(|b| b.sample_rate)
            .ok_or_else(|| AudioError::Device(format!("unknown device buffer {buffer:?}")))?;
        let voice = state.voices.get_mut(&source).ok_or_else(|| {
            AudioError::Device(format!("unknown device source {source:?}"))
        })?;
        voice.sample_rate = rate;
        voice.queue.push_back(buffer);
        Ok(())
    }

    fn unqueue_buffer(&mut self, source: SourceHandle) -> Result<Option<BufferHandle>> {
        self.with_voice(source, |voice| {
            if voice.processed == 0 {
                return None;
            }
            voice.processed -= 1;
            voice.cursor_buf = voice.cursor_buf.saturating_sub(1);
            voice.queue.pop_front()
        })
    }

    fn play(&mut self, source: SourceHandle) -> Result<()> {
        self.with_voice(source, |voice| {
            voice.playing = true;
        })
    }

    fn pause(&mut self, source: SourceHandle) -> Result<()> {
        self.with_voice(source, |voice| {
            voice.playing = false;
        })
    }

    fn stop(&mut self, source: SourceHandle) -> Result<()> {
        self.with_voice(source, |voice| {
            voice.playing = false;
            voice.cursor_buf = 0;
            voice.cursor_frame = 0.0;
            // Stopping marks the whole queue processed, native-style.
            voice.processed = voice.queue.len();
        })
    }

    fn is_playing(&self, source: SourceHandle) -> bool {
        self.read_voice(source, |v| v.playing)
    }

    fn processed_buffers(&self, source: SourceHandle) -> usize {
        self.read_voice(source, |v| v.processed)
    }

    fn queued_buffers(&self, source: SourceHandle) -> usize {
        self.read_voice(source, |v| v.queue.len())
    }

    fn sample_offset(&self, source: SourceHandle) -> usize {
        let state = self.lock();
        let Some(voice) = state.voices.get(&source) else {
            return 0;
        };
        let mut frames = 0usize;
        for handle in voice.queue.iter().take(voice.cursor_buf) {
            if let Some(buffer) = state.buffers.get(handle) {
                frames += buffer.frames();
            }
        }
        frames + voice.cursor_frame as usize
    }

    fn set_sample_offset(&mut self, source: SourceHandle, samples: usize) -> Result<()> {
        let mut state = self.lock();
        let RenderState { voices, buffers } = &mut *state;
        let voice = voices.get_mut(&source).ok_or_else(|| {
            AudioError::Device(format!("unknown device source {source:?}"))
        })?;
        let mut remaining = samples;
        voice.cursor_buf = 0;
        voice.cursor_frame = 0.0;
        for (idx, handle) in voice.queue.iter().enumerate() {
            let frames = buffers.get(handle).map_or(0, |b| b.frames());
            if remaining < frames {
                voice.cursor_buf = idx;
                voice.cursor_frame = remaining as f64;
                return Ok(());
            }
            remaining -= frames;
        }
        // Past the end of the queue: park at the tail.
        voice.cursor_buf = voice.queue.len().saturating_sub(1);
        voice.cursor_frame = remaining as f64;
        Ok(())
    }

    fn set_gain(&mut self, source: SourceHandle, gain: f32) -> Result<()> {
        self.with_voice(source, |voice| {
            voice.gain = gain;
        })
    }

    fn gain(&self, source: SourceHandle) -> f32 {
        self.read_voice(source, |v| v.gain)
    }

    fn set_pitch(&mut self, source: SourceHandle, pitch: f32) -> Result<()> {
        self.with_voice(source, |voice| {
            voice.pitch = pitch;
        })
    }

    fn pitch(&self, source: SourceHandle) -> f32 {
        self.read_voice(source, |v| v.pitch)
    }

    fn set_looping(&mut self, source: SourceHandle, looping: bool) -> Result<()> {
        self.with_voice(source, |voice| {
            voice.looping = looping;
        })
    }

    fn looping(&self, source: SourceHandle) -> bool {
        self.read_voice(source, |v| v.looping)
    }
}
