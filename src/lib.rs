//! # rillaudio
//!
//! Streaming audio playback built around one rule: the native playback
//! device is only ever touched by a single control thread. Application
//! threads talk to that thread through a command queue with blocking
//! request/response semantics, and decode work runs on a background worker
//! pool.
//!
//! ## Quick Start
//!
//! ```no_run
//! use rillaudio::{AudioEngine, EngineConfig, FileStreamSource, SymphoniaDecoder};
//! use std::sync::Arc;
//!
//! let engine = AudioEngine::new(EngineConfig::default())?;
//! engine.set_default_decoder(SymphoniaDecoder::factory());
//!
//! // A streaming source decodes in the background, a few buffers ahead of
//! // the play position.
//! let music = engine.new_streaming_source(Arc::new(FileStreamSource::new("music.ogg")))?;
//! engine.set_looping(music, true)?;
//! engine.play(music)?;
//!
//! // A one-shot source is decoded once and can be replayed cheaply.
//! let click = engine.new_sound_source(Arc::new(FileStreamSource::new("click.wav")))?;
//! engine.play(click)?;
//!
//! engine.fade(music, 1.0, 0.2, std::time::Duration::from_secs(2))?;
//! # Ok::<(), rillaudio::AudioError>(())
//! ```
//!
//! ## Key Components
//!
//! - **[`AudioEngine`]**: the public facade; every call is forwarded to the
//!   control thread and blocks until it has been applied
//! - **[`InputStreamSource`]**: where encoded bytes come from (file, memory,
//!   or a single-use reader)
//! - **[`Decoder`](decoder::Decoder)**: turns a byte stream into PCM chunks;
//!   ships with WAV, raw PCM and symphonia-backed decoders
//! - **[`AudioDevice`](device::AudioDevice)**: the playback backend
//!   contract; cpal output and an in-memory mock are provided
//! - **[`SourceEvent`]**: per-source callbacks delivered on the control
//!   thread
//!
//! ## Threading model
//!
//! 1. **Application threads** submit commands and block on a per-command
//!    reply channel.
//! 2. **The control thread** owns the device. It polls for consumed buffers,
//!    applies decode outcomes, executes commands and advances fades.
//! 3. **Decode workers** run the jobs the control thread schedules, at most
//!    one per source at a time.

pub mod buffer;
mod command;
pub mod config;
mod control;
pub mod decoder;
pub mod device;
pub mod engine;
pub mod error;
pub mod events;
mod fade;
mod pending;
mod source;
pub mod stream;
mod worker;

pub use buffer::{AudioBuffer, BufferInfo, PcmSpec};
pub use config::EngineConfig;
pub use decoder::{DecoderFactory, DecoderInfo, RawPcmDecoder, SymphoniaDecoder, WavDecoder};
pub use device::{MockDevice, MockDeviceHandle};
pub use engine::{AudioEngine, SourceId};
pub use error::{AudioError, Result};
pub use events::{SourceCallback, SourceEvent};
pub use stream::{
    ByteStream, FileStreamSource, InputStreamSource, MemoryStreamSource, SingleStreamSource,
};
