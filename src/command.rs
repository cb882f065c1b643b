//! Commands submitted to the control thread.
//!
//! Every command carries a bounded(1) reply channel. The caller blocks on it
//! until the control thread has executed the command, which gives every
//! public engine call request/response semantics over the shared queue.
//!
//! Failures do not travel back through the reply (except source creation):
//! they land in the engine's last-error slot and the reply carries a neutral
//! default, so one misbehaving source never poisons an unrelated caller.

use crate::buffer::{BufferInfo, PcmSpec};
use crate::decoder::{DecoderFactory, DecoderInfo};
use crate::engine::SourceId;
use crate::error::Result;
use crate::events::SourceCallback;
use crate::stream::InputStreamSource;
use crossbeam_channel::Sender;
use std::sync::Arc;
use std::time::Duration;

/// What kind of source to create.
pub enum SourceDesc {
    /// Decoded in fixed-size chunks, a bounded ring of buffers ahead of the
    /// play position.
    Streaming {
        stream: Arc<dyn InputStreamSource>,
        factory: DecoderFactory,
        /// Per-buffer size in samples.
        buffer_size: usize,
        /// Ring depth.
        buffer_count: usize,
        looping: bool,
    },
    /// Decoded once into a single buffer.
    OneShot {
        stream: Arc<dyn InputStreamSource>,
        factory: DecoderFactory,
        /// Read limit in samples; `None` decodes the whole stream.
        buffer_size: Option<usize>,
        looping: bool,
    },
    /// No decoder; the application pushes PCM buffers itself.
    Manual,
}

pub enum Command {
    CreateSource {
        desc: SourceDesc,
        reply: Sender<Result<SourceId>>,
    },
    DeleteSource {
        id: SourceId,
        reply: Sender<()>,
    },
    Play {
        id: SourceId,
        reply: Sender<()>,
    },
    Pause {
        id: SourceId,
        reply: Sender<()>,
    },
    Stop {
        id: SourceId,
        reply: Sender<()>,
    },
    SetVolume {
        id: SourceId,
        volume: f32,
        reply: Sender<()>,
    },
    GetVolume {
        id: SourceId,
        reply: Sender<f32>,
    },
    SetPitch {
        id: SourceId,
        pitch: f32,
        reply: Sender<()>,
    },
    GetPitch {
        id: SourceId,
        reply: Sender<f32>,
    },
    SetMasterVolume {
        volume: f32,
        reply: Sender<()>,
    },
    GetMasterVolume {
        reply: Sender<f32>,
    },
    /// Seek, in samples from the stream start.
    SetOffset {
        id: SourceId,
        samples: usize,
        reply: Sender<()>,
    },
    GetOffset {
        id: SourceId,
        reply: Sender<usize>,
    },
    SetLooping {
        id: SourceId,
        looping: bool,
        reply: Sender<()>,
    },
    IsLooping {
        id: SourceId,
        reply: Sender<bool>,
    },
    LoopCount {
        id: SourceId,
        reply: Sender<u32>,
    },
    IsPlaying {
        id: SourceId,
        reply: Sender<bool>,
    },
    IsLoading {
        id: SourceId,
        reply: Sender<bool>,
    },
    BufferSnapshot {
        id: SourceId,
        reply: Sender<Vec<BufferInfo>>,
    },
    GetDecoderInfo {
        id: SourceId,
        reply: Sender<Option<DecoderInfo>>,
    },
    /// Manual sources only.
    PushBuffer {
        id: SourceId,
        pcm: Vec<u8>,
        spec: PcmSpec,
        reply: Sender<()>,
    },
    Fade {
        id: SourceId,
        from: f32,
        to: f32,
        duration: Duration,
        reply: Sender<()>,
    },
    RegisterCallback {
        id: SourceId,
        callback: SourceCallback,
        reply: Sender<()>,
    },
    Sources {
        reply: Sender<Vec<SourceId>>,
    },
    Shutdown {
        reply: Sender<()>,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateSource { .. } => "create_source",
            Self::DeleteSource { .. } => "delete_source",
            Self::Play { .. } => "play",
            Self::Pause { .. } => "pause",
            Self::Stop { .. } => "stop",
            Self::SetVolume { .. } => "set_volume",
            Self::GetVolume { .. } => "get_volume",
            Self::SetPitch { .. } => "set_pitch",
            Self::GetPitch { .. } => "get_pitch",
            Self::SetMasterVolume { .. } => "set_master_volume",
            Self::GetMasterVolume { .. } => "get_master_volume",
            Self::SetOffset { .. } => "set_offset",
            Self::GetOffset { .. } => "get_offset",
            Self::SetLooping { .. } => "set_looping",
            Self::IsLooping { .. } => "is_looping",
            Self::LoopCount { .. } => "loop_count",
            Self::IsPlaying { .. } => "is_playing",
            Self::IsLoading { .. } => "is_loading",
            Self::BufferSnapshot { .. } => "buffer_snapshot",
            Self::GetDecoderInfo { .. } => "decoder_info",
            Self::PushBuffer { .. } => "push_buffer",
            Self::Fade { .. } => "fade",
            Self::RegisterCallback { .. } => "register_callback",
            Self::Sources { .. } => "sources",
            Self::Shutdown { .. } => "shutdown",
        }
    }
}
