//! Per-source state owned by the control thread.

use crate::buffer::AudioBuffer;
use crate::decoder::{Decoder, DecoderFactory, DecoderInfo};
use crate::device::SourceHandle;
use crate::engine::SourceId;
use crate::events::{SourceCallback, SourceEvent};
use crate::stream::InputStreamSource;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Streaming {
        buffer_size: usize,
        buffer_count: usize,
    },
    OneShot {
        buffer_size: Option<usize>,
    },
    Manual,
}

/// One playing source: engine-side intent plus the decoded buffers currently
/// queued on the device, oldest first.
pub struct Source {
    pub id: SourceId,
    pub handle: SourceHandle,
    pub kind: SourceKind,
    pub stream: Option<Arc<dyn InputStreamSource>>,
    pub factory: Option<DecoderFactory>,
    /// Parked here between decode jobs; `None` while a job owns it or before
    /// the first job created it.
    pub decoder: Option<Box<dyn Decoder>>,
    /// Cached from the last decode outcome, answers queries while the
    /// decoder is out with a job.
    pub info: Option<DecoderInfo>,
    /// Decoded buffers currently queued on the device, oldest first.
    pub queue: VecDeque<AudioBuffer>,
    /// A decode job is out for this source. At most one at a time.
    pub in_flight: bool,
    /// The job out right now is a seek restart, so the buffer window is
    /// stale until it lands. Later seeks supersede it instead of trusting
    /// the window.
    pub seek_in_flight: bool,
    /// Bumped on seeks; outcomes from older generations are discarded.
    pub generation: u64,
    pub looping: bool,
    pub loop_count: u32,
    /// Playback intent. Survives buffer underruns and deferred starts.
    pub should_play: bool,
    /// Relative volume, multiplied with the engine master volume.
    pub volume: f32,
    /// Samples decoded and released before the oldest queued buffer.
    pub consumed_samples: usize,
    /// The decoder reported end of stream on its last read.
    pub stream_over: bool,
    /// A decode failed with an unreadable stream. No more jobs are scheduled
    /// until a seek or a looping change clears the latch.
    pub unreadable: bool,
    pub callbacks: Vec<SourceCallback>,
}

impl Source {
    pub fn new(
        id: SourceId,
        handle: SourceHandle,
        kind: SourceKind,
        stream: Option<Arc<dyn InputStreamSource>>,
        factory: Option<DecoderFactory>,
    ) -> Self {
        Self {
            id,
            handle,
            kind,
            stream,
            factory,
            decoder: None,
            info: None,
            queue: VecDeque::new(),
            in_flight: false,
            seek_in_flight: false,
            generation: 0,
            looping: false,
            loop_count: 0,
            should_play: false,
            volume: 1.0,
            consumed_samples: 0,
            stream_over: false,
            unreadable: false,
            callbacks: Vec::new(),
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.kind, SourceKind::Streaming { .. })
    }

    pub fn is_one_shot(&self) -> bool {
        matches!(self.kind, SourceKind::OneShot { .. })
    }

    pub fn is_manual(&self) -> bool {
        matches!(self.kind, SourceKind::Manual)
    }

    /// Samples currently queued on the device.
    pub fn queued_samples(&self) -> usize {
        self.queue.iter().map(|b| b.samples()).sum()
    }

    /// A streaming source wants another decode when it is under-buffered and
    /// nothing blocks one. End-of-stream only blocks non-looping sources.
    pub fn wants_decode(&self) -> bool {
        let SourceKind::Streaming { buffer_count, .. } = self.kind else {
            return false;
        };
        self.should_play
            && !self.in_flight
            && !self.unreadable
            && self.queue.len() < buffer_count
            && !(self.stream_over && !self.looping)
    }

    pub fn emit(&mut self, event: &SourceEvent) {
        let id = self.id;
        for callback in &mut self.callbacks {
            callback(id, event);
        }
    }
}
