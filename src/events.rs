//! Per-source callback events, delivered on the control thread.

use crate::engine::SourceId;

#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// A decode was scheduled for this source. `skipped` is non-zero for the
    /// backward-seek path, which restarts decoding from the stream start.
    LoadingStarted { skipped: usize },
    /// A decoded buffer was uploaded and queued on the device.
    BufferLoaded { samples: usize },
    /// The device finished playing a queued buffer; it has been released.
    BufferProcessed { samples: usize },
    /// A looping source exhausted its stream and restarted.
    Looped { count: u32 },
    /// A non-looping source exhausted its stream; playback intent was
    /// cleared and the remaining queue drains to silence.
    Completed,
    /// One iteration of the control loop's polling pass.
    Tick,
}

/// Invoked by the control thread; keep these cheap, they run inside the tick
/// loop.
pub type SourceCallback = Box<dyn FnMut(SourceId, &SourceEvent) + Send>;
