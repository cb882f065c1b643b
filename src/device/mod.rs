//! The device primitive contract.
//!
//! The native playback layer is modeled as a small set of primitives: source
//! and buffer objects, a per-source buffer queue, and play/pause/stop state.
//! The control thread is the only caller; backends are created inside it and
//! never leave it, so the trait does not need to be `Send`.

mod cpal_backend;
mod mock;

pub use cpal_backend::CpalDevice;
pub use mock::{MockDevice, MockDeviceHandle};

use crate::buffer::PcmSpec;
use crate::error::Result;

/// Handle to a device-level source object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceHandle(pub u32);

/// Handle to a device-level buffer object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u32);

pub trait AudioDevice {
    fn create_source(&mut self) -> Result<SourceHandle>;
    fn delete_source(&mut self, source: SourceHandle) -> Result<()>;

    /// Uploads PCM into a fresh device buffer.
    fn create_buffer(&mut self, pcm: &[u8], spec: PcmSpec) -> Result<BufferHandle>;
    fn delete_buffer(&mut self, buffer: BufferHandle) -> Result<()>;

    /// Appends a buffer to the source's play queue.
    fn queue_buffer(&mut self, source: SourceHandle, buffer: BufferHandle) -> Result<()>;
    /// Pops the oldest processed buffer off the source's queue.
    fn unqueue_buffer(&mut self, source: SourceHandle) -> Result<Option<BufferHandle>>;

    fn play(&mut self, source: SourceHandle) -> Result<()>;
    /// Halts playback keeping the read position.
    fn pause(&mut self, source: SourceHandle) -> Result<()>;
    /// Halts playback and resets the read position to the queue start.
    fn stop(&mut self, source: SourceHandle) -> Result<()>;

    fn is_playing(&self, source: SourceHandle) -> bool;

    /// Buffers the device has finished playing but not yet unqueued.
    fn processed_buffers(&self, source: SourceHandle) -> usize;
    fn queued_buffers(&self, source: SourceHandle) -> usize;

    /// Read position in samples, relative to the start of the oldest
    /// still-queued buffer.
    fn sample_offset(&self, source: SourceHandle) -> usize;
    fn set_sample_offset(&mut self, source: SourceHandle, samples: usize) -> Result<()>;

    fn set_gain(&mut self, source: SourceHandle, gain: f32) -> Result<()>;
    fn gain(&self, source: SourceHandle) -> f32;

    fn set_pitch(&mut self, source: SourceHandle, pitch: f32) -> Result<()>;
    fn pitch(&self, source: SourceHandle) -> f32;

    /// Device-level looping replays the queue without marking buffers
    /// processed. Used for one-shot sources; streaming loops are handled by
    /// the engine re-creating the decoder.
    fn set_looping(&mut self, source: SourceHandle, looping: bool) -> Result<()>;
    fn looping(&self, source: SourceHandle) -> bool;
}

/// Builds the device inside the control thread, which then owns it for the
/// engine's whole lifetime.
pub type DeviceFactory = Box<dyn FnOnce() -> Result<Box<dyn AudioDevice>> + Send>;
