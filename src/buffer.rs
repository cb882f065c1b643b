//! Decoded PCM chunks, the unit exchanged between decode workers, sources and
//! the device.

use crate::device::BufferHandle;

/// Format of a run of interleaved PCM bytes.
///
/// A *sample* is one frame across all channels; `frame_size` is its width in
/// bytes. Every buffer size in the public API is expressed in samples and
/// converted to bytes exactly once, through the spec of the decoder that
/// produced the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmSpec {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
}

impl PcmSpec {
    /// Width of one sample across all channels, in bytes.
    pub fn frame_size(&self) -> usize {
        self.channels as usize * self.bits_per_sample as usize / 8
    }

    pub fn samples_to_bytes(&self, samples: usize) -> usize {
        samples * self.frame_size()
    }

    pub fn bytes_to_samples(&self, bytes: usize) -> usize {
        bytes / self.frame_size()
    }
}

/// An immutable decoded PCM chunk.
///
/// Produced by exactly one decode job, owned by exactly one source's buffer
/// queue, and released by the control thread once the device reports it
/// processed. The valid length may be shorter than the allocation when the
/// decoder short-reads at the end of a stream.
#[derive(Debug)]
pub struct AudioBuffer {
    data: Vec<u8>,
    len: usize,
    spec: PcmSpec,
    device_handle: Option<BufferHandle>,
}

impl AudioBuffer {
    pub fn new(data: Vec<u8>, len: usize, spec: PcmSpec) -> Self {
        debug_assert!(len <= data.len());
        Self {
            data,
            len,
            spec,
            device_handle: None,
        }
    }

    pub fn empty(spec: PcmSpec) -> Self {
        Self::new(Vec::new(), 0, spec)
    }

    /// The valid PCM bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Valid length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Valid length in samples.
    pub fn samples(&self) -> usize {
        self.spec.bytes_to_samples(self.len)
    }

    pub fn spec(&self) -> PcmSpec {
        self.spec
    }

    /// Device buffer this chunk was uploaded to, set once by the control
    /// thread when the PCM is handed to the device.
    pub fn device_handle(&self) -> Option<BufferHandle> {
        self.device_handle
    }

    pub(crate) fn set_device_handle(&mut self, handle: BufferHandle) {
        self.device_handle = Some(handle);
    }
}

/// Read-only view of a queued buffer, returned by buffer snapshot queries.
#[derive(Debug, Clone)]
pub struct BufferInfo {
    pub samples: usize,
    pub bytes: usize,
    pub spec: PcmSpec,
    pub device_handle: Option<BufferHandle>,
}

impl From<&AudioBuffer> for BufferInfo {
    fn from(buffer: &AudioBuffer) -> Self {
        Self {
            samples: buffer.samples(),
            bytes: buffer.len(),
            spec: buffer.spec(),
            device_handle: buffer.device_handle(),
        }
    }
}
