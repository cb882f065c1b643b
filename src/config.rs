//! Engine configuration.

use crate::decoder::{DecoderFactory, WavDecoder};
use std::fmt;
use std::time::Duration;

/// Construction-time configuration for an [`AudioEngine`](crate::AudioEngine).
///
/// All buffer sizes are in samples (frames), converted to bytes through the
/// decoder's frame size when buffers are allocated.
#[derive(Clone)]
pub struct EngineConfig {
    /// Per-buffer size for streaming sources.
    pub streaming_buffer_size: usize,
    /// Ring depth for streaming sources.
    pub streaming_buffer_count: usize,
    /// Read limit for one-shot sources; `None` reads the whole stream.
    pub sound_buffer_size: Option<usize>,
    /// Decoder used when source creation does not name one.
    pub default_decoder: DecoderFactory,
    /// Gate on the per-source device polling pass. Commands and decode
    /// results are still handled as soon as the control thread wakes.
    pub refresh_period: Duration,
    /// Number of decode worker threads.
    pub decode_workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            streaming_buffer_size: 65536,
            streaming_buffer_count: 3,
            sound_buffer_size: None,
            default_decoder: WavDecoder::factory(),
            refresh_period: Duration::from_millis(1),
            decode_workers: 2,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn streaming_buffer_size(mut self, samples: usize) -> Self {
        self.streaming_buffer_size = samples;
        self
    }

    pub fn streaming_buffer_count(mut self, count: usize) -> Self {
        self.streaming_buffer_count = count;
        self
    }

    pub fn sound_buffer_size(mut self, samples: Option<usize>) -> Self {
        self.sound_buffer_size = samples;
        self
    }

    pub fn default_decoder(mut self, factory: DecoderFactory) -> Self {
        self.default_decoder = factory;
        self
    }

    pub fn refresh_period(mut self, period: Duration) -> Self {
        self.refresh_period = period;
        self
    }

    pub fn decode_workers(mut self, workers: usize) -> Self {
        self.decode_workers = workers.max(1);
        self
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("streaming_buffer_size", &self.streaming_buffer_size)
            .field("streaming_buffer_count", &self.streaming_buffer_count)
            .field("sound_buffer_size", &self.sound_buffer_size)
            .field("refresh_period", &self.refresh_period)
            .field("decode_workers", &self.decode_workers)
            .finish_non_exhaustive()
    }
}
