//! Error types for rillaudio

use crate::engine::SourceId;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AudioError {
    /// An argument was outside its contract range (volume, pitch, buffer sizes).
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// A decoder could not be constructed, or a seek/loop-restart required
    /// re-opening a byte stream that cannot be retrieved again.
    #[error("cannot read stream: {0}")]
    CannotReadStream(String),

    /// The device or the control thread failed to initialize, or the engine
    /// has been shut down.
    #[error("audio system is not running")]
    SystemNotRunning,

    /// A command referenced a source id that is no longer in the registry.
    #[error("unknown source {0}")]
    UnknownSource(SourceId),

    /// An error reported by the device backend.
    #[error("device error: {0}")]
    Device(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode error: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, AudioError>;

/// Engine-wide "last error" slot, cleared on read.
///
/// Device and handler errors do not unwind the caller: commands still
/// complete, and the failure is recorded here for the caller to poll.
#[derive(Debug, Default)]
pub struct ErrorSlot {
    last: Mutex<Option<AudioError>>,
}

impl ErrorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, error: AudioError) {
        log::warn!("recording error: {error}");
        *self.last.lock().unwrap() = Some(error);
    }

    /// Takes the last recorded error, leaving the slot empty.
    pub fn take(&self) -> Option<AudioError> {
        self.last.lock().unwrap().take()
    }
}
