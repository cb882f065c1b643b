//! Byte-stream sources feeding decoders.
//!
//! A source of raw encoded bytes. Whether the stream can be handed out again
//! governs backward seeking and loop restarts: both require decoding from the
//! start of the stream.

use crate::error::{AudioError, Result};
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// A readable byte stream handed to a decoder.
pub type ByteStream = Box<dyn Read + Send + Sync>;

pub trait InputStreamSource: Send + Sync {
    /// True if `open_stream` can still produce the stream from its beginning.
    /// Single-use streams return false once consumed.
    fn can_be_retrieved(&self) -> bool;

    /// Opens the stream from its beginning.
    fn open_stream(&self) -> Result<ByteStream>;
}

/// A stream backed by a file path, retrievable as long as the file exists.
pub struct FileStreamSource {
    path: PathBuf,
}

impl FileStreamSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl InputStreamSource for FileStreamSource {
    fn can_be_retrieved(&self) -> bool {
        self.path.exists()
    }

    fn open_stream(&self) -> Result<ByteStream> {
        let file = File::open(&self.path).map_err(|e| {
            AudioError::CannotReadStream(format!("{}: {e}", self.path.display()))
        })?;
        Ok(Box::new(BufReader::new(file)))
    }
}

/// A stream over bytes held in memory, always retrievable.
pub struct MemoryStreamSource {
    data: Arc<[u8]>,
}

impl MemoryStreamSource {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self { data: data.into() }
    }
}

impl InputStreamSource for MemoryStreamSource {
    fn can_be_retrieved(&self) -> bool {
        true
    }

    fn open_stream(&self) -> Result<ByteStream> {
        Ok(Box::new(Cursor::new(ArcBytes(self.data.clone()))))
    }
}

struct ArcBytes(Arc<[u8]>);

impl AsRef<[u8]> for ArcBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Wraps a reader that can be consumed exactly once. After the first
/// `open_stream` the source reports itself as non-retrievable, so backward
/// seeks and loop restarts fail with `CannotReadStream`.
pub struct SingleStreamSource {
    stream: Mutex<Option<ByteStream>>,
}

impl SingleStreamSource {
    pub fn new(stream: ByteStream) -> Self {
        Self {
            stream: Mutex::new(Some(stream)),
        }
    }
}

impl InputStreamSource for SingleStreamSource {
    fn can_be_retrieved(&self) -> bool {
        self.stream.lock().unwrap().is_some()
    }

    fn open_stream(&self) -> Result<ByteStream> {
        self.stream
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| AudioError::CannotReadStream("single-use stream already consumed".into()))
    }
}
