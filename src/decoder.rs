//! The decoder contract and the decoders shipped with the engine.
//!
//! A decoder turns a byte stream into fixed-format PCM chunks. Chunk byte
//! lengths are always a whole multiple of the frame size, and a chunk may be
//! shorter than requested when the stream runs out.

use crate::buffer::{AudioBuffer, PcmSpec};
use crate::error::{AudioError, Result};
use crate::stream::ByteStream;
use std::io::Read;
use std::sync::Arc;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSourceStream, ReadOnlySource};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

pub trait Decoder: Send {
    /// Format of the PCM this decoder produces.
    fn spec(&self) -> PcmSpec;

    /// Total decoded size in bytes, or -1 when unknown.
    fn total_size(&self) -> i64;

    /// Reads up to `max_samples` samples, short-reading at stream end.
    fn read_chunk(&mut self, max_samples: usize) -> Result<AudioBuffer>;

    /// Reads until the stream is exhausted.
    fn read_all(&mut self) -> Result<AudioBuffer>;

    /// True once the stream has no more data to give.
    fn is_stream_over(&self) -> bool;
}

/// Snapshot of a decoder's static properties, cached by the engine so that
/// queries keep working while the decoder itself is out with a decode job.
#[derive(Debug, Clone, Copy)]
pub struct DecoderInfo {
    pub spec: PcmSpec,
    pub total_size: i64,
}

impl DecoderInfo {
    pub fn of(decoder: &dyn Decoder) -> Self {
        Self {
            spec: decoder.spec(),
            total_size: decoder.total_size(),
        }
    }
}

/// Builds a decoder from a freshly opened byte stream. Factories are shared
/// between the engine and decode workers, which re-create decoders on loop
/// restarts and backward seeks.
pub type DecoderFactory = Arc<dyn Fn(ByteStream) -> Result<Box<dyn Decoder>> + Send + Sync>;

fn read_up_to(stream: &mut dyn Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

// ---------------------------------------------------------------------------
// Raw PCM
// ---------------------------------------------------------------------------

/// Passes bytes through unchanged, for headerless PCM streams whose format is
/// known out of band.
pub struct RawPcmDecoder {
    stream: ByteStream,
    spec: PcmSpec,
    over: bool,
}

impl RawPcmDecoder {
    pub fn new(stream: ByteStream, spec: PcmSpec) -> Self {
        Self {
            stream,
            spec,
            over: false,
        }
    }

    pub fn factory(spec: PcmSpec) -> DecoderFactory {
        Arc::new(move |stream| Ok(Box::new(RawPcmDecoder::new(stream, spec)) as Box<dyn Decoder>))
    }
}

impl Decoder for RawPcmDecoder {
    fn spec(&self) -> PcmSpec {
        self.spec
    }

    fn total_size(&self) -> i64 {
        -1
    }

    fn read_chunk(&mut self, max_samples: usize) -> Result<AudioBuffer> {
        let frame = self.spec.frame_size();
        let mut data = vec![0u8; max_samples * frame];
        let read = read_up_to(&mut self.stream, &mut data)?;
        if read < data.len() {
            self.over = true;
        }
        let valid = read - read % frame;
        Ok(AudioBuffer::new(data, valid, self.spec))
    }

    fn read_all(&mut self) -> Result<AudioBuffer> {
        let mut data = Vec::new();
        self.stream.read_to_end(&mut data)?;
        self.over = true;
        let valid = data.len() - data.len() % self.spec.frame_size();
        Ok(AudioBuffer::new(data, valid, self.spec))
    }

    fn is_stream_over(&self) -> bool {
        self.over
    }
}

// ---------------------------------------------------------------------------
// WAV
// ---------------------------------------------------------------------------

/// Minimal RIFF/WAVE reader for 8- and 16-bit integer PCM. Anything richer
/// goes through [`SymphoniaDecoder`].
pub struct WavDecoder {
    stream: ByteStream,
    spec: PcmSpec,
    data_size: u64,
    remaining: u64,
    over: bool,
}

impl std::fmt::Debug for WavDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WavDecoder")
            .field("spec", &self.spec)
            .field("data_size", &self.data_size)
            .field("remaining", &self.remaining)
            .field("over", &self.over)
            .finish_non_exhaustive()
    }
}

impl WavDecoder {
    pub fn new(mut stream: ByteStream) -> Result<Self> {
        let mut tag = [0u8; 4];
        read_exact(&mut stream, &mut tag)?;
        if &tag != b"RIFF" {
            return Err(AudioError::CannotReadStream("not a RIFF stream".into()));
        }
        let _riff_size = read_u32(&mut stream)?;
        read_exact(&mut stream, &mut tag)?;
        if &tag != b"WAVE" {
            return Err(AudioError::CannotReadStream("not a WAVE stream".into()));
        }

        let mut spec: Option<PcmSpec> = None;
        loop {
            read_exact(&mut stream, &mut tag)?;
            let size = read_u32(&mut stream)? as u64;
            match &tag {
                b"fmt " => {
                    let format = read_u16(&mut stream)?;
                    let channels = read_u16(&mut stream)?;
                    let sample_rate = read_u32(&mut stream)?;
                    let _byte_rate = read_u32(&mut stream)?;
                    let _block_align = read_u16(&mut stream)?;
                    let bits_per_sample = read_u16(&mut stream)?;
                    skip(&mut stream, size.saturating_sub(16))?;
                    if format != 1 {
                        return Err(AudioError::CannotReadStream(format!(
                            "unsupported WAVE format tag {format}"
                        )));
                    }
                    if bits_per_sample != 8 && bits_per_sample != 16 {
                        return Err(AudioError::CannotReadStream(format!(
                            "unsupported bit depth {bits_per_sample}"
                        )));
                    }
                    spec = Some(PcmSpec {
                        channels,
                        sample_rate,
                        bits_per_sample,
                    });
                }
                b"data" => {
                    let spec = spec.ok_or_else(|| {
                        AudioError::CannotReadStream("data chunk before fmt chunk".into())
                    })?;
                    return Ok(Self {
                        stream,
                        spec,
                        data_size: size,
                        remaining: size,
                        over: size == 0,
                    });
                }
                _ => skip(&mut stream, size + size % 2)?,
            }
        }
    }

    pub fn factory() -> DecoderFactory {
        Arc::new(|stream| Ok(Box::new(WavDecoder::new(stream)?) as Box<dyn Decoder>))
    }
}

fn read_exact(stream: &mut dyn Read, buf: &mut [u8]) -> Result<()> {
    stream
        .read_exact(buf)
        .map_err(|e| AudioError::CannotReadStream(format!("truncated WAVE header: {e}")))
}

fn read_u16(stream: &mut dyn Read) -> Result<u16> {
    let mut b = [0u8; 2];
    read_exact(stream, &mut b)?;
    Ok(u16::from_le_bytes(b))
}

fn read_u32(stream: &mut dyn Read) -> Result<u32> {
    let mut b = [0u8; 4];
    read_exact(stream, &mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn skip(stream: &mut dyn Read, bytes: u64) -> Result<()> {
    let copied = std::io::copy(&mut stream.take(bytes), &mut std::io::sink())?;
    if copied != bytes {
        return Err(AudioError::CannotReadStream("truncated WAVE chunk".into()));
    }
    Ok(())
}

impl Decoder for WavDecoder {
    fn spec(&self) -> PcmSpec {
        self.spec
    }

    fn total_size(&self) -> i64 {
        self.data_size as i64
    }

    fn read_chunk(&mut self, max_samples: usize) -> Result<AudioBuffer> {
        let frame = self.spec.frame_size();
        let want = (max_samples * frame).min(self.remaining as usize);
        let mut data = vec![0u8; want];
        let read = read_up_to(&mut self.stream, &mut data)?;
        self.remaining -= read as u64;
        if self.remaining == 0 || read < want {
            self.over = true;
        }
        let valid = read - read % frame;
        Ok(AudioBuffer::new(data, valid, self.spec))
    }

    fn read_all(&mut self) -> Result<AudioBuffer> {
        let samples = self.spec.bytes_to_samples(self.remaining as usize);
        self.read_chunk(samples)
    }

    fn is_stream_over(&self) -> bool {
        self.over
    }
}

// ---------------------------------------------------------------------------
// Symphonia
// ---------------------------------------------------------------------------

/// Decodes any container/codec symphonia can probe from a non-seekable
/// stream, converting to interleaved 16-bit PCM.
pub struct SymphoniaDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    track_id: u32,
    spec: PcmSpec,
    total_size: i64,
    pending: Vec<u8>,
    over: bool,
}

impl SymphoniaDecoder {
    pub fn new(stream: ByteStream) -> Result<Self> {
        let mss = MediaSourceStream::new(
            Box::new(ReadOnlySource::new(stream)),
            Default::default(),
        );

        let probed = symphonia::default::get_probe()
            .format(
                &Hint::new(),
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| AudioError::CannotReadStream(format!("failed to probe stream: {e}")))?;

        let format = probed.format;
        let track = format
            .default_track()
            .ok_or_else(|| AudioError::CannotReadStream("no default audio track".into()))?;
        let track_id = track.id;

        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| AudioError::CannotReadStream("sample rate not known".into()))?;
        let channels = track
            .codec_params
            .channels
            .ok_or_else(|| AudioError::CannotReadStream("channel count not known".into()))?
            .count() as u16;

        let spec = PcmSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
        };
        let total_size = track
            .codec_params
            .n_frames
            .map(|frames| frames as i64 * spec.frame_size() as i64)
            .unwrap_or(-1);

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| AudioError::CannotReadStream(format!("failed to create decoder: {e}")))?;

        Ok(Self {
            format,
            decoder,
            track_id,
            spec,
            total_size,
            pending: Vec::new(),
            over: false,
        })
    }

    pub fn factory() -> DecoderFactory {
        Arc::new(|stream| Ok(Box::new(SymphoniaDecoder::new(stream)?) as Box<dyn Decoder>))
    }

    /// Decodes one packet into `pending`. Returns false at end of stream.
    fn decode_more(&mut self) -> Result<bool> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(_)) | Err(SymphoniaError::ResetRequired) => {
                    self.over = true;
                    return Ok(false);
                }
                Err(e) => {
                    self.over = true;
                    return Err(AudioError::Decode(format!("error reading packet: {e}")));
                }
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::IoError(_)) => {
                    self.over = true;
                    return Ok(false);
                }
                // Recoverable corruption, move on to the next packet.
                Err(SymphoniaError::DecodeError(_)) => continue,
                Err(e) => {
                    self.over = true;
                    return Err(AudioError::Decode(format!("error decoding packet: {e}")));
                }
            };

            let mut tmp = SampleBuffer::<i16>::new(decoded.capacity() as u64, *decoded.spec());
            tmp.copy_interleaved_ref(decoded);
            for sample in tmp.samples() {
                self.pending.extend_from_slice(&sample.to_le_bytes());
            }
            return Ok(true);
        }
    }
}

impl Decoder for SymphoniaDecoder {
    fn spec(&self) -> PcmSpec {
        self.spec
    }

    fn total_size(&self) -> i64 {
        self.total_size
    }

    fn read_chunk(&mut self, max_samples: usize) -> Result<AudioBuffer> {
        let want = self.spec.samples_to_bytes(max_samples);
        while self.pending.len() < want && !self.over {
            self.decode_more()?;
        }
        let take = want.min(self.pending.len());
        let rest = self.pending.split_off(take);
        let data = std::mem::replace(&mut self.pending, rest);
        let valid = data.len();
        Ok(AudioBuffer::new(data, valid, self.spec))
    }

    fn read_all(&mut self) -> Result<AudioBuffer> {
        while !self.over {
            self.decode_more()?;
        }
        let data = std::mem::take(&mut self.pending);
        let valid = data.len();
        Ok(AudioBuffer::new(data, valid, self.spec))
    }

    fn is_stream_over(&self) -> bool {
        self.over && self.pending.is_empty()
    }
}
