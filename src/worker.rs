//! Background decode workers.
//!
//! The control thread never touches a byte stream itself. It hands decode
//! jobs to a small worker pool and picks the outcomes up on its next wake.
//! The decoder travels with the job and comes back with the outcome, so at
//! any moment exactly one side owns it.

use crate::buffer::AudioBuffer;
use crate::decoder::{Decoder, DecoderFactory};
use crate::engine::SourceId;
use crate::error::Result;
use crate::stream::InputStreamSource;
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::sync::Arc;
use std::thread::JoinHandle;

pub struct DecodeJob {
    pub source_id: SourceId,
    /// Stamped from the source at submit time. An outcome whose generation no
    /// longer matches the source is discarded.
    pub generation: u64,
    /// Samples to discard from the stream start before the payload read.
    /// Non-zero only on backward seeks, which re-decode from the beginning.
    pub to_skip: usize,
    /// The source's decoder, absent when one must be created from the stream.
    pub decoder: Option<Box<dyn Decoder>>,
    pub stream: Arc<dyn InputStreamSource>,
    pub factory: DecoderFactory,
    /// Read limit in samples; `None` reads the rest of the stream.
    pub buffer_size: Option<usize>,
    /// When the stream is already exhausted, restart it instead of returning
    /// an empty buffer.
    pub restart_at_end: bool,
}

/// A successful decode: the chunk, the decoder coming back home, and whether
/// the stream was restarted from the top to produce the chunk.
pub struct DecodedChunk {
    pub buffer: AudioBuffer,
    pub decoder: Box<dyn Decoder>,
    pub restarted: bool,
}

impl std::fmt::Debug for DecodedChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedChunk")
            .field("buffer", &self.buffer)
            .field("restarted", &self.restarted)
            .finish_non_exhaustive()
    }
}

pub struct DecodeOutcome {
    pub source_id: SourceId,
    pub generation: u64,
    pub to_skip: usize,
    pub result: Result<DecodedChunk>,
}

pub fn run_job(job: DecodeJob) -> DecodeOutcome {
    let DecodeJob {
        source_id,
        generation,
        to_skip,
        decoder,
        stream,
        factory,
        buffer_size,
        restart_at_end,
    } = job;

    let result = decode(
        decoder,
        stream.as_ref(),
        &factory,
        to_skip,
        buffer_size,
        restart_at_end,
    );
    if let Err(e) = &result {
        log::debug!("decode failed for source {source_id}: {e}");
    }

    DecodeOutcome {
        source_id,
        generation,
        to_skip,
        result,
    }
}

fn decode(
    decoder: Option<Box<dyn Decoder>>,
    stream: &dyn InputStreamSource,
    factory: &DecoderFactory,
    to_skip: usize,
    buffer_size: Option<usize>,
    restart_at_end: bool,
) -> Result<DecodedChunk> {
    let make = factory.as_ref();
    let mut dec = match (decoder, to_skip) {
        (Some(dec), 0) => dec,
        // No decoder yet, or a seek that restarts from the stream start.
        (_, skip) => {
            let mut fresh = make(stream.open_stream()?)?;
            if skip > 0 {
                fresh.read_chunk(skip)?;
            }
            fresh
        }
    };

    let mut restarted = false;
    if dec.is_stream_over() {
        if !restart_at_end {
            return Ok(DecodedChunk {
                buffer: AudioBuffer::empty(dec.spec()),
                decoder: dec,
                restarted: false,
            });
        }
        dec = make(stream.open_stream()?)?;
        restarted = true;
    }

    let mut buffer = read(dec.as_mut(), buffer_size)?;
    // Some decoders only notice the end on the read that comes up empty.
    if buffer.is_empty() && dec.is_stream_over() && restart_at_end {
        dec = make(stream.open_stream()?)?;
        restarted = true;
        buffer = read(dec.as_mut(), buffer_size)?;
    }
    Ok(DecodedChunk {
        buffer,
        decoder: dec,
        restarted,
    })
}

fn read(dec: &mut dyn Decoder, buffer_size: Option<usize>) -> Result<AudioBuffer> {
    match buffer_size {
        Some(samples) => dec.read_chunk(samples),
        None => dec.read_all(),
    }
}

/// Fixed pool of decode threads consuming a shared job channel.
pub struct DecodePool {
    job_tx: Sender<DecodeJob>,
    workers: Vec<JoinHandle<()>>,
}

impl DecodePool {
    /// Outcomes go to `outcome_tx`; `wake` nudges the control thread after
    /// each one.
    pub fn new(
        workers: usize,
        outcome_tx: Sender<DecodeOutcome>,
        wake: Sender<()>,
    ) -> Result<Self> {
        let (job_tx, job_rx): (Sender<DecodeJob>, Receiver<DecodeJob>) = unbounded();

        let mut handles = Vec::with_capacity(workers.max(1));
        for i in 0..workers.max(1) {
            let job_rx = job_rx.clone();
            let outcome_tx = outcome_tx.clone();
            let wake = wake.clone();
            let handle = std::thread::Builder::new()
                .name(format!("rillaudio-decode-{i}"))
                .spawn(move || {
                    while let Ok(job) = job_rx.recv() {
                        if outcome_tx.send(run_job(job)).is_err() {
                            break;
                        }
                        let _ = wake.try_send(());
                    }
                })?;
            handles.push(handle);
        }

        Ok(Self {
            job_tx,
            workers: handles,
        })
    }

    pub fn submit(&self, job: DecodeJob) {
        // Send only fails when every worker is gone, which only happens
        // during shutdown.
        let _ = self.job_tx.send(job);
    }

    /// Closes the job channel and waits for workers to drain.
    pub fn shutdown(self) {
        drop(self.job_tx);
        for handle in self.workers {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PcmSpec;
    use crate::decoder::RawPcmDecoder;
    use crate::error::AudioError;
    use crate::stream::{MemoryStreamSource, SingleStreamSource};
    use crossbeam_channel::bounded;
    use uuid::Uuid;

    const MONO16: PcmSpec = PcmSpec {
        channels: 1,
        sample_rate: 8000,
        bits_per_sample: 16,
    };

    fn pcm_bytes(samples: usize) -> Vec<u8> {
        (0..samples as i16).flat_map(|s| s.to_le_bytes()).collect()
    }

    fn job(stream: Arc<dyn InputStreamSource>, buffer_size: Option<usize>) -> DecodeJob {
        DecodeJob {
            source_id: Uuid::new_v4(),
            generation: 0,
            to_skip: 0,
            decoder: None,
            stream,
            factory: RawPcmDecoder::factory(MONO16),
            buffer_size,
            restart_at_end: false,
        }
    }

    #[test]
    fn first_job_creates_the_decoder() {
        let stream = Arc::new(MemoryStreamSource::new(pcm_bytes(100)));
        let chunk = run_job(job(stream, Some(40))).result.unwrap();
        assert_eq!(chunk.buffer.samples(), 40);
        assert!(!chunk.decoder.is_stream_over());
        assert!(!chunk.restarted);
    }

    #[test]
    fn skip_restarts_and_discards() {
        let stream = Arc::new(MemoryStreamSource::new(pcm_bytes(100)));
        let mut j = job(stream, Some(10));
        j.to_skip = 30;
        let chunk = run_job(j).result.unwrap();
        // First sample after skipping 30 is sample 30.
        assert_eq!(&chunk.buffer.bytes()[..2], &30i16.to_le_bytes());
        assert!(!chunk.restarted);
    }

    #[test]
    fn exhausted_stream_yields_empty_buffer() {
        let stream: Arc<dyn InputStreamSource> = Arc::new(MemoryStreamSource::new(pcm_bytes(20)));
        let first = run_job(job(stream.clone(), Some(20))).result.unwrap();
        assert_eq!(first.buffer.samples(), 20);

        let mut second = job(stream, Some(20));
        second.decoder = Some(first.decoder);
        let chunk = run_job(second).result.unwrap();
        assert!(chunk.buffer.is_empty());
        assert!(chunk.decoder.is_stream_over());
    }

    #[test]
    fn restart_at_end_loops_the_stream() {
        let stream: Arc<dyn InputStreamSource> = Arc::new(MemoryStreamSource::new(pcm_bytes(20)));
        let first = run_job(job(stream.clone(), Some(20))).result.unwrap();

        let mut second = job(stream, Some(20));
        second.decoder = Some(first.decoder);
        second.restart_at_end = true;
        let chunk = run_job(second).result.unwrap();
        assert!(chunk.restarted);
        assert_eq!(chunk.buffer.samples(), 20);
        assert_eq!(&chunk.buffer.bytes()[..2], &0i16.to_le_bytes());
    }

    #[test]
    fn consumed_single_use_stream_cannot_restart() {
        let stream: Arc<dyn InputStreamSource> = Arc::new(SingleStreamSource::new(Box::new(
            std::io::Cursor::new(pcm_bytes(20)),
        )));
        let first = run_job(job(stream.clone(), Some(20))).result.unwrap();

        let mut second = job(stream, Some(20));
        second.decoder = Some(first.decoder);
        second.restart_at_end = true;
        let err = run_job(second).result.unwrap_err();
        assert!(matches!(err, AudioError::CannotReadStream(_)));
    }

    #[test]
    fn pool_runs_jobs_and_wakes() {
        let (outcome_tx, outcome_rx) = unbounded();
        let (wake_tx, wake_rx) = bounded(1);
        let pool = DecodePool::new(2, outcome_tx, wake_tx).unwrap();

        let stream = Arc::new(MemoryStreamSource::new(pcm_bytes(50)));
        for _ in 0..4 {
            pool.submit(job(stream.clone(), Some(10)));
        }
        for _ in 0..4 {
            let outcome = outcome_rx
                .recv_timeout(std::time::Duration::from_secs(5))
                .unwrap();
            assert!(outcome.result.is_ok());
        }
        assert!(wake_rx.try_recv().is_ok());
        pool.shutdown();
    }
}
