//! Headless device backend.
//!
//! Implements the full primitive contract against in-memory state, with a
//! manual consumption clock (`MockDeviceHandle::complete`) instead of real
//! time. Used by the engine's own tests and by applications that want to run
//! the engine without an output device.

use super::{AudioDevice, BufferHandle, SourceHandle};
use crate::buffer::PcmSpec;
use crate::error::{AudioError, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

#[derive(Debug)]
struct MockSource {
    queued: VecDeque<BufferHandle>,
    processed: usize,
    playing: bool,
    gain: f32,
    pitch: f32,
    looping: bool,
    offset: usize,
}

impl MockSource {
    fn new() -> Self {
        Self {
            queued: VecDeque::new(),
            processed: 0,
            playing: false,
            gain: 1.0,
            pitch: 1.0,
            looping: false,
            offset: 0,
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    next_source: u32,
    next_buffer: u32,
    sources: HashMap<SourceHandle, MockSource>,
    order: Vec<SourceHandle>,
    buffers: HashMap<BufferHandle, usize>,
    uploaded_bytes: usize,
    upload_count: usize,
}

pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

/// Test-side view of a [`MockDevice`], valid after the device moved into the
/// control thread.
#[derive(Clone)]
pub struct MockDeviceHandle {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    pub fn handle(&self) -> MockDeviceHandle {
        MockDeviceHandle {
            state: self.state.clone(),
        }
    }
}

impl MockDeviceHandle {
    /// Device source handles in creation order.
    pub fn source_handles(&self) -> Vec<SourceHandle> {
        self.state.lock().unwrap().order.clone()
    }

    /// Marks up to `count` queued buffers of `source` as played. A playing
    /// non-looping source whose whole queue is consumed stops, like a native
    /// source draining to silence.
    pub fn complete(&self, source: SourceHandle, count: usize) {
        let mut state = self.state.lock().unwrap();
        if let Some(src) = state.sources.get_mut(&source) {
            src.processed = (src.processed + count).min(src.queued.len());
            src.offset = 0;
            if src.playing && !src.looping && src.processed == src.queued.len() {
                src.playing = false;
            }
        }
    }

    pub fn uploaded_bytes(&self) -> usize {
        self.state.lock().unwrap().uploaded_bytes
    }

    pub fn upload_count(&self) -> usize {
        self.state.lock().unwrap().upload_count
    }

    /// Buffer objects currently alive on the device.
    pub fn live_buffers(&self) -> usize {
        self.state.lock().unwrap().buffers.len()
    }

    pub fn source_count(&self) -> usize {
        self.state.lock().unwrap().sources.len()
    }

    pub fn queued(&self, source: SourceHandle) -> usize {
        let state = self.state.lock().unwrap();
        state.sources.get(&source).map_or(0, |s| s.queued.len())
    }

    pub fn is_playing(&self, source: SourceHandle) -> bool {
        let state = self.state.lock().unwrap();
        state.sources.get(&source).is_some_and(|s| s.playing)
    }

    pub fn gain(&self, source: SourceHandle) -> f32 {
        let state = self.state.lock().unwrap();
        state.sources.get(&source).map_or(0.0, |s| s.gain)
    }

    pub fn looping(&self, source: SourceHandle) -> bool {
        let state = self.state.lock().unwrap();
        state.sources.get(&source).is_some_and(|s| s.looping)
    }
}

fn unknown(source: SourceHandle) -> AudioError {
    AudioError::Device(format!("unknown device source {source:?}"))
}

impl AudioDevice for MockDevice {
    fn create_source(&mut self) -> Result<SourceHandle> {
        let mut state = self.state.lock().unwrap();
        state.next_source += 1;
        let handle = SourceHandle(state.next_source);
        state.sources.insert(handle, MockSource::new());
        state.order.push(handle);
        Ok(handle)
    }

    fn delete_source(&mut self, source: SourceHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.sources.remove(&source).ok_or(unknown(source))?;
        state.order.retain(|h| *h != source);
        Ok(())
    }

    fn create_buffer(&mut self, pcm: &[u8], _spec: PcmSpec) -> Result<BufferHandle> {
        let mut state = self.state.lock().unwrap();
        state.next_buffer += 1;
        let handle = BufferHandle(state.next_buffer);
        state.buffers.insert(handle, pcm.len());
        state.uploaded_bytes += pcm.len();
        state.upload_count += 1;
        Ok(handle)
    }

    fn delete_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .buffers
            .remove(&buffer)
            .ok_or_else(|| AudioError::Device(format!("unknown device buffer {buffer:?}")))?;
        Ok(())
    }

    fn queue_buffer(&mut self, source: SourceHandle, buffer: BufferHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let src = state.sources.get_mut(&source).ok_or(unknown(source))?;
        src.queued.push_back(buffer);
        Ok(())
    }

    fn unqueue_buffer(&mut self, source: SourceHandle) -> Result<Option<BufferHandle>> {
        let mut state = self.state.lock().unwrap();
        let src = state.sources.get_mut(&source).ok_or(unknown(source))?;
        if src.processed == 0 {
            return Ok(None);
        }
        src.processed -= 1;
        Ok(src.queued.pop_front())
    }

    fn play(&mut self, source: SourceHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let src = state.sources.get_mut(&source).ok_or(unknown(source))?;
        src.playing = true;
        Ok(())
    }

    fn pause(&mut self, source: SourceHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let src = state.sources.get_mut(&source).ok_or(unknown(source))?;
        src.playing = false;
        Ok(())
    }

    fn stop(&mut self, source: SourceHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let src = state.sources.get_mut(&source).ok_or(unknown(source))?;
        src.playing = false;
        src.offset = 0;
        // Stopping marks the whole queue processed, native-style.
        src.processed = src.queued.len();
        Ok(())
    }

    fn is_playing(&self, source: SourceHandle) -> bool {
        let state = self.state.lock().unwrap();
        state.sources.get(&source).is_some_and(|s| s.playing)
    }

    fn processed_buffers(&self, source: SourceHandle) -> usize {
        let state = self.state.lock().unwrap();
        state.sources.get(&source).map_or(0, |s| s.processed)
    }

    fn queued_buffers(&self, source: SourceHandle) -> usize {
        let state = self.state.lock().unwrap();
        state.sources.get(&source).map_or(0, |s| s.queued.len())
    }

    fn sample_offset(&self, source: SourceHandle) -> usize {
        let state = self.state.lock().unwrap();
        state.sources.get(&source).map_or(0, |s| s.offset)
    }

    fn set_sample_offset(&mut self, source: SourceHandle, samples: usize) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let src = state.sources.get_mut(&source).ok_or(unknown(source))?;
        src.offset = samples;
        Ok(())
    }

    fn set_gain(&mut self, source: SourceHandle, gain: f32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let src = state.sources.get_mut(&source).ok_or(unknown(source))?;
        src.gain = gain;
        Ok(())
    }

    fn gain(&self, source: SourceHandle) -> f32 {
        let state = self.state.lock().unwrap();
        state.sources.get(&source).map_or(0.0, |s| s.gain)
    }

    fn set_pitch(&mut self, source: SourceHandle, pitch: f32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let src = state.sources.get_mut(&source).ok_or(unknown(source))?;
        src.pitch = pitch;
        Ok(())
    }

    fn pitch(&self, source: SourceHandle) -> f32 {
        let state = self.state.lock().unwrap();
        state.sources.get(&source).map_or(1.0, |s| s.pitch)
    }

    fn set_looping(&mut self, source: SourceHandle, looping: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let src = state.sources.get_mut(&source).ok_or(unknown(source))?;
        src.looping = looping;
        Ok(())
    }

    fn looping(&self, source: SourceHandle) -> bool {
        let state = self.state.lock().unwrap();
        state.sources.get(&source).is_some_and(|s| s.looping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> PcmSpec {
        PcmSpec {
            channels: 1,
            sample_rate: 44100,
            bits_per_sample: 16,
        }
    }

    #[test]
    fn queue_complete_unqueue_cycle() {
        let mut dev = MockDevice::new();
        let handle = dev.handle();
        let s = dev.create_source().unwrap();
        let b1 = dev.create_buffer(&[0u8; 8], spec()).unwrap();
        let b2 = dev.create_buffer(&[0u8; 8], spec()).unwrap();
        dev.queue_buffer(s, b1).unwrap();
        dev.queue_buffer(s, b2).unwrap();
        dev.play(s).unwrap();

        assert_eq!(dev.processed_buffers(s), 0);
        handle.complete(s, 1);
        assert_eq!(dev.processed_buffers(s), 1);
        assert!(dev.is_playing(s));

        assert_eq!(dev.unqueue_buffer(s).unwrap(), Some(b1));
        assert_eq!(dev.unqueue_buffer(s).unwrap(), None);

        handle.complete(s, 1);
        assert!(!dev.is_playing(s), "drained source stops");
    }

    #[test]
    fn looping_source_never_drains() {
        let mut dev = MockDevice::new();
        let handle = dev.handle();
        let s = dev.create_source().unwrap();
        let b = dev.create_buffer(&[0u8; 8], spec()).unwrap();
        dev.queue_buffer(s, b).unwrap();
        dev.set_looping(s, true).unwrap();
        dev.play(s).unwrap();

        handle.complete(s, 1);
        assert!(dev.is_playing(s));
    }

    #[test]
    fn stop_marks_queue_processed() {
        let mut dev = MockDevice::new();
        let s = dev.create_source().unwrap();
        for _ in 0..3 {
            let b = dev.create_buffer(&[0u8; 4], spec()).unwrap();
            dev.queue_buffer(s, b).unwrap();
        }
        dev.play(s).unwrap();
        dev.stop(s).unwrap();
        assert_eq!(dev.processed_buffers(s), 3);
        assert!(!dev.is_playing(s));
    }
}
