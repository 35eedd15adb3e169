//! Audio buffers shared between the capture and playback paths
//!
//! The capture side uses a single-producer single-consumer ring buffer fed
//! from the device callback. The playback side uses an ordered queue of
//! undecoded chunks and immutable decoded PCM buffers.

use bytes::Bytes;
use crossbeam::queue::ArrayQueue;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::audio::resample::resample_clip;
use crate::error::AudioError;
use crate::protocol::AudioEncoding;

/// Block of samples delivered by one device callback
#[derive(Clone)]
pub struct AudioFrame {
    /// Interleaved audio samples (f32)
    pub samples: Vec<f32>,
    /// Number of channels
    pub channels: u16,
    /// Timestamp in microseconds since capture start
    pub timestamp: u64,
    /// Callback sequence number
    pub sequence: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, channels: u16, timestamp: u64, sequence: u32) -> Self {
        Self {
            samples,
            channels,
            timestamp,
            sequence,
        }
    }

    /// Get number of samples per channel
    pub fn samples_per_channel(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Average the channels into mono, appending to `out`
    pub fn mix_to_mono(&self, out: &mut Vec<f32>) {
        let channels = self.channels.max(1) as usize;
        if channels == 1 {
            out.extend_from_slice(&self.samples);
            return;
        }
        out.extend(
            self.samples
                .chunks_exact(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32),
        );
    }
}

/// Lock-free ring buffer for audio frames
pub struct RingBuffer {
    queue: ArrayQueue<AudioFrame>,
    overflow_count: AtomicUsize,
}

impl RingBuffer {
    /// Create a new ring buffer with the specified capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            overflow_count: AtomicUsize::new(0),
        }
    }

    /// Push a frame into the buffer
    /// Returns false if buffer is full (overflow)
    pub fn push(&self, frame: AudioFrame) -> bool {
        match self.queue.push(frame) {
            Ok(()) => true,
            Err(_) => {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Pop a frame, or None when the buffer is empty
    pub fn try_pop(&self) -> Option<AudioFrame> {
        self.queue.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Get overflow count
    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }
}

/// Thread-safe handle to a ring buffer
pub type SharedRingBuffer = Arc<RingBuffer>;

/// Create a new shared ring buffer
pub fn create_shared_buffer(capacity: usize) -> SharedRingBuffer {
    Arc::new(RingBuffer::new(capacity))
}

/// Decoded mono audio ready for scheduling
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl PcmBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: Arc::from(samples.into_boxed_slice()),
            sample_rate: sample_rate.max(1),
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Copy at `target_rate`, keeping the duration
    pub fn resampled(&self, target_rate: u32) -> Result<PcmBuffer, AudioError> {
        if target_rate == self.sample_rate || self.samples.is_empty() {
            return Ok(self.clone());
        }
        let samples = resample_clip(&self.samples, self.sample_rate, target_rate)?;
        Ok(PcmBuffer::new(samples, target_rate))
    }
}

/// One undecoded unit of inbound audio
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Immutable payload bytes
    pub payload: Bytes,
    pub encoding: AudioEncoding,
    /// Arrival order, assigned by the output queue
    pub sequence: u64,
}

impl AudioChunk {
    pub fn new(payload: impl Into<Bytes>, encoding: AudioEncoding) -> Self {
        Self {
            payload: payload.into(),
            encoding,
            sequence: 0,
        }
    }
}

/// FIFO of chunks waiting for the decode worker
#[derive(Debug, Default)]
pub struct OutputQueue {
    items: VecDeque<AudioChunk>,
    next_sequence: u64,
}

impl OutputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk, stamping its arrival order
    pub fn push(&mut self, mut chunk: AudioChunk) -> u64 {
        chunk.sequence = self.next_sequence;
        self.next_sequence += 1;
        self.items.push_back(chunk);
        self.next_sequence - 1
    }

    pub fn pop(&mut self) -> Option<AudioChunk> {
        self.items.pop_front()
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.items.len();
        self.items.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_basic() {
        let buffer = RingBuffer::new(4);

        let frame1 = AudioFrame::new(vec![0.0; 480], 1, 0, 0);
        let frame2 = AudioFrame::new(vec![1.0; 480], 1, 10000, 1);

        assert!(buffer.push(frame1));
        assert!(buffer.push(frame2));
        assert_eq!(buffer.len(), 2);

        assert_eq!(buffer.try_pop().unwrap().sequence, 0);
        assert_eq!(buffer.try_pop().unwrap().sequence, 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_ring_buffer_overflow() {
        let buffer = RingBuffer::new(1);
        assert!(buffer.push(AudioFrame::new(vec![], 1, 0, 0)));
        assert!(!buffer.push(AudioFrame::new(vec![], 1, 0, 1)));
        assert_eq!(buffer.overflow_count(), 1);
    }

    #[test]
    fn test_mix_to_mono() {
        let frame = AudioFrame::new(vec![1.0, 0.0, 0.5, 0.5], 2, 0, 0);
        let mut out = Vec::new();
        frame.mix_to_mono(&mut out);
        assert_eq!(out, vec![0.5, 0.5]);
        assert_eq!(frame.samples_per_channel(), 2);
    }

    #[test]
    fn test_pcm_buffer_duration() {
        let buffer = PcmBuffer::new(vec![0.0; 4800], 24_000);
        assert!((buffer.duration() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_resample_halves_length() {
        let buffer = PcmBuffer::new(vec![0.25; 4_800], 48_000);
        let resampled = buffer.resampled(24_000).unwrap();

        assert_eq!(resampled.sample_rate(), 24_000);
        assert_eq!(resampled.len(), 2_400);
        assert!((resampled.duration() - buffer.duration()).abs() < 1e-6);
        assert!((resampled.samples()[1_200] - 0.25).abs() < 0.01);
    }

    #[test]
    fn test_output_queue_stamps_arrival_order() {
        let mut queue = OutputQueue::new();
        queue.push(AudioChunk::new(vec![1u8, 2], AudioEncoding::Pcm));
        queue.push(AudioChunk::new(vec![3u8, 4], AudioEncoding::Pcm));

        assert_eq!(queue.pop().unwrap().sequence, 0);
        assert_eq!(queue.pop().unwrap().sequence, 1);
        assert!(queue.pop().is_none());
    }
}
