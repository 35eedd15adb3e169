//! Sample-rate conversion
//!
//! A thin stateful wrapper around rubato's synchronous FFT resampler. Input
//! is accumulated across calls and pushed through in fixed 10 ms chunks, so
//! a stream resampled block by block keeps the exact rate ratio.

use audioadapter_buffers::direct::SequentialSliceOfVecs;
use rubato::{Fft, FixedSync, Resampler};

use crate::error::AudioError;

/// Lowest latency split of the FFT
const SUB_CHUNKS: usize = 1;

/// Everything here is mono
const MONO: usize = 1;

/// Streaming mono resampler
pub struct StreamResampler {
    resampler: Fft<f32>,
    from_rate: u32,
    to_rate: u32,
    /// Input not yet consumed by the resampler
    input_buffer: Vec<f32>,
    work_in: Vec<Vec<f32>>,
    work_out: Vec<Vec<f32>>,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self, AudioError> {
        let chunk_size = (from_rate as usize / 100).max(1);
        let resampler = Fft::<f32>::new(
            from_rate as usize,
            to_rate as usize,
            chunk_size,
            SUB_CHUNKS,
            MONO,
            FixedSync::Input,
        )
        .map_err(|e| {
            AudioError::Resample(format!("{} Hz -> {} Hz: {}", from_rate, to_rate, e))
        })?;

        let input_frames_max = resampler.input_frames_max();
        let output_frames_max = resampler.output_frames_max();

        Ok(Self {
            resampler,
            from_rate,
            to_rate,
            input_buffer: Vec::new(),
            work_in: vec![vec![0.0; input_frames_max]],
            work_out: vec![vec![0.0; output_frames_max]],
        })
    }

    pub fn from_rate(&self) -> u32 {
        self.from_rate
    }

    pub fn to_rate(&self) -> u32 {
        self.to_rate
    }

    /// Input frames consumed per resampler pass
    pub fn chunk_size(&self) -> usize {
        self.resampler.input_frames_next()
    }

    /// Output frames of filter delay at the head of the stream
    pub fn output_delay(&self) -> usize {
        self.resampler.output_delay()
    }

    /// Input held back until a full chunk is available
    pub fn pending(&self) -> usize {
        self.input_buffer.len()
    }

    /// Feed samples; returns whatever full chunks produced (may be empty)
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>, AudioError> {
        self.input_buffer.extend_from_slice(samples);
        let mut output = Vec::new();

        while self.input_buffer.len() >= self.resampler.input_frames_next() {
            let frames_needed = self.resampler.input_frames_next();
            self.work_in[0][..frames_needed].copy_from_slice(&self.input_buffer[..frames_needed]);
            self.input_buffer.drain(..frames_needed);

            let input_adapter = SequentialSliceOfVecs::new(&self.work_in[..], MONO, frames_needed)
                .map_err(|e| AudioError::Resample(e.to_string()))?;
            let output_frames = self.resampler.output_frames_next();
            let mut output_adapter =
                SequentialSliceOfVecs::new_mut(&mut self.work_out[..], MONO, output_frames)
                    .map_err(|e| AudioError::Resample(e.to_string()))?;

            let (_, frames_written) = self
                .resampler
                .process_into_buffer(&input_adapter, &mut output_adapter, None)
                .map_err(|e| AudioError::Resample(e.to_string()))?;

            output.extend_from_slice(&self.work_out[0][..frames_written]);
        }

        Ok(output)
    }

    /// Pad the held-back tail with silence and push it through
    pub fn flush(&mut self) -> Result<Vec<f32>, AudioError> {
        if self.input_buffer.is_empty() {
            return Ok(Vec::new());
        }
        let chunk = self.resampler.input_frames_next();
        self.input_buffer.resize(chunk, 0.0);
        self.process(&[])
    }
}

/// Resample a complete clip, trimming the filter delay
///
/// The result has `round(len * to / from)` samples.
pub fn resample_clip(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, AudioError> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let expected = ((samples.len() as u64 * to_rate as u64 + from_rate as u64 / 2) / from_rate as u64) as usize;
    let mut resampler = StreamResampler::new(from_rate, to_rate)?;
    let delay = resampler.output_delay();

    let mut output = resampler.process(samples)?;
    output.extend(resampler.flush()?);
    let silence = vec![0.0; resampler.chunk_size()];
    while output.len() < delay + expected {
        output.extend(resampler.process(&silence)?);
    }

    output.drain(..delay);
    output.truncate(expected);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(len: usize, rate: u32, offset: usize) -> Vec<f32> {
        (0..len)
            .map(|i| {
                let t = (offset + i) as f32 / rate as f32;
                (2.0 * std::f32::consts::PI * 440.0 * t).sin() * 0.5
            })
            .collect()
    }

    #[test]
    fn test_resampler_creation() {
        assert!(StreamResampler::new(44_100, 16_000).is_ok());
        assert!(StreamResampler::new(48_000, 24_000).is_ok());
        assert!(StreamResampler::new(16_000, 48_000).is_ok());
    }

    #[test]
    fn test_empty_input_yields_nothing() {
        let mut resampler = StreamResampler::new(44_100, 16_000).unwrap();
        assert!(resampler.process(&[]).unwrap().is_empty());
        assert!(resampler.flush().unwrap().is_empty());
    }

    #[test]
    fn test_block_by_block_keeps_rate() {
        // Odd-sized device blocks must not round each block on its own
        let mut resampler = StreamResampler::new(44_100, 16_000).unwrap();
        let blocks = 861;
        let block = 512;
        let mut produced = 0usize;
        for n in 0..blocks {
            produced += resampler.process(&sine(block, 44_100, n * block)).unwrap().len();
        }

        let expected = (blocks * block) as f64 * 16_000.0 / 44_100.0;
        assert!(produced as f64 <= expected + 1.0, "{} > {}", produced, expected);
        assert!(expected - (produced as f64) < 1_000.0, "{} << {}", produced, expected);
    }

    #[test]
    fn test_clip_length_matches_ratio() {
        let clip = vec![0.0; 480];
        assert_eq!(resample_clip(&clip, 48_000, 24_000).unwrap().len(), 240);
        assert_eq!(resample_clip(&clip, 48_000, 16_000).unwrap().len(), 160);
        assert_eq!(resample_clip(&clip[..441], 44_100, 24_000).unwrap().len(), 240);
    }

    #[test]
    fn test_clip_keeps_level() {
        let clip = vec![0.5; 4_800];
        let resampled = resample_clip(&clip, 48_000, 24_000).unwrap();

        assert_eq!(resampled.len(), 2_400);
        assert!((resampled[1_200] - 0.5).abs() < 0.02, "{}", resampled[1_200]);
    }

    #[test]
    fn test_same_rate_is_untouched() {
        let clip = vec![0.1, 0.2, 0.3];
        assert_eq!(resample_clip(&clip, 24_000, 24_000).unwrap(), clip);
    }
}
