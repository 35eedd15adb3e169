//! Frequency-domain level analysis for the meter
//!
//! Mirrors the behaviour of a browser analyser node: the most recent
//! `fft_size` samples are Blackman-windowed, transformed, smoothed over time
//! and mapped from decibels onto a byte scale.

use std::collections::VecDeque;
use std::f32::consts::PI;

const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;
const SMOOTHING: f32 = 0.8;

/// Sliding-window spectrum analyser
pub struct SpectrumAnalyser {
    fft_size: usize,
    history: VecDeque<f32>,
    window: Vec<f32>,
    smoothed: Vec<f32>,
}

impl SpectrumAnalyser {
    pub fn new(fft_size: usize) -> Self {
        let fft_size = fft_size.max(2);
        let window = (0..fft_size)
            .map(|n| {
                let x = n as f32 / fft_size as f32;
                0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
            })
            .collect();
        Self {
            fft_size,
            history: VecDeque::from(vec![0.0; fft_size]),
            window,
            smoothed: vec![0.0; fft_size / 2],
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Feed newly rendered or captured samples
    pub fn push_samples(&mut self, samples: &[f32]) {
        let skip = samples.len().saturating_sub(self.fft_size);
        for &sample in &samples[skip..] {
            self.history.pop_front();
            self.history.push_back(sample);
        }
    }

    /// Replace the window with exactly these samples (zero-padded in front)
    pub fn load_window(&mut self, samples: &[f32]) {
        self.history.iter_mut().for_each(|s| *s = 0.0);
        self.push_samples(samples);
    }

    /// Forget the signal history and smoothing state
    pub fn reset(&mut self) {
        self.history.iter_mut().for_each(|s| *s = 0.0);
        self.smoothed.iter_mut().for_each(|s| *s = 0.0);
    }

    /// Write one byte per bin into `out` (extra slots are left untouched)
    pub fn byte_frequency_data(&mut self, out: &mut [u8]) {
        let n = self.fft_size;
        let windowed: Vec<f32> = self
            .history
            .iter()
            .zip(&self.window)
            .map(|(sample, weight)| sample * weight)
            .collect();

        let bins = self.frequency_bin_count().min(out.len());
        for k in 0..self.frequency_bin_count() {
            let mut re = 0.0f32;
            let mut im = 0.0f32;
            let step = 2.0 * PI * k as f32 / n as f32;
            for (i, value) in windowed.iter().enumerate() {
                let angle = step * i as f32;
                re += value * angle.cos();
                im -= value * angle.sin();
            }
            let magnitude = (re * re + im * im).sqrt() / n as f32;
            self.smoothed[k] = SMOOTHING * self.smoothed[k] + (1.0 - SMOOTHING) * magnitude;

            if k < bins {
                out[k] = to_byte(self.smoothed[k]);
            }
        }
    }
}

fn to_byte(magnitude: f32) -> u8 {
    if magnitude <= 0.0 {
        return 0;
    }
    let db = 20.0 * magnitude.log10();
    let scaled = 255.0 * (db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS);
    scaled.clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_is_zero() {
        let mut analyser = SpectrumAnalyser::new(128);
        analyser.push_samples(&[0.0; 512]);

        let mut out = [7u8; 64];
        analyser.byte_frequency_data(&mut out);
        assert!(out.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_sine_peaks_at_its_bin() {
        let mut analyser = SpectrumAnalyser::new(256);
        let bin = 16;
        let samples: Vec<f32> = (0..256)
            .map(|i| 0.05 * (2.0 * PI * bin as f32 * i as f32 / 256.0).sin())
            .collect();

        let mut out = [0u8; 128];
        for _ in 0..20 {
            analyser.load_window(&samples);
            analyser.byte_frequency_data(&mut out);
        }

        let peak = out
            .iter()
            .enumerate()
            .max_by_key(|(_, v)| **v)
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, bin);
        assert!(out[bin] > 200);
        assert!(out[100] < out[bin]);
    }

    #[test]
    fn test_reset_clears_smoothing() {
        let mut analyser = SpectrumAnalyser::new(64);
        analyser.push_samples(&vec![0.5; 64]);
        let mut out = [0u8; 32];
        analyser.byte_frequency_data(&mut out);
        assert!(out[0] > 0);

        analyser.reset();
        analyser.byte_frequency_data(&mut out);
        assert_eq!(out[0], 0);
    }

    #[test]
    fn test_short_output_slice() {
        let mut analyser = SpectrumAnalyser::new(128);
        let mut out = [0u8; 8];
        analyser.byte_frequency_data(&mut out);
        assert_eq!(analyser.frequency_bin_count(), 64);
    }
}
