//! Kaldi-compatible log mel filter bank
//!
//! Matches `kaldi-native-fbank` configured as the AST training pipeline
//! configured it: 16 kHz, 25 ms Hanning frames every 10 ms, no dither, HTK
//! compatible ordering without an energy coefficient.

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

use super::{FeatureError, NUM_MEL_BINS, SAMPLE_RATE};

/// Samples per frame (25 ms)
pub const FRAME_LENGTH: usize = 400;
/// Samples between frame starts (10 ms)
pub const FRAME_SHIFT: usize = 160;

const PADDED_LENGTH: usize = 512;
const PREEMPHASIS: f32 = 0.97;
const LOW_FREQ: f32 = 20.0;

/// Number of complete frames in `num_samples` samples
#[must_use]
pub const fn num_frames(num_samples: usize) -> usize {
    if num_samples < FRAME_LENGTH {
        0
    } else {
        1 + (num_samples - FRAME_LENGTH) / FRAME_SHIFT
    }
}

fn mel_scale(freq: f32) -> f32 {
    1127.0 * (1.0 + freq / 700.0).ln()
}

/// One triangular filter: first FFT bin it covers and its weights
struct MelBin {
    offset: usize,
    weights: Vec<f32>,
}

/// Reusable filter-bank extractor
///
/// Holds the FFT plan, window and mel filters so they're built once per
/// extractor rather than per call.
pub struct FbankComputer {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    mel_bins: Vec<MelBin>,
}

impl Default for FbankComputer {
    fn default() -> Self {
        Self::new()
    }
}

impl FbankComputer {
    /// Builds the extractor for 16 kHz input
    #[must_use]
    pub fn new() -> Self {
        let fft = FftPlanner::<f32>::new().plan_fft_forward(PADDED_LENGTH);

        #[allow(clippy::cast_precision_loss)]
        let step = 2.0 * PI / (FRAME_LENGTH - 1) as f32;
        #[allow(clippy::cast_precision_loss)]
        let window = (0..FRAME_LENGTH)
            .map(|i| 0.5 - 0.5 * (step * i as f32).cos())
            .collect();

        Self {
            fft,
            window,
            mel_bins: mel_bins(),
        }
    }

    /// Computes one row of log mel energies per 10 ms frame
    ///
    /// Input shorter than one frame yields no rows.
    ///
    /// # Errors
    /// Returns error if `samples` is empty
    pub fn compute(&self, samples: &[f32]) -> Result<Vec<[f32; NUM_MEL_BINS]>, FeatureError> {
        if samples.is_empty() {
            return Err(FeatureError::Empty);
        }

        let frames = num_frames(samples.len());
        let mut features = Vec::with_capacity(frames);
        let mut frame = vec![0.0_f32; FRAME_LENGTH];
        let mut spectrum = vec![Complex::new(0.0_f32, 0.0); PADDED_LENGTH];
        let mut power = vec![0.0_f32; PADDED_LENGTH / 2 + 1];

        for index in 0..frames {
            let start = index * FRAME_SHIFT;
            frame.copy_from_slice(&samples[start..start + FRAME_LENGTH]);
            self.process_window(&mut frame);

            for (slot, &value) in spectrum.iter_mut().zip(frame.iter()) {
                *slot = Complex::new(value, 0.0);
            }
            for slot in &mut spectrum[FRAME_LENGTH..] {
                *slot = Complex::new(0.0, 0.0);
            }
            self.fft.process(&mut spectrum);

            for (p, c) in power.iter_mut().zip(&spectrum) {
                *p = c.norm_sqr();
            }

            let mut row = [0.0_f32; NUM_MEL_BINS];
            for (energy, bin) in row.iter_mut().zip(&self.mel_bins) {
                let sum: f32 = power[bin.offset..bin.offset + bin.weights.len()]
                    .iter()
                    .zip(&bin.weights)
                    .map(|(p, w)| p * w)
                    .sum();
                *energy = sum.max(f32::EPSILON).ln();
            }
            features.push(row);
        }

        Ok(features)
    }

    /// DC removal, pre-emphasis and windowing, in place
    fn process_window(&self, frame: &mut [f32]) {
        #[allow(clippy::cast_precision_loss)]
        let mean = frame.iter().sum::<f32>() / frame.len() as f32;
        for sample in frame.iter_mut() {
            *sample -= mean;
        }

        for i in (1..frame.len()).rev() {
            frame[i] -= PREEMPHASIS * frame[i - 1];
        }
        frame[0] -= PREEMPHASIS * frame[0];

        for (sample, w) in frame.iter_mut().zip(&self.window) {
            *sample *= w;
        }
    }
}

/// Triangular filters evenly spaced on the mel scale from 20 Hz to Nyquist
fn mel_bins() -> Vec<MelBin> {
    #[allow(clippy::cast_precision_loss)]
    let sample_rate = SAMPLE_RATE as f32;
    #[allow(clippy::cast_precision_loss)]
    let bin_width = sample_rate / PADDED_LENGTH as f32;
    let num_fft_bins = PADDED_LENGTH / 2;

    let mel_low = mel_scale(LOW_FREQ);
    let mel_high = mel_scale(sample_rate / 2.0);
    #[allow(clippy::cast_precision_loss)]
    let mel_delta = (mel_high - mel_low) / (NUM_MEL_BINS + 1) as f32;

    (0..NUM_MEL_BINS)
        .map(|bin| {
            #[allow(clippy::cast_precision_loss)]
            let left = mel_low + bin as f32 * mel_delta;
            let center = left + mel_delta;
            let right = center + mel_delta;

            let mut offset = None;
            let mut weights = Vec::new();
            for i in 0..num_fft_bins {
                #[allow(clippy::cast_precision_loss)]
                let mel = mel_scale(bin_width * i as f32);
                if mel > left && mel < right {
                    let weight = if mel <= center {
                        (mel - left) / (center - left)
                    } else {
                        (right - mel) / (right - center)
                    };
                    offset.get_or_insert(i);
                    weights.push(weight);
                }
            }

            MelBin {
                offset: offset.unwrap_or(0),
                weights,
            }
        })
        .collect()
}

/// Computes the filter bank of `samples` with a one-off extractor
///
/// # Errors
/// Returns error if `samples` is empty
pub fn compute_fbank(samples: &[f32]) -> Result<Vec<[f32; NUM_MEL_BINS]>, FeatureError> {
    FbankComputer::new().compute(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generate_sine_wave(sample_rate: usize, duration: usize, frequency: f32) -> Vec<f32> {
        let waveform_size = sample_rate * duration;
        (0..waveform_size)
            .map(|i| 0.5 * (2.0 * PI * frequency * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn test_num_frames() {
        assert_eq!(num_frames(0), 0);
        assert_eq!(num_frames(399), 0);
        assert_eq!(num_frames(400), 1);
        assert_eq!(num_frames(559), 1);
        assert_eq!(num_frames(560), 2);
        assert_eq!(num_frames(16000), 98);
    }

    #[test]
    fn test_empty_input_fails() {
        assert!(matches!(compute_fbank(&[]), Err(FeatureError::Empty)));
    }

    #[test]
    fn test_short_input_has_no_frames() {
        assert!(compute_fbank(&[0.1; 100]).unwrap().is_empty());
    }

    #[test]
    fn test_silence_hits_log_floor() {
        let features = compute_fbank(&[0.0; 1600]).unwrap();

        assert_eq!(features.len(), 8);
        let floor = f32::EPSILON.ln();
        assert!(features
            .iter()
            .flatten()
            .all(|&v| (v - floor).abs() < 1e-5));
    }

    #[test]
    fn test_sine_peaks_in_matching_mel_bin() {
        // 440 Hz sits at mel 549.6, centre of filter 22 or 23
        let waveform = generate_sine_wave(16000, 1, 440.0);
        let features = compute_fbank(&waveform).unwrap();

        assert_eq!(features.len(), 98);
        let middle = &features[50];
        let peak = middle
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert!((21..=24).contains(&peak), "peak bin was {peak}");
    }

    #[test]
    fn test_every_filter_covers_some_bins() {
        let bins = mel_bins();
        assert_eq!(bins.len(), NUM_MEL_BINS);
        // The lowest filters are narrower than an FFT bin at 512 points; the
        // rest must each cover at least one bin.
        assert!(bins[10..].iter().all(|bin| !bin.weights.is_empty()));
        assert!(bins
            .iter()
            .flat_map(|bin| &bin.weights)
            .all(|&w| (0.0..=1.0).contains(&w)));
    }

    #[test]
    fn test_louder_input_has_higher_energy() {
        let quiet = generate_sine_wave(16000, 1, 1000.0);
        let loud: Vec<f32> = quiet.iter().map(|v| v * 1.8).collect();

        let quiet_features = compute_fbank(&quiet).unwrap();
        let loud_features = compute_fbank(&loud).unwrap();

        let total = |features: &[[f32; NUM_MEL_BINS]]| -> f32 { features[40].iter().sum() };
        assert!(total(&loud_features[..]) > total(&quiet_features[..]));
    }
}
