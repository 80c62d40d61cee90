use rubato::{FftFixedIn, Resampler};

use super::FeatureError;

const CHUNK_SIZE: usize = 1024;
const SUB_CHUNKS: usize = 2;

/// Converts mono samples from `from` Hz to `to` Hz
///
/// The output is delay-compensated and holds `len * to / from` samples.
///
/// # Errors
/// Returns error if either rate is zero or the resampler fails
pub fn resample(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>, FeatureError> {
    if from == 0 || to == 0 {
        return Err(FeatureError::Resample(format!(
            "invalid sample rates {from} -> {to}"
        )));
    }
    if from == to || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler =
        FftFixedIn::<f32>::new(from as usize, to as usize, CHUNK_SIZE, SUB_CHUNKS, 1)
            .map_err(|e| FeatureError::Resample(e.to_string()))?;

    let expected = usize::try_from(samples.len() as u64 * u64::from(to) / u64::from(from))
        .map_err(|e| FeatureError::Resample(e.to_string()))?;
    let delay = resampler.output_delay();
    let mut output = Vec::with_capacity(expected + delay + CHUNK_SIZE);

    let mut position = 0;
    while samples.len() - position >= resampler.input_frames_next() {
        let end = position + resampler.input_frames_next();
        let chunk = resampler
            .process(&[&samples[position..end]][..], None)
            .map_err(|e| FeatureError::Resample(e.to_string()))?;
        output.extend_from_slice(&chunk[0]);
        position = end;
    }

    if position < samples.len() {
        let tail: [&[f32]; 1] = [&samples[position..]];
        let chunk = resampler
            .process_partial(Some(&tail[..]), None)
            .map_err(|e| FeatureError::Resample(e.to_string()))?;
        output.extend_from_slice(&chunk[0]);
    }

    // drain the filter until the delayed tail is out
    while output.len() < expected + delay {
        let chunk = resampler
            .process_partial::<&[f32]>(None, None)
            .map_err(|e| FeatureError::Resample(e.to_string()))?;
        if chunk[0].is_empty() {
            break;
        }
        output.extend_from_slice(&chunk[0]);
    }

    output.drain(..delay.min(output.len()));
    output.truncate(expected);

    tracing::debug!(from, to, input = samples.len(), output = output.len(), "resampled");

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn sine(sample_rate: u32, seconds: f32, frequency: f32) -> Vec<f32> {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let len = (sample_rate as f32 * seconds) as usize;
        (0..len)
            .map(|i| 0.5 * (2.0 * PI * frequency * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn test_same_rate_is_identity() {
        let samples = vec![0.1, -0.2, 0.3];
        assert_eq!(resample(&samples, 16000, 16000).unwrap(), samples);
    }

    #[test]
    fn test_zero_rate_is_rejected() {
        assert!(matches!(
            resample(&[0.0], 0, 16000),
            Err(FeatureError::Resample(_))
        ));
    }

    #[test]
    fn test_downsample_length() {
        let samples = sine(44100, 1.0, 440.0);
        let output = resample(&samples, 44100, 16000).unwrap();
        assert_eq!(output.len(), 16000);
    }

    #[test]
    fn test_upsample_length() {
        let samples = sine(8000, 0.5, 440.0);
        let output = resample(&samples, 8000, 16000).unwrap();
        assert_eq!(output.len(), 8000);
    }

    #[test]
    fn test_downsample_preserves_amplitude() {
        let samples = sine(48000, 1.0, 440.0);
        let output = resample(&samples, 48000, 16000).unwrap();

        // Skip the edges where the filter ramps
        let peak = output[2000..14000]
            .iter()
            .fold(0.0_f32, |acc, &v| acc.max(v.abs()));
        assert!((peak - 0.5).abs() < 0.05, "peak was {peak}");
    }

    #[test]
    fn test_short_input_is_resampled() {
        let samples = vec![0.0; 100];
        let output = resample(&samples, 48000, 16000).unwrap();
        assert_eq!(output.len(), 33);
    }
}
