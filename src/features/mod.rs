/// Audio container decoding
pub mod decode;
/// Kaldi-compatible filter bank
pub mod fbank;
/// Sample-rate conversion
pub mod resample;

pub use decode::{decode, DecodedAudio};
pub use fbank::{compute_fbank, FbankComputer};
pub use resample::resample;

use thiserror::Error;

/// Sample rate the model was trained on
pub const SAMPLE_RATE: u32 = 16000;
/// Frames per model input (10.24 s)
pub const NUM_FRAMES: usize = 1024;
/// Mel bins per frame
pub const NUM_MEL_BINS: usize = 128;

/// Errors that can occur while turning audio into features
#[derive(Debug, Error)]
pub enum FeatureError {
    /// The audio couldn't be decoded
    #[error("failed to decode audio: {0}")]
    Decode(String),

    /// The container holds no decodable track
    #[error("no audio track found")]
    NoAudioTrack,

    /// Sample-rate conversion failed
    #[error("failed to resample: {0}")]
    Resample(String),

    /// There are no samples to analyse
    #[error("the samples array is empty, no features to compute")]
    Empty,
}

/// Decodes an audio file and computes its filter bank, capped at [`NUM_FRAMES`] rows
///
/// # Errors
/// Returns error if decoding or resampling fails or the file holds no samples
pub fn extract(bytes: Vec<u8>, extension: Option<&str>) -> Result<Vec<[f32; NUM_MEL_BINS]>, FeatureError> {
    let audio = decode(bytes, extension)?;
    let samples = resample(&audio.samples, audio.sample_rate, SAMPLE_RATE)?;

    let mut features = compute_fbank(&samples)?;
    features.truncate(NUM_FRAMES);

    Ok(features)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn wav(sample_rate: u32, samples: &[f32]) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &sample in samples {
                writer.write_sample(sample).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn test_extract_one_second() {
        let features = extract(wav(16000, &vec![0.01; 16000]), Some("wav")).unwrap();
        assert_eq!(features.len(), 98);
    }

    #[test]
    fn test_extract_resamples_first() {
        // 1 s at 32 kHz becomes 16000 samples before framing
        let features = extract(wav(32000, &vec![0.01; 32000]), Some("wav")).unwrap();
        assert_eq!(features.len(), 98);
    }

    #[test]
    fn test_extract_caps_frame_count() {
        let features = extract(wav(16000, &vec![0.01; 16000 * 12]), Some("wav")).unwrap();
        assert_eq!(features.len(), NUM_FRAMES);
    }

    #[test]
    fn test_extract_empty_wav_fails() {
        let result = extract(wav(16000, &[]), Some("wav"));
        assert!(matches!(result, Err(FeatureError::Empty)));
    }
}
