use std::io::Cursor;
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};

use super::FeatureError;

/// Mono PCM samples in `[-1, 1]`
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    /// Channel-averaged samples
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
}

/// Decodes an in-memory audio file to mono
///
/// WAV goes through `hound`; everything else is probed by `symphonia`, using
/// `extension` (without the dot) as a format hint.
///
/// # Errors
/// Returns error if the container or codec isn't supported or the data is corrupt
pub fn decode(bytes: Vec<u8>, extension: Option<&str>) -> Result<DecodedAudio, FeatureError> {
    let is_wav = extension.is_some_and(|ext| ext.eq_ignore_ascii_case("wav"))
        || (bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE");

    let audio = if is_wav {
        decode_wav(bytes)?
    } else {
        decode_compressed(bytes, extension)?
    };

    tracing::debug!(
        samples = audio.samples.len(),
        sample_rate = audio.sample_rate,
        "audio decoded"
    );

    Ok(audio)
}

fn decode_wav(bytes: Vec<u8>) -> Result<DecodedAudio, FeatureError> {
    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| FeatureError::Decode(format!("invalid WAV: {e}")))?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| FeatureError::Decode(format!("invalid WAV samples: {e}")))?,
        hound::SampleFormat::Int => {
            #[allow(clippy::cast_precision_loss)]
            let scale = (1_i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|sample| sample.map(|s| s as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(|e| FeatureError::Decode(format!("invalid WAV samples: {e}")))?
        }
    };

    Ok(DecodedAudio {
        samples: downmix(&interleaved, usize::from(spec.channels)),
        sample_rate: spec.sample_rate,
    })
}

fn decode_compressed(bytes: Vec<u8>, extension: Option<&str>) -> Result<DecodedAudio, FeatureError> {
    let stream = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            stream,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| FeatureError::Decode(format!("unrecognized audio format: {e}")))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|track| track.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(FeatureError::NoAudioTrack)?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| FeatureError::Decode(format!("unsupported codec: {e}")))?;

    let mut channels = 0_usize;
    let mut interleaved = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(FeatureError::Decode(format!("failed to read packet: {e}"))),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // corrupt frames are skipped, as players do
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::warn!(error = e, "skipping undecodable packet");
                continue;
            }
            Err(e) => return Err(FeatureError::Decode(format!("failed to decode packet: {e}"))),
        };

        let spec = *decoded.spec();
        channels = spec.channels.count();
        sample_rate.get_or_insert(spec.rate);

        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);
        interleaved.extend_from_slice(buffer.samples());
    }

    let sample_rate = sample_rate
        .ok_or_else(|| FeatureError::Decode("stream has no sample rate".to_owned()))?;

    Ok(DecodedAudio {
        samples: downmix(&interleaved, channels.max(1)),
        sample_rate,
    })
}

/// Averages interleaved frames down to one channel
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    #[allow(clippy::cast_precision_loss)]
    let scale = channels as f32;
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / scale)
        .collect()
}
