use serde::{Deserialize, Serialize};
use std::fmt;

/// AudioSet class index for "Speech"
pub const SPEECH_CLASS: usize = 0;
/// AudioSet class index for "Music"
pub const MUSIC_CLASS: usize = 137;
/// AudioSet class index for "Noise"
pub const NOISE_CLASS: usize = 513;

/// Probability below which speech and music are both considered absent
pub const PRESENCE_THRESHOLD: f32 = 0.5;

/// Coarse label assigned to an audio clip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Label {
    /// Dominated by speech
    Speech,
    /// Dominated by music
    Music,
    /// Neither speech nor music
    Noise,
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Speech => "Speech",
            Self::Music => "Music",
            Self::Noise => "Noise",
        };
        f.write_str(name)
    }
}

/// Picks a label from one row of per-class probabilities
///
/// Returns `None` if the row is too short to hold the noise class.
#[must_use]
pub fn decide(probabilities: &[f32]) -> Option<Label> {
    let speech = *probabilities.get(SPEECH_CLASS)?;
    let music = *probabilities.get(MUSIC_CLASS)?;
    let noise = *probabilities.get(NOISE_CLASS)?;

    if speech < PRESENCE_THRESHOLD && music < PRESENCE_THRESHOLD {
        return Some(Label::Noise);
    }

    // ties resolve to the later candidate
    [
        (Label::Speech, speech),
        (Label::Music, music),
        (Label::Noise, noise),
    ]
    .into_iter()
    .max_by(|a, b| a.1.total_cmp(&b.1))
    .map(|(label, _)| label)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(speech: f32, music: f32, noise: f32) -> Vec<f32> {
        let mut probabilities = vec![0.0; 527];
        probabilities[SPEECH_CLASS] = speech;
        probabilities[MUSIC_CLASS] = music;
        probabilities[NOISE_CLASS] = noise;
        probabilities
    }

    #[test]
    fn test_speech_wins() {
        assert_eq!(decide(&row(0.9, 0.3, 0.1)), Some(Label::Speech));
    }

    #[test]
    fn test_music_wins() {
        assert_eq!(decide(&row(0.6, 0.8, 0.2)), Some(Label::Music));
    }

    #[test]
    fn test_quiet_speech_and_music_is_noise() {
        // Noise probability is irrelevant when both are below the threshold
        assert_eq!(decide(&row(0.49, 0.49, 0.0)), Some(Label::Noise));
    }

    #[test]
    fn test_noise_can_outscore_present_speech() {
        assert_eq!(decide(&row(0.55, 0.1, 0.95)), Some(Label::Noise));
    }

    #[test]
    fn test_threshold_is_inclusive_for_presence() {
        assert_eq!(decide(&row(0.5, 0.0, 0.1)), Some(Label::Speech));
    }

    #[test]
    fn test_tie_prefers_later_label() {
        assert_eq!(decide(&row(0.7, 0.7, 0.1)), Some(Label::Music));
    }

    #[test]
    fn test_short_row_has_no_label() {
        assert_eq!(decide(&[0.9; 200]), None);
    }

    #[test]
    fn test_label_json_is_variant_name() {
        assert_eq!(serde_json::to_string(&Label::Speech).unwrap(), "\"Speech\"");
        let label: Label = serde_json::from_str("\"Noise\"").unwrap();
        assert_eq!(label, Label::Noise);
    }

    #[test]
    fn test_display_matches_json_name() {
        assert_eq!(Label::Music.to_string(), "Music");
    }
}
