use std::io;
use std::path::{Path, PathBuf};

use crate::model::Label;

/// What to do with a labelled file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Copy the file into its label's directory
    Copy,
    /// Move the file into its label's directory
    Move,
}

/// Per-label destination directories; files whose label has none stay put
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultPathOptions {
    /// Destination for speech
    pub speech_dir: Option<PathBuf>,
    /// Destination for music
    pub music_dir: Option<PathBuf>,
    /// Destination for noise
    pub noise_dir: Option<PathBuf>,
}

impl ResultPathOptions {
    fn dir_for(&self, label: Label) -> Option<&Path> {
        match label {
            Label::Speech => self.speech_dir.as_deref(),
            Label::Music => self.music_dir.as_deref(),
            Label::Noise => self.noise_dir.as_deref(),
        }
    }
}

/// Where `path` goes for `label`: `<dir>/<file name>`, or `None` if the label has no directory
#[must_use]
pub fn result_path(path: &Path, label: Label, options: &ResultPathOptions) -> Option<PathBuf> {
    let dir = options.dir_for(label)?;
    let name = path.file_name().unwrap_or(path.as_os_str());
    Some(dir.join(name))
}

impl Action {
    /// Copies or moves `path` to its result path; returns the destination if anything happened
    ///
    /// # Errors
    /// Returns error if the copy or rename fails
    pub async fn perform(
        self,
        path: &Path,
        label: Label,
        options: &ResultPathOptions,
    ) -> io::Result<Option<PathBuf>> {
        let Some(target) = result_path(path, label, options) else {
            return Ok(None);
        };

        match self {
            Self::Copy => {
                tokio::fs::copy(path, &target).await?;
            }
            Self::Move => tokio::fs::rename(path, &target).await?,
        }

        tracing::debug!(
            action = ?self,
            from = %path.display(),
            to = %target.display(),
            "file routed"
        );

        Ok(Some(target))
    }
}
