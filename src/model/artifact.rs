//! Exported model artifact
//!
//! A safetensors file holding the normalized F32 state dict. The header
//! metadata carries the format tag and the JSON-encoded [`AstConfig`], so the
//! file alone is enough to rebuild the network.

use byte_slice_cast::AsByteSlice;
use candle_core::{DType, Device, Tensor};
use safetensors::{tensor::TensorView, Dtype, SafeTensors};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::AstConfig;
use crate::checkpoint::StateDict;

/// Value of the `format` metadata key
pub const FORMAT_TAG: &str = "ast-labeler/1";

const FORMAT_KEY: &str = "format";
const CONFIG_KEY: &str = "ast_config";

/// Errors that can occur while writing or reading an artifact
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// Filesystem error
    #[error("i/o error at {path}: {source}")]
    Io {
        /// Artifact path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// The safetensors container is malformed
    #[error("invalid safetensors data: {0}")]
    Format(#[from] safetensors::SafeTensorError),

    /// A tensor couldn't be converted
    #[error("tensor conversion failed: {0}")]
    Tensor(#[from] candle_core::Error),

    /// The header lacks a required metadata entry
    #[error("artifact metadata has no `{0}` entry")]
    MissingMetadata(&'static str),

    /// The file was written by something else
    #[error("unsupported artifact format `{0}`")]
    UnsupportedFormat(String),

    /// The embedded config can't be decoded
    #[error("invalid embedded config: {0}")]
    Config(#[from] serde_json::Error),
}

/// A loaded artifact: the architecture and its weights
pub struct Artifact {
    /// Architecture the weights belong to
    pub config: AstConfig,
    /// Weights keyed by parameter name
    pub tensors: HashMap<String, Tensor>,
}

/// Writes `state_dict` and `config` to `path`
///
/// The file is written next to `path` first and renamed into place, so `path`
/// either holds a complete artifact or is untouched.
///
/// # Errors
/// Returns error if a tensor can't be read back to host memory or the file
/// can't be written
pub fn save(path: &Path, config: &AstConfig, state_dict: &StateDict) -> Result<(), ArtifactError> {
    let mut buffers = Vec::with_capacity(state_dict.len());
    for (name, tensor) in state_dict {
        let data = tensor
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        buffers.push((name.as_str(), tensor.dims().to_vec(), data));
    }

    let views = buffers
        .iter()
        .map(|(name, shape, data)| {
            TensorView::new(Dtype::F32, shape.clone(), data.as_byte_slice()).map(|view| (*name, view))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let metadata = HashMap::from([
        (FORMAT_KEY.to_owned(), FORMAT_TAG.to_owned()),
        (CONFIG_KEY.to_owned(), serde_json::to_string(config)?),
    ]);

    let io_error = |source: std::io::Error| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_error)?;
    }

    let temp_path = path.with_extension("partial");
    let bytes = safetensors::serialize(views.iter().map(|(name, view)| (*name, view)), &Some(metadata))?;
    fs::write(&temp_path, &bytes).map_err(io_error)?;
    if let Err(source) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(io_error(source));
    }

    tracing::info!(
        path = %path.display(),
        tensors = state_dict.len(),
        size = bytes.len(),
        "artifact written"
    );

    Ok(())
}

/// Reads an artifact written by [`save`], placing tensors on `device`
///
/// # Errors
/// Returns error if the file is missing, isn't an artifact, or carries an
/// undecodable config
pub fn load(path: &Path, device: &Device) -> Result<Artifact, ArtifactError> {
    let buffer = fs::read(path).map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let (_, header) = SafeTensors::read_metadata(&buffer)?;
    let metadata = header
        .metadata()
        .as_ref()
        .ok_or(ArtifactError::MissingMetadata(FORMAT_KEY))?;

    let format = metadata
        .get(FORMAT_KEY)
        .ok_or(ArtifactError::MissingMetadata(FORMAT_KEY))?;
    if format != FORMAT_TAG {
        return Err(ArtifactError::UnsupportedFormat(format.clone()));
    }

    let config: AstConfig = serde_json::from_str(
        metadata
            .get(CONFIG_KEY)
            .ok_or(ArtifactError::MissingMetadata(CONFIG_KEY))?,
    )?;

    let tensors = candle_core::safetensors::load_buffer(&buffer, device)?;

    tracing::info!(
        path = %path.display(),
        tensors = tensors.len(),
        depth = config.depth,
        "artifact loaded"
    );

    Ok(Artifact { config, tensors })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state_dict() -> StateDict {
        let mut state_dict = StateDict::new();
        state_dict.insert(
            "v.norm.weight".to_owned(),
            Tensor::new(&[1.0_f32, 2.0, 3.0], &Device::Cpu).unwrap(),
        );
        state_dict.insert(
            "mlp_head.1.weight".to_owned(),
            Tensor::new(&[[0.5_f32, -0.5], [1.5, -1.5]], &Device::Cpu).unwrap(),
        );
        state_dict
    }

    #[test]
    fn test_save_then_load_preserves_config_and_tensors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let config = AstConfig::tiny();

        save(&path, &config, &sample_state_dict()).unwrap();
        let artifact = load(&path, &Device::Cpu).unwrap();

        assert_eq!(artifact.config, config);
        assert_eq!(artifact.tensors.len(), 2);
        assert_eq!(
            artifact.tensors["mlp_head.1.weight"].to_vec2::<f32>().unwrap(),
            vec![vec![0.5, -0.5], vec![1.5, -1.5]]
        );
    }

    #[test]
    fn test_save_leaves_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");

        save(&path, &AstConfig::tiny(), &sample_state_dict()).unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert!(path.exists());
    }

    #[test]
    fn test_save_converts_to_f32() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let mut state_dict = StateDict::new();
        state_dict.insert(
            "v.norm.bias".to_owned(),
            Tensor::new(&[1.0_f64, 2.0], &Device::Cpu).unwrap(),
        );

        save(&path, &AstConfig::tiny(), &state_dict).unwrap();
        let artifact = load(&path, &Device::Cpu).unwrap();

        assert_eq!(artifact.tensors["v.norm.bias"].dtype(), DType::F32);
    }

    #[test]
    fn test_plain_safetensors_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.safetensors");
        let tensors = HashMap::from([(
            "x".to_owned(),
            Tensor::new(&[1.0_f32], &Device::Cpu).unwrap(),
        )]);
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let result = load(&path, &Device::Cpu);

        assert!(matches!(result, Err(ArtifactError::MissingMetadata(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = load(&dir.path().join("missing.safetensors"), &Device::Cpu);
        assert!(matches!(result, Err(ArtifactError::Io { .. })));
    }
}
