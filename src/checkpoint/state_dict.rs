use candle_core::{Device, Tensor};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::model::AstConfig;

/// Parameter name to tensor, ordered by name
pub type StateDict = BTreeMap<String, Tensor>;

/// A parameter whose stored shape differs from the model's
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeMismatch {
    /// Parameter name
    pub name: String,
    /// Shape the model expects
    pub expected: Vec<usize>,
    /// Shape found in the checkpoint
    pub found: Vec<usize>,
}

/// Errors that can occur while reading or normalizing a state dict
#[derive(Debug, Error)]
pub enum StateDictError {
    /// The checkpoint could not be deserialized
    #[error("failed to read checkpoint {path}: {source}")]
    Read {
        /// Checkpoint path
        path: PathBuf,
        /// Underlying error
        source: candle_core::Error,
    },

    /// Two keys collapse onto the same name once the prefix is removed
    #[error("keys {first} and {second} both map to {key} after prefix stripping")]
    DuplicateKey {
        /// Name after stripping
        key: String,
        /// First original key
        first: String,
        /// Second original key
        second: String,
    },

    /// The key set or shapes don't match the model
    #[error(
        "state dict does not match the model: {} missing, {} unexpected, {} mis-shaped (first: {})",
        .missing.len(),
        .unexpected.len(),
        .mismatched.len(),
        first_problem(.missing, .unexpected, .mismatched)
    )]
    Mismatch {
        /// Parameters the model needs but the checkpoint lacks
        missing: Vec<String>,
        /// Checkpoint entries the model has no parameter for
        unexpected: Vec<String>,
        /// Parameters with the wrong shape
        mismatched: Vec<ShapeMismatch>,
    },
}

fn first_problem(missing: &[String], unexpected: &[String], mismatched: &[ShapeMismatch]) -> String {
    if let Some(name) = missing.first() {
        format!("missing {name}")
    } else if let Some(name) = unexpected.first() {
        format!("unexpected {name}")
    } else if let Some(m) = mismatched.first() {
        format!("{} expected {:?} found {:?}", m.name, m.expected, m.found)
    } else {
        "none".to_owned()
    }
}

/// Reads a checkpoint into host memory
///
/// `.safetensors` files are read as safetensors; anything else is treated as
/// a PyTorch `torch.save` archive of a state dict.
///
/// # Errors
/// Returns error if the file is missing or can't be decoded
pub fn load_state_dict(path: &Path) -> Result<StateDict, StateDictError> {
    let read_error = |source: candle_core::Error| StateDictError::Read {
        path: path.to_path_buf(),
        source,
    };

    let is_safetensors = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("safetensors"));

    let state_dict: StateDict = if is_safetensors {
        let tensors: HashMap<String, Tensor> =
            candle_core::safetensors::load(path, &Device::Cpu).map_err(read_error)?;
        tensors.into_iter().collect()
    } else {
        candle_core::pickle::read_all(path)
            .map_err(read_error)?
            .into_iter()
            .collect()
    };

    tracing::info!(
        path = %path.display(),
        tensors = state_dict.len(),
        "checkpoint loaded"
    );

    Ok(state_dict)
}

/// Removes a leading `prefix` from every key that carries it
///
/// Keys without the prefix pass through unchanged. Only the leading
/// occurrence is removed; names containing the prefix elsewhere are kept.
///
/// # Errors
/// Returns error if two keys become identical after stripping
pub fn strip_prefix(state_dict: StateDict, prefix: &str) -> Result<StateDict, StateDictError> {
    let mut stripped = StateDict::new();
    let mut origins: HashMap<String, String> = HashMap::new();
    let mut renamed = 0_usize;

    for (key, tensor) in state_dict {
        let new_key = match key.strip_prefix(prefix) {
            Some(rest) if !prefix.is_empty() => {
                renamed += 1;
                rest.to_owned()
            }
            _ => key.clone(),
        };

        if let Some(first) = origins.get(&new_key) {
            return Err(StateDictError::DuplicateKey {
                key: new_key,
                first: first.clone(),
                second: key,
            });
        }
        origins.insert(new_key.clone(), key);
        stripped.insert(new_key, tensor);
    }

    tracing::debug!(prefix, renamed, total = stripped.len(), "prefix stripped");

    Ok(stripped)
}

/// Checks that the state dict holds exactly the model's parameters
///
/// The backbone's own classifier heads may also be present, as long as their
/// shapes are right; [`drop_backbone_heads`] removes them afterwards.
///
/// # Errors
/// Returns [`StateDictError::Mismatch`] listing every missing, unexpected and
/// mis-shaped entry
pub fn validate(state_dict: &StateDict, config: &AstConfig) -> Result<(), StateDictError> {
    let expected = config.parameter_shapes();
    let heads = config.backbone_head_shapes();

    let mut missing = Vec::new();
    let mut mismatched = Vec::new();
    for (name, shape) in &expected {
        match state_dict.get(name) {
            None => missing.push(name.clone()),
            Some(tensor) => check_shape(name, shape, tensor, &mut mismatched),
        }
    }
    for (name, shape) in &heads {
        if let Some(tensor) = state_dict.get(name) {
            check_shape(name, shape, tensor, &mut mismatched);
        }
    }

    let known: HashSet<&str> = expected
        .iter()
        .chain(&heads)
        .map(|(name, _)| name.as_str())
        .collect();
    let unexpected: Vec<String> = state_dict
        .keys()
        .filter(|key| !known.contains(key.as_str()))
        .cloned()
        .collect();

    if missing.is_empty() && unexpected.is_empty() && mismatched.is_empty() {
        return Ok(());
    }

    Err(StateDictError::Mismatch {
        missing,
        unexpected,
        mismatched,
    })
}

fn check_shape(name: &str, shape: &[usize], tensor: &Tensor, mismatched: &mut Vec<ShapeMismatch>) {
    if tensor.dims() != shape {
        mismatched.push(ShapeMismatch {
            name: name.to_owned(),
            expected: shape.to_vec(),
            found: tensor.dims().to_vec(),
        });
    }
}

/// Removes the backbone classifier heads the network never reads
#[must_use]
pub fn drop_backbone_heads(mut state_dict: StateDict, config: &AstConfig) -> StateDict {
    let mut dropped = 0_usize;
    for (name, _) in config.backbone_head_shapes() {
        if state_dict.remove(&name).is_some() {
            dropped += 1;
        }
    }

    tracing::debug!(dropped, remaining = state_dict.len(), "backbone heads dropped");

    state_dict
}
