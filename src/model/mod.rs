/// Exported artifact format
pub mod artifact;
/// AST network
pub mod ast;
/// AST hyper-parameters
pub mod config;
/// Output labels and the decision rule
pub mod labels;

pub use ast::AstModel;
pub use config::AstConfig;
pub use labels::Label;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use std::path::Path;

use crate::checkpoint::{validate, StateDict};

/// Picks the first CUDA device when candle was built with CUDA, else the CPU
#[must_use]
pub fn select_device() -> Device {
    Device::cuda_if_available(0).unwrap_or(Device::Cpu)
}

/// An AST ready to turn filter-bank batches into labels
pub struct Classifier {
    model: AstModel,
    device: Device,
}

impl Classifier {
    /// Wraps an already-built network
    #[must_use]
    pub const fn new(model: AstModel, device: Device) -> Self {
        Self { model, device }
    }

    /// Loads an exported artifact and builds the network it describes
    ///
    /// # Errors
    /// Returns error if the artifact can't be read or its weights don't fit
    /// the embedded config
    pub fn from_artifact(path: &Path, device: Device) -> Result<Self> {
        let artifact = artifact::load(path, &device)
            .with_context(|| format!("failed to load artifact {}", path.display()))?;

        let state_dict: StateDict = artifact.tensors.into_iter().collect();
        validate(&state_dict, &artifact.config).context("artifact weights don't match its config")?;

        let vb = VarBuilder::from_tensors(state_dict.into_iter().collect(), DType::F32, &device);
        let model = AstModel::new(&artifact.config, vb).context("failed to build AST")?;

        tracing::info!(device = ?device, "classifier ready");

        Ok(Self::new(model, device))
    }

    /// Hyper-parameters of the wrapped network
    #[must_use]
    pub const fn config(&self) -> &AstConfig {
        self.model.config()
    }

    /// Device inputs must live on
    #[must_use]
    pub const fn device(&self) -> &Device {
        &self.device
    }

    /// Labels every row of a normalized `[B, T, F]` batch
    ///
    /// # Errors
    /// Returns error if inference fails
    pub fn label(&self, batch: &Tensor) -> candle_core::Result<Vec<Label>> {
        let logits = self.model.forward(batch)?;
        let probabilities = candle_nn::ops::sigmoid(&logits)?
            .to_dtype(DType::F32)?
            .to_vec2::<f32>()?;

        probabilities
            .iter()
            .map(|row| {
                labels::decide(row).ok_or_else(|| {
                    candle_core::Error::Msg(format!(
                        "model emits {} classes, too few to label",
                        row.len()
                    ))
                })
            })
            .collect()
    }
}
