use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use std::path::PathBuf;

use crate::checkpoint::{self, Fetch};
use crate::config::Config;
use crate::model::{artifact, AstConfig, AstModel};

/// Where the artifact is written unless configured otherwise
pub const DEFAULT_OUTPUT_PATH: &str = "./model.safetensors";

/// Inputs of one export run
#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Download URL, used only when `checkpoint_path` is missing
    pub checkpoint_url: String,
    /// Local checkpoint path
    pub checkpoint_path: PathBuf,
    /// Prefix stripped from parameter names
    pub prefix: String,
    /// Artifact output path
    pub output_path: PathBuf,
    /// Architecture the checkpoint belongs to
    pub model: AstConfig,
    /// Run a forward pass before writing
    pub verify: bool,
}

impl ExportOptions {
    /// Builds options from the config file sections
    ///
    /// # Errors
    /// Returns error if a `~/` path can't be expanded
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            checkpoint_url: config.checkpoint.url.clone(),
            checkpoint_path: Config::expand_path(&config.checkpoint.path)?,
            prefix: config.checkpoint.prefix.clone(),
            output_path: Config::expand_path(&config.export.output)?,
            model: AstConfig::default(),
            verify: config.export.verify,
        })
    }
}

/// What an export run did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReport {
    /// Whether the checkpoint had to be downloaded
    pub downloaded: bool,
    /// Number of tensors written
    pub tensors: usize,
    /// Whether the forward pass check ran
    pub verified: bool,
    /// Artifact path
    pub output_path: PathBuf,
}

/// Turns a pretrained checkpoint into a servable artifact
///
/// Fetches the checkpoint if absent, strips the wrapper prefix, checks the
/// weights against the architecture, builds the network from them and writes
/// the artifact. The backbone's unused classifier heads are left out of it.
///
/// # Errors
/// Returns error if any step fails; no artifact is written in that case
pub fn export_model(options: &ExportOptions, fetcher: &dyn Fetch) -> Result<ExportReport> {
    let _span = tracing::info_span!("export", output = %options.output_path.display()).entered();

    options
        .model
        .check()
        .map_err(|reason| anyhow::anyhow!("invalid model config: {reason}"))?;

    let downloaded = checkpoint::ensure_checkpoint(
        fetcher,
        &options.checkpoint_url,
        &options.checkpoint_path,
    )
    .context("failed to obtain checkpoint")?;

    let state_dict = checkpoint::load_state_dict(&options.checkpoint_path)?;
    let state_dict = checkpoint::strip_prefix(state_dict, &options.prefix)?;
    checkpoint::validate(&state_dict, &options.model)?;
    let state_dict = checkpoint::drop_backbone_heads(state_dict, &options.model);

    let device = Device::Cpu;
    let vb = VarBuilder::from_tensors(
        state_dict
            .iter()
            .map(|(name, tensor)| (name.clone(), tensor.clone()))
            .collect(),
        DType::F32,
        &device,
    );
    let model = AstModel::new(&options.model, vb).context("failed to apply weights")?;

    if options.verify {
        verify(&model, &device).context("verification forward pass failed")?;
    }

    artifact::save(&options.output_path, &options.model, &state_dict)
        .context("failed to write artifact")?;

    tracing::info!(
        downloaded,
        tensors = state_dict.len(),
        verified = options.verify,
        "export finished"
    );

    Ok(ExportReport {
        downloaded,
        tensors: state_dict.len(),
        verified: options.verify,
        output_path: options.output_path.clone(),
    })
}

/// Runs one silent input through the network and checks the output shape
fn verify(model: &AstModel, device: &Device) -> Result<()> {
    let config = model.config();
    let input = Tensor::zeros((1, config.input_tdim, config.input_fdim), DType::F32, device)?;

    let start = std::time::Instant::now();
    let logits = model.forward(&input)?;
    let (rows, classes) = logits.dims2()?;
    anyhow::ensure!(
        rows == 1 && classes == config.label_dim,
        "expected [1, {}] logits, got [{rows}, {classes}]",
        config.label_dim
    );

    let finite = logits
        .flatten_all()?
        .to_vec1::<f32>()?
        .iter()
        .all(|v| v.is_finite());
    anyhow::ensure!(finite, "logits contain non-finite values");

    tracing::debug!(elapsed_ms = start.elapsed().as_millis(), "verification passed");
    Ok(())
}
