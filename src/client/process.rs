use anyhow::{Context, Result};
use byte_slice_cast::AsByteSlice;
use safetensors::{tensor::TensorView, Dtype, SafeTensorError};
use std::path::{Path, PathBuf};

use crate::features::{self, NUM_MEL_BINS};
use crate::model::Label;
use crate::service::input::INPUT_TENSOR;

/// Packs filter-bank rows into a request body: one F32 `[frames, 128]` tensor
///
/// # Errors
/// Returns error if the tensor can't be serialized
pub fn encode_request(fbank: &[[f32; NUM_MEL_BINS]]) -> Result<Vec<u8>, SafeTensorError> {
    let view = TensorView::new(
        Dtype::F32,
        vec![fbank.len(), NUM_MEL_BINS],
        fbank.as_flattened().as_byte_slice(),
    )?;
    safetensors::serialize([(INPUT_TENSOR, &view)], &None)
}

/// Parses a service answer such as `"Speech"`
///
/// # Errors
/// Returns error if the body isn't a JSON label
pub fn decode_response(body: &str) -> Result<Label> {
    serde_json::from_str(body).with_context(|| format!("failed to deserialize label from {body:?}"))
}

/// Sends one filter bank to the service and returns its label
///
/// # Errors
/// Returns error if the request fails, the service answers with an error
/// status, or the answer isn't a label
pub async fn request_label(client: &reqwest::Client, url: &str, body: Vec<u8>) -> Result<Label> {
    let response = client
        .post(url)
        .body(body)
        .send()
        .await
        .with_context(|| format!("failed to send filter bank to {url}"))?;

    let status = response.status();
    let text = response
        .text()
        .await
        .context("failed to read response body")?;
    if !status.is_success() {
        anyhow::bail!("service answered {status}: {text}");
    }

    decode_response(&text)
}

/// Reads, decodes and labels one audio file
///
/// # Errors
/// Returns error if the file can't be read or decoded, or labelling fails
pub async fn process(client: &reqwest::Client, url: &str, path: PathBuf) -> Result<(PathBuf, Label)> {
    let name = display_name(&path);
    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("failed to read {name}"))?;

    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_owned);
    let body = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let fbank = features::extract(bytes, extension.as_deref())
            .context("failed to create filter bank")?;
        tracing::debug!(frames = fbank.len(), "filter bank computed");
        Ok(encode_request(&fbank)?)
    })
    .await
    .context("feature extraction task panicked")?
    .with_context(|| format!("failed to process {name}"))?;

    let label = request_label(client, url, body)
        .await
        .with_context(|| format!("failed to label {name}"))?;

    Ok((path, label))
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .unwrap_or(path.as_os_str())
        .to_string_lossy()
        .into_owned()
}
