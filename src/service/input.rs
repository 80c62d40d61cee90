use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use candle_core::{DType, Device, Tensor};
use safetensors::{Dtype, SafeTensorError, SafeTensors};
use thiserror::Error;

use crate::features::{NUM_FRAMES, NUM_MEL_BINS};

/// Name of the tensor a request must carry
pub const INPUT_TENSOR: &str = "fbank";

/// Mean of the AudioSet training filter banks
pub const NORM_MEAN: f64 = -4.267_739_3;
/// Standard deviation of the AudioSet training filter banks
pub const NORM_STD: f64 = 4.568_997_4;

/// Errors that can occur while answering a labelling request
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The body isn't a safetensors buffer holding the input tensor
    #[error("invalid request body: {0}")]
    Body(#[from] SafeTensorError),

    /// The input tensor has the wrong element type
    #[error("input must be a 32 bit float, got {0:?}")]
    DType(Dtype),

    /// The input tensor isn't two-dimensional
    #[error("input must have shape [frames, {NUM_MEL_BINS}], got {0:?}")]
    Rank(Vec<usize>),

    /// The input tensor has the wrong number of mel bins
    #[error("expected {NUM_MEL_BINS} mel bins but got {0}")]
    MelBins(usize),

    /// Tensor preparation failed
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// The batch holding this request failed
    #[error("inference failed: {0}")]
    Inference(String),

    /// The batch worker is gone
    #[error("labelling queue is closed")]
    Unavailable,
}

impl ServiceError {
    /// HTTP status the error is reported with
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Body(_) | Self::DType(_) | Self::Rank(_) | Self::MelBins(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Tensor(_) | Self::Inference(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "rejected request");
        }
        (status, self.to_string()).into_response()
    }
}

/// Turns a request body into one normalized `[1024, 128]` model input
///
/// # Errors
/// Returns error if the body isn't a single-precision `[frames, 128]` tensor
pub fn prepare(body: &[u8]) -> Result<Tensor, ServiceError> {
    let tensors = SafeTensors::deserialize(body)?;
    let view = tensors.tensor(INPUT_TENSOR)?;

    if view.dtype() != Dtype::F32 {
        return Err(ServiceError::DType(view.dtype()));
    }
    let &[_, mel_bins] = view.shape() else {
        return Err(ServiceError::Rank(view.shape().to_vec()));
    };
    if mel_bins != NUM_MEL_BINS {
        return Err(ServiceError::MelBins(mel_bins));
    }

    let tensor = Tensor::from_raw_buffer(view.data(), DType::F32, view.shape(), &Device::Cpu)?;
    Ok(normalize(&fit(&tensor)?)?)
}

/// Truncates or zero-pads the frame axis to exactly [`NUM_FRAMES`] rows
///
/// # Errors
/// Returns error if `tensor` isn't two-dimensional
pub fn fit(tensor: &Tensor) -> candle_core::Result<Tensor> {
    let (frames, mel_bins) = tensor.dims2()?;
    match frames {
        0 => Tensor::zeros((NUM_FRAMES, mel_bins), tensor.dtype(), tensor.device()),
        n if n > NUM_FRAMES => tensor.narrow(0, 0, NUM_FRAMES),
        n if n < NUM_FRAMES => tensor.pad_with_zeros(0, 0, NUM_FRAMES - n),
        _ => Ok(tensor.clone()),
    }
}

/// Applies the training set normalization `(x - mean) / (2 * std)`
///
/// # Errors
/// Returns error if the tensor op fails
pub fn normalize(tensor: &Tensor) -> candle_core::Result<Tensor> {
    let scale = 1.0 / (2.0 * NORM_STD);
    tensor.affine(scale, -NORM_MEAN * scale)
}
