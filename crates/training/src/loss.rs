use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::{config::to_runtime_error, TrainingError};

/// Mean cross entropy over a batch of class scores.
///
/// Scores are promoted to `F32` before the softmax so half-precision forward
/// passes still produce a full-precision loss.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self
    }

    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<LossOutput, TrainingError> {
        let (batch, classes) = logits.dims2().map_err(|_| {
            TrainingError::runtime(format!(
                "cross entropy expects (batch, classes) scores (got {:?})",
                logits.dims()
            ))
        })?;
        if batch == 0 || classes == 0 {
            return Err(TrainingError::runtime(
                "cross entropy requires a non-empty batch and at least one class",
            ));
        }
        if targets.dims() != [batch] {
            return Err(TrainingError::runtime(format!(
                "targets must have shape [{batch}] (got {:?})",
                targets.dims()
            )));
        }

        let device = logits.device();
        let targets = targets.to_device(device).map_err(to_runtime_error)?;
        let targets = match targets.dtype() {
            DType::U32 => targets,
            DType::I64 | DType::U8 => targets.to_dtype(DType::U32).map_err(to_runtime_error)?,
            dtype => {
                return Err(TrainingError::runtime(format!(
                    "unsupported target dtype {:?} for cross entropy",
                    dtype
                )))
            }
        };

        let logits = logits.to_dtype(DType::F32).map_err(to_runtime_error)?;
        let log_probs = ops::log_softmax(&logits, D::Minus1).map_err(to_runtime_error)?;
        let nll = log_probs
            .gather(&targets.unsqueeze(1).map_err(to_runtime_error)?, 1)
            .map_err(to_runtime_error)?
            .neg()
            .map_err(to_runtime_error)?;
        let loss = nll.mean_all().map_err(to_runtime_error)?;
        let value = loss.to_vec0::<f32>().map_err(to_runtime_error)? as f64;

        Ok(LossOutput { loss, value })
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Scalar `F32` tensor attached to the autograd graph.
    pub loss: Tensor,
    pub value: f64,
}
