use candle_core::{DType, Tensor, D};
use candle_nn::ops;
use serde::{Deserialize, Serialize};

use crate::TrainingError;

/// Per-example losses reduced by summation, so callers can normalise by any
/// batch size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossFunction {
    /// Negative log-likelihood of model outputs that are already log-probabilities.
    #[default]
    Nll,
    /// Softmax cross entropy on raw logits.
    CrossEntropy,
    /// Squared error between outputs and real-valued targets.
    Mse,
}

impl LossFunction {
    pub fn name(&self) -> &'static str {
        match self {
            LossFunction::Nll => "nll_loss",
            LossFunction::CrossEntropy => "cross_entropy",
            LossFunction::Mse => "mse_loss",
        }
    }

    /// Top-1 accuracy is only meaningful for classification losses.
    pub fn supports_accuracy(&self) -> bool {
        !self.name().contains("mse")
    }

    /// Scalar tensor holding the summed loss over the batch.
    pub fn sum(&self, output: &Tensor, target: &Tensor) -> Result<Tensor, TrainingError> {
        match self {
            LossFunction::Nll => nll_sum(output, target),
            LossFunction::CrossEntropy => {
                let log_probs = ops::log_softmax(output, D::Minus1)?;
                nll_sum(&log_probs, target)
            }
            LossFunction::Mse => mse_sum(output, target),
        }
    }

    /// Number of rows whose arg-max matches the target class.
    pub fn correct(&self, output: &Tensor, target: &Tensor) -> Result<usize, TrainingError> {
        let targets = class_targets(output, target)?;
        let predictions = output.argmax(D::Minus1)?;
        let correct = predictions
            .eq(&targets)?
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_scalar::<f32>()?;
        Ok(correct.round() as usize)
    }
}

fn nll_sum(log_probs: &Tensor, target: &Tensor) -> Result<Tensor, TrainingError> {
    let targets = class_targets(log_probs, target)?;
    let picked = log_probs
        .to_dtype(DType::F32)?
        .gather(&targets.unsqueeze(1)?, 1)?
        .squeeze(1)?;
    Ok(picked.sum_all()?.neg()?)
}

fn mse_sum(output: &Tensor, target: &Tensor) -> Result<Tensor, TrainingError> {
    if output.elem_count() != target.elem_count() {
        return Err(TrainingError::runtime(format!(
            "mse expects matching element counts, got output {:?} and target {:?}",
            output.dims(),
            target.dims()
        )));
    }
    let output = output.to_dtype(DType::F32)?.reshape(target.dims())?;
    let target = target.to_dtype(DType::F32)?;
    Ok(output.sub(&target)?.sqr()?.sum_all()?)
}

/// Validates `(batch, classes)` scores against `(batch,)` integer labels and
/// returns the labels as `u32` on the scores' device.
fn class_targets(scores: &Tensor, target: &Tensor) -> Result<Tensor, TrainingError> {
    let dims = scores.dims();
    if dims.len() != 2 {
        return Err(TrainingError::runtime(format!(
            "classification loss expects [batch, classes] scores, got {:?}",
            dims
        )));
    }
    if target.dims() != [dims[0]] {
        return Err(TrainingError::runtime(format!(
            "target shape {:?} does not match batch size {}",
            target.dims(),
            dims[0]
        )));
    }

    let target = target.to_device(scores.device())?;
    match target.dtype() {
        DType::U32 => Ok(target),
        DType::I64 | DType::U8 => Ok(target.to_dtype(DType::U32)?),
        dtype => Err(TrainingError::runtime(format!(
            "unsupported target dtype {:?} for classification loss",
            dtype
        ))),
    }
}
