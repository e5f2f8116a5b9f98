use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::Serialize;

use crate::{config, TrainingError};

const EPS: f64 = 1e-12;
const ADAMW_EPSILON: f64 = 1e-8;
const ADADELTA_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptimizerConfig {
    Sgd(SgdConfig),
    AdamW(AdamWConfig),
    Adadelta(AdadeltaConfig),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SgdConfig {
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdadeltaConfig {
    pub learning_rate: f64,
    pub rho: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl TryFrom<&config::OptimizerConfig> for OptimizerConfig {
    type Error = TrainingError;

    fn try_from(value: &config::OptimizerConfig) -> Result<Self, Self::Error> {
        if value.momentum != 0.0 && value.algorithm != config::OptimizerType::Sgd {
            return Err(TrainingError::initialization(format!(
                "momentum is only supported by sgd, not {:?}",
                value.algorithm
            )));
        }

        match value.algorithm {
            config::OptimizerType::Sgd => {
                if value.epsilon.is_some() {
                    return Err(TrainingError::initialization(
                        "epsilon is not used by sgd",
                    ));
                }
                Ok(OptimizerConfig::Sgd(SgdConfig {
                    learning_rate: value.learning_rate,
                    momentum: value.momentum,
                    weight_decay: value.weight_decay,
                }))
            }
            config::OptimizerType::AdamW => Ok(OptimizerConfig::AdamW(AdamWConfig {
                learning_rate: value.learning_rate,
                beta1: value.beta1,
                beta2: value.beta2,
                epsilon: value.epsilon.unwrap_or(ADAMW_EPSILON),
                weight_decay: value.weight_decay,
            })),
            config::OptimizerType::Adadelta => Ok(OptimizerConfig::Adadelta(AdadeltaConfig {
                learning_rate: value.learning_rate,
                rho: value.rho,
                epsilon: value.epsilon.unwrap_or(ADADELTA_EPSILON),
                weight_decay: value.weight_decay,
            })),
        }
    }
}

impl OptimizerConfig {
    pub fn learning_rate(&self) -> f64 {
        match self {
            OptimizerConfig::Sgd(cfg) => cfg.learning_rate,
            OptimizerConfig::AdamW(cfg) => cfg.learning_rate,
            OptimizerConfig::Adadelta(cfg) => cfg.learning_rate,
        }
    }

    fn set_learning_rate(&mut self, lr: f64) {
        match self {
            OptimizerConfig::Sgd(cfg) => cfg.learning_rate = lr,
            OptimizerConfig::AdamW(cfg) => cfg.learning_rate = lr,
            OptimizerConfig::Adadelta(cfg) => cfg.learning_rate = lr,
        }
    }
}

/// Fixed optimizer settings as they appear in executor snapshots.
///
/// The live learning rate is reported by the training state, so only the
/// rate the optimizer was built with is kept here.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizerHyperparameters {
    pub optimizer: &'static str,
    pub initial_lr: f64,
    pub weight_decay: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub momentum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub beta1: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub beta2: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rho: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eps: Option<f64>,
}

#[derive(Debug)]
pub struct TrainerOptimizer {
    config: OptimizerConfig,
    initial: OptimizerConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    param: Var,
    dtype: DType,
    /// Momentum buffer (sgd), first moment (adamw) or squared-gradient average (adadelta).
    first_moment: Tensor,
    /// Second moment (adamw) or squared-update average (adadelta). Unused by sgd.
    second_moment: Tensor,
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: OptimizerConfig,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let device = tensor.device();
            let shape = tensor.dims().to_vec();

            let first_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;
            let second_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;

            params.push(ParameterSlot {
                dtype: tensor.dtype(),
                param: var,
                first_moment,
                second_moment,
            });
        }

        Ok(Self {
            config,
            initial: config,
            params,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate()
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.set_learning_rate(lr);
    }

    /// Learning rate the optimizer was constructed with.
    pub fn initial_learning_rate(&self) -> f64 {
        self.initial.learning_rate()
    }

    /// Total number of scalar weights being optimized.
    pub fn num_parameters(&self) -> usize {
        self.params
            .iter()
            .map(|slot| slot.param.as_tensor().elem_count())
            .sum()
    }

    pub fn hyperparameters(&self) -> OptimizerHyperparameters {
        match self.initial {
            OptimizerConfig::Sgd(cfg) => OptimizerHyperparameters {
                optimizer: "sgd",
                initial_lr: cfg.learning_rate,
                weight_decay: cfg.weight_decay,
                momentum: Some(cfg.momentum),
                beta1: None,
                beta2: None,
                rho: None,
                eps: None,
            },
            OptimizerConfig::AdamW(cfg) => OptimizerHyperparameters {
                optimizer: "adamw",
                initial_lr: cfg.learning_rate,
                weight_decay: cfg.weight_decay,
                momentum: None,
                beta1: Some(cfg.beta1),
                beta2: Some(cfg.beta2),
                rho: None,
                eps: Some(cfg.epsilon),
            },
            OptimizerConfig::Adadelta(cfg) => OptimizerHyperparameters {
                optimizer: "adadelta",
                initial_lr: cfg.learning_rate,
                weight_decay: cfg.weight_decay,
                momentum: None,
                beta1: None,
                beta2: None,
                rho: Some(cfg.rho),
                eps: Some(cfg.epsilon),
            },
        }
    }

    /// Applies one update from the gradients in `grads`. The gradients stay
    /// in the store until [`Self::zero_grad`]; parameters without one are
    /// left untouched.
    pub fn step(&mut self, grads: &GradStore) -> Result<(), TrainingError> {
        let mut processed = Vec::new();
        for (idx, slot) in self.params.iter().enumerate() {
            let grad = match grads.get(slot.param.as_tensor()) {
                Some(grad) => grad,
                None => continue,
            };
            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
            processed.push((idx, grad));
        }

        if processed.is_empty() {
            return Ok(());
        }

        self.step += 1;
        match self.config {
            OptimizerConfig::Sgd(cfg) => self.step_sgd(cfg, processed),
            OptimizerConfig::AdamW(cfg) => self.step_adamw(cfg, processed),
            OptimizerConfig::Adadelta(cfg) => self.step_adadelta(cfg, processed),
        }
    }

    fn step_sgd(
        &mut self,
        cfg: SgdConfig,
        processed: Vec<(usize, Tensor)>,
    ) -> Result<(), TrainingError> {
        let first_step = self.step == 1;
        for (index, grad) in processed {
            let slot = &mut self.params[index];
            let base = slot.master()?;

            let grad = if cfg.weight_decay != 0.0 {
                let decay = base.affine(cfg.weight_decay, 0.0).map_err(to_runtime_error)?;
                grad.add(&decay).map_err(to_runtime_error)?
            } else {
                grad
            };

            let direction = if cfg.momentum != 0.0 {
                let buffer = if first_step {
                    grad
                } else {
                    slot.first_moment
                        .affine(cfg.momentum, 0.0)
                        .map_err(to_runtime_error)?
                        .add(&grad)
                        .map_err(to_runtime_error)?
                };
                slot.first_moment = buffer.clone();
                buffer
            } else {
                grad
            };

            let update = direction
                .affine(cfg.learning_rate, 0.0)
                .map_err(to_runtime_error)?;
            let next = base.sub(&update).map_err(to_runtime_error)?;
            slot.assign(next)?;
        }
        Ok(())
    }

    fn step_adamw(
        &mut self,
        cfg: AdamWConfig,
        processed: Vec<(usize, Tensor)>,
    ) -> Result<(), TrainingError> {
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for (index, grad) in processed {
            let slot = &mut self.params[index];

            let prev_m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .map_err(to_runtime_error)?;
            let grad_term = grad.affine(1.0 - cfg.beta1, 0.0).map_err(to_runtime_error)?;
            let new_m = prev_m.add(&grad_term).map_err(to_runtime_error)?;

            let grad_sq = grad.sqr().map_err(to_runtime_error)?;
            let prev_v = slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .map_err(to_runtime_error)?;
            let grad_sq_term = grad_sq.affine(1.0 - cfg.beta2, 0.0).map_err(to_runtime_error)?;
            let new_v = prev_v.add(&grad_sq_term).map_err(to_runtime_error)?;

            let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
            let v_hat = new_v.affine(scale_v, 0.0).map_err(to_runtime_error)?;
            let denom = v_hat
                .sqrt()
                .map_err(to_runtime_error)?
                .affine(1.0, cfg.epsilon)
                .map_err(to_runtime_error)?;
            let update = m_hat
                .div(&denom)
                .map_err(to_runtime_error)?
                .affine(cfg.learning_rate, 0.0)
                .map_err(to_runtime_error)?;

            let base = slot.master()?;
            let decayed = if cfg.weight_decay != 0.0 {
                base.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                base
            };

            let next = decayed.sub(&update).map_err(to_runtime_error)?;
            slot.assign(next)?;
            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    fn step_adadelta(
        &mut self,
        cfg: AdadeltaConfig,
        processed: Vec<(usize, Tensor)>,
    ) -> Result<(), TrainingError> {
        for (index, grad) in processed {
            let slot = &mut self.params[index];
            let base = slot.master()?;

            let grad = if cfg.weight_decay != 0.0 {
                let decay = base.affine(cfg.weight_decay, 0.0).map_err(to_runtime_error)?;
                grad.add(&decay).map_err(to_runtime_error)?
            } else {
                grad
            };

            let square_avg = slot
                .first_moment
                .affine(cfg.rho, 0.0)
                .map_err(to_runtime_error)?
                .add(
                    &grad
                        .sqr()
                        .map_err(to_runtime_error)?
                        .affine(1.0 - cfg.rho, 0.0)
                        .map_err(to_runtime_error)?,
                )
                .map_err(to_runtime_error)?;
            let std = square_avg
                .affine(1.0, cfg.epsilon)
                .map_err(to_runtime_error)?
                .sqrt()
                .map_err(to_runtime_error)?;
            let delta = slot
                .second_moment
                .affine(1.0, cfg.epsilon)
                .map_err(to_runtime_error)?
                .sqrt()
                .map_err(to_runtime_error)?
                .div(&std)
                .map_err(to_runtime_error)?
                .mul(&grad)
                .map_err(to_runtime_error)?;
            let acc_delta = slot
                .second_moment
                .affine(cfg.rho, 0.0)
                .map_err(to_runtime_error)?
                .add(
                    &delta
                        .sqr()
                        .map_err(to_runtime_error)?
                        .affine(1.0 - cfg.rho, 0.0)
                        .map_err(to_runtime_error)?,
                )
                .map_err(to_runtime_error)?;

            let update = delta
                .affine(cfg.learning_rate, 0.0)
                .map_err(to_runtime_error)?;
            let next = base.sub(&update).map_err(to_runtime_error)?;
            slot.assign(next)?;
            slot.first_moment = square_avg;
            slot.second_moment = acc_delta;
        }
        Ok(())
    }

    /// Releases the gradients of this optimizer's parameters, returning how
    /// many were held.
    pub fn zero_grad(&self, grads: &mut GradStore) -> usize {
        self.params
            .iter()
            .filter(|slot| grads.remove(slot.param.as_tensor()).is_some())
            .count()
    }
}

impl ParameterSlot {
    fn master(&self) -> Result<Tensor, TrainingError> {
        self.param
            .as_tensor()
            .to_dtype(DType::F32)
            .map_err(to_runtime_error)
    }

    fn assign(&self, next: Tensor) -> Result<(), TrainingError> {
        let cast = if self.dtype == DType::F32 {
            next
        } else {
            next.to_dtype(self.dtype).map_err(to_runtime_error)?
        };
        self.param.set(&cast).map_err(to_runtime_error)
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
