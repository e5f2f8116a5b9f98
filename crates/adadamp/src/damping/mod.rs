//! Batch-size damping policies.
//!
//! A policy looks at the [`TrainingState`] and returns how many examples the
//! next gradient estimate should use. Policies never touch the optimizer: the
//! step executor turns the requested size into a [`DampingDecision`] with
//! [`cap_batch_size`] and applies any learning-rate change itself.

mod policies;

pub use policies::{AdaDamp, CntsDampLr, Constant, GeoDamp, GeoDampLr, PadaDamp};

use serde::{Deserialize, Serialize};

use crate::{
    loss::LossFunction,
    state::{PolicySnapshot, TrainingState},
    TrainingError,
};

/// Computes the mean training loss over the full dataset on demand.
pub trait LossProbe {
    fn full_loss(&self) -> Result<f64, TrainingError>;
}

impl<F> LossProbe for F
where
    F: Fn() -> Result<f64, TrainingError>,
{
    fn full_loss(&self) -> Result<f64, TrainingError> {
        self()
    }
}

pub trait DampingPolicy: Send {
    /// Stable lowercase identifier recorded in every snapshot.
    fn name(&self) -> &'static str;

    fn initial_batch_size(&self) -> usize;

    /// Requested size of the next batch. Always at least 1.
    fn damping(
        &mut self,
        state: &TrainingState,
        probe: &dyn LossProbe,
    ) -> Result<usize, TrainingError>;

    /// Overrides the configured maximum batch size.
    fn batch_size_limit(&self) -> Option<usize> {
        None
    }

    fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot::default()
    }
}

/// Outcome of capping a requested batch size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DampingDecision {
    /// Size asked for by the policy.
    pub requested: usize,
    /// Size actually drawn.
    pub batch_size: usize,
    /// New optimizer learning rate, set only when the request was capped.
    pub learning_rate: Option<f64>,
}

/// Caps `requested` at `max_batch_size`.
///
/// A capped request keeps the effective step size by scaling the *initial*
/// learning rate by `max / requested`.
pub fn cap_batch_size(requested: usize, max_batch_size: usize, initial_lr: f64) -> DampingDecision {
    let requested = requested.max(1);
    let max_batch_size = max_batch_size.max(1);
    if requested >= max_batch_size {
        DampingDecision {
            requested,
            batch_size: max_batch_size,
            learning_rate: Some(initial_lr * max_batch_size as f64 / requested as f64),
        }
    } else {
        DampingDecision {
            requested,
            batch_size: requested,
            learning_rate: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DamperConfig {
    #[serde(default)]
    pub strategy: DampingStrategy,
    #[serde(default = "default_initial_batch_size")]
    pub initial_batch_size: usize,
    /// Defaults to the training set length.
    #[serde(default)]
    pub max_batch_size: Option<usize>,
    #[serde(default)]
    pub loss: LossFunction,
}

impl Default for DamperConfig {
    fn default() -> Self {
        Self {
            strategy: DampingStrategy::default(),
            initial_batch_size: default_initial_batch_size(),
            max_batch_size: None,
            loss: LossFunction::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DampingStrategy {
    #[default]
    #[serde(alias = "basedamper")]
    Constant,
    #[serde(rename = "adadamp")]
    AdaDamp {
        #[serde(default)]
        best_train_loss: Option<f64>,
    },
    #[serde(rename = "padadamp")]
    PadaDamp { rate: f64 },
    #[serde(rename = "geodamp")]
    GeoDamp {
        #[serde(default = "default_damping_delay")]
        damping_delay: usize,
        #[serde(default = "default_geometric_factor")]
        damping_factor: f64,
    },
    #[serde(rename = "geodamplr")]
    GeoDampLr {
        #[serde(default = "default_damping_delay")]
        damping_delay: usize,
        #[serde(default = "default_geometric_factor")]
        damping_factor: f64,
    },
    #[serde(rename = "cntsdamplr")]
    CntsDampLr {
        #[serde(default = "default_continuous_factor")]
        damping_factor: f64,
    },
}

impl DamperConfig {
    pub fn collect_errors(&self, errors: &mut Vec<String>) {
        if self.initial_batch_size == 0 {
            errors.push("damper.initial_batch_size must be greater than 0".to_string());
        }
        if let Some(0) = self.max_batch_size {
            errors.push("damper.max_batch_size must be greater than 0".to_string());
        }

        match self.strategy {
            DampingStrategy::Constant => {}
            DampingStrategy::AdaDamp { best_train_loss } => {
                if let Some(floor) = best_train_loss {
                    if !floor.is_finite() {
                        errors.push("damper.strategy.best_train_loss must be finite".to_string());
                    }
                }
            }
            DampingStrategy::PadaDamp { rate } => {
                if !(rate.is_finite() && rate >= 0.0) {
                    errors.push("damper.strategy.rate must be a finite value >= 0".to_string());
                }
            }
            DampingStrategy::GeoDamp {
                damping_delay,
                damping_factor,
            }
            | DampingStrategy::GeoDampLr {
                damping_delay,
                damping_factor,
            } => {
                if damping_delay == 0 {
                    errors.push("damper.strategy.damping_delay must be greater than 0".to_string());
                }
                if !(damping_factor.is_finite() && damping_factor >= 1.0) {
                    errors.push("damper.strategy.damping_factor must be >= 1".to_string());
                }
            }
            DampingStrategy::CntsDampLr { damping_factor } => {
                if !(damping_factor.is_finite() && damping_factor >= 0.0) {
                    errors.push("damper.strategy.damping_factor must be >= 0".to_string());
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();
        self.collect_errors(&mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TrainingError::validation(errors))
        }
    }

    pub fn build(&self) -> Result<Box<dyn DampingPolicy>, TrainingError> {
        self.validate()?;
        let b0 = self.initial_batch_size;
        let policy: Box<dyn DampingPolicy> = match self.strategy {
            DampingStrategy::Constant => Box::new(Constant::new(b0)),
            DampingStrategy::AdaDamp { best_train_loss } => {
                Box::new(AdaDamp::new(b0).with_best_train_loss(best_train_loss))
            }
            DampingStrategy::PadaDamp { rate } => Box::new(PadaDamp::new(b0, rate)),
            DampingStrategy::GeoDamp {
                damping_delay,
                damping_factor,
            } => Box::new(GeoDamp::new(b0, damping_delay, damping_factor)),
            DampingStrategy::GeoDampLr {
                damping_delay,
                damping_factor,
            } => Box::new(GeoDampLr::new(b0, damping_delay, damping_factor)),
            DampingStrategy::CntsDampLr { damping_factor } => {
                Box::new(CntsDampLr::new(b0, damping_factor))
            }
        };
        Ok(policy)
    }
}

fn default_initial_batch_size() -> usize {
    1
}

fn default_damping_delay() -> usize {
    5
}

fn default_geometric_factor() -> f64 {
    2.0
}

fn default_continuous_factor() -> f64 {
    0.02
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncapped_request_keeps_learning_rate() {
        let decision = cap_batch_size(16, 64, 0.1);
        assert_eq!(decision.batch_size, 16);
        assert_eq!(decision.learning_rate, None);
    }

    #[test]
    fn capped_request_rescales_from_initial_rate() {
        let decision = cap_batch_size(256, 64, 0.1);
        assert_eq!(decision.requested, 256);
        assert_eq!(decision.batch_size, 64);
        let lr = decision.learning_rate.unwrap();
        assert!((lr - 0.025).abs() < 1e-12);

        // No compounding: the same request always yields the same rate.
        assert_eq!(cap_batch_size(256, 64, 0.1).learning_rate, Some(lr));
    }

    #[test]
    fn zero_request_is_raised_to_one() {
        let decision = cap_batch_size(0, 10, 1.0);
        assert_eq!(decision.batch_size, 1);
        assert_eq!(decision.requested, 1);
    }

    #[test]
    fn build_rejects_bad_geometric_factor() {
        let config = DamperConfig {
            strategy: DampingStrategy::GeoDamp {
                damping_delay: 5,
                damping_factor: 0.5,
            },
            ..DamperConfig::default()
        };
        assert!(matches!(config.build(), Err(TrainingError::Validation(_))));
    }

    #[test]
    fn build_selects_named_policy() {
        let cases = [
            (DampingStrategy::Constant, "basedamper"),
            (
                DampingStrategy::AdaDamp {
                    best_train_loss: None,
                },
                "adadamp",
            ),
            (DampingStrategy::PadaDamp { rate: 1.0 }, "padadamp"),
            (
                DampingStrategy::GeoDamp {
                    damping_delay: 5,
                    damping_factor: 2.0,
                },
                "geodamp",
            ),
            (
                DampingStrategy::GeoDampLr {
                    damping_delay: 5,
                    damping_factor: 2.0,
                },
                "geodamplr",
            ),
            (
                DampingStrategy::CntsDampLr {
                    damping_factor: 0.02,
                },
                "cntsdamplr",
            ),
        ];
        for (strategy, name) in cases {
            let config = DamperConfig {
                strategy,
                initial_batch_size: 3,
                ..DamperConfig::default()
            };
            let policy = config.build().unwrap();
            assert_eq!(policy.name(), name);
            assert_eq!(policy.initial_batch_size(), 3);
        }
    }

    #[test]
    fn lr_variants_pin_the_limit_to_the_initial_size() {
        let config = DamperConfig {
            strategy: DampingStrategy::GeoDampLr {
                damping_delay: 1,
                damping_factor: 2.0,
            },
            initial_batch_size: 8,
            ..DamperConfig::default()
        };
        assert_eq!(config.build().unwrap().batch_size_limit(), Some(8));
    }
}
