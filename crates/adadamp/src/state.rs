use serde::Serialize;

use crate::optimizer::OptimizerHyperparameters;

/// Progress counters owned by the step executor and read by damping policies.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingState {
    pub num_examples: u64,
    pub model_updates: u64,
    /// Mean loss of the last batch; absent before the first step.
    pub batch_loss: Option<f64>,
    /// Realised size of the last batch.
    pub batch_size: usize,
    /// Size requested by the policy for the last batch, before capping.
    pub damping: usize,
    pub learning_rate: f64,
    pub len_dataset: usize,
    /// Seconds spent inside the policy for the last step.
    pub damping_time: f64,
    /// Seconds spent drawing the batch and applying the update.
    pub update_time: f64,
    /// Seconds for the whole last step.
    pub step_time: f64,
    /// Wall-clock seconds since the UNIX epoch at the end of the last step.
    pub time: f64,
}

impl TrainingState {
    pub fn new(len_dataset: usize, learning_rate: f64) -> Self {
        Self {
            num_examples: 0,
            model_updates: 0,
            batch_loss: None,
            batch_size: 0,
            damping: 0,
            learning_rate,
            len_dataset,
            damping_time: 0.0,
            update_time: 0.0,
            step_time: 0.0,
            time: 0.0,
        }
    }

    /// Fractional passes over the training set.
    pub fn epochs(&self) -> f64 {
        if self.len_dataset == 0 {
            0.0
        } else {
            self.num_examples as f64 / self.len_dataset as f64
        }
    }
}

/// Parameters and internal state a policy chooses to report.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PolicySnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub damping_delay: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub damping_factor: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_train_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complete_loss: Option<f64>,
}

/// Flat snapshot of the executor: fixed parameters, counters and policy state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DamperMeta {
    pub damper: &'static str,
    pub initial_batch_size: usize,
    pub max_batch_size: usize,
    pub loss_name: &'static str,
    pub device_type: &'static str,
    pub num_params: usize,
    #[serde(flatten)]
    pub optimizer: OptimizerHyperparameters,
    #[serde(flatten)]
    pub state: TrainingState,
    pub epochs: f64,
    #[serde(flatten)]
    pub policy: PolicySnapshot,
}
