use serde::Serialize;

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Running totals for one evaluation pass.
#[derive(Debug, Default)]
pub struct EvaluationMetrics {
    loss_sum: f64,
    examples: u64,
    correct: Option<u64>,
}

impl EvaluationMetrics {
    /// Adds a batch; `loss_sum` is the summed (not averaged) batch loss.
    pub fn update(&mut self, loss_sum: f64, examples: u64, correct: Option<u64>) {
        self.loss_sum += loss_sum;
        self.examples += examples;
        if let Some(correct) = correct {
            *self.correct.get_or_insert(0) += correct;
        }
    }

    pub fn finalize(self) -> Option<EvaluationSummary> {
        if self.examples == 0 {
            return None;
        }
        let examples = self.examples as f64;
        Some(EvaluationSummary {
            loss: self.loss_sum / examples,
            accuracy: self.correct.map(|correct| correct as f64 / examples),
            examples: self.examples,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationSummary {
    pub loss: f64,
    /// Top-1 accuracy in `[0, 1]`; absent for regression losses.
    #[serde(rename = "acc", skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    pub examples: u64,
}

/// Outcome of one `train` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainSummary {
    /// Epoch budget the call was asked to train for.
    #[serde(rename = "_epochs")]
    pub epochs: f64,
    /// Examples drawn during the call.
    #[serde(rename = "_num_examples")]
    pub num_examples: u64,
    /// Wall-clock seconds spent in the call.
    #[serde(rename = "_train_time")]
    pub train_time: f64,
}
