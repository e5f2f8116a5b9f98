use log::warn;

use super::{DampingPolicy, LossProbe};
use crate::{
    state::{PolicySnapshot, TrainingState},
    TrainingError,
};

/// Fixed batch size; wraps an optimizer without any damping.
#[derive(Debug, Clone)]
pub struct Constant {
    initial_batch_size: usize,
}

impl Constant {
    pub fn new(initial_batch_size: usize) -> Self {
        Self {
            initial_batch_size: initial_batch_size.max(1),
        }
    }
}

impl DampingPolicy for Constant {
    fn name(&self) -> &'static str {
        "basedamper"
    }

    fn initial_batch_size(&self) -> usize {
        self.initial_batch_size
    }

    fn damping(&mut self, _: &TrainingState, _: &dyn LossProbe) -> Result<usize, TrainingError> {
        Ok(self.initial_batch_size)
    }
}

/// Grows the batch size as the full training loss falls:
/// `ceil(b0 * initial_loss / current_loss)`.
///
/// Every call evaluates the whole training set through the probe.
#[derive(Debug, Clone)]
pub struct AdaDamp {
    initial_batch_size: usize,
    best_train_loss: Option<f64>,
    initial_loss: Option<f64>,
    complete_loss: Option<f64>,
}

impl AdaDamp {
    pub fn new(initial_batch_size: usize) -> Self {
        Self {
            initial_batch_size: initial_batch_size.max(1),
            best_train_loss: None,
            initial_loss: None,
            complete_loss: None,
        }
    }

    /// Shifts both losses by this floor before taking their ratio.
    pub fn with_best_train_loss(mut self, best_train_loss: Option<f64>) -> Self {
        self.best_train_loss = best_train_loss;
        self
    }

    pub fn initial_loss(&self) -> Option<f64> {
        self.initial_loss
    }

    pub fn complete_loss(&self) -> Option<f64> {
        self.complete_loss
    }
}

impl DampingPolicy for AdaDamp {
    fn name(&self) -> &'static str {
        "adadamp"
    }

    fn initial_batch_size(&self) -> usize {
        self.initial_batch_size
    }

    fn damping(
        &mut self,
        state: &TrainingState,
        probe: &dyn LossProbe,
    ) -> Result<usize, TrainingError> {
        let loss = probe.full_loss()?;
        if state.model_updates == 0 || self.initial_loss.is_none() {
            self.initial_loss = Some(loss);
        }
        self.complete_loss = Some(loss);

        if !loss.is_finite() {
            warn!(
                "adadamp: training loss is {} after {} updates; using batch size 1",
                loss, state.model_updates
            );
            return Ok(1);
        }

        let mut initial = self.initial_loss.unwrap_or(loss);
        let mut current = loss;
        if let Some(floor) = self.best_train_loss {
            initial -= floor;
            current -= floor;
            if current <= 0.0 {
                return Err(TrainingError::converged(format!(
                    "training loss {:.6} reached best_train_loss {:.6} after {} updates",
                    loss, floor, state.model_updates
                )));
            }
        }

        let target = self.initial_batch_size as f64 * initial / current;
        if target.is_nan() {
            warn!("adadamp: loss ratio is undefined; using batch size 1");
            return Ok(1);
        }
        Ok(to_batch_size(target.ceil()))
    }

    fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            best_train_loss: self.best_train_loss,
            initial_loss: self.initial_loss,
            complete_loss: self.complete_loss,
            ..PolicySnapshot::default()
        }
    }
}

/// Linear growth in the number of model updates: `b0 + ceil(rate * k)`.
#[derive(Debug, Clone)]
pub struct PadaDamp {
    initial_batch_size: usize,
    rate: f64,
}

impl PadaDamp {
    pub fn new(initial_batch_size: usize, rate: f64) -> Self {
        Self {
            initial_batch_size: initial_batch_size.max(1),
            rate,
        }
    }
}

impl DampingPolicy for PadaDamp {
    fn name(&self) -> &'static str {
        "padadamp"
    }

    fn initial_batch_size(&self) -> usize {
        self.initial_batch_size
    }

    fn damping(&mut self, state: &TrainingState, _: &dyn LossProbe) -> Result<usize, TrainingError> {
        let growth = to_count((self.rate * state.model_updates as f64).ceil());
        Ok(self.initial_batch_size.saturating_add(growth))
    }

    fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            rate: Some(self.rate),
            ..PolicySnapshot::default()
        }
    }
}

/// Multiplies the batch size by `damping_factor` every `damping_delay` epochs.
#[derive(Debug, Clone)]
pub struct GeoDamp {
    initial_batch_size: usize,
    damping_delay: usize,
    damping_factor: f64,
}

impl GeoDamp {
    pub fn new(initial_batch_size: usize, damping_delay: usize, damping_factor: f64) -> Self {
        Self {
            initial_batch_size: initial_batch_size.max(1),
            damping_delay: damping_delay.max(1),
            damping_factor,
        }
    }

    fn batch_size_at(&self, epochs: f64) -> usize {
        let exponent = (epochs / self.damping_delay as f64).floor();
        let growth = self.damping_factor.powi(exponent.min(i32::MAX as f64) as i32);
        to_batch_size((self.initial_batch_size as f64 * growth).floor())
    }
}

impl DampingPolicy for GeoDamp {
    fn name(&self) -> &'static str {
        "geodamp"
    }

    fn initial_batch_size(&self) -> usize {
        self.initial_batch_size
    }

    fn damping(&mut self, state: &TrainingState, _: &dyn LossProbe) -> Result<usize, TrainingError> {
        Ok(self.batch_size_at(state.epochs()))
    }

    fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            damping_delay: Some(self.damping_delay),
            damping_factor: Some(self.damping_factor),
            ..PolicySnapshot::default()
        }
    }
}

/// [`GeoDamp`] growth with the batch size held at `b0`; the cap turns the
/// growth into learning-rate decay.
#[derive(Debug, Clone)]
pub struct GeoDampLr {
    inner: GeoDamp,
}

impl GeoDampLr {
    pub fn new(initial_batch_size: usize, damping_delay: usize, damping_factor: f64) -> Self {
        Self {
            inner: GeoDamp::new(initial_batch_size, damping_delay, damping_factor),
        }
    }
}

impl DampingPolicy for GeoDampLr {
    fn name(&self) -> &'static str {
        "geodamplr"
    }

    fn initial_batch_size(&self) -> usize {
        self.inner.initial_batch_size
    }

    fn damping(
        &mut self,
        state: &TrainingState,
        probe: &dyn LossProbe,
    ) -> Result<usize, TrainingError> {
        self.inner.damping(state, probe)
    }

    fn batch_size_limit(&self) -> Option<usize> {
        Some(self.inner.initial_batch_size)
    }

    fn snapshot(&self) -> PolicySnapshot {
        self.inner.snapshot()
    }
}

/// Continuous linear growth, rounded half-to-even:
/// `round(b0 + 1 + damping_factor * (k + 1))`. Held at `b0` like [`GeoDampLr`].
#[derive(Debug, Clone)]
pub struct CntsDampLr {
    initial_batch_size: usize,
    damping_factor: f64,
}

impl CntsDampLr {
    pub fn new(initial_batch_size: usize, damping_factor: f64) -> Self {
        Self {
            initial_batch_size: initial_batch_size.max(1),
            damping_factor,
        }
    }
}

impl DampingPolicy for CntsDampLr {
    fn name(&self) -> &'static str {
        "cntsdamplr"
    }

    fn initial_batch_size(&self) -> usize {
        self.initial_batch_size
    }

    fn damping(&mut self, state: &TrainingState, _: &dyn LossProbe) -> Result<usize, TrainingError> {
        let k = state.model_updates as f64;
        let target = self.initial_batch_size as f64 + 1.0 + self.damping_factor * (k + 1.0);
        Ok(to_batch_size(target.round_ties_even()))
    }

    fn batch_size_limit(&self) -> Option<usize> {
        Some(self.initial_batch_size)
    }

    fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            damping_factor: Some(self.damping_factor),
            ..PolicySnapshot::default()
        }
    }
}

/// Saturating float-to-size conversion with a floor of one.
fn to_batch_size(value: f64) -> usize {
    to_count(value).max(1)
}

fn to_count(value: f64) -> usize {
    if value.is_nan() {
        0
    } else {
        value as usize
    }
}
