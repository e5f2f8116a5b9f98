use std::time::{Instant, SystemTime, UNIX_EPOCH};

use candle_core::{Device, Module, Tensor};

use crate::{
    damping::{cap_batch_size, DampingDecision, DampingPolicy},
    data::{RandomBatchSampler, TensorDataset},
    loss::LossFunction,
    optimizer::TrainerOptimizer,
    state::{DamperMeta, TrainingState},
    TrainingError,
};

/// Examples per forward pass when sweeping a whole dataset.
pub const EVAL_BATCH_SIZE: usize = 1_000;

#[derive(Debug, Clone)]
pub struct DamperOptions {
    /// Cap on the realised batch size. Defaults to the dataset length; a
    /// policy limit takes precedence over both.
    pub max_batch_size: Option<usize>,
    /// Seed of the batch sampler.
    pub seed: u64,
    pub eval_batch_size: usize,
}

impl Default for DamperOptions {
    fn default() -> Self {
        Self {
            max_batch_size: None,
            seed: 0,
            eval_batch_size: EVAL_BATCH_SIZE,
        }
    }
}

/// Step executor: asks a damping policy for a batch size, draws that many
/// examples and applies one optimizer update.
pub struct Damper<M: Module> {
    model: M,
    optimizer: TrainerOptimizer,
    dataset: TensorDataset,
    loss: LossFunction,
    policy: Box<dyn DampingPolicy>,
    sampler: RandomBatchSampler,
    state: TrainingState,
    initial_lr: f64,
    max_batch_size: usize,
    num_params: usize,
    eval_batch_size: usize,
}

impl<M: Module> Damper<M> {
    pub fn new(
        model: M,
        optimizer: TrainerOptimizer,
        dataset: TensorDataset,
        loss: LossFunction,
        policy: Box<dyn DampingPolicy>,
        options: DamperOptions,
    ) -> Result<Self, TrainingError> {
        let len_dataset = dataset.len();
        let max_batch_size = policy
            .batch_size_limit()
            .or(options.max_batch_size)
            .unwrap_or(len_dataset);
        if max_batch_size == 0 {
            return Err(TrainingError::initialization(
                "max_batch_size must be greater than 0",
            ));
        }
        if options.eval_batch_size == 0 {
            return Err(TrainingError::initialization(
                "eval_batch_size must be greater than 0",
            ));
        }

        let initial_lr = optimizer.learning_rate();
        let num_params = optimizer.num_parameters();
        log::info!(
            "damper '{}' ready: {} examples, initial batch size {}, max batch size {}, lr {}",
            policy.name(),
            len_dataset,
            policy.initial_batch_size(),
            max_batch_size,
            initial_lr
        );

        Ok(Self {
            model,
            optimizer,
            sampler: RandomBatchSampler::new(len_dataset, options.seed),
            state: TrainingState::new(len_dataset, initial_lr),
            dataset,
            loss,
            policy,
            initial_lr,
            max_batch_size,
            num_params,
            eval_batch_size: options.eval_batch_size,
        })
    }

    /// Runs one damping decision and one optimizer update.
    ///
    /// Counters change only once the update has been applied; any error
    /// leaves them as they were.
    pub fn step(&mut self) -> Result<DampingDecision, TrainingError> {
        let step_start = Instant::now();

        let requested = {
            let (model, dataset) = (&self.model, &self.dataset);
            let (loss, eval_batch_size) = (self.loss, self.eval_batch_size);
            let probe = move || mean_loss(model, loss, dataset, eval_batch_size, None);
            self.policy.damping(&self.state, &probe)?
        };
        let damping_time = step_start.elapsed().as_secs_f64();

        let decision = cap_batch_size(requested, self.max_batch_size, self.initial_lr);
        if let Some(lr) = decision.learning_rate {
            self.optimizer.set_learning_rate(lr);
        }

        let update_start = Instant::now();
        let indices = self.sampler.sample(decision.batch_size);
        let (inputs, targets) = self.dataset.gather(&indices)?;

        let output = self.model.forward(&inputs)?;
        let batch_loss = self
            .loss
            .sum(&output, &targets)?
            .affine(1.0 / indices.len() as f64, 0.0)?;
        let loss_value = batch_loss.to_scalar::<f32>()? as f64;

        let mut grads = batch_loss.backward()?;
        self.optimizer.step(&grads)?;
        let released = self.optimizer.zero_grad(&mut grads);
        log::trace!("released {} gradients", released);
        let update_time = update_start.elapsed().as_secs_f64();

        let state = &mut self.state;
        state.num_examples += decision.batch_size as u64;
        state.model_updates += 1;
        state.batch_loss = Some(loss_value);
        state.batch_size = decision.batch_size;
        state.damping = decision.requested;
        state.learning_rate = self.optimizer.learning_rate();
        state.damping_time = damping_time;
        state.update_time = update_time;
        state.step_time = step_start.elapsed().as_secs_f64();
        state.time = unix_time();

        Ok(decision)
    }

    /// Mean loss over `dataset` (the training set when `None`).
    ///
    /// With `frac`, whole evaluation batches are consumed until at least
    /// `frac * len` examples have been seen, and the mean is over those.
    pub fn get_loss(
        &self,
        dataset: Option<&TensorDataset>,
        frac: Option<f64>,
    ) -> Result<f64, TrainingError> {
        let dataset = dataset.unwrap_or(&self.dataset);
        mean_loss(&self.model, self.loss, dataset, self.eval_batch_size, frac)
    }

    pub fn meta(&self) -> DamperMeta {
        DamperMeta {
            damper: self.policy.name(),
            initial_batch_size: self.policy.initial_batch_size(),
            max_batch_size: self.max_batch_size,
            loss_name: self.loss.name(),
            device_type: device_type(self.dataset.device()),
            num_params: self.num_params,
            optimizer: self.optimizer.hyperparameters(),
            state: self.state.clone(),
            epochs: self.state.epochs(),
            policy: self.policy.snapshot(),
        }
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn initial_learning_rate(&self) -> f64 {
        self.initial_lr
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn epochs(&self) -> f64 {
        self.state.epochs()
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn dataset(&self) -> &TensorDataset {
        &self.dataset
    }

    pub fn loss(&self) -> LossFunction {
        self.loss
    }

    pub fn policy(&self) -> &dyn DampingPolicy {
        self.policy.as_ref()
    }

    pub fn eval_batch_size(&self) -> usize {
        self.eval_batch_size
    }
}

fn mean_loss<M: Module>(
    model: &M,
    loss: LossFunction,
    dataset: &TensorDataset,
    batch_size: usize,
    frac: Option<f64>,
) -> Result<f64, TrainingError> {
    let limit = match frac {
        Some(frac) => ((frac * dataset.len() as f64) as usize).max(1),
        None => dataset.len(),
    };

    let mut total = 0.0f64;
    let mut seen = 0usize;
    for batch in dataset.sequential_batches(batch_size) {
        let (inputs, targets) = batch?;
        let output = model.forward(&inputs)?;
        total += scalar(&loss.sum(&output, &targets)?)?;
        seen += targets.dims()[0];
        if seen >= limit {
            break;
        }
    }

    if seen == 0 {
        return Err(TrainingError::runtime("loss requested over an empty dataset"));
    }
    Ok(total / seen as f64)
}

fn scalar(tensor: &Tensor) -> Result<f64, TrainingError> {
    Ok(tensor.to_scalar::<f32>()? as f64)
}

pub(crate) fn device_type(device: &Device) -> &'static str {
    if device.is_cuda() {
        "cuda"
    } else if device.is_metal() {
        "metal"
    } else {
        "cpu"
    }
}

fn unix_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}
