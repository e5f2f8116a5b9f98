//! Experiment loop: alternate evaluation and training until the epoch budget
//! is spent or a policy reports convergence.

use std::time::Instant;

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device, Module,
};
use log::{info, warn};
use model::{Mlp, MlpConfig, OutputHead};
use serde::Serialize;

use crate::{
    config::{DeviceChoice, ExperimentConfig, RuntimeConfig},
    data::{self, TensorDataset},
    logging::{Logger, LoggingSettings},
    loss::LossFunction,
    metrics::{EvaluationMetrics, EvaluationSummary, TrainSummary},
    optimizer::{OptimizerConfig, TrainerOptimizer},
    state::DamperMeta,
    trainer::{Damper, DamperOptions},
    TrainingError,
};

/// Evaluation chunks shrink to `test_freq` epochs only up to this epoch.
const EARLY_EPOCHS: f64 = 5.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOptions {
    pub epochs: f64,
    pub test_freq: Option<f64>,
    pub train_stats: bool,
    pub verbose: Option<f64>,
    pub eval_batch_size: usize,
    pub seed: u64,
}

impl From<&RuntimeConfig> for RunOptions {
    fn from(runtime: &RuntimeConfig) -> Self {
        Self {
            epochs: runtime.epochs,
            test_freq: runtime.test_freq,
            train_stats: runtime.train_stats,
            verbose: runtime.verbose,
            eval_batch_size: runtime.eval_batch_size,
            seed: runtime.seed,
        }
    }
}

/// One evaluation boundary of a run.
#[derive(Debug, Clone, Serialize)]
pub struct EpochRecord {
    pub options: RunOptions,
    pub meta: DamperMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub train: Option<EvaluationSummary>,
    pub test: EvaluationSummary,
    /// Summary of the training chunk that followed this evaluation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<TrainSummary>,
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub records: Vec<EpochRecord>,
    /// One snapshot per optimizer step.
    pub steps: Vec<DamperMeta>,
    /// Set when a policy stopped the run early.
    pub converged: Option<String>,
}

/// Sequential pass over `dataset` without updating the model.
pub fn test<M: Module>(
    model: &M,
    loss: LossFunction,
    dataset: &TensorDataset,
    batch_size: usize,
    prefix: &str,
) -> Result<EvaluationSummary, TrainingError> {
    let mut metrics = EvaluationMetrics::default();
    for batch in dataset.sequential_batches(batch_size) {
        let (inputs, targets) = batch?;
        let output = model.forward(&inputs)?;
        let loss_sum = loss.sum(&output, &targets)?.to_scalar::<f32>()? as f64;
        let correct = if loss.supports_accuracy() {
            Some(loss.correct(&output, &targets)? as u64)
        } else {
            None
        };
        metrics.update(loss_sum, targets.dims()[0] as u64, correct);
    }

    metrics
        .finalize()
        .ok_or_else(|| TrainingError::runtime(format!("{} evaluation saw no examples", prefix)))
}

/// Steps `damper` until `epochs * len_dataset` more examples have been drawn.
pub fn train<M: Module>(
    damper: &mut Damper<M>,
    epochs: f64,
    verbose: Option<f64>,
    logger: &mut Logger,
) -> Result<(TrainSummary, Vec<DamperMeta>), TrainingError> {
    let len_dataset = damper.dataset().len();
    let budget = epochs * len_dataset as f64;
    let print_every = verbose.map(|v| ((len_dataset as f64 / v) as u64).max(1));

    let start_examples = damper.state().num_examples;
    let mut last_print = start_examples;
    let mut metas = Vec::new();
    let started = Instant::now();

    while ((damper.state().num_examples - start_examples) as f64) < budget {
        damper.step()?;
        let state = damper.state();
        logger.log_step(state);
        if let Some(every) = print_every {
            if state.num_examples >= last_print + every {
                logger.log_progress(state);
                last_print = state.num_examples;
            }
        }
        metas.push(damper.meta());
    }

    let summary = TrainSummary {
        epochs,
        num_examples: damper.state().num_examples - start_examples,
        train_time: started.elapsed().as_secs_f64(),
    };
    logger.log_train_summary(&summary);
    Ok((summary, metas))
}

pub fn run<M: Module>(
    damper: &mut Damper<M>,
    test_set: &TensorDataset,
    options: &RunOptions,
    logger: &mut Logger,
) -> Result<RunOutput, TrainingError> {
    let mut records: Vec<EpochRecord> = Vec::new();
    let mut steps = Vec::new();
    let mut converged = None;

    loop {
        let train_stats = if options.train_stats {
            let summary = test(
                damper.model(),
                damper.loss(),
                damper.dataset(),
                options.eval_batch_size,
                "train",
            )?;
            logger.log_evaluation("train", damper.epochs(), &summary);
            Some(summary)
        } else {
            None
        };
        let test_stats = test(
            damper.model(),
            damper.loss(),
            test_set,
            options.eval_batch_size,
            "test",
        )?;
        logger.log_evaluation("test", damper.epochs(), &test_stats);

        let meta = damper.meta();
        let epochs = meta.epochs;
        records.push(EpochRecord {
            options: options.clone(),
            meta,
            train: train_stats,
            test: test_stats,
            summary: None,
        });

        if epochs >= options.epochs {
            info!("reached {:.2} epochs; stopping", epochs);
            break;
        }

        let chunk = match options.test_freq {
            Some(freq) if epochs <= EARLY_EPOCHS => freq,
            _ => 1.0,
        };
        match train(damper, chunk, options.verbose, logger) {
            Ok((summary, metas)) => {
                steps.extend(metas);
                if let Some(record) = records.last_mut() {
                    record.summary = Some(summary);
                }
            }
            Err(err) if err.is_convergence() => {
                info!("{}", err);
                converged = Some(err.to_string());
                break;
            }
            Err(err) => return Err(err),
        }
    }

    Ok(RunOutput {
        records,
        steps,
        converged,
    })
}

/// Everything needed to run one configured experiment.
pub struct Experiment {
    damper: Damper<Mlp>,
    test_set: TensorDataset,
    options: RunOptions,
    logger: Logger,
}

impl Experiment {
    pub fn from_config(config: ExperimentConfig) -> Result<Self, TrainingError> {
        config.validate()?;

        let device = select_device(config.runtime.device)?;
        let data = data::synthetic(&config.dataset, &device)?;
        info!(
            "generated {:?} data: {} train / {} test examples, {} features",
            config.dataset.kind,
            data.train.len(),
            data.test.len(),
            data.train.features()
        );

        let loss = config.damper.loss;
        let head = match loss {
            LossFunction::Nll => OutputHead::LogSoftmax,
            LossFunction::CrossEntropy | LossFunction::Mse => OutputHead::Identity,
        };
        let model = Mlp::new(
            MlpConfig::new(
                config.dataset.features,
                config.model.hidden_sizes.clone(),
                data::output_dim(&config.dataset),
            )
            .with_head(head)
            .with_seed(config.model.seed)
            .with_device(device.clone()),
        )
        .map_err(|err| TrainingError::initialization(format!("failed to build model: {err}")))?;
        info!("model has {} parameters", model.num_parameters());

        let optimizer_config = OptimizerConfig::try_from(&config.optimizer)?;
        let optimizer = TrainerOptimizer::new(model.parameters(), optimizer_config)?;
        let policy = config.damper.build()?;

        let damper = Damper::new(
            model,
            optimizer,
            data.train,
            loss,
            policy,
            DamperOptions {
                max_batch_size: config.damper.max_batch_size,
                seed: config.runtime.seed,
                eval_batch_size: config.runtime.eval_batch_size,
            },
        )?;

        let options = RunOptions::from(&config.runtime);
        let logger = Logger::new(LoggingSettings::from_config(
            config.runtime.enable_stdout,
            config.runtime.log_every_n_steps,
        ));

        Ok(Self {
            damper,
            test_set: data.test,
            options,
            logger,
        })
    }

    pub fn run(&mut self) -> Result<RunOutput, TrainingError> {
        run(&mut self.damper, &self.test_set, &self.options, &mut self.logger)
    }

    pub fn damper(&self) -> &Damper<Mlp> {
        &self.damper
    }

    pub fn test_set(&self) -> &TensorDataset {
        &self.test_set
    }
}

pub fn select_device(choice: DeviceChoice) -> Result<Device, TrainingError> {
    match choice {
        DeviceChoice::Cpu => Ok(Device::Cpu),
        DeviceChoice::Cuda => Device::new_cuda(0).map_err(|err| {
            TrainingError::initialization(format!("failed to initialize CUDA device: {err}"))
        }),
        DeviceChoice::Metal => Device::new_metal(0).map_err(|err| {
            TrainingError::initialization(format!("failed to initialize Metal device: {err}"))
        }),
        DeviceChoice::Auto => {
            let cuda_available = cuda_is_available();
            let metal_available = metal_is_available();
            info!(
                "device detection: cuda_available={} metal_available={}",
                cuda_available, metal_available
            );

            if metal_available {
                match Device::new_metal(0) {
                    Ok(device) => return Ok(device),
                    Err(err) => warn!("failed to initialize metal device, falling back: {}", err),
                }
            }
            if cuda_available {
                match Device::new_cuda(0) {
                    Ok(device) => return Ok(device),
                    Err(err) => warn!("cuda reported available but initialization failed: {}", err),
                }
            }
            info!("no GPU backend available; using CPU");
            Ok(Device::Cpu)
        }
    }
}
