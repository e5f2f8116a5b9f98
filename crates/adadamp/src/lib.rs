pub mod config;
pub mod damping;
pub mod data;
pub mod experiment;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod state;
pub mod trainer;

pub use config::{ExperimentConfig, TrainingError};
pub use damping::{
    cap_batch_size, DamperConfig, DampingDecision, DampingPolicy, DampingStrategy, LossProbe,
};
pub use data::{RandomBatchSampler, TensorDataset};
pub use experiment::{EpochRecord, Experiment, RunOptions, RunOutput};
pub use logging::{Logger, LoggingSettings, ResultsWriter};
pub use loss::LossFunction;
pub use metrics::{EvaluationSummary, TrainSummary};
pub use optimizer::{OptimizerConfig, OptimizerHyperparameters, TrainerOptimizer};
pub use state::{DamperMeta, PolicySnapshot, TrainingState};
pub use trainer::{Damper, DamperOptions};
