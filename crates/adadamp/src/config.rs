use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{damping::DamperConfig, loss::LossFunction};

/// Complete description of one experiment: data, network, optimizer, damping
/// policy and run-time knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default)]
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub damper: DamperConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl ExperimentConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: ExperimentConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.dataset.train_examples == 0 {
            errors.push("dataset.train_examples must be greater than 0".to_string());
        }
        if self.dataset.test_examples == 0 {
            errors.push("dataset.test_examples must be greater than 0".to_string());
        }
        if self.dataset.features == 0 {
            errors.push("dataset.features must be greater than 0".to_string());
        }
        if self.dataset.kind == DatasetKind::Classification && self.dataset.classes < 2 {
            errors.push("dataset.classes must be at least 2 for classification".to_string());
        }
        if !(self.dataset.noise.is_finite() && self.dataset.noise >= 0.0) {
            errors.push("dataset.noise must be a finite value >= 0".to_string());
        }

        if self.model.hidden_sizes.iter().any(|&width| width == 0) {
            errors.push("model.hidden_sizes entries must be greater than 0".to_string());
        }

        if !(self.optimizer.learning_rate.is_finite() && self.optimizer.learning_rate > 0.0) {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }
        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }
        if !(0.0..1.0).contains(&self.optimizer.momentum) {
            errors.push("optimizer.momentum must be in [0, 1)".to_string());
        }
        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }
        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }
        if !(0.0 < self.optimizer.rho && self.optimizer.rho <= 1.0) {
            errors.push("optimizer.rho must be in (0, 1]".to_string());
        }
        if let Some(eps) = self.optimizer.epsilon {
            if eps <= 0.0 {
                errors.push("optimizer.epsilon must be greater than 0".to_string());
            }
        }

        self.damper.collect_errors(&mut errors);

        match (self.damper.loss, self.dataset.kind) {
            (LossFunction::Mse, DatasetKind::Classification) => errors.push(
                "damper.loss mse requires a regression dataset".to_string(),
            ),
            (LossFunction::Nll | LossFunction::CrossEntropy, DatasetKind::Regression) => errors
                .push(format!(
                    "damper.loss {} requires a classification dataset",
                    self.damper.loss.name()
                )),
            _ => {}
        }

        if !(self.runtime.epochs.is_finite() && self.runtime.epochs > 0.0) {
            errors.push("runtime.epochs must be greater than 0".to_string());
        }
        if let Some(freq) = self.runtime.test_freq {
            if !(freq.is_finite() && freq > 0.0) {
                errors.push("runtime.test_freq must be greater than 0".to_string());
            }
        }
        if let Some(verbose) = self.runtime.verbose {
            if !(verbose.is_finite() && verbose > 0.0) {
                errors.push("runtime.verbose must be greater than 0".to_string());
            }
        }
        if self.runtime.eval_batch_size == 0 {
            errors.push("runtime.eval_batch_size must be greater than 0".to_string());
        }
        if self.runtime.log_every_n_steps == 0 {
            errors.push("runtime.log_every_n_steps must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    /// Gaussian blobs, one centre per class.
    #[default]
    Classification,
    /// Noisy linear targets.
    Regression,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    #[serde(default)]
    pub kind: DatasetKind,
    #[serde(default = "default_train_examples")]
    pub train_examples: usize,
    #[serde(default = "default_test_examples")]
    pub test_examples: usize,
    #[serde(default = "default_features")]
    pub features: usize,
    #[serde(default = "default_classes")]
    pub classes: usize,
    #[serde(default = "default_noise")]
    pub noise: f64,
    #[serde(default = "default_data_seed")]
    pub seed: u64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            kind: DatasetKind::default(),
            train_examples: default_train_examples(),
            test_examples: default_test_examples(),
            features: default_features(),
            classes: default_classes(),
            noise: default_noise(),
            seed: default_data_seed(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_hidden_sizes")]
    pub hidden_sizes: Vec<usize>,
    #[serde(default)]
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_sizes: default_hidden_sizes(),
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub algorithm: OptimizerType,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub momentum: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_rho")]
    pub rho: f64,
    /// Falls back to the algorithm's customary value when unset.
    #[serde(default)]
    pub epsilon: Option<f64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            algorithm: OptimizerType::default(),
            learning_rate: default_learning_rate(),
            momentum: 0.0,
            weight_decay: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            rho: default_rho(),
            epsilon: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerType {
    #[default]
    Sgd,
    #[serde(rename = "adamw")]
    AdamW,
    Adadelta,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceChoice {
    #[default]
    Cpu,
    Cuda,
    Metal,
    /// Metal, then CUDA, then CPU.
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Stop once `num_examples / len_dataset` reaches this many epochs.
    #[serde(default = "default_epochs")]
    pub epochs: f64,
    /// Epochs trained between evaluations while fewer than five epochs have run.
    #[serde(default)]
    pub test_freq: Option<f64>,
    #[serde(default = "default_true")]
    pub train_stats: bool,
    /// Progress lines per epoch during training.
    #[serde(default)]
    pub verbose: Option<f64>,
    #[serde(default = "default_eval_batch_size")]
    pub eval_batch_size: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub device: DeviceChoice,
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            test_freq: None,
            train_stats: true,
            verbose: None,
            eval_batch_size: default_eval_batch_size(),
            seed: default_seed(),
            device: DeviceChoice::default(),
            log_every_n_steps: default_log_every_n_steps(),
            enable_stdout: true,
        }
    }
}

fn default_train_examples() -> usize {
    1_000
}

fn default_test_examples() -> usize {
    200
}

fn default_features() -> usize {
    10
}

fn default_classes() -> usize {
    3
}

fn default_noise() -> f64 {
    1.0
}

fn default_data_seed() -> u64 {
    7
}

fn default_hidden_sizes() -> Vec<usize> {
    vec![64]
}

fn default_learning_rate() -> f64 {
    0.05
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_rho() -> f64 {
    0.9
}

fn default_epochs() -> f64 {
    1.0
}

fn default_eval_batch_size() -> usize {
    1_000
}

fn default_seed() -> u64 {
    42
}

fn default_log_every_n_steps() -> usize {
    100
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ConfigFormat(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("trainer initialization failed: {0}")]
    Initialization(String),
    #[error("training failed: {0}")]
    Runtime(String),
    #[error("tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),
    /// Clean early stop; only the experiment loop catches it.
    #[error("converged: {0}")]
    Converged(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn converged(message: impl Into<String>) -> Self {
        Self::Converged(message.into())
    }

    pub fn is_convergence(&self) -> bool {
        matches!(self, Self::Converged(_))
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::damping::DampingStrategy;

    #[test]
    fn empty_toml_uses_defaults() {
        let config: ExperimentConfig = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.optimizer.algorithm, OptimizerType::Sgd);
        assert_eq!(config.damper.initial_batch_size, 1);
        assert!(matches!(config.damper.strategy, DampingStrategy::Constant));
        assert_eq!(config.runtime.eval_batch_size, 1_000);
    }

    #[test]
    fn parses_tagged_strategy() {
        let config: ExperimentConfig = toml::from_str(
            r#"
            [damper]
            initial_batch_size = 4
            max_batch_size = 64

            [damper.strategy]
            kind = "padadamp"
            rate = 0.25
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        match config.damper.strategy {
            DampingStrategy::PadaDamp { rate } => assert_eq!(rate, 0.25),
            other => panic!("unexpected strategy {:?}", other),
        }
        assert_eq!(config.damper.max_batch_size, Some(64));
    }

    #[test]
    fn unknown_optimizer_is_rejected() {
        let err = toml::from_str::<ExperimentConfig>(
            r#"
            [optimizer]
            algorithm = "lbfgs"
            "#,
        )
        .map_err(TrainingError::from)
        .unwrap_err();
        assert!(matches!(err, TrainingError::ConfigFormat(_)));
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config = ExperimentConfig::default();
        config.dataset.train_examples = 0;
        config.optimizer.learning_rate = 0.0;
        config.runtime.epochs = -1.0;
        config.damper.loss = LossFunction::Mse;

        match config.validate() {
            Err(TrainingError::Validation(messages)) => {
                assert_eq!(messages.len(), 4, "{:?}", messages);
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn json_config_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiment.json");
        let mut config = ExperimentConfig::default();
        config.runtime.epochs = 3.0;
        fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();

        let loaded = ExperimentConfig::from_path(&path).unwrap();
        assert_eq!(loaded.runtime.epochs, 3.0);
    }

    #[test]
    fn unsupported_extension_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiment.yaml");
        fs::write(&path, "").unwrap();

        assert!(matches!(
            ExperimentConfig::from_path(&path),
            Err(TrainingError::ConfigFormat(_))
        ));
    }
}
