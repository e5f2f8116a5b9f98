use std::{path::PathBuf, str::FromStr};

use adadamp::{Experiment, ExperimentConfig, ResultsWriter, TrainingError};
use clap::Parser;
use serde_json::{Number, Value};
use tracing_subscriber::EnvFilter;

fn main() {
    if let Err(err) = run() {
        eprintln!("experiment failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Adaptive batch-size SGD experiments", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to experiment config file (.toml or .json); defaults apply when omitted"
    )]
    config: Option<PathBuf>,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Write one JSON object per evaluation to this file"
    )]
    output: Option<PathBuf>,

    #[arg(long, value_name = "PATH", help = "Write one JSON object per step to this file")]
    steps: Option<PathBuf>,

    #[arg(short, long, help = "Suppress progress lines on stdout")]
    quiet: bool,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = match args.config.as_ref() {
        Some(path) => ExperimentConfig::load(path)?,
        None => ExperimentConfig::default(),
    };
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
    }
    if args.quiet {
        config.runtime.enable_stdout = false;
    }
    config.validate()?;

    let mut experiment = Experiment::from_config(config)?;
    println!(
        "damper={} train_examples={} test_examples={} max_batch_size={}",
        experiment.damper().meta().damper,
        experiment.damper().dataset().len(),
        experiment.test_set().len(),
        experiment.damper().max_batch_size()
    );
    let output = experiment.run()?;

    if let Some(reason) = output.converged.as_ref() {
        println!("stopped early: {}", reason);
    }
    if let Some(last) = output.records.last() {
        println!(
            "finished: damper={} epochs={:.2} updates={} test_loss={:.4}",
            last.meta.damper, last.meta.epochs, last.meta.state.model_updates, last.test.loss
        );
    }

    if let Some(path) = args.output.as_ref() {
        let mut writer = ResultsWriter::create(path)?;
        writer.write_all(&output.records)?;
        println!("wrote {} records to {}", writer.written(), path.display());
    }
    if let Some(path) = args.steps.as_ref() {
        let mut writer = ResultsWriter::create(path)?;
        writer.write_all(&output.steps)?;
        println!("wrote {} step records to {}", writer.written(), path.display());
    }

    Ok(())
}

fn apply_overrides(
    config: ExperimentConfig,
    overrides: &[OverrideArg],
) -> Result<ExperimentConfig, TrainingError> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainingError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }

    serde_json::from_value(value).map_err(|err| {
        TrainingError::ConfigFormat(format!("invalid config after overrides: {err}"))
    })
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

/// Writes `new_value` at a dot-separated path, creating missing tables on the
/// way. Only tables can be walked through; arrays are replaced whole.
fn set_value_at_path(
    target: &mut Value,
    path: &str,
    new_value: Value,
) -> Result<(), TrainingError> {
    let keys: Vec<&str> = path.split('.').map(str::trim).collect();
    if keys.iter().any(|key| key.is_empty()) {
        return Err(TrainingError::runtime(format!(
            "override path '{}' has an empty segment",
            path
        )));
    }
    let Some((last, parents)) = keys.split_last() else {
        return Err(TrainingError::runtime("override path must not be empty"));
    };

    let mut current = target;
    for key in parents {
        current = table_mut(current, key)?
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    table_mut(current, last)?.insert(last.to_string(), new_value);
    Ok(())
}

fn table_mut<'a>(
    value: &'a mut Value,
    key: &str,
) -> Result<&'a mut serde_json::Map<String, Value>, TrainingError> {
    if value.is_null() {
        *value = Value::Object(serde_json::Map::new());
    }
    value.as_object_mut().ok_or_else(|| {
        TrainingError::runtime(format!(
            "override key '{}' points into a non-table value",
            key
        ))
    })
}
