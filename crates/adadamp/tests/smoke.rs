use std::fs;

use adadamp::{
    config::{DatasetKind, OptimizerType},
    damping::{Constant, GeoDamp, GeoDampLr, PadaDamp},
    experiment, Damper, DamperConfig, DamperOptions, DampingPolicy, DampingStrategy, Experiment,
    ExperimentConfig, Logger, LoggingSettings, LossFunction, OptimizerConfig, ResultsWriter,
    TensorDataset, TrainerOptimizer, TrainingError,
};
use anyhow::Result;
use candle_core::{Device, Tensor};
use model::{Mlp, MlpConfig, OutputHead};
use tempfile::tempdir;

fn toy_classification(len: usize) -> Result<TensorDataset> {
    let inputs: Vec<f32> = (0..len)
        .flat_map(|i| {
            let class = (i % 3) as f32;
            [class, 1.0 - class, (i % 5) as f32 * 0.1]
        })
        .collect();
    let labels: Vec<u32> = (0..len as u32).map(|i| i % 3).collect();
    Ok(TensorDataset::new(
        Tensor::from_vec(inputs, (len, 3), &Device::Cpu)?,
        Tensor::from_vec(labels, len, &Device::Cpu)?,
    )?)
}

fn build_damper(
    len: usize,
    policy: Box<dyn DampingPolicy>,
    max_batch_size: Option<usize>,
) -> Result<Damper<Mlp>> {
    let model = Mlp::new(
        MlpConfig::new(3, vec![6], 3)
            .with_head(OutputHead::LogSoftmax)
            .with_seed(11),
    )?;
    let optimizer = TrainerOptimizer::new(
        model.parameters(),
        OptimizerConfig::try_from(&adadamp::config::OptimizerConfig {
            algorithm: OptimizerType::Adadelta,
            learning_rate: 1.0,
            ..Default::default()
        })?,
    )?;
    Ok(Damper::new(
        model,
        optimizer,
        toy_classification(len)?,
        LossFunction::Nll,
        policy,
        DamperOptions {
            max_batch_size,
            seed: 5,
            ..DamperOptions::default()
        },
    )?)
}

#[test]
fn single_constant_step_counts_one_example() -> Result<()> {
    let mut damper = build_damper(100, Box::new(Constant::new(1)), None)?;
    damper.step()?;

    let state = damper.state();
    assert_eq!(state.num_examples, 1);
    assert_eq!(state.model_updates, 1);
    assert_eq!(state.batch_size, 1);
    assert!((damper.epochs() - 0.01).abs() < 1e-12);
    Ok(())
}

#[test]
fn one_epoch_with_fixed_batches_is_five_steps() -> Result<()> {
    let mut damper = build_damper(50, Box::new(Constant::new(10)), None)?;
    let mut logger = Logger::new(LoggingSettings::quiet());
    let (summary, metas) = experiment::train(&mut damper, 1.0, None, &mut logger)?;

    assert_eq!(metas.len(), 5);
    assert_eq!(summary.num_examples, 50);
    assert!(metas.iter().all(|meta| meta.state.batch_size == 10));
    Ok(())
}

#[test]
fn padadamp_grows_until_capped() -> Result<()> {
    let mut damper = build_damper(60, Box::new(PadaDamp::new(2, 0.5)), Some(4))?;
    let mut requested = Vec::new();
    let mut realised = Vec::new();
    for _ in 0..8 {
        let decision = damper.step()?;
        requested.push(decision.requested);
        realised.push(decision.batch_size);
    }

    // b0 + ceil(0.5 * k) for k = 0..8
    assert_eq!(requested, vec![2, 3, 3, 4, 4, 5, 5, 6]);
    assert_eq!(realised, vec![2, 3, 3, 4, 4, 4, 4, 4]);
    // Last request of 6 capped at 4: lr = 1.0 * 4 / 6.
    assert!((damper.learning_rate() - 4.0 / 6.0).abs() < 1e-12);
    assert_eq!(damper.state().num_examples, 28);
    Ok(())
}

#[test]
fn geodamp_grows_at_delay_boundaries() -> Result<()> {
    let mut damper = build_damper(20, Box::new(GeoDamp::new(5, 1, 2.0)), None)?;
    let mut logger = Logger::new(LoggingSettings::quiet());

    let (_, first) = experiment::train(&mut damper, 1.0, None, &mut logger)?;
    assert!(first.iter().all(|meta| meta.state.batch_size == 5));

    let (_, second) = experiment::train(&mut damper, 1.0, None, &mut logger)?;
    assert!(second.iter().all(|meta| meta.state.batch_size == 10));
    assert_eq!(second.len(), 2);
    Ok(())
}

#[test]
fn geodamplr_halves_learning_rate_each_epoch() -> Result<()> {
    let mut damper = build_damper(20, Box::new(GeoDampLr::new(5, 1, 2.0)), Some(64))?;
    let mut logger = Logger::new(LoggingSettings::quiet());

    for expected_lr in [1.0, 0.5, 0.25] {
        let (_, metas) = experiment::train(&mut damper, 1.0, None, &mut logger)?;
        assert_eq!(metas.len(), 4);
        for meta in &metas {
            assert_eq!(meta.state.batch_size, 5);
            assert_eq!(meta.max_batch_size, 5);
            assert!((meta.state.learning_rate - expected_lr).abs() < 1e-12);
        }
    }
    assert_eq!(damper.initial_learning_rate(), 1.0);
    Ok(())
}

#[test]
fn adadamp_reports_losses_in_meta() -> Result<()> {
    let config = DamperConfig {
        strategy: DampingStrategy::AdaDamp {
            best_train_loss: None,
        },
        initial_batch_size: 2,
        ..Default::default()
    };
    let mut damper = build_damper(30, config.build()?, None)?;
    damper.step()?;
    let first = damper.state().batch_size;
    assert_eq!(first, 2);

    damper.step()?;
    let meta = damper.meta();
    assert_eq!(meta.damper, "adadamp");
    assert!(meta.policy.initial_loss.is_some());
    assert!(meta.policy.complete_loss.is_some());
    assert!(meta.state.batch_size >= 1);
    Ok(())
}

#[test]
fn momentum_outside_sgd_is_an_initialization_error() -> Result<()> {
    let err = OptimizerConfig::try_from(&adadamp::config::OptimizerConfig {
        algorithm: OptimizerType::AdamW,
        momentum: 0.5,
        ..Default::default()
    })
    .unwrap_err();
    assert!(matches!(err, TrainingError::Initialization(_)));
    Ok(())
}

#[test]
fn full_experiment_writes_json_lines() -> Result<()> {
    let dir = tempdir()?;
    let config_path = dir.path().join("experiment.toml");
    fs::write(
        &config_path,
        r#"
        [dataset]
        kind = "regression"
        train_examples = 64
        test_examples = 16
        features = 4
        noise = 0.1

        [model]
        hidden_sizes = [8]

        [optimizer]
        algorithm = "sgd"
        learning_rate = 0.01
        momentum = 0.9

        [damper]
        initial_batch_size = 4
        max_batch_size = 32
        loss = "mse"

        [damper.strategy]
        kind = "geodamp"
        damping_delay = 1
        damping_factor = 2.0

        [runtime]
        epochs = 3.0
        enable_stdout = false
        "#,
    )?;

    let config = ExperimentConfig::from_path(&config_path)?;
    assert_eq!(config.dataset.kind, DatasetKind::Regression);
    let mut experiment = Experiment::from_config(config)?;
    let output = experiment.run()?;

    assert_eq!(output.records.len(), 4);
    assert!(output.converged.is_none());
    // 64 / 4 + 64 / 8 + 64 / 16 steps.
    assert_eq!(output.steps.len(), 16 + 8 + 4);
    assert!(output.records.iter().all(|r| r.test.accuracy.is_none()));

    let results_path = dir.path().join("out").join("records.jsonl");
    let mut writer = ResultsWriter::create(&results_path)?;
    writer.write_all(&output.records)?;
    drop(writer);

    let contents = fs::read_to_string(&results_path)?;
    let rows: Vec<serde_json::Value> = contents
        .lines()
        .map(serde_json::from_str::<serde_json::Value>)
        .collect::<std::result::Result<_, _>>()?;
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[0]["meta"]["damper"], "geodamp");
    assert_eq!(rows[0]["meta"]["loss_name"], "mse_loss");
    assert_eq!(rows[0]["meta"]["optimizer"], "sgd");
    assert_eq!(rows[3]["meta"]["epochs"], 3.0);
    assert!(rows[0]["summary"]["_train_time"].is_number());
    assert!(rows[0]["test"].get("acc").is_none());
    Ok(())
}

#[test]
fn invalid_config_reports_every_problem() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("bad.toml");
    fs::write(
        &path,
        r#"
        [damper]
        initial_batch_size = 0

        [damper.strategy]
        kind = "padadamp"
        rate = -1.0
        "#,
    )?;

    match ExperimentConfig::from_path(&path) {
        Err(TrainingError::Validation(messages)) => assert_eq!(messages.len(), 2),
        other => panic!("expected validation error, got {:?}", other.map(|_| ())),
    }
    Ok(())
}
