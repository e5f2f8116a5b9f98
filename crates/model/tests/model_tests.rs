use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor};
use model::{Mlp, MlpConfig, OutputHead};

fn build_config(head: OutputHead) -> MlpConfig {
    MlpConfig::new(4, vec![8, 6], 3)
        .with_head(head)
        .with_seed(11)
}

#[test]
fn forward_produces_scores() -> Result<()> {
    let model = Mlp::new(build_config(OutputHead::Identity))?;
    let xs = Tensor::from_slice(&[0.5f32, -1.0, 2.0, 0.0, 1.0, 1.0, 1.0, 1.0], (2, 4), &Device::Cpu)?;

    let out = model.forward(&xs)?;

    assert_eq!(out.dims(), &[2, 3]);
    assert_eq!(out.dtype(), DType::F32);
    Ok(())
}

#[test]
fn log_softmax_head_normalises_rows() -> Result<()> {
    let model = Mlp::new(build_config(OutputHead::LogSoftmax))?;
    let xs = Tensor::from_slice(&[0.1f32, 0.2, 0.3, 0.4], (1, 4), &Device::Cpu)?;

    let probs = model.forward(&xs)?.exp()?.sum_all()?.to_scalar::<f32>()?;

    assert!((probs - 1.0).abs() < 1e-5, "row sums to {probs}");
    Ok(())
}

#[test]
fn parameters_are_named_and_counted() -> Result<()> {
    let model = Mlp::new(build_config(OutputHead::Identity))?;
    let names: Vec<String> = model.parameters().into_iter().map(|(name, _)| name).collect();

    assert_eq!(
        names,
        vec![
            "layer0.weight",
            "layer0.bias",
            "layer1.weight",
            "layer1.bias",
            "layer2.weight",
            "layer2.bias",
        ]
    );
    assert_eq!(model.num_parameters(), 4 * 8 + 8 + 8 * 6 + 6 + 6 * 3 + 3);
    Ok(())
}

#[test]
fn same_seed_gives_same_weights() -> Result<()> {
    let a = Mlp::new(build_config(OutputHead::Identity))?;
    let b = Mlp::new(build_config(OutputHead::Identity))?;
    let c = Mlp::new(build_config(OutputHead::Identity).with_seed(12))?;

    let first = |m: &Mlp| -> Result<Vec<f32>> {
        Ok(m.parameters()[0].1.as_tensor().flatten_all()?.to_vec1::<f32>()?)
    };

    assert_eq!(first(&a)?, first(&b)?);
    assert_ne!(first(&a)?, first(&c)?);
    Ok(())
}

#[test]
fn rejects_mismatched_input_width() -> Result<()> {
    let model = Mlp::new(build_config(OutputHead::Identity))?;
    let xs = Tensor::zeros((2, 5), DType::F32, &Device::Cpu)?;

    assert!(model.forward(&xs).is_err());
    Ok(())
}

#[test]
fn rejects_zero_width_layers() {
    let config = MlpConfig::new(4, vec![0], 2);
    assert!(Mlp::new(config).is_err());
}
