use candle_core::{DType, Error, Module, Result, Tensor, Var, D};
use rand::{
    distributions::{Distribution, Uniform},
    rngs::StdRng,
    SeedableRng,
};

use crate::config::{MlpConfig, OutputHead};

/// Fully connected network with ReLU between hidden layers.
///
/// Parameters are plain [`Var`]s so an external optimizer can own the update
/// rule; [`Mlp::parameters`] hands them out by name.
#[derive(Debug, Clone)]
pub struct Mlp {
    config: MlpConfig,
    layers: Vec<DenseLayer>,
}

#[derive(Debug, Clone)]
struct DenseLayer {
    weight: Var,
    bias: Var,
}

impl Mlp {
    /// Builds the network, drawing weights and biases from
    /// `U(-1/sqrt(fan_in), 1/sqrt(fan_in))` with a seeded generator.
    pub fn new(config: MlpConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);

        let widths = config.widths();
        let mut layers = Vec::with_capacity(widths.len() - 1);
        for pair in widths.windows(2) {
            let (fan_in, fan_out) = (pair[0], pair[1]);
            let bound = 1.0 / (fan_in as f32).sqrt();
            let dist = Uniform::new_inclusive(-bound, bound);

            let weight: Vec<f32> = (0..fan_in * fan_out).map(|_| dist.sample(&mut rng)).collect();
            let bias: Vec<f32> = (0..fan_out).map(|_| dist.sample(&mut rng)).collect();

            let weight = Tensor::from_vec(weight, (fan_out, fan_in), &config.device)?;
            let bias = Tensor::from_vec(bias, fan_out, &config.device)?;
            layers.push(DenseLayer {
                weight: to_var(weight, config.dtype)?,
                bias: to_var(bias, config.dtype)?,
            });
        }

        Ok(Self { config, layers })
    }

    pub fn config(&self) -> &MlpConfig {
        &self.config
    }

    /// Trainable parameters in layer order (`layer{i}.weight`, `layer{i}.bias`).
    pub fn parameters(&self) -> Vec<(String, Var)> {
        self.layers
            .iter()
            .enumerate()
            .flat_map(|(idx, layer)| {
                [
                    (format!("layer{}.weight", idx), layer.weight.clone()),
                    (format!("layer{}.bias", idx), layer.bias.clone()),
                ]
            })
            .collect()
    }

    /// Total number of scalar parameters.
    pub fn num_parameters(&self) -> usize {
        self.layers
            .iter()
            .map(|layer| layer.weight.elem_count() + layer.bias.elem_count())
            .sum()
    }
}

impl Module for Mlp {
    /// Maps `(batch, input_dim)` features to `(batch, output_dim)` outputs.
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dims = xs.dims();
        if dims.len() != 2 || dims[1] != self.config.input_dim {
            return Err(Error::Msg(format!(
                "mlp expected input shaped [batch, {}] got {:?}",
                self.config.input_dim, dims
            )));
        }

        let mut hidden = xs.to_dtype(self.config.dtype)?;
        let last = self.layers.len() - 1;
        for (idx, layer) in self.layers.iter().enumerate() {
            hidden = hidden
                .matmul(&layer.weight.as_tensor().t()?)?
                .broadcast_add(layer.bias.as_tensor())?;
            if idx != last {
                hidden = hidden.relu()?;
            }
        }

        match self.config.head {
            OutputHead::Identity => Ok(hidden),
            OutputHead::LogSoftmax => candle_nn::ops::log_softmax(&hidden, D::Minus1),
        }
    }
}

fn to_var(tensor: Tensor, dtype: DType) -> Result<Var> {
    if tensor.dtype() == dtype {
        Var::from_tensor(&tensor)
    } else {
        Var::from_tensor(&tensor.to_dtype(dtype)?)
    }
}
