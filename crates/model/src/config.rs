use candle_core::{DType, Device, Error, Result};

/// Output transformation applied after the final affine layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputHead {
    /// Raw scores, used for regression targets and logit-based losses.
    Identity,
    /// Log-probabilities over the last dimension, paired with an NLL loss.
    LogSoftmax,
}

/// Shape and initialisation settings for a multi-layer perceptron.
#[derive(Debug, Clone)]
pub struct MlpConfig {
    pub input_dim: usize,
    pub hidden_dims: Vec<usize>,
    pub output_dim: usize,
    pub head: OutputHead,
    pub seed: u64,
    pub dtype: DType,
    pub device: Device,
}

impl MlpConfig {
    pub fn new(input_dim: usize, hidden_dims: Vec<usize>, output_dim: usize) -> Self {
        Self {
            input_dim,
            hidden_dims,
            output_dim,
            head: OutputHead::Identity,
            seed: 0,
            dtype: DType::F32,
            device: Device::Cpu,
        }
    }

    pub fn with_head(mut self, head: OutputHead) -> Self {
        self.head = head;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_dim == 0 {
            return Err(Error::Msg("input_dim must be greater than zero".into()));
        }
        if self.output_dim == 0 {
            return Err(Error::Msg("output_dim must be greater than zero".into()));
        }
        if let Some(idx) = self.hidden_dims.iter().position(|&dim| dim == 0) {
            return Err(Error::Msg(format!(
                "hidden_dims[{}] must be greater than zero",
                idx
            )));
        }
        if !self.dtype.is_float() {
            return Err(Error::Msg(format!(
                "parameters require a floating dtype (got {:?})",
                self.dtype
            )));
        }
        if self.head == OutputHead::LogSoftmax && self.output_dim < 2 {
            return Err(Error::Msg(
                "log-softmax head needs at least two output classes".into(),
            ));
        }
        Ok(())
    }

    /// Layer widths from input to output, inclusive.
    pub fn widths(&self) -> Vec<usize> {
        let mut widths = Vec::with_capacity(self.hidden_dims.len() + 2);
        widths.push(self.input_dim);
        widths.extend(self.hidden_dims.iter().copied());
        widths.push(self.output_dim);
        widths
    }
}
