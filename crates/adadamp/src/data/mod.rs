use candle_core::{Device, Tensor};
use log::debug;
use rand::{distributions::Distribution, rngs::StdRng, Rng, SeedableRng};
use rand_distr::Normal;

use crate::{
    config::{DatasetConfig, DatasetKind},
    TrainingError,
};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// In-memory examples: `inputs` is `[len, features]`, `targets` is `[len]`
/// (class ids as `u32` or real values as `f32`).
#[derive(Debug, Clone)]
pub struct TensorDataset {
    inputs: Tensor,
    targets: Tensor,
    len: usize,
}

impl TensorDataset {
    pub fn new(inputs: Tensor, targets: Tensor) -> Result<Self> {
        let len = match inputs.dims() {
            [len, _] => *len,
            dims => {
                return Err(TrainingError::initialization(format!(
                    "dataset inputs must be [examples, features], got {:?}",
                    dims
                )))
            }
        };
        if targets.dims().first() != Some(&len) {
            return Err(TrainingError::initialization(format!(
                "dataset has {} inputs but targets of shape {:?}",
                len,
                targets.dims()
            )));
        }
        if len == 0 {
            return Err(TrainingError::initialization("dataset is empty"));
        }
        Ok(Self {
            inputs,
            targets,
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn features(&self) -> usize {
        self.inputs.dims()[1]
    }

    pub fn device(&self) -> &Device {
        self.inputs.device()
    }

    pub fn inputs(&self) -> &Tensor {
        &self.inputs
    }

    pub fn targets(&self) -> &Tensor {
        &self.targets
    }

    /// Rows at `indices`, in order. Indices may repeat.
    pub fn gather(&self, indices: &[u32]) -> Result<(Tensor, Tensor)> {
        if let Some(&bad) = indices.iter().find(|&&idx| idx as usize >= self.len) {
            return Err(TrainingError::runtime(format!(
                "index {} out of range for dataset of {} examples",
                bad, self.len
            )));
        }
        let ids = Tensor::from_slice(indices, indices.len(), self.inputs.device())?;
        Ok((
            self.inputs.index_select(&ids, 0)?,
            self.targets.index_select(&ids, 0)?,
        ))
    }

    /// Contiguous batches in order; the last one may be short.
    pub fn sequential_batches(&self, batch_size: usize) -> SequentialBatches<'_> {
        SequentialBatches {
            dataset: self,
            batch_size: batch_size.max(1),
            offset: 0,
        }
    }

    /// The first `n` examples (all of them if `n` exceeds the length).
    pub fn head(&self, n: usize) -> Result<Self> {
        let n = n.clamp(1, self.len);
        Self::new(self.inputs.narrow(0, 0, n)?, self.targets.narrow(0, 0, n)?)
    }
}

pub struct SequentialBatches<'a> {
    dataset: &'a TensorDataset,
    batch_size: usize,
    offset: usize,
}

impl Iterator for SequentialBatches<'_> {
    type Item = Result<(Tensor, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.dataset.len {
            return None;
        }
        let size = self.batch_size.min(self.dataset.len - self.offset);
        let start = self.offset;
        self.offset += size;
        Some(
            self.dataset
                .inputs
                .narrow(0, start, size)
                .and_then(|inputs| Ok((inputs, self.dataset.targets.narrow(0, start, size)?)))
                .map_err(TrainingError::from),
        )
    }
}

/// Endless stream of uniformly drawn indices, with replacement.
///
/// Draws are grouped in passes of `pass_len` examples. A batch that does not
/// fit in what is left of the current pass starts a new one, so no pass ever
/// hands out a short batch.
#[derive(Debug)]
pub struct RandomBatchSampler {
    rng: StdRng,
    pass_len: usize,
    used: usize,
    passes: usize,
}

impl RandomBatchSampler {
    pub fn new(pass_len: usize, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            pass_len: pass_len.max(1),
            used: 0,
            passes: 0,
        }
    }

    pub fn sample(&mut self, batch_size: usize) -> Vec<u32> {
        let batch_size = batch_size.max(1);
        if self.used > 0 && self.used + batch_size > self.pass_len {
            self.passes += 1;
            debug!(
                "sampler pass {} exhausted after {} examples; starting a new pass",
                self.passes, self.used
            );
            self.used = 0;
        }
        self.used += batch_size;

        let upper = self.pass_len as u32;
        (0..batch_size)
            .map(|_| self.rng.gen_range(0..upper))
            .collect()
    }

    /// Completed passes so far.
    pub fn passes(&self) -> usize {
        self.passes
    }
}

/// Train and test splits drawn from the same generating distribution.
#[derive(Debug, Clone)]
pub struct SyntheticData {
    pub train: TensorDataset,
    pub test: TensorDataset,
}

pub fn synthetic(config: &DatasetConfig, device: &Device) -> Result<SyntheticData> {
    match config.kind {
        DatasetKind::Classification => gaussian_blobs(config, device),
        DatasetKind::Regression => noisy_linear(config, device),
    }
}

/// One Gaussian centre per class; labels cycle through the classes.
pub fn gaussian_blobs(config: &DatasetConfig, device: &Device) -> Result<SyntheticData> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let spread = normal(0.0, 3.0)?;
    let noise = normal(0.0, config.noise)?;

    let centres: Vec<Vec<f32>> = (0..config.classes)
        .map(|_| (0..config.features).map(|_| spread.sample(&mut rng)).collect())
        .collect();

    let mut draw = |n: usize| -> Result<TensorDataset> {
        let mut inputs = Vec::with_capacity(n * config.features);
        let mut labels = Vec::with_capacity(n);
        for i in 0..n {
            let class = i % config.classes;
            labels.push(class as u32);
            inputs.extend(
                centres[class]
                    .iter()
                    .map(|centre| centre + noise.sample(&mut rng)),
            );
        }
        TensorDataset::new(
            Tensor::from_vec(inputs, (n, config.features), device)?,
            Tensor::from_vec(labels, n, device)?,
        )
    };

    let train = draw(config.train_examples)?;
    let test = draw(config.test_examples)?;
    Ok(SyntheticData { train, test })
}

/// `y = x . w + noise` with standard normal inputs and weights.
pub fn noisy_linear(config: &DatasetConfig, device: &Device) -> Result<SyntheticData> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let standard = normal(0.0, 1.0)?;
    let noise = normal(0.0, config.noise)?;
    let weights: Vec<f32> = (0..config.features)
        .map(|_| standard.sample(&mut rng))
        .collect();

    let mut draw = |n: usize| -> Result<TensorDataset> {
        let mut inputs = Vec::with_capacity(n * config.features);
        let mut targets = Vec::with_capacity(n);
        for _ in 0..n {
            let row: Vec<f32> = (0..config.features)
                .map(|_| standard.sample(&mut rng))
                .collect();
            let dot: f32 = row.iter().zip(&weights).map(|(x, w)| x * w).sum();
            targets.push(dot + noise.sample(&mut rng));
            inputs.extend(row);
        }
        TensorDataset::new(
            Tensor::from_vec(inputs, (n, config.features), device)?,
            Tensor::from_vec(targets, n, device)?,
        )
    };

    let train = draw(config.train_examples)?;
    let test = draw(config.test_examples)?;
    Ok(SyntheticData { train, test })
}

fn normal(mean: f32, std_dev: f64) -> Result<Normal<f32>> {
    Normal::new(mean, std_dev as f32).map_err(|err| {
        TrainingError::initialization(format!("invalid normal distribution: {}", err))
    })
}

/// Output width the model needs for a dataset of this kind.
pub fn output_dim(config: &DatasetConfig) -> usize {
    match config.kind {
        DatasetKind::Classification => config.classes,
        DatasetKind::Regression => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy(len: usize) -> TensorDataset {
        let inputs: Vec<f32> = (0..len * 2).map(|v| v as f32).collect();
        let targets: Vec<u32> = (0..len as u32).collect();
        TensorDataset::new(
            Tensor::from_vec(inputs, (len, 2), &Device::Cpu).unwrap(),
            Tensor::from_vec(targets, len, &Device::Cpu).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn gather_preserves_order_and_repeats() {
        let dataset = toy(5);
        let (inputs, targets) = dataset.gather(&[4, 1, 4]).unwrap();
        assert_eq!(targets.to_vec1::<u32>().unwrap(), vec![4, 1, 4]);
        assert_eq!(
            inputs.to_vec2::<f32>().unwrap(),
            vec![vec![8.0, 9.0], vec![2.0, 3.0], vec![8.0, 9.0]]
        );
    }

    #[test]
    fn gather_rejects_out_of_range_index() {
        assert!(toy(3).gather(&[3]).is_err());
    }

    #[test]
    fn sequential_batches_cover_dataset_once() {
        let dataset = toy(7);
        let sizes: Vec<usize> = dataset
            .sequential_batches(3)
            .map(|batch| batch.unwrap().1.dims()[0])
            .collect();
        assert_eq!(sizes, vec![3, 3, 1]);
    }

    #[test]
    fn head_takes_prefix() {
        let head = toy(10).head(4).unwrap();
        assert_eq!(head.len(), 4);
        assert_eq!(head.targets().to_vec1::<u32>().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn sampler_restarts_when_pass_cannot_fill_batch() {
        let mut sampler = RandomBatchSampler::new(10, 0);
        assert_eq!(sampler.sample(4).len(), 4);
        assert_eq!(sampler.sample(4).len(), 4);
        assert_eq!(sampler.passes(), 0);
        // Only 2 left in this pass.
        assert_eq!(sampler.sample(4).len(), 4);
        assert_eq!(sampler.passes(), 1);
    }

    #[test]
    fn sampler_stays_in_range_and_is_seeded() {
        let mut a = RandomBatchSampler::new(6, 3);
        let mut b = RandomBatchSampler::new(6, 3);
        let first = a.sample(50);
        assert!(first.iter().all(|&idx| idx < 6));
        assert_eq!(first, b.sample(50));
    }

    #[test]
    fn oversized_batches_are_still_served() {
        let mut sampler = RandomBatchSampler::new(4, 1);
        assert_eq!(sampler.sample(9).len(), 9);
        assert_eq!(sampler.sample(9).len(), 9);
    }

    #[test]
    fn blobs_have_requested_shapes() {
        let config = DatasetConfig {
            train_examples: 30,
            test_examples: 12,
            features: 4,
            classes: 3,
            ..DatasetConfig::default()
        };
        let data = synthetic(&config, &Device::Cpu).unwrap();
        assert_eq!(data.train.len(), 30);
        assert_eq!(data.test.len(), 12);
        assert_eq!(data.train.features(), 4);
        assert_eq!(data.train.targets().dtype(), candle_core::DType::U32);
        let labels = data.train.targets().to_vec1::<u32>().unwrap();
        assert!(labels.iter().all(|&label| label < 3));
    }

    #[test]
    fn regression_targets_are_real_valued() {
        let config = DatasetConfig {
            kind: DatasetKind::Regression,
            train_examples: 20,
            test_examples: 5,
            features: 3,
            ..DatasetConfig::default()
        };
        let data = synthetic(&config, &Device::Cpu).unwrap();
        assert_eq!(data.test.targets().dtype(), candle_core::DType::F32);
        assert_eq!(output_dim(&config), 1);
    }

    #[test]
    fn same_seed_gives_same_data() {
        let config = DatasetConfig::default();
        let a = synthetic(&config, &Device::Cpu).unwrap();
        let b = synthetic(&config, &Device::Cpu).unwrap();
        assert_eq!(
            a.train.inputs().to_vec2::<f32>().unwrap(),
            b.train.inputs().to_vec2::<f32>().unwrap()
        );
    }
}
