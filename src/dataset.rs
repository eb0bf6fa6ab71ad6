//! # Datasets and Batch Streams
//!
//! In-memory task datasets plus the two ways the trainer consumes them:
//!
//! - `BatchStream`: a restartable, infinite sequence of training batches.
//!   Each pass over the data is shuffled with a permutation derived from
//!   `(seed, pass)`, so any position in the stream can be reproduced.
//! - `EvalBatches`: a finite, unshuffled pass over (a prefix of) the
//!   validation data.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use metatrain::dataset::{BatchStream, Dataset};
//!
//! let data = Dataset::synthetic_regression(256, 8, 7, &device)?;
//! let mut stream = BatchStream::new(data, 32, true, 42)?;
//! let batch = stream.next_batch()?;
//! ```

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::error::MetaError;
use crate::MetaResult;

/// Examples of one task split: `inputs` is `[n, d]`, `targets` is `[n]`
/// (`u32` class ids or `f32` regression targets).
#[derive(Debug, Clone)]
pub struct Dataset {
    inputs: Tensor,
    targets: Tensor,
}

impl Dataset {
    pub fn new(inputs: Tensor, targets: Tensor) -> MetaResult<Self> {
        let n_inputs = inputs.dims().first().copied().unwrap_or(0);
        let n_targets = targets.dims().first().copied().unwrap_or(0);
        if n_inputs != n_targets {
            return Err(MetaError::ShapeMismatch {
                name: "dataset targets".to_string(),
                expected: vec![n_inputs],
                got: vec![n_targets],
            });
        }
        Ok(Self { inputs, targets })
    }

    /// Regression data from a hidden linear rule plus noise
    pub fn synthetic_regression(
        n: usize,
        dim: usize,
        seed: u64,
        device: &Device,
    ) -> MetaResult<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let rule: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let mut inputs = Vec::with_capacity(n * dim);
        let mut targets = Vec::with_capacity(n);
        for _ in 0..n {
            let x: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let y: f32 = x.iter().zip(&rule).map(|(a, b)| a * b).sum::<f32>()
                + rng.gen_range(-0.05..0.05);
            inputs.extend_from_slice(&x);
            targets.push(y);
        }
        Self::new(
            Tensor::from_vec(inputs, (n, dim), device)?,
            Tensor::from_vec(targets, n, device)?,
        )
    }

    /// Classification data: label is the arg-max of a hidden linear map
    pub fn synthetic_classification(
        n: usize,
        dim: usize,
        n_classes: usize,
        seed: u64,
        device: &Device,
    ) -> MetaResult<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let rule: Vec<Vec<f32>> = (0..n_classes)
            .map(|_| (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect())
            .collect();
        let mut inputs = Vec::with_capacity(n * dim);
        let mut targets = Vec::with_capacity(n);
        for _ in 0..n {
            let x: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let label = rule
                .iter()
                .map(|w| w.iter().zip(&x).map(|(a, b)| a * b).sum::<f32>())
                .enumerate()
                .fold((0usize, f32::NEG_INFINITY), |best, (i, s)| {
                    if s > best.1 {
                        (i, s)
                    } else {
                        best
                    }
                })
                .0;
            inputs.extend_from_slice(&x);
            targets.push(label as u32);
        }
        Self::new(
            Tensor::from_vec(inputs, (n, dim), device)?,
            Tensor::from_vec(targets, n, device)?,
        )
    }

    /// Number of examples
    pub fn len(&self) -> usize {
        self.inputs.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn input_dim(&self) -> usize {
        self.inputs.dims().get(1).copied().unwrap_or(1)
    }

    /// First `n` examples (all of them if `n >= len`)
    pub fn head(&self, n: usize) -> MetaResult<Self> {
        let n = n.min(self.len());
        Ok(Self {
            inputs: self.inputs.narrow(0, 0, n)?,
            targets: self.targets.narrow(0, 0, n)?,
        })
    }

    /// Gather a batch by example ids
    pub fn gather(&self, ids: &[usize]) -> MetaResult<Batch> {
        let idx: Vec<u32> = ids.iter().map(|&i| i as u32).collect();
        let idx = Tensor::from_vec(idx, ids.len(), self.inputs.device())?;
        Ok(Batch {
            inputs: self.inputs.index_select(&idx, 0)?,
            targets: self.targets.index_select(&idx, 0)?,
            example_ids: ids.to_vec(),
        })
    }

    /// Finite, unshuffled pass over at most `limit` examples
    pub fn eval_batches(&self, batch_size: usize, limit: Option<usize>) -> EvalBatches<'_> {
        let n = limit.map_or(self.len(), |l| l.min(self.len()));
        EvalBatches {
            dataset: self,
            batch_size: batch_size.max(1),
            end: n,
            position: 0,
        }
    }
}

/// A batch of examples
#[derive(Debug, Clone)]
pub struct Batch {
    /// Inputs `[b, d]`
    pub inputs: Tensor,
    /// Targets `[b]`
    pub targets: Tensor,
    /// Dataset positions of the examples, in batch order
    pub example_ids: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.example_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.example_ids.is_empty()
    }

    /// Targets as f32, whatever their stored dtype
    pub fn targets_f32(&self) -> MetaResult<Tensor> {
        Ok(self.targets.to_dtype(DType::F32)?)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TRAINING STREAM
// ═══════════════════════════════════════════════════════════════════════════

/// Infinite batch sequence over a finite dataset
#[derive(Debug, Clone)]
pub struct BatchStream {
    dataset: Dataset,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    pass: u64,
    offset: usize,
    order: Vec<usize>,
}

impl BatchStream {
    pub fn new(dataset: Dataset, batch_size: usize, shuffle: bool, seed: u64) -> MetaResult<Self> {
        if dataset.is_empty() {
            return Err(MetaError::Config(
                "Cannot stream batches from an empty dataset".to_string(),
            ));
        }
        if batch_size == 0 {
            return Err(MetaError::Config("batch_size must be positive".to_string()));
        }
        let mut stream = Self {
            dataset,
            batch_size,
            shuffle,
            seed,
            pass: 0,
            offset: 0,
            order: Vec::new(),
        };
        stream.start_pass(0);
        Ok(stream)
    }

    /// Batches in one full pass over the data
    pub fn batches_per_pass(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// `(pass, batch offset within the pass)` of the next batch
    pub fn position(&self) -> (u64, usize) {
        (self.pass, self.offset)
    }

    /// Example ids the next batch will contain
    pub fn peek_ids(&self) -> &[usize] {
        let start = self.offset * self.batch_size;
        let end = (start + self.batch_size).min(self.order.len());
        &self.order[start..end]
    }

    fn start_pass(&mut self, pass: u64) {
        self.pass = pass;
        self.offset = 0;
        self.order = (0..self.dataset.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(pass));
            self.order.shuffle(&mut rng);
        }
    }

    fn advance(&mut self) {
        self.offset += 1;
        if self.offset >= self.batches_per_pass() {
            self.start_pass(self.pass + 1);
        }
    }

    /// Next batch; wraps into a freshly shuffled pass at the end of the data.
    pub fn next_batch(&mut self) -> MetaResult<Batch> {
        let ids = self.peek_ids().to_vec();
        let batch = self.dataset.gather(&ids)?;
        self.advance();
        Ok(batch)
    }

    /// Discard `n` batches without materialising them.
    pub fn skip_batches(&mut self, n: usize) {
        for _ in 0..n {
            self.advance();
        }
    }

    /// Restart at the pass containing batch number `total_batches` and discard
    /// `total_batches mod batches_per_pass` batches of it. Returns the number
    /// discarded.
    pub fn fast_forward(&mut self, total_batches: usize) -> usize {
        let per_pass = self.batches_per_pass();
        self.start_pass((total_batches / per_pass) as u64);
        let remainder = total_batches % per_pass;
        self.skip_batches(remainder);
        remainder
    }
}

impl Iterator for BatchStream {
    type Item = MetaResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_batch())
    }
}

/// Finite validation iterator
pub struct EvalBatches<'a> {
    dataset: &'a Dataset,
    batch_size: usize,
    end: usize,
    position: usize,
}

impl EvalBatches<'_> {
    /// Number of batches in the pass
    pub fn num_batches(&self) -> usize {
        self.end.div_ceil(self.batch_size)
    }
}

impl Iterator for EvalBatches<'_> {
    type Item = MetaResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.end {
            return None;
        }
        let stop = (self.position + self.batch_size).min(self.end);
        let ids: Vec<usize> = (self.position..stop).collect();
        self.position = stop;
        Some(self.dataset.gather(&ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_dataset(n: usize) -> Dataset {
        Dataset::synthetic_regression(n, 3, 1, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_synthetic_datasets() {
        let reg = tiny_dataset(10);
        assert_eq!(reg.len(), 10);
        assert_eq!(reg.input_dim(), 3);

        let cls = Dataset::synthetic_classification(20, 4, 3, 2, &Device::Cpu).unwrap();
        let labels: Vec<u32> = cls.targets.to_vec1().unwrap();
        assert!(labels.iter().all(|&l| l < 3));
    }

    #[test]
    fn test_stream_wraps_and_reshuffles() {
        let mut stream = BatchStream::new(tiny_dataset(10), 4, true, 9).unwrap();
        assert_eq!(stream.batches_per_pass(), 3);

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.extend(stream.next_batch().unwrap().example_ids);
        }
        seen.sort();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert_eq!(stream.position(), (1, 0));

        // the stream never ends
        assert!(stream.next().is_some());
    }

    #[test]
    fn test_fast_forward_matches_consumed_stream() {
        let mut consumed = BatchStream::new(tiny_dataset(10), 3, true, 5).unwrap();
        for _ in 0..9 {
            consumed.next_batch().unwrap();
        }

        let mut resumed = BatchStream::new(tiny_dataset(10), 3, true, 5).unwrap();
        let skipped = resumed.fast_forward(9);

        assert_eq!(skipped, 9 % 4);
        assert_eq!(resumed.position(), consumed.position());
        assert_eq!(
            resumed.next_batch().unwrap().example_ids,
            consumed.next_batch().unwrap().example_ids
        );
    }

    #[test]
    fn test_eval_batches_respects_limit() {
        let data = tiny_dataset(10);
        let batches = data.eval_batches(4, Some(6));
        assert_eq!(batches.num_batches(), 2);
        let sizes: Vec<usize> = batches.map(|b| b.unwrap().len()).collect();
        assert_eq!(sizes, vec![4, 2]);

        let all = data.eval_batches(4, None);
        assert_eq!(all.count(), 3);
    }

    #[test]
    fn test_empty_dataset_rejected() {
        let data = tiny_dataset(4).head(0).unwrap();
        assert!(BatchStream::new(data, 2, false, 0).is_err());
    }
}
