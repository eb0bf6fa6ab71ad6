//! # Task Sampling
//!
//! Per-task sampling weights from a configurable policy, and the schedule of
//! (source, target) task pairs for one validation interval.
//!
//! The default schedule is a fixed alternation of task positions 0 and 1; the
//! weights are still computed and logged. `SamplingSchedule::Weighted` draws
//! both sides of every pair from the normalized weights instead.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::MetaError;
use crate::MetaResult;

/// Policy that turns task sizes into sampling weights
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum WeightingMethod {
    Uniform,
    /// Number of training batches
    Proportional,
    ProportionalLogBatch,
    ProportionalLogExample,
    InverseExample,
    InverseBatch,
    InverseLogExample,
    InverseLogBatch,
    /// `n_examples ^ p`
    Power(f64),
    /// `exp(n_examples / t)`
    Softmax(f64),
}

impl FromStr for WeightingMethod {
    type Err = MetaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_param = |raw: &str| {
            raw.parse::<f64>().map_err(|_| {
                MetaError::Config(format!("Invalid weighting parameter in '{}'", s))
            })
        };
        match s {
            "uniform" => Ok(WeightingMethod::Uniform),
            "proportional" => Ok(WeightingMethod::Proportional),
            "proportional_log_batch" => Ok(WeightingMethod::ProportionalLogBatch),
            "proportional_log_example" => Ok(WeightingMethod::ProportionalLogExample),
            "inverse_example" => Ok(WeightingMethod::InverseExample),
            "inverse_batch" => Ok(WeightingMethod::InverseBatch),
            "inverse_log_example" => Ok(WeightingMethod::InverseLogExample),
            "inverse_log_batch" => Ok(WeightingMethod::InverseLogBatch),
            other => {
                if let Some(p) = other.strip_prefix("power_") {
                    Ok(WeightingMethod::Power(parse_param(p)?))
                } else if let Some(t) = other.strip_prefix("softmax_") {
                    let t = parse_param(t)?;
                    if t <= 0.0 {
                        return Err(MetaError::Config(format!(
                            "Softmax temperature must be positive, got {}",
                            t
                        )));
                    }
                    Ok(WeightingMethod::Softmax(t))
                } else {
                    Err(MetaError::Config(format!(
                        "Weighting method '{}' not found",
                        other
                    )))
                }
            }
        }
    }
}

impl fmt::Display for WeightingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeightingMethod::Uniform => f.write_str("uniform"),
            WeightingMethod::Proportional => f.write_str("proportional"),
            WeightingMethod::ProportionalLogBatch => f.write_str("proportional_log_batch"),
            WeightingMethod::ProportionalLogExample => f.write_str("proportional_log_example"),
            WeightingMethod::InverseExample => f.write_str("inverse_example"),
            WeightingMethod::InverseBatch => f.write_str("inverse_batch"),
            WeightingMethod::InverseLogExample => f.write_str("inverse_log_example"),
            WeightingMethod::InverseLogBatch => f.write_str("inverse_log_batch"),
            WeightingMethod::Power(p) => write!(f, "power_{}", p),
            WeightingMethod::Softmax(t) => write!(f, "softmax_{}", t),
        }
    }
}

impl TryFrom<String> for WeightingMethod {
    type Error = MetaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WeightingMethod> for String {
    fn from(value: WeightingMethod) -> Self {
        value.to_string()
    }
}

/// Size of one task as seen by the weighting policies
#[derive(Debug, Clone, Copy)]
pub struct TaskSize {
    pub n_train_examples: usize,
    pub n_train_batches: usize,
}

impl WeightingMethod {
    /// Unnormalized weight of a task
    pub fn weight(&self, size: TaskSize) -> f64 {
        let examples = size.n_train_examples as f64;
        let batches = size.n_train_batches as f64;
        match self {
            WeightingMethod::Uniform => 1.0,
            WeightingMethod::Proportional => batches,
            WeightingMethod::ProportionalLogBatch => batches.ln(),
            WeightingMethod::ProportionalLogExample => examples.ln(),
            WeightingMethod::InverseExample => 1.0 / examples,
            WeightingMethod::InverseBatch => 1.0 / batches,
            WeightingMethod::InverseLogExample => 1.0 / examples.ln(),
            WeightingMethod::InverseLogBatch => 1.0 / batches.ln(),
            WeightingMethod::Power(p) => examples.powf(*p),
            WeightingMethod::Softmax(t) => (examples / t).exp(),
        }
    }

    /// Weights for every task, in task order
    pub fn weights(&self, sizes: &[TaskSize]) -> Vec<f64> {
        sizes.iter().map(|&s| self.weight(s)).collect()
    }
}

/// Scale weights to sum to one. Fails when they cannot form a distribution.
pub fn normalize(weights: &[f64]) -> MetaResult<Vec<f64>> {
    let total: f64 = weights.iter().sum();
    if weights.is_empty()
        || !total.is_finite()
        || total <= 0.0
        || weights.iter().any(|w| !w.is_finite() || *w < 0.0)
    {
        return Err(MetaError::Config(format!(
            "Task weights {:?} do not form a distribution",
            weights
        )));
    }
    Ok(weights.iter().map(|w| w / total).collect())
}

// ═══════════════════════════════════════════════════════════════════════════
// PAIR SCHEDULE
// ═══════════════════════════════════════════════════════════════════════════

/// How (source, target) pairs are chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingSchedule {
    /// Task positions 0 and 1, every update
    FixedPair,
    /// Both sides drawn independently from the normalized weights
    Weighted,
}

impl FromStr for SamplingSchedule {
    type Err = MetaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed_pair" => Ok(SamplingSchedule::FixedPair),
            "weighted" => Ok(SamplingSchedule::Weighted),
            other => Err(MetaError::Config(format!(
                "Sampling schedule '{}' not found",
                other
            ))),
        }
    }
}

/// (source, target) task indices for the next `len` updates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairSchedule {
    pub sources: Vec<usize>,
    pub targets: Vec<usize>,
}

impl PairSchedule {
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Pair used at update counter `n_update`
    pub fn pair_at(&self, n_update: usize) -> (usize, usize) {
        let slot = n_update % self.len();
        (self.sources[slot], self.targets[slot])
    }
}

/// Generator for the schedule of validation interval `interval` of a run
/// seeded with `seed`. Interval 0 uses `seed` unchanged.
pub fn interval_rng(seed: u64, interval: usize) -> StdRng {
    StdRng::seed_from_u64(seed ^ (interval as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

/// Draw a pair schedule of `len` slots.
pub fn draw_schedule<R: Rng + ?Sized>(
    schedule: SamplingSchedule,
    weights: &[f64],
    len: usize,
    rng: &mut R,
) -> MetaResult<PairSchedule> {
    if weights.len() < 2 {
        return Err(MetaError::Config(format!(
            "Meta multi-task training needs at least two tasks, got {}",
            weights.len()
        )));
    }
    match schedule {
        SamplingSchedule::FixedPair => Ok(PairSchedule {
            sources: vec![0; len],
            targets: vec![1; len],
        }),
        SamplingSchedule::Weighted => {
            let dist = WeightedIndex::new(weights).map_err(|e| {
                MetaError::Config(format!("Invalid task weights {:?}: {}", weights, e))
            })?;
            let sources = (0..len).map(|_| dist.sample(rng)).collect();
            let targets = (0..len).map(|_| dist.sample(rng)).collect();
            Ok(PairSchedule { sources, targets })
        }
    }
}
