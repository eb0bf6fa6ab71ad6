//! # Tasks
//!
//! A task bundles its train/validation data with what the trainer needs to
//! judge it: a validation metric name, whether that metric should decrease,
//! and a running metric accumulator fed from model outputs.

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::dataset::{Batch, Dataset};
use crate::error::MetaError;
use crate::MetaResult;

/// Output structure of a task head
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    /// One scalar prediction per example, trained with MSE
    Regression,
    /// One logit per class, trained with cross-entropy
    Classification { n_classes: usize },
}

impl TaskKind {
    /// Width of the task head
    pub fn output_dim(&self) -> usize {
        match self {
            TaskKind::Regression => 1,
            TaskKind::Classification { n_classes } => *n_classes,
        }
    }
}

/// Validation metric reported by a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Accuracy,
    Mse,
    Mae,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Accuracy => "accuracy",
            MetricKind::Mse => "mse",
            MetricKind::Mae => "mae",
        }
    }

    /// Lower is better
    pub fn decreases(&self) -> bool {
        matches!(self, MetricKind::Mse | MetricKind::Mae)
    }
}

impl FromStr for MetricKind {
    type Err = MetaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accuracy" => Ok(MetricKind::Accuracy),
            "mse" => Ok(MetricKind::Mse),
            "mae" => Ok(MetricKind::Mae),
            other => Err(MetaError::Config(format!("Unknown metric '{}'", other))),
        }
    }
}

/// Running sums behind a task metric
#[derive(Debug, Clone, Default)]
struct Scorer {
    total: f64,
    count: usize,
}

impl Scorer {
    fn value(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }
}

/// A named task with its data and metric
#[derive(Debug, Clone)]
pub struct Task {
    name: String,
    kind: TaskKind,
    metric: MetricKind,
    train_data: Dataset,
    val_data: Dataset,
    scorer: Scorer,
}

impl Task {
    pub fn new(
        name: impl Into<String>,
        kind: TaskKind,
        metric: MetricKind,
        train_data: Dataset,
        val_data: Dataset,
    ) -> MetaResult<Self> {
        let name = name.into();
        if metric == MetricKind::Accuracy && kind == TaskKind::Regression {
            return Err(MetaError::Config(format!(
                "Task '{}': accuracy needs a classification head",
                name
            )));
        }
        Ok(Self {
            name,
            kind,
            metric,
            train_data,
            val_data,
            scorer: Scorer::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn metric(&self) -> MetricKind {
        self.metric
    }

    pub fn train_data(&self) -> &Dataset {
        &self.train_data
    }

    pub fn val_data(&self) -> &Dataset {
        &self.val_data
    }

    pub fn n_train_examples(&self) -> usize {
        self.train_data.len()
    }

    pub fn n_val_examples(&self) -> usize {
        self.val_data.len()
    }

    /// Tracked validation metric name, `<task>_<metric>`
    pub fn val_metric(&self) -> String {
        format!("{}_{}", self.name, self.metric.as_str())
    }

    pub fn val_metric_decreases(&self) -> bool {
        self.metric.decreases()
    }

    /// Fold one batch of predictions into the running metric.
    ///
    /// `logits` is `[b, output_dim]`.
    pub fn update_metrics(&mut self, logits: &Tensor, batch: &Batch) -> MetaResult<()> {
        let logits = logits.detach();
        match self.metric {
            MetricKind::Accuracy => {
                let predicted: Vec<u32> = logits.argmax(1)?.to_vec1()?;
                let labels: Vec<u32> = batch.targets.to_dtype(DType::U32)?.to_vec1()?;
                let correct = predicted
                    .iter()
                    .zip(&labels)
                    .filter(|(p, l)| p == l)
                    .count();
                self.scorer.total += correct as f64;
                self.scorer.count += labels.len();
            }
            MetricKind::Mse | MetricKind::Mae => {
                let predictions = logits.flatten_all()?.to_dtype(DType::F64)?;
                let targets = batch.targets.to_dtype(DType::F64)?;
                let diff = (predictions - targets)?;
                let err = if self.metric == MetricKind::Mse {
                    diff.sqr()?
                } else {
                    diff.abs()?
                };
                self.scorer.total += err.sum_all()?.to_scalar::<f64>()?;
                self.scorer.count += batch.len();
            }
        }
        Ok(())
    }

    /// Current metric values keyed by metric name (without the task prefix).
    pub fn get_metrics(&mut self, reset: bool) -> BTreeMap<String, f64> {
        let mut metrics = BTreeMap::new();
        metrics.insert(self.metric.as_str().to_string(), self.scorer.value());
        if reset {
            self.scorer = Scorer::default();
        }
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn regression_task() -> Task {
        let data = Dataset::synthetic_regression(8, 2, 3, &Device::Cpu).unwrap();
        Task::new("sts", TaskKind::Regression, MetricKind::Mse, data.clone(), data).unwrap()
    }

    #[test]
    fn test_metric_names_and_direction() {
        let task = regression_task();
        assert_eq!(task.val_metric(), "sts_mse");
        assert!(task.val_metric_decreases());
        assert!(!MetricKind::Accuracy.decreases());
        assert!("f1".parse::<MetricKind>().is_err());
    }

    #[test]
    fn test_accuracy_accumulates_and_resets() {
        let device = Device::Cpu;
        let inputs = Tensor::zeros((3, 2), DType::F32, &device).unwrap();
        let targets = Tensor::new(&[1u32, 0, 1], &device).unwrap();
        let data = Dataset::new(inputs, targets).unwrap();
        let mut task = Task::new(
            "nli",
            TaskKind::Classification { n_classes: 2 },
            MetricKind::Accuracy,
            data.clone(),
            data.clone(),
        )
        .unwrap();

        let batch = data.gather(&[0, 1, 2]).unwrap();
        let logits = Tensor::new(&[[0f32, 1.0], [1.0, 0.0], [1.0, 0.0]], &device).unwrap();
        task.update_metrics(&logits, &batch).unwrap();

        let metrics = task.get_metrics(true);
        assert!((metrics["accuracy"] - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(task.get_metrics(false)["accuracy"], 0.0);
    }

    #[test]
    fn test_mse_metric() {
        let mut task = regression_task();
        let batch = task.val_data().gather(&[0, 1]).unwrap();
        let targets: Vec<f32> = batch.targets.to_vec1().unwrap();
        let shifted: Vec<f32> = targets.iter().map(|t| t + 2.0).collect();
        let logits = Tensor::from_vec(shifted, (2, 1), &Device::Cpu).unwrap();
        task.update_metrics(&logits, &batch).unwrap();
        assert!((task.get_metrics(false)["mse"] - 4.0).abs() < 1e-5);
    }

    #[test]
    fn test_accuracy_on_regression_rejected() {
        let data = Dataset::synthetic_regression(4, 2, 3, &Device::Cpu).unwrap();
        assert!(Task::new("x", TaskKind::Regression, MetricKind::Accuracy, data.clone(), data).is_err());
    }
}
