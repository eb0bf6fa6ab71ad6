//! # Meta-Trainable Models
//!
//! The trainer needs two things from a model: its named, ordered trainable
//! parameters, and a forward pass that can run with *any* parameter values of
//! the right shapes. The second requirement is what lets the meta-gradient
//! engine evaluate a shadow copy without touching the live weights.
//!
//! `MultiTaskMlp` is the reference implementation: an input embedding (the
//! "phrase layer", excluded from meta-learning), a stack of shared tanh
//! layers, and one head per task.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use metatrain::model::{MetaModel, MlpConfig, MultiTaskMlp};
//!
//! let model = MultiTaskMlp::new(&MlpConfig::default(), &tasks, &Device::Cpu)?;
//! let out = model.forward(&tasks[0], &batch)?;
//! println!("loss = {}", out.loss.to_scalar::<f32>()?);
//! ```

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::dataset::Batch;
use crate::error::MetaError;
use crate::params::ParamVector;
use crate::task::{Task, TaskKind};
use crate::MetaResult;

/// Result of a forward pass on one batch
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// Scalar loss, still attached to the graph
    pub loss: Tensor,
    /// Examples in the batch
    pub n_examples: usize,
    /// Head outputs `[b, output_dim]`
    pub logits: Tensor,
}

impl ForwardOutput {
    pub fn loss_value(&self) -> MetaResult<f64> {
        Ok(self.loss.to_dtype(DType::F64)?.to_scalar::<f64>()?)
    }
}

/// Models the meta-trainer can drive
pub trait MetaModel {
    /// Trainable parameters in a fixed order
    fn parameters(&self) -> &ParamVector;

    /// Forward pass with explicit parameter values, ordered like `parameters()`.
    fn forward_with(
        &self,
        params: &[Tensor],
        task: &Task,
        batch: &Batch,
    ) -> MetaResult<ForwardOutput>;

    /// Forward pass with the live parameters.
    fn forward(&self, task: &Task, batch: &Batch) -> MetaResult<ForwardOutput> {
        self.forward_with(&self.parameters().snapshot(), task, batch)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// LOSSES
// ═══════════════════════════════════════════════════════════════════════════

/// Mean squared error between `[b, 1]` predictions and `[b]` targets
pub fn mse_loss(predictions: &Tensor, targets: &Tensor) -> MetaResult<Tensor> {
    let predictions = predictions.flatten_all()?;
    let targets = targets.to_dtype(predictions.dtype())?;
    Ok((predictions - targets)?.sqr()?.mean_all()?)
}

/// Cross-entropy from `[b, c]` logits and `[b]` class ids.
///
/// Built from elementwise primitives and a constant one-hot mask so the loss
/// stays twice differentiable.
pub fn cross_entropy_loss(logits: &Tensor, labels: &Tensor) -> MetaResult<Tensor> {
    let (batch_size, n_classes) = logits.dims2()?;
    let labels: Vec<u32> = labels.to_dtype(DType::U32)?.to_vec1()?;
    let mut one_hot = vec![0f32; batch_size * n_classes];
    for (row, &label) in labels.iter().enumerate() {
        let label = label as usize;
        if label >= n_classes {
            return Err(MetaError::ShapeMismatch {
                name: "class label".to_string(),
                expected: vec![n_classes],
                got: vec![label],
            });
        }
        one_hot[row * n_classes + label] = 1.0;
    }
    let one_hot = Tensor::from_vec(one_hot, (batch_size, n_classes), logits.device())?
        .to_dtype(logits.dtype())?;

    let max = logits.max_keepdim(1)?.detach();
    let shifted = logits.broadcast_sub(&max)?;
    let log_norm = shifted.exp()?.sum_keepdim(1)?.log()?;
    let log_probs = shifted.broadcast_sub(&log_norm)?;
    let nll = (log_probs * one_hot)?.sum_all()?.neg()?;
    Ok(nll.affine(1.0 / batch_size as f64, 0.0)?)
}

fn linear(x: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> MetaResult<Tensor> {
    let y = x.matmul(&weight.t()?)?;
    Ok(match bias {
        Some(b) => y.broadcast_add(b)?,
        None => y,
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// REFERENCE MODEL
// ═══════════════════════════════════════════════════════════════════════════

/// Shape of the reference model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlpConfig {
    pub input_dim: usize,
    pub hidden_dim: usize,
    /// Shared hidden layers after the embedding
    pub n_layers: usize,
}

impl Default for MlpConfig {
    fn default() -> Self {
        Self {
            input_dim: 8,
            hidden_dim: 16,
            n_layers: 2,
        }
    }
}

#[derive(Debug, Clone)]
struct Head {
    weight: usize,
    bias: usize,
    kind: TaskKind,
}

/// Multi-task MLP with a phrase-layer embedding and per-task heads
#[derive(Debug)]
pub struct MultiTaskMlp {
    config: MlpConfig,
    params: ParamVector,
    embed: usize,
    layers: Vec<(usize, usize)>,
    heads: HashMap<String, Head>,
}

impl MultiTaskMlp {
    pub fn new(config: &MlpConfig, tasks: &[Task], device: &Device) -> MetaResult<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let encoder = vb.pp("sent_encoder");
        candle_nn::linear_no_bias(
            config.input_dim,
            config.hidden_dim,
            encoder.pp("_phrase_layer").pp("embed"),
        )?;
        for i in 0..config.n_layers {
            candle_nn::linear(
                config.hidden_dim,
                config.hidden_dim,
                encoder.pp(format!("layer{}", i)),
            )?;
        }
        for task in tasks {
            candle_nn::linear(
                config.hidden_dim,
                task.kind().output_dim(),
                vb.pp("heads").pp(task.name()),
            )?;
        }

        let params = ParamVector::from_varmap(&varmap);
        let lookup = |name: &str| {
            params.index_of(name).ok_or_else(|| {
                MetaError::Config(format!("Model parameter '{}' was not created", name))
            })
        };

        let embed = lookup("sent_encoder._phrase_layer.embed.weight")?;
        let layers = (0..config.n_layers)
            .map(|i| {
                Ok((
                    lookup(&format!("sent_encoder.layer{}.weight", i))?,
                    lookup(&format!("sent_encoder.layer{}.bias", i))?,
                ))
            })
            .collect::<MetaResult<Vec<_>>>()?;
        let mut heads = HashMap::new();
        for task in tasks {
            heads.insert(
                task.name().to_string(),
                Head {
                    weight: lookup(&format!("heads.{}.weight", task.name()))?,
                    bias: lookup(&format!("heads.{}.bias", task.name()))?,
                    kind: task.kind(),
                },
            );
        }

        log::debug!(
            "MultiTaskMlp: {} parameters, {} heads",
            params.len(),
            heads.len()
        );

        Ok(Self {
            config: config.clone(),
            params,
            embed,
            layers,
            heads,
        })
    }

    pub fn config(&self) -> &MlpConfig {
        &self.config
    }
}

impl MetaModel for MultiTaskMlp {
    fn parameters(&self) -> &ParamVector {
        &self.params
    }

    fn forward_with(
        &self,
        params: &[Tensor],
        task: &Task,
        batch: &Batch,
    ) -> MetaResult<ForwardOutput> {
        if params.len() != self.params.len() {
            return Err(MetaError::ShapeMismatch {
                name: "parameter vector".to_string(),
                expected: vec![self.params.len()],
                got: vec![params.len()],
            });
        }
        let head = self
            .heads
            .get(task.name())
            .ok_or_else(|| MetaError::UnknownTask(task.name().to_string()))?;

        let mut hidden = linear(&batch.inputs, &params[self.embed], None)?;
        for &(w, b) in &self.layers {
            hidden = linear(&hidden, &params[w], Some(&params[b]))?.tanh()?;
        }
        let logits = linear(&hidden, &params[head.weight], Some(&params[head.bias]))?;

        let loss = match head.kind {
            TaskKind::Regression => mse_loss(&logits, &batch.targets)?,
            TaskKind::Classification { .. } => cross_entropy_loss(&logits, &batch.targets)?,
        };

        Ok(ForwardOutput {
            loss,
            n_examples: batch.len(),
            logits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Dataset;
    use crate::task::MetricKind;

    fn tasks() -> Vec<Task> {
        let device = Device::Cpu;
        let reg = Dataset::synthetic_regression(16, 4, 1, &device).unwrap();
        let cls = Dataset::synthetic_classification(16, 4, 3, 2, &device).unwrap();
        vec![
            Task::new("sts", TaskKind::Regression, MetricKind::Mse, reg.clone(), reg).unwrap(),
            Task::new(
                "nli",
                TaskKind::Classification { n_classes: 3 },
                MetricKind::Accuracy,
                cls.clone(),
                cls,
            )
            .unwrap(),
        ]
    }

    fn config() -> MlpConfig {
        MlpConfig {
            input_dim: 4,
            hidden_dim: 6,
            n_layers: 1,
        }
    }

    #[test]
    fn test_parameter_layout() {
        let tasks = tasks();
        let model = MultiTaskMlp::new(&config(), &tasks, &Device::Cpu).unwrap();
        // embed + layer0 (w, b) + two heads (w, b)
        assert_eq!(model.parameters().len(), 7);
        assert!(model
            .parameters()
            .index_of("sent_encoder._phrase_layer.embed.weight")
            .is_some());
    }

    #[test]
    fn test_forward_both_heads() {
        let tasks = tasks();
        let model = MultiTaskMlp::new(&config(), &tasks, &Device::Cpu).unwrap();
        for task in &tasks {
            let batch = task.train_data().gather(&[0, 1, 2, 3]).unwrap();
            let out = model.forward(task, &batch).unwrap();
            assert_eq!(out.n_examples, 4);
            assert_eq!(out.logits.dims()[1], task.kind().output_dim());
            assert!(out.loss_value().unwrap().is_finite());
        }
    }

    #[test]
    fn test_cross_entropy_uniform_logits() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((2, 4), DType::F32, &device).unwrap();
        let labels = Tensor::new(&[0u32, 3], &device).unwrap();
        let loss: f32 = cross_entropy_loss(&logits, &labels)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!((loss - 4f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_unknown_task_head() {
        let tasks = tasks();
        let model = MultiTaskMlp::new(&config(), &tasks[..1], &Device::Cpu).unwrap();
        let batch = tasks[1].train_data().gather(&[0]).unwrap();
        assert!(matches!(
            model.forward(&tasks[1], &batch),
            Err(MetaError::UnknownTask(_))
        ));
    }
}
