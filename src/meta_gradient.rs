//! # Meta-Gradient Engine
//!
//! Measures how task 2's loss responds to the *original* shared parameters
//! after one simulated SGD step toward task 1:
//!
//! ```text
//! θ'   = θ - lr · ∇L1(θ)
//! meta = ∂L2(θ')/∂θ = (I - lr · ∇²L1(θ)) · ∇L2(θ')
//! ```
//!
//! `θ'` is loaded into a shadow parameter vector and task 2 runs there, so the
//! live parameters and gradient buffers never change. The second factor is
//! obtained with one extra backward pass through the simulated step, using
//! the surrogate `Σ_i <θ'_i, stopgrad(∇L2(θ')_i)>`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use metatrain::meta_gradient::MetaGradientEngine;
//!
//! let engine = MetaGradientEngine::new(model.parameters())?;
//! let result = engine.compute(&model, &shared, (&src, &src_batch), (&trg, &trg_batch), 1e-3)?;
//! ```

use candle_core::Tensor;

use crate::dataset::Batch;
use crate::error::MetaError;
use crate::model::{ForwardOutput, MetaModel};
use crate::params::{replace_subset, ParamVector, SharedParams};
use crate::simulate::{enable_higher_order, simulate_sgd};
use crate::task::Task;
use crate::MetaResult;

/// Output of one meta-gradient computation, indexed by shared position
#[derive(Debug)]
pub struct MetaGradients {
    /// Gradient of task 2's post-step loss w.r.t. the original parameters
    pub meta_grads: Vec<Option<Tensor>>,
    /// First-order gradient of the simulated step on task 1 (detached)
    pub sim_grads: Vec<Option<Tensor>>,
    /// Task 1 output at the original parameters
    pub sim_output: ForwardOutput,
    /// Task 2 output on the shadow parameters
    pub output: ForwardOutput,
}

/// Owns the shadow parameter vector used to evaluate simulated steps
#[derive(Debug)]
pub struct MetaGradientEngine {
    shadow: ParamVector,
}

impl MetaGradientEngine {
    /// Build a shadow vector structurally identical to `params`.
    pub fn new(params: &ParamVector) -> MetaResult<Self> {
        enable_higher_order()?;
        Ok(Self {
            shadow: params.mirror()?,
        })
    }

    pub fn shadow(&self) -> &ParamVector {
        &self.shadow
    }

    /// Meta-gradient of `task2` through a simulated step on `task1`.
    pub fn compute<M: MetaModel + ?Sized>(
        &self,
        model: &M,
        shared: &SharedParams,
        (task1, batch1): (&Task, &Batch),
        (task2, batch2): (&Task, &Batch),
        sim_lr: f64,
    ) -> MetaResult<MetaGradients> {
        let params = model.parameters();
        if params.len() != self.shadow.len() {
            return Err(MetaError::ShapeMismatch {
                name: "shadow parameters".to_string(),
                expected: vec![params.len()],
                got: vec![self.shadow.len()],
            });
        }

        let step = simulate_sgd(model, shared, task1, batch1, sim_lr)?;

        let full = replace_subset(&params.snapshot(), shared.idxs(), &step.cand_params);
        self.shadow.load_from_vector(&full)?;

        let output = model.forward_with(&self.shadow.snapshot(), task2, batch2)?;
        let shadow_grads = output.loss.backward()?;

        let mut surrogate: Option<Tensor> = None;
        for (pos, &idx) in shared.idxs().iter().enumerate() {
            if let Some(g2) = shadow_grads.get(self.shadow.var(idx).as_tensor()) {
                let term = (&step.cand_params[pos] * g2.detach())?.sum_all()?;
                surrogate = Some(match surrogate {
                    Some(acc) => (acc + term)?,
                    None => term,
                });
            }
        }
        let surrogate = surrogate.ok_or_else(|| MetaError::DisconnectedGraph {
            task: task2.name().to_string(),
        })?;

        let meta_store = surrogate.backward()?;
        let meta_grads = shared
            .tensors(params)
            .iter()
            .map(|p| meta_store.get(p).map(Tensor::detach))
            .collect();
        let sim_grads = step
            .grads
            .iter()
            .map(|g| g.as_ref().map(Tensor::detach))
            .collect();

        Ok(MetaGradients {
            meta_grads,
            sim_grads,
            sim_output: step.output,
            output,
        })
    }
}
