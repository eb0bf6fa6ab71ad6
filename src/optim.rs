//! # Optimizers and Learning-Rate Schedulers
//!
//! Stateful optimizers over the live `Var`s that consume a `GradBuffer`,
//! plus the two schedulers the trainer supports. Everything here serializes
//! to plain JSON-friendly state so a checkpoint can restore it exactly.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use metatrain::optim::{LrScheduler, Optimizer};
//!
//! let mut opt = Optimizer::new(params.vars().to_vec(), &config.optimizer);
//! let mut sched = LrScheduler::from_config(&config.scheduler, opt.lr(), false, 5000);
//! opt.step(&buffer)?;
//! sched.step_batch(n_update, &mut opt);
//! ```

use candle_core::{Device, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::config::{OptimizerConfig, OptimizerKind, SchedulerConfig};
use crate::error::MetaError;
use crate::grads::GradBuffer;
use crate::MetaResult;

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPS: f64 = 1e-8;
/// Smallest learning-rate change the plateau scheduler applies
const PLATEAU_EPS: f64 = 1e-8;

// ═══════════════════════════════════════════════════════════════════════════
// SERIALIZABLE STATE
// ═══════════════════════════════════════════════════════════════════════════

/// A tensor flattened to f32 values plus its shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorState {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorState {
    pub fn from_tensor(t: &Tensor) -> MetaResult<Self> {
        Ok(Self {
            shape: t.dims().to_vec(),
            data: t
                .detach()
                .to_dtype(candle_core::DType::F32)?
                .flatten_all()?
                .to_vec1()?,
        })
    }

    pub fn to_tensor(&self, device: &Device) -> MetaResult<Tensor> {
        Ok(Tensor::from_vec(self.data.clone(), self.shape.as_slice(), device)?)
    }
}

/// Adam moments of one parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamSlotState {
    pub step: usize,
    pub exp_avg: TensorState,
    pub exp_avg_sq: TensorState,
    pub max_exp_avg_sq: TensorState,
}

/// Everything needed to resume an optimizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub kind: OptimizerKind,
    pub lr: f64,
    pub weight_decay: f64,
    /// One entry per parameter; `None` until the parameter first gets a gradient
    pub slots: Vec<Option<AdamSlotState>>,
}

#[derive(Debug, Clone)]
struct AdamSlot {
    step: usize,
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
    max_exp_avg_sq: Tensor,
}

// ═══════════════════════════════════════════════════════════════════════════
// OPTIMIZER
// ═══════════════════════════════════════════════════════════════════════════

/// SGD or Adam (AMSGrad) over a fixed list of variables
#[derive(Debug)]
pub struct Optimizer {
    kind: OptimizerKind,
    lr: f64,
    weight_decay: f64,
    vars: Vec<Var>,
    slots: Vec<Option<AdamSlot>>,
}

impl Optimizer {
    pub fn new(vars: Vec<Var>, config: &OptimizerConfig) -> Self {
        let slots = vec![None; vars.len()];
        Self {
            kind: config.kind,
            lr: config.lr,
            weight_decay: config.weight_decay,
            vars,
            slots,
        }
    }

    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    /// Apply one update from the gradients in `grads` (positions match the
    /// optimizer's variables). Variables without a gradient are skipped.
    pub fn step(&mut self, grads: &GradBuffer) -> MetaResult<()> {
        if grads.len() != self.vars.len() {
            return Err(MetaError::ShapeMismatch {
                name: "gradient buffer".to_string(),
                expected: vec![self.vars.len()],
                got: vec![grads.len()],
            });
        }
        for (idx, var) in self.vars.iter().enumerate() {
            let Some(grad) = grads.get(idx) else {
                continue;
            };
            let param = var.as_tensor().detach();
            let mut grad = grad.detach();
            if self.weight_decay != 0.0 {
                grad = (grad + param.affine(self.weight_decay, 0.0)?)?;
            }

            let updated = match self.kind {
                OptimizerKind::Sgd => (param - grad.affine(self.lr, 0.0)?)?,
                OptimizerKind::Adam => {
                    let slot = match self.slots[idx].take() {
                        Some(slot) => slot,
                        None => AdamSlot {
                            step: 0,
                            exp_avg: grad.zeros_like()?,
                            exp_avg_sq: grad.zeros_like()?,
                            max_exp_avg_sq: grad.zeros_like()?,
                        },
                    };
                    let step = slot.step + 1;
                    let exp_avg = (slot.exp_avg.affine(ADAM_BETA1, 0.0)?
                        + grad.affine(1.0 - ADAM_BETA1, 0.0)?)?;
                    let exp_avg_sq = (slot.exp_avg_sq.affine(ADAM_BETA2, 0.0)?
                        + grad.sqr()?.affine(1.0 - ADAM_BETA2, 0.0)?)?;
                    let max_exp_avg_sq = slot.max_exp_avg_sq.maximum(&exp_avg_sq)?;

                    let bias_correction1 = 1.0 - ADAM_BETA1.powi(step as i32);
                    let bias_correction2 = 1.0 - ADAM_BETA2.powi(step as i32);
                    let denom = max_exp_avg_sq
                        .sqrt()?
                        .affine(1.0 / bias_correction2.sqrt(), ADAM_EPS)?;
                    let update = exp_avg
                        .div(&denom)?
                        .affine(self.lr / bias_correction1, 0.0)?;

                    self.slots[idx] = Some(AdamSlot {
                        step,
                        exp_avg,
                        exp_avg_sq,
                        max_exp_avg_sq,
                    });
                    (param - update)?
                }
            };
            var.set(&updated)?;
        }
        Ok(())
    }

    pub fn state(&self) -> MetaResult<OptimizerState> {
        let slots = self
            .slots
            .iter()
            .map(|slot| {
                slot.as_ref()
                    .map(|s| {
                        Ok(AdamSlotState {
                            step: s.step,
                            exp_avg: TensorState::from_tensor(&s.exp_avg)?,
                            exp_avg_sq: TensorState::from_tensor(&s.exp_avg_sq)?,
                            max_exp_avg_sq: TensorState::from_tensor(&s.max_exp_avg_sq)?,
                        })
                    })
                    .transpose()
            })
            .collect::<MetaResult<Vec<_>>>()?;
        Ok(OptimizerState {
            kind: self.kind,
            lr: self.lr,
            weight_decay: self.weight_decay,
            slots,
        })
    }

    pub fn load_state(&mut self, state: &OptimizerState) -> MetaResult<()> {
        if state.kind != self.kind {
            return Err(MetaError::Config(format!(
                "Checkpointed optimizer is {:?}, configured optimizer is {:?}",
                state.kind, self.kind
            )));
        }
        if state.slots.len() != self.vars.len() {
            return Err(MetaError::ShapeMismatch {
                name: "optimizer state".to_string(),
                expected: vec![self.vars.len()],
                got: vec![state.slots.len()],
            });
        }
        let mut slots = Vec::with_capacity(state.slots.len());
        for (var, slot) in self.vars.iter().zip(&state.slots) {
            let device = var.device();
            slots.push(
                slot.as_ref()
                    .map(|s| {
                        let dtype = var.dtype();
                        Ok::<_, MetaError>(AdamSlot {
                            step: s.step,
                            exp_avg: s.exp_avg.to_tensor(device)?.to_dtype(dtype)?,
                            exp_avg_sq: s.exp_avg_sq.to_tensor(device)?.to_dtype(dtype)?,
                            max_exp_avg_sq: s.max_exp_avg_sq.to_tensor(device)?.to_dtype(dtype)?,
                        })
                    })
                    .transpose()?,
            );
        }
        self.slots = slots;
        self.lr = state.lr;
        self.weight_decay = state.weight_decay;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SCHEDULERS
// ═══════════════════════════════════════════════════════════════════════════

/// Decay the learning rate when a validation metric stops improving
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateauState {
    /// Lower metric values are better
    pub decreases: bool,
    pub factor: f64,
    pub patience: usize,
    /// Absolute improvement required to reset the bad-epoch counter
    pub threshold: f64,
    pub best: Option<f64>,
    pub num_bad_epochs: usize,
    pub last_epoch: usize,
}

/// Cosine annealing from `base_lr` to `eta_min` over `t_max` updates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CosineState {
    pub base_lr: f64,
    pub eta_min: f64,
    pub t_max: usize,
    pub last_update: usize,
}

/// Learning-rate scheduler; the enum is its full serializable state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LrScheduler {
    ReduceOnPlateau(PlateauState),
    Cosine(CosineState),
}

impl LrScheduler {
    /// `default_t_max` applies when a cosine schedule leaves `t_max` unset.
    pub fn from_config(
        config: &SchedulerConfig,
        base_lr: f64,
        metric_decreases: bool,
        default_t_max: usize,
    ) -> Self {
        match config {
            SchedulerConfig::ReduceOnPlateau {
                factor,
                patience,
                threshold,
            } => LrScheduler::ReduceOnPlateau(PlateauState {
                decreases: metric_decreases,
                factor: *factor,
                patience: *patience,
                threshold: *threshold,
                best: None,
                num_bad_epochs: 0,
                last_epoch: 0,
            }),
            SchedulerConfig::Cosine { t_max } => LrScheduler::Cosine(CosineState {
                base_lr,
                eta_min: 0.0,
                t_max: t_max.unwrap_or(default_t_max).max(1),
                last_update: 0,
            }),
        }
    }

    /// Plateau schedulers step on validation metrics, the rest per update.
    pub fn is_plateau(&self) -> bool {
        matches!(self, LrScheduler::ReduceOnPlateau(_))
    }

    /// Per-update step; no-op for plateau scheduling.
    pub fn step_batch(&mut self, update: usize, optimizer: &mut Optimizer) {
        if let LrScheduler::Cosine(state) = self {
            state.last_update = update;
            let progress = update.min(state.t_max) as f64 / state.t_max as f64;
            let lr = state.eta_min
                + (state.base_lr - state.eta_min) * (1.0 + (std::f64::consts::PI * progress).cos())
                    / 2.0;
            optimizer.set_lr(lr);
        }
    }

    /// Per-validation step; no-op for cosine scheduling.
    pub fn step(&mut self, metric: f64, epoch: usize, optimizer: &mut Optimizer) {
        if let LrScheduler::ReduceOnPlateau(state) = self {
            state.last_epoch = epoch;
            let improved = match state.best {
                None => true,
                Some(best) if state.decreases => metric < best - state.threshold,
                Some(best) => metric > best + state.threshold,
            };
            if improved {
                state.best = Some(metric);
                state.num_bad_epochs = 0;
            } else {
                state.num_bad_epochs += 1;
            }
            if state.num_bad_epochs > state.patience {
                let old_lr = optimizer.lr();
                let new_lr = old_lr * state.factor;
                if old_lr - new_lr > PLATEAU_EPS {
                    optimizer.set_lr(new_lr);
                    log::info!("Reducing learning rate to {:.4e}", new_lr);
                }
                state.num_bad_epochs = 0;
            }
        }
    }

    /// Best metric seen by a plateau scheduler
    pub fn best(&self) -> Option<f64> {
        match self {
            LrScheduler::ReduceOnPlateau(state) => state.best,
            LrScheduler::Cosine(_) => None,
        }
    }

    pub fn num_bad_epochs(&self) -> usize {
        match self {
            LrScheduler::ReduceOnPlateau(state) => state.num_bad_epochs,
            LrScheduler::Cosine(_) => 0,
        }
    }
}
