//! # Gradient Aggregation
//!
//! Two ways of turning a task pair into gradients on the live parameters:
//!
//! - **Exact**: meta-gradients (and optionally discounted first-order
//!   gradients of the simulated steps) are summed into the buffer slots of the
//!   shared parameters. Non-shared parameters are left alone.
//! - **Approximate**: the candidate parameters are assumed equal to the
//!   originals. Both task gradients are taken directly and their alignment
//!   becomes a scalar regularizer on the combined loss, which is then
//!   backpropagated normally to every parameter.

use candle_core::Tensor;

use crate::config::ApproxTerm;
use crate::grads::GradBuffer;
use crate::params::SharedParams;
use crate::MetaResult;

/// Added to gradient norms before dividing by them
pub const NORM_EPS: f64 = 1e-5;

/// Sum gradient vectors into the shared slots of `buffer`.
///
/// `meta_grads` holds one vector per direction, indexed by shared position.
/// `sim_trajectories` holds, per direction, the simulated gradients of each
/// step (earliest first); step `k` is scaled by `discount^(k + 1)`.
pub fn assign_gradients(
    buffer: &mut GradBuffer,
    shared: &SharedParams,
    meta_grads: &[Vec<Option<Tensor>>],
    sim_trajectories: &[Vec<Vec<Option<Tensor>>>],
    discount: f64,
) -> MetaResult<()> {
    for (pos, &idx) in shared.idxs().iter().enumerate() {
        for grads in meta_grads {
            if let Some(g) = grads.get(pos).and_then(Option::as_ref) {
                buffer.accumulate(idx, g)?;
            }
        }
        for trajectory in sim_trajectories {
            for (step, grads) in trajectory.iter().enumerate() {
                if let Some(g) = grads.get(pos).and_then(Option::as_ref) {
                    let scale = discount.powi(step as i32 + 1);
                    buffer.accumulate(idx, &g.affine(scale, 0.0)?)?;
                }
            }
        }
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// SLOW-PARAMS APPROXIMATION
// ═══════════════════════════════════════════════════════════════════════════

/// Alignment of two flat task gradients
#[derive(Debug, Clone)]
pub struct Alignment {
    /// Scalar regularizer, differentiable unless the term is `SignCosSim`
    pub regularizer: Tensor,
    pub dot_product: f64,
    pub cos_sim: f64,
    pub norm1: f64,
    pub norm2: f64,
}

/// Regularizer settings taken from the trainer configuration
#[derive(Debug, Clone, Copy)]
pub struct AlignmentConfig {
    pub term: ApproxTerm,
    pub only_pos_reg: bool,
    pub max_sim_grad_norm: Option<f64>,
}

fn scalar(t: &Tensor) -> MetaResult<f64> {
    Ok(t.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?)
}

/// Alignment regularizer between two flat gradients.
///
/// Both inputs should still carry their graphs so the regularizer can be
/// differentiated w.r.t. the parameters.
pub fn alignment_regularizer(
    grad1: &Tensor,
    grad2: &Tensor,
    config: &AlignmentConfig,
) -> MetaResult<Alignment> {
    let dot = (grad1 * grad2)?.sum_all()?;
    let norm1 = (grad1.sqr()?.sum_all()?.sqrt()? + NORM_EPS)?;
    let norm2 = (grad2.sqr()?.sum_all()?.sqrt()? + NORM_EPS)?;
    let cos = dot.div(&(&norm1 * &norm2)?)?;

    let (dot_v, cos_v, n1, n2) = (scalar(&dot)?, scalar(&cos)?, scalar(&norm1)?, scalar(&norm2)?);

    let regularizer = match config.term {
        ApproxTerm::CosSim | ApproxTerm::OnlyCosSim => cos.clone(),
        ApproxTerm::SignCosSim => {
            let sign = if cos_v > 0.0 {
                1.0
            } else if cos_v < 0.0 {
                -1.0
            } else {
                0.0
            };
            Tensor::new(sign as f32, cos.device())?.to_dtype(cos.dtype())?
        }
        ApproxTerm::DotProduct => {
            let base = if config.only_pos_reg { dot.relu()? } else { dot.clone() };
            match config.max_sim_grad_norm {
                Some(max_norm) if n1 > max_norm || n2 > max_norm => {
                    let largest = if n1 >= n2 { &norm1 } else { &norm2 };
                    base.div(largest)?.affine(max_norm, 0.0)?
                }
                _ => base,
            }
        }
    };

    Ok(Alignment {
        regularizer,
        dot_product: dot_v,
        cos_sim: cos_v,
        norm1: n1,
        norm2: n2,
    })
}

/// Loss to backpropagate in approximation mode.
///
/// `loss_src + loss_trg - sim_lr * regularizer`, or `-cos_sim` alone for
/// `OnlyCosSim`. With `pseudo_meta` the regularizer is left out.
pub fn approx_loss(
    loss_src: &Tensor,
    loss_trg: &Tensor,
    alignment: &Alignment,
    term: ApproxTerm,
    sim_lr: f64,
    pseudo_meta: bool,
) -> MetaResult<Tensor> {
    if term == ApproxTerm::OnlyCosSim && !pseudo_meta {
        return Ok(alignment.regularizer.neg()?);
    }
    let gross = (loss_src + loss_trg)?;
    if pseudo_meta {
        return Ok(gross);
    }
    Ok((gross - alignment.regularizer.affine(sim_lr, 0.0)?)?)
}
