//! # Gradient Buffers
//!
//! candle keeps gradients in a `GradStore` returned by `backward`, not on the
//! parameters. `GradBuffer` plays the role of per-parameter `.grad` slots for
//! the live model: positions match the full `ParamVector`, contributions are
//! summed, and the optimizer consumes the buffer on `step`.

use candle_core::backprop::GradStore;
use candle_core::Tensor;

use crate::params::ParamVector;
use crate::MetaResult;

/// Additive gradient accumulation slots, one per parameter
#[derive(Debug, Clone, Default)]
pub struct GradBuffer {
    slots: Vec<Option<Tensor>>,
}

impl GradBuffer {
    pub fn new(n_params: usize) -> Self {
        Self {
            slots: vec![None; n_params],
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn get(&self, idx: usize) -> Option<&Tensor> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    /// Zero every slot (absent gradients, like a fresh `zero_grad`).
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }

    /// Sum `grad` into slot `idx`. The stored value is detached.
    pub fn accumulate(&mut self, idx: usize, grad: &Tensor) -> MetaResult<()> {
        let grad = grad.detach();
        let slot = &mut self.slots[idx];
        *slot = Some(match slot.take() {
            Some(existing) => (existing + grad)?,
            None => grad,
        });
        Ok(())
    }

    /// Accumulate every gradient `grads` holds for the parameters.
    pub fn accumulate_store(&mut self, params: &ParamVector, grads: &GradStore) -> MetaResult<()> {
        for (idx, var) in params.vars().iter().enumerate() {
            if let Some(g) = grads.get(var.as_tensor()) {
                self.accumulate(idx, g)?;
            }
        }
        Ok(())
    }

    /// Global L2 norm over all present slots.
    pub fn norm(&self) -> MetaResult<f64> {
        let mut total_norm_sq = 0.0f64;
        for grad in self.slots.iter().flatten() {
            let norm_sq = grad
                .to_dtype(candle_core::DType::F64)?
                .sqr()?
                .sum_all()?
                .to_scalar::<f64>()?;
            total_norm_sq += norm_sq;
        }
        Ok(total_norm_sq.sqrt())
    }

    /// Rescale so the global norm is at most `max_norm`. Returns the norm
    /// measured before clipping.
    pub fn clip_norm(&mut self, max_norm: f64) -> MetaResult<f64> {
        let total_norm = self.norm()?;
        if total_norm > max_norm {
            let clip_coef = max_norm / (total_norm + 1e-6);
            for slot in self.slots.iter_mut() {
                if let Some(grad) = slot.take() {
                    *slot = Some(grad.affine(clip_coef, 0.0)?);
                }
            }
        }
        Ok(total_norm)
    }
}

/// Concatenate gradients into one flat vector, substituting zeros shaped
/// like `like[i]` for absent entries so vectors from different batches
/// align position by position. `None` when every gradient is absent.
pub fn flatten_with_zeros(grads: &[Option<Tensor>], like: &[Tensor]) -> MetaResult<Option<Tensor>> {
    if grads.iter().all(Option::is_none) {
        return Ok(None);
    }
    let flat = grads
        .iter()
        .zip(like)
        .map(|(g, p)| match g {
            Some(g) => g.flatten_all(),
            None => p.zeros_like()?.flatten_all(),
        })
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok(Some(Tensor::cat(&flat, 0)?))
}
