//! # Parameter Vectors
//!
//! An ordered, indexable view over a model's trainable parameters. The same
//! abstraction backs the live model and its shadow copy:
//!
//! - `snapshot` returns the current values as graph-tracked tensors
//! - `load_from_vector` overwrites every parameter in place
//! - `replace_subset` builds a full vector with selected positions swapped
//!
//! `SharedParams` records, once per training run, which positions of the full
//! vector take part in meta-learning.

use candle_core::{Tensor, Var};
use candle_nn::VarMap;
use std::collections::HashMap;

use crate::error::MetaError;
use crate::MetaResult;

/// Ordered named trainable parameters
#[derive(Debug, Clone)]
pub struct ParamVector {
    names: Vec<String>,
    vars: Vec<Var>,
}

impl ParamVector {
    pub fn new(named: Vec<(String, Var)>) -> Self {
        let (names, vars) = named.into_iter().unzip();
        Self { names, vars }
    }

    /// Collect every variable of a `VarMap`, ordered by name.
    pub fn from_varmap(varmap: &VarMap) -> Self {
        let data = varmap.data().lock().unwrap_or_else(|e| e.into_inner());
        let mut named: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        Self::new(named)
    }

    /// Zero-initialised copy with identical names, shapes, dtypes and devices.
    /// The copy owns its storage, so writing to it never touches `self`.
    pub fn mirror(&self) -> MetaResult<Self> {
        let vars = self
            .vars
            .iter()
            .map(|v| Var::zeros(v.dims(), v.dtype(), v.device()))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            names: self.names.clone(),
            vars,
        })
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn vars(&self) -> &[Var] {
        &self.vars
    }

    pub fn var(&self, idx: usize) -> &Var {
        &self.vars[idx]
    }

    pub fn name(&self, idx: usize) -> &str {
        &self.names[idx]
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Current values as tensors that still track back to the variables.
    pub fn snapshot(&self) -> Vec<Tensor> {
        self.vars.iter().map(|v| v.as_tensor().clone()).collect()
    }

    /// Current values as plain copies with no autograd history.
    pub fn detached_snapshot(&self) -> MetaResult<Vec<Tensor>> {
        Ok(self
            .vars
            .iter()
            .map(|v| v.as_tensor().detach().copy())
            .collect::<candle_core::Result<Vec<_>>>()?)
    }

    /// Overwrite every parameter with `values` (detached from their graphs).
    pub fn load_from_vector(&self, values: &[Tensor]) -> MetaResult<()> {
        if values.len() != self.vars.len() {
            return Err(MetaError::ShapeMismatch {
                name: "parameter vector".to_string(),
                expected: vec![self.vars.len()],
                got: vec![values.len()],
            });
        }
        for ((name, var), value) in self.names.iter().zip(&self.vars).zip(values) {
            if var.dims() != value.dims() {
                return Err(MetaError::ShapeMismatch {
                    name: name.clone(),
                    expected: var.dims().to_vec(),
                    got: value.dims().to_vec(),
                });
            }
            var.set(&value.detach())?;
        }
        Ok(())
    }

    /// Name -> value map of detached copies, used for weight serialization.
    pub fn to_named_tensors(&self) -> MetaResult<HashMap<String, Tensor>> {
        let values = self.detached_snapshot()?;
        Ok(self.names.iter().cloned().zip(values).collect())
    }
}

/// Full vector equal to `base` except at `idxs`, which take `values`.
pub fn replace_subset(base: &[Tensor], idxs: &[usize], values: &[Tensor]) -> Vec<Tensor> {
    let mut full = base.to_vec();
    for (&i, value) in idxs.iter().zip(values) {
        full[i] = value.clone();
    }
    full
}

/// Phrase-layer embedding parameters stay out of meta-learning.
pub fn is_phrase_layer_embedding(name: &str) -> bool {
    name.contains("_phrase_layer") && name.contains("embed")
}

/// Positions of the shared parameters inside the full parameter vector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedParams {
    idxs: Vec<usize>,
}

impl SharedParams {
    /// Every parameter except phrase-layer embeddings.
    pub fn from_exclusion_rule(params: &ParamVector) -> Self {
        Self::select(params, |name| !is_phrase_layer_embedding(name))
    }

    pub fn select(params: &ParamVector, keep: impl Fn(&str) -> bool) -> Self {
        let idxs = params
            .names()
            .iter()
            .enumerate()
            .filter(|(_, name)| keep(name))
            .map(|(i, _)| i)
            .collect();
        Self { idxs }
    }

    pub fn idxs(&self) -> &[usize] {
        &self.idxs
    }

    pub fn len(&self) -> usize {
        self.idxs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idxs.is_empty()
    }

    /// Tracked tensors of the shared parameters, in shared order.
    pub fn tensors(&self, params: &ParamVector) -> Vec<Tensor> {
        self.idxs
            .iter()
            .map(|&i| params.var(i).as_tensor().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn sample_params() -> ParamVector {
        let device = Device::Cpu;
        ParamVector::new(vec![
            (
                "sent_encoder._phrase_layer.embed.weight".to_string(),
                Var::ones((2, 2), DType::F32, &device).unwrap(),
            ),
            (
                "sent_encoder.layer0.weight".to_string(),
                Var::ones((2, 3), DType::F32, &device).unwrap(),
            ),
            (
                "heads.a.bias".to_string(),
                Var::zeros(3, DType::F32, &device).unwrap(),
            ),
        ])
    }

    #[test]
    fn test_shared_params_exclude_phrase_embedding() {
        let params = sample_params();
        let shared = SharedParams::from_exclusion_rule(&params);
        assert_eq!(shared.idxs(), &[1, 2]);
    }

    #[test]
    fn test_mirror_is_independent() {
        let params = sample_params();
        let shadow = params.mirror().unwrap();
        shadow
            .load_from_vector(&params.detached_snapshot().unwrap())
            .unwrap();
        let bumped: Vec<Tensor> = shadow
            .snapshot()
            .iter()
            .map(|t| (t + 1.0).unwrap())
            .collect();
        shadow.load_from_vector(&bumped).unwrap();

        let live: Vec<f32> = params.var(1).flatten_all().unwrap().to_vec1().unwrap();
        let copy: Vec<f32> = shadow.var(1).flatten_all().unwrap().to_vec1().unwrap();
        assert!(live.iter().all(|&x| x == 1.0));
        assert!(copy.iter().all(|&x| x == 2.0));
    }

    #[test]
    fn test_load_rejects_wrong_shape() {
        let params = sample_params();
        let mut values = params.detached_snapshot().unwrap();
        values[0] = Tensor::zeros((3, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            params.load_from_vector(&values),
            Err(MetaError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_replace_subset() {
        let params = sample_params();
        let base = params.snapshot();
        let replacement = Tensor::full(5f32, (2, 3), &Device::Cpu).unwrap();
        let full = replace_subset(&base, &[1], &[replacement]);
        assert_eq!(full.len(), 3);
        let v: Vec<f32> = full[1].flatten_all().unwrap().to_vec1().unwrap();
        assert!(v.iter().all(|&x| x == 5.0));
        assert_eq!(full[0].id(), base[0].id());
    }
}
