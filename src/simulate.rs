//! # Gradient Simulation
//!
//! One hypothetical SGD step on the shared parameters, computed without
//! mutating the live model. The gradients are kept differentiable, so the
//! candidate parameters remain functions of the originals and later
//! differentiation flows back through the simulated step.

use candle_core::{Device, Tensor, Var};
use std::cell::Cell;
use std::sync::Once;

use crate::dataset::Batch;
use crate::error::MetaError;
use crate::model::{ForwardOutput, MetaModel};
use crate::params::SharedParams;
use crate::task::Task;
use crate::MetaResult;

const GRAD_FLAG: &str = "CANDLE_GRAD_DO_NOT_DETACH";

static HIGHER_ORDER: Once = Once::new();

thread_local! {
    static VERIFIED: Cell<bool> = const { Cell::new(false) };
}

/// Switch candle's backward pass to keep the graph of every gradient it
/// returns, then check that second derivatives actually flow on the calling
/// thread.
///
/// candle reads the flag once per thread, at that thread's first backward
/// pass. A thread that ran a backward pass before the flag was set keeps
/// detaching gradients, and meta-gradients computed there would silently
/// lose their Hessian term; this returns `MetaError::Config` instead. Set
/// `CANDLE_GRAD_DO_NOT_DETACH=1` in the environment to avoid the problem
/// entirely.
pub fn enable_higher_order() -> MetaResult<()> {
    HIGHER_ORDER.call_once(|| {
        if std::env::var_os(GRAD_FLAG).is_none() {
            std::env::set_var(GRAD_FLAG, "1");
            log::debug!("Enabled differentiable gradients");
        }
    });
    if VERIFIED.with(Cell::get) {
        return Ok(());
    }
    if !second_order_flows()? {
        return Err(MetaError::Config(format!(
            "second-order gradients are unavailable on thread {:?}: it ran a backward pass before {} was set. Set {}=1 in the environment before starting the process",
            std::thread::current().name().unwrap_or("<unnamed>"),
            GRAD_FLAG,
            GRAD_FLAG
        )));
    }
    VERIFIED.with(|v| v.set(true));
    Ok(())
}

/// `d²(Σ x³)/dx² = 6x` must come back non-zero.
fn second_order_flows() -> MetaResult<bool> {
    let x = Var::new(&[1f32, 2.0], &Device::Cpu)?;
    let cube = (x.sqr()? * x.as_tensor())?.sum_all()?;
    let store = cube.backward()?;
    let grad = match store.get(x.as_tensor()) {
        Some(g) => g.clone(),
        None => return Ok(false),
    };
    let second = grad.sum_all()?.backward()?;
    match second.get(x.as_tensor()) {
        Some(h) => Ok(h.to_vec1::<f32>()?.iter().all(|v| *v != 0.0)),
        None => Ok(false),
    }
}

/// A simulated step, positions indexed like the shared parameter set
#[derive(Debug)]
pub struct SimulatedStep {
    /// `original - lr * grad` where a gradient exists, else `original`
    pub cand_params: Vec<Tensor>,
    /// Gradients that produced the step, still attached to the graph
    pub grads: Vec<Option<Tensor>>,
    /// Forward output on the simulated batch
    pub output: ForwardOutput,
}

/// Simulate one SGD step of size `sim_lr` toward `task`'s loss on `batch`.
///
/// Fails with `DisconnectedGraph` when no shared parameter receives a gradient,
/// and with `Config` when the calling thread cannot differentiate twice.
pub fn simulate_sgd<M: MetaModel + ?Sized>(
    model: &M,
    shared: &SharedParams,
    task: &Task,
    batch: &Batch,
    sim_lr: f64,
) -> MetaResult<SimulatedStep> {
    enable_higher_order()?;

    let params = model.parameters();
    let output = model.forward(task, batch)?;
    let store = output.loss.backward()?;

    let originals = shared.tensors(params);
    let grads: Vec<Option<Tensor>> = originals.iter().map(|p| store.get(p).cloned()).collect();
    if grads.iter().all(Option::is_none) {
        return Err(MetaError::DisconnectedGraph {
            task: task.name().to_string(),
        });
    }

    let cand_params = originals
        .iter()
        .zip(&grads)
        .map(|(p, g)| match g {
            Some(g) => p - g.affine(sim_lr, 0.0)?,
            None => Ok(p.clone()),
        })
        .collect::<candle_core::Result<Vec<_>>>()?;

    Ok(SimulatedStep {
        cand_params,
        grads,
        output,
    })
}
