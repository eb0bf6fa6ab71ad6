//! # Meta Multi-Task Training
//!
//! A training coordinator that learns several tasks at once by optimising
//! shared parameters for *transfer*: every update simulates an SGD step on a
//! source task and measures, with exact second-order autodiff, how the
//! target task's loss responds to the original parameters.
//!
//! ## Features
//! - Exact meta-gradients through a simulated inner step (candle autodiff)
//! - Cheap first-order alignment approximation (cosine / sign / dot product)
//! - Task pair scheduling with ten weighting methods
//! - Per-metric history, best-so-far and patience tracking
//! - Phase-separated checkpoints with a single best-marked snapshot
//! - Tensorboard telemetry
//!
//! ## Architecture
//!
//! ```text
//!  Task Sampler ──► (src, trg) pair ──► next batch of each
//!                                           │
//!         ┌─────────────────────────────────┴────────────────────┐
//!         │ exact:  simulate θ' = θ - lr·∇L_src  ─►  ∂L_trg(θ')/∂θ │
//!         │ approx: L_src + L_trg - lr·align(∇L_src, ∇L_trg)       │
//!         └─────────────────────────────────┬────────────────────┘
//!                                           │
//!                 Gradient Aggregator ─► clip ─► optimizer step
//!                                           │
//!            every val_interval: validate ─► Metric Tracker ─► checkpoint
//! ```

// Foundations
pub mod error;
pub mod config;
pub mod params;
pub mod grads;

// Data and models
pub mod dataset;
pub mod task;
pub mod model;

// Meta-gradients
pub mod simulate;
pub mod meta_gradient;
pub mod aggregate;

// Training infrastructure
pub mod sampler;
pub mod tracker;
pub mod optim;
pub mod checkpoint;
pub mod metrics;
pub mod training;

// Integration tests
#[cfg(test)]
mod tests;

pub use error::MetaError;
pub use config::{
    ApproxTerm,
    OptimizerConfig,
    OptimizerKind,
    Phase,
    SchedulerConfig,
    TrainOptions,
    TrainerConfig,
};
pub use params::{ParamVector, SharedParams};
pub use grads::GradBuffer;
pub use dataset::{Batch, BatchStream, Dataset};
pub use task::{MetricKind, Task, TaskKind};
pub use model::{ForwardOutput, MetaModel, MlpConfig, MultiTaskMlp};
pub use simulate::{enable_higher_order, simulate_sgd, SimulatedStep};
pub use meta_gradient::{MetaGradientEngine, MetaGradients};
pub use aggregate::{alignment_regularizer, approx_loss, assign_gradients, Alignment};
pub use sampler::{PairSchedule, SamplingSchedule, WeightingMethod};
pub use tracker::{MetricInfo, MetricTracker};
pub use optim::{LrScheduler, Optimizer};
pub use checkpoint::{CheckpointManager, Snapshot};
pub use metrics::MetricsLogger;
pub use training::{MetaMultiTaskTrainer, TrainingSummary};

/// Result type for meta-training operations
pub type MetaResult<T> = Result<T, MetaError>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        // Configuration
        ApproxTerm,
        OptimizerConfig,
        OptimizerKind,
        Phase,
        SchedulerConfig,
        TrainOptions,
        TrainerConfig,

        // Data, tasks and models
        Dataset,
        MetaModel,
        MetricKind,
        MlpConfig,
        MultiTaskMlp,
        Task,
        TaskKind,

        // Training
        MetaMultiTaskTrainer,
        SamplingSchedule,
        TrainingSummary,
        WeightingMethod,

        // Result type
        MetaResult,
        MetaError,
    };
    pub use candle_core::Device;
}
