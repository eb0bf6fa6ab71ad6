//! # Trainer Configuration
//!
//! Serializable configuration for the meta multi-task trainer, plus the
//! closed sets of strategy tags (scheduler, optimizer, regularizer, phase)
//! that config files and the CLI select from.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use metatrain::config::TrainerConfig;
//!
//! let config = TrainerConfig::from_json_file("configs/meta.json")?;
//! config.validate()?;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::MetaError;
use crate::sampler::{SamplingSchedule, WeightingMethod};
use crate::MetaResult;

// ═══════════════════════════════════════════════════════════════════════════
// STRATEGY TAGS
// ═══════════════════════════════════════════════════════════════════════════

/// Training phase. Each phase keeps an independent checkpoint lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Primary multi-task training
    Main,
    /// Fine-tuning / evaluation stage
    Eval,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Main => "main",
            Phase::Eval => "eval",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = MetaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" => Ok(Phase::Main),
            "eval" => Ok(Phase::Eval),
            other => Err(MetaError::Config(format!("Unknown phase '{}'", other))),
        }
    }
}

/// Regularizer used by the slow-params approximation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApproxTerm {
    /// Cosine similarity of the two task gradients
    CosSim,
    /// Sign of the cosine similarity (contributes no gradient)
    SignCosSim,
    /// Dot product, rescaled when a gradient norm exceeds `max_sim_grad_norm`
    DotProduct,
    /// Replace the whole loss by the negative cosine similarity
    OnlyCosSim,
}

impl FromStr for ApproxTerm {
    type Err = MetaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cos_sim" => Ok(ApproxTerm::CosSim),
            "sign_cos_sim" => Ok(ApproxTerm::SignCosSim),
            "dot_product" => Ok(ApproxTerm::DotProduct),
            "only_cos_sim" => Ok(ApproxTerm::OnlyCosSim),
            other => Err(MetaError::Config(format!(
                "Regularization method '{}' not found",
                other
            ))),
        }
    }
}

/// Optimizer family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Sgd,
    /// Adam with the AMSGrad variant always on
    Adam,
}

impl FromStr for OptimizerKind {
    type Err = MetaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sgd" => Ok(OptimizerKind::Sgd),
            "adam" => Ok(OptimizerKind::Adam),
            other => Err(MetaError::Config(format!("Optimizer '{}' not supported", other))),
        }
    }
}

/// Optimizer settings, shared by the global optimizer and per-task optimizers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub kind: OptimizerKind,
    pub lr: f64,
    pub weight_decay: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::Adam,
            lr: 1e-3,
            weight_decay: 0.0,
        }
    }
}

/// Learning-rate scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerConfig {
    /// Decay on a validation plateau; threshold is absolute
    ReduceOnPlateau {
        factor: f64,
        patience: usize,
        threshold: f64,
    },
    /// Cosine annealing over `t_max` updates (defaults to the whole run)
    Cosine { t_max: Option<usize> },
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig::ReduceOnPlateau {
            factor: 0.5,
            patience: 1,
            threshold: 1e-4,
        }
    }
}

impl FromStr for SchedulerConfig {
    type Err = MetaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reduce_on_plateau" => Ok(SchedulerConfig::default()),
            "cosine" => Ok(SchedulerConfig::Cosine { t_max: None }),
            "noam" => Err(MetaError::Config(
                "Scheduler 'noam' is not supported".to_string(),
            )),
            other => Err(MetaError::Config(format!("Scheduler '{}' not supported", other))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TRAINER CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════

/// Trainer-level configuration, fixed for the lifetime of a trainer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Validations without improvement tolerated per metric
    pub patience: usize,
    /// Updates between validations (must be even: two tasks per update)
    pub val_interval: usize,
    /// Upper bound on the number of validations
    pub max_vals: usize,
    /// Global gradient-norm clip applied before every optimizer step
    pub max_grad_norm: Option<f64>,
    /// Learning-rate floor below which training stops
    pub min_lr: f64,
    /// Keep every checkpoint instead of only the best and the latest
    pub keep_all_checkpoints: bool,
    /// Validate on at most this many examples per task (None = all)
    pub val_data_limit: Option<usize>,
    /// Scale used to remap decreasing metrics into [0, 1] goodness scores
    pub dec_val_scale: f64,
    /// Fraction of training data used in the main phase
    pub training_data_fraction: f64,
    /// Learning rate of the simulated inner SGD step
    pub sim_lr: f64,
    /// Norm ceiling used by the dot-product regularizer
    pub max_sim_grad_norm: Option<f64>,
    /// Use the first-order alignment approximation instead of exact meta-gradients
    pub slow_params_approx: bool,
    /// Floor the dot-product regularizer at zero
    pub only_pos_reg: bool,
    /// Regularizer used in approximation mode
    pub approx_term: ApproxTerm,
    /// Compute only the source -> target direction
    pub one_sided_update: bool,
    /// Seconds between progress log lines
    pub log_interval_secs: u64,
    /// Optimizer settings
    pub optimizer: OptimizerConfig,
    /// Scheduler settings
    pub scheduler: SchedulerConfig,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            patience: 2,
            val_interval: 100,
            max_vals: 50,
            max_grad_norm: None,
            min_lr: 1e-6,
            keep_all_checkpoints: false,
            val_data_limit: Some(5000),
            dec_val_scale: 100.0,
            training_data_fraction: 1.0,
            sim_lr: 1e-3,
            max_sim_grad_norm: None,
            slow_params_approx: false,
            only_pos_reg: false,
            approx_term: ApproxTerm::CosSim,
            one_sided_update: false,
            log_interval_secs: 10,
            optimizer: OptimizerConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl TrainerConfig {
    /// Configuration for quick experiments and tests
    pub fn quick() -> Self {
        Self {
            patience: 2,
            val_interval: 4,
            max_vals: 3,
            val_data_limit: None,
            sim_lr: 1e-2,
            log_interval_secs: 1,
            optimizer: OptimizerConfig {
                kind: OptimizerKind::Sgd,
                lr: 1e-2,
                weight_decay: 0.0,
            },
            ..Self::default()
        }
    }

    /// Configuration for the cheap alignment approximation
    pub fn approximate(approx_term: ApproxTerm) -> Self {
        Self {
            slow_params_approx: true,
            approx_term,
            max_sim_grad_norm: Some(5.0),
            ..Self::default()
        }
    }

    /// Parse a configuration from JSON. Missing fields take defaults; an
    /// unknown tag is a `Config` error, as on the command line.
    pub fn from_json(text: &str) -> MetaResult<Self> {
        let config: TrainerConfig = serde_json::from_str(text)
            .map_err(|e| MetaError::Config(format!("Invalid trainer config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> MetaResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text).map_err(|e| match e {
            MetaError::Config(msg) => MetaError::Config(format!("{:?}: {}", path.as_ref(), msg)),
            other => other,
        })
    }

    /// Check the constraints the training loop relies on
    pub fn validate(&self) -> MetaResult<()> {
        if self.val_interval == 0 || self.val_interval % 2 != 0 {
            return Err(MetaError::Config(format!(
                "Need an even validation interval, got {}",
                self.val_interval
            )));
        }
        if !(self.training_data_fraction > 0.0 && self.training_data_fraction <= 1.0) {
            return Err(MetaError::Config(format!(
                "training_data_fraction must be in (0, 1], got {}",
                self.training_data_fraction
            )));
        }
        if self.dec_val_scale <= 0.0 {
            return Err(MetaError::Config(format!(
                "dec_val_scale must be positive, got {}",
                self.dec_val_scale
            )));
        }
        if let SchedulerConfig::ReduceOnPlateau { factor, .. } = self.scheduler {
            if !(factor > 0.0 && factor < 1.0) {
                return Err(MetaError::Config(format!(
                    "Plateau decay factor must be in (0, 1), got {}",
                    factor
                )));
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PER-RUN OPTIONS
// ═══════════════════════════════════════════════════════════════════════════

/// Options for a single `train()` call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainOptions {
    /// Metric whose patience decides early stopping (e.g. `macro_avg`)
    pub stop_metric: String,
    pub batch_size: usize,
    /// Batch pairs drawn per scheduled task pairing
    pub n_batches_per_pass: usize,
    pub weighting_method: WeightingMethod,
    pub sampling: SamplingSchedule,
    /// One optimizer for all tasks instead of one per task
    pub shared_optimizer: bool,
    /// Resume from the latest checkpoint of this phase if one exists
    pub load_model: bool,
    pub phase: Phase,
    /// Log the approximation regularizer without applying it
    pub pseudo_meta: bool,
    /// Add discounted simulated first-order gradients to the meta-gradient
    pub multistep_loss: bool,
    pub multistep_scale: f64,
    /// Seed for batch shuffling and weighted sampling
    pub seed: u64,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            stop_metric: "macro_avg".to_string(),
            batch_size: 32,
            n_batches_per_pass: 1,
            weighting_method: WeightingMethod::Proportional,
            sampling: SamplingSchedule::FixedPair,
            shared_optimizer: true,
            load_model: true,
            phase: Phase::Main,
            pseudo_meta: false,
            multistep_loss: false,
            multistep_scale: 0.1,
            seed: 42,
        }
    }
}

impl TrainOptions {
    /// Parse options from JSON. Missing fields take defaults.
    pub fn from_json(text: &str) -> MetaResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| MetaError::Config(format!("Invalid train options: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trainer_config_default() {
        let config = TrainerConfig::default();
        assert_eq!(config.patience, 2);
        assert_eq!(config.val_interval, 100);
        assert_eq!(config.approx_term, ApproxTerm::CosSim);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_odd_val_interval_rejected() {
        let config = TrainerConfig {
            val_interval: 7,
            ..TrainerConfig::default()
        };
        assert!(matches!(config.validate(), Err(MetaError::Config(_))));
    }

    #[test]
    fn test_scheduler_tags() {
        assert_eq!(
            "cosine".parse::<SchedulerConfig>().unwrap(),
            SchedulerConfig::Cosine { t_max: None }
        );
        assert!(matches!(
            "noam".parse::<SchedulerConfig>(),
            Err(MetaError::Config(_))
        ));
        assert!(matches!(
            "step_lr".parse::<SchedulerConfig>(),
            Err(MetaError::Config(_))
        ));
    }

    #[test]
    fn test_approx_term_tags() {
        assert_eq!(
            "sign_cos_sim".parse::<ApproxTerm>().unwrap(),
            ApproxTerm::SignCosSim
        );
        assert!("l2".parse::<ApproxTerm>().is_err());
    }

    #[test]
    fn test_config_json_roundtrip_with_defaults() {
        let json = r#"{ "patience": 5, "scheduler": { "type": "cosine", "t_max": 10 } }"#;
        let config: TrainerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.patience, 5);
        assert_eq!(config.val_interval, 100);
        assert_eq!(config.scheduler, SchedulerConfig::Cosine { t_max: Some(10) });
    }

    #[test]
    fn test_unknown_scheduler_in_file_is_config_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{ "scheduler": { "type": "noam" } }"#).unwrap();
        assert!(matches!(
            TrainerConfig::from_json_file(&path),
            Err(MetaError::Config(_))
        ));
    }

    #[test]
    fn test_unknown_tags_are_config_errors_everywhere() {
        for json in [
            r#"{ "approx_term": "l2" }"#,
            r#"{ "scheduler": { "type": "noam" } }"#,
            r#"{ "optimizer": { "kind": "lamb" } }"#,
        ] {
            assert!(
                matches!(TrainerConfig::from_json(json), Err(MetaError::Config(_))),
                "{}",
                json
            );
        }
        assert!(matches!(
            TrainOptions::from_json(r#"{ "weighting_method": "examples" }"#),
            Err(MetaError::Config(_))
        ));
        assert!(matches!(
            TrainOptions::from_json(r#"{ "sampling": "round_robin" }"#),
            Err(MetaError::Config(_))
        ));
        // the same mistakes through the command-line parsers
        assert!(matches!("l2".parse::<ApproxTerm>(), Err(MetaError::Config(_))));
        assert!(matches!(
            "examples".parse::<WeightingMethod>(),
            Err(MetaError::Config(_))
        ));

        let options = TrainOptions::from_json(r#"{ "seed": 3 }"#).unwrap();
        assert_eq!(options.seed, 3);
        assert_eq!(options.batch_size, 32);
    }
}
