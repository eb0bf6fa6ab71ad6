//! # Meta Multi-Task Training CLI
//!
//! Trains the reference multi-task MLP on synthetic tasks with exact
//! meta-gradients or the alignment approximation.
//!
//! ## Usage
//!
//! ```bash
//! # Exact meta-gradients, two synthetic tasks
//! meta_train --serialization-dir runs/exp1
//!
//! # Cosine-similarity approximation with per-task optimizers
//! meta_train --serialization-dir runs/exp2 --approx cos_sim --per-task-optimizers
//!
//! # Resume, or start the eval phase from a JSON trainer config
//! meta_train --serialization-dir runs/exp1 --config trainer.json --phase eval
//! ```

use candle_core::Device;
use clap::Parser;
use std::path::PathBuf;

use metatrain::prelude::*;

/// Meta multi-task trainer
#[derive(Parser, Debug)]
#[command(name = "meta_train")]
#[command(about = "Train several tasks jointly with meta-gradients")]
#[command(version)]
struct Args {
    /// Directory for checkpoints and tensorboard logs
    #[arg(short, long)]
    serialization_dir: Option<PathBuf>,

    /// Trainer configuration (JSON); flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Training phase
    #[arg(long, default_value = "main")]
    phase: Phase,

    /// Number of synthetic regression tasks
    #[arg(long, default_value = "1")]
    regression_tasks: usize,

    /// Number of synthetic classification tasks
    #[arg(long, default_value = "1")]
    classification_tasks: usize,

    /// Training examples per task
    #[arg(long, default_value = "512")]
    train_examples: usize,

    /// Validation examples per task
    #[arg(long, default_value = "128")]
    val_examples: usize,

    /// Input dimension
    #[arg(long, default_value = "8")]
    input_dim: usize,

    /// Hidden dimension
    #[arg(long, default_value = "16")]
    hidden_dim: usize,

    /// Shared hidden layers
    #[arg(long, default_value = "2")]
    num_layers: usize,

    /// Batch size
    #[arg(short, long, default_value = "32")]
    batch_size: usize,

    /// Stopping metric
    #[arg(long, default_value = "macro_avg")]
    stop_metric: String,

    /// Task weighting method (uniform, proportional, power_0.75, softmax_2, ...)
    #[arg(long, default_value = "proportional")]
    weighting_method: WeightingMethod,

    /// Task pair sampling (fixed_pair or weighted)
    #[arg(long, default_value = "fixed_pair")]
    sampling: SamplingSchedule,

    /// Use the alignment approximation with this term
    #[arg(long)]
    approx: Option<ApproxTerm>,

    /// Compute a single meta-gradient direction per update
    #[arg(long)]
    one_sided: bool,

    /// Give every task its own optimizer and scheduler
    #[arg(long)]
    per_task_optimizers: bool,

    /// Start fresh instead of resuming existing checkpoints
    #[arg(long)]
    no_load: bool,

    /// Seed for data generation, shuffling and sampling
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Use CUDA if available
    #[arg(long)]
    cuda: bool,

    /// Use Metal if available
    #[arg(long)]
    metal: bool,
}

fn synthetic_tasks(args: &Args, device: &Device) -> MetaResult<Vec<Task>> {
    let mut tasks = Vec::new();
    for i in 0..args.regression_tasks {
        let seed = args.seed.wrapping_add(2 * i as u64);
        let train = Dataset::synthetic_regression(args.train_examples, args.input_dim, seed, device)?;
        let val = Dataset::synthetic_regression(args.val_examples, args.input_dim, seed + 1, device)?;
        tasks.push(Task::new(
            format!("reg{}", i),
            TaskKind::Regression,
            MetricKind::Mse,
            train,
            val,
        )?);
    }
    for i in 0..args.classification_tasks {
        let seed = args.seed.wrapping_add(1000 + 2 * i as u64);
        let n_classes = 3;
        let train = Dataset::synthetic_classification(
            args.train_examples,
            args.input_dim,
            n_classes,
            seed,
            device,
        )?;
        let val = Dataset::synthetic_classification(
            args.val_examples,
            args.input_dim,
            n_classes,
            seed + 1,
            device,
        )?;
        tasks.push(Task::new(
            format!("cls{}", i),
            TaskKind::Classification { n_classes },
            MetricKind::Accuracy,
            train,
            val,
        )?);
    }
    Ok(tasks)
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    log::info!("Meta Multi-Task Training");
    log::info!("========================");

    let device = if args.cuda {
        Device::cuda_if_available(0)?
    } else if args.metal {
        Device::new_metal(0)?
    } else {
        Device::Cpu
    };
    log::info!("Using device: {:?}", device);

    let mut config = match &args.config {
        Some(path) => TrainerConfig::from_json_file(path)?,
        None => TrainerConfig::default(),
    };
    if let Some(term) = args.approx {
        config.slow_params_approx = true;
        config.approx_term = term;
    }
    config.one_sided_update |= args.one_sided;

    let mut tasks = synthetic_tasks(&args, &device)?;
    log::info!(
        "Tasks: {:?}",
        tasks.iter().map(|t| t.name().to_string()).collect::<Vec<_>>()
    );

    let model_config = MlpConfig {
        input_dim: args.input_dim,
        hidden_dim: args.hidden_dim,
        n_layers: args.num_layers,
    };
    let model = MultiTaskMlp::new(&model_config, &tasks, &device)?;

    let options = TrainOptions {
        stop_metric: args.stop_metric.clone(),
        batch_size: args.batch_size,
        weighting_method: args.weighting_method,
        sampling: args.sampling,
        shared_optimizer: !args.per_task_optimizers,
        load_model: !args.no_load,
        phase: args.phase,
        seed: args.seed,
        ..TrainOptions::default()
    };

    let mut trainer = MetaMultiTaskTrainer::new(model, config, args.serialization_dir.clone(), device)?;
    let summary = trainer.train(&mut tasks, &options)?;

    log::info!("Training complete!");
    log::info!("  Updates: {}", summary.n_update);
    log::info!("  Validations: {}", summary.epochs);
    for (metric, epoch) in &summary.best_epochs {
        match epoch {
            Some(epoch) => log::info!("  Best {}: epoch {}", metric, epoch),
            None => log::info!("  Best {}: none", metric),
        }
    }

    Ok(())
}
