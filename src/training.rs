//! # Meta Multi-Task Training Loop
//!
//! `MetaMultiTaskTrainer` drives a `MetaModel` over several tasks:
//!
//! - every update draws a (source, target) task pair and one batch from each
//! - gradients come from the exact meta-gradient engine in both directions
//!   (or one, with `one_sided_update`), or from the slow-params
//!   approximation
//! - every `val_interval` updates it validates all tasks, updates metric
//!   histories and schedulers, checks the stop conditions and checkpoints
//!
//! All mutable state of one `train()` call lives in a `TrainingRun` owned by
//! that call; the trainer itself only holds the model and its configuration.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use metatrain::prelude::*;
//!
//! let mut trainer = MetaMultiTaskTrainer::new(model, TrainerConfig::default(), Some("runs/exp1".into()), Device::Cpu)?;
//! let summary = trainer.train(&mut tasks, &TrainOptions::default())?;
//! println!("best macro epoch: {:?}", summary.best_epochs["macro"]);
//! ```

use candle_core::Device;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::aggregate::{alignment_regularizer, approx_loss, assign_gradients, AlignmentConfig};
use crate::checkpoint::{
    apply_weights, CheckpointManager, GlobalState, Snapshot, TaskState, TaskStates, TrainingState,
};
use crate::config::{Phase, TrainOptions, TrainerConfig};
use crate::dataset::{Batch, BatchStream};
use crate::error::MetaError;
use crate::grads::{flatten_with_zeros, GradBuffer};
use crate::meta_gradient::MetaGradientEngine;
use crate::metrics::{describe_metrics, MetricsLogger, Stream};
use crate::model::{ForwardOutput, MetaModel};
use crate::optim::{LrScheduler, Optimizer};
use crate::params::SharedParams;
use crate::sampler::{
    draw_schedule, interval_rng, normalize, PairSchedule, TaskSize, WeightingMethod,
};
use crate::simulate::enable_higher_order;
use crate::task::Task;
use crate::tracker::{aggregate_scores, MetricSnapshot, MetricTracker, TaskScore, MACRO_AVG, MICRO_AVG};
use crate::MetaResult;

// ═══════════════════════════════════════════════════════════════════════════
// RUN STATE
// ═══════════════════════════════════════════════════════════════════════════

/// An optimizer and the scheduler driving its learning rate
#[derive(Debug)]
pub struct OptimSlot {
    pub optimizer: Optimizer,
    pub scheduler: LrScheduler,
}

/// Training progress of one task
#[derive(Debug)]
pub struct TaskInfo {
    pub stream: BatchStream,
    /// Training batches per pass over the (possibly subsetted) data
    pub n_tr_batches: usize,
    /// Loss summed since the last validation
    pub loss: f64,
    /// Loss summed since the start of the run
    pub total_loss: f64,
    pub n_batches_since_val: usize,
    pub total_batches_trained: usize,
    pub stopped: bool,
    /// Task-owned optimizer, only when optimization is not shared
    pub optim: Option<OptimSlot>,
    pub last_log: Instant,
}

/// Diagnostics of one approximation-mode update
#[derive(Debug, Clone, Copy)]
pub struct ApproxDiagnostics {
    pub gross_loss: f64,
    pub net_loss: f64,
    pub regularizer: f64,
    pub cos_sim: f64,
    pub src_norm: f64,
    pub trg_norm: f64,
}

/// Mutable state of one `train()` call
struct TrainingRun {
    infos: Vec<TaskInfo>,
    tracker: MetricTracker,
    global: Option<OptimSlot>,
    shared: SharedParams,
    engine: Option<MetaGradientEngine>,
    buffer: GradBuffer,
    sample_weights: Vec<f64>,
    schedule: PairSchedule,
    n_update: usize,
    should_stop: bool,
}

/// Outputs of one trained batch pair
struct PairOutcome {
    src_out: ForwardOutput,
    trg_out: ForwardOutput,
    approx: Option<ApproxDiagnostics>,
}

/// Result of a validation pass
struct ValidationOutcome {
    metrics: MetricSnapshot,
    should_save: bool,
    new_best_macro: bool,
}

/// Final report of a `train()` call
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    /// Best epoch per task (by task name) and for `micro` / `macro`
    pub best_epochs: BTreeMap<String, Option<usize>>,
    /// Batches trained per task
    pub batches_trained: BTreeMap<String, usize>,
    pub n_update: usize,
    pub epochs: usize,
}

// ═══════════════════════════════════════════════════════════════════════════
// TRAINER
// ═══════════════════════════════════════════════════════════════════════════

/// Meta multi-task trainer
pub struct MetaMultiTaskTrainer<M: MetaModel> {
    model: M,
    config: TrainerConfig,
    checkpoints: Option<CheckpointManager>,
    telemetry: MetricsLogger,
    device: Device,
}

impl<M: MetaModel> MetaMultiTaskTrainer<M> {
    /// `serialization_dir` enables checkpoints and tensorboard logs.
    pub fn new(
        model: M,
        config: TrainerConfig,
        serialization_dir: Option<PathBuf>,
        device: Device,
    ) -> MetaResult<Self> {
        config.validate()?;
        let (checkpoints, telemetry) = match serialization_dir {
            Some(dir) => (
                Some(CheckpointManager::new(&dir, config.keep_all_checkpoints)?),
                MetricsLogger::new(&dir, config.slow_params_approx)?,
            ),
            None => (None, MetricsLogger::disabled()),
        };
        Ok(Self {
            model,
            config,
            checkpoints,
            telemetry,
            device,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn checkpoints(&self) -> Option<&CheckpointManager> {
        self.checkpoints.as_ref()
    }

    /// Train until a stop condition holds. Resumes from the latest
    /// checkpoint of `options.phase` when `load_model` is set and one exists.
    pub fn train(&mut self, tasks: &mut [Task], options: &TrainOptions) -> MetaResult<TrainingSummary> {
        let val_interval = self.config.val_interval;
        let mut run = self.setup_training(tasks, options)?;
        run.tracker.get(&options.stop_metric)?;

        if let Some(manager) = self.checkpoints.as_ref() {
            let phase = options.phase;
            if manager.has_checkpoints(phase)? {
                if options.load_model {
                    let (n_update, should_stop) = self.restore_checkpoint(&mut run, tasks, phase)?;
                    run.n_update = n_update;
                    run.should_stop = should_stop;
                    run.schedule = self.interval_schedule(
                        &run.sample_weights,
                        options,
                        n_update / val_interval,
                    )?;
                    log::info!("Loaded model from checkpoint. Starting at pass {}.", n_update);
                } else {
                    return Err(MetaError::ExistingCheckpoints {
                        dir: manager.dir().display().to_string(),
                        phase: phase.to_string(),
                    });
                }
            } else {
                log::info!("Not loading.");
            }
        }

        log::info!("Beginning training. Stopping metric: {}", options.stop_metric);
        let mut all_tr_metrics = MetricSnapshot::new();
        'training: while !run.should_stop {
            let (src, trg) = run.schedule.pair_at(run.n_update);
            if run.infos[src].stopped || run.infos[trg].stopped {
                // the pairing is skipped; the update counter still advances
                run.n_update += 2;
                if run.n_update % val_interval == 0 {
                    self.end_of_interval(&mut run, tasks, options, &mut all_tr_metrics)?;
                }
                continue;
            }

            for _ in 0..options.n_batches_per_pass.max(1) {
                let outcome = self.train_pair(&mut run, tasks, options, src, trg)?;
                self.log_progress(&mut run, tasks, src, trg, &outcome)?;

                if run.n_update % val_interval == 0 {
                    self.end_of_interval(&mut run, tasks, options, &mut all_tr_metrics)?;
                    if run.should_stop {
                        break 'training;
                    }
                    break;
                }
            }
        }

        log::info!(
            "Stopped training after {} validation checks",
            run.n_update / val_interval
        );
        self.telemetry.flush()?;
        Ok(self.aggregate_results(&run, tasks))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // SETUP
    // ═══════════════════════════════════════════════════════════════════════

    fn setup_training(&self, tasks: &[Task], options: &TrainOptions) -> MetaResult<TrainingRun> {
        let params = self.model.parameters();
        let default_t_max = self.config.max_vals * self.config.val_interval;

        let mut infos = Vec::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            let data = match options.phase {
                Phase::Main => {
                    let n = (task.n_train_examples() as f64 * self.config.training_data_fraction)
                        .ceil() as usize;
                    task.train_data().head(n)?
                }
                Phase::Eval => task.train_data().clone(),
            };
            let stream = BatchStream::new(
                data,
                options.batch_size,
                true,
                options.seed.wrapping_add((i as u64) << 32),
            )?;
            let optim = if options.shared_optimizer {
                None
            } else {
                let optimizer = Optimizer::new(params.vars().to_vec(), &self.config.optimizer);
                let scheduler = LrScheduler::from_config(
                    &self.config.scheduler,
                    optimizer.lr(),
                    task.val_metric_decreases(),
                    default_t_max,
                );
                Some(OptimSlot {
                    optimizer,
                    scheduler,
                })
            };
            infos.push(TaskInfo {
                n_tr_batches: stream.batches_per_pass(),
                stream,
                loss: 0.0,
                total_loss: 0.0,
                n_batches_since_val: 0,
                total_batches_trained: 0,
                stopped: false,
                optim,
                last_log: Instant::now(),
            });
        }

        let task_metrics: Vec<(String, bool)> = tasks
            .iter()
            .map(|t| (t.val_metric(), t.val_metric_decreases()))
            .collect();
        let tracker = MetricTracker::new(&task_metrics, self.config.patience);

        let global = if options.shared_optimizer {
            let optimizer = Optimizer::new(params.vars().to_vec(), &self.config.optimizer);
            let macro_decreases = tasks.len() == 1 && tasks[0].val_metric_decreases();
            let scheduler = LrScheduler::from_config(
                &self.config.scheduler,
                optimizer.lr(),
                macro_decreases,
                default_t_max,
            );
            Some(OptimSlot {
                optimizer,
                scheduler,
            })
        } else {
            None
        };

        let sample_weights = self.setup_task_weighting(options.weighting_method, tasks, &infos)?;
        let schedule = self.interval_schedule(&sample_weights, options, 0)?;

        let shared = SharedParams::from_exclusion_rule(params);
        log::info!(
            "{} of {} parameters are shared across tasks",
            shared.len(),
            params.len()
        );
        let engine = if self.config.slow_params_approx {
            enable_higher_order()?;
            None
        } else {
            Some(MetaGradientEngine::new(params)?)
        };

        Ok(TrainingRun {
            infos,
            tracker,
            global,
            buffer: GradBuffer::new(params.len()),
            shared,
            engine,
            sample_weights,
            schedule,
            n_update: 0,
            should_stop: false,
        })
    }

    /// Pair schedule of validation interval `interval`. The generator is keyed
    /// on `(seed, interval)`, so a resumed run draws what the uninterrupted
    /// run drew.
    fn interval_schedule(
        &self,
        weights: &[f64],
        options: &TrainOptions,
        interval: usize,
    ) -> MetaResult<PairSchedule> {
        draw_schedule(
            options.sampling,
            weights,
            self.config.val_interval,
            &mut interval_rng(options.seed, interval),
        )
    }

    fn setup_task_weighting(
        &self,
        method: WeightingMethod,
        tasks: &[Task],
        infos: &[TaskInfo],
    ) -> MetaResult<Vec<f64>> {
        log::info!("Sampling tasks with weighting method {}", method);
        let sizes: Vec<TaskSize> = tasks
            .iter()
            .zip(infos)
            .map(|(task, info)| TaskSize {
                n_train_examples: task.n_train_examples(),
                n_train_batches: info.n_tr_batches,
            })
            .collect();
        let weights = method.weights(&sizes);
        let normalized = normalize(&weights)?;
        log::info!("Weighting details: ");
        log::info!(
            "\ttask.n_train_examples: {:?}",
            tasks
                .iter()
                .map(|t| (t.name(), t.n_train_examples()))
                .collect::<Vec<_>>()
        );
        log::info!("\tnormalized_sample_weights: {:?}", normalized);
        Ok(normalized)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // UPDATES
    // ═══════════════════════════════════════════════════════════════════════

    fn train_pair(
        &mut self,
        run: &mut TrainingRun,
        tasks: &mut [Task],
        options: &TrainOptions,
        src: usize,
        trg: usize,
    ) -> MetaResult<PairOutcome> {
        let src_batch = run.infos[src].stream.next_batch()?;
        let trg_batch = run.infos[trg].stream.next_batch()?;
        for idx in [src, trg] {
            run.infos[idx].n_batches_since_val += 1;
            run.infos[idx].total_batches_trained += 1;
        }
        run.n_update += 2;
        run.buffer.clear();

        let outcome = if self.config.slow_params_approx {
            self.approx_update(run, tasks, options, (src, &src_batch), (trg, &trg_batch))?
        } else {
            self.exact_update(run, tasks, options, (src, &src_batch), (trg, &trg_batch))?
        };

        tasks[src].update_metrics(&outcome.src_out.logits, &src_batch)?;
        tasks[trg].update_metrics(&outcome.trg_out.logits, &trg_batch)?;
        let src_loss = outcome.src_out.loss_value()?;
        let trg_loss = outcome.trg_out.loss_value()?;
        run.infos[src].loss += src_loss;
        run.infos[src].total_loss += src_loss;
        run.infos[trg].loss += trg_loss;
        run.infos[trg].total_loss += trg_loss;

        if let Some(max_norm) = self.config.max_grad_norm {
            run.buffer.clip_norm(max_norm)?;
        }

        let slot = match run.global.as_mut() {
            Some(global) => global,
            None => run.infos[src].optim.as_mut().ok_or_else(|| {
                MetaError::Config(format!("Task {} has no optimizer", tasks[src].name()))
            })?,
        };
        slot.optimizer.step(&run.buffer)?;
        if !slot.scheduler.is_plateau() {
            slot.scheduler.step_batch(run.n_update, &mut slot.optimizer);
        }

        Ok(outcome)
    }

    fn exact_update(
        &self,
        run: &mut TrainingRun,
        tasks: &[Task],
        options: &TrainOptions,
        (src, src_batch): (usize, &Batch),
        (trg, trg_batch): (usize, &Batch),
    ) -> MetaResult<PairOutcome> {
        let engine = run
            .engine
            .as_ref()
            .ok_or_else(|| MetaError::Config("Meta-gradient engine not initialised".to_string()))?;
        let sim_lr = self.config.sim_lr;

        let forward = engine.compute(
            &self.model,
            &run.shared,
            (&tasks[src], src_batch),
            (&tasks[trg], trg_batch),
            sim_lr,
        )?;

        let (gradients, sim_trajectories, src_out) = if self.config.one_sided_update {
            let sims = if options.multistep_loss {
                vec![vec![forward.sim_grads]]
            } else {
                Vec::new()
            };
            (vec![forward.meta_grads], sims, forward.sim_output)
        } else {
            let backward = engine.compute(
                &self.model,
                &run.shared,
                (&tasks[trg], trg_batch),
                (&tasks[src], src_batch),
                sim_lr,
            )?;
            let sims = if options.multistep_loss {
                vec![vec![forward.sim_grads], vec![backward.sim_grads]]
            } else {
                Vec::new()
            };
            (
                vec![backward.meta_grads, forward.meta_grads],
                sims,
                backward.output,
            )
        };

        assign_gradients(
            &mut run.buffer,
            &run.shared,
            &gradients,
            &sim_trajectories,
            options.multistep_scale,
        )?;

        Ok(PairOutcome {
            src_out,
            trg_out: forward.output,
            approx: None,
        })
    }

    fn approx_update(
        &self,
        run: &mut TrainingRun,
        tasks: &[Task],
        options: &TrainOptions,
        (src, src_batch): (usize, &Batch),
        (trg, trg_batch): (usize, &Batch),
    ) -> MetaResult<PairOutcome> {
        let params = self.model.parameters();
        let shared_tensors = run.shared.tensors(params);

        let trg_out = self.model.forward(&tasks[trg], trg_batch)?;
        let src_out = self.model.forward(&tasks[src], src_batch)?;

        let flat_grads = |out: &ForwardOutput, task: &Task| -> MetaResult<candle_core::Tensor> {
            let store = out.loss.backward()?;
            let grads: Vec<_> = shared_tensors.iter().map(|p| store.get(p).cloned()).collect();
            flatten_with_zeros(&grads, &shared_tensors)?.ok_or_else(|| MetaError::DisconnectedGraph {
                task: task.name().to_string(),
            })
        };
        let trg_grads = flat_grads(&trg_out, &tasks[trg])?;
        let src_grads = flat_grads(&src_out, &tasks[src])?;

        let alignment = alignment_regularizer(
            &trg_grads,
            &src_grads,
            &AlignmentConfig {
                term: self.config.approx_term,
                only_pos_reg: self.config.only_pos_reg,
                max_sim_grad_norm: self.config.max_sim_grad_norm,
            },
        )?;
        let loss = approx_loss(
            &src_out.loss,
            &trg_out.loss,
            &alignment,
            self.config.approx_term,
            self.config.sim_lr,
            options.pseudo_meta,
        )?;
        let grads = loss.backward()?;
        run.buffer.accumulate_store(params, &grads)?;

        let regularizer = alignment
            .regularizer
            .to_dtype(candle_core::DType::F64)?
            .to_scalar::<f64>()?;
        let diagnostics = ApproxDiagnostics {
            gross_loss: src_out.loss_value()? + trg_out.loss_value()?,
            net_loss: loss.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?,
            regularizer,
            cos_sim: alignment.cos_sim,
            trg_norm: alignment.norm1,
            src_norm: alignment.norm2,
        };

        Ok(PairOutcome {
            src_out,
            trg_out,
            approx: Some(diagnostics),
        })
    }

    /// Time-throttled progress report for the pair just trained
    fn log_progress(
        &mut self,
        run: &mut TrainingRun,
        tasks: &mut [Task],
        src: usize,
        trg: usize,
        outcome: &PairOutcome,
    ) -> MetaResult<()> {
        let interval = Duration::from_secs(self.config.log_interval_secs);
        if run.infos[src].last_log.elapsed() < interval {
            return Ok(());
        }
        let n_update = run.n_update;

        for (role, idx) in [("src_task", src), ("trg_task", trg)] {
            let info = &run.infos[idx];
            let nbsv = info.n_batches_since_val.max(1);
            let mut task_metrics = tasks[idx].get_metrics(false);
            let avg_loss = info.loss / nbsv as f64;
            let mut described = task_metrics.clone();
            described.insert(format!("{}_loss", tasks[idx].name()), avg_loss);
            log::info!(
                "Update {}: {} {}, batch {} ({}): {}",
                n_update,
                role,
                tasks[idx].name(),
                info.n_batches_since_val,
                info.total_batches_trained,
                describe_metrics(&described)
            );
            task_metrics.insert("loss".to_string(), avg_loss);
            self.telemetry
                .write_train_metrics(n_update, &task_metrics, tasks[idx].name())?;
        }

        let src_loss = outcome.src_out.loss_value()?;
        let trg_loss = outcome.trg_out.loss_value()?;
        match outcome.approx {
            Some(diag) => {
                log::info!(
                    "\tnet loss: {:.3}, src loss: {:.3}, trg loss: {:.3}",
                    diag.net_loss,
                    src_loss,
                    trg_loss
                );
                log::info!("\tgross loss: {:.3}", diag.gross_loss);
                log::info!(
                    "\tgrad regularizer: {:.5}, cos_sim: {:.5}",
                    diag.regularizer,
                    diag.cos_sim
                );
                log::info!(
                    "\tgrad1 norm: {:.3}, grad2 norm: {:.3}",
                    diag.src_norm,
                    diag.trg_norm
                );
                let t = &mut self.telemetry;
                t.log_scalar(Stream::GrossLoss, "approx/loss", diag.gross_loss, n_update)?;
                t.log_scalar(Stream::Grad, "approx/grad_prod", diag.regularizer, n_update)?;
                t.log_scalar(Stream::NetLoss, "approx/loss", diag.net_loss, n_update)?;
                t.log_scalar(Stream::Grad, "approx/cos_sim", diag.cos_sim, n_update)?;
                t.log_scalar(Stream::Grad1, "approx/grad_mag", diag.src_norm, n_update)?;
                t.log_scalar(Stream::Grad2, "approx/grad_mag", diag.trg_norm, n_update)?;
            }
            None => log::info!(
                "\tupdate loss: {:.3}, src loss {:.3}, trg loss {:.3}",
                src_loss + trg_loss,
                src_loss,
                trg_loss
            ),
        }

        run.infos[src].last_log = Instant::now();
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // VALIDATION AND STOPPING
    // ═══════════════════════════════════════════════════════════════════════

    /// Validate, check stop conditions, report and checkpoint.
    fn end_of_interval(
        &mut self,
        run: &mut TrainingRun,
        tasks: &mut [Task],
        options: &TrainOptions,
        all_tr_metrics: &mut MetricSnapshot,
    ) -> MetaResult<()> {
        let epoch = run.n_update / self.config.val_interval;
        log::info!("***** Pass {} / Epoch {} *****", run.n_update, epoch);

        for (task, info) in tasks.iter_mut().zip(&run.infos) {
            let nbsv = info.n_batches_since_val;
            if nbsv > 0 {
                for (name, value) in task.get_metrics(true) {
                    all_tr_metrics.insert(format!("{}_{}", task.name(), name), value);
                }
                all_tr_metrics.insert(format!("{}_loss", task.name()), info.loss / nbsv as f64);
            } else {
                all_tr_metrics.insert(format!("{}_loss", task.name()), 0.0);
            }
            log::info!(
                "{}: trained on {} batches, {:.3} epochs",
                task.name(),
                nbsv,
                nbsv as f64 / info.n_tr_batches as f64
            );
        }

        log::info!("Validating...");
        let periodic_save = options.phase == Phase::Main;
        let outcome = self.validate(run, tasks, epoch, options.batch_size, periodic_save)?;

        run.should_stop = self.check_stop(run, tasks, epoch, &options.stop_metric)?;

        for (name, value) in &outcome.metrics {
            log::info!("Statistic: {}", name);
            if let Some(train_value) = all_tr_metrics.get(name) {
                log::info!("\ttraining: {:.3}", train_value);
            }
            log::info!("\tvalidation: {:.3}", value);
        }
        self.telemetry.write_val_metrics(run.n_update, &outcome.metrics)?;
        for (name, lr) in self.current_lrs(run, tasks) {
            log::info!("{}: {:.6}", name, lr);
        }

        all_tr_metrics.clear();
        run.schedule = self.interval_schedule(&run.sample_weights, options, epoch)?;

        if outcome.should_save {
            if self.checkpoints.is_some() {
                let state = TrainingState::new(run.n_update, epoch, run.should_stop);
                self.save_checkpoint(run, tasks, options.phase, state, outcome.new_best_macro)?;
            } else {
                log::debug!("No serialization directory; skipping checkpoint for epoch {}", epoch);
            }
        }
        Ok(())
    }

    fn validate(
        &self,
        run: &mut TrainingRun,
        tasks: &mut [Task],
        epoch: usize,
        batch_size: usize,
        periodic_save: bool,
    ) -> MetaResult<ValidationOutcome> {
        let mut metrics = MetricSnapshot::new();
        let mut scores = Vec::with_capacity(tasks.len());
        let log_interval = Duration::from_secs(self.config.log_interval_secs);

        for (task, info) in tasks.iter_mut().zip(run.infos.iter_mut()) {
            let loss_key = format!("{}_loss", task.name());
            let mut total_loss = 0.0;
            let mut n_examples = 0usize;
            let mut batch_num = 0usize;

            let val_data = task.val_data().clone();
            let batches = val_data.eval_batches(batch_size, self.config.val_data_limit);
            let n_val_batches = batches.num_batches();
            for batch in batches {
                let batch = batch?;
                batch_num += 1;
                let out = self.model.forward(task, &batch)?;
                total_loss += out.loss_value()?;
                n_examples += out.n_examples;
                task.update_metrics(&out.logits, &batch)?;

                if info.last_log.elapsed() > log_interval {
                    let mut described = task.get_metrics(false);
                    described.insert(loss_key.clone(), total_loss / batch_num as f64);
                    log::info!(
                        "Batch {}/{}: {}",
                        batch_num,
                        n_val_batches,
                        describe_metrics(&described)
                    );
                    info.last_log = Instant::now();
                }
            }

            for (name, value) in task.get_metrics(true) {
                metrics.insert(format!("{}_{}", task.name(), name), value);
            }
            let avg_loss = if batch_num > 0 {
                total_loss / batch_num as f64
            } else {
                0.0
            };
            metrics.insert(loss_key, avg_loss);
            scores.push(TaskScore {
                value: metrics.get(&task.val_metric()).copied().unwrap_or(0.0),
                decreases: task.val_metric_decreases(),
                n_examples,
            });

            info.n_batches_since_val = 0;
            info.loss = 0.0;
        }

        let (micro, macro_avg) = aggregate_scores(&scores, self.config.dec_val_scale);
        metrics.insert(MICRO_AVG.to_string(), micro);
        metrics.insert(MACRO_AVG.to_string(), macro_avg);

        let mut should_save = periodic_save;
        let mut new_best_macro = false;

        let tracked: Vec<(String, Option<usize>)> = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.val_metric(), Some(i)))
            .chain([(MICRO_AVG.to_string(), None), (MACRO_AVG.to_string(), None)])
            .collect();

        for (metric, task_idx) in tracked {
            let value = metrics.get(&metric).copied().unwrap_or(0.0);
            let label = task_idx.map_or_else(
                || metric.trim_end_matches("_avg").to_string(),
                |i| tasks[i].name().to_string(),
            );
            let Some(outcome) = run.tracker.record(&metric, value, epoch, &metrics)? else {
                continue;
            };
            if outcome.best_so_far {
                log::info!("Best model found for {}.", label);
                should_save = true;
                if metric == MACRO_AVG {
                    new_best_macro = true;
                }
            }
            if outcome.newly_stopped {
                if periodic_save {
                    should_save = true;
                }
                log::info!("Out of patience. Stopped tracking {}", label);
            }

            let slot = match (task_idx, run.global.as_mut()) {
                (Some(i), None) => run.infos[i].optim.as_mut(),
                (None, Some(global)) if metric == MACRO_AVG => Some(global),
                _ => None,
            };
            if let Some(slot) = slot {
                if slot.scheduler.is_plateau() {
                    log::info!("Advancing scheduler.");
                    slot.scheduler.step(value, epoch, &mut slot.optimizer);
                    if let Some(best) = slot.scheduler.best() {
                        log::info!("\tBest {}: {:.3}", metric, best);
                    }
                    log::info!("\t# bad epochs: {}", slot.scheduler.num_bad_epochs());
                }
            }
        }

        Ok(ValidationOutcome {
            metrics,
            should_save,
            new_best_macro,
        })
    }

    fn check_stop(
        &self,
        run: &mut TrainingRun,
        tasks: &[Task],
        epoch: usize,
        stop_metric: &str,
    ) -> MetaResult<bool> {
        let min_lr = self.config.min_lr;
        let stop_tr = match run.global.as_ref() {
            Some(global) => {
                let hit = global.optimizer.lr() < min_lr;
                if hit {
                    log::info!("Minimum lr hit.");
                }
                hit
            }
            None => {
                let mut all_stopped = true;
                for (task, info) in tasks.iter().zip(run.infos.iter_mut()) {
                    if let Some(slot) = info.optim.as_ref() {
                        if slot.optimizer.lr() < min_lr {
                            log::info!("Minimum lr hit on {}.", task.name());
                            info.stopped = true;
                        }
                    }
                    all_stopped &= info.stopped;
                }
                all_stopped
            }
        };
        let stop_val = run.tracker.is_stopped(stop_metric)?;

        let mut should_stop = false;
        if stop_tr {
            should_stop = true;
            log::info!("All tasks hit minimum lr. Stopping training.");
        }
        if stop_val {
            should_stop = true;
            log::info!("All metrics ran out of patience. Stopping training.");
        }
        if epoch >= self.config.max_vals {
            log::info!("Maximum number of validations hit. Stopping training.");
            should_stop = true;
        }
        Ok(should_stop)
    }

    /// Learning rates in use: `global_lr`, or `<task>_lr` per task
    fn current_lrs(&self, run: &TrainingRun, tasks: &[Task]) -> BTreeMap<String, f64> {
        let mut lrs = BTreeMap::new();
        match run.global.as_ref() {
            Some(global) => {
                lrs.insert("global_lr".to_string(), global.optimizer.lr());
            }
            None => {
                for (task, info) in tasks.iter().zip(&run.infos) {
                    if let Some(slot) = info.optim.as_ref() {
                        lrs.insert(format!("{}_lr", task.name()), slot.optimizer.lr());
                    }
                }
            }
        }
        lrs
    }

    fn aggregate_results(&self, run: &TrainingRun, tasks: &[Task]) -> TrainingSummary {
        let best_epoch = |metric: &str| {
            run.tracker
                .get(metric)
                .ok()
                .and_then(|info| info.best.as_ref().map(|b| b.epoch))
        };

        let mut best_epochs = BTreeMap::new();
        let mut batches_trained = BTreeMap::new();
        for (task, info) in tasks.iter().zip(&run.infos) {
            log::info!(
                "Trained {} for {} batches or {:.3} epochs",
                task.name(),
                info.total_batches_trained,
                info.total_batches_trained as f64 / info.n_tr_batches as f64
            );
            best_epochs.insert(task.name().to_string(), best_epoch(&task.val_metric()));
            batches_trained.insert(task.name().to_string(), info.total_batches_trained);
        }
        best_epochs.insert("micro".to_string(), best_epoch(MICRO_AVG));
        best_epochs.insert("macro".to_string(), best_epoch(MACRO_AVG));

        log::info!("***** VALIDATION RESULTS *****");
        for (metric, info) in run.tracker.metrics() {
            match info.best.as_ref() {
                Some(best) => {
                    let all: Vec<String> = best
                        .metrics
                        .iter()
                        .map(|(name, score)| format!("{}: {:.5}", name, score))
                        .collect();
                    log::info!("{}, {}, {}", metric, best.epoch, all.join(", "));
                }
                None => log::info!("{}, -, no validation recorded", metric),
            }
        }

        TrainingSummary {
            best_epochs,
            batches_trained,
            n_update: run.n_update,
            epochs: run.n_update / self.config.val_interval,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // CHECKPOINTS
    // ═══════════════════════════════════════════════════════════════════════

    fn save_checkpoint(
        &self,
        run: &TrainingRun,
        tasks: &[Task],
        phase: Phase,
        training: TrainingState,
        new_best_macro: bool,
    ) -> MetaResult<()> {
        let manager = self.checkpoints.as_ref().ok_or_else(|| {
            MetaError::Config(
                "serialization_dir not specified - cannot save a checkpoint without a directory path"
                    .to_string(),
            )
        })?;

        let mut task_states = TaskStates::default();
        for (task, info) in tasks.iter().zip(&run.infos) {
            let (optimizer, scheduler) = match info.optim.as_ref() {
                Some(slot) => (Some(slot.optimizer.state()?), Some(slot.scheduler.clone())),
                None => (None, None),
            };
            task_states.tasks.insert(
                task.name().to_string(),
                TaskState {
                    total_batches_trained: info.total_batches_trained,
                    stopped: info.stopped,
                    optimizer,
                    scheduler,
                },
            );
        }
        task_states.global = match run.global.as_ref() {
            Some(slot) => GlobalState {
                optimizer: Some(slot.optimizer.state()?),
                scheduler: Some(slot.scheduler.clone()),
            },
            None => GlobalState::default(),
        };

        let epoch = training.epoch;
        let snapshot = Snapshot {
            weights: self.model.parameters().to_named_tensors()?,
            training,
            tasks: task_states,
            metrics: run.tracker.infos().clone(),
        };
        manager.save(phase, epoch, new_best_macro, &snapshot)?;
        Ok(())
    }

    /// Restore the latest checkpoint of `phase` into `run` and the model.
    /// Returns the update counter and stop flag to resume from.
    fn restore_checkpoint(
        &self,
        run: &mut TrainingRun,
        tasks: &[Task],
        phase: Phase,
    ) -> MetaResult<(usize, bool)> {
        let manager = self.checkpoints.as_ref().ok_or_else(|| {
            MetaError::Config(
                "serialization_dir not specified - cannot restore a model without a directory path"
                    .to_string(),
            )
        })?;
        let (_, snapshot) = manager.load_latest(phase, &self.device)?;

        apply_weights(self.model.parameters(), &snapshot.weights)?;

        for (name, state) in &snapshot.tasks.tasks {
            let Some(idx) = tasks.iter().position(|t| t.name() == name) else {
                log::warn!("Checkpoint has state for unknown task {}", name);
                continue;
            };
            let info = &mut run.infos[idx];
            info.total_batches_trained = state.total_batches_trained;
            info.stopped = state.stopped;
            if let Some(slot) = info.optim.as_mut() {
                if let Some(opt_state) = state.optimizer.as_ref() {
                    slot.optimizer.load_state(opt_state)?;
                }
                if let Some(sched) = state.scheduler.as_ref() {
                    slot.scheduler = sched.clone();
                }
            }
            let skipped = info.stream.fast_forward(info.total_batches_trained);
            log::debug!("{}: skipped {} batches to resume mid-pass", name, skipped);
        }

        if let Some(slot) = run.global.as_mut() {
            if let Some(opt_state) = snapshot.tasks.global.optimizer.as_ref() {
                slot.optimizer.load_state(opt_state)?;
            }
            if let Some(sched) = snapshot.tasks.global.scheduler.as_ref() {
                slot.scheduler = sched.clone();
            }
        }

        run.tracker.restore(snapshot.metrics);
        Ok((snapshot.training.n_update, snapshot.training.should_stop))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Dataset;
    use crate::model::{MlpConfig, MultiTaskMlp};
    use crate::task::{MetricKind, TaskKind};

    fn tasks(n: usize) -> Vec<Task> {
        let device = Device::Cpu;
        (0..n)
            .map(|i| {
                let train = Dataset::synthetic_regression(24, 4, i as u64, &device).unwrap();
                let val = Dataset::synthetic_regression(8, 4, 100 + i as u64, &device).unwrap();
                Task::new(format!("t{}", i), TaskKind::Regression, MetricKind::Mse, train, val)
                    .unwrap()
            })
            .collect()
    }

    fn trainer(tasks: &[Task]) -> MetaMultiTaskTrainer<MultiTaskMlp> {
        let config = MlpConfig {
            input_dim: 4,
            hidden_dim: 6,
            n_layers: 1,
        };
        let model = MultiTaskMlp::new(&config, tasks, &Device::Cpu).unwrap();
        MetaMultiTaskTrainer::new(model, TrainerConfig::quick(), None, Device::Cpu).unwrap()
    }

    fn options() -> TrainOptions {
        TrainOptions {
            batch_size: 8,
            ..TrainOptions::default()
        }
    }

    #[test]
    fn test_odd_val_interval_rejected() {
        let tasks = tasks(2);
        let mlp = MlpConfig {
            input_dim: 4,
            ..MlpConfig::default()
        };
        let model = MultiTaskMlp::new(&mlp, &tasks, &Device::Cpu).unwrap();
        let config = TrainerConfig {
            val_interval: 3,
            ..TrainerConfig::quick()
        };
        assert!(matches!(
            MetaMultiTaskTrainer::new(model, config, None, Device::Cpu),
            Err(MetaError::Config(_))
        ));
    }

    #[test]
    fn test_single_task_rejected() {
        let mut tasks = tasks(1);
        let mut trainer = trainer(&tasks);
        assert!(matches!(
            trainer.train(&mut tasks, &options()),
            Err(MetaError::Config(_))
        ));
    }

    #[test]
    fn test_unknown_stop_metric_rejected() {
        let mut tasks = tasks(2);
        let mut trainer = trainer(&tasks);
        let options = TrainOptions {
            stop_metric: "nope_avg".to_string(),
            ..options()
        };
        assert!(trainer.train(&mut tasks, &options).is_err());
    }

    #[test]
    fn test_runs_to_max_vals_without_directory() {
        let mut tasks = tasks(2);
        let mut trainer = trainer(&tasks);
        let summary = trainer.train(&mut tasks, &options()).unwrap();

        // val_interval 4 and max_vals 3: two batch pairs per validation
        assert_eq!(summary.epochs, 3);
        assert_eq!(summary.n_update, 12);
        assert_eq!(summary.batches_trained["t0"], 6);
        assert_eq!(summary.batches_trained["t1"], 6);
        assert!(summary.best_epochs["macro"].is_some());
        assert!(trainer.checkpoints().is_none());
    }
}
