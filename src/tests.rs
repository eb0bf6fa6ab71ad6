//! Integration Tests for Meta Multi-Task Training
//!
//! End-to-end runs of the trainer over small synthetic tasks.

use crate::checkpoint::CheckpointManager;
use crate::config::{ApproxTerm, Phase, TrainOptions, TrainerConfig};
use crate::dataset::Dataset;
use crate::error::MetaError;
use crate::model::{MetaModel, MlpConfig, MultiTaskMlp};
use crate::sampler::SamplingSchedule;
use crate::task::{MetricKind, Task, TaskKind};
use crate::training::MetaMultiTaskTrainer;
use candle_core::Device;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn regression_task(name: &str, seed: u64) -> Task {
    let device = Device::Cpu;
    let train = Dataset::synthetic_regression(24, 4, seed, &device).unwrap();
    let val = Dataset::synthetic_regression(10, 4, seed + 50, &device).unwrap();
    Task::new(name, TaskKind::Regression, MetricKind::Mse, train, val).unwrap()
}

fn classification_task(name: &str, seed: u64) -> Task {
    let device = Device::Cpu;
    let train = Dataset::synthetic_classification(24, 4, 3, seed, &device).unwrap();
    let val = Dataset::synthetic_classification(10, 4, 3, seed + 50, &device).unwrap();
    Task::new(
        name,
        TaskKind::Classification { n_classes: 3 },
        MetricKind::Accuracy,
        train,
        val,
    )
    .unwrap()
}

fn mixed_tasks() -> Vec<Task> {
    vec![regression_task("sts", 1), classification_task("nli", 2)]
}

fn model(tasks: &[Task]) -> MultiTaskMlp {
    let config = MlpConfig {
        input_dim: 4,
        hidden_dim: 6,
        n_layers: 1,
    };
    MultiTaskMlp::new(&config, tasks, &Device::Cpu).unwrap()
}

fn options() -> TrainOptions {
    TrainOptions {
        batch_size: 8,
        ..TrainOptions::default()
    }
}

fn flat_weights(model: &MultiTaskMlp) -> Vec<f32> {
    model
        .parameters()
        .snapshot()
        .iter()
        .flat_map(|t| t.flatten_all().unwrap().to_vec1::<f32>().unwrap())
        .collect()
}

fn count_marked(dir: &Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .contains(".best_macro")
        })
        .count()
}

// ═══════════════════════════════════════════════════════════════════════════
// EXACT META-GRADIENT RUNS
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod exact_tests {
    use super::*;

    #[test]
    fn test_exact_run_updates_parameters() {
        let mut tasks = mixed_tasks();
        let mut trainer =
            MetaMultiTaskTrainer::new(model(&tasks), TrainerConfig::quick(), None, Device::Cpu)
                .unwrap();
        let before = flat_weights(trainer.model());

        let summary = trainer.train(&mut tasks, &options()).unwrap();
        let after = flat_weights(trainer.model());

        assert_eq!(summary.epochs, 3);
        assert_eq!(summary.batches_trained["sts"], 6);
        assert_eq!(summary.batches_trained["nli"], 6);
        assert!(before.iter().zip(&after).any(|(a, b)| a != b));
        assert!(after.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_one_sided_with_multistep_loss() {
        let mut tasks = mixed_tasks();
        let config = TrainerConfig {
            one_sided_update: true,
            max_grad_norm: Some(1.0),
            ..TrainerConfig::quick()
        };
        let mut trainer =
            MetaMultiTaskTrainer::new(model(&tasks), config, None, Device::Cpu).unwrap();
        let options = TrainOptions {
            multistep_loss: true,
            multistep_scale: 0.5,
            ..options()
        };
        let summary = trainer.train(&mut tasks, &options).unwrap();
        assert_eq!(summary.n_update, 12);
        assert!(flat_weights(trainer.model()).iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_per_task_optimizers_and_weighted_sampling() {
        let mut tasks = vec![
            regression_task("a", 3),
            regression_task("b", 4),
            classification_task("c", 5),
        ];
        let mut trainer =
            MetaMultiTaskTrainer::new(model(&tasks), TrainerConfig::quick(), None, Device::Cpu)
                .unwrap();
        let options = TrainOptions {
            shared_optimizer: false,
            sampling: SamplingSchedule::Weighted,
            ..options()
        };
        let summary = trainer.train(&mut tasks, &options).unwrap();

        // every pair trains one batch of each side
        let total: usize = summary.batches_trained.values().sum();
        assert_eq!(total, 12);
        assert_eq!(summary.epochs, 3);
    }

    #[test]
    fn test_min_lr_stops_after_first_validation() {
        for shared_optimizer in [true, false] {
            let mut tasks = mixed_tasks();
            let config = TrainerConfig {
                min_lr: 1.0,
                ..TrainerConfig::quick()
            };
            let mut trainer =
                MetaMultiTaskTrainer::new(model(&tasks), config, None, Device::Cpu).unwrap();
            let options = TrainOptions {
                shared_optimizer,
                ..options()
            };
            let summary = trainer.train(&mut tasks, &options).unwrap();
            assert_eq!(summary.epochs, 1, "shared optimizer: {}", shared_optimizer);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// APPROXIMATION RUNS
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod approx_tests {
    use super::*;

    #[test]
    fn test_every_alignment_term_trains() {
        for term in [
            ApproxTerm::CosSim,
            ApproxTerm::SignCosSim,
            ApproxTerm::DotProduct,
            ApproxTerm::OnlyCosSim,
        ] {
            let mut tasks = mixed_tasks();
            let config = TrainerConfig {
                slow_params_approx: true,
                approx_term: term,
                max_sim_grad_norm: Some(0.5),
                ..TrainerConfig::quick()
            };
            let mut trainer =
                MetaMultiTaskTrainer::new(model(&tasks), config, None, Device::Cpu).unwrap();
            let before = flat_weights(trainer.model());
            let summary = trainer.train(&mut tasks, &options()).unwrap();
            let after = flat_weights(trainer.model());

            assert_eq!(summary.epochs, 3, "{:?}", term);
            assert!(before.iter().zip(&after).any(|(a, b)| a != b), "{:?}", term);
            assert!(after.iter().all(|v| v.is_finite()), "{:?}", term);
        }
    }

    #[test]
    fn test_pseudo_meta_writes_approx_streams() {
        let tmp = TempDir::new().unwrap();
        let mut tasks = mixed_tasks();
        let config = TrainerConfig {
            slow_params_approx: true,
            ..TrainerConfig::quick()
        };
        let mut trainer = MetaMultiTaskTrainer::new(
            model(&tasks),
            config,
            Some(tmp.path().to_path_buf()),
            Device::Cpu,
        )
        .unwrap();
        let options = TrainOptions {
            pseudo_meta: true,
            ..options()
        };
        trainer.train(&mut tasks, &options).unwrap();

        for stream in ["train", "val", "grad", "gross_loss", "net_loss", "grad1", "grad2"] {
            assert!(tmp.path().join("tensorboard").join(stream).is_dir(), "{}", stream);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CHECKPOINT RUNS
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod checkpoint_tests {
    use super::*;

    fn dir_trainer(tasks: &[Task], dir: &Path, config: TrainerConfig) -> MetaMultiTaskTrainer<MultiTaskMlp> {
        MetaMultiTaskTrainer::new(model(tasks), config, Some(dir.to_path_buf()), Device::Cpu)
            .unwrap()
    }

    #[test]
    fn test_run_leaves_one_best_and_latest() {
        let tmp = TempDir::new().unwrap();
        let mut tasks = mixed_tasks();
        let mut trainer = dir_trainer(&tasks, tmp.path(), TrainerConfig::quick());
        trainer.train(&mut tasks, &options()).unwrap();

        let manager = CheckpointManager::new(tmp.path(), false).unwrap();
        let manifest = manager.manifest(Phase::Main).unwrap();
        assert_eq!(manifest.entries.iter().filter(|e| e.is_best).count(), 1);
        assert_eq!(manifest.latest().unwrap().epoch, 3);
        assert!(manifest.entries.len() <= 2);
        assert_eq!(count_marked(tmp.path()), 4);
    }

    #[test]
    fn test_existing_checkpoints_conflict() {
        let tmp = TempDir::new().unwrap();
        let mut tasks = mixed_tasks();
        dir_trainer(&tasks, tmp.path(), TrainerConfig::quick())
            .train(&mut tasks, &options())
            .unwrap();

        let mut second = dir_trainer(&tasks, tmp.path(), TrainerConfig::quick());
        let options = TrainOptions {
            load_model: false,
            ..options()
        };
        assert!(matches!(
            second.train(&mut tasks, &options),
            Err(MetaError::ExistingCheckpoints { .. })
        ));

        // the eval phase has its own lineage
        let eval = TrainOptions {
            phase: Phase::Eval,
            ..options
        };
        second.train(&mut tasks, &eval).unwrap();
        let manager = CheckpointManager::new(tmp.path(), false).unwrap();
        assert!(manager.has_checkpoints(Phase::Eval).unwrap());
        assert_eq!(manager.manifest(Phase::Main).unwrap().latest().unwrap().epoch, 3);
    }

    #[test]
    fn test_resuming_finished_run_trains_nothing() {
        let tmp = TempDir::new().unwrap();
        let mut tasks = mixed_tasks();
        let mut first = dir_trainer(&tasks, tmp.path(), TrainerConfig::quick());
        first.train(&mut tasks, &options()).unwrap();
        let trained = flat_weights(first.model());

        let mut second = dir_trainer(&tasks, tmp.path(), TrainerConfig::quick());
        let summary = second.train(&mut tasks, &options()).unwrap();

        assert_eq!(summary.n_update, 12);
        assert_eq!(summary.batches_trained["sts"], 6);
        assert_eq!(flat_weights(second.model()), trained);
    }

    /// Drop manifest entries from `epoch` on, so the latest snapshot is mid-run
    fn rewind_manifest(dir: &Path, epoch: usize) {
        let manager = CheckpointManager::new(dir, true).unwrap();
        let mut manifest = manager.manifest(Phase::Main).unwrap();
        manifest.entries.retain(|e| e.epoch < epoch);
        fs::write(
            dir.join("manifest_main.json"),
            serde_json::to_string(&manifest).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_resume_matches_uninterrupted_run() {
        let tmp = TempDir::new().unwrap();
        let config = TrainerConfig {
            keep_all_checkpoints: true,
            ..TrainerConfig::quick()
        };
        let mut tasks = mixed_tasks();
        let mut first = dir_trainer(&tasks, tmp.path(), config.clone());
        first.train(&mut tasks, &options()).unwrap();
        let uninterrupted = flat_weights(first.model());

        rewind_manifest(tmp.path(), 3);

        let mut tasks = mixed_tasks();
        let mut second = dir_trainer(&tasks, tmp.path(), config);
        let summary = second.train(&mut tasks, &options()).unwrap();
        let resumed = flat_weights(second.model());

        assert_eq!(summary.n_update, 12);
        assert_eq!(summary.batches_trained["sts"], 6);
        for (a, b) in uninterrupted.iter().zip(&resumed) {
            assert!((a - b).abs() < 1e-5, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_weighted_resume_matches_uninterrupted_run() {
        let three_tasks = || {
            vec![
                regression_task("a", 3),
                regression_task("b", 4),
                classification_task("c", 5),
            ]
        };
        let tmp = TempDir::new().unwrap();
        let config = TrainerConfig {
            keep_all_checkpoints: true,
            max_vals: 4,
            ..TrainerConfig::quick()
        };
        let options = TrainOptions {
            sampling: SamplingSchedule::Weighted,
            seed: 7,
            ..options()
        };

        let mut tasks = three_tasks();
        let mut first = dir_trainer(&tasks, tmp.path(), config.clone());
        let full = first.train(&mut tasks, &options).unwrap();
        let uninterrupted = flat_weights(first.model());

        rewind_manifest(tmp.path(), 3);

        let mut tasks = three_tasks();
        let mut second = dir_trainer(&tasks, tmp.path(), config);
        let summary = second.train(&mut tasks, &options).unwrap();
        let resumed = flat_weights(second.model());

        assert_eq!(summary.n_update, full.n_update);
        assert_eq!(summary.batches_trained, full.batches_trained);
        for (a, b) in uninterrupted.iter().zip(&resumed) {
            assert!((a - b).abs() < 1e-5, "{} vs {}", a, b);
        }
    }
}
