//! # Training Checkpoints
//!
//! Save and restore a complete training snapshot, one lineage per phase.
//!
//! ## File Format
//!
//! Every save writes four coupled files into the serialization directory:
//! - `model_state_<phase>_epoch_<n>[.best_macro].safetensors` - trainable weights
//! - `training_state_<phase>_epoch_<n>[.best_macro].json` - update count, epoch, stop flag
//! - `task_state_<phase>_epoch_<n>[.best_macro].json` - task progress, optimizer/scheduler state
//! - `metric_state_<phase>_epoch_<n>[.best_macro].json` - metric histories
//!
//! `manifest_<phase>.json` lists the snapshots of a phase as structured
//! records and is rewritten atomically after the files are on disk. Restore
//! only consults the manifest.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use metatrain::checkpoint::CheckpointManager;
//!
//! let manager = CheckpointManager::new("runs/exp1", false)?;
//! manager.save(Phase::Main, epoch, new_best_macro, &snapshot)?;
//! let restored = manager.load_latest(Phase::Main, &device)?;
//! ```

use candle_core::{Device, Tensor};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Phase;
use crate::error::MetaError;
use crate::optim::{LrScheduler, OptimizerState};
use crate::params::ParamVector;
use crate::tracker::MetricInfo;
use crate::MetaResult;

const BEST_MARKER: &str = ".best_macro";

// ═══════════════════════════════════════════════════════════════════════════
// SNAPSHOT CONTENTS
// ═══════════════════════════════════════════════════════════════════════════

/// Scalar training progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Update counter (advances by two per batch pair)
    pub n_update: usize,
    pub epoch: usize,
    pub should_stop: bool,
    pub timestamp: String,
    pub version: String,
}

impl TrainingState {
    pub fn new(n_update: usize, epoch: usize, should_stop: bool) -> Self {
        Self {
            n_update,
            epoch,
            should_stop,
            timestamp: chrono::Local::now().to_rfc3339(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Progress of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub total_batches_trained: usize,
    pub stopped: bool,
    /// Present only when tasks own their optimizers
    pub optimizer: Option<OptimizerState>,
    pub scheduler: Option<LrScheduler>,
}

/// Shared optimizer/scheduler state, absent when tasks own their optimizers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalState {
    pub optimizer: Option<OptimizerState>,
    pub scheduler: Option<LrScheduler>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStates {
    pub tasks: BTreeMap<String, TaskState>,
    pub global: GlobalState,
}

/// One logical snapshot
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub weights: HashMap<String, Tensor>,
    pub training: TrainingState,
    pub tasks: TaskStates,
    pub metrics: BTreeMap<String, MetricInfo>,
}

// ═══════════════════════════════════════════════════════════════════════════
// MANIFEST
// ═══════════════════════════════════════════════════════════════════════════

/// File names of one snapshot, relative to the serialization directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointFiles {
    pub model: String,
    pub training_state: String,
    pub task_state: String,
    pub metric_state: String,
}

impl CheckpointFiles {
    fn named(phase: Phase, epoch: usize, is_best: bool) -> Self {
        let marker = if is_best { BEST_MARKER } else { "" };
        let stem = |kind: &str, ext: &str| format!("{}_{}_epoch_{}{}.{}", kind, phase, epoch, marker, ext);
        Self {
            model: stem("model_state", "safetensors"),
            training_state: stem("training_state", "json"),
            task_state: stem("task_state", "json"),
            metric_state: stem("metric_state", "json"),
        }
    }

    fn all(&self) -> [&str; 4] {
        [
            &self.model,
            &self.training_state,
            &self.task_state,
            &self.metric_state,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub phase: Phase,
    pub epoch: usize,
    pub is_best: bool,
    pub files: CheckpointFiles,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub phase: Phase,
    /// Sorted by epoch
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    fn empty(phase: Phase) -> Self {
        Self {
            phase,
            entries: Vec::new(),
        }
    }

    pub fn latest(&self) -> Option<&ManifestEntry> {
        self.entries.iter().max_by_key(|e| e.epoch)
    }

    pub fn best(&self) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.is_best)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// MANAGER
// ═══════════════════════════════════════════════════════════════════════════

/// Reads and writes snapshots in one serialization directory
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    keep_all: bool,
}

impl CheckpointManager {
    pub fn new(dir: impl AsRef<Path>, keep_all: bool) -> MetaResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, keep_all })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn manifest_path(&self, phase: Phase) -> PathBuf {
        self.dir.join(format!("manifest_{}.json", phase))
    }

    /// Manifest of `phase`; empty when none was written yet.
    pub fn manifest(&self, phase: Phase) -> MetaResult<Manifest> {
        let path = self.manifest_path(phase);
        if !path.exists() {
            return Ok(Manifest::empty(phase));
        }
        read_json(&path)
    }

    fn write_manifest(&self, manifest: &Manifest) -> MetaResult<()> {
        write_json_atomic(&self.manifest_path(manifest.phase), manifest)
    }

    /// Whether any snapshot of `phase` is on disk, listed or not.
    pub fn has_checkpoints(&self, phase: Phase) -> MetaResult<bool> {
        if !self.manifest(phase)?.entries.is_empty() {
            return Ok(true);
        }
        let needle = format!("_state_{}_epoch_", phase);
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            if name.to_string_lossy().contains(&needle) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Write `snapshot` as the checkpoint of `epoch`, then move the best
    /// marker and prune old checkpoints.
    pub fn save(
        &self,
        phase: Phase,
        epoch: usize,
        is_best: bool,
        snapshot: &Snapshot,
    ) -> MetaResult<ManifestEntry> {
        let files = CheckpointFiles::named(phase, epoch, is_best);

        let model_path = self.dir.join(&files.model);
        let model_tmp = temp_path(&model_path);
        candle_core::safetensors::save(&snapshot.weights, &model_tmp)?;
        fs::rename(&model_tmp, &model_path)?;
        write_json_atomic(&self.dir.join(&files.training_state), &snapshot.training)?;
        write_json_atomic(&self.dir.join(&files.task_state), &snapshot.tasks)?;
        write_json_atomic(&self.dir.join(&files.metric_state), &snapshot.metrics)?;

        let mut manifest = self.manifest(phase)?;
        let entry = ManifestEntry {
            phase,
            epoch,
            is_best,
            files,
        };

        // files are only moved or deleted once the manifest no longer
        // lists them under their old names
        let mut renames = Vec::new();
        let mut stale = Vec::new();

        // a re-save of the same epoch replaces the old record
        if let Some(pos) = manifest.entries.iter().position(|e| e.epoch == epoch) {
            let old = manifest.entries.remove(pos);
            if old.files != entry.files {
                stale.push(old.files);
            }
        }

        if is_best {
            for previous in manifest.entries.iter_mut().filter(|e| e.is_best) {
                let unmarked = CheckpointFiles::named(phase, previous.epoch, false);
                renames.push((previous.files.clone(), unmarked.clone()));
                previous.files = unmarked;
                previous.is_best = false;
            }
        }

        manifest.entries.push(entry.clone());
        manifest.entries.sort_by_key(|e| e.epoch);

        if !self.keep_all {
            let (kept, dropped): (Vec<_>, Vec<_>) = manifest
                .entries
                .into_iter()
                .partition(|e| e.is_best || e.epoch == epoch);
            manifest.entries = kept;
            for old in dropped {
                // an unmarked best that is dropped was never renamed
                match renames.iter().position(|(_, to)| *to == old.files) {
                    Some(pos) => stale.push(renames.remove(pos).0),
                    None => stale.push(old.files),
                }
            }
        }

        self.write_manifest(&manifest)?;

        for (from, to) in &renames {
            for (a, b) in from.all().iter().zip(to.all()) {
                fs::rename(self.dir.join(a), self.dir.join(b))?;
            }
        }
        for files in &stale {
            self.remove_files(files);
        }
        log::info!("Saved {} checkpoint for epoch {} to {:?}", phase, epoch, self.dir);
        Ok(entry)
    }

    fn remove_files(&self, files: &CheckpointFiles) {
        for name in files.all() {
            if let Err(e) = fs::remove_file(self.dir.join(name)) {
                log::warn!("Could not delete old checkpoint file {}: {}", name, e);
            }
        }
    }

    /// Load the highest-epoch snapshot of `phase`.
    ///
    /// All four files must exist; anything less is `MissingCheckpoint`.
    pub fn load_latest(&self, phase: Phase, device: &Device) -> MetaResult<(ManifestEntry, Snapshot)> {
        let missing = |reason: String| MetaError::MissingCheckpoint {
            dir: self.dir.display().to_string(),
            phase: phase.to_string(),
            reason,
        };

        let manifest = self.manifest(phase)?;
        let entry = manifest
            .latest()
            .cloned()
            .ok_or_else(|| missing("no checkpoint listed in the manifest".to_string()))?;

        // a save interrupted after its manifest write leaves some files
        // under the other best marking
        let other = CheckpointFiles::named(phase, entry.epoch, !entry.is_best);
        let mut paths = Vec::with_capacity(4);
        for (name, alt) in entry.files.all().into_iter().zip(other.all()) {
            let path = [name, alt]
                .into_iter()
                .map(|n| self.dir.join(n))
                .find(|p| p.exists())
                .ok_or_else(|| missing(format!("file {} is missing", name)))?;
            paths.push(path);
        }

        let weights = candle_core::safetensors::load(&paths[0], device)?;
        let training: TrainingState = read_json(&paths[1])?;
        let tasks: TaskStates = read_json(&paths[2])?;
        let metrics: BTreeMap<String, MetricInfo> = read_json(&paths[3])?;

        if training.epoch != entry.epoch {
            return Err(missing(format!(
                "training state is for epoch {}, manifest says {}",
                training.epoch, entry.epoch
            )));
        }

        log::info!("Found checkpoint {} epoch {}. Loading.", phase, entry.epoch);
        Ok((
            entry,
            Snapshot {
                weights,
                training,
                tasks,
                metrics,
            },
        ))
    }
}

/// Copy checkpointed weights into `params`.
///
/// Parameters absent from `weights` keep their current values and are
/// reported with a warning. Returns their names.
pub fn apply_weights(
    params: &ParamVector,
    weights: &HashMap<String, Tensor>,
) -> MetaResult<Vec<String>> {
    let mut missing = Vec::new();
    for (name, var) in params.names().iter().zip(params.vars()) {
        match weights.get(name) {
            Some(value) => {
                if value.dims() != var.dims() {
                    return Err(MetaError::ShapeMismatch {
                        name: name.clone(),
                        expected: var.dims().to_vec(),
                        got: value.dims().to_vec(),
                    });
                }
                var.set(&value.to_dtype(var.dtype())?.to_device(var.device())?)?;
            }
            None => {
                log::warn!("Parameter missing from checkpoint: {}", name);
                missing.push(name.clone());
            }
        }
    }
    Ok(missing)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> MetaResult<()> {
    let tmp = temp_path(path);
    fs::write(&tmp, serde_json::to_string_pretty(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> MetaResult<T> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}
