//! # Metric Tracking
//!
//! History, best-so-far and patience bookkeeping for every tracked metric:
//! each task's validation metric plus the `micro_avg` and `macro_avg`
//! aggregates.
//!
//! ## Rules
//!
//! - A value is *best so far* when it equals the best value of the history
//!   (min or max, per direction). The value just recorded is the newest
//!   entry, so ties go to the newest occurrence.
//! - A metric runs *out of patience* when the first occurrence of its best
//!   value sits at index `<= len - (patience + 2)`. Matching the best again
//!   does not count as an improvement.
//! - `stopped` is sticky; stopped metrics ignore further records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::MetaError;
use crate::MetaResult;

pub const MICRO_AVG: &str = "micro_avg";
pub const MACRO_AVG: &str = "macro_avg";

/// Every validation value of one epoch, keyed by metric name
pub type MetricSnapshot = BTreeMap<String, f64>;

/// Epoch and full snapshot of the best result so far
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestRecord {
    pub epoch: usize,
    pub metrics: MetricSnapshot,
}

/// Tracking state of one metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricInfo {
    pub hist: Vec<f64>,
    pub stopped: bool,
    pub best: Option<BestRecord>,
    pub decreases: bool,
}

impl MetricInfo {
    pub fn new(decreases: bool) -> Self {
        Self {
            hist: Vec::new(),
            stopped: false,
            best: None,
            decreases,
        }
    }
}

/// Result of checking a history after a new value was appended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryCheck {
    pub best_so_far: bool,
    pub out_of_patience: bool,
}

/// Check `history`, whose last entry is the value just recorded.
pub fn check_history(history: &[f64], decreases: bool, patience: usize) -> HistoryCheck {
    let Some(&current) = history.last() else {
        return HistoryCheck {
            best_so_far: false,
            out_of_patience: false,
        };
    };
    let best = if decreases {
        history.iter().copied().fold(f64::INFINITY, f64::min)
    } else {
        history.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    };
    let best_so_far = current == best;

    let first_best = history.iter().position(|&v| v == best).unwrap_or(0);
    let out_of_patience = first_best + patience + 2 <= history.len();

    HistoryCheck {
        best_so_far,
        out_of_patience,
    }
}

/// Per-task inputs to the aggregate scores
#[derive(Debug, Clone, Copy)]
pub struct TaskScore {
    pub value: f64,
    pub decreases: bool,
    pub n_examples: usize,
}

/// `(micro_avg, macro_avg)` over the task scores.
///
/// With more than one task, decreasing metrics are remapped to the goodness
/// `1 - value / dec_val_scale` first. A single task contributes its raw value.
pub fn aggregate_scores(scores: &[TaskScore], dec_val_scale: f64) -> (f64, f64) {
    if scores.is_empty() {
        return (0.0, 0.0);
    }
    let multi_task = scores.len() > 1;
    let mut weighted = 0.0;
    let mut plain = 0.0;
    let mut n_total = 0usize;
    for score in scores {
        let goodness = if score.decreases && multi_task {
            1.0 - score.value / dec_val_scale
        } else {
            score.value
        };
        weighted += goodness * score.n_examples as f64;
        plain += goodness;
        n_total += score.n_examples;
    }
    let micro = if n_total > 0 {
        weighted / n_total as f64
    } else {
        0.0
    };
    (micro, plain / scores.len() as f64)
}

/// Outcome of recording a value for one metric
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOutcome {
    pub best_so_far: bool,
    /// The metric ran out of patience with this record
    pub newly_stopped: bool,
}

/// Tracking state of every metric of a training run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricTracker {
    patience: usize,
    infos: BTreeMap<String, MetricInfo>,
}

impl MetricTracker {
    /// Track `(metric, decreases)` pairs plus the two aggregates.
    ///
    /// The aggregates decrease only when a single task's metric decreases.
    pub fn new(task_metrics: &[(String, bool)], patience: usize) -> Self {
        let mut infos = BTreeMap::new();
        for (name, decreases) in task_metrics {
            infos.insert(name.clone(), MetricInfo::new(*decreases));
        }
        let aggregate_decreases = task_metrics.len() == 1 && task_metrics[0].1;
        infos.insert(MICRO_AVG.to_string(), MetricInfo::new(aggregate_decreases));
        infos.insert(MACRO_AVG.to_string(), MetricInfo::new(aggregate_decreases));
        Self { patience, infos }
    }

    pub fn patience(&self) -> usize {
        self.patience
    }

    pub fn metrics(&self) -> impl Iterator<Item = (&String, &MetricInfo)> {
        self.infos.iter()
    }

    pub fn get(&self, metric: &str) -> MetaResult<&MetricInfo> {
        self.infos
            .get(metric)
            .ok_or_else(|| MetaError::Config(format!("Unknown metric '{}'", metric)))
    }

    pub fn is_stopped(&self, metric: &str) -> MetaResult<bool> {
        Ok(self.get(metric)?.stopped)
    }

    /// Record `value` for `metric` at `epoch`. Returns `None` when the metric
    /// is already stopped.
    pub fn record(
        &mut self,
        metric: &str,
        value: f64,
        epoch: usize,
        snapshot: &MetricSnapshot,
    ) -> MetaResult<Option<RecordOutcome>> {
        let patience = self.patience;
        let info = self
            .infos
            .get_mut(metric)
            .ok_or_else(|| MetaError::Config(format!("Unknown metric '{}'", metric)))?;
        if info.stopped {
            return Ok(None);
        }
        info.hist.push(value);
        let check = check_history(&info.hist, info.decreases, patience);
        if check.best_so_far {
            info.best = Some(BestRecord {
                epoch,
                metrics: snapshot.clone(),
            });
        }
        if check.out_of_patience {
            info.stopped = true;
        }
        Ok(Some(RecordOutcome {
            best_so_far: check.best_so_far,
            newly_stopped: check.out_of_patience,
        }))
    }

    /// Replace histories, stop flags and best records with checkpointed ones.
    /// Metrics not present in `infos` keep their current state.
    pub fn restore(&mut self, infos: BTreeMap<String, MetricInfo>) {
        for (name, info) in infos {
            match self.infos.get_mut(&name) {
                Some(current) => *current = info,
                None => log::warn!("Ignoring checkpointed state of untracked metric {}", name),
            }
        }
    }

    pub fn infos(&self) -> &BTreeMap<String, MetricInfo> {
        &self.infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_so_far_prefers_newest_tie() {
        assert!(check_history(&[0.5, 0.9, 0.9], false, 2).best_so_far);
        assert!(check_history(&[0.9], false, 2).best_so_far);
        assert!(!check_history(&[0.9, 0.9, 0.5], false, 2).best_so_far);
        assert!(check_history(&[3.0, 1.0], true, 2).best_so_far);
    }

    #[test]
    fn test_patience_boundary() {
        // patience 1: stopped iff first best index <= len - 3
        assert!(!check_history(&[0.9, 0.5], false, 1).out_of_patience);
        assert!(check_history(&[0.9, 0.5, 0.5], false, 1).out_of_patience);
        assert!(!check_history(&[0.5, 0.9, 0.5], false, 1).out_of_patience);
        // matching the best is not an improvement
        assert!(check_history(&[0.9, 0.9, 0.9], false, 1).out_of_patience);
    }

    #[test]
    fn test_patience_property_exhaustive() {
        let values = [0.1, 0.5, 0.9];
        for patience in 0..3 {
            for len in 1..6usize {
                let total = 3usize.pow(len as u32);
                for code in 0..total {
                    let mut c = code;
                    let hist: Vec<f64> = (0..len)
                        .map(|_| {
                            let v = values[c % 3];
                            c /= 3;
                            v
                        })
                        .collect();
                    for decreases in [false, true] {
                        let best = if decreases {
                            hist.iter().copied().fold(f64::INFINITY, f64::min)
                        } else {
                            hist.iter().copied().fold(f64::NEG_INFINITY, f64::max)
                        };
                        let idx = hist.iter().position(|&v| v == best).unwrap() as i64;
                        let expected = idx <= len as i64 - (patience as i64 + 2);
                        assert_eq!(
                            check_history(&hist, decreases, patience).out_of_patience,
                            expected,
                            "hist {:?} patience {}",
                            hist,
                            patience
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_aggregates_mixed_directions() {
        let scores = [
            TaskScore {
                value: 20.0,
                decreases: true,
                n_examples: 50,
            },
            TaskScore {
                value: 0.8,
                decreases: false,
                n_examples: 30,
            },
        ];
        let (micro, macro_avg) = aggregate_scores(&scores, 100.0);
        assert!((macro_avg - 0.8).abs() < 1e-12);
        assert!((micro - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_single_task_aggregates_keep_raw_value() {
        let scores = [TaskScore {
            value: 20.0,
            decreases: true,
            n_examples: 10,
        }];
        assert_eq!(aggregate_scores(&scores, 100.0), (20.0, 20.0));

        let tracker = MetricTracker::new(&[("sts_mse".to_string(), true)], 2);
        assert!(tracker.get(MACRO_AVG).unwrap().decreases);
        let tracker = MetricTracker::new(
            &[("sts_mse".to_string(), true), ("nli_accuracy".to_string(), false)],
            2,
        );
        assert!(!tracker.get(MICRO_AVG).unwrap().decreases);
    }

    #[test]
    fn test_stopped_is_sticky() {
        let mut tracker = MetricTracker::new(&[("a_accuracy".to_string(), false)], 0);
        let snap = MetricSnapshot::new();

        let first = tracker.record("a_accuracy", 0.9, 1, &snap).unwrap().unwrap();
        assert!(first.best_so_far && !first.newly_stopped);

        let second = tracker.record("a_accuracy", 0.5, 2, &snap).unwrap().unwrap();
        assert!(second.newly_stopped);
        assert!(tracker.is_stopped("a_accuracy").unwrap());

        // an improvement after stopping is ignored
        assert!(tracker.record("a_accuracy", 1.0, 3, &snap).unwrap().is_none());
        let info = tracker.get("a_accuracy").unwrap();
        assert_eq!(info.hist, vec![0.9, 0.5]);
        assert_eq!(info.best.as_ref().unwrap().epoch, 1);
    }

    #[test]
    fn test_best_record_keeps_snapshot() {
        let mut tracker = MetricTracker::new(&[("a_mse".to_string(), true)], 5);
        let mut snap = MetricSnapshot::new();
        snap.insert("a_mse".to_string(), 2.0);
        snap.insert("a_loss".to_string(), 1.5);
        tracker.record("a_mse", 2.0, 1, &snap).unwrap();
        let best = tracker.get("a_mse").unwrap().best.clone().unwrap();
        assert_eq!(best.metrics["a_loss"], 1.5);
        assert!(tracker.record("missing", 1.0, 1, &snap).is_err());
    }

    #[test]
    fn test_state_roundtrip_json() {
        let mut tracker = MetricTracker::new(&[("a_mse".to_string(), true)], 1);
        tracker.record("a_mse", 2.0, 1, &MetricSnapshot::new()).unwrap();
        let json = serde_json::to_string(tracker.infos()).unwrap();

        let mut restored = MetricTracker::new(&[("a_mse".to_string(), true)], 1);
        restored.restore(serde_json::from_str(&json).unwrap());
        assert_eq!(restored.infos(), tracker.infos());
    }
}
