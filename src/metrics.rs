//! # Training Telemetry
//!
//! Tensorboard logging for meta multi-task training. Each logical stream
//! gets its own event directory under `<log_dir>/tensorboard/<stream>`, so
//! the same tag (for example `approx/loss`) can be compared across streams.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use metatrain::metrics::{MetricsLogger, Stream};
//!
//! let mut logger = MetricsLogger::new("./runs/exp1", false)?;
//! logger.write_train_metrics(100, &task_metrics, "sts")?;
//! logger.log_scalar(Stream::Val, "macro/macro_avg", 0.8, 100)?;
//! logger.flush()?;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tensorboard_rs::summary_writer::SummaryWriter;

use crate::MetaResult;

/// Logical telemetry stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Train,
    Val,
    /// Approximation mode: regularizer and cosine similarity
    Grad,
    /// Approximation mode: loss before the regularizer
    GrossLoss,
    /// Approximation mode: loss after the regularizer
    NetLoss,
    /// Approximation mode: source gradient norm
    Grad1,
    /// Approximation mode: target gradient norm
    Grad2,
}

impl Stream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::Train => "train",
            Stream::Val => "val",
            Stream::Grad => "grad",
            Stream::GrossLoss => "gross_loss",
            Stream::NetLoss => "net_loss",
            Stream::Grad1 => "grad1",
            Stream::Grad2 => "grad2",
        }
    }

    const APPROX: [Stream; 5] = [
        Stream::Grad,
        Stream::GrossLoss,
        Stream::NetLoss,
        Stream::Grad1,
        Stream::Grad2,
    ];
}

/// Metrics logger with Tensorboard support
pub struct MetricsLogger {
    /// One writer per open stream (empty if disabled)
    writers: HashMap<Stream, SummaryWriter>,
    /// Tensorboard root
    log_dir: PathBuf,
    enabled: bool,
}

impl MetricsLogger {
    /// Open the `train` and `val` streams, plus the approximation streams
    /// when `approx_streams` is set.
    pub fn new(log_dir: impl AsRef<Path>, approx_streams: bool) -> MetaResult<Self> {
        let tb_dir = log_dir.as_ref().join("tensorboard");
        let mut streams = vec![Stream::Train, Stream::Val];
        if approx_streams {
            streams.extend(Stream::APPROX);
        }

        let mut writers = HashMap::new();
        for stream in streams {
            let dir = tb_dir.join(stream.as_str());
            fs::create_dir_all(&dir)?;
            writers.insert(stream, SummaryWriter::new(&dir));
        }

        log::info!("Tensorboard logs: {:?}", tb_dir);
        log::info!("View with: tensorboard --logdir {:?}", tb_dir);

        Ok(Self {
            writers,
            log_dir: tb_dir,
            enabled: true,
        })
    }

    /// Create a disabled logger (for when logging is not wanted)
    pub fn disabled() -> Self {
        Self {
            writers: HashMap::new(),
            log_dir: PathBuf::new(),
            enabled: false,
        }
    }

    /// Log a scalar value. Streams that were not opened are ignored.
    pub fn log_scalar(&mut self, stream: Stream, tag: &str, value: f64, step: usize) -> MetaResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if let Some(writer) = self.writers.get_mut(&stream) {
            writer.add_scalar(tag, value as f32, step);
        }
        Ok(())
    }

    /// Training metrics of one task, tagged `<task>/<task>_<metric>`
    pub fn write_train_metrics(
        &mut self,
        step: usize,
        metrics: &BTreeMap<String, f64>,
        task_name: &str,
    ) -> MetaResult<()> {
        for (name, value) in metrics {
            let tag = format!("{}/{}_{}", task_name, task_name, name);
            self.log_scalar(Stream::Train, &tag, *value, step)?;
        }
        Ok(())
    }

    /// Validation metrics, tagged `<prefix>/<metric>` where the prefix is
    /// the metric name up to its first underscore
    pub fn write_val_metrics(&mut self, step: usize, metrics: &BTreeMap<String, f64>) -> MetaResult<()> {
        for (name, value) in metrics {
            self.log_scalar(Stream::Val, &val_tag(name), *value, step)?;
        }
        Ok(())
    }

    /// Flush the writers
    pub fn flush(&mut self) -> MetaResult<()> {
        if !self.enabled {
            return Ok(());
        }
        for writer in self.writers.values_mut() {
            writer.flush();
        }
        Ok(())
    }

    /// Get the log directory
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Check if logging is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl Drop for MetricsLogger {
    fn drop(&mut self) {
        if self.enabled {
            let _ = self.flush();
        }
    }
}

fn val_tag(metric: &str) -> String {
    let prefix = metric.split('_').next().unwrap_or(metric);
    format!("{}/{}", prefix, metric)
}

/// `name: value, ... ||` progress description
pub fn describe_metrics(metrics: &BTreeMap<String, f64>) -> String {
    let parts: Vec<String> = metrics
        .iter()
        .map(|(name, value)| format!("{}: {:.4}", name, value))
        .collect();
    format!("{} ||", parts.join(", "))
}
