//! Epoch-loop training with progress reporting, cancellation and checkpoints.
//!
//! ## One epoch
//!
//! ```text
//! shuffle training source
//! for each pattern:
//!     stop here if cancelled
//!     y = forward(x);  loss = 0.5 Σ (t - y)²   (must stay finite)
//!     backward(t - y)
//!     every `progress_modulus` patterns: report progress
//! evaluate test source, log metrics, checkpoint if enabled
//! ```
//!
//! Cancellation is observed between patterns, never inside a pass, and a
//! cancelled run does not write a checkpoint.

use log::{error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::checkpoint;
use crate::core::Network;
use crate::data::PatternSource;
use crate::error::{NetError, NetResult};
use crate::utils::{argmax, error_signal, squared_error};

/// Trainer settings, loadable from JSON. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub epochs: usize,
    /// Report progress every this many patterns.
    pub progress_modulus: usize,
    /// Write a checkpoint after every epoch.
    pub save_network_data: bool,
    /// Checkpoint directory.
    pub file_path: PathBuf,
    pub file_root: String,
    pub file_extension: String,
    /// Seed of the shuffling RNG.
    pub seed: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            epochs: 100,
            progress_modulus: 100,
            save_network_data: false,
            file_path: PathBuf::from("checkpoints"),
            file_root: "network".to_string(),
            file_extension: "nnc".to_string(),
            seed: 0,
        }
    }
}

impl TrainerConfig {
    /// # Errors
    /// `InvalidConfig` for zero epochs or progress modulus, or an empty file root or extension.
    pub fn validate(&self) -> NetResult<()> {
        if self.epochs == 0 {
            return Err(NetError::InvalidConfig("epochs must be positive".to_string()));
        }
        if self.progress_modulus == 0 {
            return Err(NetError::InvalidConfig(
                "progress modulus must be positive".to_string(),
            ));
        }
        if self.file_root.is_empty() || self.file_extension.is_empty() {
            return Err(NetError::InvalidConfig(
                "checkpoint file root and extension must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Read and validate a JSON configuration file.
    pub fn from_json_file(path: &Path) -> NetResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| NetError::io(path, e))?;
        let config: Self = serde_json::from_str(&text).map_err(|source| NetError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checkpoint file of the network called `network`.
    pub fn checkpoint_path(&self, network: &str) -> PathBuf {
        checkpoint::checkpoint_path(&self.file_path, &self.file_root, network, &self.file_extension)
    }
}

/// Shared flag asking a running trainer to stop after the current pattern.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Loss and accuracy over one pass of a pattern source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Evaluation {
    /// Mean squared-error loss per pattern.
    pub loss: f64,
    /// Share of patterns whose arg-max output matches the target's; only for
    /// networks with more than one output.
    pub accuracy: Option<f64>,
}

/// Metrics computed after each epoch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    /// Mean training loss per pattern.
    pub train_loss: f64,
    pub test: Option<Evaluation>,
    pub patterns: usize,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrainingReport {
    pub epochs_completed: usize,
    pub patterns_seen: u64,
    pub metrics: Vec<EpochMetrics>,
}

impl TrainingReport {
    pub fn last(&self) -> Option<&EpochMetrics> {
        self.metrics.last()
    }
}

/// How a training run ended. Failures are returned as errors instead.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingOutcome {
    Completed(TrainingReport),
    Cancelled(TrainingReport),
}

impl TrainingOutcome {
    pub fn report(&self) -> &TrainingReport {
        match self {
            TrainingOutcome::Completed(r) | TrainingOutcome::Cancelled(r) => r,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TrainingOutcome::Cancelled(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Initialized,
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// Receives progress while a trainer runs.
///
/// Closures `FnMut(&str, u64, u64)` are sinks that ignore epoch metrics.
pub trait ProgressSink {
    fn progress(&mut self, message: &str, work_done: u64, total_work: u64);

    fn epoch(&mut self, _metrics: &EpochMetrics) {}
}

/// Discards all progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn progress(&mut self, _message: &str, _work_done: u64, _total_work: u64) {}
}

/// Forwards progress to the `log` facade at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn progress(&mut self, message: &str, work_done: u64, total_work: u64) {
        info!("{message} ({work_done}/{total_work})");
    }
}

impl<F> ProgressSink for F
where
    F: FnMut(&str, u64, u64),
{
    fn progress(&mut self, message: &str, work_done: u64, total_work: u64) {
        self(message, work_done, total_work);
    }
}

/// Drives a network through its training and test sources.
pub struct Trainer {
    network: Network,
    training: PatternSource,
    test: Option<PatternSource>,
    config: TrainerConfig,
    epoch: usize,
    state: TrainerState,
    progress: Box<dyn ProgressSink + Send>,
    cancel: CancellationToken,
    rng: StdRng,
}

impl std::fmt::Debug for Trainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer")
            .field("network", &self.network.name())
            .field("training", &self.training.len())
            .field("test", &self.test.as_ref().map(PatternSource::len))
            .field("epoch", &self.epoch)
            .field("state", &self.state)
            .finish()
    }
}

impl Trainer {
    /// # Errors
    /// `InvalidConfig` for an invalid configuration or an empty training source;
    /// `ShapeMismatch` when a pattern does not fit the network.
    pub fn new(network: Network, training: PatternSource, config: TrainerConfig) -> NetResult<Self> {
        config.validate()?;
        if training.is_empty() {
            return Err(NetError::InvalidConfig(format!(
                "training source `{}` holds no patterns",
                training.name()
            )));
        }
        training.validate(network.input_size(), network.output_size())?;

        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            network,
            training,
            test: None,
            config,
            epoch: 0,
            state: TrainerState::Initialized,
            progress: Box::new(NoProgress),
            cancel: CancellationToken::new(),
        })
    }

    /// Evaluate `test` after every epoch.
    pub fn with_test_source(mut self, test: PatternSource) -> NetResult<Self> {
        test.validate(self.network.input_size(), self.network.output_size())?;
        self.test = Some(test);
        Ok(self)
    }

    pub fn with_progress(mut self, sink: impl ProgressSink + Send + 'static) -> Self {
        self.progress = Box::new(sink);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// A handle that cancels this trainer from any thread.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut Network {
        &mut self.network
    }

    pub fn into_network(self) -> Network {
        self.network
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Number of completed epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.config.checkpoint_path(self.network.name())
    }

    /// Write the network's checkpoint with the completed epoch count; returns the
    /// file written.
    pub fn save_checkpoint(&self) -> NetResult<PathBuf> {
        let path = self.checkpoint_path();
        checkpoint::save_checkpoint(&self.network, &path, self.epoch)?;
        Ok(path)
    }

    /// Restore the network and resume counting from the stored epoch, so `train`
    /// only runs the epochs still missing. Returns that epoch.
    pub fn restore_checkpoint(&mut self) -> NetResult<usize> {
        let path = self.checkpoint_path();
        self.epoch = checkpoint::restore_checkpoint(&mut self.network, &path)?;
        Ok(self.epoch)
    }

    /// Evaluate the test source, if any, without training.
    pub fn evaluate_test(&mut self) -> NetResult<Option<Evaluation>> {
        match &self.test {
            Some(test) if !test.is_empty() => Ok(Some(evaluate(&mut self.network, test)?)),
            _ => Ok(None),
        }
    }

    /// Train until `epochs` epochs have completed in total or the run is cancelled.
    ///
    /// # Errors
    /// `NumericalDivergence` as soon as a pattern's loss is not finite; I/O and
    /// configuration errors from checkpointing. The trainer is then `Failed`.
    pub fn train(&mut self) -> NetResult<TrainingOutcome> {
        self.state = TrainerState::Running;
        info!(
            "training `{}` on {} patterns for {} epochs",
            self.network.name(),
            self.training.len(),
            self.config.epochs
        );

        match self.run() {
            Ok(outcome) => {
                self.state = if outcome.is_cancelled() {
                    TrainerState::Cancelled
                } else {
                    TrainerState::Completed
                };
                Ok(outcome)
            }
            Err(err) => {
                self.state = TrainerState::Failed;
                error!("training `{}` failed: {err}", self.network.name());
                Err(err)
            }
        }
    }

    fn run(&mut self) -> NetResult<TrainingOutcome> {
        let patterns = self.training.len();
        let remaining = self.config.epochs.saturating_sub(self.epoch);
        let total_work = (remaining * patterns) as u64;
        let modulus = self.config.progress_modulus as u64;
        let mut work_done = 0u64;
        let mut report = TrainingReport::default();

        while self.epoch < self.config.epochs {
            let epoch = self.epoch + 1;
            let started = Instant::now();
            self.training.shuffle(&mut self.rng);

            let mut loss_sum = 0.0;
            for (index, pattern) in self.training.iter().enumerate() {
                if self.cancel.is_cancelled() {
                    warn!(
                        "training `{}` cancelled in epoch {epoch} after {index} patterns",
                        self.network.name()
                    );
                    return Ok(TrainingOutcome::Cancelled(report));
                }

                let output = self.network.forward(pattern.input())?;
                let loss = squared_error(pattern.output(), output.view());
                if !loss.is_finite() {
                    return Err(NetError::NumericalDivergence {
                        epoch,
                        pattern: index,
                        loss,
                    });
                }
                self.network
                    .backward(error_signal(pattern.output(), output.view()).view())?;

                loss_sum += loss;
                work_done += 1;
                report.patterns_seen += 1;
                if work_done % modulus == 0 {
                    let message = format!(
                        "epoch {epoch}/{}: pattern {}/{patterns}",
                        self.config.epochs,
                        index + 1
                    );
                    self.progress.progress(&message, work_done, total_work);
                }
            }

            let test = match &self.test {
                Some(test) if !test.is_empty() => Some(evaluate(&mut self.network, test)?),
                _ => None,
            };
            self.epoch = epoch;

            let metrics = EpochMetrics {
                epoch,
                train_loss: loss_sum / patterns as f64,
                test,
                patterns,
                elapsed_secs: started.elapsed().as_secs_f64(),
            };
            match metrics.test {
                Some(Evaluation { loss, accuracy: Some(acc) }) => info!(
                    "epoch {epoch:4} | train loss: {:.6} | test loss: {loss:.6} | accuracy: {:.2}% | {:.2}s",
                    metrics.train_loss,
                    acc * 100.0,
                    metrics.elapsed_secs
                ),
                Some(Evaluation { loss, accuracy: None }) => info!(
                    "epoch {epoch:4} | train loss: {:.6} | test loss: {loss:.6} | {:.2}s",
                    metrics.train_loss, metrics.elapsed_secs
                ),
                None => info!(
                    "epoch {epoch:4} | train loss: {:.6} | {:.2}s",
                    metrics.train_loss, metrics.elapsed_secs
                ),
            }
            self.progress.epoch(&metrics);

            if self.config.save_network_data {
                self.save_checkpoint()?;
            }
            report.epochs_completed += 1;
            report.metrics.push(metrics);
        }

        Ok(TrainingOutcome::Completed(report))
    }
}

/// Mean loss and arg-max accuracy of `network` over `source`, without training.
///
/// # Errors
/// Shape errors from the forward pass.
pub fn evaluate(network: &mut Network, source: &PatternSource) -> NetResult<Evaluation> {
    let classify = network.output_size() > 1;
    let mut loss = 0.0;
    let mut correct = 0usize;

    for pattern in source {
        let output = network.predict(pattern.input())?;
        loss += squared_error(pattern.output(), output.view());
        if classify && argmax(output.view()) == argmax(pattern.output()) {
            correct += 1;
        }
    }

    let n = source.len().max(1) as f64;
    Ok(Evaluation {
        loss: loss / n,
        accuracy: classify.then(|| correct as f64 / n),
    })
}
