//! Command-line trainer for layered networks.
//!
//! Loads delimited pattern files, builds a feed-forward network, trains it and
//! optionally checkpoints after every epoch. Epoch metrics can be appended to a
//! JSONL file for dashboards.

use clap::Parser;
use env_logger::Env;
use log::{error, info, warn};
use nodenet::data::{load_patterns, DelimitedFormat};
use nodenet::training::EpochMetrics;
use nodenet::{
    Activation, NetError, NetResult, Network, OptimizerConfig, ProgressSink, Trainer,
    TrainerConfig, TrainingOutcome, WorkerPool,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "nodenet-train", about = "Train a layered node network on pattern files")]
struct Args {
    /// Training pattern file
    #[arg(long)]
    train: PathBuf,

    /// Test pattern file, evaluated after every epoch
    #[arg(long)]
    test: Option<PathBuf>,

    /// Fraction of the training file held out for testing when no test file is given
    #[arg(long, default_value_t = 0.0)]
    test_fraction: f64,

    /// Number of input columns per line
    #[arg(long)]
    inputs: usize,

    /// Field delimiter of the pattern files
    #[arg(long, default_value_t = ',')]
    delimiter: char,

    /// Last column of each line is a label
    #[arg(long, default_value_t = false)]
    labelled: bool,

    /// Network name, part of the checkpoint file name
    #[arg(long, default_value = "network")]
    name: String,

    /// Hidden layer sizes, comma separated
    #[arg(long, value_delimiter = ',')]
    hidden: Vec<usize>,

    /// Activation function (sigmoid, bipolar_sigmoid, tanh, relu, softmax)
    #[arg(long, default_value = "sigmoid")]
    activation: String,

    /// Weights optimizer (sgd, ada)
    #[arg(long, default_value = "sgd")]
    optimizer: String,

    /// Learning rate; the optimizer's default when omitted
    #[arg(long)]
    learning_rate: Option<f64>,

    /// Build weights nodes without a bias row
    #[arg(long, default_value_t = false)]
    no_bias: bool,

    /// Trainer configuration (JSON); flags below override its fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of training epochs
    #[arg(long)]
    epochs: Option<usize>,

    /// Report progress every N patterns
    #[arg(long)]
    progress_modulus: Option<usize>,

    /// Checkpoint directory
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// Checkpoint file name prefix
    #[arg(long)]
    checkpoint_root: Option<String>,

    /// Checkpoint file extension
    #[arg(long)]
    checkpoint_ext: Option<String>,

    /// Write a checkpoint after every epoch
    #[arg(long, default_value_t = false)]
    save: bool,

    /// Restore the network from its checkpoint before training
    #[arg(long, default_value_t = false)]
    resume: bool,

    /// Worker threads (default: available parallelism)
    #[arg(long)]
    threads: Option<usize>,

    /// Seed for weight initialization and shuffling
    #[arg(long)]
    seed: Option<u64>,

    /// Append epoch metrics to this JSONL file
    #[arg(long)]
    metrics_file: Option<PathBuf>,
}

/// Logs progress and appends epoch events to an optional JSONL file.
struct MetricsSink {
    file: Option<BufWriter<File>>,
}

impl ProgressSink for MetricsSink {
    fn progress(&mut self, message: &str, work_done: u64, total_work: u64) {
        info!("{message} ({work_done}/{total_work})");
    }

    fn epoch(&mut self, metrics: &EpochMetrics) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let event = serde_json::json!({
            "type": "epoch",
            "epoch": metrics.epoch,
            "train_loss": metrics.train_loss,
            "test_loss": metrics.test.map(|t| t.loss),
            "accuracy": metrics.test.and_then(|t| t.accuracy),
            "patterns": metrics.patterns,
            "elapsed_secs": metrics.elapsed_secs,
        });
        if let Err(e) = writeln!(file, "{event}").and_then(|()| file.flush()) {
            warn!("failed to write epoch metrics: {e}");
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn trainer_config(args: &Args) -> NetResult<TrainerConfig> {
    let mut config = match &args.config {
        Some(path) => TrainerConfig::from_json_file(path)?,
        None => TrainerConfig::default(),
    };
    if let Some(epochs) = args.epochs {
        config.epochs = epochs;
    }
    if let Some(modulus) = args.progress_modulus {
        config.progress_modulus = modulus;
    }
    if let Some(dir) = &args.checkpoint_dir {
        config.file_path = dir.clone();
    }
    if let Some(root) = &args.checkpoint_root {
        config.file_root = root.clone();
    }
    if let Some(ext) = &args.checkpoint_ext {
        config.file_extension = ext.clone();
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    config.save_network_data |= args.save;
    config.validate()?;
    Ok(config)
}

fn run(args: Args) -> NetResult<()> {
    let config = trainer_config(&args)?;
    let format = DelimitedFormat {
        delimiter: args.delimiter,
        input_width: args.inputs,
        labelled: args.labelled,
    };

    let mut training = load_patterns(&args.train, &format)?;
    let outputs = training
        .get(0)
        .map(|p| p.output().len())
        .ok_or_else(|| NetError::InvalidConfig(format!("{} holds no patterns", args.train.display())))?;

    let test = match &args.test {
        Some(path) => Some(load_patterns(path, &format)?),
        None if args.test_fraction > 0.0 => {
            training.shuffle(&mut StdRng::seed_from_u64(config.seed));
            let (train, test) = training.split(args.test_fraction);
            training = train;
            Some(test)
        }
        None => None,
    };
    eprintln!(
        "Loaded {} training patterns{} ({} inputs, {} outputs)",
        training.len(),
        test.as_ref()
            .map(|t| format!(" and {} test patterns", t.len()))
            .unwrap_or_default(),
        args.inputs,
        outputs
    );

    let pool = Arc::new(match args.threads {
        Some(n) => WorkerPool::new(n)?,
        None => WorkerPool::available()?,
    });
    let activation = Activation::from_name(&args.activation)?;
    let mut optimizer = OptimizerConfig::from_name(&args.optimizer)?;
    if let Some(rate) = args.learning_rate {
        optimizer = optimizer.with_learning_rate(rate);
    }

    let mut sizes = vec![args.inputs];
    sizes.extend(&args.hidden);
    sizes.push(outputs);
    let network = Network::feed_forward(
        &args.name,
        &sizes,
        activation,
        optimizer,
        !args.no_bias,
        pool,
        config.seed,
    )?;

    let file = match &args.metrics_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|e| NetError::io(parent, e))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| NetError::io(path, e))?;
            Some(BufWriter::new(file))
        }
        None => None,
    };

    let mut trainer = Trainer::new(network, training, config)?.with_progress(MetricsSink { file });
    if let Some(test) = test {
        trainer = trainer.with_test_source(test)?;
    }
    if args.resume {
        let epoch = trainer.restore_checkpoint()?;
        eprintln!(
            "Resumed from {} after epoch {epoch} of {}",
            trainer.checkpoint_path().display(),
            trainer.config().epochs
        );
    }

    match trainer.train()? {
        TrainingOutcome::Completed(report) => {
            eprintln!(
                "Training complete: {} epochs, {} patterns",
                report.epochs_completed, report.patterns_seen
            );
            if let Some(last) = report.last() {
                eprintln!("  final train loss: {:.6}", last.train_loss);
                if let Some(test) = last.test {
                    eprintln!("  final test loss:  {:.6}", test.loss);
                    if let Some(acc) = test.accuracy {
                        eprintln!("  final accuracy:   {:.2}%", acc * 100.0);
                    }
                }
            }
        }
        TrainingOutcome::Cancelled(report) => {
            eprintln!("Training cancelled after {} epochs", report.epochs_completed);
        }
    }

    if trainer.config().save_network_data {
        eprintln!("Checkpoint: {}", trainer.checkpoint_path().display());
    }
    Ok(())
}
