//! # nodenet
//!
//! A neural-network engine built from computation nodes joined by edges.
//!
//! ## Overview
//!
//! A [`Network`] is a graph of nodes (inputs, weight matrices, activation
//! functions, 2-D filters and pools) executed in two passes: forward computes the
//! output from an input vector, backward walks the graph in reverse with an error
//! signal and lets each weights node's optimizer (SGD or Ada) update its matrix.
//! Row-independent work is partitioned across an injected [`WorkerPool`].
//!
//! ```text
//!            ┌──────────┐   edge   ┌──────────┐   edge   ┌──────────┐
//!  input ──▶ │  input   │ ───────▶ │ weights  │ ───────▶ │ function │ ──▶ output
//!            └──────────┘ ◀─────── └──────────┘ ◀─────── └──────────┘ ◀── target - output
//!                          deltas                deltas
//! ```
//!
//! ## Structure
//!
//! - [`core`] — Nodes, edges, activations, collectors, optimizers, networks
//! - [`pool`] — Partitioned fork-join execution
//! - [`checkpoint`] — Binary save/restore of trained state
//! - [`data`] — Patterns, pattern sources, delimited-text loading
//! - [`training`] — Epoch loop, progress, cancellation
//! - [`utils`] — Loss and classification helpers

pub mod checkpoint;
pub mod core;
pub mod data;
pub mod error;
pub mod pool;
pub mod training;
pub mod utils;

pub use crate::core::{
    Activation, AverageKind, Collector, Network, NetworkBuilder, NodeId, NodePhase, OptimizerConfig,
    PoolKind, WeightsOptimizer,
};
pub use data::{Pattern, PatternSource};
pub use error::{NetError, NetResult};
pub use pool::WorkerPool;
pub use training::{
    CancellationToken, EpochMetrics, Evaluation, LogProgress, NoProgress, ProgressSink, Trainer,
    TrainerConfig, TrainerState, TrainingOutcome, TrainingReport,
};
