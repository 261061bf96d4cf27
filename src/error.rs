//! Error type shared by every engine module.

use std::path::PathBuf;
use thiserror::Error;

use crate::core::NodePhase;

/// Errors raised while building, running, checkpointing or training a network.
///
/// Configuration errors (shapes, names, malformed checkpoints) are fatal and surface
/// at construction or restore time. Edge length violations are not represented here:
/// graph shapes are static, so writing a wrongly sized vector into an edge panics.
#[derive(Debug, Error)]
pub enum NetError {
    /// Two sizes that must agree do not.
    #[error("shape mismatch in {context}: expected {expected}, got {got}")]
    ShapeMismatch {
        context: String,
        expected: usize,
        got: usize,
    },

    /// Invalid network, node or trainer configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("unknown activation function: {0}")]
    UnknownActivation(String),

    #[error("unknown weights optimizer: {0}")]
    UnknownOptimizer(String),

    /// A collector was asked to reduce a set of vectors it cannot handle.
    #[error("{collector} collector cannot reduce {count} vectors: {reason}")]
    Collector {
        collector: &'static str,
        count: usize,
        reason: String,
    },

    /// A node was driven out of its forward/backward order.
    #[error("node `{node}` is {actual:?}, expected {expected:?}")]
    NodeState {
        node: String,
        actual: NodePhase,
        expected: NodePhase,
    },

    /// A checkpoint file does not describe the live network or is corrupt.
    #[error("malformed checkpoint {}: {reason}", path.display())]
    MalformedCheckpoint { path: PathBuf, reason: String },

    /// A pattern file could not be parsed.
    #[error("malformed pattern file {} at line {line}: {reason}", path.display())]
    MalformedPatterns {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The loss stopped being a finite number.
    #[error("numerical divergence at epoch {epoch}, pattern {pattern}: loss is {loss}")]
    NumericalDivergence {
        epoch: usize,
        pattern: usize,
        loss: f64,
    },

    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

pub type NetResult<T> = Result<T, NetError>;

impl NetError {
    pub(crate) fn shape(context: impl Into<String>, expected: usize, got: usize) -> Self {
        NetError::ShapeMismatch {
            context: context.into(),
            expected,
            got,
        }
    }

    /// An I/O failure on `path`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        NetError::Io {
            path: path.into(),
            source,
        }
    }
}
