//! Weight-update rules bound to weights nodes.
//!
//! An optimizer receives the node's input values, the deltas arriving at its
//! output and the live weight matrix (`[inputs][outputs]`, row-major). It updates
//! the matrix in place and returns the deltas to propagate upstream.
//!
//! Deltas are error signals, i.e. negative loss gradients, so updates *add*:
//! ```text
//! ΔW[i][o] = lr · outputDelta[o] · input[i]
//! inputDelta[i] = Σ_o W[i][o] · outputDelta[o]     (pre-update W)
//! ```
//!
//! Rows of the matrix are independent and are partitioned across the worker pool;
//! each partition owns its rows exclusively.

use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::error::{NetError, NetResult};
use crate::pool::WorkerPool;

pub const DEFAULT_SGD_LEARNING_RATE: f64 = 0.01;
pub const DEFAULT_ADA_LEARNING_RATE: f64 = 0.01;
pub const DEFAULT_ADA_MOMENTUM: f64 = 0.2;
pub const DEFAULT_ADA_HISTORY: usize = 5;

fn default_sgd_rate() -> f64 {
    DEFAULT_SGD_LEARNING_RATE
}

fn default_ada_rate() -> f64 {
    DEFAULT_ADA_LEARNING_RATE
}

fn default_ada_momentum() -> f64 {
    DEFAULT_ADA_MOMENTUM
}

fn default_ada_history() -> usize {
    DEFAULT_ADA_HISTORY
}

/// Declarative description of an optimizer, built into a [`WeightsOptimizer`]
/// once the shape of its weights node is known.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerConfig {
    Sgd {
        #[serde(default = "default_sgd_rate")]
        learning_rate: f64,
    },
    Ada {
        #[serde(default = "default_ada_rate")]
        learning_rate: f64,
        #[serde(default = "default_ada_momentum")]
        momentum: f64,
        /// Capacity of the gradient history.
        #[serde(default = "default_ada_history")]
        history: usize,
    },
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::sgd(DEFAULT_SGD_LEARNING_RATE)
    }
}

impl OptimizerConfig {
    pub fn sgd(learning_rate: f64) -> Self {
        OptimizerConfig::Sgd { learning_rate }
    }

    /// Ada with the default learning rate (0.01), momentum (0.2) and history (5).
    pub fn ada() -> Self {
        OptimizerConfig::Ada {
            learning_rate: DEFAULT_ADA_LEARNING_RATE,
            momentum: DEFAULT_ADA_MOMENTUM,
            history: DEFAULT_ADA_HISTORY,
        }
    }

    /// Look an optimizer up by name, with default parameters.
    ///
    /// # Errors
    /// `UnknownOptimizer` for names other than `sgd` and `ada`.
    pub fn from_name(name: &str) -> NetResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sgd" => Ok(Self::default()),
            "ada" => Ok(Self::ada()),
            _ => Err(NetError::UnknownOptimizer(name.to_string())),
        }
    }

    /// Same kind of optimizer with a different learning rate.
    pub fn with_learning_rate(self, rate: f64) -> Self {
        match self {
            OptimizerConfig::Sgd { .. } => OptimizerConfig::Sgd {
                learning_rate: rate,
            },
            OptimizerConfig::Ada {
                momentum, history, ..
            } => OptimizerConfig::Ada {
                learning_rate: rate,
                momentum,
                history,
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OptimizerConfig::Sgd { .. } => "sgd",
            OptimizerConfig::Ada { .. } => "ada",
        }
    }

    /// Build the optimizer for a `rows × cols` weight matrix.
    ///
    /// # Errors
    /// `InvalidConfig` for a non-finite or non-positive learning rate, a momentum
    /// outside `[0, 1)` or an empty history.
    pub fn build(&self, rows: usize, cols: usize) -> NetResult<WeightsOptimizer> {
        match *self {
            OptimizerConfig::Sgd { learning_rate } => {
                Ok(WeightsOptimizer::Sgd(Sgd::try_new(learning_rate)?))
            }
            OptimizerConfig::Ada {
                learning_rate,
                momentum,
                history,
            } => {
                check_rate(learning_rate)?;
                check_momentum(momentum)?;
                if history == 0 {
                    return Err(NetError::InvalidConfig(
                        "ada gradient history needs a capacity of at least 1".to_string(),
                    ));
                }
                Ok(WeightsOptimizer::Ada(Ada::new(
                    rows,
                    cols,
                    learning_rate,
                    momentum,
                    history,
                )))
            }
        }
    }
}

fn check_rate(rate: f64) -> NetResult<()> {
    if rate.is_finite() && rate > 0.0 {
        Ok(())
    } else {
        Err(NetError::InvalidConfig(format!(
            "learning rate must be positive and finite, got {rate}"
        )))
    }
}

fn check_momentum(momentum: f64) -> NetResult<()> {
    if (0.0..1.0).contains(&momentum) {
        Ok(())
    } else {
        Err(NetError::InvalidConfig(format!(
            "ada momentum must lie in [0, 1), got {momentum}"
        )))
    }
}

/// Optimizer state owned by exactly one weights node.
#[derive(Debug, Clone, PartialEq)]
pub enum WeightsOptimizer {
    Sgd(Sgd),
    Ada(Ada),
}

impl WeightsOptimizer {
    pub fn name(&self) -> &'static str {
        match self {
            WeightsOptimizer::Sgd(_) => "sgd",
            WeightsOptimizer::Ada(_) => "ada",
        }
    }

    /// Update `weights` in place and return the input deltas.
    ///
    /// # Panics
    /// If `input` / `output_delta` do not match the matrix rows / columns.
    pub fn update(
        &mut self,
        input: ArrayView1<f64>,
        output_delta: ArrayView1<f64>,
        weights: &mut Array2<f64>,
        pool: &WorkerPool,
    ) -> Array1<f64> {
        let (rows, cols) = weights.dim();
        assert_eq!(input.len(), rows, "input width does not match weight rows");
        assert_eq!(
            output_delta.len(),
            cols,
            "output delta width does not match weight columns"
        );

        match self {
            WeightsOptimizer::Sgd(sgd) => sgd.update(input, output_delta, weights, pool),
            WeightsOptimizer::Ada(ada) => ada.update(input, output_delta, weights, pool),
        }
    }
}

/// Mutable row-major view of a weight matrix.
fn row_major_mut(weights: &mut Array2<f64>) -> &mut [f64] {
    if !weights.is_standard_layout() {
        *weights = weights.as_standard_layout().into_owned();
    }
    weights
        .as_slice_mut()
        .expect("standard layout was enforced above")
}

/// Plain stochastic gradient descent with a constant learning rate.
#[derive(Debug, Clone, PartialEq)]
pub struct Sgd {
    learning_rate: f64,
}

impl Sgd {
    pub fn new(learning_rate: f64) -> Self {
        Self { learning_rate }
    }

    /// # Errors
    /// `InvalidConfig` for a non-finite or non-positive learning rate.
    pub fn try_new(learning_rate: f64) -> NetResult<Self> {
        check_rate(learning_rate)?;
        Ok(Self::new(learning_rate))
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Single pass per row: each cell's contribution to the input delta is read
    /// before that cell is overwritten.
    fn update(
        &self,
        input: ArrayView1<f64>,
        output_delta: ArrayView1<f64>,
        weights: &mut Array2<f64>,
        pool: &WorkerPool,
    ) -> Array1<f64> {
        let (rows, cols) = weights.dim();
        let lr = self.learning_rate;
        let mut input_delta = vec![0.0; rows];

        pool.zip_chunks_mut(
            row_major_mut(weights),
            cols,
            &mut input_delta,
            1,
            |range, w_rows, deltas| {
                for ((i, row), d) in range.zip(w_rows.chunks_mut(cols)).zip(deltas.iter_mut()) {
                    let x = input[i];
                    let mut acc = 0.0;
                    for (cell, &od) in row.iter_mut().zip(output_delta.iter()) {
                        let w = *cell;
                        acc += w * od;
                        *cell = w + lr * od * x;
                    }
                    *d = acc;
                }
            },
        );

        Array1::from(input_delta)
    }
}

/// Momentum optimizer smoothing the gradient over a short history.
///
/// ```text
/// gradient[i][o] = input[i] · outputDelta[o]       pushed into a FIFO of `capacity`
/// smoothed       = Σ history
/// delta          = momentum · lastDelta + (1 - momentum) · (lr · smoothed)
/// weight        += delta;  lastDelta = delta
/// ```
///
/// Learning rate and momentum are kept per weight. All matrices are stored flat in
/// row-major order, shaped like the weight matrix.
#[derive(Debug, Clone)]
pub struct Ada {
    rows: usize,
    cols: usize,
    capacity: usize,
    learning_rate: Vec<f64>,
    momentum: Vec<f64>,
    last_delta: Vec<f64>,
    history: VecDeque<Vec<f64>>,
    /// Scratch buffer for the summed history.
    smoothed: Vec<f64>,
}

/// Equality over the trained state; the scratch buffer is ignored.
impl PartialEq for Ada {
    fn eq(&self, other: &Self) -> bool {
        self.rows == other.rows
            && self.cols == other.cols
            && self.capacity == other.capacity
            && self.learning_rate == other.learning_rate
            && self.momentum == other.momentum
            && self.last_delta == other.last_delta
            && self.history == other.history
    }
}

impl Ada {
    pub fn new(rows: usize, cols: usize, learning_rate: f64, momentum: f64, capacity: usize) -> Self {
        let len = rows * cols;
        Self {
            rows,
            cols,
            capacity,
            learning_rate: vec![learning_rate; len],
            momentum: vec![momentum; len],
            last_delta: vec![0.0; len],
            history: VecDeque::with_capacity(capacity),
            smoothed: vec![0.0; len],
        }
    }

    /// Rebuild an optimizer from saved state.
    ///
    /// # Errors
    /// `InvalidConfig` if any matrix has the wrong length, the history is longer than
    /// `capacity`, `capacity` is zero, or a learning rate or momentum is out of range.
    pub fn from_parts(
        rows: usize,
        cols: usize,
        capacity: usize,
        learning_rate: Vec<f64>,
        momentum: Vec<f64>,
        last_delta: Vec<f64>,
        history: Vec<Vec<f64>>,
    ) -> NetResult<Self> {
        let len = rows * cols;
        if capacity == 0 || history.len() > capacity {
            return Err(NetError::InvalidConfig(format!(
                "ada history of {} gradients does not fit capacity {capacity}",
                history.len()
            )));
        }
        let lengths_ok = learning_rate.len() == len
            && momentum.len() == len
            && last_delta.len() == len
            && history.iter().all(|g| g.len() == len);
        if !lengths_ok {
            return Err(NetError::InvalidConfig(format!(
                "ada state does not describe a {rows}x{cols} matrix"
            )));
        }
        learning_rate.iter().try_for_each(|&r| check_rate(r))?;
        momentum.iter().try_for_each(|&m| check_momentum(m))?;

        Ok(Self {
            rows,
            cols,
            capacity,
            learning_rate,
            momentum,
            last_delta,
            history: history.into(),
            smoothed: vec![0.0; len],
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn learning_rates(&self) -> &[f64] {
        &self.learning_rate
    }

    pub fn momenta(&self) -> &[f64] {
        &self.momentum
    }

    pub fn last_deltas(&self) -> &[f64] {
        &self.last_delta
    }

    /// Gradient history, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &[f64]> + '_ {
        self.history.iter().map(Vec::as_slice)
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    fn update(
        &mut self,
        input: ArrayView1<f64>,
        output_delta: ArrayView1<f64>,
        weights: &mut Array2<f64>,
        pool: &WorkerPool,
    ) -> Array1<f64> {
        assert_eq!(
            weights.dim(),
            (self.rows, self.cols),
            "ada optimizer is bound to a different weight shape"
        );
        let (rows, cols) = (self.rows, self.cols);

        // Reuse the evicted gradient's allocation when the history is full.
        let mut gradient = if self.history.len() >= self.capacity {
            self.history.pop_front().unwrap_or_default()
        } else {
            Vec::new()
        };
        gradient.resize(rows * cols, 0.0);
        pool.for_each_chunk_mut(&mut gradient, cols, |range, chunk| {
            for (i, row) in range.zip(chunk.chunks_mut(cols)) {
                for (g, &od) in row.iter_mut().zip(output_delta.iter()) {
                    *g = input[i] * od;
                }
            }
        });
        self.history.push_back(gradient);

        let Ada {
            learning_rate,
            momentum,
            last_delta,
            history,
            smoothed,
            ..
        } = self;
        let history: &VecDeque<Vec<f64>> = history;

        // The history is complete before the per-row summation starts.
        pool.for_each_chunk_mut(smoothed, cols, |range, chunk| {
            let offset = range.start * cols;
            for (k, s) in chunk.iter_mut().enumerate() {
                *s = history.iter().map(|g| g[offset + k]).sum();
            }
        });

        let w = row_major_mut(weights);

        let mut input_delta = vec![0.0; rows];
        {
            let w: &[f64] = w;
            pool.for_each_chunk_mut(&mut input_delta, 1, |range, deltas| {
                for (i, d) in range.zip(deltas.iter_mut()) {
                    let row = &w[i * cols..(i + 1) * cols];
                    *d = row.iter().zip(output_delta.iter()).map(|(w, od)| w * od).sum();
                }
            });
        }

        let lr: &[f64] = learning_rate;
        let mom: &[f64] = momentum;
        let smooth: &[f64] = smoothed;
        pool.zip_chunks_mut(w, cols, last_delta, cols, |range, w_rows, ld_rows| {
            let offset = range.start * cols;
            for (k, (w, ld)) in w_rows.iter_mut().zip(ld_rows.iter_mut()).enumerate() {
                let idx = offset + k;
                let delta = mom[idx] * *ld + (1.0 - mom[idx]) * (lr[idx] * smooth[idx]);
                *w += delta;
                *ld = delta;
            }
        });

        Array1::from(input_delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_sgd_uses_pre_update_weights() {
        let mut weights = array![[1.0, 2.0], [3.0, 4.0]];
        let mut opt = OptimizerConfig::sgd(0.1).build(2, 2).unwrap();
        let pool = WorkerPool::sequential();

        let input_delta = opt.update(
            array![1.0, 2.0].view(),
            array![0.5, -1.0].view(),
            &mut weights,
            &pool,
        );

        assert_abs_diff_eq!(input_delta[0], -1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(input_delta[1], -2.5, epsilon = 1e-12);

        assert_abs_diff_eq!(weights[[0, 0]], 1.05, epsilon = 1e-12);
        assert_abs_diff_eq!(weights[[0, 1]], 1.9, epsilon = 1e-12);
        assert_abs_diff_eq!(weights[[1, 0]], 3.1, epsilon = 1e-12);
        assert_abs_diff_eq!(weights[[1, 1]], 3.8, epsilon = 1e-12);
    }

    fn sample_problem(rows: usize, cols: usize) -> (Array2<f64>, Array1<f64>, Array1<f64>) {
        let weights = Array2::from_shape_fn((rows, cols), |(i, o)| {
            ((i * 7 + o * 3) as f64 * 0.113).sin()
        });
        let input = Array1::from_shape_fn(rows, |i| (i as f64 * 0.31).cos());
        let delta = Array1::from_shape_fn(cols, |o| (o as f64 * 0.57).sin() - 0.2);
        (weights, input, delta)
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let parallel_pool = WorkerPool::new(4).unwrap();
        let sequential_pool = WorkerPool::sequential();

        for config in [OptimizerConfig::sgd(0.05), OptimizerConfig::ada()] {
            let (w0, input, delta) = sample_problem(37, 11);
            let mut w_par = w0.clone();
            let mut w_seq = w0;
            let mut opt_par = config.build(37, 11).unwrap();
            let mut opt_seq = config.build(37, 11).unwrap();

            for _ in 0..7 {
                let d_par = opt_par.update(input.view(), delta.view(), &mut w_par, &parallel_pool);
                let d_seq =
                    opt_seq.update(input.view(), delta.view(), &mut w_seq, &sequential_pool);
                assert_eq!(d_par, d_seq);
            }
            assert_eq!(w_par, w_seq, "{} diverged across pools", config.name());
        }
    }

    #[test]
    fn test_ada_first_step() {
        let mut weights = array![[0.5]];
        let mut opt = OptimizerConfig::ada().build(1, 1).unwrap();
        let pool = WorkerPool::sequential();

        let input_delta = opt.update(array![2.0].view(), array![3.0].view(), &mut weights, &pool);

        // gradient = 6, delta = 0.8 * 0.01 * 6
        assert_abs_diff_eq!(weights[[0, 0]], 0.5 + 0.048, epsilon = 1e-12);
        assert_abs_diff_eq!(input_delta[0], 1.5, epsilon = 1e-12);

        let WeightsOptimizer::Ada(ada) = &opt else {
            panic!("expected ada");
        };
        assert_abs_diff_eq!(ada.last_deltas()[0], 0.048, epsilon = 1e-12);
    }

    #[test]
    fn test_ada_second_step_smooths_and_carries_momentum() {
        let mut weights = array![[0.0]];
        let mut opt = OptimizerConfig::ada().build(1, 1).unwrap();
        let pool = WorkerPool::sequential();

        opt.update(array![1.0].view(), array![1.0].view(), &mut weights, &pool);
        opt.update(array![1.0].view(), array![2.0].view(), &mut weights, &pool);

        // step 1: delta1 = 0.8 * 0.01 * 1 = 0.008
        // step 2: smoothed = 1 + 2 = 3, delta2 = 0.2 * 0.008 + 0.8 * 0.03 = 0.0256
        assert_abs_diff_eq!(weights[[0, 0]], 0.008 + 0.0256, epsilon = 1e-12);
    }

    #[test]
    fn test_ada_history_is_bounded_fifo() {
        let mut weights = array![[0.0]];
        let mut opt = OptimizerConfig::ada().build(1, 1).unwrap();
        let pool = WorkerPool::sequential();

        for pass in 1..=6 {
            opt.update(
                array![pass as f64].view(),
                array![1.0].view(),
                &mut weights,
                &pool,
            );
            let WeightsOptimizer::Ada(ada) = &opt else {
                panic!("expected ada");
            };
            assert_eq!(ada.history_len(), pass.min(5));
        }

        let WeightsOptimizer::Ada(ada) = &opt else {
            panic!("expected ada");
        };
        let history: Vec<f64> = ada.history().map(|g| g[0]).collect();
        // The first gradient (1.0) was evicted, the rest stay in arrival order.
        assert_eq!(history, vec![2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_ada_from_parts_validates() {
        assert!(Ada::from_parts(1, 2, 2, vec![0.1; 2], vec![0.2; 2], vec![0.0; 2], vec![]).is_ok());
        assert!(Ada::from_parts(1, 2, 2, vec![0.1; 3], vec![0.2; 2], vec![0.0; 2], vec![]).is_err());
        assert!(Ada::from_parts(
            1,
            2,
            1,
            vec![0.1; 2],
            vec![0.2; 2],
            vec![0.0; 2],
            vec![vec![0.0; 2], vec![0.0; 2]]
        )
        .is_err());
    }

    #[test]
    fn test_ada_from_parts_checks_rates() {
        let parts = |lr: f64, mom: f64| {
            Ada::from_parts(1, 1, 2, vec![lr], vec![mom], vec![0.0], vec![])
        };
        assert!(parts(0.01, 0.2).is_ok());
        assert!(parts(f64::NAN, 0.2).is_err());
        assert!(parts(-0.01, 0.2).is_err());
        assert!(parts(0.01, 1.5).is_err());
        assert!(Sgd::try_new(0.0).is_err());
        assert!(Sgd::try_new(f64::INFINITY).is_err());
        assert_eq!(Sgd::try_new(0.1).unwrap(), Sgd::new(0.1));
    }

    #[test]
    fn test_ada_equality_ignores_scratch() {
        let mut weights = array![[0.3, -0.1], [0.2, 0.4]];
        let mut opt = OptimizerConfig::ada().build(2, 2).unwrap();
        let pool = WorkerPool::sequential();
        for _ in 0..3 {
            opt.update(array![1.0, -0.5].view(), array![0.25, 0.75].view(), &mut weights, &pool);
        }
        let WeightsOptimizer::Ada(ada) = &opt else {
            panic!("expected ada");
        };

        let rebuilt = Ada::from_parts(
            2,
            2,
            ada.capacity(),
            ada.learning_rates().to_vec(),
            ada.momenta().to_vec(),
            ada.last_deltas().to_vec(),
            ada.history().map(<[f64]>::to_vec).collect(),
        )
        .unwrap();
        assert_eq!(ada, &rebuilt);
        assert_eq!(opt, WeightsOptimizer::Ada(rebuilt));
    }

    #[test]
    fn test_config_validation() {
        assert!(OptimizerConfig::sgd(0.0).build(1, 1).is_err());
        assert!(OptimizerConfig::sgd(f64::NAN).build(1, 1).is_err());
        let bad_momentum = OptimizerConfig::Ada {
            learning_rate: 0.01,
            momentum: 1.0,
            history: 5,
        };
        assert!(bad_momentum.build(1, 1).is_err());
        let no_history = OptimizerConfig::Ada {
            learning_rate: 0.01,
            momentum: 0.2,
            history: 0,
        };
        assert!(no_history.build(1, 1).is_err());
    }

    #[test]
    fn test_config_from_name_and_json() {
        assert_eq!(OptimizerConfig::from_name("ADA").unwrap(), OptimizerConfig::ada());
        assert!(matches!(
            OptimizerConfig::from_name("adam"),
            Err(NetError::UnknownOptimizer(_))
        ));

        let parsed: OptimizerConfig =
            serde_json::from_str(r#"{"kind": "ada", "learning_rate": 0.05}"#).unwrap();
        assert_eq!(
            parsed,
            OptimizerConfig::Ada {
                learning_rate: 0.05,
                momentum: 0.2,
                history: 5
            }
        );
    }

    #[test]
    fn test_with_learning_rate_keeps_kind() {
        let ada = OptimizerConfig::ada().with_learning_rate(0.3);
        assert_eq!(ada.name(), "ada");
        assert!(matches!(ada, OptimizerConfig::Ada { learning_rate, .. } if learning_rate == 0.3));
    }
}
