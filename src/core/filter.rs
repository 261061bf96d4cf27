//! 2-D filter and pooling nodes over row-major reshaped inputs.
//!
//! Both split an `rows × cols` grid into non-overlapping `kr × kc` windows
//! (stride = window size) and reduce each window to one output value, giving an
//! output grid of `(rows / kr) × (cols / kc)` flattened row-major.

use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::error::{NetError, NetResult};

/// Window geometry shared by [`Filter2D`] and [`Pool2D`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Windows {
    rows: usize,
    cols: usize,
    kr: usize,
    kc: usize,
}

impl Windows {
    /// # Errors
    /// `InvalidConfig` for empty grids or windows, or windows that do not tile the grid.
    pub fn new(rows: usize, cols: usize, kr: usize, kc: usize) -> NetResult<Self> {
        if rows == 0 || cols == 0 || kr == 0 || kc == 0 {
            return Err(NetError::InvalidConfig(format!(
                "grid {rows}x{cols} and window {kr}x{kc} must be non-empty"
            )));
        }
        if rows % kr != 0 || cols % kc != 0 {
            return Err(NetError::InvalidConfig(format!(
                "window {kr}x{kc} does not tile a {rows}x{cols} grid"
            )));
        }
        Ok(Self { rows, cols, kr, kc })
    }

    pub fn input_size(&self) -> usize {
        self.rows * self.cols
    }

    pub fn output_shape(&self) -> (usize, usize) {
        (self.rows / self.kr, self.cols / self.kc)
    }

    pub fn output_size(&self) -> usize {
        let (r, c) = self.output_shape();
        r * c
    }

    /// Flat input indices covered by output cell `out`, with their window offsets `(a, b)`.
    fn cells(&self, out: usize) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
        let out_cols = self.cols / self.kc;
        let (br, bc) = (out / out_cols, out % out_cols);
        (0..self.kr).flat_map(move |a| {
            (0..self.kc).map(move |b| ((br * self.kr + a) * self.cols + bc * self.kc + b, a, b))
        })
    }
}

/// Weighted sum of every window with a fixed kernel.
///
/// The kernel is configuration, not a trained parameter: backward only routes deltas.
#[derive(Debug, Clone)]
pub struct Filter2D {
    windows: Windows,
    kernel: Array2<f64>,
}

impl Filter2D {
    pub fn new(rows: usize, cols: usize, kernel: Array2<f64>) -> NetResult<Self> {
        let (kr, kc) = kernel.dim();
        let windows = Windows::new(rows, cols, kr, kc)?;
        Ok(Self { windows, kernel })
    }

    pub fn windows(&self) -> &Windows {
        &self.windows
    }

    pub fn kernel(&self) -> &Array2<f64> {
        &self.kernel
    }

    pub fn forward(&self, input: ArrayView1<f64>) -> Array1<f64> {
        Array1::from_shape_fn(self.windows.output_size(), |out| {
            self.windows
                .cells(out)
                .map(|(i, a, b)| self.kernel[[a, b]] * input[i])
                .sum()
        })
    }

    pub fn backward(&self, delta_out: ArrayView1<f64>) -> Array1<f64> {
        let mut delta_in = Array1::zeros(self.windows.input_size());
        for (out, &d) in delta_out.iter().enumerate() {
            for (i, a, b) in self.windows.cells(out) {
                delta_in[i] = self.kernel[[a, b]] * d;
            }
        }
        delta_in
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    Max,
    Average,
}

/// Max or average reduction of every window.
#[derive(Debug, Clone)]
pub struct Pool2D {
    windows: Windows,
    kind: PoolKind,
    /// Input index that won each window in the last max-pool forward pass.
    winners: Vec<usize>,
}

impl Pool2D {
    pub fn new(rows: usize, cols: usize, window: (usize, usize), kind: PoolKind) -> NetResult<Self> {
        let windows = Windows::new(rows, cols, window.0, window.1)?;
        Ok(Self {
            windows,
            kind,
            winners: Vec::new(),
        })
    }

    pub fn windows(&self) -> &Windows {
        &self.windows
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn forward(&mut self, input: ArrayView1<f64>) -> Array1<f64> {
        let n = self.windows.output_size();
        match self.kind {
            PoolKind::Max => {
                self.winners.clear();
                let mut out = Array1::zeros(n);
                for (o, v) in out.iter_mut().enumerate() {
                    // First maximum wins on ties.
                    let (best, value) = self
                        .windows
                        .cells(o)
                        .map(|(i, _, _)| (i, input[i]))
                        .fold((usize::MAX, f64::NEG_INFINITY), |acc, cur| {
                            if cur.1 > acc.1 || acc.0 == usize::MAX {
                                cur
                            } else {
                                acc
                            }
                        });
                    self.winners.push(best);
                    *v = value;
                }
                out
            }
            PoolKind::Average => {
                let area = (self.windows.kr * self.windows.kc) as f64;
                Array1::from_shape_fn(n, |o| {
                    self.windows.cells(o).map(|(i, _, _)| input[i]).sum::<f64>() / area
                })
            }
        }
    }

    pub fn backward(&self, delta_out: ArrayView1<f64>) -> Array1<f64> {
        let mut delta_in = Array1::zeros(self.windows.input_size());
        match self.kind {
            PoolKind::Max => {
                for (&winner, &d) in self.winners.iter().zip(delta_out.iter()) {
                    delta_in[winner] = d;
                }
            }
            PoolKind::Average => {
                let area = (self.windows.kr * self.windows.kc) as f64;
                for (o, &d) in delta_out.iter().enumerate() {
                    for (i, _, _) in self.windows.cells(o) {
                        delta_in[i] = d / area;
                    }
                }
            }
        }
        delta_in
    }
}
