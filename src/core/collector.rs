//! Collectors reduce the vectors arriving on several edges into one.
//!
//! Every collector is a linear combination `Σ c_k · v_k`. Forward uses the
//! coefficients to merge input vectors; backward hands input edge `k` the share
//! `c_k · delta` of the node's input delta, which is exactly the gradient of the
//! combination.

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::error::{NetError, NetResult};

/// Weighting scheme of [`Collector::Average`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AverageKind {
    /// Equal weights, 1/n.
    Simple,
    /// Weights `alpha (1 - alpha)^(n-1-k)`, normalized; the last vector is the newest.
    Exponential { alpha: f64 },
    /// Linear weights `(k + 1) / Σ`, the last vector weighs most.
    Weighted,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Collector {
    /// Elementwise sum.
    Addition,
    /// Moving-average style weighted combination.
    Average { average: AverageKind },
    /// Elementwise mean.
    Centroid,
    /// Pass-through of exactly one vector.
    Transfer,
}

impl Default for Collector {
    fn default() -> Self {
        Collector::Addition
    }
}

impl Collector {
    pub fn name(&self) -> &'static str {
        match self {
            Collector::Addition => "addition",
            Collector::Average { .. } => "average",
            Collector::Centroid => "centroid",
            Collector::Transfer => "transfer",
        }
    }

    /// Coefficient applied to each of `count` incoming vectors.
    ///
    /// # Errors
    /// `Collector` when `count` is zero, when a transfer collector sees more than one
    /// vector, or when an exponential average has `alpha` outside `(0, 1]`.
    pub fn coefficients(&self, count: usize) -> NetResult<Vec<f64>> {
        if count == 0 {
            return Err(self.reject(count, "nothing was queued"));
        }

        let n = count as f64;
        let coefficients = match *self {
            Collector::Addition => vec![1.0; count],
            Collector::Centroid | Collector::Average { average: AverageKind::Simple } => {
                vec![1.0 / n; count]
            }
            Collector::Transfer => {
                if count != 1 {
                    return Err(self.reject(count, "exactly one vector is required"));
                }
                vec![1.0]
            }
            Collector::Average { average: AverageKind::Exponential { alpha } } => {
                if !(alpha > 0.0 && alpha <= 1.0) {
                    return Err(self.reject(count, "alpha must lie in (0, 1]"));
                }
                let raw: Vec<f64> = (0..count)
                    .map(|k| alpha * (1.0 - alpha).powi((count - 1 - k) as i32))
                    .collect();
                let total: f64 = raw.iter().sum();
                raw.into_iter().map(|w| w / total).collect()
            }
            Collector::Average { average: AverageKind::Weighted } => {
                let total = n * (n + 1.0) / 2.0;
                (0..count).map(|k| (k as f64 + 1.0) / total).collect()
            }
        };

        Ok(coefficients)
    }

    /// Reduce `vectors` into one.
    ///
    /// # Errors
    /// See [`coefficients`](Self::coefficients); also `Collector` when the vectors
    /// have different lengths.
    pub fn collect(&self, vectors: &[ArrayView1<f64>]) -> NetResult<Array1<f64>> {
        let coefficients = self.coefficients(vectors.len())?;
        let len = vectors[0].len();

        if let Some(bad) = vectors.iter().find(|v| v.len() != len) {
            return Err(self.reject(
                vectors.len(),
                &format!("vector lengths differ ({} vs {len})", bad.len()),
            ));
        }

        let mut out = Array1::zeros(len);
        for (v, &c) in vectors.iter().zip(&coefficients) {
            out.scaled_add(c, v);
        }
        Ok(out)
    }

    fn reject(&self, count: usize, reason: &str) -> NetError {
        NetError::Collector {
            collector: self.name(),
            count,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_addition() {
        let a = array![1.0, 2.0];
        let b = array![3.0, -1.0];
        let out = Collector::Addition.collect(&[a.view(), b.view()]).unwrap();
        assert_eq!(out, array![4.0, 1.0]);
    }

    #[test]
    fn test_centroid() {
        let a = array![1.0, 2.0];
        let b = array![3.0, 4.0];
        let out = Collector::Centroid.collect(&[a.view(), b.view()]).unwrap();
        assert_eq!(out, array![2.0, 3.0]);
    }

    #[test]
    fn test_transfer_requires_single_vector() {
        let a = array![1.0, 2.0];
        let out = Collector::Transfer.collect(&[a.view()]).unwrap();
        assert_eq!(out, a);

        assert!(Collector::Transfer.collect(&[]).is_err());
        let err = Collector::Transfer
            .collect(&[a.view(), a.view()])
            .unwrap_err();
        assert!(matches!(err, NetError::Collector { count: 2, .. }));
    }

    #[test]
    fn test_empty_rejected_by_all() {
        for c in [Collector::Addition, Collector::Centroid] {
            assert!(c.collect(&[]).is_err());
        }
    }

    #[test]
    fn test_length_mismatch() {
        let a = array![1.0, 2.0];
        let b = array![1.0];
        assert!(Collector::Addition.collect(&[a.view(), b.view()]).is_err());
    }

    #[test]
    fn test_weighted_average_favours_last() {
        let c = Collector::Average { average: AverageKind::Weighted };
        let w = c.coefficients(3).unwrap();
        assert_abs_diff_eq!(w.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(w[0], 1.0 / 6.0, epsilon = 1e-12);
        assert_abs_diff_eq!(w[2], 3.0 / 6.0, epsilon = 1e-12);
    }

    #[test]
    fn test_exponential_average() {
        let c = Collector::Average {
            average: AverageKind::Exponential { alpha: 0.5 },
        };
        let w = c.coefficients(2).unwrap();
        // raw weights 0.25, 0.5
        assert_abs_diff_eq!(w[0], 1.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(w[1], 2.0 / 3.0, epsilon = 1e-12);

        let bad = Collector::Average {
            average: AverageKind::Exponential { alpha: 0.0 },
        };
        assert!(bad.coefficients(2).is_err());
    }

    #[test]
    fn test_simple_average_equals_centroid() {
        let a = array![1.0, 5.0];
        let b = array![2.0, 7.0];
        let c = array![3.0, 0.0];
        let views = [a.view(), b.view(), c.view()];
        let simple = Collector::Average { average: AverageKind::Simple }
            .collect(&views)
            .unwrap();
        let centroid = Collector::Centroid.collect(&views).unwrap();
        assert_eq!(simple, centroid);
    }
}
