//! Loss, error-signal and classification helpers.

use ndarray::{Array1, ArrayView1};

/// Squared-error loss: 0.5 * Σ (t - y)²
#[inline]
pub fn squared_error(target: ArrayView1<f64>, output: ArrayView1<f64>) -> f64 {
    0.5 * target
        .iter()
        .zip(output.iter())
        .map(|(t, y)| (t - y) * (t - y))
        .sum::<f64>()
}

/// Backward seed for the squared-error loss: t - y.
#[inline]
pub fn error_signal(target: ArrayView1<f64>, output: ArrayView1<f64>) -> Array1<f64> {
    &target - &output
}

/// Index of the largest value; the first one wins ties. `None` for an empty vector.
pub fn argmax(values: ArrayView1<f64>) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &v) in values.iter().enumerate() {
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_squared_error() {
        let t = array![1.0, 0.0];
        let y = array![0.5, 0.5];
        assert_abs_diff_eq!(squared_error(t.view(), y.view()), 0.25, epsilon = 1e-12);
        assert_eq!(error_signal(t.view(), y.view()), array![0.5, -0.5]);
    }

    #[test]
    fn test_argmax() {
        assert_eq!(argmax(array![0.1, 0.7, 0.2].view()), Some(1));
        assert_eq!(argmax(array![0.5, 0.5].view()), Some(0));
        assert_eq!(argmax(Array1::<f64>::zeros(0).view()), None);
    }
}
