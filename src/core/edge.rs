//! Fixed-size data channels between nodes.

use ndarray::{Array1, ArrayView1};

/// Index of an [`Edge`] in its network's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub(crate) usize);

impl EdgeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A directed channel carrying a forward value vector and a backward delta vector.
///
/// Both vectors keep the size declared at construction for the edge's whole life.
/// Writes with any other length are programming errors and panic.
#[derive(Debug, Clone)]
pub struct Edge {
    forward: Array1<f64>,
    backward: Array1<f64>,
}

impl Edge {
    pub fn new(size: usize) -> Self {
        Self {
            forward: Array1::zeros(size),
            backward: Array1::zeros(size),
        }
    }

    pub fn size(&self) -> usize {
        self.forward.len()
    }

    /// # Panics
    /// If `values.len() != self.size()`.
    pub fn write_forward(&mut self, values: ArrayView1<f64>) {
        assert_eq!(
            values.len(),
            self.size(),
            "forward write of {} values into an edge of size {}",
            values.len(),
            self.size()
        );
        self.forward.assign(&values);
    }

    pub fn read_forward(&self) -> ArrayView1<'_, f64> {
        self.forward.view()
    }

    /// # Panics
    /// If `values.len() != self.size()`.
    pub fn write_backward(&mut self, values: ArrayView1<f64>) {
        assert_eq!(
            values.len(),
            self.size(),
            "backward write of {} values into an edge of size {}",
            values.len(),
            self.size()
        );
        self.backward.assign(&values);
    }

    pub fn read_backward(&self) -> ArrayView1<'_, f64> {
        self.backward.view()
    }

    /// Zero both vectors.
    pub fn clear(&mut self) {
        self.forward.fill(0.0);
        self.backward.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_new_edge_is_zeroed() {
        let edge = Edge::new(3);
        assert_eq!(edge.size(), 3);
        assert_eq!(edge.read_forward(), array![0.0, 0.0, 0.0]);
        assert_eq!(edge.read_backward(), array![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_write_and_read() {
        let mut edge = Edge::new(2);
        edge.write_forward(array![1.0, 2.0].view());
        edge.write_backward(array![-0.5, 0.25].view());
        assert_eq!(edge.read_forward(), array![1.0, 2.0]);
        assert_eq!(edge.read_backward(), array![-0.5, 0.25]);

        edge.clear();
        assert_eq!(edge.read_forward(), array![0.0, 0.0]);
        assert_eq!(edge.size(), 2);
    }

    #[test]
    #[should_panic(expected = "edge of size 2")]
    fn test_forward_length_mismatch_panics() {
        let mut edge = Edge::new(2);
        edge.write_forward(array![1.0, 2.0, 3.0].view());
    }

    #[test]
    #[should_panic(expected = "edge of size 3")]
    fn test_backward_length_mismatch_panics() {
        let mut edge = Edge::new(3);
        edge.write_backward(array![1.0].view());
    }
}
