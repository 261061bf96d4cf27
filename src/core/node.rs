//! Computation nodes and their per-step state machine.
//!
//! ## Step protocol
//!
//! ```text
//! Idle ──forward──▶ BackwardReady ──backward──▶ Idle
//!         (ForwardReady while collecting inputs)
//! ```
//!
//! A node reads its input edges, writes its output edges, and on the way back
//! sums the deltas found on its output edges and writes its share of the input
//! delta into each input edge. Nodes never hold references to each other: edges
//! are addressed by [`EdgeId`] in the owning network's arena.

use ndarray::{s, Array1, Array2, ArrayView1};

use super::activation::Activation;
use super::collector::Collector;
use super::edge::{Edge, EdgeId};
use super::filter::{Filter2D, Pool2D};
use super::optimizer::WeightsOptimizer;
use crate::error::{NetError, NetResult};
use crate::pool::WorkerPool;

/// Index of a [`Node`] in its network's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Where a node is within one forward/backward step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePhase {
    Idle,
    ForwardReady,
    BackwardReady,
}

/// Source node holding its slice of the network input.
#[derive(Debug, Clone)]
pub struct InputNode {
    values: Array1<f64>,
}

impl InputNode {
    pub fn new(size: usize) -> Self {
        Self {
            values: Array1::zeros(size),
        }
    }

    pub fn size(&self) -> usize {
        self.values.len()
    }

    pub fn values(&self) -> ArrayView1<'_, f64> {
        self.values.view()
    }

    pub(crate) fn set_values(&mut self, values: ArrayView1<f64>) {
        self.values.assign(&values);
    }
}

/// Dense `[inputs (+ bias)][outputs]` weight matrix with its optimizer.
#[derive(Debug, Clone)]
pub struct WeightsNode {
    weights: Array2<f64>,
    bias: bool,
    optimizer: WeightsOptimizer,
    /// Last forward input; the trailing bias cell is always 1.
    input: Array1<f64>,
}

impl WeightsNode {
    /// # Errors
    /// `ShapeMismatch` when a bias node is given a matrix without room for the bias row.
    pub fn new(weights: Array2<f64>, bias: bool, optimizer: WeightsOptimizer) -> NetResult<Self> {
        let rows = weights.nrows();
        if bias && rows == 0 {
            return Err(NetError::shape("bias row", 1, 0));
        }
        Ok(Self {
            input: Array1::ones(rows),
            weights,
            bias,
            optimizer,
        })
    }

    /// Width of the input vector, excluding the bias cell.
    pub fn input_size(&self) -> usize {
        self.weights.nrows() - usize::from(self.bias)
    }

    pub fn output_size(&self) -> usize {
        self.weights.ncols()
    }

    pub fn has_bias(&self) -> bool {
        self.bias
    }

    pub fn weights(&self) -> &Array2<f64> {
        &self.weights
    }

    pub fn optimizer(&self) -> &WeightsOptimizer {
        &self.optimizer
    }

    /// Replace the weight matrix, keeping the optimizer state.
    ///
    /// # Errors
    /// `ShapeMismatch` if `weights` is not shaped like the current matrix.
    pub fn set_weights(&mut self, weights: Array2<f64>) -> NetResult<()> {
        let (rows, cols) = self.weights.dim();
        if weights.nrows() != rows {
            return Err(NetError::shape("weight rows", rows, weights.nrows()));
        }
        if weights.ncols() != cols {
            return Err(NetError::shape("weight columns", cols, weights.ncols()));
        }
        self.weights = weights;
        Ok(())
    }

    pub(crate) fn restore(&mut self, weights: Array2<f64>, optimizer: WeightsOptimizer) {
        self.weights = weights;
        self.optimizer = optimizer;
    }

    /// `out[o] = Σ_i in[i] · w[i][o]`, one output column per task.
    fn forward(&mut self, x: ArrayView1<f64>, pool: &WorkerPool) -> Array1<f64> {
        let n = self.input_size();
        self.input.slice_mut(s![..n]).assign(&x);

        let (input, weights) = (&self.input, &self.weights);
        let mut out = vec![0.0; weights.ncols()];
        pool.for_each_chunk_mut(&mut out, 1, |range, chunk| {
            for (o, value) in range.zip(chunk.iter_mut()) {
                *value = input.dot(&weights.column(o));
            }
        });
        Array1::from(out)
    }

    fn backward(&mut self, delta_out: ArrayView1<f64>, pool: &WorkerPool) -> Array1<f64> {
        let delta = self
            .optimizer
            .update(self.input.view(), delta_out, &mut self.weights, pool);
        if self.bias {
            delta.slice(s![..self.input_size()]).to_owned()
        } else {
            delta
        }
    }
}

/// Elementwise (or, for softmax, joint) transfer function.
#[derive(Debug, Clone)]
pub struct FunctionNode {
    activation: Activation,
    trigger: Array1<f64>,
    output: Array1<f64>,
}

impl FunctionNode {
    pub fn new(activation: Activation, size: usize) -> Self {
        Self {
            activation,
            trigger: Array1::zeros(size),
            output: Array1::zeros(size),
        }
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn trigger(&self) -> ArrayView1<'_, f64> {
        self.trigger.view()
    }

    pub fn output(&self) -> ArrayView1<'_, f64> {
        self.output.view()
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Input(InputNode),
    Weights(WeightsNode),
    Function(FunctionNode),
    Filter2D(Filter2D),
    Pool2D(Pool2D),
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Input(_) => "input",
            NodeKind::Weights(_) => "weights",
            NodeKind::Function(_) => "function",
            NodeKind::Filter2D(_) => "filter2d",
            NodeKind::Pool2D(_) => "pool2d",
        }
    }

    /// Width of the collected input vector; `None` for input nodes.
    pub fn input_size(&self) -> Option<usize> {
        match self {
            NodeKind::Input(_) => None,
            NodeKind::Weights(w) => Some(w.input_size()),
            NodeKind::Function(f) => Some(f.output.len()),
            NodeKind::Filter2D(f) => Some(f.windows().input_size()),
            NodeKind::Pool2D(p) => Some(p.windows().input_size()),
        }
    }

    pub fn output_size(&self) -> usize {
        match self {
            NodeKind::Input(n) => n.size(),
            NodeKind::Weights(w) => w.output_size(),
            NodeKind::Function(f) => f.output.len(),
            NodeKind::Filter2D(f) => f.windows().output_size(),
            NodeKind::Pool2D(p) => p.windows().output_size(),
        }
    }
}

/// A named node wired to edges of its network.
#[derive(Debug, Clone)]
pub struct Node {
    name: String,
    kind: NodeKind,
    inputs: Vec<EdgeId>,
    outputs: Vec<EdgeId>,
    collector: Collector,
    phase: NodePhase,
}

impl Node {
    pub(crate) fn new(name: impl Into<String>, kind: NodeKind, inputs: Vec<EdgeId>) -> Self {
        Self {
            name: name.into(),
            kind,
            inputs,
            outputs: Vec::new(),
            collector: Collector::default(),
            phase: NodePhase::Idle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn inputs(&self) -> &[EdgeId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[EdgeId] {
        &self.outputs
    }

    pub fn collector(&self) -> Collector {
        self.collector
    }

    pub fn phase(&self) -> NodePhase {
        self.phase
    }

    pub fn output_size(&self) -> usize {
        self.kind.output_size()
    }

    pub fn as_weights(&self) -> Option<&WeightsNode> {
        match &self.kind {
            NodeKind::Weights(w) => Some(w),
            _ => None,
        }
    }

    pub(crate) fn as_weights_mut(&mut self) -> Option<&mut WeightsNode> {
        match &mut self.kind {
            NodeKind::Weights(w) => Some(w),
            _ => None,
        }
    }

    pub(crate) fn as_input_mut(&mut self) -> Option<&mut InputNode> {
        match &mut self.kind {
            NodeKind::Input(n) => Some(n),
            _ => None,
        }
    }

    pub(crate) fn set_collector(&mut self, collector: Collector) {
        self.collector = collector;
    }

    pub(crate) fn add_output(&mut self, edge: EdgeId) {
        self.outputs.push(edge);
    }

    pub(crate) fn reset(&mut self) {
        self.phase = NodePhase::Idle;
    }

    /// Collect the input edges, compute, and write every output edge.
    ///
    /// Forward may be repeated from any phase; it always leaves the node ready for backward.
    ///
    /// # Errors
    /// `Collector` if the node's collector rejects its input vectors.
    pub(crate) fn forward(&mut self, edges: &mut [Edge], pool: &WorkerPool) -> NetResult<()> {
        self.phase = NodePhase::ForwardReady;

        let collected = if self.inputs.is_empty() {
            None
        } else {
            let views: Vec<ArrayView1<f64>> = self
                .inputs
                .iter()
                .map(|id| edges[id.0].read_forward())
                .collect();
            Some(self.collector.collect(&views)?)
        };

        let output = match (&mut self.kind, collected) {
            (NodeKind::Input(node), _) => node.values.clone(),
            (NodeKind::Weights(node), Some(x)) => node.forward(x.view(), pool),
            (NodeKind::Function(node), Some(x)) => {
                node.output = node.activation.activations(x.view());
                node.trigger = x;
                node.output.clone()
            }
            (NodeKind::Filter2D(node), Some(x)) => node.forward(x.view()),
            (NodeKind::Pool2D(node), Some(x)) => node.forward(x.view()),
            (kind, None) => {
                return Err(NetError::InvalidConfig(format!(
                    "{} node `{}` has no input edges",
                    kind.name(),
                    self.name
                )))
            }
        };

        for id in &self.outputs {
            edges[id.0].write_forward(output.view());
        }
        self.phase = NodePhase::BackwardReady;
        Ok(())
    }

    /// Sum the output-edge deltas, propagate through the node and split the input
    /// delta over the input edges with the collector's coefficients.
    ///
    /// # Errors
    /// `NodeState` unless the node has just run forward.
    pub(crate) fn backward(&mut self, edges: &mut [Edge], pool: &WorkerPool) -> NetResult<()> {
        if self.phase != NodePhase::BackwardReady {
            return Err(NetError::NodeState {
                node: self.name.clone(),
                actual: self.phase,
                expected: NodePhase::BackwardReady,
            });
        }

        let mut delta_out = Array1::zeros(self.output_size());
        for id in &self.outputs {
            delta_out += &edges[id.0].read_backward();
        }

        let delta_in = match &mut self.kind {
            NodeKind::Input(_) => None,
            NodeKind::Weights(node) => Some(node.backward(delta_out.view(), pool)),
            NodeKind::Function(node) => {
                Some(node.activation.derivatives(node.output.view()) * &delta_out)
            }
            NodeKind::Filter2D(node) => Some(node.backward(delta_out.view())),
            NodeKind::Pool2D(node) => Some(node.backward(delta_out.view())),
        };

        if let Some(delta_in) = delta_in {
            let coefficients = self.collector.coefficients(self.inputs.len())?;
            for (id, c) in self.inputs.iter().zip(coefficients) {
                edges[id.0].write_backward((&delta_in * c).view());
            }
        }

        self.phase = NodePhase::Idle;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::optimizer::Sgd;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn sgd(rate: f64) -> WeightsOptimizer {
        WeightsOptimizer::Sgd(Sgd::new(rate))
    }

    #[test]
    fn test_weights_forward_with_bias() {
        // rows: x0, x1, bias
        let w = array![[1.0, 0.0], [0.0, 2.0], [0.5, -0.5]];
        let mut node = WeightsNode::new(w, true, sgd(0.1)).unwrap();
        assert_eq!(node.input_size(), 2);

        let out = node.forward(array![3.0, 4.0].view(), &WorkerPool::sequential());
        assert_eq!(out, array![3.5, 7.5]);
    }

    #[test]
    fn test_weights_backward_drops_bias_delta() {
        let w = array![[1.0, 0.0], [0.0, 2.0], [0.5, -0.5]];
        let mut node = WeightsNode::new(w, true, sgd(0.1)).unwrap();
        let pool = WorkerPool::sequential();
        node.forward(array![1.0, 1.0].view(), &pool);

        let delta = node.backward(array![1.0, 1.0].view(), &pool);
        assert_eq!(delta, array![1.0, 2.0]);
        // bias row moves by lr * delta * 1
        assert_abs_diff_eq!(node.weights()[[2, 0]], 0.6, epsilon = 1e-12);
        assert_abs_diff_eq!(node.weights()[[2, 1]], -0.4, epsilon = 1e-12);
    }

    #[test]
    fn test_set_weights_checks_shape() {
        let mut node = WeightsNode::new(Array2::zeros((2, 3)), false, sgd(0.1)).unwrap();
        assert!(node.set_weights(Array2::ones((3, 2))).is_err());
        assert!(node.set_weights(Array2::ones((2, 3))).is_ok());
        assert_eq!(node.weights().sum(), 6.0);
    }

    #[test]
    fn test_function_node_round_trip_through_edges() {
        let pool = WorkerPool::sequential();
        let mut edges = vec![Edge::new(2), Edge::new(2)];
        edges[0].write_forward(array![0.0, 0.0].view());

        let kind = NodeKind::Function(FunctionNode::new(Activation::Sigmoid, 2));
        let mut node = Node::new("sigmoid", kind, vec![EdgeId(0)]);
        node.add_output(EdgeId(1));

        node.forward(&mut edges, &pool).unwrap();
        assert_eq!(node.phase(), NodePhase::BackwardReady);
        assert_eq!(edges[1].read_forward(), array![0.5, 0.5]);

        edges[1].write_backward(array![1.0, -2.0].view());
        node.backward(&mut edges, &pool).unwrap();
        assert_eq!(node.phase(), NodePhase::Idle);
        assert_eq!(edges[0].read_backward(), array![0.25, -0.5]);
    }

    #[test]
    fn test_backward_before_forward_is_rejected() {
        let pool = WorkerPool::sequential();
        let mut edges = vec![Edge::new(1), Edge::new(1)];
        let kind = NodeKind::Function(FunctionNode::new(Activation::Tanh, 1));
        let mut node = Node::new("tanh", kind, vec![EdgeId(0)]);
        node.add_output(EdgeId(1));

        let err = node.backward(&mut edges, &pool).unwrap_err();
        assert!(matches!(
            err,
            NetError::NodeState {
                actual: NodePhase::Idle,
                expected: NodePhase::BackwardReady,
                ..
            }
        ));
    }

    #[test]
    fn test_collector_splits_backward_delta() {
        let pool = WorkerPool::sequential();
        let mut edges = vec![Edge::new(1), Edge::new(1), Edge::new(1)];
        edges[0].write_forward(array![2.0].view());
        edges[1].write_forward(array![4.0].view());

        let kind = NodeKind::Function(FunctionNode::new(Activation::relu(), 1));
        let mut node = Node::new("merge", kind, vec![EdgeId(0), EdgeId(1)]);
        node.set_collector(Collector::Centroid);
        node.add_output(EdgeId(2));

        node.forward(&mut edges, &pool).unwrap();
        assert_eq!(edges[2].read_forward(), array![3.0]);

        edges[2].write_backward(array![1.0].view());
        node.backward(&mut edges, &pool).unwrap();
        assert_eq!(edges[0].read_backward(), array![0.5]);
        assert_eq!(edges[1].read_backward(), array![0.5]);
    }

    #[test]
    fn test_output_deltas_are_summed() {
        let pool = WorkerPool::sequential();
        let mut edges = vec![Edge::new(1), Edge::new(1), Edge::new(1)];
        edges[0].write_forward(array![0.0].view());

        let kind = NodeKind::Function(FunctionNode::new(Activation::Tanh, 1));
        let mut node = Node::new("fan-out", kind, vec![EdgeId(0)]);
        node.add_output(EdgeId(1));
        node.add_output(EdgeId(2));

        node.forward(&mut edges, &pool).unwrap();
        edges[1].write_backward(array![0.25].view());
        edges[2].write_backward(array![0.5].view());
        node.backward(&mut edges, &pool).unwrap();

        // tanh'(0) = 1
        assert_abs_diff_eq!(edges[0].read_backward()[0], 0.75, epsilon = 1e-12);
    }
}
