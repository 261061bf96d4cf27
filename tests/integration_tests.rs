//! Integration tests for end-to-end training.
//!
//! These tests verify behavior across the whole engine:
//! - A single-layer network cannot learn XOR
//! - Hidden layers reduce the loss on separable problems
//! - Forward passes are deterministic and shapes never change
//! - Parallel and sequential pools train identically

use approx::assert_abs_diff_eq;
use ndarray::{array, Array1};
use nodenet::training::evaluate;
use nodenet::{
    Activation, NetError, NetworkBuilder, Network, OptimizerConfig, Pattern, PatternSource,
    Trainer, TrainerConfig, WeightsOptimizer, WorkerPool,
};
use std::io;
use std::path::Path;
use std::sync::Arc;

fn sequential() -> Arc<WorkerPool> {
    Arc::new(WorkerPool::sequential())
}

fn truth_table(name: &str, f: impl Fn(bool, bool) -> bool) -> PatternSource {
    let patterns = [(false, false), (false, true), (true, false), (true, true)]
        .into_iter()
        .map(|(a, b)| {
            let bit = |v: bool| if v { 1.0 } else { 0.0 };
            Pattern::new(array![bit(a), bit(b)], array![bit(f(a, b))])
        })
        .collect();
    PatternSource::from_patterns(name, patterns)
}

fn train(network: Network, source: &PatternSource, epochs: usize) -> Network {
    let config = TrainerConfig {
        epochs,
        progress_modulus: 1000,
        seed: 17,
        ..TrainerConfig::default()
    };
    let mut trainer = Trainer::new(network, source.clone(), config).expect("valid trainer");
    trainer.train().expect("training succeeds");
    trainer.into_network()
}

// ============================================================================
// Learning behavior
// ============================================================================

/// XOR is not linearly separable, so 2 → 1 sigmoid stays near 0.5 everywhere.
#[test]
fn test_single_layer_cannot_learn_xor() {
    let xor = truth_table("xor", |a, b| a != b);
    let network = Network::feed_forward(
        "xor-linear",
        &[2, 1],
        Activation::Sigmoid,
        OptimizerConfig::sgd(0.5),
        true,
        sequential(),
        3,
    )
    .unwrap();

    let mut network = train(network, &xor, 2000);
    let evaluation = evaluate(&mut network, &xor).unwrap();
    assert!(
        evaluation.loss > 0.05,
        "single layer should not fit XOR, mean loss {}",
        evaluation.loss
    );
    assert!(evaluation.accuracy.is_none());
}

#[test]
fn test_hidden_layer_reduces_loss() {
    let or = truth_table("or", |a, b| a || b);
    let mut network = Network::feed_forward(
        "or-hidden",
        &[2, 4, 1],
        Activation::Sigmoid,
        OptimizerConfig::sgd(0.5),
        true,
        sequential(),
        5,
    )
    .unwrap();

    let before = evaluate(&mut network, &or).unwrap().loss;
    let mut network = train(network, &or, 500);
    let after = evaluate(&mut network, &or).unwrap().loss;

    assert!(after < before * 0.5, "loss went from {before} to {after}");
}

#[test]
fn test_ada_reduces_loss() {
    let and = truth_table("and", |a, b| a && b);
    let mut network = Network::feed_forward(
        "and-ada",
        &[2, 3, 1],
        Activation::Tanh,
        OptimizerConfig::Ada {
            learning_rate: 0.1,
            momentum: 0.2,
            history: 5,
        },
        true,
        sequential(),
        8,
    )
    .unwrap();

    let before = evaluate(&mut network, &and).unwrap().loss;
    let mut network = train(network, &and, 300);
    let after = evaluate(&mut network, &and).unwrap().loss;
    assert!(after < before, "loss went from {before} to {after}");

    for id in network.weights_nodes() {
        match network.optimizer(id).unwrap() {
            WeightsOptimizer::Ada(ada) => assert_eq!(ada.history_len(), 5),
            other => panic!("expected ada, got {}", other.name()),
        }
    }
}

// ============================================================================
// Determinism and shapes
// ============================================================================

#[test]
fn test_forward_determinism() {
    let build = || {
        Network::feed_forward(
            "det",
            &[4, 6, 3],
            Activation::BipolarSigmoid,
            OptimizerConfig::default(),
            true,
            sequential(),
            123,
        )
        .unwrap()
    };
    let mut a = build();
    let mut b = build();
    let x = array![0.2, -0.1, 0.7, 0.0];

    let first = a.predict(x.view()).unwrap();
    assert_eq!(first, b.predict(x.view()).unwrap());
    for _ in 0..3 {
        assert_eq!(first, a.predict(x.view()).unwrap());
    }
}

#[test]
fn test_shapes_are_static() {
    let mut network = Network::feed_forward(
        "shapes",
        &[3, 5, 2],
        Activation::relu(),
        OptimizerConfig::sgd(0.05),
        true,
        sequential(),
        0,
    )
    .unwrap();
    let sizes: Vec<usize> = network.edges().iter().map(|e| e.size()).collect();
    let weights: Vec<_> = network
        .weights_nodes()
        .into_iter()
        .map(|id| network.weights(id).unwrap().dim())
        .collect();

    for step in 0..20 {
        let x = Array1::from_elem(3, step as f64 * 0.1);
        let y = network.forward(x.view()).unwrap();
        assert_eq!(y.len(), 2);
        network.backward((array![1.0, 0.0] - &y).view()).unwrap();
    }

    let after: Vec<usize> = network.edges().iter().map(|e| e.size()).collect();
    assert_eq!(sizes, after);
    for (id, dim) in network.weights_nodes().into_iter().zip(weights) {
        assert_eq!(network.weights(id).unwrap().dim(), dim);
    }
    assert!(network.forward(Array1::zeros(4).view()).is_err());
}

#[test]
fn test_softmax_output_is_distribution() {
    let mut builder = NetworkBuilder::new("classifier").with_seed(2);
    let input = builder.input("features", 4).unwrap();
    let hidden = builder
        .weights("hidden", &[input], 6, true, OptimizerConfig::sgd(0.1))
        .unwrap();
    let act = builder.function("tanh", &[hidden], Activation::Tanh).unwrap();
    let logits = builder
        .weights("logits", &[act], 3, true, OptimizerConfig::sgd(0.1))
        .unwrap();
    let out = builder.function("softmax", &[logits], Activation::Softmax).unwrap();
    let mut network = builder.build(out).unwrap();

    for x in [array![1.0, 0.0, -1.0, 2.0], array![-30.0, 12.0, 0.5, 7.0]] {
        let y = network.predict(x.view()).unwrap();
        assert_abs_diff_eq!(y.sum(), 1.0, epsilon = 1e-9);
    }
}

// ============================================================================
// Parallel execution
// ============================================================================

#[test]
fn test_parallel_training_matches_sequential() {
    let source = {
        let patterns = (0..32)
            .map(|i| {
                let x = i as f64 / 32.0;
                Pattern::new(
                    array![x, 1.0 - x, (x * 6.0).sin(), x * x, 0.5],
                    array![x.cos(), (1.0 - x) * 0.5],
                )
            })
            .collect();
        PatternSource::from_patterns("curve", patterns)
    };
    let build = |pool: Arc<WorkerPool>| {
        Network::feed_forward(
            "curve",
            &[5, 16, 8, 2],
            Activation::Tanh,
            OptimizerConfig::ada(),
            true,
            pool,
            77,
        )
        .unwrap()
    };

    let seq_net = train(build(sequential()), &source, 5);
    let par_net = train(build(Arc::new(WorkerPool::new(4).unwrap())), &source, 5);

    for id in seq_net.weights_nodes() {
        assert_eq!(seq_net.weights(id).unwrap(), par_net.weights(id).unwrap());
        assert_eq!(seq_net.optimizer(id).unwrap(), par_net.optimizer(id).unwrap());
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Callers outside the crate, such as the trainer binary, build path-carrying I/O errors.
#[test]
fn test_io_error_carries_path() {
    let err = NetError::io("runs/metrics.jsonl", io::Error::new(io::ErrorKind::NotFound, "gone"));
    assert!(matches!(&err, NetError::Io { path, .. } if path == Path::new("runs/metrics.jsonl")));
    assert!(err.to_string().contains("runs/metrics.jsonl"));
}
