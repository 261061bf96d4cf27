//! Activation functions for function (transfer) nodes.

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::error::{NetError, NetResult};

/// Activation applied by a function node.
///
/// `activations` maps trigger values (pre-activation) to outputs; `derivatives` maps
/// *outputs* back to the local slope, so backward never needs the triggers.
/// Both are pure and safe to call concurrently on disjoint data.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Activation {
    /// f(x) = 1 / (1 + e^-x), f' = y(1 - y)
    Sigmoid,
    /// f(x) = 2 / (1 + e^-x) - 1, f' = (1 + y)(1 - y) / 2
    BipolarSigmoid,
    /// f(x) = tanh(x), f' = 1 - y²
    Tanh,
    /// f(x) = x above the threshold, 0 otherwise.
    ///
    /// The derivative is a hard step: 1 strictly above the threshold, 0 at or below it.
    Relu {
        #[serde(default)]
        threshold: f64,
    },
    /// Jointly normalized exponentials; f' uses the Jacobian diagonal y(1 - y).
    Softmax,
}

impl Activation {
    /// ReLU with the default threshold of zero.
    pub fn relu() -> Self {
        Activation::Relu { threshold: 0.0 }
    }

    pub fn activations(&self, triggers: ArrayView1<f64>) -> Array1<f64> {
        match *self {
            Activation::Sigmoid => triggers.mapv(sigmoid),
            Activation::BipolarSigmoid => triggers.mapv(|x| 2.0 * sigmoid(x) - 1.0),
            Activation::Tanh => triggers.mapv(f64::tanh),
            Activation::Relu { threshold } => {
                triggers.mapv(|x| if x > threshold { x } else { 0.0 })
            }
            Activation::Softmax => softmax(triggers),
        }
    }

    pub fn derivatives(&self, outputs: ArrayView1<f64>) -> Array1<f64> {
        match *self {
            Activation::Sigmoid | Activation::Softmax => outputs.mapv(|y| y * (1.0 - y)),
            Activation::BipolarSigmoid => outputs.mapv(|y| 0.5 * (1.0 + y) * (1.0 - y)),
            Activation::Tanh => outputs.mapv(|y| 1.0 - y * y),
            Activation::Relu { threshold } => {
                outputs.mapv(|y| if y > threshold { 1.0 } else { 0.0 })
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Activation::Sigmoid => "sigmoid",
            Activation::BipolarSigmoid => "bipolar_sigmoid",
            Activation::Tanh => "tanh",
            Activation::Relu { .. } => "relu",
            Activation::Softmax => "softmax",
        }
    }

    /// Look an activation up by name, with default parameters.
    ///
    /// # Errors
    /// `UnknownActivation` for names outside the supported set.
    pub fn from_name(name: &str) -> NetResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sigmoid" => Ok(Activation::Sigmoid),
            "bipolar_sigmoid" | "bipolar-sigmoid" => Ok(Activation::BipolarSigmoid),
            "tanh" => Ok(Activation::Tanh),
            "relu" => Ok(Activation::relu()),
            "softmax" => Ok(Activation::Softmax),
            _ => Err(NetError::UnknownActivation(name.to_string())),
        }
    }
}

#[inline]
fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn softmax(triggers: ArrayView1<f64>) -> Array1<f64> {
    let max = triggers.fold(f64::NEG_INFINITY, |m, &x| m.max(x));
    let mut out = triggers.mapv(|x| (x - max).exp());
    let total = out.sum();
    out /= total;
    out
}
