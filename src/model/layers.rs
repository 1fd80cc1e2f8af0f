//! Base-model layers: the structural units adapters attach to

use crate::tensor::{Tensor, WideTensor};
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Dense transform `y = x Wᵀ + b` with `W: out × in`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Linear {
    pub weight: Tensor,
    pub bias: Option<DVector<f32>>,
}

impl Linear {
    pub fn new(weight: Tensor, bias: Option<DVector<f32>>) -> Self {
        Self { weight, bias }
    }

    /// Random linear layer (uniform in ±1/sqrt(in))
    pub fn random<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (in_features.max(1) as f32).sqrt();
        let weight = DMatrix::from_fn(out_features, in_features, |_, _| rng.gen_range(-bound..=bound));
        let bias = DVector::from_fn(out_features, |_, _| rng.gen_range(-bound..=bound));
        Self { weight, bias: Some(bias) }
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    pub fn forward(&self, input: &Tensor) -> Tensor {
        let mut out = input * self.weight.transpose();
        if let Some(bias) = &self.bias {
            for mut row in out.row_iter_mut() {
                row += bias.transpose();
            }
        }
        out
    }
}

/// RMS-style layer normalization: `x / sqrt(mean(x²) + eps) * w`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerNorm {
    pub weight: DVector<f32>,
    pub eps: f64,
}

impl LayerNorm {
    pub fn new(dim: usize, eps: f64) -> Self {
        Self {
            weight: DVector::from_element(dim, 1.0),
            eps,
        }
    }

    pub fn features(&self) -> usize {
        self.weight.len()
    }

    /// Normalize rows of `input` and scale by `gain`.
    ///
    /// The variance is always computed in `f64`.
    pub fn normalize(input: &Tensor, gain: &DVector<f64>, eps: f64) -> WideTensor {
        let mut out = WideTensor::zeros(input.nrows(), input.ncols());
        for (r, row) in input.row_iter().enumerate() {
            let variance =
                row.iter().map(|v| (*v as f64) * (*v as f64)).sum::<f64>() / row.len().max(1) as f64;
            let inv = 1.0 / (variance + eps).sqrt();
            for c in 0..row.len() {
                out[(r, c)] = row[c] as f64 * inv * gain[c];
            }
        }
        out
    }

    pub fn forward(&self, input: &Tensor) -> Tensor {
        let gain = self.weight.map(f64::from);
        Self::normalize(input, &gain, self.eps).map(|v| v as f32)
    }
}

/// Elementwise nonlinearities; never adaptable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Relu,
    Gelu,
}

impl Activation {
    pub fn forward(&self, input: &Tensor) -> Tensor {
        match self {
            Activation::Relu => input.map(|v| v.max(0.0)),
            Activation::Gelu => input.map(|v| {
                let x = v as f64;
                let inner = (2.0 / std::f64::consts::PI).sqrt() * (x + 0.044715 * x.powi(3));
                (0.5 * x * (1.0 + inner.tanh())) as f32
            }),
        }
    }
}

/// One structural layer of a base model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Layer {
    Linear(Linear),
    LayerNorm(LayerNorm),
    Activation(Activation),
}

impl Layer {
    pub fn kind(&self) -> &'static str {
        match self {
            Layer::Linear(_) => "linear",
            Layer::LayerNorm(_) => "layer_norm",
            Layer::Activation(_) => "activation",
        }
    }

    /// Input feature count; `None` for shape-agnostic layers
    pub fn in_features(&self) -> Option<usize> {
        match self {
            Layer::Linear(l) => Some(l.in_features()),
            Layer::LayerNorm(n) => Some(n.features()),
            Layer::Activation(_) => None,
        }
    }

    pub fn out_features(&self) -> Option<usize> {
        match self {
            Layer::Linear(l) => Some(l.out_features()),
            Layer::LayerNorm(n) => Some(n.features()),
            Layer::Activation(_) => None,
        }
    }

    pub fn forward(&self, input: &Tensor) -> Tensor {
        match self {
            Layer::Linear(l) => l.forward(input),
            Layer::LayerNorm(n) => n.forward(input),
            Layer::Activation(a) => a.forward(input),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_forward_with_bias() {
        let lin = Linear::new(
            Tensor::from_row_slice(2, 3, &[1.0, 0.0, 0.0, 0.0, 1.0, 1.0]),
            Some(DVector::from_vec(vec![0.5, -0.5])),
        );
        let x = Tensor::from_row_slice(1, 3, &[1.0, 2.0, 3.0]);
        let y = lin.forward(&x);
        assert_eq!(y, Tensor::from_row_slice(1, 2, &[1.5, 4.5]));
    }

    #[test]
    fn test_layer_norm_unit_rms() {
        let ln = LayerNorm::new(4, 0.0);
        let x = Tensor::from_row_slice(1, 4, &[2.0, -2.0, 2.0, -2.0]);
        let y = ln.forward(&x);
        for v in y.iter() {
            assert!((v.abs() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_activation_has_no_features() {
        let layer = Layer::Activation(Activation::Relu);
        assert_eq!(layer.in_features(), None);
        let y = layer.forward(&Tensor::from_row_slice(1, 2, &[-1.0, 1.0]));
        assert_eq!(y, Tensor::from_row_slice(1, 2, &[0.0, 1.0]));
    }
}
