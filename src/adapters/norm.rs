//! Normalization adapter — trainable gain of an RMS layer norm

use super::{take_tensor, unsupported, AdapterConfig, LayerTensors, LN_WEIGHT};
use crate::error::{ExpertError, Result};
use crate::model::{Layer, LayerNorm};
use crate::tensor::{Tensor, WideTensor};
use nalgebra::DVector;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct NormAdapter {
    pub config: AdapterConfig,
    /// Gain vector, initialised from the wrapped layer
    pub weight: DVector<f64>,
    pub eps: f64,
    pub(crate) layer: Option<Arc<Layer>>,
}

impl NormAdapter {
    pub fn attach(path: &str, layer: Arc<Layer>, config: &AdapterConfig) -> Result<Self> {
        let (weight, eps) = match layer.as_ref() {
            Layer::LayerNorm(n) => (n.weight.map(f64::from), n.eps),
            other => return Err(unsupported(path, other, "ln")),
        };
        if weight.len() % config.n_splits != 0 {
            return Err(ExpertError::incompatible(
                format!("features of '{}'", path),
                format!("multiple of n_splits={}", config.n_splits),
                weight.len(),
            ));
        }
        Ok(Self {
            config: config.clone(),
            weight,
            eps,
            layer: Some(layer),
        })
    }

    pub fn from_weights(config: &AdapterConfig, tensors: &LayerTensors) -> Result<Self> {
        let t = take_tensor(tensors, LN_WEIGHT)?;
        if t.nrows() != 1 {
            return Err(ExpertError::incompatible("ln_weight rows", 1, t.nrows()));
        }
        Ok(Self {
            config: config.clone(),
            weight: DVector::from_iterator(t.ncols(), t.iter().cloned()),
            eps: 1e-6,
            layer: None,
        })
    }

    pub fn bind(&mut self, path: &str, layer: Arc<Layer>) -> Result<()> {
        match layer.as_ref() {
            Layer::LayerNorm(n) => {
                if n.features() != self.weight.len() {
                    return Err(ExpertError::incompatible(
                        format!("features of '{}'", path),
                        n.features(),
                        self.weight.len(),
                    ));
                }
                self.eps = n.eps;
            }
            other => return Err(unsupported(path, other, "ln")),
        }
        self.layer = Some(layer);
        Ok(())
    }

    /// `norm(x; w) − base(x)`
    pub fn correction(&self, input: &Tensor, base_out: &WideTensor) -> Result<WideTensor> {
        if input.ncols() != self.weight.len() {
            return Err(ExpertError::incompatible("input features", self.weight.len(), input.ncols()));
        }
        Ok(LayerNorm::normalize(input, &self.weight, self.eps) - base_out)
    }

    pub fn fold_into(&self, layer: &Layer) -> Result<Layer> {
        match layer {
            Layer::LayerNorm(n) if n.features() == self.weight.len() => Ok(Layer::LayerNorm(LayerNorm {
                weight: self.weight.map(|v| v as f32),
                eps: n.eps,
            })),
            Layer::LayerNorm(n) => Err(ExpertError::incompatible(
                "layer norm features",
                n.features(),
                self.weight.len(),
            )),
            other => Err(unsupported("<merge>", other, "ln")),
        }
    }

    pub fn weights(&self) -> LayerTensors {
        let mut t = LayerTensors::new();
        t.insert(
            LN_WEIGHT.to_string(),
            WideTensor::from_row_slice(1, self.weight.len(), self.weight.as_slice()),
        );
        t
    }
}
