//! IA3 — channel-wise rescaling of a linear layer's output

use super::{take_tensor, unsupported, AdapterConfig, LayerTensors, IA3_SCALE};
use crate::adapters::lora::check_dims;
use crate::error::{ExpertError, Result};
use crate::model::{Layer, Linear};
use crate::tensor::WideTensor;
use nalgebra::DVector;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct IA3 {
    pub config: AdapterConfig,
    /// Per-output-channel multiplier, initialised to ones
    pub scale: DVector<f64>,
    pub in_features: usize,
    pub(crate) layer: Option<Arc<Layer>>,
}

impl IA3 {
    pub fn attach(path: &str, layer: Arc<Layer>, config: &AdapterConfig) -> Result<Self> {
        let (in_features, out_features) = match layer.as_ref() {
            Layer::Linear(l) => (l.in_features(), l.out_features()),
            other => return Err(unsupported(path, other, "ia3")),
        };
        Ok(Self {
            config: config.clone(),
            scale: DVector::from_element(out_features, 1.0),
            in_features,
            layer: Some(layer),
        })
    }

    /// Persisted as a `1 × out` row; `in_features` is filled in by `bind`
    pub fn from_weights(config: &AdapterConfig, tensors: &LayerTensors) -> Result<Self> {
        let t = take_tensor(tensors, IA3_SCALE)?;
        if t.nrows() != 1 {
            return Err(ExpertError::incompatible("ia3_scale rows", 1, t.nrows()));
        }
        Ok(Self {
            config: config.clone(),
            scale: DVector::from_iterator(t.ncols(), t.iter().cloned()),
            in_features: 0,
            layer: None,
        })
    }

    pub fn bind(&mut self, path: &str, layer: Arc<Layer>) -> Result<()> {
        match layer.as_ref() {
            Layer::Linear(l) => {
                check_dims(path, l, l.in_features(), self.scale.len())?;
                self.in_features = l.in_features();
            }
            other => return Err(unsupported(path, other, "ia3")),
        }
        self.layer = Some(layer);
        Ok(())
    }

    /// `base ⊙ (v − 1)`, so that `base + correction = base ⊙ v`
    pub fn correction(&self, base_out: &WideTensor) -> WideTensor {
        let mut out = base_out.clone();
        for (c, mut col) in out.column_iter_mut().enumerate() {
            col *= self.scale[c] - 1.0;
        }
        out
    }

    pub fn fold_into(&self, layer: &Layer) -> Result<Layer> {
        match layer {
            Layer::Linear(l) => {
                check_dims("<merge>", l, l.in_features(), self.scale.len())?;
                let mut weight = l.weight.clone();
                for (r, mut row) in weight.row_iter_mut().enumerate() {
                    row *= self.scale[r] as f32;
                }
                let bias = l
                    .bias
                    .as_ref()
                    .map(|b| b.zip_map(&self.scale.map(|v| v as f32), |b, v| b * v));
                Ok(Layer::Linear(Linear::new(weight, bias)))
            }
            other => Err(unsupported("<merge>", other, "ia3")),
        }
    }

    pub fn weights(&self) -> LayerTensors {
        let mut t = LayerTensors::new();
        t.insert(
            IA3_SCALE.to_string(),
            WideTensor::from_row_slice(1, self.scale.len(), self.scale.as_slice()),
        );
        t
    }
}
