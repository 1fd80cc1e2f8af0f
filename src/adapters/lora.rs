//! LoRA — low-rank additive correction `scale · x A B` on a linear layer

use super::{take_tensor, unsupported, AdapterConfig, LayerTensors, StepCounter, LORA_A, LORA_B};
use crate::error::{ExpertError, Result};
use crate::model::{Layer, Linear};
use crate::tensor::{kaiming_bound, uniform, WideTensor};
use rand::Rng;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct LoRA {
    pub config: AdapterConfig,
    /// Down projection, `in_features × rank`
    pub lora_a: WideTensor,
    /// Up projection, `rank × out_features`
    pub lora_b: WideTensor,
    pub counter: StepCounter,
    pub(crate) layer: Option<Arc<Layer>>,
}

impl LoRA {
    pub fn attach<R: Rng + ?Sized>(
        path: &str,
        layer: Arc<Layer>,
        config: &AdapterConfig,
        rng: &mut R,
    ) -> Result<Self> {
        let (in_features, out_features) = match layer.as_ref() {
            Layer::Linear(l) => (l.in_features(), l.out_features()),
            other => return Err(unsupported(path, other, "lora")),
        };
        let bound = kaiming_bound(in_features);
        let lora_a = uniform(in_features, config.rank, bound, rng);
        // Zero B keeps the wrapped layer's output unchanged until trained
        let lora_b = if config.warmup || config.init_b_random {
            uniform(config.rank, out_features, bound, rng)
        } else {
            WideTensor::zeros(config.rank, out_features)
        };
        Ok(Self {
            config: config.clone(),
            lora_a,
            lora_b,
            counter: StepCounter::new(config.warmup),
            layer: Some(layer),
        })
    }

    pub fn from_weights(config: &AdapterConfig, tensors: &LayerTensors) -> Result<Self> {
        let lora_a = take_tensor(tensors, LORA_A)?.clone();
        let lora_b = take_tensor(tensors, LORA_B)?.clone();
        if lora_a.ncols() != config.rank || lora_b.nrows() != config.rank {
            return Err(ExpertError::incompatible(
                "LoRA rank",
                config.rank,
                format!("{}x{} / {}x{}", lora_a.nrows(), lora_a.ncols(), lora_b.nrows(), lora_b.ncols()),
            ));
        }
        Ok(Self {
            config: config.clone(),
            lora_a,
            lora_b,
            counter: StepCounter::new(config.warmup),
            layer: None,
        })
    }

    pub fn bind(&mut self, path: &str, layer: Arc<Layer>) -> Result<()> {
        match layer.as_ref() {
            Layer::Linear(l) => {
                check_dims(path, l, self.lora_a.nrows(), self.lora_b.ncols())?;
            }
            other => return Err(unsupported(path, other, "lora")),
        }
        self.layer = Some(layer);
        Ok(())
    }

    pub fn scaling(&self) -> f64 {
        self.config.scaling()
    }

    pub fn correction(&self, x: &WideTensor) -> WideTensor {
        (x * &self.lora_a * &self.lora_b) * (self.scaling() * self.counter.gate())
    }

    /// `scale · gate · (A B)ᵀ`, shaped like the base weight (`out × in`)
    pub fn delta_weight(&self) -> WideTensor {
        (&self.lora_a * &self.lora_b).transpose() * (self.scaling() * self.counter.gate())
    }

    pub fn fold_into(&self, layer: &Layer) -> Result<Layer> {
        match layer {
            Layer::Linear(l) => {
                check_dims("<merge>", l, self.lora_a.nrows(), self.lora_b.ncols())?;
                let delta = self.delta_weight();
                let weight = l.weight.zip_map(&delta, |w, d| (w as f64 + d) as f32);
                Ok(Layer::Linear(Linear::new(weight, l.bias.clone())))
            }
            other => Err(unsupported("<merge>", other, "lora")),
        }
    }

    pub fn weights(&self) -> LayerTensors {
        let mut t = LayerTensors::new();
        t.insert(LORA_A.to_string(), self.lora_a.clone());
        t.insert(LORA_B.to_string(), self.lora_b.clone());
        t
    }
}

pub(crate) fn check_dims(path: &str, l: &Linear, in_features: usize, out_features: usize) -> Result<()> {
    if l.in_features() != in_features {
        return Err(ExpertError::incompatible(
            format!("in_features of '{}'", path),
            l.in_features(),
            in_features,
        ));
    }
    if l.out_features() != out_features {
        return Err(ExpertError::incompatible(
            format!("out_features of '{}'", path),
            l.out_features(),
            out_features,
        ));
    }
    Ok(())
}
