//! Adapters — trainable corrections attached to frozen base layers
//!
//! Every adapter variant wraps exactly one base layer and contributes an
//! additive correction relative to that layer's output. Keeping every
//! variant in correction form lets containers mix them as a weighted sum.
//!
//! All adapter parameters and arithmetic are `f64`; outputs are cast back to
//! the base model's `f32` only at the boundary.

mod config;
mod ia3;
mod lora;
mod norm;
mod skilled;

pub use config::{AdapterConfig, AdapterKind, LayerMatcher};
pub use ia3::IA3;
pub use lora::LoRA;
pub use norm::NormAdapter;
pub use skilled::SkilledLoRA;

use crate::error::{ExpertError, Result};
use crate::model::Layer;
use crate::selectors::RoutingWeights;
use crate::tensor::{narrow, widen, Tensor, WideTensor};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Tensor names used in persisted expert weights
pub const LORA_A: &str = "lora_a";
pub const LORA_B: &str = "lora_b";
pub const IA3_SCALE: &str = "ia3_scale";
pub const LN_WEIGHT: &str = "ln_weight";

/// Number of training steps over which the warm-up gate ramps to 1
pub const WARMUP_STEPS: f64 = 10_000.0;

/// Named tensors of one adapter at one layer
pub type LayerTensors = BTreeMap<String, WideTensor>;

/// Training-step counter driving the warm-up gate
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepCounter {
    pub steps: u64,
    pub warmup: bool,
}

impl StepCounter {
    pub fn new(warmup: bool) -> Self {
        Self { steps: 0, warmup }
    }

    /// Advance on training-mode calls only
    pub fn tick(&mut self, training: bool) {
        if training {
            self.steps += 1;
        }
    }

    /// `min(steps / 10_000, 1)` when warm-up is enabled, else 1
    pub fn gate(&self) -> f64 {
        if self.warmup {
            (self.steps as f64 / WARMUP_STEPS).min(1.0)
        } else {
            1.0
        }
    }
}

/// A live adapter; the variant set is closed
#[derive(Debug, Clone)]
pub enum Adapter {
    Lora(LoRA),
    Skilled(SkilledLoRA),
    Ia3(IA3),
    Norm(NormAdapter),
}

impl Adapter {
    /// Attach a freshly initialized adapter of `config.kind` to `layer`
    pub fn attach<R: Rng + ?Sized>(
        path: &str,
        layer: Arc<Layer>,
        config: &AdapterConfig,
        rng: &mut R,
    ) -> Result<Self> {
        config.validate()?;
        Ok(match config.kind {
            AdapterKind::Lora => Adapter::Lora(LoRA::attach(path, layer, config, rng)?),
            AdapterKind::SkilledLora => {
                Adapter::Skilled(SkilledLoRA::attach(path, layer, config, rng)?)
            }
            AdapterKind::Ia3 => Adapter::Ia3(IA3::attach(path, layer, config)?),
            AdapterKind::LayerNorm => Adapter::Norm(NormAdapter::attach(path, layer, config)?),
        })
    }

    /// Materialize an unbound adapter from persisted tensors.
    ///
    /// It must be bound with [`Adapter::bind`] before `forward`.
    pub fn from_weights(config: &AdapterConfig, tensors: &LayerTensors) -> Result<Self> {
        config.validate()?;
        Ok(match config.kind {
            AdapterKind::Lora => Adapter::Lora(LoRA::from_weights(config, tensors)?),
            AdapterKind::SkilledLora => Adapter::Skilled(SkilledLoRA::from_weights(config, tensors)?),
            AdapterKind::Ia3 => Adapter::Ia3(IA3::from_weights(config, tensors)?),
            AdapterKind::LayerNorm => Adapter::Norm(NormAdapter::from_weights(config, tensors)?),
        })
    }

    /// Bind to a base layer after checking its kind and feature sizes
    pub fn bind(&mut self, path: &str, layer: Arc<Layer>) -> Result<()> {
        match self {
            Adapter::Lora(a) => a.bind(path, layer),
            Adapter::Skilled(a) => a.bind(path, layer),
            Adapter::Ia3(a) => a.bind(path, layer),
            Adapter::Norm(a) => a.bind(path, layer),
        }
    }

    pub fn config(&self) -> &AdapterConfig {
        match self {
            Adapter::Lora(a) => &a.config,
            Adapter::Skilled(a) => &a.config,
            Adapter::Ia3(a) => &a.config,
            Adapter::Norm(a) => &a.config,
        }
    }

    pub fn kind(&self) -> AdapterKind {
        self.config().kind
    }

    pub fn layer(&self) -> Option<&Arc<Layer>> {
        match self {
            Adapter::Lora(a) => a.layer.as_ref(),
            Adapter::Skilled(a) => a.layer.as_ref(),
            Adapter::Ia3(a) => a.layer.as_ref(),
            Adapter::Norm(a) => a.layer.as_ref(),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.layer().is_some()
    }

    pub fn in_features(&self) -> usize {
        match self {
            Adapter::Lora(a) => a.lora_a.nrows(),
            Adapter::Skilled(a) => a.in_features,
            Adapter::Ia3(a) => a.in_features,
            Adapter::Norm(a) => a.weight.len(),
        }
    }

    pub fn out_features(&self) -> usize {
        match self {
            Adapter::Lora(a) => a.lora_b.ncols(),
            Adapter::Skilled(a) => a.out_features,
            Adapter::Ia3(a) => a.scale.len(),
            Adapter::Norm(a) => a.weight.len(),
        }
    }

    /// Skills a routed decision picks among (1 for single-expert variants)
    pub fn n_skills(&self) -> usize {
        match self {
            Adapter::Skilled(a) => a.n_skills,
            _ => 1,
        }
    }

    pub fn n_splits(&self) -> usize {
        match self {
            Adapter::Skilled(a) => a.n_splits,
            _ => 1,
        }
    }

    /// Advance step counters for one forward pass
    pub fn tick(&mut self, training: bool) {
        match self {
            Adapter::Lora(a) => a.counter.tick(training),
            Adapter::Skilled(a) => a.counter.tick(training),
            Adapter::Ia3(_) | Adapter::Norm(_) => {}
        }
    }

    /// Current warm-up gate (1 for variants without warm-up)
    pub fn warmup_gate(&self) -> f64 {
        match self {
            Adapter::Lora(a) => a.counter.gate(),
            Adapter::Skilled(a) => a.counter.gate(),
            Adapter::Ia3(_) | Adapter::Norm(_) => 1.0,
        }
    }

    /// Additive correction relative to the base output, in wide precision.
    ///
    /// `input` is the ambient-precision input, `x` its widened copy and
    /// `base_out` the widened base-layer output.
    pub fn correction(
        &self,
        input: &Tensor,
        x: &WideTensor,
        base_out: &WideTensor,
        routing: Option<&RoutingWeights>,
    ) -> Result<WideTensor> {
        match self {
            Adapter::Lora(a) => Ok(a.correction(x)),
            Adapter::Skilled(a) => {
                let routing = routing.ok_or_else(|| {
                    ExpertError::InvalidRouting("skilled LoRA needs routing weights".into())
                })?;
                a.correction(x, routing)
            }
            Adapter::Ia3(a) => Ok(a.correction(base_out)),
            Adapter::Norm(a) => a.correction(input, base_out),
        }
    }

    /// `base(x) + correction`, computed wide and cast down to `f32`
    pub fn forward(
        &mut self,
        input: &Tensor,
        routing: Option<&RoutingWeights>,
        training: bool,
    ) -> Result<Tensor> {
        let layer = self
            .layer()
            .cloned()
            .ok_or_else(|| ExpertError::state("adapter is not attached to a base layer"))?;
        if input.ncols() != self.in_features() {
            return Err(ExpertError::incompatible(
                "input features",
                self.in_features(),
                input.ncols(),
            ));
        }
        self.tick(training);
        let base_out = widen(&layer.forward(input));
        let x = widen(input);
        let delta = self.correction(input, &x, &base_out, routing)?;
        Ok(narrow(&(base_out + delta)))
    }

    /// Fold the correction into a copy of `layer` (closed-form merge)
    pub fn fold_into(&self, layer: &Layer) -> Result<Layer> {
        match self {
            Adapter::Lora(a) => a.fold_into(layer),
            Adapter::Skilled(_) => Err(ExpertError::state(
                "a skilled LoRA has no fixed routing and cannot be merged into base weights",
            )),
            Adapter::Ia3(a) => a.fold_into(layer),
            Adapter::Norm(a) => a.fold_into(layer),
        }
    }

    /// Snapshot of the adapter's tensors for persistence
    pub fn weights(&self) -> LayerTensors {
        match self {
            Adapter::Lora(a) => a.weights(),
            Adapter::Skilled(a) => a.weights(),
            Adapter::Ia3(a) => a.weights(),
            Adapter::Norm(a) => a.weights(),
        }
    }
}

/// Fetch a named tensor from persisted weights
pub(crate) fn take_tensor<'a>(tensors: &'a LayerTensors, name: &str) -> Result<&'a WideTensor> {
    tensors
        .get(name)
        .ok_or_else(|| ExpertError::not_found(format!("tensor '{}' in expert weights", name)))
}

/// Reject layers an adapter variant cannot wrap
pub(crate) fn unsupported(path: &str, layer: &Layer, adapter: &str) -> ExpertError {
    ExpertError::UnsupportedLayerKind {
        path: path.to_string(),
        kind: layer.kind().to_string(),
        adapter: adapter.to_string(),
    }
}
