//! Sequential base model with named, replaceable layers
//!
//! Layers are addressed by dotted paths (`blocks.0.attn.q_proj`). A path
//! holds either a plain layer or an [`ExpertContainer`] wrapping one; the
//! model forward runs them in insertion order.

use super::{Activation, Layer, LayerNorm, Linear};
use crate::adapters::{AdapterConfig, AdapterKind};
use crate::containers::{ExpertContainer, ForwardContext};
use crate::error::{ExpertError, Result};
use crate::tensor::Tensor;
use chrono::{DateTime, Utc};
use log::debug;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum Module {
    Layer(Arc<Layer>),
    Container(ExpertContainer),
}

impl Module {
    /// The wrapped base layer
    pub fn layer(&self) -> &Arc<Layer> {
        match self {
            Module::Layer(l) => l,
            Module::Container(c) => c.base(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelEntry {
    pub path: String,
    pub module: Module,
    /// Whether the base parameters of this layer receive updates
    pub trainable: bool,
}

/// One adapter injection performed on a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Injection {
    pub path: String,
    pub modifier: String,
    pub expert: String,
    pub at: DateTime<Utc>,
}

/// Record of every injection into one model instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InjectionLog {
    entries: Vec<Injection>,
}

impl InjectionLog {
    pub fn record(&mut self, path: &str, modifier: &str, expert: &str) {
        self.entries.push(Injection {
            path: path.to_string(),
            modifier: modifier.to_string(),
            expert: expert.to_string(),
            at: Utc::now(),
        });
    }

    pub fn entries(&self) -> &[Injection] {
        &self.entries
    }

    /// Distinct injected paths, in first-injection order
    pub fn paths(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for e in &self.entries {
            if !seen.contains(&e.path) {
                seen.push(e.path.clone());
            }
        }
        seen
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct BaseModel {
    pub name: String,
    entries: Vec<ModelEntry>,
    injections: InjectionLog,
}

impl BaseModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
            injections: InjectionLog::default(),
        }
    }

    pub fn with_layer(mut self, path: impl Into<String>, layer: Layer) -> Self {
        self.entries.push(ModelEntry {
            path: path.into(),
            module: Module::Layer(Arc::new(layer)),
            trainable: true,
        });
        self
    }

    pub fn linear(self, path: impl Into<String>, linear: Linear) -> Self {
        self.with_layer(path, Layer::Linear(linear))
    }

    pub fn layer_norm(self, path: impl Into<String>, dim: usize) -> Self {
        self.with_layer(path, Layer::LayerNorm(LayerNorm::new(dim, 1e-6)))
    }

    pub fn activation(self, path: impl Into<String>, act: Activation) -> Self {
        self.with_layer(path, Layer::Activation(act))
    }

    /// Small random transformer-shaped stack: per block a norm, a square
    /// `q_proj`, and a `up_proj → gelu → down_proj` MLP
    pub fn toy<R: Rng + ?Sized>(name: impl Into<String>, hidden: usize, n_blocks: usize, rng: &mut R) -> Self {
        let mut model = Self::new(name);
        for i in 0..n_blocks {
            model = model
                .layer_norm(format!("blocks.{}.norm", i), hidden)
                .linear(format!("blocks.{}.attn.q_proj", i), Linear::random(hidden, hidden, rng))
                .linear(format!("blocks.{}.mlp.up_proj", i), Linear::random(hidden, 2 * hidden, rng))
                .activation(format!("blocks.{}.mlp.act", i), Activation::Gelu)
                .linear(format!("blocks.{}.mlp.down_proj", i), Linear::random(2 * hidden, hidden, rng));
        }
        model
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn paths(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.path.clone()).collect()
    }

    pub fn entries(&self) -> &[ModelEntry] {
        &self.entries
    }

    fn entry(&self, path: &str) -> Result<&ModelEntry> {
        self.entries
            .iter()
            .find(|e| e.path == path)
            .ok_or_else(|| ExpertError::not_found(format!("layer '{}' in model '{}'", path, self.name)))
    }

    fn entry_mut(&mut self, path: &str) -> Result<&mut ModelEntry> {
        let name = self.name.clone();
        self.entries
            .iter_mut()
            .find(|e| e.path == path)
            .ok_or_else(|| ExpertError::not_found(format!("layer '{}' in model '{}'", path, name)))
    }

    /// Base layer at `path`, looking through containers
    pub fn layer(&self, path: &str) -> Result<&Arc<Layer>> {
        Ok(self.entry(path)?.module.layer())
    }

    pub fn in_features(&self, path: &str) -> Result<Option<usize>> {
        Ok(self.layer(path)?.in_features())
    }

    pub fn out_features(&self, path: &str) -> Result<Option<usize>> {
        Ok(self.layer(path)?.out_features())
    }

    /// Paths matching a raw regex (full match)
    pub fn matching_paths_regex(&self, pattern: &Regex) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| pattern.is_match(&e.path))
            .map(|e| e.path.clone())
            .collect()
    }

    /// Paths an adapter config targets
    pub fn matching_paths(&self, config: &AdapterConfig) -> Result<Vec<String>> {
        let matcher = config.matcher()?;
        Ok(self
            .entries
            .iter()
            .filter(|e| matcher.is_match(&e.path))
            .map(|e| e.path.clone())
            .collect())
    }

    /// Substitute the module at `path`, returning the previous one
    pub fn replace(&mut self, path: &str, module: Module) -> Result<Module> {
        let entry = self.entry_mut(path)?;
        debug!("Replacing module at '{}'", path);
        Ok(std::mem::replace(&mut entry.module, module))
    }

    pub fn container(&self, path: &str) -> Option<&ExpertContainer> {
        match self.entry(path).ok().map(|e| &e.module) {
            Some(Module::Container(c)) => Some(c),
            _ => None,
        }
    }

    pub fn container_mut(&mut self, path: &str) -> Option<&mut ExpertContainer> {
        match self.entry_mut(path).ok().map(|e| &mut e.module) {
            Some(Module::Container(c)) => Some(c),
            _ => None,
        }
    }

    pub fn containers(&self) -> impl Iterator<Item = &ExpertContainer> {
        self.entries.iter().filter_map(|e| match &e.module {
            Module::Container(c) => Some(c),
            Module::Layer(_) => None,
        })
    }

    pub fn containers_mut(&mut self) -> impl Iterator<Item = &mut ExpertContainer> {
        self.entries.iter_mut().filter_map(|e| match &mut e.module {
            Module::Container(c) => Some(c),
            Module::Layer(_) => None,
        })
    }

    /// Container at `path`, wrapping the plain layer there if needed
    pub fn ensure_container(&mut self, path: &str, modifier: &str, kind: AdapterKind) -> Result<&mut ExpertContainer> {
        let entry = self.entry_mut(path)?;
        if let Module::Layer(layer) = &entry.module {
            let container = ExpertContainer::new(path, layer.clone(), modifier, kind);
            entry.module = Module::Container(container);
        }
        match &mut entry.module {
            Module::Container(c) => Ok(c),
            Module::Layer(_) => Err(ExpertError::state(format!("could not wrap '{}'", path))),
        }
    }

    /// Swap the base layer at `path`, keeping any container around it
    pub fn set_base_layer(&mut self, path: &str, layer: Arc<Layer>) -> Result<()> {
        let entry = self.entry_mut(path)?;
        match &mut entry.module {
            Module::Layer(l) => *l = layer,
            Module::Container(_) => {
                return Err(ExpertError::state(format!(
                    "'{}' is wrapped by a container; fold through the container instead",
                    path
                )))
            }
        }
        Ok(())
    }

    pub fn is_trainable(&self, path: &str) -> Result<bool> {
        Ok(self.entry(path)?.trainable)
    }

    pub fn set_trainable(&mut self, path: &str, trainable: bool) -> Result<()> {
        self.entry_mut(path)?.trainable = trainable;
        Ok(())
    }

    pub fn set_all_trainable(&mut self, trainable: bool) {
        for e in &mut self.entries {
            e.trainable = trainable;
        }
    }

    pub fn injections(&self) -> &InjectionLog {
        &self.injections
    }

    pub(crate) fn record_injection(&mut self, path: &str, modifier: &str, expert: &str) {
        self.injections.record(path, modifier, expert);
    }

    pub fn forward(&mut self, input: &Tensor, ctx: &mut ForwardContext<'_>) -> Result<Tensor> {
        let mut h = input.clone();
        for entry in &mut self.entries {
            if let Some(expected) = entry.module.layer().in_features() {
                if h.ncols() != expected {
                    return Err(ExpertError::incompatible(
                        format!("input features of '{}'", entry.path),
                        expected,
                        h.ncols(),
                    ));
                }
            }
            h = match &mut entry.module {
                Module::Layer(l) => l.forward(&h),
                Module::Container(c) => c.forward(&h, ctx)?,
            };
        }
        Ok(h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RoutingInfo;
    use crate::selectors::SelectorSet;
    use nalgebra::DMatrix;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn model() -> BaseModel {
        let mut rng = StdRng::seed_from_u64(0);
        BaseModel::toy("toy", 4, 2, &mut rng)
    }

    #[test]
    fn test_toy_layout_and_forward() {
        let mut m = model();
        assert_eq!(m.len(), 10);
        assert_eq!(m.in_features("blocks.1.mlp.down_proj").unwrap(), Some(8));
        let x = DMatrix::from_element(3, 4, 0.5f32);
        let info = RoutingInfo::new();
        let mut selectors = SelectorSet::new();
        let y = m.forward(&x, &mut ForwardContext::new(&info, &mut selectors, false)).unwrap();
        assert_eq!(y.shape(), (3, 4));
    }

    #[test]
    fn test_matching_paths() {
        let m = model();
        let cfg = AdapterConfig::lora("q_proj|up_proj");
        assert_eq!(
            m.matching_paths(&cfg).unwrap(),
            vec![
                "blocks.0.attn.q_proj",
                "blocks.0.mlp.up_proj",
                "blocks.1.attn.q_proj",
                "blocks.1.mlp.up_proj"
            ]
        );
        let re = Regex::new(r"^blocks\.1\..*norm$").unwrap();
        assert_eq!(m.matching_paths_regex(&re), vec!["blocks.1.norm"]);
    }

    #[test]
    fn test_ensure_container_wraps_once() {
        let mut m = model();
        m.ensure_container("blocks.0.attn.q_proj", "lora", AdapterKind::Lora).unwrap();
        m.ensure_container("blocks.0.attn.q_proj", "lora", AdapterKind::Lora).unwrap();
        assert_eq!(m.containers().count(), 1);
        assert!(m.set_base_layer("blocks.0.attn.q_proj", m.layer("blocks.0.norm").unwrap().clone()).is_err());
        assert!(m.replace("missing", Module::Layer(Arc::new(Layer::Activation(Activation::Relu)))).is_err());
    }

    #[test]
    fn test_injection_log_paths() {
        let mut log = InjectionLog::default();
        log.record("a", "lora", "e1");
        log.record("b", "lora", "e1");
        log.record("a", "lora", "e2");
        assert_eq!(log.len(), 3);
        assert_eq!(log.paths(), vec!["a", "b"]);
    }
}
