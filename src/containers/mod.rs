//! Expert containers — the per-layer aggregation point
//!
//! A container wraps one base layer. While `Routed` it owns the live
//! adapters of every expert attached at that layer and mixes their
//! corrections under the weights of its selector. `merge` folds one adapter
//! into the base weight and moves the container to `Merged`, after which it
//! is a passthrough; there is no way back.

use crate::adapters::{Adapter, AdapterKind, LoRA, StepCounter};
use crate::error::{ExpertError, Result};
use crate::model::{Layer, RoutingInfo};
use crate::selectors::{RoutingWeights, Selector, SelectorSet, BASE_MODEL_EXPERT};
use crate::tensor::{narrow, widen, Tensor, WideTensor};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Per-call routing context, passed by reference through one forward pass
pub struct ForwardContext<'a> {
    pub info: &'a RoutingInfo,
    pub selectors: &'a mut SelectorSet,
    pub training: bool,
}

impl<'a> ForwardContext<'a> {
    pub fn new(info: &'a RoutingInfo, selectors: &'a mut SelectorSet, training: bool) -> Self {
        Self {
            info,
            selectors,
            training,
        }
    }
}

/// Name under which skill `s` of a skilled expert is routed
pub fn skill_label(expert: &str, skill: usize) -> String {
    format!("{}[{}]", expert, skill)
}

#[derive(Debug, Clone)]
pub enum ContainerState {
    Routed { experts: BTreeMap<String, Adapter> },
    Merged { merged_expert: String },
}

#[derive(Debug, Clone)]
pub struct ExpertContainer {
    pub path: String,
    base: Arc<Layer>,
    state: ContainerState,
    /// Registered modifier name that created this container
    modifier: String,
    kind: AdapterKind,
    selector_key: Option<String>,
}

impl ExpertContainer {
    pub fn new(path: impl Into<String>, base: Arc<Layer>, modifier: impl Into<String>, kind: AdapterKind) -> Self {
        Self {
            path: path.into(),
            base,
            state: ContainerState::Routed {
                experts: BTreeMap::new(),
            },
            modifier: modifier.into(),
            kind,
            selector_key: None,
        }
    }

    pub fn base(&self) -> &Arc<Layer> {
        &self.base
    }

    pub fn modifier(&self) -> &str {
        &self.modifier
    }

    pub fn kind(&self) -> AdapterKind {
        self.kind
    }

    pub fn state(&self) -> &ContainerState {
        &self.state
    }

    pub fn is_merged(&self) -> bool {
        matches!(self.state, ContainerState::Merged { .. })
    }

    pub fn selector_key(&self) -> Option<&str> {
        self.selector_key.as_deref()
    }

    pub fn set_selector_key(&mut self, key: Option<String>) {
        self.selector_key = key;
    }

    pub fn expert_names(&self) -> Vec<String> {
        match &self.state {
            ContainerState::Routed { experts } => experts.keys().cloned().collect(),
            ContainerState::Merged { .. } => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        match &self.state {
            ContainerState::Routed { experts } => experts.len(),
            ContainerState::Merged { .. } => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names a selector for this container must route over
    pub fn routing_names(&self) -> Vec<String> {
        match self.single_skilled() {
            Some((name, adapter)) => (0..adapter.n_skills()).map(|s| skill_label(name, s)).collect(),
            None => self.expert_names(),
        }
    }

    pub fn adapter(&self, name: &str) -> Option<&Adapter> {
        match &self.state {
            ContainerState::Routed { experts } => experts.get(name),
            ContainerState::Merged { .. } => None,
        }
    }

    pub fn adapter_mut(&mut self, name: &str) -> Option<&mut Adapter> {
        match &mut self.state {
            ContainerState::Routed { experts } => experts.get_mut(name),
            ContainerState::Merged { .. } => None,
        }
    }

    pub fn adapters(&self) -> Vec<(&String, &Adapter)> {
        match &self.state {
            ContainerState::Routed { experts } => experts.iter().collect(),
            ContainerState::Merged { .. } => Vec::new(),
        }
    }

    fn single_skilled(&self) -> Option<(&String, &Adapter)> {
        match &self.state {
            ContainerState::Routed { experts } if experts.len() == 1 => experts
                .iter()
                .next()
                .filter(|(_, a)| matches!(a, Adapter::Skilled(_))),
            _ => None,
        }
    }

    /// Insert a live adapter under `name`, binding it to the wrapped layer
    pub fn add_expert(&mut self, name: &str, mut adapter: Adapter) -> Result<()> {
        let experts = match &mut self.state {
            ContainerState::Merged { merged_expert } => {
                return Err(ExpertError::state(format!(
                    "container at '{}' already merged '{}'",
                    self.path, merged_expert
                )))
            }
            ContainerState::Routed { experts } => experts,
        };
        if experts.contains_key(name) {
            return Err(ExpertError::state(format!(
                "expert '{}' already exists at '{}'",
                name, self.path
            )));
        }
        if adapter.kind() != self.kind {
            return Err(ExpertError::incompatible(
                format!("adapter kind at '{}'", self.path),
                self.kind.name(),
                adapter.kind().name(),
            ));
        }
        if adapter.kind() == AdapterKind::SkilledLora && !experts.is_empty()
            || experts.values().any(|a| matches!(a, Adapter::Skilled(_)))
        {
            return Err(ExpertError::incompatible(
                format!("experts at '{}'", self.path),
                "a single skilled LoRA",
                experts.len() + 1,
            ));
        }
        if let (Some(base_in), Some(base_out)) = (self.base.in_features(), self.base.out_features()) {
            if adapter.in_features() != base_in {
                return Err(ExpertError::incompatible(
                    format!("in_features of '{}'", self.path),
                    base_in,
                    adapter.in_features(),
                ));
            }
            if adapter.out_features() != base_out {
                return Err(ExpertError::incompatible(
                    format!("out_features of '{}'", self.path),
                    base_out,
                    adapter.out_features(),
                ));
            }
        }
        adapter.bind(&self.path, self.base.clone())?;
        experts.insert(name.to_string(), adapter);
        debug!("Added expert '{}' at '{}'", name, self.path);
        Ok(())
    }

    /// Remove and return a live adapter
    pub fn remove_expert(&mut self, name: &str) -> Result<Adapter> {
        match &mut self.state {
            ContainerState::Routed { experts } => experts
                .remove(name)
                .ok_or_else(|| ExpertError::not_found(format!("expert '{}' at '{}'", name, self.path))),
            ContainerState::Merged { .. } => Err(ExpertError::state(format!(
                "container at '{}' is merged",
                self.path
            ))),
        }
    }

    pub fn forward(&mut self, input: &Tensor, ctx: &mut ForwardContext<'_>) -> Result<Tensor> {
        let experts = match &mut self.state {
            ContainerState::Merged { .. } => return Ok(self.base.forward(input)),
            ContainerState::Routed { experts } if experts.is_empty() => return Ok(self.base.forward(input)),
            ContainerState::Routed { experts } => experts,
        };
        for adapter in experts.values_mut() {
            adapter.tick(ctx.training);
        }
        let x = widen(input);
        let base_out = widen(&self.base.forward(input));

        let key = match &self.selector_key {
            Some(key) => key.clone(),
            None if experts.len() == 1 && !experts.values().any(|a| matches!(a, Adapter::Skilled(_))) => {
                let delta = match experts.values().next() {
                    Some(adapter) => adapter.correction(input, &x, &base_out, None)?,
                    None => WideTensor::zeros(base_out.nrows(), base_out.ncols()),
                };
                return Ok(narrow(&(base_out + delta)));
            }
            None => {
                return Err(ExpertError::state(format!(
                    "container at '{}' has {} experts but no selector",
                    self.path,
                    experts.len()
                )))
            }
        };

        let selector = ctx.selectors.get_mut(&key)?;
        let routing = selector.route(&self.path, input, ctx.info, ctx.training)?;
        routing.validate(input.nrows())?;

        if experts.len() == 1 {
            if let Some(Adapter::Skilled(skilled)) = experts.values().next() {
                if routing.experts.len() != skilled.n_skills {
                    return Err(ExpertError::incompatible(
                        format!("routed skills at '{}'", self.path),
                        skilled.n_skills,
                        routing.experts.len(),
                    ));
                }
                let adapter = experts.values().next().ok_or_else(|| ExpertError::state("empty container"))?;
                let delta = adapter.correction(input, &x, &base_out, Some(&routing.weights))?;
                return Ok(narrow(&(base_out + delta)));
            }
        }

        if matches!(routing.weights, RoutingWeights::PerSplit(_)) {
            return Err(ExpertError::InvalidRouting(format!(
                "per-split routing at '{}' needs a skilled LoRA",
                self.path
            )));
        }
        if let Some(missing) = experts.keys().find(|name| !routing.experts.contains(name)) {
            return Err(ExpertError::state(format!(
                "selector '{}' does not know expert '{}'",
                key, missing
            )));
        }

        let weights = routing.dense();
        let mut out = base_out.clone();
        for (e, name) in routing.experts.iter().enumerate() {
            let column = weights.column(e);
            if column.iter().all(|w| *w == 0.0) || name == BASE_MODEL_EXPERT {
                continue;
            }
            let adapter = experts.get(name).ok_or_else(|| {
                ExpertError::InvalidRouting(format!("routing names unknown expert '{}' at '{}'", name, self.path))
            })?;
            let delta = adapter.correction(input, &x, &base_out, None)?;
            for (r, w) in column.iter().enumerate() {
                if *w != 0.0 {
                    let mut row = out.row_mut(r);
                    row += delta.row(r) * *w;
                }
            }
        }
        Ok(narrow(&out))
    }

    /// Fold expert `name` into the base weight; every other adapter is dropped
    pub fn merge(&mut self, name: &str) -> Result<()> {
        let experts = match &mut self.state {
            ContainerState::Merged { merged_expert } => {
                return Err(ExpertError::state(format!(
                    "container at '{}' already merged '{}'",
                    self.path, merged_expert
                )))
            }
            ContainerState::Routed { experts } => experts,
        };
        let adapter = experts
            .get(name)
            .ok_or_else(|| ExpertError::not_found(format!("expert '{}' at '{}'", name, self.path)))?;
        let merged = adapter.fold_into(&self.base)?;
        let dropped: Vec<String> = experts.keys().filter(|k| k.as_str() != name).cloned().collect();
        if !dropped.is_empty() {
            warn!("Merging '{}' at '{}' discards experts {:?}", name, self.path, dropped);
        }
        self.base = Arc::new(merged);
        self.state = ContainerState::Merged {
            merged_expert: name.to_string(),
        };
        info!("Merged expert '{}' into '{}'", name, self.path);
        Ok(())
    }

    /// Fold `adapter` into the base weight while keeping routed experts
    pub fn fold_into_base(&mut self, adapter: &Adapter) -> Result<()> {
        let experts = match &mut self.state {
            ContainerState::Merged { .. } => {
                return Err(ExpertError::state(format!("container at '{}' is merged", self.path)))
            }
            ContainerState::Routed { experts } => experts,
        };
        let base = Arc::new(adapter.fold_into(&self.base)?);
        for a in experts.values_mut() {
            a.bind(&self.path, base.clone())?;
        }
        self.base = base;
        debug!("Folded a {} adapter into the base of '{}'", adapter.kind().name(), self.path);
        Ok(())
    }

    /// Average the LoRA factors under `selector`'s static weights into one plain adapter
    pub fn collapse(&self, selector: &Selector, task: Option<&str>) -> Result<Adapter> {
        let experts = match &self.state {
            ContainerState::Routed { experts } if !experts.is_empty() => experts,
            _ => {
                return Err(ExpertError::state(format!(
                    "container at '{}' has no routed experts to collapse",
                    self.path
                )))
            }
        };
        let weights = selector.static_weights(task)?;
        let mut acc: Option<(LoRA, WideTensor, WideTensor)> = None;
        for (name, w) in selector.expert_names().iter().zip(weights) {
            if name == BASE_MODEL_EXPERT || w == 0.0 {
                continue;
            }
            let lora = match experts.get(name) {
                Some(Adapter::Lora(l)) => l,
                Some(_) => {
                    return Err(ExpertError::state("collapse is only defined for LoRA experts"))
                }
                None => {
                    return Err(ExpertError::InvalidRouting(format!(
                        "selector weights unknown expert '{}' at '{}'",
                        name, self.path
                    )))
                }
            };
            acc = Some(match acc {
                None => (lora.clone(), &lora.lora_a * w, &lora.lora_b * w),
                Some((first, a, b)) => {
                    if first.config.rank != lora.config.rank {
                        return Err(ExpertError::incompatible("LoRA rank", first.config.rank, lora.config.rank));
                    }
                    (first, a + &lora.lora_a * w, b + &lora.lora_b * w)
                }
            });
        }
        let (first, lora_a, lora_b) =
            acc.ok_or_else(|| ExpertError::state("selector gives every expert zero weight"))?;
        Ok(Adapter::Lora(LoRA {
            counter: StepCounter::new(first.config.warmup),
            config: first.config,
            lora_a,
            lora_b,
            layer: Some(self.base.clone()),
        }))
    }

    /// Give up the container, returning the (possibly merged) base layer
    pub fn into_base(self) -> Arc<Layer> {
        self.base
    }
}
