//! Multi-expert model — a base model plus the experts, selectors and
//! registries that drive it
//!
//! Experts enter either empty (fresh adapters from a modifier) or from
//! persisted weights, and are either routed (kept as live adapters) or
//! merged straight into the base weights. Once a selector config is set,
//! every container gets a selector and later additions are registered with
//! it.

use super::{BaseModel, RoutingInfo};
use crate::adapters::{Adapter, AdapterConfig, AdapterKind};
use crate::containers::ForwardContext;
use crate::error::{ExpertError, Result};
use crate::library::{Expert, ExpertInfo, ExpertLibrary, ExpertWeights};
use crate::modifiers::ModifierRegistry;
use crate::selectors::{Selector, SelectorConfig, SelectorRegistry, SelectorSet, TaskNameSelector};
use crate::tensor::Tensor;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// What to do with an expert's weights when it is added
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpertAction {
    /// Keep as a live adapter routed by the selector
    Route,
    /// Fold into the base weights
    Merge,
}

pub struct MultiExpertModel {
    model: BaseModel,
    selectors: SelectorSet,
    selector_config: Option<SelectorConfig>,
    modifiers: ModifierRegistry,
    selector_registry: SelectorRegistry,
    /// Routed experts
    experts: BTreeMap<String, (AdapterConfig, ExpertInfo)>,
    /// Experts folded into the base weights, in merge order
    merged: Vec<String>,
    default_expert: Option<String>,
    training: bool,
    rng: StdRng,
}

impl MultiExpertModel {
    pub fn new(model: BaseModel, seed: u64) -> Self {
        Self {
            model,
            selectors: SelectorSet::new(),
            selector_config: None,
            modifiers: ModifierRegistry::default(),
            selector_registry: SelectorRegistry::default(),
            experts: BTreeMap::new(),
            merged: Vec::new(),
            default_expert: None,
            training: false,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn with_modifiers(mut self, modifiers: ModifierRegistry) -> Self {
        self.modifiers = modifiers;
        self
    }

    /// Library prototype-based selectors read from
    pub fn with_library(mut self, library: Arc<ExpertLibrary>) -> Self {
        self.selector_registry = SelectorRegistry::new(Some(library));
        self
    }

    pub fn model(&self) -> &BaseModel {
        &self.model
    }

    pub fn selectors(&self) -> &SelectorSet {
        &self.selectors
    }

    pub fn selector_config(&self) -> Option<&SelectorConfig> {
        self.selector_config.as_ref()
    }

    /// Routed expert names
    pub fn experts(&self) -> Vec<String> {
        self.experts.keys().cloned().collect()
    }

    pub fn merged_experts(&self) -> &[String] {
        &self.merged
    }

    pub fn expert_info(&self, name: &str) -> Option<&ExpertInfo> {
        self.experts.get(name).map(|(_, info)| info)
    }

    pub fn default_expert(&self) -> Option<&str> {
        self.default_expert.as_deref()
    }

    pub fn train(&mut self) {
        self.training = true;
    }

    pub fn eval(&mut self) {
        self.training = false;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    fn check_new_name(&self, name: &str) -> Result<()> {
        if self.experts.contains_key(name) || self.merged.iter().any(|m| m == name) {
            return Err(ExpertError::state(format!("expert '{}' already added to the model", name)));
        }
        Ok(())
    }

    pub fn set_default_expert(&mut self, name: &str) -> Result<()> {
        if !self.experts.contains_key(name) {
            return Err(ExpertError::not_found(format!("expert '{}'", name)));
        }
        self.default_expert = Some(name.to_string());
        let mut selectors = std::mem::take(&mut self.selectors);
        let outcome = selectors.transform_all(|selector| {
            Ok(match selector {
                Selector::TaskName(mut s) => {
                    s.set_default(Some(name));
                    Selector::TaskName(s)
                }
                other => other,
            })
        });
        self.selectors = selectors;
        outcome
    }

    fn register(&mut self, name: &str, config: AdapterConfig, info: ExpertInfo, is_default: bool) -> Result<()> {
        self.experts.insert(name.to_string(), (config, info));
        if is_default {
            self.set_default_expert(name)?;
        }
        self.sync_selectors()
    }

    /// Attach fresh, trainable adapters for a new expert
    pub fn add_empty_expert(&mut self, name: &str, config: &AdapterConfig, is_default: bool) -> Result<()> {
        self.check_new_name(name)?;
        let paths = self.modifiers.apply(&mut self.model, config, name, None, &mut self.rng)?;
        let info = ExpertInfo::new(name).with_model(self.model.name.clone());
        let mut config = config.clone();
        config.model = Some(self.model.name.clone());
        info!("Added empty expert '{}' at {} layers", name, paths.len());
        self.register(name, config, info, is_default)
    }

    /// Add persisted expert weights, routed or merged.
    ///
    /// The expert must target exactly the layers its config selects on this
    /// model; nothing is modified if any layer rejects its adapter.
    pub fn add_expert(&mut self, expert: &Expert, action: ExpertAction, is_default: bool) -> Result<()> {
        let name = expert.name().to_string();
        self.check_new_name(&name)?;
        expert.validate()?;
        expert.check_compatible(&self.model)?;
        let modifier = self.modifiers.resolve(&expert.config, None)?;

        let mut pending = Vec::with_capacity(expert.weights.len());
        for (path, tensors) in &expert.weights {
            if let Some(container) = self.model.container(path) {
                if container.is_merged() {
                    return Err(ExpertError::state(format!("container at '{}' is merged", path)));
                }
                if container.kind() != expert.config.kind {
                    return Err(ExpertError::incompatible(
                        format!("adapter kind at '{}'", path),
                        container.kind().name(),
                        expert.config.kind.name(),
                    ));
                }
                if action == ExpertAction::Route && expert.config.kind == AdapterKind::SkilledLora && !container.is_empty() {
                    return Err(ExpertError::incompatible(
                        format!("experts at '{}'", path),
                        "a single skilled LoRA",
                        container.len() + 1,
                    ));
                }
            }
            let mut adapter = Adapter::from_weights(&expert.config, tensors)?;
            adapter.bind(path, self.model.layer(path)?.clone())?;
            pending.push((path.clone(), adapter));
        }

        match action {
            ExpertAction::Route => {
                for (path, adapter) in pending {
                    self.model
                        .ensure_container(&path, &modifier, expert.config.kind)?
                        .add_expert(&name, adapter)?;
                    self.model.record_injection(&path, &modifier, &name);
                    self.model.set_trainable(&path, false)?;
                }
                info!("Routing expert '{}' over {} layers", name, expert.weights.len());
                self.register(&name, expert.config.clone(), expert.info.clone(), is_default)
            }
            ExpertAction::Merge => {
                for (path, adapter) in pending {
                    match self.model.container_mut(&path) {
                        Some(container) => container.fold_into_base(&adapter)?,
                        None => {
                            let folded = adapter.fold_into(self.model.layer(&path)?)?;
                            self.model.set_base_layer(&path, Arc::new(folded))?;
                        }
                    }
                }
                if is_default {
                    warn!("Ignoring default flag for merged expert '{}'", name);
                }
                self.merged.push(name.clone());
                info!("Merged expert '{}' into the base weights", name);
                Ok(())
            }
        }
    }

    /// Add experts from a library (all visible ones when `names` is `None`)
    pub fn load_from_library(
        &mut self,
        library: &ExpertLibrary,
        names: Option<&[String]>,
        action: ExpertAction,
    ) -> Result<Vec<String>> {
        let names = match names {
            Some(names) => names.to_vec(),
            None => library.list(),
        };
        for name in &names {
            let expert = library.get(name)?;
            self.add_expert(&expert, action, false)?;
        }
        info!("Loaded {} experts from library '{}'", names.len(), library.id());
        Ok(names)
    }

    /// Make sure every routed container has a selector knowing its experts
    fn sync_selectors(&mut self) -> Result<()> {
        let config = match &self.selector_config {
            Some(config) => config.clone(),
            None => return Ok(()),
        };
        let Self {
            model,
            selectors,
            selector_registry,
            experts,
            default_expert,
            rng,
            ..
        } = self;
        let task_of = |label: &str| -> Option<String> {
            let expert = label.split('[').next().unwrap_or(label);
            experts.get(expert).and_then(|(_, info)| info.expert_task_name.clone())
        };

        for container in model.containers_mut() {
            if container.is_merged() || container.is_empty() {
                continue;
            }
            let key = config.key(container.modifier(), &container.path);
            let names = container.routing_names();
            if !selectors.contains(&key) {
                let n_splits = if container.len() == 1 {
                    container
                        .expert_names()
                        .first()
                        .and_then(|n| container.adapter(n))
                        .map(Adapter::n_splits)
                        .unwrap_or(1)
                } else {
                    1
                };
                let mut selector = selector_registry.build(&config, &names, n_splits, rng)?;
                if let (Selector::TaskName(s), Some(default)) = (&mut selector, default_expert.as_deref()) {
                    if s.default_expert.is_none() {
                        s.set_default(Some(default));
                    }
                }
                selectors.insert(key.clone(), selector);
                debug!("Created {} selector '{}'", config.name(), key);
            }
            let selector = selectors.get_mut(&key)?;
            for label in &names {
                // Idempotent; also maps the expert's task for task-name routing
                selector.add_expert(label, task_of(label).as_deref());
            }
            container.set_selector_key(Some(key));
        }
        Ok(())
    }

    /// Replace every selector with fresh ones built from `config`
    pub fn set_selector(&mut self, config: SelectorConfig) -> Result<()> {
        self.selectors = SelectorSet::new();
        for container in self.model.containers_mut() {
            container.set_selector_key(None);
        }
        self.selector_config = Some(config);
        self.sync_selectors()?;
        info!(
            "Installed {} selectors ({} instances)",
            self.selector_config.as_ref().map(SelectorConfig::name).unwrap_or("no"),
            self.selectors.len()
        );
        Ok(())
    }

    /// Collapse learned selectors to equal weights; irreversible
    pub fn switch_selector_to_average(&mut self) -> Result<()> {
        self.selectors.transform_all(Selector::switch_to_average)?;
        if let Some(config) = &mut self.selector_config {
            let shared = config.share_across_layers;
            *config = SelectorConfig::uniform();
            config.share_across_layers = shared;
        }
        info!("Switched {} selectors to average routing", self.selectors.len());
        Ok(())
    }

    /// Current weights of a routed expert as a standalone expert
    pub fn get_expert_instance(&self, name: &str) -> Result<Expert> {
        let (config, info) = self
            .experts
            .get(name)
            .ok_or_else(|| ExpertError::not_found(format!("expert '{}'", name)))?;
        let mut weights = ExpertWeights::new();
        for container in self.model.containers() {
            if let Some(adapter) = container.adapter(name) {
                weights.insert(container.path.clone(), adapter.weights());
            }
        }
        if weights.is_empty() {
            return Err(ExpertError::not_found(format!("layers of expert '{}'", name)));
        }
        Ok(Expert::new(config.clone(), weights, info.clone()))
    }

    /// Single LoRA expert averaging the routed experts under the selectors' static weights
    pub fn get_merged_expert(&self, name: &str, task: Option<&str>) -> Result<Expert> {
        let mut weights = ExpertWeights::new();
        let mut config: Option<AdapterConfig> = None;
        for container in self.model.containers() {
            if container.is_merged() || container.is_empty() {
                continue;
            }
            let key = container
                .selector_key()
                .ok_or_else(|| ExpertError::state(format!("container at '{}' has no selector", container.path)))?;
            let selector = self.selectors.get(key)?;
            let adapter = container.collapse(selector, task)?;
            if config.is_none() {
                config = Some(adapter.config().clone());
            }
            weights.insert(container.path.clone(), adapter.weights());
        }
        let mut config = config.ok_or_else(|| ExpertError::state("model has no routed experts to merge"))?;
        config.model = Some(self.model.name.clone());
        let mut info = ExpertInfo::new(name).with_model(self.model.name.clone());
        info.expert_task_name = task.map(str::to_string);
        info.training_config = serde_json::json!({
            "merge": "selector_average",
            "sources": self.experts(),
        });
        Ok(Expert::new(config, weights, info))
    }

    /// Fold a routed expert into the base at every layer holding it
    pub fn merge_expert(&mut self, name: &str) -> Result<()> {
        if !self.experts.contains_key(name) {
            return Err(ExpertError::not_found(format!("expert '{}'", name)));
        }
        let mut touched = 0;
        for container in self.model.containers_mut() {
            if container.adapter(name).is_some() {
                container.merge(name)?;
                if let Some(key) = container.selector_key() {
                    let key = key.to_string();
                    container.set_selector_key(None);
                    if self.selector_config.as_ref().map(|c| !c.share_across_layers).unwrap_or(true) {
                        self.selectors.remove(&key);
                    }
                }
                touched += 1;
            }
        }
        self.experts.remove(name);
        self.merged.push(name.to_string());
        // Experts discarded by the merge are gone once no container holds them
        let live: Vec<String> = self
            .experts
            .keys()
            .filter(|e| self.model.containers().any(|c| c.adapter(e).is_some()))
            .cloned()
            .collect();
        self.experts.retain(|e, _| live.contains(e));
        if self.default_expert.as_deref().map(|d| !live.iter().any(|l| l == d)).unwrap_or(false) {
            self.default_expert = None;
        }
        info!("Merged expert '{}' at {} layers", name, touched);
        Ok(())
    }

    pub fn forward(&mut self, input: &Tensor, info: &RoutingInfo) -> Result<Tensor> {
        let mut ctx = ForwardContext::new(info, &mut self.selectors, self.training);
        self.model.forward(input, &mut ctx)
    }

    /// For every example, the routed expert whose output gets the lowest loss.
    ///
    /// `loss` maps a model output to one loss per example. Each candidate is
    /// evaluated alone by temporarily routing every container to it; the
    /// previous selectors are restored afterwards, also on failure.
    pub fn expert_choice(
        &mut self,
        input: &Tensor,
        info: &RoutingInfo,
        mut loss: impl FnMut(&Tensor) -> Result<Vec<f64>>,
    ) -> Result<Vec<String>> {
        let containers: Vec<(String, Vec<String>)> = self
            .model
            .containers()
            .filter(|c| !c.is_merged() && !c.is_empty())
            .map(|c| (c.path.clone(), c.expert_names()))
            .collect();
        if self.model.containers().any(|c| c.kind() == AdapterKind::SkilledLora && !c.is_empty()) {
            return Err(ExpertError::config("expert choice needs one adapter per expert, found skilled LoRA"));
        }
        let candidates: Vec<String> = self
            .experts
            .keys()
            .filter(|e| containers.iter().all(|(_, names)| names.contains(e)))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Err(ExpertError::state("no expert is present at every routed layer"));
        }
        let batch = info.batch_size().unwrap_or(input.nrows());
        let mut probe_info = info.clone();
        probe_info.task_names = None;
        probe_info.task_distribution = None;
        if probe_info.batch_size().is_none() && batch != input.nrows() {
            probe_info.example_ids = Some((0..batch).map(|i| i.to_string()).collect());
        }

        let saved = std::mem::take(&mut self.selectors);
        let saved_keys: Vec<(String, Option<String>)> = self
            .model
            .containers()
            .map(|c| (c.path.clone(), c.selector_key().map(str::to_string)))
            .collect();

        let outcome = self.score_candidates(input, &probe_info, &containers, &candidates, batch, &mut loss);

        self.selectors = saved;
        for (path, key) in saved_keys {
            if let Some(c) = self.model.container_mut(&path) {
                c.set_selector_key(key);
            }
        }
        let losses = outcome?;

        let choice: Vec<String> = (0..batch)
            .map(|ex| {
                let best = (0..candidates.len())
                    .min_by(|a, b| losses[*a][ex].total_cmp(&losses[*b][ex]))
                    .unwrap_or(0);
                candidates[best].clone()
            })
            .collect();
        debug!("Expert choice over {} candidates: {:?}", candidates.len(), choice);
        Ok(choice)
    }

    fn score_candidates(
        &mut self,
        input: &Tensor,
        info: &RoutingInfo,
        containers: &[(String, Vec<String>)],
        candidates: &[String],
        batch: usize,
        loss: &mut impl FnMut(&Tensor) -> Result<Vec<f64>>,
    ) -> Result<Vec<Vec<f64>>> {
        let mut all = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let mut selectors = SelectorSet::new();
            for (path, names) in containers {
                let key = format!("expert_choice:{}", path);
                selectors.insert(
                    key.clone(),
                    Selector::TaskName(TaskNameSelector::new(names.clone(), Some(candidate.clone()))),
                );
                if let Some(c) = self.model.container_mut(path) {
                    c.set_selector_key(Some(key));
                }
            }
            self.selectors = selectors;
            let out = self.forward(input, info)?;
            let losses = loss(&out)?;
            if losses.len() != batch {
                return Err(ExpertError::incompatible("losses per example", batch, losses.len()));
            }
            all.push(losses);
        }
        Ok(all)
    }

    /// Sum of the selectors' auxiliary losses
    pub fn auxiliary_loss(&self) -> f64 {
        self.selectors.auxiliary_loss()
    }

    /// Routing metrics of the last call, per selector key
    pub fn selector_metrics(&self) -> BTreeMap<String, BTreeMap<String, f64>> {
        self.selectors
            .iter()
            .map(|(key, s)| (key.clone(), s.metrics()))
            .filter(|(_, m)| !m.is_empty())
            .collect()
    }

    pub fn summary(&self) -> String {
        format!(
            "MultiExpertModel on '{}': {} routed experts, {} merged, {} containers, {} selectors ({}){}",
            self.model.name,
            self.experts.len(),
            self.merged.len(),
            self.model.containers().count(),
            self.selectors.len(),
            self.selector_config.as_ref().map(SelectorConfig::name).unwrap_or("none"),
            if self.training { ", training" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::LayerTensors;
    use crate::library::{LibraryOptions, LocalBlobStore};
    use crate::tensor::WideTensor;
    use nalgebra::DMatrix;

    const HIDDEN: usize = 4;

    fn base() -> BaseModel {
        let mut rng = StdRng::seed_from_u64(5);
        BaseModel::toy("toy", HIDDEN, 2, &mut rng)
    }

    fn input() -> Tensor {
        DMatrix::from_fn(2, HIDDEN, |r, c| (r as f32 + 1.0) * 0.2 - c as f32 * 0.15)
    }

    /// Expert with non-zero factors on every q_proj
    fn expert(name: &str, task: &str, seed: f64) -> Expert {
        let cfg = AdapterConfig::lora("q_proj").with_rank(2).with_model("toy");
        let mut weights = ExpertWeights::new();
        for layer in 0..2 {
            let mut t = LayerTensors::new();
            t.insert("lora_a".into(), WideTensor::from_fn(HIDDEN, 2, |r, c| seed * (r as f64 - c as f64 + 0.5) * 0.1));
            t.insert("lora_b".into(), WideTensor::from_fn(2, HIDDEN, |r, c| seed * ((r + c + layer) as f64) * 0.05));
            weights.insert(format!("blocks.{}.attn.q_proj", layer), t);
        }
        Expert::new(cfg, weights, ExpertInfo::new(name).with_task(task).with_model("toy"))
    }

    fn close(a: &Tensor, b: &Tensor) -> bool {
        a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() < 1e-4)
    }

    #[test]
    fn test_empty_expert_is_a_no_op() {
        let mut m = MultiExpertModel::new(base(), 0);
        let mut reference = base();
        m.add_empty_expert("e", &AdapterConfig::lora("q_proj|up_proj"), true).unwrap();
        assert_eq!(m.experts(), vec!["e"]);
        assert_eq!(m.default_expert(), Some("e"));
        let info = RoutingInfo::new();
        let y = m.forward(&input(), &info).unwrap();
        let mut s = SelectorSet::new();
        let y_ref = reference
            .forward(&input(), &mut ForwardContext::new(&info, &mut s, false))
            .unwrap();
        assert_eq!(y, y_ref);
        assert!(m.add_empty_expert("e", &AdapterConfig::lora("q_proj"), false).is_err());
    }

    #[test]
    fn test_route_by_task_name() {
        let mut m = MultiExpertModel::new(base(), 0);
        m.add_expert(&expert("a", "ta", 1.0), ExpertAction::Route, false).unwrap();
        m.add_expert(&expert("b", "tb", -2.0), ExpertAction::Route, false).unwrap();
        m.set_selector(SelectorConfig::task_name(None)).unwrap();
        assert_eq!(m.selectors().len(), 2);

        let mut only_a = MultiExpertModel::new(base(), 0);
        only_a.add_expert(&expert("a", "ta", 1.0), ExpertAction::Route, false).unwrap();
        let mut only_b = MultiExpertModel::new(base(), 0);
        only_b.add_expert(&expert("b", "tb", -2.0), ExpertAction::Route, false).unwrap();

        let x = input();
        let y = m.forward(&x, &RoutingInfo::with_task_names(["ta", "tb"])).unwrap();
        let ya = only_a.forward(&x, &RoutingInfo::new()).unwrap();
        let yb = only_b.forward(&x, &RoutingInfo::new()).unwrap();
        assert!(close(&y.rows(0, 1).into_owned(), &ya.rows(0, 1).into_owned()));
        assert!(close(&y.rows(1, 1).into_owned(), &yb.rows(1, 1).into_owned()));

        // Unknown task without a default expert
        assert!(m.forward(&x, &RoutingInfo::with_task_names(["tc", "ta"])).is_err());
        m.set_default_expert("a").unwrap();
        assert!(m.forward(&x, &RoutingInfo::with_task_names(["tc", "ta"])).is_ok());
    }

    #[test]
    fn test_merge_action_matches_routing() {
        let x = input();
        let mut routed = MultiExpertModel::new(base(), 0);
        routed.add_expert(&expert("a", "ta", 1.0), ExpertAction::Route, false).unwrap();
        let mut merged = MultiExpertModel::new(base(), 0);
        merged.add_expert(&expert("a", "ta", 1.0), ExpertAction::Merge, false).unwrap();
        assert_eq!(merged.merged_experts(), &["a".to_string()]);
        assert!(merged.experts().is_empty());
        let y_routed = routed.forward(&x, &RoutingInfo::new()).unwrap();
        let y_merged = merged.forward(&x, &RoutingInfo::new()).unwrap();
        assert!(close(&y_routed, &y_merged));

        routed.merge_expert("a").unwrap();
        let y_after = routed.forward(&x, &RoutingInfo::new()).unwrap();
        assert!(close(&y_routed, &y_after));
        assert!(routed.model().containers().all(|c| c.is_merged()));
        assert!(matches!(routed.merge_expert("a"), Err(ExpertError::NotFound(_))));
    }

    #[test]
    fn test_incompatible_expert_rejected() {
        let mut m = MultiExpertModel::new(base(), 0);
        let mut e = expert("a", "ta", 1.0);
        e.info.model = Some("other".into());
        assert!(matches!(
            m.add_expert(&e, ExpertAction::Route, false),
            Err(ExpertError::Incompatible { .. })
        ));
        assert!(m.model().containers().next().is_none());
    }

    #[test]
    fn test_get_expert_instance_round_trips_weights() {
        let mut m = MultiExpertModel::new(base(), 0);
        let e = expert("a", "ta", 1.0);
        m.add_expert(&e, ExpertAction::Route, false).unwrap();
        let back = m.get_expert_instance("a").unwrap();
        assert_eq!(back.weights, e.weights);
        assert_eq!(back.info.expert_task_name.as_deref(), Some("ta"));
        assert!(m.get_expert_instance("zzz").is_err());
    }

    #[test]
    fn test_merged_expert_under_uniform_and_task_selectors() {
        let mut m = MultiExpertModel::new(base(), 0);
        m.add_expert(&expert("a", "ta", 1.0), ExpertAction::Route, false).unwrap();
        m.add_expert(&expert("b", "tb", 3.0), ExpertAction::Route, false).unwrap();

        m.set_selector(SelectorConfig::task_name(Some("a"))).unwrap();
        assert!(matches!(m.get_merged_expert("avg", None), Err(ExpertError::State(_))));

        m.set_selector(SelectorConfig::uniform()).unwrap();
        let avg = m.get_merged_expert("avg", None).unwrap();
        let a = &avg.weights["blocks.0.attn.q_proj"]["lora_a"];
        let expected = expert("a", "ta", 2.0).weights["blocks.0.attn.q_proj"]["lora_a"].clone();
        assert!((a - expected).norm() < 1e-12);
        avg.check_compatible(m.model()).unwrap();
    }

    #[test]
    fn test_poly_selector_switches_to_average() {
        let mut m = MultiExpertModel::new(base(), 3);
        m.add_expert(&expert("a", "ta", 1.0), ExpertAction::Route, false).unwrap();
        m.add_expert(&expert("b", "tb", 2.0), ExpertAction::Route, false).unwrap();
        m.set_selector(SelectorConfig::poly(["ta", "tb"]).shared()).unwrap();
        assert_eq!(m.selectors().len(), 1);

        m.train();
        m.forward(&input(), &RoutingInfo::with_task_names(["ta", "tb"])).unwrap();
        let metrics = m.selector_metrics();
        assert!(metrics["lora"].contains_key("routing_entropy"));

        m.switch_selector_to_average().unwrap();
        assert!(m.selectors().iter().all(|(_, s)| s.name() == "uniform"));
        assert_eq!(m.selector_config().map(|c| c.name()), Some("uniform"));
        m.eval();
        m.forward(&input(), &RoutingInfo::new()).unwrap();
    }

    #[test]
    fn test_expert_added_after_selector_is_registered() {
        let mut m = MultiExpertModel::new(base(), 0);
        m.add_expert(&expert("a", "ta", 1.0), ExpertAction::Route, false).unwrap();
        m.set_selector(SelectorConfig::uniform()).unwrap();
        m.add_expert(&expert("b", "tb", 2.0), ExpertAction::Route, false).unwrap();
        assert!(m.selectors().iter().all(|(_, s)| s.knows("b")));
    }

    #[test]
    fn test_expert_choice_picks_lowest_loss() {
        let mut m = MultiExpertModel::new(base(), 0);
        m.add_expert(&expert("a", "ta", 1.0), ExpertAction::Route, false).unwrap();
        m.add_expert(&expert("b", "tb", -2.0), ExpertAction::Route, false).unwrap();
        m.set_selector(SelectorConfig::uniform()).unwrap();

        let x = input();
        let mut only_b = MultiExpertModel::new(base(), 0);
        only_b.add_expert(&expert("b", "tb", -2.0), ExpertAction::Route, false).unwrap();
        let target = only_b.forward(&x, &RoutingInfo::new()).unwrap();

        let choice = m
            .expert_choice(&x, &RoutingInfo::new(), |out| {
                Ok((0..out.nrows())
                    .map(|r| (out.row(r) - target.row(r)).norm() as f64)
                    .collect())
            })
            .unwrap();
        assert_eq!(choice, vec!["b", "b"]);
        // Original selectors are back in place
        assert!(m.selectors().iter().all(|(_, s)| s.name() == "uniform"));
        assert!(m.forward(&x, &RoutingInfo::new()).is_ok());

        let err = m.expert_choice(&x, &RoutingInfo::new(), |_| Ok(vec![0.0]));
        assert!(err.is_err());
        assert_eq!(m.selectors().len(), 2);
    }

    #[test]
    fn test_load_from_library() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalBlobStore::new(dir.path()).unwrap());
        let lib = ExpertLibrary::open(store, "lib", LibraryOptions::create()).unwrap();
        lib.add_expert(&expert("a", "ta", 1.0), None, false).unwrap();
        lib.add_expert(&expert("b", "tb", 2.0), None, false).unwrap();

        let mut m = MultiExpertModel::new(base(), 0);
        let loaded = m.load_from_library(&lib, None, ExpertAction::Route).unwrap();
        assert_eq!(loaded, vec!["a", "b"]);
        assert_eq!(m.experts(), vec!["a", "b"]);
        assert!(m.summary().contains("2 routed experts"));
    }
}
