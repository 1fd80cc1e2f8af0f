//! Selectors — per-call routing policies over a set of named experts
//!
//! A selector turns a batch's [`RoutingInfo`] (and, for Arrow, the layer
//! input) into routing weights. Containers look their selector up by key in
//! the model-owned [`SelectorSet`]; one selector may serve many layers.

mod arrow;
mod poly;
mod task_name;
mod uniform;

pub use arrow::{invalidate_prototypes, ArrowSelector, VectorNorm};
pub use poly::PolySelector;
pub use task_name::TaskNameSelector;
pub use uniform::UniformSelector;

use crate::error::{ExpertError, Result};
use crate::library::ExpertLibrary;
use crate::model::RoutingInfo;
use crate::tensor::Tensor;
use log::info;
use nalgebra::DMatrix;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Pseudo-expert standing for the unmodified base layer (zero correction)
pub const BASE_MODEL_EXPERT: &str = "base_model";

/// Tolerance on per-row weight sums
const SUM_TOLERANCE: f64 = 1e-6;

/// Routing weights for one batch, one entry/row per input row
#[derive(Debug, Clone, PartialEq)]
pub enum RoutingWeights {
    /// Index of the single expert each row uses
    Hard(Vec<usize>),
    /// Mixture weights, `rows × experts`
    Soft(DMatrix<f64>),
    /// One `rows × experts` mixture per feature split
    PerSplit(Vec<DMatrix<f64>>),
}

/// A routing decision: weights over the named experts
#[derive(Debug, Clone, PartialEq)]
pub struct Routing {
    pub experts: Vec<String>,
    pub weights: RoutingWeights,
}

impl Routing {
    pub fn new(experts: Vec<String>, weights: RoutingWeights) -> Self {
        Self { experts, weights }
    }

    pub fn rows(&self) -> usize {
        match &self.weights {
            RoutingWeights::Hard(idx) => idx.len(),
            RoutingWeights::Soft(w) => w.nrows(),
            RoutingWeights::PerSplit(ws) => ws.first().map(|w| w.nrows()).unwrap_or(0),
        }
    }

    /// Reject anything that is neither a valid index nor a valid distribution
    pub fn validate(&self, rows: usize) -> Result<()> {
        let n = self.experts.len();
        if self.rows() != rows {
            return Err(ExpertError::InvalidRouting(format!(
                "routing covers {} rows, batch has {}",
                self.rows(),
                rows
            )));
        }
        match &self.weights {
            RoutingWeights::Hard(idx) => match idx.iter().find(|i| **i >= n) {
                Some(i) => Err(ExpertError::InvalidRouting(format!(
                    "expert index {} out of range for {} experts",
                    i, n
                ))),
                None => Ok(()),
            },
            RoutingWeights::Soft(w) => validate_distribution(w, n),
            RoutingWeights::PerSplit(ws) => {
                if ws.is_empty() {
                    return Err(ExpertError::InvalidRouting("per-split routing has no splits".into()));
                }
                if let Some((q, w)) = ws.iter().enumerate().find(|(_, w)| w.nrows() != rows) {
                    return Err(ExpertError::InvalidRouting(format!(
                        "split {} covers {} rows, batch has {}",
                        q,
                        w.nrows(),
                        rows
                    )));
                }
                ws.iter().try_for_each(|w| validate_distribution(w, n))
            }
        }
    }

    /// Dense `rows × experts` view (per-split weights are averaged)
    pub fn dense(&self) -> DMatrix<f64> {
        let n = self.experts.len();
        match &self.weights {
            RoutingWeights::Hard(idx) => {
                let mut m = DMatrix::zeros(idx.len(), n);
                for (r, i) in idx.iter().enumerate() {
                    if *i < n {
                        m[(r, *i)] = 1.0;
                    }
                }
                m
            }
            RoutingWeights::Soft(w) => w.clone(),
            RoutingWeights::PerSplit(ws) => {
                let mut acc = DMatrix::zeros(self.rows(), n);
                for w in ws {
                    acc += w;
                }
                acc / ws.len().max(1) as f64
            }
        }
    }

    /// Mean Shannon entropy (nats) of the per-row distributions
    pub fn mean_entropy(&self) -> f64 {
        let dense = self.dense();
        if dense.nrows() == 0 {
            return 0.0;
        }
        let total: f64 = dense
            .row_iter()
            .map(|row| row.iter().filter(|p| **p > 0.0).map(|p| -p * p.ln()).sum::<f64>())
            .sum();
        total / dense.nrows() as f64
    }
}

fn validate_distribution(w: &DMatrix<f64>, n: usize) -> Result<()> {
    if w.ncols() != n {
        return Err(ExpertError::InvalidRouting(format!(
            "routing has {} columns for {} experts",
            w.ncols(),
            n
        )));
    }
    for (r, row) in w.row_iter().enumerate() {
        if row.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(ExpertError::InvalidRouting(format!(
                "row {} has NaN or negative weights",
                r
            )));
        }
        let sum: f64 = row.iter().sum();
        if (sum - 1.0).abs() > SUM_TOLERANCE {
            return Err(ExpertError::InvalidRouting(format!(
                "row {} weights sum to {}",
                r, sum
            )));
        }
    }
    Ok(())
}

/// Policy-specific selector parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum SelectorPolicy {
    Uniform,
    TaskName {
        #[serde(default)]
        default_expert: Option<String>,
    },
    Poly {
        /// Known task names; empty means one shared logit row
        #[serde(default)]
        tasks: Vec<String>,
        /// Coefficient of the entropy auxiliary loss (0 disables it)
        #[serde(default)]
        entropy_weight: f64,
    },
    Arrow {
        /// Identifier of the prototype data set in the library
        data_id: String,
        #[serde(default = "default_temperature")]
        temperature: f64,
        #[serde(default)]
        top_k: Option<usize>,
        #[serde(default)]
        input_norm: VectorNorm,
        #[serde(default)]
        proto_norm: VectorNorm,
    },
}

fn default_temperature() -> f64 {
    1.0
}

/// Selector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorConfig {
    #[serde(flatten)]
    pub policy: SelectorPolicy,
    /// One selector instance per modifier instead of one per layer
    #[serde(default)]
    pub share_across_layers: bool,
}

impl SelectorConfig {
    pub fn uniform() -> Self {
        Self::from(SelectorPolicy::Uniform)
    }

    pub fn task_name(default_expert: Option<&str>) -> Self {
        Self::from(SelectorPolicy::TaskName {
            default_expert: default_expert.map(str::to_string),
        })
    }

    pub fn poly<S: Into<String>>(tasks: impl IntoIterator<Item = S>) -> Self {
        Self::from(SelectorPolicy::Poly {
            tasks: tasks.into_iter().map(Into::into).collect(),
            entropy_weight: 0.0,
        })
    }

    pub fn arrow(data_id: impl Into<String>, top_k: Option<usize>) -> Self {
        Self::from(SelectorPolicy::Arrow {
            data_id: data_id.into(),
            temperature: default_temperature(),
            top_k,
            input_norm: VectorNorm::default(),
            proto_norm: VectorNorm::default(),
        })
    }

    pub fn shared(mut self) -> Self {
        self.share_across_layers = true;
        self
    }

    pub fn name(&self) -> &'static str {
        match self.policy {
            SelectorPolicy::Uniform => "uniform",
            SelectorPolicy::TaskName { .. } => "task_name",
            SelectorPolicy::Poly { .. } => "poly",
            SelectorPolicy::Arrow { .. } => "arrow",
        }
    }

    /// Default configuration for a registered selector name
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "uniform" => Ok(Self::uniform()),
            "task_name" => Ok(Self::task_name(None)),
            "poly" => Ok(Self::poly(Vec::<String>::new())),
            "arrow" => Err(ExpertError::config("arrow selector needs a prototype data id")),
            other => Err(ExpertError::config(format!("unknown selector '{}'", other))),
        }
    }

    /// Container-to-selector key under this config
    pub fn key(&self, modifier: &str, layer: &str) -> String {
        if self.share_across_layers {
            modifier.to_string()
        } else {
            format!("{}:{}", modifier, layer)
        }
    }
}

impl From<SelectorPolicy> for SelectorConfig {
    fn from(policy: SelectorPolicy) -> Self {
        Self {
            policy,
            share_across_layers: false,
        }
    }
}

/// Closed set of routing policies
#[derive(Debug, Clone)]
pub enum Selector {
    Uniform(UniformSelector),
    TaskName(TaskNameSelector),
    Poly(PolySelector),
    Arrow(ArrowSelector),
}

impl Selector {
    pub fn name(&self) -> &'static str {
        match self {
            Selector::Uniform(_) => "uniform",
            Selector::TaskName(_) => "task_name",
            Selector::Poly(_) => "poly",
            Selector::Arrow(_) => "arrow",
        }
    }

    /// Route the `input.nrows()` rows of one forward call at `layer`
    pub fn route(&mut self, layer: &str, input: &Tensor, info: &RoutingInfo, training: bool) -> Result<Routing> {
        match self {
            Selector::Uniform(s) => s.route(input.nrows()),
            Selector::TaskName(s) => s.route(input.nrows(), info),
            Selector::Poly(s) => s.route(input.nrows(), info, training),
            Selector::Arrow(s) => s.route(layer, input),
        }
    }

    /// Register an expert; `task` is the task it was trained on, if any
    pub fn add_expert(&mut self, name: &str, task: Option<&str>) {
        match self {
            Selector::Uniform(s) => s.add_expert(name),
            Selector::TaskName(s) => s.add_expert(name, task),
            Selector::Poly(s) => s.add_expert(name),
            Selector::Arrow(s) => s.add_expert(name),
        }
    }

    pub fn expert_names(&self) -> &[String] {
        match self {
            Selector::Uniform(s) => &s.experts,
            Selector::TaskName(s) => &s.experts,
            Selector::Poly(s) => &s.experts,
            Selector::Arrow(s) => &s.experts,
        }
    }

    pub fn knows(&self, name: &str) -> bool {
        self.expert_names().iter().any(|e| e == name)
    }

    /// Differentiable regularizer the trainer may add to its loss
    pub fn auxiliary_loss(&self) -> Option<f64> {
        match self {
            Selector::Poly(s) => s.auxiliary_loss(),
            _ => None,
        }
    }

    /// Routing-quality metrics of the most recent call
    pub fn metrics(&self) -> BTreeMap<String, f64> {
        let last = match self {
            Selector::Uniform(_) | Selector::TaskName(_) => None,
            Selector::Poly(s) => s.last.as_ref(),
            Selector::Arrow(s) => s.last.as_ref(),
        };
        let mut m = BTreeMap::new();
        if let Some(routing) = last {
            m.insert("routing_entropy".to_string(), routing.mean_entropy());
            let dense = routing.dense();
            let max_mean = dense
                .row_iter()
                .map(|r| r.iter().cloned().fold(0.0, f64::max))
                .sum::<f64>()
                / dense.nrows().max(1) as f64;
            m.insert("routing_max_weight".to_string(), max_mean);
        }
        m
    }

    /// Input-independent weights over `expert_names()`
    pub fn static_weights(&self, task: Option<&str>) -> Result<Vec<f64>> {
        match self {
            Selector::Uniform(s) => s.static_weights(),
            Selector::Poly(s) => s.static_weights(task),
            Selector::TaskName(_) | Selector::Arrow(_) => Err(ExpertError::state(format!(
                "{} routing depends on the batch and has no static weights",
                self.name()
            ))),
        }
    }

    /// One-way collapse of a learned selector to equal weights
    pub fn switch_to_average(self) -> Result<Selector> {
        match self {
            Selector::Poly(p) => Ok(Selector::Uniform(p.switch_to_average())),
            Selector::Uniform(u) => Ok(Selector::Uniform(u)),
            other => Err(ExpertError::state(format!(
                "{} selector cannot switch to average routing",
                other.name()
            ))),
        }
    }
}

/// Builds selectors from configs, holding the library handle prototype-based
/// selectors fetch from
#[derive(Clone, Default)]
pub struct SelectorRegistry {
    library: Option<Arc<ExpertLibrary>>,
}

impl SelectorRegistry {
    pub fn new(library: Option<Arc<ExpertLibrary>>) -> Self {
        Self { library }
    }

    pub fn build<R: Rng + ?Sized>(
        &self,
        config: &SelectorConfig,
        experts: &[String],
        n_splits: usize,
        rng: &mut R,
    ) -> Result<Selector> {
        let selector = match &config.policy {
            SelectorPolicy::Uniform => Selector::Uniform(UniformSelector::new(experts.to_vec())),
            SelectorPolicy::TaskName { default_expert } => {
                Selector::TaskName(TaskNameSelector::new(experts.to_vec(), default_expert.clone()))
            }
            SelectorPolicy::Poly { tasks, entropy_weight } => Selector::Poly(PolySelector::new(
                experts.to_vec(),
                tasks.clone(),
                n_splits,
                *entropy_weight,
                rng,
            )),
            SelectorPolicy::Arrow {
                data_id,
                temperature,
                top_k,
                input_norm,
                proto_norm,
            } => {
                let library = self.library.clone().ok_or_else(|| {
                    ExpertError::config("arrow selector needs an expert library for its prototypes")
                })?;
                if *temperature <= 0.0 {
                    return Err(ExpertError::config("arrow temperature must be > 0"));
                }
                Selector::Arrow(ArrowSelector::new(
                    experts.to_vec(),
                    library,
                    data_id.clone(),
                    *temperature,
                    *top_k,
                    *input_norm,
                    *proto_norm,
                ))
            }
        };
        info!("Built {} selector over {} experts", selector.name(), experts.len());
        Ok(selector)
    }
}

/// Model-owned selectors, addressed by container key
#[derive(Debug, Clone, Default)]
pub struct SelectorSet {
    selectors: BTreeMap<String, Selector>,
}

impl SelectorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, selector: Selector) -> Option<Selector> {
        self.selectors.insert(key.into(), selector)
    }

    pub fn remove(&mut self, key: &str) -> Option<Selector> {
        self.selectors.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.selectors.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Result<&Selector> {
        self.selectors
            .get(key)
            .ok_or_else(|| ExpertError::not_found(format!("selector '{}'", key)))
    }

    pub fn get_mut(&mut self, key: &str) -> Result<&mut Selector> {
        self.selectors
            .get_mut(key)
            .ok_or_else(|| ExpertError::not_found(format!("selector '{}'", key)))
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.selectors.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Selector)> {
        self.selectors.iter()
    }

    pub fn len(&self) -> usize {
        self.selectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selectors.is_empty()
    }

    /// Sum of all selectors' auxiliary losses
    pub fn auxiliary_loss(&self) -> f64 {
        self.selectors.values().filter_map(Selector::auxiliary_loss).sum()
    }

    /// Apply `f` to every selector, replacing it with the result
    pub fn transform_all(&mut self, mut f: impl FnMut(Selector) -> Result<Selector>) -> Result<()> {
        let keys: Vec<String> = self.selectors.keys().cloned().collect();
        for key in keys {
            if let Some(selector) = self.selectors.remove(&key) {
                let next = f(selector)?;
                self.selectors.insert(key, next);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("e{}", i)).collect()
    }

    #[test]
    fn test_validate_accepts_distributions_and_indices() {
        let soft = Routing::new(names(2), RoutingWeights::Soft(DMatrix::from_row_slice(2, 2, &[0.5, 0.5, 1.0, 0.0])));
        assert!(soft.validate(2).is_ok());
        let hard = Routing::new(names(3), RoutingWeights::Hard(vec![0, 2]));
        assert!(hard.validate(2).is_ok());
    }

    #[test]
    fn test_validate_rejects_invalid_routing() {
        let nan = Routing::new(names(2), RoutingWeights::Soft(DMatrix::from_row_slice(1, 2, &[f64::NAN, 1.0])));
        assert!(matches!(nan.validate(1), Err(ExpertError::InvalidRouting(_))));
        let partial = Routing::new(names(2), RoutingWeights::Soft(DMatrix::from_row_slice(1, 2, &[0.2, 0.3])));
        assert!(matches!(partial.validate(1), Err(ExpertError::InvalidRouting(_))));
        let negative = Routing::new(names(2), RoutingWeights::Soft(DMatrix::from_row_slice(1, 2, &[1.5, -0.5])));
        assert!(matches!(negative.validate(1), Err(ExpertError::InvalidRouting(_))));
        let out_of_range = Routing::new(names(2), RoutingWeights::Hard(vec![2]));
        assert!(matches!(out_of_range.validate(1), Err(ExpertError::InvalidRouting(_))));
        let wrong_rows = Routing::new(names(2), RoutingWeights::Hard(vec![0]));
        assert!(wrong_rows.validate(3).is_err());
    }

    #[test]
    fn test_validate_checks_rows_of_every_split() {
        let full = DMatrix::from_row_slice(2, 2, &[0.5, 0.5, 1.0, 0.0]);
        let short = DMatrix::from_row_slice(1, 2, &[0.5, 0.5]);
        let ragged = Routing::new(names(2), RoutingWeights::PerSplit(vec![full.clone(), short]));
        match ragged.validate(2) {
            Err(ExpertError::InvalidRouting(msg)) => assert!(msg.contains("split 1")),
            other => panic!("unexpected {:?}", other),
        }
        let even = Routing::new(names(2), RoutingWeights::PerSplit(vec![full.clone(), full]));
        assert!(even.validate(2).is_ok());
    }

    #[test]
    fn test_entropy_of_uniform_routing() {
        let r = Routing::new(names(4), RoutingWeights::Soft(DMatrix::from_element(3, 4, 0.25)));
        assert!((r.mean_entropy() - 4f64.ln()).abs() < 1e-12);
        let hard = Routing::new(names(4), RoutingWeights::Hard(vec![1, 3]));
        assert_eq!(hard.mean_entropy(), 0.0);
    }

    #[test]
    fn test_selector_keys() {
        let cfg = SelectorConfig::uniform();
        assert_eq!(cfg.key("lora", "h.0.q"), "lora:h.0.q");
        assert_eq!(cfg.shared().key("lora", "h.0.q"), "lora");
    }

    #[test]
    fn test_config_serde_and_names() {
        let cfg: SelectorConfig =
            serde_json::from_str(r#"{"name":"poly","tasks":["a","b"],"share_across_layers":true}"#).unwrap();
        assert!(cfg.share_across_layers);
        assert_eq!(cfg.name(), "poly");
        assert!(SelectorConfig::from_name("nope").is_err());
        assert_eq!(SelectorConfig::from_name("uniform").unwrap(), SelectorConfig::uniform());
    }

    #[test]
    fn test_static_weights_rejected_for_input_dependent_selectors() {
        let s = Selector::TaskName(TaskNameSelector::new(names(2), None));
        assert!(matches!(s.static_weights(None), Err(ExpertError::State(_))));
    }
}
