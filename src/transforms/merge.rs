//! Expert merging — weighted linear averaging and TIES
//!
//! Both strategies merge tensor by tensor over the same layer set, so every
//! input expert must share the adapter kind, the layer paths and each
//! tensor's shape.

use super::{load_experts, LibraryTransform};
use crate::error::{ExpertError, Result};
use crate::library::{Expert, ExpertInfo, ExpertLibrary, ExpertWeights};
use crate::tensor::WideTensor;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Check that all experts can be merged position by position
fn check_mergeable(experts: &[Expert]) -> Result<()> {
    let first = experts
        .first()
        .ok_or_else(|| ExpertError::config("cannot merge zero experts"))?;
    for other in &experts[1..] {
        if other.config.kind != first.config.kind {
            return Err(ExpertError::incompatible(
                format!("adapter kind of '{}'", other.name()),
                first.config.kind.name(),
                other.config.kind.name(),
            ));
        }
        if other.layer_paths() != first.layer_paths() {
            return Err(ExpertError::incompatible(
                format!("layer set of '{}'", other.name()),
                format!("{:?}", first.layer_paths()),
                format!("{:?}", other.layer_paths()),
            ));
        }
        for (path, tensors) in &first.weights {
            let theirs = &other.weights[path];
            if theirs.len() != tensors.len() {
                return Err(ExpertError::incompatible(
                    format!("tensors of '{}' at '{}'", other.name(), path),
                    format!("{:?}", tensors.keys().collect::<Vec<_>>()),
                    format!("{:?}", theirs.keys().collect::<Vec<_>>()),
                ));
            }
            for (name, t) in tensors {
                let o = theirs.get(name).ok_or_else(|| {
                    ExpertError::incompatible(
                        format!("tensors of '{}' at '{}'", other.name(), path),
                        name,
                        "<missing>",
                    )
                })?;
                if o.shape() != t.shape() {
                    return Err(ExpertError::incompatible(
                        format!("shape of '{}.{}' in '{}'", path, name, other.name()),
                        format!("{:?}", t.shape()),
                        format!("{:?}", o.shape()),
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Apply `combine` to the aligned tensors of every (layer, tensor name)
fn merge_tensors(experts: &[Expert], mut combine: impl FnMut(&[&WideTensor]) -> WideTensor) -> ExpertWeights {
    let mut out = ExpertWeights::new();
    for (path, tensors) in &experts[0].weights {
        let mut merged = BTreeMap::new();
        for name in tensors.keys() {
            let aligned: Vec<&WideTensor> = experts.iter().map(|e| &e.weights[path][name]).collect();
            merged.insert(name.clone(), combine(&aligned));
        }
        out.insert(path.clone(), merged);
    }
    out
}

fn merged_info(name: &str, experts: &[Expert], method: &str, params: serde_json::Value) -> ExpertInfo {
    let sources: Vec<&str> = experts.iter().map(|e| e.name()).collect();
    let mut info = ExpertInfo::new(name);
    info.model = experts[0].model_name().map(str::to_string);
    info.training_config = serde_json::json!({
        "merge": method,
        "sources": sources,
        "params": params,
    });
    info
}

/// `Σ wᵢ Tᵢ` over matching tensors; weights default to `1/n`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightedLinearMerge {
    /// Name of the merged expert
    pub name: String,
    /// Experts to merge; every visible expert when `None`
    #[serde(default)]
    pub experts: Option<Vec<String>>,
    /// Per-expert weights; uniform when `None`
    #[serde(default)]
    pub weights: Option<BTreeMap<String, f64>>,
}

impl WeightedLinearMerge {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            experts: None,
            weights: None,
        }
    }

    pub fn with_experts(mut self, experts: Vec<String>) -> Self {
        self.experts = Some(experts);
        self
    }

    pub fn with_weights(mut self, weights: BTreeMap<String, f64>) -> Self {
        self.weights = Some(weights);
        self
    }

    fn coefficients(&self, experts: &[Expert]) -> Result<Vec<f64>> {
        match &self.weights {
            None => Ok(vec![1.0 / experts.len() as f64; experts.len()]),
            Some(weights) => experts
                .iter()
                .map(|e| {
                    weights
                        .get(e.name())
                        .copied()
                        .ok_or_else(|| ExpertError::config(format!("no merge weight for expert '{}'", e.name())))
                })
                .collect(),
        }
    }

    pub fn merge(&self, experts: &[Expert]) -> Result<Expert> {
        check_mergeable(experts)?;
        let coefficients = self.coefficients(experts)?;
        let weights = merge_tensors(experts, |tensors| {
            let mut acc = WideTensor::zeros(tensors[0].nrows(), tensors[0].ncols());
            for (t, w) in tensors.iter().zip(&coefficients) {
                acc += *t * *w;
            }
            acc
        });
        let info = merged_info(
            &self.name,
            experts,
            "weighted_linear",
            serde_json::json!({ "weights": coefficients }),
        );
        info!("Weighted-linear merged {} experts into '{}'", experts.len(), self.name);
        Ok(Expert::new(experts[0].config.clone(), weights, info))
    }
}

impl LibraryTransform for WeightedLinearMerge {
    type Output = Expert;

    fn name(&self) -> &'static str {
        "weighted_linear_merge"
    }

    fn transform(&self, library: &ExpertLibrary, _force: bool) -> Result<Expert> {
        let experts = load_experts(library, self.experts.as_deref())?;
        self.merge(&experts)
    }
}

/// TIES merge: trim, elect the majority sign, disjoint mean
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TiesMerge {
    pub name: String,
    #[serde(default)]
    pub experts: Option<Vec<String>>,
    /// Fraction of entries (by magnitude) each expert keeps per tensor
    #[serde(default = "default_top_k")]
    pub top_k: f64,
}

fn default_top_k() -> f64 {
    0.2
}

impl TiesMerge {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            experts: None,
            top_k: default_top_k(),
        }
    }

    pub fn with_experts(mut self, experts: Vec<String>) -> Self {
        self.experts = Some(experts);
        self
    }

    pub fn with_top_k(mut self, top_k: f64) -> Self {
        self.top_k = top_k;
        self
    }

    /// Keep the `ceil(top_k · len)` largest-magnitude entries, zero the rest
    fn trim(&self, t: &WideTensor) -> WideTensor {
        let keep = ((self.top_k * t.len() as f64).ceil() as usize).min(t.len());
        if keep == t.len() {
            return t.clone();
        }
        let mut order: Vec<usize> = (0..t.len()).collect();
        order.sort_by(|a, b| t[*b].abs().total_cmp(&t[*a].abs()).then(a.cmp(b)));
        let mut out = WideTensor::zeros(t.nrows(), t.ncols());
        for i in &order[..keep] {
            out[*i] = t[*i];
        }
        out
    }

    /// Sign held by more surviving entries; summed mass breaks ties
    fn elect_sign(values: &[f64]) -> f64 {
        let positive = values.iter().filter(|v| **v > 0.0).count();
        let negative = values.iter().filter(|v| **v < 0.0).count();
        match positive.cmp(&negative) {
            std::cmp::Ordering::Greater => 1.0,
            std::cmp::Ordering::Less => -1.0,
            std::cmp::Ordering::Equal => {
                let mass: f64 = values.iter().sum();
                if mass == 0.0 {
                    0.0
                } else {
                    mass.signum()
                }
            }
        }
    }

    fn combine(&self, tensors: &[&WideTensor]) -> WideTensor {
        let trimmed: Vec<WideTensor> = tensors.iter().map(|t| self.trim(t)).collect();
        let mut out = WideTensor::zeros(tensors[0].nrows(), tensors[0].ncols());
        for i in 0..out.len() {
            let values: Vec<f64> = trimmed.iter().map(|t| t[i]).collect();
            let sign = Self::elect_sign(&values);
            if sign == 0.0 {
                continue;
            }
            let agreeing: Vec<f64> = values.into_iter().filter(|v| *v != 0.0 && v.signum() == sign).collect();
            if !agreeing.is_empty() {
                out[i] = agreeing.iter().sum::<f64>() / agreeing.len() as f64;
            }
        }
        out
    }

    pub fn merge(&self, experts: &[Expert]) -> Result<Expert> {
        if !(self.top_k > 0.0 && self.top_k <= 1.0) {
            return Err(ExpertError::config(format!("TIES top_k must be in (0, 1], got {}", self.top_k)));
        }
        check_mergeable(experts)?;
        let weights = merge_tensors(experts, |tensors| self.combine(tensors));
        let info = merged_info(&self.name, experts, "ties", serde_json::json!({ "top_k": self.top_k }));
        info!("TIES merged {} experts into '{}' (top_k {})", experts.len(), self.name, self.top_k);
        Ok(Expert::new(experts[0].config.clone(), weights, info))
    }
}

impl LibraryTransform for TiesMerge {
    type Output = Expert;

    fn name(&self) -> &'static str {
        "ties_merge"
    }

    fn transform(&self, library: &ExpertLibrary, _force: bool) -> Result<Expert> {
        let experts = load_experts(library, self.experts.as_deref())?;
        self.merge(&experts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::AdapterConfig;
    use crate::transforms::testing::{library_with, lora_expert};

    fn constant(name: &str, v: f64) -> Expert {
        lora_expert(name, move |_, _, _| v)
    }

    #[test]
    fn test_uniform_linear_merge_averages() {
        let experts = vec![constant("a", 1.0), constant("b", 3.0)];
        let merged = WeightedLinearMerge::new("avg").merge(&experts).unwrap();
        let a = &merged.weights["blocks.0.attn.q_proj"]["lora_a"];
        assert!(a.iter().all(|v| (*v - 2.0).abs() < 1e-12));
        assert_eq!(merged.name(), "avg");
        assert_eq!(merged.info.training_config["merge"], "weighted_linear");
    }

    #[test]
    fn test_explicit_weights() {
        let experts = vec![constant("a", 1.0), constant("b", 3.0)];
        let weights: BTreeMap<String, f64> = [("a".to_string(), 0.75), ("b".to_string(), 0.25)].into();
        let merged = WeightedLinearMerge::new("w").with_weights(weights).merge(&experts).unwrap();
        let b = &merged.weights["blocks.1.attn.q_proj"]["lora_b"];
        assert!(b.iter().all(|v| (*v - 0.75).abs() < 1e-12));

        let partial: BTreeMap<String, f64> = [("a".to_string(), 1.0)].into();
        assert!(WeightedLinearMerge::new("w").with_weights(partial).merge(&experts).is_err());
    }

    #[test]
    fn test_shape_mismatch_is_incompatible() {
        let a = constant("a", 1.0);
        let mut b = constant("b", 1.0);
        b.weights
            .get_mut("blocks.0.attn.q_proj")
            .unwrap()
            .insert("lora_a".into(), WideTensor::zeros(5, 2));
        let err = WeightedLinearMerge::new("m").merge(&[a.clone(), b]).unwrap_err();
        assert!(matches!(err, ExpertError::Incompatible { .. }));

        let mut c = constant("c", 1.0);
        c.weights.remove("blocks.1.attn.q_proj");
        assert!(matches!(
            WeightedLinearMerge::new("m").merge(&[a.clone(), c]),
            Err(ExpertError::Incompatible { .. })
        ));

        let mut d = constant("d", 1.0);
        d.config = AdapterConfig::ia3("q_proj");
        assert!(WeightedLinearMerge::new("m").merge(&[a, d]).is_err());
    }

    #[test]
    fn test_ties_majority_sign_average() {
        let experts = vec![constant("a", 1.0), constant("b", 1.0), constant("c", -1.0)];
        let merged = TiesMerge::new("ties").with_top_k(1.0).merge(&experts).unwrap();
        for tensors in merged.weights.values() {
            for t in tensors.values() {
                // lora_b entries are scaled by 0.5 in the fixture
                assert!(t.iter().all(|v| (*v - 1.0).abs() < 1e-12 || (*v - 0.5).abs() < 1e-12));
            }
        }
        let a = &merged.weights["blocks.0.attn.q_proj"]["lora_a"];
        assert!(a.iter().all(|v| (*v - 1.0).abs() < 1e-12));
    }

    #[test]
    fn test_ties_sign_follows_count_over_mass() {
        let experts = vec![constant("a", 0.1), constant("b", 0.1), constant("c", -1.0)];
        let merged = TiesMerge::new("ties").with_top_k(1.0).merge(&experts).unwrap();
        let a = &merged.weights["blocks.0.attn.q_proj"]["lora_a"];
        assert!(a.iter().all(|v| (*v - 0.1).abs() < 1e-12));
    }

    #[test]
    fn test_ties_mass_breaks_count_ties() {
        assert_eq!(TiesMerge::elect_sign(&[0.5, -2.0]), -1.0);
        assert_eq!(TiesMerge::elect_sign(&[3.0, 0.0, -2.0]), 1.0);
        assert_eq!(TiesMerge::elect_sign(&[1.0, -1.0]), 0.0);
        assert_eq!(TiesMerge::elect_sign(&[0.0, 0.0]), 0.0);
        let experts = vec![constant("a", 1.0), constant("b", -1.0)];
        let merged = TiesMerge::new("ties").with_top_k(1.0).merge(&experts).unwrap();
        let a = &merged.weights["blocks.0.attn.q_proj"]["lora_a"];
        assert!(a.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_ties_trims_small_entries() {
        let merge = TiesMerge::new("t").with_top_k(0.5);
        let t = WideTensor::from_row_slice(1, 4, &[0.1, -3.0, 2.0, 0.2]);
        let trimmed = merge.trim(&t);
        assert_eq!(trimmed, WideTensor::from_row_slice(1, 4, &[0.0, -3.0, 2.0, 0.0]));
        assert!(TiesMerge::new("t").with_top_k(0.0).merge(&[constant("a", 1.0)]).is_err());
    }

    #[test]
    fn test_transform_over_library() {
        let dir = tempfile::tempdir().unwrap();
        let lib = library_with(dir.path(), &[constant("a", 2.0), constant("b", 4.0), constant("c", 6.0)]);
        let merge = WeightedLinearMerge::new("ab").with_experts(vec!["a".into(), "b".into()]);
        let merged = merge.transform(&lib, false).unwrap();
        let a = &merged.weights["blocks.0.attn.q_proj"]["lora_a"];
        assert!(a.iter().all(|v| (*v - 3.0).abs() < 1e-12));
        assert_eq!(merged.info.model.as_deref(), Some("toy"));
        // Transforms do not touch the library
        assert_eq!(lib.len(), 3);
    }
}
