//! Expert — a persisted bundle of adapter config, weights and provenance

use crate::adapters::{Adapter, AdapterConfig, LayerTensors};
use crate::error::{ExpertError, Result};
use crate::model::BaseModel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Layer path → named tensors
pub type ExpertWeights = BTreeMap<String, LayerTensors>;

/// Provenance metadata carried with every expert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpertInfo {
    pub expert_name: String,
    /// Task the expert was trained on
    #[serde(default)]
    pub expert_task_name: Option<String>,
    /// Expert this one was derived from
    #[serde(default)]
    pub parent_node: Option<String>,
    /// Base model the weights belong to
    #[serde(default)]
    pub model: Option<String>,
    /// Snapshot of the producing run's configuration
    #[serde(default)]
    pub training_config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
    #[serde(default)]
    pub deleted: bool,
}

impl ExpertInfo {
    pub fn new(expert_name: impl Into<String>) -> Self {
        Self {
            expert_name: expert_name.into(),
            expert_task_name: None,
            parent_node: None,
            model: None,
            training_config: serde_json::Value::Null,
            created_at: Utc::now(),
            id: Uuid::new_v4(),
            deleted: false,
        }
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.expert_task_name = Some(task.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_node = Some(parent.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expert {
    pub config: AdapterConfig,
    pub weights: ExpertWeights,
    pub info: ExpertInfo,
}

impl Expert {
    pub fn new(config: AdapterConfig, weights: ExpertWeights, info: ExpertInfo) -> Self {
        Self { config, weights, info }
    }

    pub fn name(&self) -> &str {
        &self.info.expert_name
    }

    /// Base model name from the info block, else from the config
    pub fn model_name(&self) -> Option<&str> {
        self.info.model.as_deref().or(self.config.model.as_deref())
    }

    pub fn layer_paths(&self) -> Vec<String> {
        self.weights.keys().cloned().collect()
    }

    /// Copy under a new name and fresh id
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        let mut out = self.clone();
        out.info.expert_name = name.into();
        out.info.id = Uuid::new_v4();
        out
    }

    /// Check every layer's tensors materialize under the config
    pub fn validate(&self) -> Result<()> {
        self.config.validate()?;
        if self.weights.is_empty() {
            return Err(ExpertError::state(format!("expert '{}' has no weights", self.name())));
        }
        for tensors in self.weights.values() {
            Adapter::from_weights(&self.config, tensors)?;
        }
        Ok(())
    }

    /// Fail fast unless the model name and targeted layer set agree with `model`
    pub fn check_compatible(&self, model: &BaseModel) -> Result<()> {
        if let Some(name) = self.model_name() {
            if name != model.name {
                return Err(ExpertError::incompatible(
                    format!("base model of expert '{}'", self.name()),
                    name,
                    &model.name,
                ));
            }
        }
        let expected: BTreeSet<String> = model.matching_paths(&self.config)?.into_iter().collect();
        let actual: BTreeSet<String> = self.weights.keys().cloned().collect();
        if expected != actual {
            return Err(ExpertError::incompatible(
                format!("layer set of expert '{}'", self.name()),
                format!("{:?}", expected),
                format!("{:?}", actual),
            ));
        }
        Ok(())
    }

    pub fn encode_weights(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.weights)?)
    }

    pub fn decode_weights(bytes: &[u8]) -> Result<ExpertWeights> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Hex sha256 of an encoded weight blob
    pub fn digest(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// Total number of scalar parameters
    pub fn num_params(&self) -> usize {
        self.weights
            .values()
            .flat_map(|t| t.values())
            .map(|m| m.len())
            .sum()
    }

    pub fn summary(&self) -> String {
        format!(
            "Expert '{}': {} adapter, rank {}, {} layers, {} params{}",
            self.name(),
            self.config.kind.name(),
            self.config.rank,
            self.weights.len(),
            self.num_params(),
            self.info
                .expert_task_name
                .as_ref()
                .map(|t| format!(", task '{}'", t))
                .unwrap_or_default()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::WideTensor;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn expert() -> Expert {
        let cfg = AdapterConfig::lora("q_proj").with_rank(2);
        let mut weights = ExpertWeights::new();
        for i in 0..2 {
            let mut t = LayerTensors::new();
            t.insert("lora_a".into(), WideTensor::from_fn(4, 2, |r, c| (r * 2 + c) as f64 * 0.1 + i as f64));
            t.insert("lora_b".into(), WideTensor::from_fn(2, 4, |r, c| r as f64 - c as f64 * 1e-7));
            weights.insert(format!("blocks.{}.attn.q_proj", i), t);
        }
        Expert::new(cfg, weights, ExpertInfo::new("ex").with_task("t").with_model("toy"))
    }

    #[test]
    fn test_weights_encode_bit_exact() {
        let e = expert();
        let bytes = e.encode_weights().unwrap();
        let back = Expert::decode_weights(&bytes).unwrap();
        assert_eq!(back, e.weights);
        assert_eq!(Expert::digest(&bytes).len(), 64);
    }

    #[test]
    fn test_compatibility_checks() {
        let mut rng = StdRng::seed_from_u64(0);
        let model = BaseModel::toy("toy", 4, 2, &mut rng);
        let e = expert();
        e.validate().unwrap();
        e.check_compatible(&model).unwrap();

        let other = BaseModel::toy("other", 4, 2, &mut rng);
        assert!(matches!(e.check_compatible(&other), Err(ExpertError::Incompatible { .. })));

        let shallow = BaseModel::toy("toy", 4, 1, &mut rng);
        let err = e.check_compatible(&shallow).unwrap_err();
        assert!(err.to_string().contains("layer set"));
    }

    #[test]
    fn test_summary_mentions_task() {
        let e = expert();
        assert!(e.summary().contains("task 't'"));
        assert_eq!(e.num_params(), 2 * (8 + 8));
    }
}
