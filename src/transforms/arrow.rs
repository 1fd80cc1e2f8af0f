//! Arrow prototypes — per-layer routing directions derived from LoRA factors
//!
//! An expert's prototype at a layer is the top right singular vector of its
//! weight delta `ΔW = (scale · A B)ᵀ`, i.e. the input direction the expert
//! amplifies most. Tied layers share one prototype computed from their
//! combined deltas.

use super::{load_experts, LibraryTransform};
use crate::adapters::{AdapterKind, LORA_A, LORA_B};
use crate::error::{ExpertError, Result};
use crate::library::{Expert, ExpertLibrary};
use crate::model::{BaseModel, Layer};
use crate::selectors::{invalidate_prototypes, BASE_MODEL_EXPERT};
use crate::tensor::{top_right_singular_vector, widen, WideTensor};
use log::{debug, info, warn};
use nalgebra::DVector;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Auxiliary data kind the prototypes are stored under
pub const ARROW_KIND: &str = "arrow_prototypes";

/// Expert → layer path → prototype
pub type PrototypeTable = BTreeMap<String, BTreeMap<String, DVector<f64>>>;

/// Decode per-expert `{layer: [f64]}` payloads
pub fn decode_prototypes(payloads: BTreeMap<String, serde_json::Value>) -> Result<PrototypeTable> {
    let mut table = PrototypeTable::new();
    for (expert, payload) in payloads {
        let layers: BTreeMap<String, Vec<f64>> = serde_json::from_value(payload)?;
        table.insert(
            expert,
            layers
                .into_iter()
                .map(|(layer, v)| (layer, DVector::from_vec(v)))
                .collect(),
        );
    }
    Ok(table)
}

fn encode_layers(layers: &BTreeMap<String, DVector<f64>>) -> Result<serde_json::Value> {
    let plain: BTreeMap<&String, &[f64]> = layers.iter().map(|(k, v)| (k, v.as_slice())).collect();
    Ok(serde_json::to_value(plain)?)
}

/// Which layers share a prototype
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TiePolicy {
    /// Every layer gets its own prototype
    #[default]
    Default,
    /// Layers under the same parent module whose names match the same
    /// pattern are tied (e.g. `q_proj|k_proj|v_proj`)
    Groups(Vec<String>),
}

/// How the deltas of tied layers are combined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieOp {
    /// Stack the deltas vertically
    #[default]
    Concat,
    /// Sum the deltas (requires equal shapes)
    Sum,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArrowTransform {
    #[serde(default)]
    pub tie_policy: TiePolicy,
    #[serde(default)]
    pub tie_op: TieOp,
    /// Also store a `base_model` prototype derived from the base weights
    #[serde(default)]
    pub add_base_proto: bool,
    /// Experts to process; every visible expert when `None`
    #[serde(default)]
    pub experts: Option<Vec<String>>,
}

impl ArrowTransform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ties(mut self, policy: TiePolicy, op: TieOp) -> Self {
        self.tie_policy = policy;
        self.tie_op = op;
        self
    }

    pub fn with_base_proto(mut self, add_base_proto: bool) -> Self {
        self.add_base_proto = add_base_proto;
        self
    }

    /// Content hash of the transform's configuration
    pub fn data_id(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        format!("arrow_{}", &hex::encode(Sha256::digest(&bytes))[..16])
    }

    /// Tie key → layer paths sharing one prototype
    fn tie_groups(&self, paths: &[String]) -> Result<BTreeMap<String, Vec<String>>> {
        let patterns = match &self.tie_policy {
            TiePolicy::Default => Vec::new(),
            TiePolicy::Groups(groups) => groups
                .iter()
                .map(|g| {
                    Regex::new(&format!("^(?:{})$", g))
                        .map_err(|e| ExpertError::config(format!("invalid tie group '{}': {}", g, e)))
                })
                .collect::<Result<Vec<_>>>()?,
        };
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for path in paths {
            let (parent, name) = path.rsplit_once('.').unwrap_or(("", path.as_str()));
            let key = match patterns.iter().position(|p| p.is_match(name)) {
                Some(i) => format!("{}#tie{}", parent, i),
                None => path.clone(),
            };
            groups.entry(key).or_default().push(path.clone());
        }
        Ok(groups)
    }

    fn combine(&self, deltas: Vec<WideTensor>, what: &str) -> Result<WideTensor> {
        let mut iter = deltas.into_iter();
        let first = iter
            .next()
            .ok_or_else(|| ExpertError::state(format!("no deltas for {}", what)))?;
        iter.try_fold(first, |acc, d| {
            if d.ncols() != acc.ncols() || (self.tie_op == TieOp::Sum && d.nrows() != acc.nrows()) {
                return Err(ExpertError::incompatible(
                    format!("tied deltas of {}", what),
                    format!("{:?}", acc.shape()),
                    format!("{:?}", d.shape()),
                ));
            }
            Ok(match self.tie_op {
                TieOp::Sum => acc + d,
                TieOp::Concat => {
                    let rows = acc.nrows();
                    let mut stacked = acc.resize_vertically(rows + d.nrows(), 0.0);
                    stacked.rows_mut(rows, d.nrows()).copy_from(&d);
                    stacked
                }
            })
        })
    }

    /// Prototypes per layer from a `path → ΔW` map
    fn prototypes(&self, deltas: &BTreeMap<String, WideTensor>, owner: &str) -> Result<BTreeMap<String, DVector<f64>>> {
        let paths: Vec<String> = deltas.keys().cloned().collect();
        let mut out = BTreeMap::new();
        for (key, members) in self.tie_groups(&paths)? {
            let combined = self.combine(
                members.iter().map(|p| deltas[p].clone()).collect(),
                &format!("'{}' ({})", owner, key),
            )?;
            let proto = top_right_singular_vector(&combined)
                .ok_or_else(|| ExpertError::state(format!("SVD failed for '{}' at '{}'", owner, key)))?;
            for path in members {
                out.insert(path, proto.clone());
            }
        }
        Ok(out)
    }

    fn expert_deltas(expert: &Expert) -> Result<BTreeMap<String, WideTensor>> {
        let scale = expert.config.scaling();
        let mut deltas = BTreeMap::new();
        for (path, tensors) in &expert.weights {
            let a = tensors
                .get(LORA_A)
                .ok_or_else(|| ExpertError::not_found(format!("tensor '{}' of '{}' at '{}'", LORA_A, expert.name(), path)))?;
            let b = tensors
                .get(LORA_B)
                .ok_or_else(|| ExpertError::not_found(format!("tensor '{}' of '{}' at '{}'", LORA_B, expert.name(), path)))?;
            deltas.insert(path.clone(), (a * b).transpose() * scale);
        }
        Ok(deltas)
    }

    /// Compute prototypes for `experts`; `base` is required with `add_base_proto`
    pub fn compute(&self, experts: &[Expert], base: Option<&BaseModel>) -> Result<PrototypeTable> {
        let mut table = PrototypeTable::new();
        let mut layers: Vec<String> = Vec::new();
        for expert in experts {
            if expert.config.kind != AdapterKind::Lora {
                warn!(
                    "Skipping expert '{}': arrow prototypes need lora factors, found {}",
                    expert.name(),
                    expert.config.kind.name()
                );
                continue;
            }
            let deltas = Self::expert_deltas(expert)?;
            for path in deltas.keys() {
                if !layers.contains(path) {
                    layers.push(path.clone());
                }
            }
            table.insert(expert.name().to_string(), self.prototypes(&deltas, expert.name())?);
            debug!("Computed arrow prototypes for '{}'", expert.name());
        }

        if self.add_base_proto {
            let base = base.ok_or_else(|| ExpertError::config("add_base_proto requires the base model"))?;
            let mut deltas = BTreeMap::new();
            for path in &layers {
                match base.layer(path)?.as_ref() {
                    Layer::Linear(l) => {
                        deltas.insert(path.clone(), widen(&l.weight));
                    }
                    other => {
                        return Err(ExpertError::UnsupportedLayerKind {
                            path: path.clone(),
                            kind: other.kind().to_string(),
                            adapter: "arrow".to_string(),
                        })
                    }
                }
            }
            table.insert(BASE_MODEL_EXPERT.to_string(), self.prototypes(&deltas, BASE_MODEL_EXPERT)?);
        }
        Ok(table)
    }

    /// Compute (or reuse) prototypes and store them in the library
    pub fn transform_with_base(
        &self,
        library: &ExpertLibrary,
        base: Option<&BaseModel>,
        force: bool,
    ) -> Result<PrototypeTable> {
        let data_id = self.data_id();
        let names = match &self.experts {
            Some(names) => names.clone(),
            None => library.list(),
        };
        if !force {
            let cached = library.get_auxiliary(ARROW_KIND, None, &data_id)?;
            let complete = names.iter().all(|n| cached.contains_key(n))
                && (!self.add_base_proto || cached.contains_key(BASE_MODEL_EXPERT));
            if !cached.is_empty() && complete {
                debug!("Using cached arrow prototypes '{}'", data_id);
                return decode_prototypes(cached);
            }
        }

        let experts = load_experts(library, Some(&names))?;
        let table = self.compute(&experts, base)?;
        for (expert, layers) in &table {
            library.add_auxiliary(ARROW_KIND, expert, &data_id, encode_layers(layers)?, true)?;
        }
        invalidate_prototypes(library.uri(), &data_id);
        info!(
            "Stored arrow prototypes '{}' for {} experts in '{}'",
            data_id,
            table.len(),
            library.id()
        );
        Ok(table)
    }
}

impl LibraryTransform for ArrowTransform {
    type Output = PrototypeTable;

    fn name(&self) -> &'static str {
        "arrow"
    }

    fn transform(&self, library: &ExpertLibrary, force: bool) -> Result<PrototypeTable> {
        self.transform_with_base(library, None, force)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{AdapterConfig, LayerTensors};
    use crate::library::{ExpertInfo, ExpertWeights};
    use crate::transforms::testing::library_with;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Rank-1 expert whose delta at every layer is `b aᵀ`
    fn rank_one(name: &str, a: &[f64], b: &[f64], paths: &[&str]) -> Expert {
        let cfg = AdapterConfig::lora("q_proj|k_proj").with_rank(1).with_model("toy");
        let mut weights = ExpertWeights::new();
        for path in paths {
            let mut t = LayerTensors::new();
            t.insert(LORA_A.into(), WideTensor::from_column_slice(a.len(), 1, a));
            t.insert(LORA_B.into(), WideTensor::from_row_slice(1, b.len(), b));
            weights.insert(path.to_string(), t);
        }
        Expert::new(cfg, weights, ExpertInfo::new(name))
    }

    #[test]
    fn test_prototype_is_input_direction_of_delta() {
        let e = rank_one("e", &[0.0, 3.0, 4.0, 0.0], &[1.0, -2.0, 0.5, 1.0], &["blocks.0.attn.q_proj"]);
        let table = ArrowTransform::new().compute(&[e], None).unwrap();
        let proto = &table["e"]["blocks.0.attn.q_proj"];
        let expected = DVector::from_vec(vec![0.0, 0.6, 0.8, 0.0]);
        assert!((proto - expected).norm() < 1e-9);
    }

    #[test]
    fn test_tied_layers_share_a_prototype() {
        let mut e = rank_one(
            "e",
            &[1.0, 0.0, 0.0, 0.0],
            &[1.0, 1.0, 1.0, 1.0],
            &["blocks.0.attn.q_proj", "blocks.0.attn.k_proj"],
        );
        e.weights
            .get_mut("blocks.0.attn.k_proj")
            .unwrap()
            .insert(LORA_A.into(), WideTensor::from_column_slice(4, 1, &[0.0, 1.0, 0.0, 0.0]));

        let untied = ArrowTransform::new().compute(&[e.clone()], None).unwrap();
        assert_ne!(untied["e"]["blocks.0.attn.q_proj"], untied["e"]["blocks.0.attn.k_proj"]);

        for op in [TieOp::Concat, TieOp::Sum] {
            let tied = ArrowTransform::new()
                .with_ties(TiePolicy::Groups(vec!["q_proj|k_proj".into()]), op)
                .compute(&[e.clone()], None)
                .unwrap();
            let q = &tied["e"]["blocks.0.attn.q_proj"];
            assert_eq!(q, &tied["e"]["blocks.0.attn.k_proj"]);
            assert!((q.norm() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_base_proto_needs_base_model() {
        let e = rank_one("e", &[1.0, 0.0, 0.0, 0.0], &[1.0, 0.0, 0.0, 0.0], &["blocks.0.attn.q_proj"]);
        let transform = ArrowTransform::new().with_base_proto(true);
        assert!(matches!(
            transform.compute(&[e.clone()], None),
            Err(ExpertError::Configuration(_))
        ));
        let mut rng = StdRng::seed_from_u64(1);
        let base = BaseModel::toy("toy", 4, 1, &mut rng);
        let table = transform.compute(&[e], Some(&base)).unwrap();
        assert_eq!(table[BASE_MODEL_EXPERT]["blocks.0.attn.q_proj"].len(), 4);
    }

    #[test]
    fn test_stored_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let experts = vec![
            rank_one("a", &[1.0, 0.0, 0.0, 0.0], &[1.0, 0.0, 0.0, 0.0], &["blocks.0.attn.q_proj"]),
            rank_one("b", &[0.0, 1.0, 0.0, 0.0], &[0.0, 1.0, 0.0, 0.0], &["blocks.0.attn.q_proj"]),
        ];
        let lib = library_with(dir.path(), &experts);
        let transform = ArrowTransform::new();
        let computed = transform.transform(&lib, false).unwrap();
        let stored = decode_prototypes(lib.get_auxiliary(ARROW_KIND, None, &transform.data_id()).unwrap()).unwrap();
        assert_eq!(stored, computed);
        assert_eq!(transform.transform(&lib, false).unwrap(), computed);
        assert_ne!(transform.data_id(), ArrowTransform::new().with_base_proto(true).data_id());
    }
}
