//! Arrow — per-token routing by similarity to per-expert prototypes
//!
//! Prototypes are computed offline by `transforms::ArrowTransform` and stored
//! as library auxiliary data. They are fetched on first use and kept in a
//! process-wide cache keyed by library uri, data id and the library's
//! filters; concurrent first access resolves to a single load.

use super::{Routing, RoutingWeights, BASE_MODEL_EXPERT};
use crate::error::{ExpertError, Result};
use crate::library::ExpertLibrary;
use crate::tensor::{l2_normalize, softmax, widen, Tensor};
use crate::transforms::arrow::{decode_prototypes, PrototypeTable, ARROW_KIND};
use log::{debug, info};
use nalgebra::{DMatrix, DVector};
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// (library uri, data id, filter view)
type CacheKey = (String, String, String);

static PROTOTYPE_CACHE: Lazy<Mutex<HashMap<CacheKey, Arc<OnceCell<Arc<PrototypeTable>>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Drop the cached prototypes of one data set, e.g. after recomputing them
pub fn invalidate_prototypes(library_uri: &str, data_id: &str) {
    PROTOTYPE_CACHE
        .lock()
        .retain(|(uri, data, _), _| uri != library_uri || data != data_id);
}

fn filter_view(library: &ExpertLibrary) -> String {
    let options = library.options();
    format!("{:?}/{:?}", options.model_name, options.exclude_selection)
}

fn cached_prototypes(library: &ExpertLibrary, data_id: &str) -> Result<Arc<PrototypeTable>> {
    let cell = {
        let mut cache = PROTOTYPE_CACHE.lock();
        cache
            .entry((library.uri().to_string(), data_id.to_string(), filter_view(library)))
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    };
    cell.get_or_try_init(|| {
        let payloads = library.get_auxiliary(ARROW_KIND, None, data_id)?;
        if payloads.is_empty() {
            return Err(ExpertError::not_found(format!(
                "prototypes not computed for data id '{}' in library '{}'",
                data_id,
                library.id()
            )));
        }
        let table = decode_prototypes(payloads)?;
        info!("Loaded arrow prototypes '{}' for {} experts", data_id, table.len());
        Ok(Arc::new(table))
    })
    .map(Arc::clone)
}

/// Normalization applied to inputs or prototypes before the dot product
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorNorm {
    #[default]
    Identity,
    L2,
}

impl VectorNorm {
    fn apply(&self, v: DVector<f64>) -> DVector<f64> {
        match self {
            VectorNorm::Identity => v,
            VectorNorm::L2 => l2_normalize(&v),
        }
    }
}

#[derive(Clone)]
pub struct ArrowSelector {
    pub experts: Vec<String>,
    pub data_id: String,
    pub temperature: f64,
    pub top_k: Option<usize>,
    pub input_norm: VectorNorm,
    pub proto_norm: VectorNorm,
    library: Arc<ExpertLibrary>,
    /// Normalized `experts × features` prototype matrix per layer
    layer_protos: HashMap<String, DMatrix<f64>>,
    pub(crate) last: Option<Routing>,
}

impl std::fmt::Debug for ArrowSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrowSelector")
            .field("experts", &self.experts)
            .field("data_id", &self.data_id)
            .field("temperature", &self.temperature)
            .field("top_k", &self.top_k)
            .field("library", &self.library.uri())
            .finish()
    }
}

impl ArrowSelector {
    pub fn new(
        experts: Vec<String>,
        library: Arc<ExpertLibrary>,
        data_id: String,
        temperature: f64,
        top_k: Option<usize>,
        input_norm: VectorNorm,
        proto_norm: VectorNorm,
    ) -> Self {
        Self {
            experts,
            data_id,
            temperature,
            top_k,
            input_norm,
            proto_norm,
            library,
            layer_protos: HashMap::new(),
            last: None,
        }
    }

    pub fn add_expert(&mut self, name: &str) {
        if !self.experts.iter().any(|e| e == name) {
            self.experts.push(name.to_string());
            self.layer_protos.clear();
        }
    }

    fn prototypes_for(&mut self, layer: &str, features: usize) -> Result<&DMatrix<f64>> {
        if !self.layer_protos.contains_key(layer) {
            let table = cached_prototypes(&self.library, &self.data_id)?;
            let has_base = table
                .get(BASE_MODEL_EXPERT)
                .map(|layers| layers.contains_key(layer))
                .unwrap_or(false);
            if has_base && !self.experts.iter().any(|e| e == BASE_MODEL_EXPERT) {
                self.experts.push(BASE_MODEL_EXPERT.to_string());
                self.layer_protos.clear();
            }
            let mut m = DMatrix::zeros(self.experts.len(), features);
            for (i, expert) in self.experts.iter().enumerate() {
                let proto = table
                    .get(expert)
                    .and_then(|layers| layers.get(layer))
                    .ok_or_else(|| {
                        ExpertError::not_found(format!(
                            "prototypes not computed for expert '{}' at layer '{}'",
                            expert, layer
                        ))
                    })?;
                if proto.len() != features {
                    return Err(ExpertError::incompatible(
                        format!("prototype width at '{}'", layer),
                        features,
                        proto.len(),
                    ));
                }
                let p = self.proto_norm.apply(proto.clone());
                m.row_mut(i).copy_from(&p.transpose());
            }
            debug!("Prepared {} arrow prototypes for '{}'", self.experts.len(), layer);
            self.layer_protos.insert(layer.to_string(), m);
        }
        self.layer_protos
            .get(layer)
            .ok_or_else(|| ExpertError::not_found(format!("prototypes for layer '{}'", layer)))
    }

    /// Zero all but the `k` largest weights and renormalize
    fn keep_top_k(weights: &mut [f64], k: usize) {
        if k == 0 || k >= weights.len() {
            return;
        }
        let mut order: Vec<usize> = (0..weights.len()).collect();
        order.sort_by(|a, b| weights[*b].total_cmp(&weights[*a]).then(a.cmp(b)));
        for i in &order[k..] {
            weights[*i] = 0.0;
        }
        let sum: f64 = weights.iter().sum();
        if sum > 0.0 {
            weights.iter_mut().for_each(|w| *w /= sum);
        }
    }

    pub fn route(&mut self, layer: &str, input: &Tensor) -> Result<Routing> {
        let x = widen(input);
        let temperature = self.temperature;
        let top_k = self.top_k;
        let input_norm = self.input_norm;
        let protos = self.prototypes_for(layer, x.ncols())?.clone();
        let mut weights = DMatrix::zeros(x.nrows(), protos.nrows());
        for r in 0..x.nrows() {
            let row = input_norm.apply(x.row(r).transpose());
            let logits: Vec<f64> = (&protos * &row)
                .iter()
                .map(|v| v.abs() / temperature)
                .collect();
            let mut w = softmax(&logits);
            if let Some(k) = top_k {
                Self::keep_top_k(&mut w, k);
            }
            for (e, v) in w.iter().enumerate() {
                weights[(r, e)] = *v;
            }
        }
        let routing = Routing::new(self.experts.clone(), RoutingWeights::Soft(weights));
        self.last = Some(routing.clone());
        Ok(routing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_k_renormalizes() {
        let mut w = vec![0.1, 0.5, 0.3, 0.1];
        ArrowSelector::keep_top_k(&mut w, 2);
        assert_eq!(w[0], 0.0);
        assert_eq!(w[3], 0.0);
        assert!((w[1] - 0.625).abs() < 1e-12);
        assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_vector_norms() {
        let v = DVector::from_vec(vec![3.0, 4.0]);
        assert_eq!(VectorNorm::Identity.apply(v.clone()), v);
        assert!((VectorNorm::L2.apply(v).norm() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_same_repo_name_in_two_stores_keeps_separate_prototypes() {
        use crate::transforms::testing::{library_with, lora_expert};
        use crate::transforms::{ArrowTransform, LibraryTransform};

        let first_dir = tempfile::tempdir().unwrap();
        let second_dir = tempfile::tempdir().unwrap();
        let first = library_with(first_dir.path(), &[lora_expert("a", |l, r, c| (l + r + c) as f64 * 0.2)]);
        let second = library_with(second_dir.path(), &[lora_expert("b", |l, r, c| (l + r * c) as f64 * -0.3)]);
        assert_eq!(first.id(), second.id());

        let arrow = ArrowTransform::new();
        arrow.transform(&first, false).unwrap();
        arrow.transform(&second, false).unwrap();
        let data_id = arrow.data_id();
        let from_first = cached_prototypes(&first, &data_id).unwrap();
        let from_second = cached_prototypes(&second, &data_id).unwrap();
        assert_eq!(from_first.keys().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(from_second.keys().collect::<Vec<_>>(), vec!["b"]);
    }
}
