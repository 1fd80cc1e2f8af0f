//! SVD embeddings of flattened expert weights

use super::{load_experts, LibraryTransform};
use crate::error::{ExpertError, Result};
use crate::library::{Expert, ExpertLibrary};
use crate::tensor::flatten;
use log::{debug, info};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Auxiliary data kind the embeddings are cached under
pub const EMBEDDINGS_KIND: &str = "embeddings";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SvdEmbedding {
    /// Embedding width; capped by the number of experts and parameters
    pub n_components: usize,
    /// Fraction of smallest-magnitude entries zeroed per expert before the SVD
    pub sparsity_threshold: f64,
}

impl Default for SvdEmbedding {
    fn default() -> Self {
        Self {
            n_components: 64,
            sparsity_threshold: 0.1,
        }
    }
}

impl SvdEmbedding {
    pub fn new(n_components: usize, sparsity_threshold: f64) -> Self {
        Self {
            n_components,
            sparsity_threshold,
        }
    }

    /// Key identifying embeddings computed with these parameters
    pub fn data_id(&self) -> String {
        format!("svd_{}_{}", self.n_components, self.sparsity_threshold)
    }

    fn validate(&self) -> Result<()> {
        if self.n_components == 0 {
            return Err(ExpertError::config("n_components must be >= 1"));
        }
        if !(0.0..1.0).contains(&self.sparsity_threshold) {
            return Err(ExpertError::config(format!(
                "sparsity_threshold must be in [0, 1), got {}",
                self.sparsity_threshold
            )));
        }
        Ok(())
    }

    /// All tensors of an expert in layer/tensor-name order
    fn flatten_expert(expert: &Expert) -> Vec<f64> {
        expert
            .weights
            .values()
            .flat_map(|tensors| tensors.values())
            .flat_map(flatten)
            .collect()
    }

    fn sparsify(&self, v: &mut [f64]) {
        let drop = (self.sparsity_threshold * v.len() as f64).floor() as usize;
        if drop == 0 {
            return;
        }
        let mut order: Vec<usize> = (0..v.len()).collect();
        order.sort_by(|a, b| v[*a].abs().total_cmp(&v[*b].abs()).then(a.cmp(b)));
        for i in &order[..drop] {
            v[*i] = 0.0;
        }
    }

    /// `U_k Σ_k` rows of the stacked, sparsified expert matrix
    pub fn compute(&self, experts: &[Expert]) -> Result<BTreeMap<String, DVector<f64>>> {
        self.validate()?;
        let first = experts
            .first()
            .ok_or_else(|| ExpertError::config("cannot embed zero experts"))?;
        let width = Self::flatten_expert(first).len();
        let mut rows = Vec::with_capacity(experts.len());
        for e in experts {
            let mut v = Self::flatten_expert(e);
            if v.len() != width {
                return Err(ExpertError::incompatible(
                    format!("parameter count of '{}'", e.name()),
                    width,
                    v.len(),
                ));
            }
            self.sparsify(&mut v);
            rows.push(v);
        }
        let x = DMatrix::from_fn(rows.len(), width, |r, c| rows[r][c]);
        let svd = x.svd(true, false);
        let u = svd
            .u
            .ok_or_else(|| ExpertError::state("SVD did not produce left singular vectors"))?;
        let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
        order.sort_by(|a, b| svd.singular_values[*b].total_cmp(&svd.singular_values[*a]));
        let k = self.n_components.min(order.len());
        debug!("SVD over {}x{} expert matrix, keeping {} components", rows.len(), width, k);

        let mut out = BTreeMap::new();
        for (i, e) in experts.iter().enumerate() {
            let emb = DVector::from_fn(k, |j, _| u[(i, order[j])] * svd.singular_values[order[j]]);
            out.insert(e.name().to_string(), emb);
        }
        Ok(out)
    }
}

impl LibraryTransform for SvdEmbedding {
    type Output = BTreeMap<String, DVector<f64>>;

    fn name(&self) -> &'static str {
        "svd_embedding"
    }

    /// Cached embeddings are reused when every visible expert has one
    fn transform(&self, library: &ExpertLibrary, force: bool) -> Result<Self::Output> {
        let data_id = self.data_id();
        let names = library.list();
        if !force {
            let cached = library.get_auxiliary(EMBEDDINGS_KIND, None, &data_id)?;
            if !names.is_empty() && names.iter().all(|n| cached.contains_key(n)) {
                let mut out = BTreeMap::new();
                for name in &names {
                    let v: Vec<f64> = serde_json::from_value(cached[name].clone())?;
                    out.insert(name.clone(), DVector::from_vec(v));
                }
                debug!("Using cached embeddings '{}' for {} experts", data_id, out.len());
                return Ok(out);
            }
        }

        let experts = load_experts(library, Some(&names))?;
        let embeddings = self.compute(&experts)?;
        for (name, emb) in &embeddings {
            let payload = serde_json::to_value(emb.as_slice())?;
            library.add_auxiliary(EMBEDDINGS_KIND, name, &data_id, payload, true)?;
        }
        info!("Computed SVD embeddings '{}' for {} experts", data_id, embeddings.len());
        Ok(embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transforms::testing::{library_with, lora_expert};

    fn experts() -> Vec<Expert> {
        vec![
            lora_expert("a", |l, r, c| (l + r * 2 + c) as f64),
            lora_expert("b", |l, r, c| (l + r * 2 + c) as f64 * 2.0),
            lora_expert("c", |l, r, c| if (l + r + c) % 2 == 0 { 1.0 } else { -1.0 }),
        ]
    }

    #[test]
    fn test_embedding_shape_and_similarity() {
        let emb = SvdEmbedding::new(2, 0.0).compute(&experts()).unwrap();
        assert_eq!(emb.len(), 3);
        assert!(emb.values().all(|v| v.len() == 2));
        // a and b are colinear, so their embeddings are too
        let cos = crate::tensor::cosine_similarity(&emb["a"], &emb["b"]);
        assert!((cos.abs() - 1.0).abs() < 1e-9);
        assert!((emb["b"].norm() - 2.0 * emb["a"].norm()).abs() < 1e-9);
    }

    #[test]
    fn test_components_capped_by_experts() {
        let emb = SvdEmbedding::new(50, 0.1).compute(&experts()).unwrap();
        assert!(emb.values().all(|v| v.len() == 3));
    }

    #[test]
    fn test_sparsify_zeroes_smallest_fraction() {
        let svd = SvdEmbedding::new(1, 0.5);
        let mut v = vec![0.3, -4.0, 0.1, 2.0];
        svd.sparsify(&mut v);
        assert_eq!(v, vec![0.0, -4.0, 0.0, 2.0]);
        assert!(SvdEmbedding::new(1, 1.0).compute(&experts()).is_err());
        assert!(SvdEmbedding::new(0, 0.1).compute(&experts()).is_err());
    }

    #[test]
    fn test_cached_then_forced() {
        let dir = tempfile::tempdir().unwrap();
        let lib = library_with(dir.path(), &experts());
        let svd = SvdEmbedding::new(2, 0.1);
        let first = svd.transform(&lib, false).unwrap();
        let cached = lib.get_auxiliary(EMBEDDINGS_KIND, None, &svd.data_id()).unwrap();
        assert_eq!(cached.len(), 3);

        let again = svd.transform(&lib, false).unwrap();
        for (name, v) in &first {
            assert!((v - &again[name]).norm() < 1e-12);
        }
        let forced = svd.transform(&lib, true).unwrap();
        assert_eq!(forced.len(), 3);
    }
}
