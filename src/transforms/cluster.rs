//! MBC — mini-batch spherical k-means over SVD embeddings
//!
//! Embeddings are L2-normalized, so squared distance orders points exactly
//! like cosine distance. Results depend only on the embeddings and the seed.

use super::{LibraryTransform, SvdEmbedding};
use crate::error::{ExpertError, Result};
use crate::library::ExpertLibrary;
use crate::tensor::l2_normalize;
use log::{debug, info, warn};
use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MbcWithCosSim {
    pub k: usize,
    #[serde(default = "default_seed")]
    pub random_state: u64,
    #[serde(default = "default_batch")]
    pub batch_size: usize,
    #[serde(default = "default_iters")]
    pub max_iter: usize,
    #[serde(default)]
    pub embedding: SvdEmbedding,
}

fn default_seed() -> u64 {
    42
}

fn default_batch() -> usize {
    256
}

fn default_iters() -> usize {
    100
}

fn cosine_distance(a: &DVector<f64>, b: &DVector<f64>) -> f64 {
    1.0 - a.dot(b)
}

impl MbcWithCosSim {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            random_state: default_seed(),
            batch_size: default_batch(),
            max_iter: default_iters(),
            embedding: SvdEmbedding::default(),
        }
    }

    pub fn with_seed(mut self, random_state: u64) -> Self {
        self.random_state = random_state;
        self
    }

    pub fn with_embedding(mut self, embedding: SvdEmbedding) -> Self {
        self.embedding = embedding;
        self
    }

    fn nearest(centroids: &[DVector<f64>], p: &DVector<f64>) -> (usize, f64) {
        centroids
            .iter()
            .enumerate()
            .map(|(c, centroid)| (c, cosine_distance(centroid, p)))
            .fold((0, f64::INFINITY), |best, cur| if cur.1 < best.1 { cur } else { best })
    }

    /// k-means++ seeding on cosine distance
    fn init_centroids(&self, points: &[DVector<f64>], rng: &mut StdRng) -> Vec<DVector<f64>> {
        let mut centroids = vec![points[rng.gen_range(0..points.len())].clone()];
        while centroids.len() < self.k {
            let d2: Vec<f64> = points
                .iter()
                .map(|p| Self::nearest(&centroids, p).1.max(0.0).powi(2))
                .collect();
            let total: f64 = d2.iter().sum();
            let next = if total <= 0.0 {
                rng.gen_range(0..points.len())
            } else {
                let mut target = rng.gen_range(0.0..total);
                let mut pick = points.len() - 1;
                for (i, d) in d2.iter().enumerate() {
                    if target < *d {
                        pick = i;
                        break;
                    }
                    target -= d;
                }
                pick
            };
            centroids.push(points[next].clone());
        }
        centroids
    }

    fn assign(centroids: &[DVector<f64>], points: &[DVector<f64>]) -> Vec<usize> {
        points.iter().map(|p| Self::nearest(centroids, p).0).collect()
    }

    /// Partition named embeddings into at most `k` clusters
    pub fn cluster(&self, embeddings: &BTreeMap<String, DVector<f64>>) -> Result<BTreeMap<usize, Vec<String>>> {
        let n = embeddings.len();
        if self.k == 0 || self.k > n {
            return Err(ExpertError::config(format!(
                "cannot form {} clusters from {} experts",
                self.k, n
            )));
        }
        let names: Vec<&String> = embeddings.keys().collect();
        let points: Vec<DVector<f64>> = embeddings.values().map(l2_normalize).collect();
        let mut rng = StdRng::seed_from_u64(self.random_state);
        let mut centroids = self.init_centroids(&points, &mut rng);
        let mut counts = vec![0usize; self.k];
        let batch = self.batch_size.clamp(1, n);

        for iter in 0..self.max_iter {
            let indices: Vec<usize> = if batch == n {
                (0..n).collect()
            } else {
                sample(&mut rng, n, batch).into_vec()
            };
            let labels: Vec<usize> = indices.iter().map(|i| Self::nearest(&centroids, &points[*i]).0).collect();
            let mut shift = 0.0;
            for (i, c) in indices.iter().zip(&labels) {
                counts[*c] += 1;
                let eta = 1.0 / counts[*c] as f64;
                let updated = l2_normalize(&(&centroids[*c] * (1.0 - eta) + &points[*i] * eta));
                shift += (&updated - &centroids[*c]).norm();
                centroids[*c] = updated;
            }
            if shift < 1e-9 {
                debug!("MBC converged after {} iterations", iter + 1);
                break;
            }
        }

        let mut labels = Self::assign(&centroids, &points);
        for c in 0..self.k {
            if labels.contains(&c) {
                continue;
            }
            // Reseed with the point farthest from its centroid in a cluster that can spare it
            let mut sizes = vec![0usize; self.k];
            labels.iter().for_each(|l| sizes[*l] += 1);
            let farthest = (0..n)
                .filter(|i| sizes[labels[*i]] > 1)
                .map(|i| (i, cosine_distance(&centroids[labels[i]], &points[i])))
                .fold(None, |best: Option<(usize, f64)>, cur| match best {
                    Some(b) if b.1 >= cur.1 => Some(b),
                    _ => Some(cur),
                });
            if let Some((i, _)) = farthest {
                centroids[c] = points[i].clone();
                labels = Self::assign(&centroids, &points);
            }
        }

        let mut clusters: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for (i, label) in labels.iter().enumerate() {
            clusters.entry(*label).or_default().push(names[i].clone());
        }
        if clusters.len() < self.k {
            warn!("{} of {} clusters ended up empty and were omitted", self.k - clusters.len(), self.k);
        }
        Ok(clusters)
    }
}

impl LibraryTransform for MbcWithCosSim {
    type Output = BTreeMap<usize, Vec<String>>;

    fn name(&self) -> &'static str {
        "mbc_with_cos_sim"
    }

    fn transform(&self, library: &ExpertLibrary, force: bool) -> Result<Self::Output> {
        let embeddings = self.embedding.transform(library, force)?;
        let clusters = self.cluster(&embeddings)?;
        info!(
            "Clustered {} experts of '{}' into {} groups",
            embeddings.len(),
            library.id(),
            clusters.len()
        );
        Ok(clusters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transforms::testing::{library_with, lora_expert};

    fn embeddings() -> BTreeMap<String, DVector<f64>> {
        let mut m = BTreeMap::new();
        m.insert("x1".to_string(), DVector::from_vec(vec![1.0, 0.05, 0.0]));
        m.insert("x2".to_string(), DVector::from_vec(vec![2.0, 0.0, 0.1]));
        m.insert("y1".to_string(), DVector::from_vec(vec![0.0, 1.0, 0.05]));
        m.insert("y2".to_string(), DVector::from_vec(vec![0.1, 3.0, 0.0]));
        m.insert("z1".to_string(), DVector::from_vec(vec![0.0, 0.05, -1.0]));
        m
    }

    #[test]
    fn test_separable_groups() {
        let clusters = MbcWithCosSim::new(3).cluster(&embeddings()).unwrap();
        let mut groups: Vec<Vec<String>> = clusters.into_values().collect();
        groups.sort();
        assert_eq!(
            groups,
            vec![
                vec!["x1".to_string(), "x2".to_string()],
                vec!["y1".to_string(), "y2".to_string()],
                vec!["z1".to_string()],
            ]
        );
    }

    #[test]
    fn test_deterministic_per_seed() {
        let mbc = MbcWithCosSim::new(2).with_seed(7);
        let a = mbc.cluster(&embeddings()).unwrap();
        let b = mbc.cluster(&embeddings()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_every_expert_assigned_once() {
        let clusters = MbcWithCosSim::new(5).cluster(&embeddings()).unwrap();
        let total: usize = clusters.values().map(|v| v.len()).sum();
        assert_eq!(total, 5);
        assert!(clusters.values().all(|v| !v.is_empty()));
    }

    #[test]
    fn test_too_many_clusters_rejected() {
        assert!(matches!(
            MbcWithCosSim::new(6).cluster(&embeddings()),
            Err(ExpertError::Configuration(_))
        ));
        assert!(MbcWithCosSim::new(0).cluster(&embeddings()).is_err());
    }

    #[test]
    fn test_clusters_library_experts() {
        let dir = tempfile::tempdir().unwrap();
        let experts = vec![
            lora_expert("a", |l, r, c| (l + r + c) as f64 + 1.0),
            lora_expert("a2", |l, r, c| ((l + r + c) as f64 + 1.0) * 3.0),
            lora_expert("b", |l, r, c| if (l + r * c) % 2 == 0 { 1.0 } else { -2.0 }),
        ];
        let lib = library_with(dir.path(), &experts);
        let mbc = MbcWithCosSim::new(2).with_embedding(SvdEmbedding::new(3, 0.0));
        let clusters = mbc.transform(&lib, false).unwrap();
        let together = clusters
            .values()
            .any(|names| names.contains(&"a".to_string()) && names.contains(&"a2".to_string()));
        assert!(together);
        assert!(lib
            .get_auxiliary(super::super::EMBEDDINGS_KIND, None, &mbc.embedding.data_id())
            .unwrap()
            .contains_key("b"));
    }
}
