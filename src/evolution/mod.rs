//! Evolution — gradient-free search over linear-merge coefficients
//!
//! A (1+λ) evolution strategy perturbs the coefficients of a weighted linear
//! merge of library experts and keeps the best candidate under a black-box
//! loss plus an L1 penalty. An improvement over the starting expert is
//! committed back to the library under the next version name, with the
//! starting expert recorded as its parent.

use crate::error::{ExpertError, Result};
use crate::library::{Expert, ExpertLibrary};
use crate::transforms::WeightedLinearMerge;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `name` → `name_v2`; `name_vN` → `name_v{N+1}`, skipping taken names
pub fn next_version_name(name: &str, taken: &[String]) -> String {
    let (base, mut version) = split_version(name);
    loop {
        version += 1;
        let candidate = format!("{}_v{}", base, version);
        if !taken.contains(&candidate) {
            return candidate;
        }
    }
}

fn split_version(name: &str) -> (&str, u32) {
    match name.rsplit_once("_v") {
        Some((base, v)) if !base.is_empty() && !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit()) => {
            v.parse().map(|v| (base, v)).unwrap_or((name, 1))
        }
        _ => (name, 1),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionConfig {
    /// Generations of the (1+λ) strategy
    pub generations: usize,
    /// Offspring per generation (λ)
    pub offspring: usize,
    /// Initial perturbation half-width
    pub step_size: f64,
    /// Coefficients are clipped to `[-bound, bound]`
    pub bound: f64,
    /// Weight of the L1 penalty on the coefficients
    pub regularization: f64,
    pub seed: u64,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            generations: 20,
            offspring: 4,
            step_size: 0.3,
            bound: 1.5,
            regularization: 0.05,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EvolutionOutcome {
    /// Best expert found (the starting expert if nothing improved)
    pub expert: Expert,
    pub weights: BTreeMap<String, f64>,
    /// Penalized loss of `expert`
    pub loss: f64,
    /// Penalized loss of the starting expert
    pub start_loss: f64,
    /// Library name the improvement was committed under
    pub committed_as: Option<String>,
}

impl EvolutionOutcome {
    pub fn improved(&self) -> bool {
        self.committed_as.is_some()
    }
}

pub struct Evolver<'a> {
    library: &'a ExpertLibrary,
    config: EvolutionConfig,
}

impl<'a> Evolver<'a> {
    pub fn new(library: &'a ExpertLibrary, config: EvolutionConfig) -> Self {
        Self { library, config }
    }

    fn penalized(&self, raw: f64, weights: &[f64]) -> f64 {
        raw + self.config.regularization * weights.iter().map(|w| w.abs()).sum::<f64>()
    }

    /// Search merges of `pool` (default: every visible expert) for a better
    /// replacement of `target` under `loss` (lower is better)
    pub fn evolve(
        &self,
        target: &str,
        pool: Option<&[String]>,
        mut loss: impl FnMut(&Expert) -> Result<f64>,
    ) -> Result<EvolutionOutcome> {
        if self.config.offspring == 0 || self.config.step_size <= 0.0 || self.config.bound <= 0.0 {
            return Err(ExpertError::config("offspring, step_size and bound must be > 0"));
        }
        let mut names: Vec<String> = match pool {
            Some(pool) => pool.to_vec(),
            None => self.library.list(),
        };
        if !names.iter().any(|n| n == target) {
            names.insert(0, target.to_string());
        }
        let experts: Vec<Expert> = names.iter().map(|n| self.library.get(n)).collect::<Result<_>>()?;
        let start = experts
            .iter()
            .find(|e| e.name() == target)
            .cloned()
            .ok_or_else(|| ExpertError::not_found(format!("expert '{}'", target)))?;

        let merge_with = |weights: &[f64]| -> Result<Expert> {
            let map: BTreeMap<String, f64> = names.iter().cloned().zip(weights.iter().cloned()).collect();
            WeightedLinearMerge::new(target).with_weights(map).merge(&experts)
        };

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut best_w: Vec<f64> = names.iter().map(|n| if n == target { 1.0 } else { 0.0 }).collect();
        let start_loss = self.penalized(loss(&start)?, &best_w);
        let mut best_loss = start_loss;
        let mut step = self.config.step_size;
        info!(
            "Evolving '{}' over {} experts: start loss {:.6}",
            target,
            names.len(),
            start_loss
        );

        for generation in 0..self.config.generations {
            let mut improved = false;
            for _ in 0..self.config.offspring {
                let child: Vec<f64> = best_w
                    .iter()
                    .map(|w| (w + rng.gen_range(-step..=step)).clamp(-self.config.bound, self.config.bound))
                    .collect();
                let candidate = merge_with(&child)?;
                let child_loss = self.penalized(loss(&candidate)?, &child);
                if child_loss < best_loss {
                    best_loss = child_loss;
                    best_w = child;
                    improved = true;
                }
            }
            step = if improved { step * 1.2 } else { step * 0.85 };
            debug!("Generation {}: best loss {:.6}, step {:.4}", generation + 1, best_loss, step);
        }

        let weights: BTreeMap<String, f64> = names.iter().cloned().zip(best_w.iter().cloned()).collect();
        if best_loss >= start_loss {
            info!("No improvement found for '{}'", target);
            return Ok(EvolutionOutcome {
                expert: start,
                weights,
                loss: start_loss,
                start_loss,
                committed_as: None,
            });
        }

        let mut taken = self.library.list();
        taken.extend(self.library.deleted());
        let version = next_version_name(target, &taken);
        let mut evolved = merge_with(&best_w)?;
        evolved.info.expert_name = version.clone();
        evolved.info.parent_node = Some(target.to_string());
        evolved.info.expert_task_name = start.info.expert_task_name.clone();
        evolved.info.training_config = serde_json::json!({
            "evolution": {
                "weights": weights,
                "loss": best_loss,
                "start_loss": start_loss,
                "config": self.config,
            }
        });
        self.library.add_expert(&evolved, Some(&version), false)?;
        info!(
            "Committed '{}' (parent '{}'): loss {:.6} -> {:.6}",
            version, target, start_loss, best_loss
        );
        Ok(EvolutionOutcome {
            expert: evolved,
            weights,
            loss: best_loss,
            start_loss,
            committed_as: Some(version),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transforms::testing::{library_with, lora_expert};

    #[test]
    fn test_version_names() {
        assert_eq!(next_version_name("qa", &[]), "qa_v2");
        assert_eq!(next_version_name("qa_v2", &[]), "qa_v3");
        assert_eq!(next_version_name("qa", &["qa_v2".to_string()]), "qa_v3");
        assert_eq!(next_version_name("my_vocab", &[]), "my_vocab_v2");
        assert_eq!(next_version_name("x_v", &[]), "x_v_v2");
    }

    fn mean_a(e: &Expert) -> f64 {
        let a = &e.weights["blocks.0.attn.q_proj"]["lora_a"];
        a.mean()
    }

    #[test]
    fn test_improvement_committed_with_provenance() {
        let dir = tempfile::tempdir().unwrap();
        let mut experts = vec![
            lora_expert("a", |_, _, _| 1.0),
            lora_expert("b", |_, _, _| 2.0),
            lora_expert("c", |_, _, _| 3.0),
        ];
        experts[0].info.expert_task_name = Some("task_a".into());
        let lib = library_with(dir.path(), &experts);

        let config = EvolutionConfig {
            regularization: 0.0,
            ..EvolutionConfig::default()
        };
        let outcome = Evolver::new(&lib, config.clone())
            .evolve("a", None, |e| Ok((mean_a(e) - 2.5).abs()))
            .unwrap();
        assert!(outcome.improved());
        assert!(outcome.loss < outcome.start_loss);
        assert_eq!(outcome.committed_as.as_deref(), Some("a_v2"));

        let stored = lib.get("a_v2").unwrap();
        assert_eq!(stored.info.parent_node.as_deref(), Some("a"));
        assert_eq!(stored.info.expert_task_name.as_deref(), Some("task_a"));

        let again = Evolver::new(&lib, config)
            .evolve("a_v2", Some(&["a_v2".to_string(), "c".to_string()]), |e| {
                Ok((mean_a(e) - 2.8).abs())
            })
            .unwrap();
        assert_eq!(again.committed_as.as_deref(), Some("a_v3"));
        assert_eq!(lib.get("a_v3").unwrap().info.parent_node.as_deref(), Some("a_v2"));
    }

    #[test]
    fn test_no_improvement_commits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let lib = library_with(
            dir.path(),
            &[lora_expert("a", |_, _, _| 1.0), lora_expert("b", |_, _, _| 2.0)],
        );
        let outcome = Evolver::new(&lib, EvolutionConfig::default())
            .evolve("a", None, |_| Ok(1.0))
            .unwrap();
        assert!(!outcome.improved());
        assert_eq!(outcome.expert.name(), "a");
        assert_eq!(lib.len(), 2);
    }

    #[test]
    fn test_unknown_target() {
        let dir = tempfile::tempdir().unwrap();
        let lib = library_with(dir.path(), &[lora_expert("a", |_, _, _| 1.0)]);
        assert!(Evolver::new(&lib, EvolutionConfig::default())
            .evolve("zzz", None, |_| Ok(0.0))
            .is_err());
    }
}
