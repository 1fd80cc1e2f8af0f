//! Skilled LoRA — `n_skills` sets of low-rank factors per feature split,
//! mixed per row by routing weights
//!
//! Input features are split into `n_splits` blocks of `in / n_splits`
//! (output likewise). For a row routed with skill weights `w[q][s]`, the
//! effective factors are `A = vstack_q(Σ_s w[q][s] A[q][s])` and
//! `B = hstack_q(Σ_s w[q][s] B[q][s])`.

use super::{take_tensor, unsupported, AdapterConfig, LayerTensors, StepCounter, LORA_A, LORA_B};
use crate::adapters::lora::check_dims;
use crate::error::{ExpertError, Result};
use crate::model::Layer;
use crate::selectors::RoutingWeights;
use crate::tensor::{kaiming_bound, uniform, WideTensor};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SkilledLoRA {
    pub config: AdapterConfig,
    pub n_splits: usize,
    pub n_skills: usize,
    pub in_features: usize,
    pub out_features: usize,
    /// `lora_a[split][skill]`: `(in / n_splits) × rank`
    pub lora_a: Vec<Vec<WideTensor>>,
    /// `lora_b[split][skill]`: `rank × (out / n_splits)`
    pub lora_b: Vec<Vec<WideTensor>>,
    pub counter: StepCounter,
    pub(crate) layer: Option<Arc<Layer>>,
}

fn tensor_name(base: &str, split: usize, skill: usize) -> String {
    format!("{}.{}.{}", base, split, skill)
}

impl SkilledLoRA {
    pub fn attach<R: Rng + ?Sized>(
        path: &str,
        layer: Arc<Layer>,
        config: &AdapterConfig,
        rng: &mut R,
    ) -> Result<Self> {
        let (in_features, out_features) = match layer.as_ref() {
            Layer::Linear(l) => (l.in_features(), l.out_features()),
            other => return Err(unsupported(path, other, "skilled_lora")),
        };
        check_divisible(path, in_features, out_features, config.n_splits)?;
        let (d_in, d_out) = (in_features / config.n_splits, out_features / config.n_splits);
        let bound = kaiming_bound(in_features);
        let random_b = config.warmup || config.init_b_random;

        let mut lora_a = Vec::with_capacity(config.n_splits);
        let mut lora_b = Vec::with_capacity(config.n_splits);
        for _ in 0..config.n_splits {
            let mut a_q = Vec::with_capacity(config.n_skills);
            let mut b_q = Vec::with_capacity(config.n_skills);
            for _ in 0..config.n_skills {
                a_q.push(uniform(d_in, config.rank, bound, rng));
                b_q.push(if random_b {
                    uniform(config.rank, d_out, bound, rng)
                } else {
                    WideTensor::zeros(config.rank, d_out)
                });
            }
            lora_a.push(a_q);
            lora_b.push(b_q);
        }

        Ok(Self {
            config: config.clone(),
            n_splits: config.n_splits,
            n_skills: config.n_skills,
            in_features,
            out_features,
            lora_a,
            lora_b,
            counter: StepCounter::new(config.warmup),
            layer: Some(layer),
        })
    }

    pub fn from_weights(config: &AdapterConfig, tensors: &LayerTensors) -> Result<Self> {
        let mut lora_a = Vec::with_capacity(config.n_splits);
        let mut lora_b = Vec::with_capacity(config.n_splits);
        for q in 0..config.n_splits {
            let mut a_q = Vec::with_capacity(config.n_skills);
            let mut b_q = Vec::with_capacity(config.n_skills);
            for s in 0..config.n_skills {
                a_q.push(take_tensor(tensors, &tensor_name(LORA_A, q, s))?.clone());
                b_q.push(take_tensor(tensors, &tensor_name(LORA_B, q, s))?.clone());
            }
            lora_a.push(a_q);
            lora_b.push(b_q);
        }
        let d_in = lora_a[0][0].nrows();
        let d_out = lora_b[0][0].ncols();
        let consistent = lora_a.iter().flatten().all(|a| a.shape() == (d_in, config.rank))
            && lora_b.iter().flatten().all(|b| b.shape() == (config.rank, d_out));
        if !consistent {
            return Err(ExpertError::incompatible(
                "skilled LoRA factor shapes",
                format!("{}x{} / {}x{}", d_in, config.rank, config.rank, d_out),
                "mixed shapes",
            ));
        }
        Ok(Self {
            config: config.clone(),
            n_splits: config.n_splits,
            n_skills: config.n_skills,
            in_features: d_in * config.n_splits,
            out_features: d_out * config.n_splits,
            lora_a,
            lora_b,
            counter: StepCounter::new(config.warmup),
            layer: None,
        })
    }

    pub fn bind(&mut self, path: &str, layer: Arc<Layer>) -> Result<()> {
        match layer.as_ref() {
            Layer::Linear(l) => check_dims(path, l, self.in_features, self.out_features)?,
            other => return Err(unsupported(path, other, "skilled_lora")),
        }
        self.layer = Some(layer);
        Ok(())
    }

    pub fn scaling(&self) -> f64 {
        self.config.scaling()
    }

    /// Per-split skill weights for one row
    fn row_weights(&self, routing: &RoutingWeights, row: usize) -> Result<Vec<Vec<f64>>> {
        match routing {
            RoutingWeights::Hard(indices) => {
                let idx = *indices
                    .get(row)
                    .ok_or_else(|| ExpertError::InvalidRouting(format!("no routing for row {}", row)))?;
                if idx >= self.n_skills {
                    return Err(ExpertError::InvalidRouting(format!(
                        "skill index {} out of range for {} skills",
                        idx, self.n_skills
                    )));
                }
                let mut one_hot = vec![0.0; self.n_skills];
                one_hot[idx] = 1.0;
                Ok(vec![one_hot; self.n_splits])
            }
            RoutingWeights::Soft(w) => {
                if w.ncols() != self.n_skills {
                    return Err(ExpertError::incompatible("routing width", self.n_skills, w.ncols()));
                }
                let r: Vec<f64> = w.row(row).iter().cloned().collect();
                Ok(vec![r; self.n_splits])
            }
            RoutingWeights::PerSplit(splits) => {
                if splits.len() != self.n_splits {
                    return Err(ExpertError::incompatible("routing splits", self.n_splits, splits.len()));
                }
                splits
                    .iter()
                    .map(|w| {
                        if w.ncols() != self.n_skills {
                            Err(ExpertError::incompatible("routing width", self.n_skills, w.ncols()))
                        } else {
                            Ok(w.row(row).iter().cloned().collect())
                        }
                    })
                    .collect()
            }
        }
    }

    /// Effective `(A, B)` for one row's split/skill weights
    fn mixed_factors(&self, weights: &[Vec<f64>]) -> (WideTensor, WideTensor) {
        let rank = self.config.rank;
        let d_in = self.in_features / self.n_splits;
        let d_out = self.out_features / self.n_splits;
        let mut a = WideTensor::zeros(self.in_features, rank);
        let mut b = WideTensor::zeros(rank, self.out_features);
        for (q, w_q) in weights.iter().enumerate() {
            let mut a_block = a.view_mut((q * d_in, 0), (d_in, rank));
            for (s, w) in w_q.iter().enumerate() {
                if *w != 0.0 {
                    a_block += &self.lora_a[q][s] * *w;
                }
            }
            let mut b_block = b.view_mut((0, q * d_out), (rank, d_out));
            for (s, w) in w_q.iter().enumerate() {
                if *w != 0.0 {
                    b_block += &self.lora_b[q][s] * *w;
                }
            }
        }
        (a, b)
    }

    pub fn correction(&self, x: &WideTensor, routing: &RoutingWeights) -> Result<WideTensor> {
        let scale = self.scaling() * self.counter.gate();
        let mut out = WideTensor::zeros(x.nrows(), self.out_features);
        // Rows routed identically share their mixed factors
        let mut cache: HashMap<Vec<u64>, (WideTensor, WideTensor)> = HashMap::new();
        for row in 0..x.nrows() {
            let weights = self.row_weights(routing, row)?;
            let key: Vec<u64> = weights.iter().flatten().map(|w| w.to_bits()).collect();
            let (a, b) = cache
                .entry(key)
                .or_insert_with(|| self.mixed_factors(&weights));
            let y = x.row(row) * &*a * &*b * scale;
            out.row_mut(row).copy_from(&y);
        }
        Ok(out)
    }

    pub fn weights(&self) -> LayerTensors {
        let mut t = LayerTensors::new();
        for q in 0..self.n_splits {
            for s in 0..self.n_skills {
                t.insert(tensor_name(LORA_A, q, s), self.lora_a[q][s].clone());
                t.insert(tensor_name(LORA_B, q, s), self.lora_b[q][s].clone());
            }
        }
        t
    }
}

fn check_divisible(path: &str, in_features: usize, out_features: usize, n_splits: usize) -> Result<()> {
    if in_features % n_splits != 0 || out_features % n_splits != 0 {
        return Err(ExpertError::incompatible(
            format!("feature split of '{}'", path),
            format!("multiples of n_splits={}", n_splits),
            format!("{}x{}", in_features, out_features),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Linear;
    use nalgebra::DMatrix;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn skilled(n_skills: usize, n_splits: usize) -> SkilledLoRA {
        let mut rng = StdRng::seed_from_u64(5);
        let layer = Arc::new(Layer::Linear(Linear::random(8, 4, &mut rng)));
        let cfg = AdapterConfig::skilled_lora("fc", n_skills, n_splits)
            .with_rank(2)
            .with_random_b(true);
        SkilledLoRA::attach("fc", layer, &cfg, &mut rng).unwrap()
    }

    fn x(rows: usize) -> WideTensor {
        DMatrix::from_fn(rows, 8, |r, c| ((r + 1) * (c + 2)) as f64 * 0.05)
    }

    #[test]
    fn test_hard_routing_selects_single_skill() {
        let adapter = skilled(3, 2);
        let input = x(2);
        let out = adapter
            .correction(&input, &RoutingWeights::Hard(vec![2, 0]))
            .unwrap();
        for (row, skill) in [(0usize, 2usize), (1, 0)] {
            let one_hot: Vec<Vec<f64>> = (0..2)
                .map(|_| (0..3).map(|s| if s == skill { 1.0 } else { 0.0 }).collect())
                .collect();
            let (a, b) = adapter.mixed_factors(&one_hot);
            let expected = input.row(row) * a * b * adapter.scaling();
            assert!((out.row(row) - expected).norm() < 1e-12);
        }
    }

    #[test]
    fn test_soft_routing_equals_mixture_of_factors() {
        let adapter = skilled(2, 1);
        let input = x(1);
        let w = DMatrix::from_row_slice(1, 2, &[0.25, 0.75]);
        let out = adapter.correction(&input, &RoutingWeights::Soft(w)).unwrap();
        let a = &adapter.lora_a[0][0] * 0.25 + &adapter.lora_a[0][1] * 0.75;
        let b = &adapter.lora_b[0][0] * 0.25 + &adapter.lora_b[0][1] * 0.75;
        let expected = &input * a * b * adapter.scaling();
        assert!((out - expected).norm() < 1e-12);
    }

    #[test]
    fn test_rows_route_independently() {
        let adapter = skilled(2, 2);
        let input = DMatrix::from_fn(2, 8, |_, c| c as f64 * 0.1);
        let out = adapter
            .correction(&input, &RoutingWeights::Hard(vec![0, 1]))
            .unwrap();
        assert!((out.row(0) - out.row(1)).norm() > 1e-9);
    }

    #[test]
    fn test_out_of_range_skill_is_an_error() {
        let adapter = skilled(2, 1);
        let err = adapter
            .correction(&x(1), &RoutingWeights::Hard(vec![5]))
            .unwrap_err();
        assert!(matches!(err, ExpertError::InvalidRouting(_)));
    }

    #[test]
    fn test_weights_round_trip() {
        let adapter = skilled(2, 2);
        let back = SkilledLoRA::from_weights(&adapter.config, &adapter.weights()).unwrap();
        assert_eq!(back.in_features, 8);
        assert_eq!(back.out_features, 4);
        assert_eq!(back.lora_b[1][1], adapter.lora_b[1][1]);
    }
}
