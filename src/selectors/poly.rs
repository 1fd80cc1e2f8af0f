//! Poly — learned per-task logits over experts, one row per feature split

use super::{Routing, RoutingWeights, UniformSelector};
use crate::error::{ExpertError, Result};
use crate::model::RoutingInfo;
use crate::tensor::softmax;
use log::info;
use nalgebra::DMatrix;
use rand::Rng;

/// Half-width of the uniform logit initialisation
const LOGIT_INIT: f64 = 1e-3;

#[derive(Debug, Clone)]
pub struct PolySelector {
    pub experts: Vec<String>,
    /// Known tasks; empty means task-agnostic (a single shared row)
    pub tasks: Vec<String>,
    pub n_splits: usize,
    /// `logits[task]` is `n_splits × experts`
    pub logits: Vec<DMatrix<f64>>,
    pub entropy_weight: f64,
    pub(crate) last: Option<Routing>,
}

impl PolySelector {
    pub fn new<R: Rng + ?Sized>(
        experts: Vec<String>,
        tasks: Vec<String>,
        n_splits: usize,
        entropy_weight: f64,
        rng: &mut R,
    ) -> Self {
        let n_splits = n_splits.max(1);
        let rows = tasks.len().max(1);
        let logits = (0..rows)
            .map(|_| DMatrix::from_fn(n_splits, experts.len(), |_, _| rng.gen_range(-LOGIT_INIT..=LOGIT_INIT)))
            .collect();
        Self {
            experts,
            tasks,
            n_splits,
            logits,
            entropy_weight,
            last: None,
        }
    }

    pub fn is_task_agnostic(&self) -> bool {
        self.tasks.is_empty()
    }

    /// New experts start at logit 0, inside the init range
    pub fn add_expert(&mut self, name: &str) {
        if self.experts.iter().any(|e| e == name) {
            return;
        }
        self.experts.push(name.to_string());
        let n = self.experts.len();
        for l in self.logits.iter_mut() {
            *l = l.clone().resize_horizontally(n, 0.0);
        }
    }

    fn task_index(&self, task: &str) -> Result<usize> {
        self.tasks
            .iter()
            .position(|t| t == task)
            .ok_or_else(|| ExpertError::not_found(format!("task '{}' in poly selector", task)))
    }

    /// Softmax over experts of one task row and split
    fn task_probs(&self, task: usize, split: usize) -> Vec<f64> {
        let row: Vec<f64> = self.logits[task].row(split).iter().cloned().collect();
        softmax(&row)
    }

    /// Distribution for one split given a mixture over task rows
    fn mixed_probs(&self, task_mix: &[(usize, f64)], split: usize) -> Vec<f64> {
        let mut probs = vec![0.0; self.experts.len()];
        for (task, w) in task_mix {
            for (p, q) in probs.iter_mut().zip(self.task_probs(*task, split)) {
                *p += w * q;
            }
        }
        probs
    }

    /// Task-row mixture for example `ex`
    fn example_tasks(&self, info: &RoutingInfo, ex: usize) -> Result<Vec<(usize, f64)>> {
        if self.is_task_agnostic() {
            return Ok(vec![(0, 1.0)]);
        }
        if let Some(dist) = &info.task_distribution {
            if dist.ncols() != self.tasks.len() {
                return Err(ExpertError::incompatible("task distribution width", self.tasks.len(), dist.ncols()));
            }
            if ex >= dist.nrows() {
                return Err(ExpertError::InvalidRouting(format!("no task distribution for example {}", ex)));
            }
            let row: Vec<(usize, f64)> = dist.row(ex).iter().cloned().enumerate().collect();
            let total: f64 = row.iter().map(|(_, w)| *w).sum();
            if !total.is_finite() || total <= 0.0 || row.iter().any(|(_, w)| *w < 0.0) {
                return Err(ExpertError::InvalidRouting(format!(
                    "task distribution row {} is not a distribution",
                    ex
                )));
            }
            return Ok(row.into_iter().map(|(t, w)| (t, w / total)).collect());
        }
        match info.task_names.as_ref().and_then(|names| names.get(ex)) {
            Some(task) => Ok(vec![(self.task_index(task)?, 1.0)]),
            None => {
                let w = 1.0 / self.tasks.len() as f64;
                Ok((0..self.tasks.len()).map(|t| (t, w)).collect())
            }
        }
    }

    pub fn route(&mut self, rows: usize, info: &RoutingInfo, training: bool) -> Result<Routing> {
        if self.experts.is_empty() {
            return Err(ExpertError::state("poly selector has no experts"));
        }
        let rpe = info.rows_per_example(rows)?;
        let n = self.experts.len();
        let mut splits = vec![DMatrix::zeros(rows, n); self.n_splits];
        let mut current: Option<usize> = None;
        let mut probs: Vec<Vec<f64>> = Vec::new();
        for row in 0..rows {
            let ex = RoutingInfo::example_of_row(row, rpe);
            if current != Some(ex) {
                let mix = self.example_tasks(info, ex)?;
                probs = (0..self.n_splits).map(|q| self.mixed_probs(&mix, q)).collect();
                current = Some(ex);
            }
            for (q, p) in probs.iter().enumerate() {
                for (e, v) in p.iter().enumerate() {
                    splits[q][(row, e)] = *v;
                }
            }
        }
        let weights = if self.n_splits == 1 {
            RoutingWeights::Soft(splits.remove(0))
        } else {
            RoutingWeights::PerSplit(splits)
        };
        let routing = Routing::new(self.experts.clone(), weights);
        if training || self.entropy_weight > 0.0 {
            self.last = Some(routing.clone());
        }
        Ok(routing)
    }

    /// Softmax weights for `task` (mean over tasks when `None`), averaged over splits
    pub fn static_weights(&self, task: Option<&str>) -> Result<Vec<f64>> {
        if self.experts.is_empty() {
            return Err(ExpertError::state("poly selector has no experts"));
        }
        let mix: Vec<(usize, f64)> = match (task, self.is_task_agnostic()) {
            (_, true) => vec![(0, 1.0)],
            (Some(t), false) => vec![(self.task_index(t)?, 1.0)],
            (None, false) => {
                let w = 1.0 / self.tasks.len() as f64;
                (0..self.tasks.len()).map(|t| (t, w)).collect()
            }
        };
        let mut out = vec![0.0; self.experts.len()];
        for q in 0..self.n_splits {
            for (o, p) in out.iter_mut().zip(self.mixed_probs(&mix, q)) {
                *o += p / self.n_splits as f64;
            }
        }
        Ok(out)
    }

    /// Negative mean routing entropy scaled by `entropy_weight`
    pub fn auxiliary_loss(&self) -> Option<f64> {
        if self.entropy_weight == 0.0 {
            return None;
        }
        self.last
            .as_ref()
            .map(|r| -self.entropy_weight * r.mean_entropy())
    }

    /// Irreversibly drop the learned logits in favour of equal weights
    pub fn switch_to_average(self) -> UniformSelector {
        info!("Poly selector over {} experts switched to average routing", self.experts.len());
        UniformSelector::new(self.experts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn experts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("e{}", i)).collect()
    }

    #[test]
    fn test_logit_init_range() {
        let mut rng = StdRng::seed_from_u64(0);
        let s = PolySelector::new(experts(4), vec!["a".into(), "b".into()], 2, 0.0, &mut rng);
        assert_eq!(s.logits.len(), 2);
        assert_eq!(s.logits[0].shape(), (2, 4));
        assert!(s.logits.iter().flat_map(|l| l.iter()).all(|v| v.abs() <= LOGIT_INIT));
    }

    #[test]
    fn test_routing_sums_to_one() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut s = PolySelector::new(experts(3), vec![], 1, 0.0, &mut rng);
        s.logits[0] = DMatrix::from_row_slice(1, 3, &[2.0, -1.0, 0.5]);
        let r = s.route(5, &RoutingInfo::new(), false).unwrap();
        r.validate(5).unwrap();
        for row in r.dense().row_iter() {
            assert!((row.sum() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_per_task_rows_and_distribution() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut s = PolySelector::new(experts(2), vec!["a".into(), "b".into()], 1, 0.0, &mut rng);
        s.logits[0] = DMatrix::from_row_slice(1, 2, &[10.0, -10.0]);
        s.logits[1] = DMatrix::from_row_slice(1, 2, &[-10.0, 10.0]);

        let r = s.route(2, &RoutingInfo::with_task_names(["b", "a"]), false).unwrap();
        let d = r.dense();
        assert!(d[(0, 1)] > 0.99 && d[(1, 0)] > 0.99);

        let info = RoutingInfo::new().task_distribution(DMatrix::from_row_slice(1, 2, &[0.5, 0.5]));
        let r = s.route(1, &info, false).unwrap();
        let d = r.dense();
        assert!((d[(0, 0)] - 0.5).abs() < 1e-6);

        assert!(s.route(1, &RoutingInfo::with_task_names(["zzz"]), false).is_err());
    }

    #[test]
    fn test_per_split_output() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut s = PolySelector::new(experts(2), vec![], 3, 0.0, &mut rng);
        match s.route(2, &RoutingInfo::new(), true).unwrap().weights {
            RoutingWeights::PerSplit(ws) => assert_eq!(ws.len(), 3),
            other => panic!("expected per-split routing, got {:?}", other),
        }
    }

    #[test]
    fn test_entropy_aux_loss() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut s = PolySelector::new(experts(2), vec![], 1, 0.1, &mut rng);
        assert!(s.auxiliary_loss().is_none());
        s.route(1, &RoutingInfo::new(), true).unwrap();
        let loss = s.auxiliary_loss().unwrap();
        assert!((loss + 0.1 * 2f64.ln()).abs() < 1e-4);
    }

    #[test]
    fn test_switch_to_average() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut s = PolySelector::new(experts(2), vec![], 1, 0.0, &mut rng);
        s.logits[0] = DMatrix::from_row_slice(1, 2, &[5.0, 0.0]);
        let uniform = s.switch_to_average();
        assert_eq!(uniform.static_weights().unwrap(), vec![0.5, 0.5]);
    }

    #[test]
    fn test_added_expert_extends_logits() {
        let mut rng = StdRng::seed_from_u64(6);
        let mut s = PolySelector::new(experts(2), vec![], 2, 0.0, &mut rng);
        s.add_expert("new");
        assert_eq!(s.logits[0].shape(), (2, 3));
        assert_eq!(s.static_weights(None).unwrap().len(), 3);
    }
}
