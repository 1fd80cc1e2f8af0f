use super::{Routing, RoutingWeights};
use crate::error::{ExpertError, Result};
use nalgebra::DMatrix;

/// Equal-weight mixture over every known expert
#[derive(Debug, Clone, Default)]
pub struct UniformSelector {
    pub experts: Vec<String>,
}

impl UniformSelector {
    pub fn new(experts: Vec<String>) -> Self {
        Self { experts }
    }

    pub fn add_expert(&mut self, name: &str) {
        if !self.experts.iter().any(|e| e == name) {
            self.experts.push(name.to_string());
        }
    }

    pub fn static_weights(&self) -> Result<Vec<f64>> {
        if self.experts.is_empty() {
            return Err(ExpertError::state("uniform selector has no experts"));
        }
        let n = self.experts.len();
        Ok(vec![1.0 / n as f64; n])
    }

    pub fn route(&self, rows: usize) -> Result<Routing> {
        let w = self.static_weights()?;
        Ok(Routing::new(
            self.experts.clone(),
            RoutingWeights::Soft(DMatrix::from_element(rows, w.len(), w[0])),
        ))
    }
}
