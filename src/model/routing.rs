//! Per-batch routing information
//!
//! A `RoutingInfo` is handed to exactly one forward call by reference and
//! dropped afterwards; nothing about it outlives the batch.

use crate::error::{ExpertError, Result};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Contextual routing data for one batch. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingInfo {
    /// One task identifier per example
    pub task_names: Option<Vec<String>>,
    /// Soft task assignment per example (examples × tasks)
    pub task_distribution: Option<DMatrix<f64>>,
    /// Validity mask per example and position
    pub attention_mask: Option<Vec<Vec<bool>>>,
    /// Stable example identifiers
    pub example_ids: Option<Vec<String>>,
}

impl RoutingInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task_names<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        Self {
            task_names: Some(names.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn task_distribution(mut self, dist: DMatrix<f64>) -> Self {
        self.task_distribution = Some(dist);
        self
    }

    pub fn attention_mask(mut self, mask: Vec<Vec<bool>>) -> Self {
        self.attention_mask = Some(mask);
        self
    }

    pub fn example_ids<S: Into<String>>(mut self, ids: impl IntoIterator<Item = S>) -> Self {
        self.example_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Number of examples the info describes, if any field pins it down
    pub fn batch_size(&self) -> Option<usize> {
        self.task_names
            .as_ref()
            .map(Vec::len)
            .or_else(|| self.task_distribution.as_ref().map(|d| d.nrows()))
            .or_else(|| self.attention_mask.as_ref().map(Vec::len))
            .or_else(|| self.example_ids.as_ref().map(Vec::len))
    }

    /// How many consecutive input rows belong to one example.
    ///
    /// Inputs are laid out example-major (`batch × seq` rows). Without any
    /// batch information every row is its own example.
    pub fn rows_per_example(&self, rows: usize) -> Result<usize> {
        match self.batch_size() {
            None => Ok(1),
            Some(0) => Err(ExpertError::InvalidRouting("routing info describes an empty batch".into())),
            Some(bs) if rows % bs != 0 => Err(ExpertError::incompatible(
                "input rows (multiple of batch size)",
                format!("multiple of {}", bs),
                rows,
            )),
            Some(bs) => Ok(rows / bs),
        }
    }

    /// Example index owning input row `row`
    pub fn example_of_row(row: usize, rows_per_example: usize) -> usize {
        row / rows_per_example.max(1)
    }

    /// Whether input row `row` is a valid (unmasked) position
    pub fn is_valid_row(&self, row: usize, rows_per_example: usize) -> bool {
        match &self.attention_mask {
            None => true,
            Some(mask) => {
                let ex = Self::example_of_row(row, rows_per_example);
                let pos = row % rows_per_example.max(1);
                mask.get(ex).and_then(|m| m.get(pos)).copied().unwrap_or(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_per_example() {
        let info = RoutingInfo::with_task_names(["a", "b"]);
        assert_eq!(info.rows_per_example(6).unwrap(), 3);
        assert!(info.rows_per_example(5).is_err());
        assert_eq!(RoutingInfo::new().rows_per_example(5).unwrap(), 1);
    }

    #[test]
    fn test_mask_lookup() {
        let info = RoutingInfo::new().attention_mask(vec![vec![true, false], vec![true, true]]);
        assert!(info.is_valid_row(0, 2));
        assert!(!info.is_valid_row(1, 2));
        assert!(info.is_valid_row(3, 2));
    }
}
