use super::{Routing, RoutingWeights};
use crate::error::{ExpertError, Result};
use crate::model::RoutingInfo;
use std::collections::BTreeMap;

/// Hard routing keyed by each example's task name
#[derive(Debug, Clone, Default)]
pub struct TaskNameSelector {
    pub experts: Vec<String>,
    /// Task name → expert name
    pub task_to_expert: BTreeMap<String, String>,
    /// Expert used when a task name is missing or unknown
    pub default_expert: Option<String>,
}

impl TaskNameSelector {
    pub fn new(experts: Vec<String>, default_expert: Option<String>) -> Self {
        let task_to_expert = experts.iter().map(|e| (e.clone(), e.clone())).collect();
        Self {
            experts,
            task_to_expert,
            default_expert,
        }
    }

    /// Experts answer to their own name and to the task they were trained on
    pub fn add_expert(&mut self, name: &str, task: Option<&str>) {
        if !self.experts.iter().any(|e| e == name) {
            self.experts.push(name.to_string());
        }
        self.task_to_expert.insert(name.to_string(), name.to_string());
        if let Some(task) = task {
            self.task_to_expert.insert(task.to_string(), name.to_string());
        }
    }

    pub fn set_default(&mut self, name: Option<&str>) {
        self.default_expert = name.map(str::to_string);
    }

    fn index_of(&self, expert: &str) -> Result<usize> {
        self.experts
            .iter()
            .position(|e| e == expert)
            .ok_or_else(|| ExpertError::not_found(format!("expert '{}' in task-name selector", expert)))
    }

    fn resolve(&self, task: Option<&str>) -> Result<usize> {
        let mapped = task.and_then(|t| self.task_to_expert.get(t));
        match (mapped, &self.default_expert) {
            (Some(expert), _) => self.index_of(expert),
            (None, Some(default)) => self.index_of(default),
            (None, None) => Err(ExpertError::not_found(format!(
                "no expert for task '{}' and no default expert",
                task.unwrap_or("<none>")
            ))),
        }
    }

    pub fn route(&self, rows: usize, info: &RoutingInfo) -> Result<Routing> {
        let rpe = info.rows_per_example(rows)?;
        let mut per_example: BTreeMap<usize, usize> = BTreeMap::new();
        let mut indices = Vec::with_capacity(rows);
        for row in 0..rows {
            let ex = RoutingInfo::example_of_row(row, rpe);
            let idx = match per_example.get(&ex) {
                Some(i) => *i,
                None => {
                    let task = info
                        .task_names
                        .as_ref()
                        .and_then(|names| names.get(ex))
                        .map(String::as_str);
                    let i = self.resolve(task)?;
                    per_example.insert(ex, i);
                    i
                }
            };
            indices.push(idx);
        }
        Ok(Routing::new(self.experts.clone(), RoutingWeights::Hard(indices)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector() -> TaskNameSelector {
        let mut s = TaskNameSelector::new(vec![], None);
        s.add_expert("mod_a", Some("task_a"));
        s.add_expert("mod_b", Some("task_b"));
        s
    }

    #[test]
    fn test_routes_by_task() {
        let s = selector();
        let info = RoutingInfo::with_task_names(["task_b", "task_a"]);
        let r = s.route(4, &info).unwrap();
        assert_eq!(r.weights, RoutingWeights::Hard(vec![1, 1, 0, 0]));
    }

    #[test]
    fn test_unknown_task_without_default_fails() {
        let s = selector();
        let info = RoutingInfo::with_task_names(["task_c"]);
        assert!(matches!(s.route(1, &info), Err(ExpertError::NotFound(_))));
        assert!(s.route(1, &RoutingInfo::new()).is_err());
    }

    #[test]
    fn test_unknown_task_uses_default() {
        let mut s = selector();
        s.set_default(Some("mod_b"));
        let info = RoutingInfo::with_task_names(["task_c", "task_a"]);
        let r = s.route(2, &info).unwrap();
        assert_eq!(r.weights, RoutingWeights::Hard(vec![1, 0]));
        let r = s.route(3, &RoutingInfo::new()).unwrap();
        assert_eq!(r.weights, RoutingWeights::Hard(vec![1, 1, 1]));
    }
}
