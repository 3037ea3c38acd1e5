//! The plan data model: a mission is decomposed into a DAG of `TodoItem`s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoItem {
    pub position: usize,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<usize>,
    #[serde(default = "default_status")]
    pub status: TaskStatus,
    #[serde(default)]
    pub chosen_tool: Option<String>,
    #[serde(default)]
    pub tool_input: Option<serde_json::Value>,
    #[serde(default)]
    pub execution_result: Option<serde_json::Value>,
    #[serde(default)]
    pub attempts: u32,
}

fn default_status() -> TaskStatus {
    TaskStatus::Pending
}

impl TodoItem {
    /// A task is eligible once every dependency has reached a terminal
    /// success-or-skip state. Failed dependencies never make a task eligible.
    pub fn is_eligible(&self, items: &[TodoItem]) -> bool {
        self.status == TaskStatus::Pending
            && self.dependencies.iter().all(|dep| {
                items
                    .iter()
                    .find(|i| i.position == *dep)
                    .map(|i| matches!(i.status, TaskStatus::Completed | TaskStatus::Skipped))
                    .unwrap_or(false)
            })
    }

    pub fn blocked_by_failure(&self, items: &[TodoItem]) -> bool {
        self.dependencies.iter().any(|dep| {
            items
                .iter()
                .find(|i| i.position == *dep)
                .map(|i| i.status == TaskStatus::Failed)
                .unwrap_or(false)
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoList {
    pub id: String,
    pub mission: String,
    pub items: Vec<TodoItem>,
    #[serde(default)]
    pub open_questions: Vec<String>,
    #[serde(default)]
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TodoList {
    pub fn new(mission: impl Into<String>, items: Vec<TodoItem>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            mission: mission.into(),
            items,
            open_questions: Vec::new(),
            notes: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Re-density positions to `[0..N)` in order of first occurrence and
    /// force every item's status to `Pending`. Called once, right after the
    /// planner parses the LLM's raw output.
    ///
    /// The LLM's own `position` values may be sparse, out of order, or
    /// duplicated; dependencies are declared against those raw values, so
    /// they are remapped through the same old→new table used to reassign
    /// positions. A dependency whose raw value never appeared as an item's
    /// own position is dropped rather than left dangling — it becomes a
    /// validation violation (out-of-range) instead of a silent no-op.
    pub fn normalize(&mut self) {
        use std::collections::HashMap;

        let old_to_new: HashMap<usize, usize> = self
            .items
            .iter()
            .enumerate()
            .map(|(new_pos, item)| (item.position, new_pos))
            .collect();

        for item in &mut self.items {
            item.dependencies = item
                .dependencies
                .iter()
                .filter_map(|old_dep| old_to_new.get(old_dep).copied())
                .collect();
        }

        for (i, item) in self.items.iter_mut().enumerate() {
            item.position = i;
            item.status = TaskStatus::Pending;
        }
    }

    /// Validate the dependency graph: no self-loops, no out-of-range
    /// references, no cycles. Returns every violation found, not just the
    /// first — mirrors the engine's general "collect violations" style.
    pub fn validate_dependencies(&self) -> Vec<String> {
        let mut violations = Vec::new();
        let n = self.items.len();

        for item in &self.items {
            for dep in &item.dependencies {
                if *dep == item.position {
                    violations.push(format!(
                        "task {} depends on itself",
                        item.position
                    ));
                } else if *dep >= n {
                    violations.push(format!(
                        "task {} depends on out-of-range position {}",
                        item.position, dep
                    ));
                }
            }
        }

        if violations.is_empty() {
            if let Some(cycle) = self.find_cycle() {
                violations.push(format!("dependency cycle: {cycle:?}"));
            }
        }

        violations
    }

    pub fn validate(&self) -> Result<()> {
        let violations = self.validate_dependencies();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(Error::PlanValidation(violations.join("; ")))
        }
    }

    /// DFS-based cycle detection. Returns the first cycle found as a list
    /// of positions, or `None` if the graph is acyclic.
    fn find_cycle(&self) -> Option<Vec<usize>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let n = self.items.len();
        let mut marks = vec![Mark::Unvisited; n];
        let mut stack = Vec::new();

        fn visit(
            pos: usize,
            items: &[TodoItem],
            marks: &mut [Mark],
            stack: &mut Vec<usize>,
        ) -> Option<Vec<usize>> {
            match marks[pos] {
                Mark::Done => return None,
                Mark::InProgress => {
                    let start = stack.iter().position(|&p| p == pos).unwrap_or(0);
                    return Some(stack[start..].to_vec());
                }
                Mark::Unvisited => {}
            }

            marks[pos] = Mark::InProgress;
            stack.push(pos);

            let item = items.iter().find(|i| i.position == pos);
            if let Some(item) = item {
                for &dep in &item.dependencies {
                    if dep < marks.len() {
                        if let Some(cycle) = visit(dep, items, marks, stack) {
                            return Some(cycle);
                        }
                    }
                }
            }

            stack.pop();
            marks[pos] = Mark::Done;
            None
        }

        for pos in 0..n {
            if marks[pos] == Mark::Unvisited {
                if let Some(cycle) = visit(pos, &self.items, &mut marks, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    pub fn is_terminal(&self) -> bool {
        self.items
            .iter()
            .all(|i| matches!(i.status, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped))
    }

    pub fn has_failed(&self) -> bool {
        self.items.iter().any(|i| i.status == TaskStatus::Failed)
    }

    /// The set of positions whose tasks are currently eligible to run,
    /// ordered ascending by position (tie-break rule from spec §4.6).
    pub fn eligible_positions(&self) -> Vec<usize> {
        let mut eligible: Vec<usize> = self
            .items
            .iter()
            .filter(|i| i.is_eligible(&self.items))
            .map(|i| i.position)
            .collect();
        eligible.sort_unstable();
        eligible
    }

    pub fn item_mut(&mut self, position: usize) -> Option<&mut TodoItem> {
        self.items.iter_mut().find(|i| i.position == position)
    }

    pub fn item(&self, position: usize) -> Option<&TodoItem> {
        self.items.iter().find(|i| i.position == position)
    }

    /// All distinct tool names referenced by the plan, used to detect
    /// `chosen_tool` values the registry doesn't recognize.
    pub fn referenced_tools(&self) -> HashSet<&str> {
        self.items
            .iter()
            .filter_map(|i| i.chosen_tool.as_deref())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(pos: usize, deps: Vec<usize>) -> TodoItem {
        TodoItem {
            position: pos,
            description: format!("task {pos}"),
            acceptance_criteria: vec!["done".into()],
            dependencies: deps,
            status: TaskStatus::Pending,
            chosen_tool: None,
            tool_input: None,
            execution_result: None,
            attempts: 0,
        }
    }

    #[test]
    fn no_violations_on_acyclic_dag() {
        let list = TodoList::new("m", vec![item(0, vec![]), item(1, vec![0])]);
        assert!(list.validate_dependencies().is_empty());
    }

    #[test]
    fn detects_self_loop() {
        let list = TodoList::new("m", vec![item(0, vec![0])]);
        let v = list.validate_dependencies();
        assert_eq!(v.len(), 1);
        assert!(v[0].contains("itself"));
    }

    #[test]
    fn detects_out_of_range() {
        let list = TodoList::new("m", vec![item(0, vec![5])]);
        let v = list.validate_dependencies();
        assert!(v[0].contains("out-of-range"));
    }

    #[test]
    fn detects_cycle() {
        let list = TodoList::new("m", vec![item(0, vec![1]), item(1, vec![0])]);
        let v = list.validate_dependencies();
        assert_eq!(v.len(), 1);
        assert!(v[0].contains("cycle"));
    }

    #[test]
    fn eligible_positions_respects_dependency_completion() {
        let mut list = TodoList::new("m", vec![item(0, vec![]), item(1, vec![0])]);
        assert_eq!(list.eligible_positions(), vec![0]);
        list.item_mut(0).unwrap().status = TaskStatus::Completed;
        assert_eq!(list.eligible_positions(), vec![1]);
    }

    #[test]
    fn blocked_by_failure_detects_failed_dependency() {
        let mut list = TodoList::new("m", vec![item(0, vec![]), item(1, vec![0])]);
        list.item_mut(0).unwrap().status = TaskStatus::Failed;
        assert!(list.item(1).unwrap().blocked_by_failure(&list.items));
        assert!(list.eligible_positions().is_empty());
    }

    #[test]
    fn normalize_remaps_dependencies_through_sparse_llm_positions() {
        let mut list = TodoList::new(
            "m",
            vec![item(5, vec![]), item(2, vec![5]), item(9, vec![2, 5])],
        );
        list.normalize();

        assert_eq!(list.items[0].position, 0);
        assert_eq!(list.items[1].position, 1);
        assert_eq!(list.items[2].position, 2);
        assert!(list.items[0].dependencies.is_empty());
        assert_eq!(list.items[1].dependencies, vec![0]);
        assert_eq!(list.items[2].dependencies, vec![1, 0]);
        assert!(list.validate_dependencies().is_empty());
    }

    #[test]
    fn is_terminal_true_when_all_tasks_resolved() {
        let mut list = TodoList::new("m", vec![item(0, vec![])]);
        assert!(!list.is_terminal());
        list.item_mut(0).unwrap().status = TaskStatus::Completed;
        assert!(list.is_terminal());
    }
}
