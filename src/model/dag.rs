// src/model/dag.rs

//! In-memory dependency graph over concrete tasks.
//!
//! Intentionally lightweight: adjacency maps keyed by task id, with
//! declaration order retained for deterministic tie-breaking. Acyclicity is
//! enforced separately in `taskfile::validate`, which also produces the
//! deterministic Kahn order used by the scheduler as a fallback tiebreaker.

use std::collections::{BTreeSet, HashMap};

use tracing::warn;

use crate::errors::RushtiError;
use crate::model::task::{Task, TaskId};

#[derive(Debug, Clone, Default)]
struct DagNode {
    preds: BTreeSet<TaskId>,
    succs: BTreeSet<TaskId>,
}

/// The execution DAG: vertices are concrete tasks, edges predecessor -> successor.
#[derive(Debug, Clone, Default)]
pub struct Dag {
    /// Tasks in declaration order.
    tasks: Vec<Task>,
    /// Task id -> index into `tasks`.
    index: HashMap<TaskId, usize>,
    nodes: HashMap<TaskId, DagNode>,
}

impl Dag {
    /// Build a DAG from concrete (already expanded) tasks.
    ///
    /// Rejects duplicate ids, self-dependencies and edges to unknown tasks;
    /// cycle detection happens in validation.
    pub fn from_tasks(tasks: Vec<Task>) -> Result<Self, RushtiError> {
        let mut dag = Dag::default();

        for (i, task) in tasks.iter().enumerate() {
            if dag.index.contains_key(&task.id) {
                return Err(RushtiError::DuplicateId(task.id.clone()));
            }
            dag.nodes.insert(task.id.clone(), DagNode::default());
            dag.index.insert(task.id.clone(), i);
        }

        for task in &tasks {
            for pred in &task.predecessors {
                if pred == &task.id {
                    return Err(RushtiError::MissingPredecessor {
                        task: task.id.clone(),
                        predecessor: pred.clone(),
                    });
                }
                if !dag.index.contains_key(pred) {
                    return Err(RushtiError::MissingPredecessor {
                        task: task.id.clone(),
                        predecessor: pred.clone(),
                    });
                }
                dag.add_edge(pred, &task.id);
            }
        }

        dag.tasks = tasks;
        Ok(dag)
    }

    fn add_edge(&mut self, pred: &str, succ: &str) {
        if let Some(node) = self.nodes.get_mut(succ) {
            node.preds.insert(pred.to_string());
        }
        if let Some(node) = self.nodes.get_mut(pred) {
            node.succs.insert(succ.to_string());
        }
    }

    /// Inject the implicit stage edges: every task of stage N becomes a
    /// predecessor of every task of stage N+1. Stages not listed in the
    /// order are left untouched.
    pub fn apply_stage_ordering(&mut self, stage_order: &[String]) {
        if stage_order.is_empty() {
            return;
        }

        let mut by_stage: HashMap<String, Vec<TaskId>> = HashMap::new();
        for task in &self.tasks {
            if let Some(stage) = task.stage.as_deref() {
                if stage_order.iter().any(|s| s == stage) {
                    by_stage
                        .entry(stage.to_string())
                        .or_default()
                        .push(task.id.clone());
                } else {
                    warn!(task = %task.id, stage = %stage, "stage not in stage_order; not gated");
                }
            }
        }

        for window in stage_order.windows(2) {
            let prev = by_stage.get(&window[0]).cloned().unwrap_or_default();
            let curr = by_stage.get(&window[1]).cloned().unwrap_or_default();
            for succ in &curr {
                for pred in &prev {
                    self.add_edge(pred, succ);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks in declaration order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    /// Declaration position of a task (used as the FIFO tiebreaker).
    pub fn declaration_index(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn predecessors_of(&self, id: &str) -> impl Iterator<Item = &str> {
        self.nodes
            .get(id)
            .into_iter()
            .flat_map(|n| n.preds.iter().map(|s| s.as_str()))
    }

    pub fn successors_of(&self, id: &str) -> impl Iterator<Item = &str> {
        self.nodes
            .get(id)
            .into_iter()
            .flat_map(|n| n.succs.iter().map(|s| s.as_str()))
    }

    pub fn predecessor_count(&self, id: &str) -> usize {
        self.nodes.get(id).map(|n| n.preds.len()).unwrap_or(0)
    }

    /// Distinct instances referenced by the DAG, in first-seen order.
    pub fn instances(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for task in &self.tasks {
            if seen.insert(task.instance.clone()) {
                out.push(task.instance.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, preds: &[&str]) -> Task {
        let mut t = Task::new(id, "prod", "load");
        t.predecessors = preds.iter().map(|s| s.to_string()).collect();
        t
    }

    fn staged(id: &str, stage: &str) -> Task {
        let mut t = Task::new(id, "prod", "load");
        t.stage = Some(stage.to_string());
        t
    }

    #[test]
    fn builds_adjacency_both_ways() {
        let dag = Dag::from_tasks(vec![task("a", &[]), task("b", &["a"]), task("c", &["a", "b"])])
            .unwrap();

        assert_eq!(dag.predecessor_count("a"), 0);
        assert_eq!(dag.predecessor_count("c"), 2);
        let succs: Vec<&str> = dag.successors_of("a").collect();
        assert_eq!(succs, vec!["b", "c"]);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let err = Dag::from_tasks(vec![task("a", &[]), task("a", &[])]).unwrap_err();
        assert!(matches!(err, RushtiError::DuplicateId(id) if id == "a"));
    }

    #[test]
    fn rejects_unknown_predecessor() {
        let err = Dag::from_tasks(vec![task("a", &["ghost"])]).unwrap_err();
        assert!(matches!(err, RushtiError::MissingPredecessor { .. }));
    }

    #[test]
    fn rejects_self_dependency() {
        let err = Dag::from_tasks(vec![task("a", &["a"])]).unwrap_err();
        assert!(matches!(err, RushtiError::MissingPredecessor { .. }));
    }

    #[test]
    fn stage_ordering_adds_cross_stage_edges() {
        let mut dag = Dag::from_tasks(vec![
            staged("e1", "extract"),
            staged("e2", "extract"),
            staged("l1", "load"),
        ])
        .unwrap();
        dag.apply_stage_ordering(&["extract".into(), "load".into()]);

        let preds: Vec<&str> = dag.predecessors_of("l1").collect();
        assert_eq!(preds, vec!["e1", "e2"]);
        assert_eq!(dag.predecessor_count("e1"), 0);
    }
}
