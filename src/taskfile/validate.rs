// src/taskfile/validate.rs

//! Structural and remote validation of a built DAG.

use std::collections::BTreeSet;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use tracing::warn;

use crate::errors::RushtiError;
use crate::model::task::TaskId;
use crate::model::Dag;
use crate::remote::{ClientPool, ProbeResult, RemoteClient};

/// Outcome of a validation pass.
#[derive(Debug, Default, Clone)]
pub struct Report {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl Report {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Enforce the task-level invariants the parser cannot: non-empty ids and
/// parameter keys, positive timeouts.
pub fn validate_structural(dag: &Dag) -> Report {
    let mut report = Report::default();

    for task in dag.tasks() {
        if task.id.is_empty() {
            report.errors.push("task with empty id".to_string());
        }
        if task.instance.is_empty() {
            report
                .errors
                .push(format!("task '{}': empty instance", task.id));
        }
        if task.process.is_empty() {
            report
                .errors
                .push(format!("task '{}': empty process", task.id));
        }
        for (key, _) in task.parameters.iter() {
            if key.is_empty() {
                report
                    .errors
                    .push(format!("task '{}': empty parameter key", task.id));
            }
        }
        if task.timeout_sec == Some(0) {
            report
                .errors
                .push(format!("task '{}': timeout must be positive", task.id));
        }
    }

    report
}

/// Topological pass over the DAG.
///
/// Fails with a cycle diagnostic, otherwise yields the deterministic
/// execution order the scheduler uses as a tiebreaker when no estimator
/// data exists. Nodes enter the graph in declaration order, so the result
/// is stable across runs.
pub fn topological_order(dag: &Dag) -> Result<Vec<TaskId>, RushtiError> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut indices = Vec::with_capacity(dag.len());

    for task in dag.tasks() {
        indices.push(graph.add_node(task.id.as_str()));
    }
    for (i, task) in dag.tasks().iter().enumerate() {
        for pred in dag.predecessors_of(&task.id) {
            if let Some(pos) = dag.declaration_index(pred) {
                graph.add_edge(indices[pos], indices[i], ());
            }
        }
    }

    match toposort(&graph, None) {
        Ok(order) => Ok(order.iter().map(|&ix| graph[ix].to_string()).collect()),
        Err(cycle) => Err(RushtiError::Cycle(graph[cycle.node_id()].to_string())),
    }
}

/// Probe each distinct `(instance, process)` pair against the remote.
///
/// Missing processes are errors; unreachable instances are warnings (the
/// run may still be attempted; the executor will surface the failure).
pub async fn validate_remote(dag: &Dag, pool: &ClientPool) -> Report {
    let mut report = Report::default();
    let mut unreachable: BTreeSet<String> = BTreeSet::new();

    let pairs: BTreeSet<(String, String)> = dag
        .tasks()
        .iter()
        .map(|t| (t.instance.clone(), t.process.clone()))
        .collect();

    for (instance, process) in pairs {
        if unreachable.contains(&instance) {
            continue;
        }

        let Some(client) = pool.client_for(&instance) else {
            report
                .warnings
                .push(format!("instance '{instance}' has no registered client"));
            unreachable.insert(instance);
            continue;
        };

        match client.probe_process(&process).await {
            Ok(ProbeResult::Exists) => {}
            Ok(ProbeResult::NotFound) => {
                report
                    .errors
                    .push(format!("process '{process}' not found on instance '{instance}'"));
            }
            Err(e) => {
                warn!(instance = %instance, error = %e, "instance unreachable during validation");
                report
                    .warnings
                    .push(format!("instance '{instance}' unreachable: {e}"));
                unreachable.insert(instance);
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Task;
    use crate::remote::sim::SimulatedServer;

    fn task(id: &str, preds: &[&str]) -> Task {
        let mut t = Task::new(id, "prod", format!("proc.{id}"));
        t.predecessors = preds.iter().map(|s| s.to_string()).collect();
        t
    }

    #[test]
    fn topological_order_is_declaration_stable() {
        let dag = Dag::from_tasks(vec![
            task("b", &[]),
            task("a", &[]),
            task("c", &["a", "b"]),
        ])
        .unwrap();
        let order = topological_order(&dag).unwrap();
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[test]
    fn cycle_is_detected() {
        // Bypass Dag::from_tasks ordering: a <-> b.
        let dag = Dag::from_tasks(vec![task("a", &["b"]), task("b", &["a"])]).unwrap();
        let err = topological_order(&dag).unwrap_err();
        assert!(matches!(err, RushtiError::Cycle(_)));
    }

    #[test]
    fn structural_flags_zero_timeout() {
        let mut t = task("a", &[]);
        t.timeout_sec = Some(0);
        let dag = Dag::from_tasks(vec![t]).unwrap();
        let report = validate_structural(&dag);
        assert!(!report.is_ok());
    }

    #[tokio::test]
    async fn remote_validation_probes_each_pair_once() {
        let server = SimulatedServer::new();
        server.missing_process("proc.b");
        let mut pool = ClientPool::new();
        pool.register("prod", server.client(), 2);

        let dag = Dag::from_tasks(vec![task("a", &[]), task("b", &[])]).unwrap();
        let report = validate_remote(&dag, &pool).await;
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("proc.b"));
    }
}
