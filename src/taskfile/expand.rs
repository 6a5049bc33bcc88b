// src/taskfile/expand.rs

//! Parametric template expansion.
//!
//! A parameter whose key ends with `*` and whose value is wrapped in
//! `*{…}` is an expansion directive: the enclosed expression is evaluated
//! on the task's instance and the template is replaced by one concrete task
//! per member tuple of the cross product of all directives.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{debug, warn};

use crate::errors::RushtiError;
use crate::remote::{ClientPool, RemoteClient};
use crate::taskfile::json::{TaskDef, Taskfile};

/// One expansion directive on a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    /// Position of the parameter inside the task's parameter list.
    pub index: usize,
    /// Parameter key with the trailing `*` removed.
    pub key: String,
    /// The member-set expression inside the `*{…}` markers.
    pub expression: String,
}

/// Extract the expansion directives of a task, in declaration order.
pub fn directives_of(def: &TaskDef) -> Vec<Directive> {
    let mut out = Vec::new();
    for (index, (key, value)) in def.parameters.iter().enumerate() {
        if !key.ends_with('*') {
            continue;
        }
        if let Some(expression) = value.strip_prefix("*{").and_then(|v| v.strip_suffix('}')) {
            out.push(Directive {
                index,
                key: key.trim_end_matches('*').to_string(),
                expression: expression.trim().to_string(),
            });
        }
    }
    out
}

/// Whether any task in the file carries an expansion directive.
pub fn needs_expansion(taskfile: &Taskfile) -> bool {
    taskfile.tasks.iter().any(|t| !directives_of(t).is_empty())
}

/// Expand every template in the file.
///
/// Member sets are fetched once per distinct `(instance, expression)` pair.
/// Each produced task gets id `<template_id>_<joined_member_names>`; tuples
/// are emitted in lexicographic order so expansion is deterministic.
/// References to a template id in other tasks' predecessors are rewritten
/// to the full set of expanded children.
pub async fn expand_taskfile(
    taskfile: &Taskfile,
    pool: &ClientPool,
) -> Result<Taskfile, RushtiError> {
    let mut member_cache: HashMap<(String, String), Vec<String>> = HashMap::new();

    // Fetch phase: one remote call per distinct (instance, expression).
    for def in &taskfile.tasks {
        for directive in directives_of(def) {
            let cache_key = (def.instance.clone(), directive.expression.clone());
            if member_cache.contains_key(&cache_key) {
                continue;
            }

            let client = pool.client_for(&def.instance).ok_or_else(|| {
                RushtiError::Expansion {
                    instance: def.instance.clone(),
                    expression: directive.expression.clone(),
                    message: "instance has no registered client".to_string(),
                }
            })?;

            let mut members = client
                .expand_members(&directive.expression)
                .await
                .map_err(|e| RushtiError::Expansion {
                    instance: def.instance.clone(),
                    expression: directive.expression.clone(),
                    message: e.to_string(),
                })?;
            members.sort();
            debug!(
                instance = %def.instance,
                expression = %directive.expression,
                members = members.len(),
                "fetched member set"
            );
            member_cache.insert(cache_key, members);
        }
    }

    // Expansion phase.
    let mut expanded_tasks: Vec<TaskDef> = Vec::new();
    let mut children: HashMap<String, Vec<String>> = HashMap::new();

    for def in &taskfile.tasks {
        let directives = directives_of(def);
        if directives.is_empty() {
            expanded_tasks.push(def.clone());
            continue;
        }

        let member_sets: Vec<&Vec<String>> = directives
            .iter()
            .map(|d| &member_cache[&(def.instance.clone(), d.expression.clone())])
            .collect();

        if member_sets.iter().any(|m| m.is_empty()) {
            warn!(task = %def.id, "expansion produced zero members; dropping template");
            children.insert(def.id.clone(), Vec::new());
            continue;
        }

        let mut child_ids = Vec::new();
        for tuple in cross_product(&member_sets) {
            let mut child = def.clone();
            child.id = format!("{}_{}", def.id, tuple.join("_"));
            for (directive, member) in directives.iter().zip(&tuple) {
                child.parameters.0[directive.index] =
                    (directive.key.clone(), member.to_string());
            }
            child_ids.push(child.id.clone());
            expanded_tasks.push(child);
        }

        children.insert(def.id.clone(), child_ids);
    }

    // Predecessor rewrite: template references fan out to all children.
    for def in &mut expanded_tasks {
        if def.predecessors.iter().any(|p| children.contains_key(p)) {
            let rewritten = def
                .predecessors
                .iter()
                .flat_map(|p| match children.get(p) {
                    Some(ids) => ids.clone(),
                    None => vec![p.clone()],
                })
                .collect();
            def.predecessors = rewritten;
        }
    }

    let mut out = taskfile.clone();
    out.tasks = expanded_tasks;
    out.metadata.expanded_from = Some(taskfile.workflow_name().to_string());
    out.metadata.expanded_at = Some(Utc::now().to_rfc3339());
    Ok(out)
}

/// Cross product preserving the order of each input list.
fn cross_product<'a>(sets: &[&'a Vec<String>]) -> Vec<Vec<&'a str>> {
    let mut tuples: Vec<Vec<&str>> = vec![Vec::new()];
    for set in sets {
        let mut next = Vec::with_capacity(tuples.len() * set.len());
        for tuple in &tuples {
            for member in set.iter() {
                let mut extended = tuple.clone();
                extended.push(member.as_str());
                next.push(extended);
            }
        }
        tuples = next;
    }
    tuples
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::sim::SimulatedServer;

    fn template(id: &str) -> TaskDef {
        let mut def = TaskDef::new(id, "prod", "load.region");
        def.parameters.push("pRegion*", "*{ regions }");
        def.parameters.push("pYear", "2024");
        def
    }

    #[test]
    fn recognises_directives() {
        let def = template("t");
        let directives = directives_of(&def);
        assert_eq!(directives.len(), 1);
        assert_eq!(directives[0].key, "pRegion");
        assert_eq!(directives[0].expression, "regions");
    }

    #[test]
    fn starred_key_without_markers_is_a_plain_parameter() {
        let mut def = TaskDef::new("t", "prod", "p");
        def.parameters.push("pOdd*", "literal");
        assert!(directives_of(&def).is_empty());
    }

    #[tokio::test]
    async fn expands_cross_product_deterministically() {
        let server = SimulatedServer::new();
        server.set_members("regions", &["EMEA", "APAC"]);
        server.set_members("years", &["2024", "2023"]);
        let mut pool = ClientPool::new();
        pool.register("prod", server.client(), 4);

        let mut def = template("load");
        def.parameters.push("pYearX*", "*{ years }");

        let mut tf = Taskfile::default();
        tf.tasks.push(def);

        let out = expand_taskfile(&tf, &pool).await.unwrap();
        let ids: Vec<&str> = out.tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "load_APAC_2023",
                "load_APAC_2024",
                "load_EMEA_2023",
                "load_EMEA_2024"
            ]
        );
        let first = &out.tasks[0];
        assert_eq!(first.parameters.get("pRegion"), Some("APAC"));
        assert_eq!(first.parameters.get("pYearX"), Some("2023"));
        assert_eq!(first.parameters.get("pYear"), Some("2024"));
    }

    #[tokio::test]
    async fn template_predecessors_fan_out() {
        let server = SimulatedServer::new();
        server.set_members("regions", &["A", "B"]);
        let mut pool = ClientPool::new();
        pool.register("prod", server.client(), 4);

        let mut tf = Taskfile::default();
        tf.tasks.push(template("load"));
        let mut dependent = TaskDef::new("report", "prod", "report");
        dependent.predecessors = vec!["load".to_string()];
        tf.tasks.push(dependent);

        let out = expand_taskfile(&tf, &pool).await.unwrap();
        let report = out.tasks.iter().find(|t| t.id == "report").unwrap();
        assert_eq!(report.predecessors, vec!["load_A", "load_B"]);
    }

    #[tokio::test]
    async fn zero_member_template_is_dropped() {
        let server = SimulatedServer::new();
        server.set_members("regions", &[]);
        let mut pool = ClientPool::new();
        pool.register("prod", server.client(), 4);

        let mut tf = Taskfile::default();
        tf.tasks.push(template("load"));
        let mut dependent = TaskDef::new("report", "prod", "report");
        dependent.predecessors = vec!["load".to_string()];
        tf.tasks.push(dependent);

        let out = expand_taskfile(&tf, &pool).await.unwrap();
        assert_eq!(out.tasks.len(), 1);
        assert!(out.tasks[0].predecessors.is_empty());
    }

    #[tokio::test]
    async fn failed_expansion_is_fatal() {
        let server = SimulatedServer::new();
        let mut pool = ClientPool::new();
        pool.register("prod", server.client(), 4);

        let mut tf = Taskfile::default();
        tf.tasks.push(template("load"));

        let err = expand_taskfile(&tf, &pool).await.unwrap_err();
        assert!(matches!(err, RushtiError::Expansion { .. }));
    }
}
