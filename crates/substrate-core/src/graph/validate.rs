//! Five-phase validation for a parsed [`GraphDocument`]. Halts on the first
//! phase that reports errors; validation is all-or-nothing.

use std::collections::{HashMap, HashSet};

use crate::error::GraphError;

use super::schema::{GraphDocument, KNOWN_TASK_TYPES, SUPPORTED_VERSIONS};

pub struct ValidationReport {
    pub warnings: Vec<String>,
}

/// Run all five phases. Returns the accumulated soft-check warnings on
/// success, or the first phase's errors (joined) on failure.
pub fn validate(doc: &GraphDocument, known_agents: &[String]) -> Result<ValidationReport, Vec<GraphError>> {
    let shape_errors = validate_shape(doc);
    if !shape_errors.is_empty() {
        return Err(shape_errors);
    }

    let version_errors = validate_version(doc);
    if !version_errors.is_empty() {
        return Err(version_errors);
    }

    let dependency_errors = validate_dependencies(doc);
    if !dependency_errors.is_empty() {
        return Err(dependency_errors);
    }

    let cycle_errors = validate_acyclic(doc);
    if !cycle_errors.is_empty() {
        return Err(cycle_errors);
    }

    let warnings = soft_checks(doc, known_agents);
    Ok(ValidationReport { warnings })
}

/// Phase 1: field presence, types (already enforced by serde at parse time),
/// enum membership, and non-emptiness of required strings.
fn validate_shape(doc: &GraphDocument) -> Vec<GraphError> {
    let mut errors = Vec::new();

    if doc.session.name.trim().is_empty() {
        errors.push(GraphError::EmptySessionName);
    }

    if doc.tasks.is_empty() {
        errors.push(GraphError::NoTasks);
    }

    for (id, task) in &doc.tasks {
        if task.prompt.trim().is_empty() {
            errors.push(GraphError::EmptyPrompt { task: id.clone() });
        }
        for dep in &task.depends_on {
            if dep == id {
                errors.push(GraphError::SelfDependency { task: id.clone() });
            }
        }
    }

    errors
}

/// Phase 2: the document's `version` must be one we know how to interpret.
fn validate_version(doc: &GraphDocument) -> Vec<GraphError> {
    if SUPPORTED_VERSIONS.contains(&doc.version.as_str()) {
        Vec::new()
    } else {
        vec![GraphError::UnsupportedVersion(doc.version.clone())]
    }
}

/// Phase 3: every `depends_on` entry must name a task that exists.
fn validate_dependencies(doc: &GraphDocument) -> Vec<GraphError> {
    let mut errors = Vec::new();
    for (id, task) in &doc.tasks {
        for dep in &task.depends_on {
            if !doc.tasks.contains_key(dep) {
                errors.push(GraphError::UnknownDependency {
                    referrer: id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    errors
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Phase 4: depth-first scan for cycles. On encountering a back edge (an
/// edge into a node currently on the recursion stack), report the cycle
/// path starting and ending at the same node.
fn validate_acyclic(doc: &GraphDocument) -> Vec<GraphError> {
    let mut color: HashMap<&str, Color> = doc.tasks.keys().map(|k| (k.as_str(), Color::White)).collect();
    let mut stack: Vec<&str> = Vec::new();

    fn visit<'a>(
        node: &'a str,
        doc: &'a GraphDocument,
        color: &mut HashMap<&'a str, Color>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        color.insert(node, Color::Gray);
        stack.push(node);

        if let Some(task) = doc.tasks.get(node) {
            for dep in &task.depends_on {
                match color.get(dep.as_str()).copied() {
                    Some(Color::Gray) => {
                        // Back edge: build the cycle path from the stack.
                        let start = stack.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                        let mut path: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                        path.push(dep.clone());
                        return Some(path);
                    }
                    Some(Color::Black) => continue,
                    _ => {
                        if let Some(cycle) = visit(dep.as_str(), doc, color, stack) {
                            return Some(cycle);
                        }
                    }
                }
            }
        }

        stack.pop();
        color.insert(node, Color::Black);
        None
    }

    let mut ids: Vec<&str> = doc.tasks.keys().map(|s| s.as_str()).collect();
    ids.sort_unstable();

    for id in ids {
        if color.get(id).copied() == Some(Color::White) {
            if let Some(cycle) = visit(id, doc, &mut color, &mut stack) {
                return vec![GraphError::CycleDetected(cycle.join(" -> "))];
            }
        }
    }

    Vec::new()
}

/// Phase 5: warnings only. Never halts validation.
fn soft_checks(doc: &GraphDocument, known_agents: &[String]) -> Vec<String> {
    let mut warnings = Vec::new();
    let known: HashSet<&str> = known_agents.iter().map(|s| s.as_str()).collect();

    for (id, task) in &doc.tasks {
        if let Some(agent) = &task.agent {
            if !known.is_empty() && !known.contains(agent.as_str()) {
                warnings.push(format!("task {id:?} references unknown agent {agent:?}"));
            }
        }
        if !KNOWN_TASK_TYPES.contains(&task.task_type.as_str()) {
            warnings.push(format!(
                "task {id:?} uses an unrecognised type {:?}; proceeding anyway",
                task.task_type
            ));
        }
        if task.budget_usd == Some(0.0) {
            warnings.push(format!("task {id:?} has a budget of 0; this is treated as unlimited"));
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn doc(tasks: HashMap<String, super::super::schema::TaskDoc>) -> GraphDocument {
        GraphDocument {
            version: "1".to_string(),
            session: super::super::schema::SessionDoc {
                name: "demo".to_string(),
                budget_usd: None,
                base_branch: None,
            },
            tasks,
        }
    }

    fn task(prompt: &str, depends_on: Vec<&str>) -> super::super::schema::TaskDoc {
        super::super::schema::TaskDoc {
            name: prompt.to_string(),
            description: None,
            prompt: prompt.to_string(),
            task_type: "coding".to_string(),
            agent: None,
            model: None,
            budget_usd: None,
            max_retries: None,
            depends_on: depends_on.into_iter().map(str::to_string).collect(),
        }
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut d = doc(HashMap::from([("a".to_string(), task("go", vec![]))]));
        d.version = "2".to_string();
        let err = validate(&d, &[]).unwrap_err();
        assert!(matches!(err[0], GraphError::UnsupportedVersion(_)));
    }

    #[test]
    fn rejects_empty_tasks() {
        let d = doc(HashMap::new());
        let err = validate(&d, &[]).unwrap_err();
        assert!(err.iter().any(|e| matches!(e, GraphError::NoTasks)));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let d = doc(HashMap::from([("a".to_string(), task("go", vec!["missing"]))]));
        let err = validate(&d, &[]).unwrap_err();
        assert!(matches!(
            &err[0],
            GraphError::UnknownDependency { referrer, dependency }
                if referrer == "a" && dependency == "missing"
        ));
    }

    #[test]
    fn detects_two_node_cycle() {
        let d = doc(HashMap::from([
            ("a".to_string(), task("go", vec!["b"])),
            ("b".to_string(), task("go", vec!["a"])),
        ]));
        let err = validate(&d, &[]).unwrap_err();
        assert!(matches!(&err[0], GraphError::CycleDetected(path) if path.contains('a') && path.contains('b')));
    }

    #[test]
    fn accepts_diamond_shape() {
        let d = doc(HashMap::from([
            ("a".to_string(), task("go", vec![])),
            ("b".to_string(), task("go", vec!["a"])),
            ("c".to_string(), task("go", vec!["a"])),
            ("d".to_string(), task("go", vec!["b", "c"])),
        ]));
        let report = validate(&d, &[]).unwrap();
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn warns_on_unknown_agent_but_does_not_fail() {
        let mut t = task("go", vec![]);
        t.agent = Some("ghost-agent".to_string());
        let d = doc(HashMap::from([("a".to_string(), t)]));
        let report = validate(&d, &["claude-code".to_string()]).unwrap();
        assert!(report.warnings.iter().any(|w| w.contains("ghost-agent")));
    }

    #[test]
    fn rejects_empty_prompt() {
        let d = doc(HashMap::from([("a".to_string(), task("", vec![]))]));
        let err = validate(&d, &[]).unwrap_err();
        assert!(matches!(&err[0], GraphError::EmptyPrompt { task } if task == "a"));
    }
}
