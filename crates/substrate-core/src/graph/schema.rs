//! The external task graph document shape, as deserialized from YAML or
//! JSON before validation.

use std::collections::HashMap;

use serde::Deserialize;

pub const SUPPORTED_VERSIONS: &[&str] = &["1", "1.0"];

#[derive(Debug, Clone, Deserialize)]
pub struct GraphDocument {
    pub version: String,
    pub session: SessionDoc,
    pub tasks: HashMap<String, TaskDoc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionDoc {
    pub name: String,
    pub budget_usd: Option<f64>,
    pub base_branch: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskDoc {
    pub name: String,
    pub description: Option<String>,
    pub prompt: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub agent: Option<String>,
    pub model: Option<String>,
    pub budget_usd: Option<f64>,
    pub max_retries: Option<i64>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// The known task type tags named in the data model. Not enforced strictly
/// (soft-validated only) so operators can introduce new type tags without a
/// schema migration.
pub const KNOWN_TASK_TYPES: &[&str] = &["coding", "testing", "debugging", "refactoring", "docs"];
