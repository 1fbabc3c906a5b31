//! Parse a task graph document from a file path or an in-memory string plus
//! a format tag.

use std::path::Path;

use crate::error::GraphError;

use super::schema::GraphDocument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphFormat {
    Yaml,
    Json,
}

impl GraphFormat {
    pub fn from_extension(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Some(GraphFormat::Yaml),
            Some("json") => Some(GraphFormat::Json),
            _ => None,
        }
    }
}

/// Parse `source` (already-read file contents, or an inline string) as
/// `format`.
pub fn parse_str(source: &str, format: GraphFormat) -> Result<GraphDocument, GraphError> {
    match format {
        GraphFormat::Yaml => {
            serde_yaml::from_str(source).map_err(|e| GraphError::ParseError(e.to_string()))
        }
        GraphFormat::Json => {
            serde_json::from_str(source).map_err(|e| GraphError::ParseError(e.to_string()))
        }
    }
}

/// Read and parse a graph file, inferring format from its extension unless
/// `format` is given explicitly.
pub async fn parse_path(path: &Path, format: Option<GraphFormat>) -> Result<GraphDocument, GraphError> {
    let format = format
        .or_else(|| GraphFormat::from_extension(path))
        .ok_or_else(|| GraphError::ParseError(format!("cannot infer graph format from {}", path.display())))?;

    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| GraphError::ParseError(format!("failed to read {}: {e}", path.display())))?;

    parse_str(&contents, format)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_yaml_document() {
        let yaml = "\
version: \"1\"
session:
  name: demo
tasks:
  a:
    name: A
    prompt: do the thing
    type: coding
";
        let doc = parse_str(yaml, GraphFormat::Yaml).unwrap();
        assert_eq!(doc.version, "1");
        assert_eq!(doc.tasks.len(), 1);
    }

    #[test]
    fn parses_minimal_json_document() {
        let json = r#"{
            "version": "1",
            "session": { "name": "demo" },
            "tasks": { "a": { "name": "A", "prompt": "go", "type": "coding" } }
        }"#;
        let doc = parse_str(json, GraphFormat::Json).unwrap();
        assert_eq!(doc.tasks.len(), 1);
    }

    #[test]
    fn rejects_malformed_yaml() {
        assert!(parse_str("not: [valid", GraphFormat::Yaml).is_err());
    }

    #[test]
    fn infers_format_from_extension() {
        assert_eq!(GraphFormat::from_extension(Path::new("a.yaml")), Some(GraphFormat::Yaml));
        assert_eq!(GraphFormat::from_extension(Path::new("a.json")), Some(GraphFormat::Json));
        assert_eq!(GraphFormat::from_extension(Path::new("a.txt")), None);
    }
}
