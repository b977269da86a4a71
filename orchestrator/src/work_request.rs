//! Work request documents: loading and schema validation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use jsonschema::Draft;
use serde_json::Value;
use tracing::debug;

use crate::core::graph::Graph;
use crate::core::types::WorkRequest;

/// JSON Schema (Draft 2020-12) every work request must satisfy.
pub const WORK_REQUEST_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/work_request/v1.schema.json"
));

/// Read and parse a work request file.
pub fn load_work_request(path: &Path) -> Result<WorkRequest> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_work_request(&raw).with_context(|| format!("invalid work request {}", path.display()))
}

/// Parse a work request: schema conformance first, then typed deserialization.
pub fn parse_work_request(raw: &str) -> Result<WorkRequest> {
    let instance: Value = serde_json::from_str(raw).context("parse work request json")?;
    let schema: Value =
        serde_json::from_str(WORK_REQUEST_SCHEMA).context("parse work request schema")?;
    validate_schema(&instance, &schema)?;
    let request: WorkRequest =
        serde_json::from_value(instance).context("parse work request as v1 struct")?;
    debug!(id = %request.id, stories = request.stories.len(), "work request parsed");
    Ok(request)
}

/// Full validation used by `orchestrator validate`: schema plus dependency graph.
pub fn check_work_request(request: &WorkRequest) -> Result<Graph> {
    Graph::build(request.clone().into_tasks()).context("dependency graph rejected")
}

/// Validate JSON instance against a JSON Schema (Draft 2020-12).
fn validate_schema(instance: &Value, schema: &Value) -> Result<()> {
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(schema)
        .context("compile json schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::GraphError;
    use crate::core::types::{TaskKind, TaskState};

    const VALID: &str = r#"{
        "id": "wr-1",
        "title": "Parser",
        "stories": [
            {
                "id": "s1",
                "title": "Core",
                "tasks": [
                    {"id": "A", "description": "lexer", "kind": "feature"},
                    {"id": "B", "description": "parser", "kind": "feature", "prerequisites": ["A"],
                     "acceptance": ["parses nested lists"]}
                ]
            },
            {
                "id": "s2",
                "title": "Docs",
                "tasks": [
                    {"id": "C", "description": "readme", "kind": "docs", "prerequisites": ["A"]}
                ]
            }
        ]
    }"#;

    #[test]
    fn valid_document_parses_into_tasks() {
        let request = parse_work_request(VALID).expect("parse");
        let tasks = request.into_tasks();
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[1].prerequisites, vec!["A"]);
        assert_eq!(tasks[2].kind, TaskKind::Docs);
        assert_eq!(tasks[2].story.as_deref(), Some("s2"));
        assert!(tasks.iter().all(|t| t.state == TaskState::Pending));
    }

    #[test]
    fn unknown_kind_is_rejected_by_schema() {
        let raw = VALID.replace("\"docs\"", "\"chore\"");
        let err = parse_work_request(&raw).unwrap_err();
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[test]
    fn persisted_fields_are_not_accepted_as_input() {
        let raw = VALID.replace(
            "\"kind\": \"docs\"",
            "\"kind\": \"docs\", \"state\": \"done\"",
        );
        assert!(parse_work_request(&raw).is_err());
    }

    #[test]
    fn cyclic_request_fails_graph_check() {
        let raw = VALID.replace(
            "{\"id\": \"A\", \"description\": \"lexer\", \"kind\": \"feature\"}",
            "{\"id\": \"A\", \"description\": \"lexer\", \"kind\": \"feature\", \"prerequisites\": [\"B\"]}",
        );
        let request = parse_work_request(&raw).expect("schema accepts cycles");
        let err = check_work_request(&request).unwrap_err();
        let graph_err = err.downcast_ref::<GraphError>().expect("graph error");
        assert!(matches!(graph_err, GraphError::Cycle(_)));
    }
}
