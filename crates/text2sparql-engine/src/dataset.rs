//! Benchmark question sets.
//!
//! Two JSON layouts are understood:
//!
//! * flattened QALD-9: `[{"id": .., "en_ques": "..", "sparql": ".."}]`
//! * official QALD: `{"questions": [{"id": .., "question": [{"language": "en",
//!   "string": ".."}], "query": {"sparql": ".."}}]}`

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetEntry {
    pub id: String,
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_sparql: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("failed to read dataset {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("dataset is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unrecognised dataset layout: {0}")]
    Layout(String),
}

pub fn load_dataset(path: &Path) -> Result<Vec<DatasetEntry>, DatasetError> {
    let text = std::fs::read_to_string(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let entries = parse_dataset(&text)?;
    tracing::info!(path = %path.display(), questions = entries.len(), "dataset loaded");
    Ok(entries)
}

/// Parse either layout. Entries without an English question are skipped.
pub fn parse_dataset(text: &str) -> Result<Vec<DatasetEntry>, DatasetError> {
    let value: Value = serde_json::from_str(text)?;
    let items = match &value {
        Value::Array(items) => items,
        Value::Object(obj) => match obj.get("questions") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(DatasetError::Layout(
                    "object without a `questions` array".to_string(),
                ))
            }
        },
        _ => return Err(DatasetError::Layout("expected an array or object".to_string())),
    };

    let mut entries = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        let id = item
            .get("id")
            .and_then(id_string)
            .unwrap_or_else(|| (idx + 1).to_string());
        match question_text(item) {
            Some(question) => entries.push(DatasetEntry {
                id,
                question,
                expected_sparql: expected_sparql(item),
            }),
            None => tracing::warn!(%id, "dataset entry has no English question; skipped"),
        }
    }
    Ok(entries)
}

fn id_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn question_text(item: &Value) -> Option<String> {
    let text = match item.get("question") {
        Some(Value::Array(variants)) => variants
            .iter()
            .find(|v| v.get("language").and_then(Value::as_str) == Some("en"))
            .and_then(|v| v.get("string"))
            .and_then(Value::as_str),
        Some(Value::String(s)) => Some(s.as_str()),
        _ => item.get("en_ques").and_then(Value::as_str),
    }?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn expected_sparql(item: &Value) -> Option<String> {
    let sparql = match item.get("query") {
        Some(q) => q.get("sparql").and_then(Value::as_str),
        None => item.get("sparql").and_then(Value::as_str),
    }?;
    let sparql = sparql.trim();
    (!sparql.is_empty()).then(|| sparql.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattened_layout() {
        let text = r#"[
            {"id": 1, "en_ques": " List all boardgames by GMT. ", "sparql": "SELECT ?uri WHERE { ?uri dbo:publisher dbr:GMT_Games }"},
            {"id": "q2", "en_ques": "Who wrote Dune?"},
            {"id": 3, "en_ques": ""}
        ]"#;
        let entries = parse_dataset(text).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "1");
        assert_eq!(entries[0].question, "List all boardgames by GMT.");
        assert!(entries[0].expected_sparql.is_some());
        assert_eq!(entries[1].id, "q2");
        assert_eq!(entries[1].expected_sparql, None);
    }

    #[test]
    fn official_layout() {
        let text = r#"{"dataset": {"id": "qald-9-test"}, "questions": [
            {"id": "99", "question": [
                {"language": "de", "string": "Wer schrieb Dune?"},
                {"language": "en", "string": "Who wrote Dune?"}
            ], "query": {"sparql": "SELECT ?a WHERE { dbr:Dune dbo:author ?a }"}}
        ]}"#;
        let entries = parse_dataset(text).unwrap();
        assert_eq!(entries[0].id, "99");
        assert_eq!(entries[0].question, "Who wrote Dune?");
    }

    #[test]
    fn bad_layouts() {
        assert!(matches!(parse_dataset("{\"items\": []}"), Err(DatasetError::Layout(_))));
        assert!(matches!(parse_dataset("42"), Err(DatasetError::Layout(_))));
        assert!(matches!(parse_dataset("[{"), Err(DatasetError::Json(_))));
    }
}
