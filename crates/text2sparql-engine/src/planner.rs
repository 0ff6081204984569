//! Question analysis before chain-of-thought generation.
//!
//! The planner asks the model for a JSON object with `entities`, `relations`
//! and `chain_of_thought`. Models wrap JSON in prose and fences, rename keys
//! and mix strings with objects, so parsing is lenient about shape but strict
//! about content: an answer that is not JSON, or JSON with none of the
//! expected keys, is a [`PlanParseError`] and never an empty plan.

use serde_json::{Map, Value};

use crate::plan::{Plan, PlanItem};
use crate::prompt::{Prompt, PromptKind};
use crate::provider::{LanguageModel, ProviderError};

pub const PLANNER_SYSTEM_PROMPT: &str = "\
You are a planning assistant for DBpedia SPARQL generation.
Analyse the user's question before any query is written.

Respond with ONLY a JSON object with exactly these keys:
- \"entities\": list of {\"text\": <surface form>, \"uri\": <DBpedia resource URI or null>}
- \"relations\": list of {\"text\": <surface form>, \"uri\": <DBpedia property URI or null>}
- \"chain_of_thought\": list of short reasoning steps, in order, leading to the query

Use null for a URI you are not confident about. Do not write the SPARQL query.";

const STEP_KEYS: &[&str] = &["chain_of_thought", "plan", "steps", "reasoning"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanParseError {
    #[error("planner output contains no JSON object")]
    NoJsonObject,
    #[error("planner output is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("planner JSON has none of the keys entities, relations, chain_of_thought")]
    MissingFields,
    #[error("planner field `{0}` is not a list")]
    FieldNotList(&'static str),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PlanError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("{error}")]
    Parse {
        #[source]
        error: PlanParseError,
        raw: String,
    },
}

pub fn build_planning_prompt(question: &str) -> Prompt {
    Prompt {
        kind: PromptKind::Planning,
        system: PLANNER_SYSTEM_PROMPT.to_string(),
        user: format!(
            "Question: {}\n\nReturn the JSON object only.",
            question.trim()
        ),
    }
}

/// Ask `model` for a plan of `question`.
pub async fn plan_question(question: &str, model: &dyn LanguageModel) -> Result<Plan, PlanError> {
    let prompt = build_planning_prompt(question);
    let raw = model.complete(&prompt).await?;
    match parse_plan(&raw) {
        Ok(plan) => {
            tracing::debug!(
                entities = plan.entities.len(),
                relations = plan.relations.len(),
                steps = plan.chain_of_thought.len(),
                "plan parsed"
            );
            Ok(plan)
        }
        Err(error) => {
            tracing::warn!(%error, "planner answer rejected");
            Err(PlanError::Parse { error, raw })
        }
    }
}

/// Parse a planner answer into a [`Plan`].
pub fn parse_plan(raw: &str) -> Result<Plan, PlanParseError> {
    let candidate = first_json_object(raw).ok_or(PlanParseError::NoJsonObject)?;
    let value: Value = serde_json::from_str(candidate)
        .map_err(|e| PlanParseError::InvalidJson(e.to_string()))?;
    let obj = value.as_object().ok_or(PlanParseError::NoJsonObject)?;

    let steps = STEP_KEYS.iter().find_map(|k| obj.get(*k));
    if obj.get("entities").is_none() && obj.get("relations").is_none() && steps.is_none() {
        return Err(PlanParseError::MissingFields);
    }

    Ok(Plan {
        entities: parse_items(obj, "entities")?,
        relations: parse_items(obj, "relations")?,
        chain_of_thought: parse_steps(steps)?,
    })
}

fn parse_items(obj: &Map<String, Value>, field: &'static str) -> Result<Vec<PlanItem>, PlanParseError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.iter().filter_map(plan_item).collect()),
        Some(_) => Err(PlanParseError::FieldNotList(field)),
    }
}

fn plan_item(value: &Value) -> Option<PlanItem> {
    match value {
        Value::String(s) => non_empty(s).map(|text| PlanItem { text, uri: None }),
        Value::Object(m) => {
            let text = ["text", "label", "name", "mention"]
                .iter()
                .find_map(|k| m.get(*k).and_then(Value::as_str).and_then(non_empty));
            let uri = ["uri", "iri", "id", "url"]
                .iter()
                .find_map(|k| m.get(*k).and_then(Value::as_str).and_then(non_empty));
            match (text, uri) {
                (Some(text), uri) => Some(PlanItem { text, uri }),
                (None, Some(uri)) => Some(PlanItem {
                    text: uri.clone(),
                    uri: Some(uri),
                }),
                (None, None) => None,
            }
        }
        _ => None,
    }
}

fn parse_steps(value: Option<&Value>) -> Result<Vec<String>, PlanParseError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        // A single paragraph of reasoning is still one step.
        Some(Value::String(s)) => Ok(non_empty(s).into_iter().collect()),
        Some(Value::Array(items)) => Ok(items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => non_empty(s),
                Value::Object(m) => ["step", "text", "description"]
                    .iter()
                    .find_map(|k| m.get(*k).and_then(Value::as_str).and_then(non_empty)),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect()),
        Some(_) => Err(PlanParseError::FieldNotList("chain_of_thought")),
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

/// First balanced `{...}` in `text`, skipping braces inside JSON strings.
///
/// Falls back to the span up to the last `}` when the object never closes
/// cleanly, so serde can report what is wrong with it.
pub fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escape {
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    let end = start + offset + ch.len_utf8();
                    return Some(&text[start..end]);
                }
            }
            _ => {}
        }
    }

    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ScriptedModel;

    #[test]
    fn parses_fenced_json_with_prose() {
        let raw = "Here is my analysis:\n```json\n{\"entities\": [{\"text\": \"Berlin\", \"uri\": \"http://dbpedia.org/resource/Berlin\"}], \"relations\": [{\"text\": \"mayor\", \"uri\": null}], \"chain_of_thought\": [\"Find Berlin\", \"Read dbo:leader\"]}\n```\nDone.";
        let plan = parse_plan(raw).unwrap();
        assert_eq!(
            plan.entities,
            vec![PlanItem::new("Berlin", Some("http://dbpedia.org/resource/Berlin"))]
        );
        assert_eq!(plan.relations, vec![PlanItem::new("mayor", None)]);
        assert_eq!(plan.chain_of_thought.len(), 2);
    }

    #[test]
    fn accepts_aliases_and_string_items() {
        let plan = parse_plan(r#"{"entities": ["Paris", "  "], "plan": ["look up", {"step": "answer"}]}"#).unwrap();
        assert_eq!(plan.entities, vec![PlanItem::new("Paris", None)]);
        assert!(plan.relations.is_empty());
        assert_eq!(plan.chain_of_thought, vec!["look up", "answer"]);
    }

    #[test]
    fn empty_uri_means_unresolved() {
        let plan = parse_plan(r#"{"entities": [{"text": "Dune", "uri": ""}], "relations": [], "chain_of_thought": []}"#).unwrap();
        assert_eq!(plan.entities[0].uri, None);
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_the_scan() {
        let raw = r#"{"entities": [], "relations": [], "chain_of_thought": ["use FILTER { } carefully \"quoted\""]} trailing }"#;
        let plan = parse_plan(raw).unwrap();
        assert_eq!(plan.chain_of_thought.len(), 1);
    }

    #[test]
    fn malformed_answers_are_errors() {
        assert_eq!(parse_plan("I think the entity is Berlin."), Err(PlanParseError::NoJsonObject));
        assert!(matches!(parse_plan("{entities: [}"), Err(PlanParseError::InvalidJson(_))));
        assert_eq!(parse_plan(r#"{"answer": 42}"#), Err(PlanParseError::MissingFields));
        assert_eq!(
            parse_plan(r#"{"entities": "Berlin"}"#),
            Err(PlanParseError::FieldNotList("entities"))
        );
    }

    #[tokio::test]
    async fn plan_question_surfaces_parse_failures_with_raw_text() {
        let model = ScriptedModel::new().with_plans(["no json here"]);
        let err = plan_question("Who is the mayor of Berlin?", &model).await.unwrap_err();
        match err {
            PlanError::Parse { error, raw } => {
                assert_eq!(error, PlanParseError::NoJsonObject);
                assert_eq!(raw, "no json here");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let prompts = model.prompts();
        assert_eq!(prompts[0].kind, PromptKind::Planning);
        assert!(prompts[0].user.contains("Question: Who is the mayor of Berlin?"));
    }
}
