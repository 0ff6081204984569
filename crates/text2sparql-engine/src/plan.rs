//! The planner's structured analysis of a question.
//!
//! A [`Plan`] exists in two renderings besides JSON: a bullet list embedded
//! into chain-of-thought prompts, and an editable text form that a user can
//! tweak before it is fed back into generation.

use serde::{Deserialize, Serialize};

/// Marker for an entity or relation the planner could not resolve to a URI.
pub const UNRESOLVED: &str = "(unresolved)";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanItem {
    pub text: String,
    #[serde(default)]
    pub uri: Option<String>,
}

impl PlanItem {
    pub fn new(text: impl Into<String>, uri: Option<&str>) -> Self {
        Self {
            text: text.into(),
            uri: uri.map(str::to_string),
        }
    }
}

/// All three fields are required when a plan is supplied as JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub entities: Vec<PlanItem>,
    pub relations: Vec<PlanItem>,
    pub chain_of_thought: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct PlanEditError {
    pub line: usize,
    pub message: String,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Entities,
    Relations,
    Reasoning,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relations.is_empty() && self.chain_of_thought.is_empty()
    }

    /// Bullet-list rendering used inside generation prompts.
    pub fn render_for_prompt(&self) -> String {
        let mut out = String::new();
        push_prompt_items(&mut out, "Entities", &self.entities);
        out.push('\n');
        push_prompt_items(&mut out, "Relations", &self.relations);
        out.push_str("\nReasoning steps:\n");
        if self.chain_of_thought.is_empty() {
            out.push_str("(none provided)\n");
        }
        for (i, step) in self.chain_of_thought.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, step));
        }
        out.trim_end().to_string()
    }

    /// Editable text form:
    ///
    /// ```text
    /// Entities:
    /// - Dune => http://dbpedia.org/resource/Dune_(novel)
    /// Relations:
    /// - written by => (unresolved)
    /// Reasoning:
    /// 1. Find the author of the novel.
    /// ```
    pub fn to_edit_text(&self) -> String {
        let mut out = String::from("Entities:\n");
        push_edit_items(&mut out, &self.entities);
        out.push_str("Relations:\n");
        push_edit_items(&mut out, &self.relations);
        out.push_str("Reasoning:\n");
        for (i, step) in self.chain_of_thought.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, step));
        }
        out
    }

    /// Parse the text produced by [`Plan::to_edit_text`], after user edits.
    pub fn from_edit_text(text: &str) -> Result<Plan, PlanEditError> {
        let mut plan = Plan::default();
        let mut section: Option<Section> = None;

        for (idx, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }
            let header = line.trim_end_matches(':').to_ascii_lowercase();
            if line.ends_with(':') {
                let next = match header.as_str() {
                    "entities" => Some(Section::Entities),
                    "relations" => Some(Section::Relations),
                    "reasoning" | "reasoning steps" | "chain of thought" => {
                        Some(Section::Reasoning)
                    }
                    _ => None,
                };
                if next.is_some() {
                    section = next;
                    continue;
                }
            }
            let err = |message: &str| PlanEditError {
                line: idx + 1,
                message: message.to_string(),
            };
            match section {
                None => {
                    return Err(err(
                        "expected a section header (Entities:, Relations:, Reasoning:)",
                    ))
                }
                Some(Section::Entities) => plan.entities.push(
                    parse_edit_item(line).ok_or_else(|| err("expected `- text => uri`"))?,
                ),
                Some(Section::Relations) => plan.relations.push(
                    parse_edit_item(line).ok_or_else(|| err("expected `- text => uri`"))?,
                ),
                Some(Section::Reasoning) => {
                    let step = strip_step_number(line);
                    if step.is_empty() {
                        return Err(err("empty reasoning step"));
                    }
                    plan.chain_of_thought.push(step.to_string());
                }
            }
        }
        Ok(plan)
    }
}

fn push_prompt_items(out: &mut String, title: &str, items: &[PlanItem]) {
    out.push_str(title);
    out.push_str(":\n");
    if items.is_empty() {
        out.push_str("(none detected)\n");
    }
    for item in items {
        match &item.uri {
            Some(uri) => out.push_str(&format!("- {} ({})\n", item.text, uri)),
            None => out.push_str(&format!("- {} {}\n", item.text, UNRESOLVED)),
        }
    }
}

fn push_edit_items(out: &mut String, items: &[PlanItem]) {
    for item in items {
        let uri = item.uri.as_deref().unwrap_or(UNRESOLVED);
        out.push_str(&format!("- {} => {}\n", item.text, uri));
    }
}

fn parse_edit_item(line: &str) -> Option<PlanItem> {
    let body = line.strip_prefix('-')?.trim();
    let (text, uri) = match body.rsplit_once("=>") {
        Some((text, uri)) => {
            let uri = uri.trim();
            let uri = (!uri.is_empty() && uri != UNRESOLVED).then(|| uri.to_string());
            (text.trim(), uri)
        }
        None => (body, None),
    };
    if text.is_empty() {
        return None;
    }
    Some(PlanItem {
        text: text.to_string(),
        uri,
    })
}

fn strip_step_number(line: &str) -> &str {
    if let Some(rest) = line.strip_prefix("- ") {
        return rest.trim();
    }
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        if let Some(rest) = line[digits..].strip_prefix(|c: char| c == '.' || c == ')') {
            return rest.trim();
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Plan {
        Plan {
            entities: vec![
                PlanItem::new("Dune", Some("http://dbpedia.org/resource/Dune_(novel)")),
                PlanItem::new("Frank Herbert", None),
            ],
            relations: vec![PlanItem::new("author", Some("dbo:author"))],
            chain_of_thought: vec!["Find the novel.".into(), "Read its author.".into()],
        }
    }

    #[test]
    fn edit_text_round_trips() {
        let plan = sample();
        let text = plan.to_edit_text();
        assert!(text.contains("- Frank Herbert => (unresolved)"));
        assert_eq!(Plan::from_edit_text(&text).unwrap(), plan);
    }

    #[test]
    fn empty_plan_round_trips() {
        let text = Plan::default().to_edit_text();
        assert_eq!(Plan::from_edit_text(&text).unwrap(), Plan::default());
    }

    #[test]
    fn edits_are_tolerant_of_spacing_and_numbering() {
        let text = "\n  entities:\n-   Paris=>dbr:Paris \n- France\nRelations:\nReasoning:\n- look up\n2) answer\n";
        let plan = Plan::from_edit_text(text).unwrap();
        assert_eq!(plan.entities[0], PlanItem::new("Paris", Some("dbr:Paris")));
        assert_eq!(plan.entities[1], PlanItem::new("France", None));
        assert_eq!(plan.chain_of_thought, vec!["look up", "answer"]);
    }

    #[test]
    fn lines_before_a_section_are_rejected() {
        let err = Plan::from_edit_text("- Paris => dbr:Paris").unwrap_err();
        assert_eq!(err.line, 1);
        let err = Plan::from_edit_text("Entities:\nParis").unwrap_err();
        assert_eq!(err.line, 2);
    }

    #[test]
    fn prompt_rendering_marks_missing_parts() {
        let rendered = Plan::default().render_for_prompt();
        assert!(rendered.contains("Entities:\n(none detected)"));
        assert!(rendered.contains("(none provided)"));
        let rendered = sample().render_for_prompt();
        assert!(rendered.contains("- Frank Herbert (unresolved)"));
        assert!(rendered.contains("2. Read its author."));
    }

    #[test]
    fn json_requires_every_field() {
        assert!(serde_json::from_str::<Plan>(r#"{"entities": [], "relations": []}"#).is_err());
        let p: Plan = serde_json::from_str(
            r#"{"entities": [{"text": "Paris"}], "relations": [], "chain_of_thought": []}"#,
        )
        .unwrap();
        assert_eq!(p.entities[0].uri, None);
    }
}
