//! LLM self-review of a candidate query.
//!
//! The reviewer must open its answer with YES or NO. Anything else counts as
//! a rejection, so an unclear reviewer costs a correction cycle instead of
//! letting an unchecked query through.

use serde::{Deserialize, Serialize};

use crate::prompt::{Prompt, PromptKind, SPARQL_FENCE};
use crate::provider::{LanguageModel, ProviderError};

pub const REVIEWER_SYSTEM_PROMPT: &str = "\
You review SPARQL queries written for the DBpedia knowledge base.
Decide whether the query correctly and completely answers the question:
right resources, right properties, right answer form (ASK, COUNT or SELECT),
and valid syntax.

Start your answer with YES or NO on its own. After it, give a short
rationale; when the answer is NO, say precisely what must change.";

const MAX_ECHOED_VERDICT_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub accepted: bool,
    pub rationale: String,
}

pub fn build_review_prompt(question: &str, sparql: &str) -> Prompt {
    Prompt {
        kind: PromptKind::Review,
        system: REVIEWER_SYSTEM_PROMPT.to_string(),
        user: format!(
            "Question: {}\n\nCandidate query:\n{SPARQL_FENCE}\n{}\n```\n\nDoes this query answer the question? Answer YES or NO first.",
            question.trim(),
            sparql.trim()
        ),
    }
}

/// Ask `model` whether `sparql` answers `question`.
pub async fn review(
    question: &str,
    sparql: &str,
    model: &dyn LanguageModel,
) -> Result<ReviewVerdict, ProviderError> {
    let raw = model.complete(&build_review_prompt(question, sparql)).await?;
    let verdict = parse_verdict(&raw);
    tracing::debug!(accepted = verdict.accepted, "review verdict");
    Ok(verdict)
}

/// Read the verdict from the first word of the reviewer's answer.
pub fn parse_verdict(raw: &str) -> ReviewVerdict {
    let body = raw.trim_start_matches(|c: char| {
        c.is_whitespace() || matches!(c, '*' | '#' | '>' | '`' | '"' | '\'' | '_' | '[' | '(')
    });
    let token_end = body
        .find(|c: char| !c.is_alphabetic())
        .unwrap_or(body.len());
    let rest = rationale_text(&body[token_end..]);

    match body[..token_end].to_uppercase().as_str() {
        "YES" => ReviewVerdict {
            accepted: true,
            rationale: rest.unwrap_or_else(|| "reviewer accepted the query".to_string()),
        },
        "NO" => ReviewVerdict {
            accepted: false,
            rationale: rest
                .unwrap_or_else(|| "reviewer rejected the query without a rationale".to_string()),
        },
        _ => {
            let echoed: String = raw.trim().chars().take(MAX_ECHOED_VERDICT_CHARS).collect();
            ReviewVerdict {
                accepted: false,
                rationale: format!("unparseable reviewer verdict (expected YES or NO): {echoed}"),
            }
        }
    }
}

fn rationale_text(rest: &str) -> Option<String> {
    let text = rest
        .trim_start_matches(|c: char| {
            c.is_whitespace() || matches!(c, ':' | '-' | ',' | '.' | '*' | '!' | ')' | ']' | '—' | '–')
        })
        .trim();
    (!text.is_empty()).then(|| text.to_string())
}
