//! Offline backends.
//!
//! [`MockClient`] is the `mock` provider: deterministic answers keyed on the
//! prompt kind, so the CLI and server can run end-to-end without network or
//! credentials. [`ScriptedModel`] replays canned answers in order and records
//! every prompt it was sent; it drives session tests.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use super::{LanguageModel, ProviderError, ProviderKind};
use crate::prompt::{Prompt, PromptKind};

pub const MOCK_SPARQL: &str = "SELECT DISTINCT ?uri WHERE {\n  ?uri ?p ?o .\n}\nLIMIT 1";

#[derive(Debug, Clone, Default)]
pub struct MockClient;

impl MockClient {
    pub fn complete(&self, prompt: &Prompt) -> Result<String, ProviderError> {
        let answer = match prompt.kind {
            PromptKind::Planning => mock_plan(question_line(&prompt.user)),
            PromptKind::Review => "YES\nThe query matches the question.".to_string(),
            PromptKind::Generation | PromptKind::Correction => {
                format!("Here is the query:\n\n```sparql\n{MOCK_SPARQL}\n```")
            }
        };
        Ok(answer)
    }
}

fn question_line(user: &str) -> &str {
    user.lines()
        .find_map(|l| l.trim().strip_prefix("Question:"))
        .map(str::trim)
        .unwrap_or("")
}

/// Capitalised words after the first one become entities.
fn mock_plan(question: &str) -> String {
    let entities: Vec<_> = question
        .split_whitespace()
        .skip(1)
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| w.chars().next().is_some_and(char::is_uppercase))
        .map(|w| json!({"text": w, "uri": format!("http://dbpedia.org/resource/{w}")}))
        .collect();
    json!({
        "entities": entities,
        "relations": [],
        "chain_of_thought": [
            "Identify the resources named in the question.",
            "Pick the DBpedia property that links them to the answer.",
            "Project the answer variable.",
        ],
    })
    .to_string()
}

// ============================================================================
// Scripted model
// ============================================================================

/// Replays queued answers per prompt family.
///
/// Generation and correction prompts share one queue. An empty queue is a
/// provider failure, which makes over-calling visible in tests.
#[derive(Debug)]
pub struct ScriptedModel {
    provider: String,
    model: String,
    generations: Mutex<VecDeque<String>>,
    reviews: Mutex<VecDeque<String>>,
    plans: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<Prompt>>,
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self {
            provider: "scripted".to_string(),
            model: "scripted-1".to_string(),
            generations: Mutex::new(VecDeque::new()),
            reviews: Mutex::new(VecDeque::new()),
            plans: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_generations<I, S>(self, answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.generations
            .lock()
            .extend(answers.into_iter().map(Into::into));
        self
    }

    pub fn with_reviews<I, S>(self, answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reviews.lock().extend(answers.into_iter().map(Into::into));
        self
    }

    pub fn with_plans<I, S>(self, answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plans.lock().extend(answers.into_iter().map(Into::into));
        self
    }

    /// Every prompt received so far, in call order.
    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.lock().clone()
    }

    pub fn calls(&self, kind: PromptKind) -> usize {
        self.prompts.lock().iter().filter(|p| p.kind == kind).count()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn provider_name(&self) -> &str {
        &self.provider
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &Prompt) -> Result<String, ProviderError> {
        self.prompts.lock().push(prompt.clone());
        let queue = match prompt.kind {
            PromptKind::Generation | PromptKind::Correction => &self.generations,
            PromptKind::Review => &self.reviews,
            PromptKind::Planning => &self.plans,
        };
        let next = queue.lock().pop_front();
        next.ok_or_else(|| ProviderError::MalformedResponse {
            provider: ProviderKind::Mock,
            detail: format!("scripted model has no answer left for {:?}", prompt.kind),
        })
    }
}
