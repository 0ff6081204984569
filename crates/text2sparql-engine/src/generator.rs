//! The self-validating generation loop.
//!
//! ```text
//! Init ──► Generating ──► Reviewing ──► Accepted
//!              ▲   │           │
//!              │   │ (no query)│ NO
//!              │   ▼           ▼
//!              └── Correcting ◄┘ ──► Exhausted (budget spent)
//! ```
//!
//! A session makes at most `max_corrections + 1` generation calls. With a
//! budget of zero the reviewer is never consulted: an extracted query is
//! returned unreviewed, and a failed extraction ends the session exhausted.
//!
//! Provider failures end the session immediately; they are never converted
//! into a rejected query.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::extract::extract;
use crate::plan::Plan;
use crate::planner::{self, PlanError, PlanParseError};
use crate::prompt::{self, Prompt, PromptError, Rejection, Technique};
use crate::provider::{LanguageModel, ProviderError};
use crate::reviewer::{self, ReviewVerdict};
use crate::trace::{Trace, TraceEntry, TraceEvent};

pub const DEFAULT_MAX_CORRECTION_CYCLES: u32 = 3;

/// Upper bound accepted for per-request budgets.
pub const MAX_CORRECTION_CYCLES_CAP: u32 = 10;

// ============================================================================
// Session types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Init,
    Generating,
    Reviewing,
    Correcting,
    Accepted,
    Exhausted,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Init, Generating)
                | (Generating, Reviewing)
                | (Generating, Correcting)
                | (Generating, Accepted)
                | (Generating, Exhausted)
                | (Reviewing, Accepted)
                | (Reviewing, Correcting)
                | (Reviewing, Exhausted)
                | (Correcting, Generating)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Accepted | SessionState::Exhausted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Accepted,
    Exhausted,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Accepted => f.write_str("accepted"),
            SessionStatus::Exhausted => f.write_str("exhausted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptKind {
    Initial,
    Correction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationAttempt {
    /// 1-based.
    pub index: usize,
    pub kind: AttemptKind,
    pub prompt: Prompt,
    pub raw_output: String,
    pub sparql: Option<String>,
    pub extraction_error: Option<String>,
    /// `None` when no query was extracted or review was skipped.
    pub verdict: Option<ReviewVerdict>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSession {
    pub id: Uuid,
    pub question: String,
    pub technique: Technique,
    pub provider: String,
    pub model: String,
    pub plan: Option<Plan>,
    pub attempts: Vec<GenerationAttempt>,
    pub status: SessionStatus,
    /// Accepted query, or the most recent extracted one when exhausted
    /// (empty if nothing was ever extracted).
    pub final_sparql: String,
    pub trace: Vec<TraceEntry>,
}

impl GenerationSession {
    pub fn accepted(&self) -> bool {
        self.status == SessionStatus::Accepted
    }

    /// Whether the final query passed review (false for budget-0 sessions).
    pub fn reviewed(&self) -> bool {
        self.attempts
            .last()
            .and_then(|a| a.verdict.as_ref())
            .is_some_and(|v| v.accepted)
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub question: String,
    pub technique: Technique,
    /// Use this plan instead of calling the planner.
    pub plan: Option<Plan>,
    pub max_corrections: Option<u32>,
}

impl GenerationRequest {
    pub fn new(question: impl Into<String>, technique: Technique) -> Self {
        Self {
            question: question.into(),
            technique,
            plan: None,
            max_corrections: None,
        }
    }

    pub fn with_plan(mut self, plan: Plan) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn with_max_corrections(mut self, max_corrections: u32) -> Self {
        self.max_corrections = Some(max_corrections);
        self
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerationError {
    #[error("planning failed: {error}")]
    PlanningFailed {
        #[source]
        error: PlanParseError,
        raw: String,
    },
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error("question is empty")]
    EmptyQuestion,
}

impl GenerationError {
    pub fn kind(&self) -> &'static str {
        match self {
            GenerationError::PlanningFailed { .. } => "planning_failed",
            GenerationError::Provider(_) => "provider_error",
            GenerationError::Prompt(PromptError::UnsupportedTechnique(_)) => {
                "unsupported_technique"
            }
            GenerationError::Prompt(_) => "prompt_error",
            GenerationError::EmptyQuestion => "empty_question",
        }
    }
}

impl From<PlanError> for GenerationError {
    fn from(e: PlanError) -> Self {
        match e {
            PlanError::Provider(p) => GenerationError::Provider(p),
            PlanError::Parse { error, raw } => GenerationError::PlanningFailed { error, raw },
        }
    }
}

/// A session that ended without a query, with everything recorded so far.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{error}")]
pub struct SessionFailure {
    #[source]
    pub error: GenerationError,
    pub session_id: Uuid,
    pub trace: Vec<TraceEntry>,
}

// ============================================================================
// Generator
// ============================================================================

/// Runs sessions against one model; the same model plans and reviews.
pub struct SelfValidatingGenerator<'a> {
    model: &'a dyn LanguageModel,
    max_corrections: u32,
}

impl<'a> SelfValidatingGenerator<'a> {
    pub fn new(model: &'a dyn LanguageModel) -> Self {
        Self {
            model,
            max_corrections: DEFAULT_MAX_CORRECTION_CYCLES,
        }
    }

    pub fn with_max_corrections(mut self, max_corrections: u32) -> Self {
        self.max_corrections = max_corrections.min(MAX_CORRECTION_CYCLES_CAP);
        self
    }

    pub async fn run(&self, request: &GenerationRequest) -> Result<GenerationSession, SessionFailure> {
        let mut run = SessionRun::new(self, request);
        match run.drive().await {
            Ok((status, final_sparql)) => Ok(run.finish(status, final_sparql)),
            Err(error) => {
                if let GenerationError::Provider(e) = &error {
                    run.trace.record(TraceEvent::ProviderFailed {
                        error: e.to_string(),
                        status: e.status(),
                        retryable: e.is_retryable(),
                    });
                }
                Err(SessionFailure {
                    error,
                    session_id: run.id,
                    trace: run.trace.into_entries(),
                })
            }
        }
    }
}

/// Mutable state of one in-flight session.
struct SessionRun<'g, 'a> {
    generator: &'g SelfValidatingGenerator<'a>,
    request: &'g GenerationRequest,
    max_corrections: u32,
    id: Uuid,
    state: SessionState,
    plan: Option<Plan>,
    attempts: Vec<GenerationAttempt>,
    trace: Trace,
}

impl<'g, 'a> SessionRun<'g, 'a> {
    fn new(generator: &'g SelfValidatingGenerator<'a>, request: &'g GenerationRequest) -> Self {
        let id = Uuid::new_v4();
        let max_corrections = request
            .max_corrections
            .map(|n| n.min(MAX_CORRECTION_CYCLES_CAP))
            .unwrap_or(generator.max_corrections);
        Self {
            generator,
            request,
            max_corrections,
            id,
            state: SessionState::Init,
            plan: None,
            attempts: Vec::new(),
            trace: Trace::new(id),
        }
    }

    fn model(&self) -> &'a dyn LanguageModel {
        self.generator.model
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        self.trace.record(TraceEvent::StateChanged {
            from: self.state,
            to: next,
        });
        self.state = next;
    }

    async fn drive(&mut self) -> Result<(SessionStatus, String), GenerationError> {
        let request = self.request;
        let question = request.question.trim();
        self.trace.record(TraceEvent::SessionStarted {
            question: question.to_string(),
            technique: request.technique,
            provider: self.model().provider_name().to_string(),
            model: self.model().model_name().to_string(),
            max_corrections: self.max_corrections,
        });
        if question.is_empty() {
            return Err(GenerationError::EmptyQuestion);
        }

        if request.technique.requires_plan() {
            self.plan = Some(self.resolve_plan(question).await?);
        }
        let base = prompt::build(request.technique, question, self.plan.as_ref())?;

        let max_attempts = self.max_corrections as usize + 1;
        let mut prompt = base.clone();
        self.transition(SessionState::Generating);

        loop {
            let index = self.attempts.len() + 1;
            let kind = if index == 1 {
                AttemptKind::Initial
            } else {
                AttemptKind::Correction
            };
            self.trace.record(TraceEvent::PromptSent {
                attempt: index,
                kind: prompt.kind,
                system: prompt.system.clone(),
                user: prompt.user.clone(),
            });
            let raw = self.model().complete(&prompt).await?;
            self.trace.record(TraceEvent::ModelResponded {
                attempt: index,
                raw: raw.clone(),
            });

            let mut attempt = GenerationAttempt {
                index,
                kind,
                prompt: prompt.clone(),
                raw_output: raw,
                sparql: None,
                extraction_error: None,
                verdict: None,
            };

            match extract(&attempt.raw_output) {
                Ok(sparql) => {
                    self.trace.record(TraceEvent::Extracted {
                        attempt: index,
                        sparql: sparql.clone(),
                    });
                    attempt.sparql = Some(sparql.clone());

                    if self.max_corrections == 0 {
                        self.trace.record(TraceEvent::ReviewSkipped { attempt: index });
                        self.attempts.push(attempt);
                        self.transition(SessionState::Accepted);
                        return Ok((SessionStatus::Accepted, sparql));
                    }

                    self.transition(SessionState::Reviewing);
                    let verdict = reviewer::review(question, &sparql, self.model()).await?;
                    self.trace.record(TraceEvent::Reviewed {
                        attempt: index,
                        accepted: verdict.accepted,
                        rationale: verdict.rationale.clone(),
                    });
                    let accepted = verdict.accepted;
                    attempt.verdict = Some(verdict);
                    self.attempts.push(attempt);
                    if accepted {
                        self.transition(SessionState::Accepted);
                        return Ok((SessionStatus::Accepted, sparql));
                    }
                }
                Err(e) => {
                    self.trace.record(TraceEvent::ExtractionFailed {
                        attempt: index,
                        error: e.to_string(),
                    });
                    attempt.extraction_error = Some(e.to_string());
                    self.attempts.push(attempt);
                }
            }

            if self.attempts.len() >= max_attempts {
                self.transition(SessionState::Exhausted);
                let last_extracted = self
                    .attempts
                    .iter()
                    .rev()
                    .find_map(|a| a.sparql.clone())
                    .unwrap_or_default();
                return Ok((SessionStatus::Exhausted, last_extracted));
            }

            self.transition(SessionState::Correcting);
            prompt = self.correction_prompt(&base);
            self.transition(SessionState::Generating);
        }
    }

    async fn resolve_plan(&mut self, question: &str) -> Result<Plan, GenerationError> {
        if let Some(plan) = &self.request.plan {
            self.trace.record(TraceEvent::PlanReady {
                plan: plan.clone(),
                supplied: true,
            });
            return Ok(plan.clone());
        }
        self.trace.record(TraceEvent::PlanRequested);
        match planner::plan_question(question, self.model()).await {
            Ok(plan) => {
                self.trace.record(TraceEvent::PlanReady {
                    plan: plan.clone(),
                    supplied: false,
                });
                Ok(plan)
            }
            Err(PlanError::Parse { error, raw }) => {
                self.trace.record(TraceEvent::PlanFailed {
                    error: error.to_string(),
                });
                Err(GenerationError::PlanningFailed { error, raw })
            }
            Err(PlanError::Provider(e)) => Err(GenerationError::Provider(e)),
        }
    }

    /// Correction prompt for the most recent attempt only.
    fn correction_prompt(&self, base: &Prompt) -> Prompt {
        let Some(last) = self.attempts.last() else {
            return base.clone();
        };
        let rejection = match &last.sparql {
            // A query only reaches correction after a review, so the verdict
            // is always there.
            Some(sparql) => Rejection::Reviewed {
                sparql,
                rationale: last.verdict.as_ref().map_or("", |v| v.rationale.as_str()),
            },
            None => Rejection::Unextractable {
                raw: &last.raw_output,
                reason: last.extraction_error.as_deref().unwrap_or("no SPARQL query found"),
            },
        };
        prompt::correction(base, rejection)
    }

    fn finish(mut self, status: SessionStatus, final_sparql: String) -> GenerationSession {
        self.trace.record(TraceEvent::SessionFinished {
            status,
            attempts: self.attempts.len(),
        });
        GenerationSession {
            id: self.id,
            question: self.request.question.trim().to_string(),
            technique: self.request.technique,
            provider: self.model().provider_name().to_string(),
            model: self.model().model_name().to_string(),
            plan: self.plan,
            attempts: self.attempts,
            status,
            final_sparql,
            trace: self.trace.into_entries(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_follow_the_diagram() {
        use SessionState::*;
        assert!(Init.can_transition_to(Generating));
        assert!(Reviewing.can_transition_to(Correcting));
        assert!(Correcting.can_transition_to(Generating));
        assert!(!Init.can_transition_to(Accepted));
        assert!(!Correcting.can_transition_to(Accepted));
        assert!(!Accepted.can_transition_to(Generating));
        assert!(Exhausted.is_terminal());
    }

    #[test]
    fn error_kinds() {
        let e = GenerationError::from(PromptError::UnsupportedTechnique("x".into()));
        assert_eq!(e.kind(), "unsupported_technique");
        let e = GenerationError::from(PlanError::Parse {
            error: PlanParseError::MissingFields,
            raw: "{}".into(),
        });
        assert_eq!(e.kind(), "planning_failed");
    }
}
