//! Ordered, serialisable record of what happened inside one session.
//!
//! Every event is mirrored to `tracing` as it is recorded, so a live log and
//! the stored trace tell the same story.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::generator::{SessionState, SessionStatus};
use crate::jsonl::JsonlWriter;
use crate::plan::Plan;
use crate::prompt::{PromptKind, Technique};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub seq: usize,
    pub at: DateTime<Utc>,
    pub session_id: Uuid,
    #[serde(flatten)]
    pub event: TraceEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    SessionStarted {
        question: String,
        technique: Technique,
        provider: String,
        model: String,
        max_corrections: u32,
    },
    PlanRequested,
    PlanReady {
        plan: Plan,
        supplied: bool,
    },
    PlanFailed {
        error: String,
    },
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    PromptSent {
        attempt: usize,
        kind: PromptKind,
        system: String,
        user: String,
    },
    ModelResponded {
        attempt: usize,
        raw: String,
    },
    ProviderFailed {
        error: String,
        status: Option<u16>,
        retryable: bool,
    },
    Extracted {
        attempt: usize,
        sparql: String,
    },
    ExtractionFailed {
        attempt: usize,
        error: String,
    },
    ReviewSkipped {
        attempt: usize,
    },
    Reviewed {
        attempt: usize,
        accepted: bool,
        rationale: String,
    },
    SessionFinished {
        status: SessionStatus,
        attempts: usize,
    },
}

/// Collects the entries of one session.
#[derive(Debug)]
pub struct Trace {
    session_id: Uuid,
    entries: Vec<TraceEntry>,
}

impl Trace {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            entries: Vec::new(),
        }
    }

    pub fn record(&mut self, event: TraceEvent) {
        emit(&self.session_id, &event);
        self.entries.push(TraceEntry {
            seq: self.entries.len(),
            at: Utc::now(),
            session_id: self.session_id,
            event,
        });
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<TraceEntry> {
        self.entries
    }
}

fn emit(session_id: &Uuid, event: &TraceEvent) {
    match event {
        TraceEvent::SessionStarted {
            technique,
            provider,
            model,
            ..
        } => tracing::info!(%session_id, %technique, %provider, %model, "session started"),
        TraceEvent::PlanRequested => tracing::debug!(%session_id, "plan requested"),
        TraceEvent::PlanReady { plan, supplied } => tracing::debug!(
            %session_id,
            supplied,
            entities = plan.entities.len(),
            steps = plan.chain_of_thought.len(),
            "plan ready"
        ),
        TraceEvent::PlanFailed { error } => tracing::warn!(%session_id, %error, "planning failed"),
        TraceEvent::StateChanged { from, to } => {
            tracing::debug!(%session_id, ?from, ?to, "state changed")
        }
        TraceEvent::PromptSent { attempt, kind, .. } => {
            tracing::debug!(%session_id, attempt, ?kind, "prompt sent")
        }
        TraceEvent::ModelResponded { attempt, raw } => {
            tracing::debug!(%session_id, attempt, chars = raw.len(), "model responded")
        }
        TraceEvent::ProviderFailed {
            error, retryable, ..
        } => tracing::warn!(%session_id, %error, retryable, "provider call failed"),
        TraceEvent::Extracted { attempt, .. } => {
            tracing::debug!(%session_id, attempt, "query extracted")
        }
        TraceEvent::ExtractionFailed { attempt, error } => {
            tracing::info!(%session_id, attempt, %error, "no query in model output")
        }
        TraceEvent::ReviewSkipped { attempt } => {
            tracing::debug!(%session_id, attempt, "review skipped")
        }
        TraceEvent::Reviewed {
            attempt,
            accepted,
            rationale,
        } => tracing::info!(%session_id, attempt, accepted, %rationale, "reviewed"),
        TraceEvent::SessionFinished { status, attempts } => {
            tracing::info!(%session_id, ?status, attempts, "session finished")
        }
    }
}

/// Appends session traces to a JSONL file, one entry per line.
#[derive(Debug)]
pub struct TraceWriter {
    out: JsonlWriter,
}

impl TraceWriter {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            out: JsonlWriter::append(path)?,
        })
    }

    pub fn write_session(&self, entries: &[TraceEntry]) -> std::io::Result<()> {
        self.out.write_all(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_are_sequenced_and_tagged() {
        let id = Uuid::new_v4();
        let mut trace = Trace::new(id);
        trace.record(TraceEvent::PlanRequested);
        trace.record(TraceEvent::StateChanged {
            from: SessionState::Init,
            to: SessionState::Generating,
        });
        let entries = trace.into_entries();
        assert_eq!(entries[0].seq, 0);
        assert_eq!(entries[1].seq, 1);
        assert!(entries[0].at <= entries[1].at);

        let json = serde_json::to_value(&entries[1]).unwrap();
        assert_eq!(json["event"], "state_changed");
        assert_eq!(json["to"], "generating");
        assert_eq!(json["session_id"], id.to_string());

        let back: TraceEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entries[1]);
    }
}
