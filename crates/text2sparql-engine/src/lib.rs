//! text2sparql engine: self-validating natural language → SPARQL generation.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────┐
//! │                      SELF-VALIDATING GENERATION                        │
//! ├────────────────────────────────────────────────────────────────────────┤
//! │                                                                        │
//! │  question ──► Planner (chain_of_thought only) ──► Plan                 │
//! │      │                                              │                  │
//! │      ▼                                              ▼                  │
//! │  Prompt builder ──► Model router ──► Provider client ──► raw text      │
//! │      ▲                                                   │             │
//! │      │                                                   ▼             │
//! │  correction prompt ◄── NO ── Reviewer ◄── extracted ── extract()       │
//! │      (bounded)                 │                                       │
//! │                               YES ──► accepted                         │
//! │                                                                        │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The LLM is untrusted everywhere: its answers are parsed defensively, and
//! the reviewer's verdict only ever *accepts* on an explicit `YES`.
//!
//! Batch runs, dataset loading and endpoint execution sit on top of the
//! per-question session and never reach into it.

pub mod batch;
pub mod config;
pub mod dataset;
pub mod endpoint;
pub mod extract;
pub mod generator;
pub mod jsonl;
pub mod plan;
pub mod planner;
pub mod prompt;
pub mod provider;
pub mod reviewer;
pub mod router;
pub mod service;
pub mod trace;

pub use config::{AppConfig, ConfigError, ProviderSettings};
pub use extract::{extract, ExtractionError};
pub use generator::{
    AttemptKind, GenerationAttempt, GenerationError, GenerationRequest, GenerationSession,
    SelfValidatingGenerator, SessionFailure, SessionState, SessionStatus,
};
pub use plan::{Plan, PlanItem};
pub use planner::{PlanError, PlanParseError};
pub use prompt::{Prompt, PromptError, PromptKind, Technique};
pub use provider::{
    CompletionSettings, LanguageModel, ProviderClient, ProviderError, ProviderKind,
};
pub use reviewer::ReviewVerdict;
pub use router::{ModelRouter, RoutedModel, RouterError};
pub use service::{GenerateRequest, GenerateResponse, PlanRequest, PlanResponse, ServiceError, Text2SparqlService};
pub use trace::{TraceEntry, TraceEvent};
