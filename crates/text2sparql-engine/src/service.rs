//! Request-level entry points shared by the CLI and the HTTP server.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::generator::{
    GenerationAttempt, GenerationError, GenerationRequest, SelfValidatingGenerator,
    SessionFailure, SessionStatus,
};
use crate::plan::Plan;
use crate::planner::{self, PlanError};
use crate::prompt::{PromptError, Technique};
use crate::provider::LanguageModel;
use crate::router::{ModelRouter, RouterError};
use crate::trace::TraceEntry;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateRequest {
    pub question: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Any accepted alias; defaults to the configured technique.
    #[serde(default)]
    pub technique: Option<String>,
    #[serde(default)]
    pub plan: Option<Plan>,
    #[serde(default)]
    pub max_corrections: Option<u32>,
    /// Include attempts and trace in the response.
    #[serde(default)]
    pub include_trace: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub session_id: Uuid,
    pub sparql: String,
    pub accepted: bool,
    pub status: SessionStatus,
    pub attempts: usize,
    pub technique: Technique,
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempt_log: Vec<GenerationAttempt>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<TraceEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlanRequest {
    pub question: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanResponse {
    pub plan: Plan,
    pub provider: String,
    pub model: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Technique(#[from] PromptError),
    #[error(transparent)]
    Session(#[from] SessionFailure),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error("question is empty")]
    EmptyQuestion,
}

impl ServiceError {
    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Router(RouterError::UnknownProvider { .. }) => "unknown_provider",
            ServiceError::Router(RouterError::HttpClient(_)) => "internal",
            ServiceError::Technique(PromptError::UnsupportedTechnique(_)) => {
                "unsupported_technique"
            }
            ServiceError::Technique(_) => "prompt_error",
            ServiceError::Session(f) => f.error.kind(),
            ServiceError::Plan(PlanError::Parse { .. }) => "planning_failed",
            ServiceError::Plan(PlanError::Provider(_)) => "provider_error",
            ServiceError::EmptyQuestion => "empty_question",
        }
    }

    /// Caused by the request rather than by a provider or the server.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self.kind(),
            "unknown_provider" | "unsupported_technique" | "empty_question"
        )
    }

    /// HTTP status of an upstream provider failure, if any.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            ServiceError::Session(SessionFailure {
                error: GenerationError::Provider(e),
                ..
            })
            | ServiceError::Plan(PlanError::Provider(e)) => e.status(),
            _ => None,
        }
    }
}

/// Config plus router, shared by every request.
#[derive(Debug, Clone)]
pub struct Text2SparqlService {
    config: Arc<AppConfig>,
    router: Arc<ModelRouter>,
}

impl Text2SparqlService {
    pub fn new(config: AppConfig) -> Result<Self, RouterError> {
        let router = ModelRouter::from_config(&config)?;
        Ok(Self {
            config: Arc::new(config),
            router: Arc::new(router),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn router(&self) -> Arc<ModelRouter> {
        Arc::clone(&self.router)
    }

    pub fn technique(&self, requested: Option<&str>) -> Result<Technique, PromptError> {
        match requested.map(str::trim).filter(|t| !t.is_empty()) {
            Some(t) => t.parse(),
            None => Ok(self.config.default_technique),
        }
    }

    pub async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, ServiceError> {
        if request.question.trim().is_empty() {
            return Err(ServiceError::EmptyQuestion);
        }
        let technique = self.technique(request.technique.as_deref())?;
        let model = self
            .router
            .route(request.provider.as_deref(), request.model.as_deref())?;

        let generator = SelfValidatingGenerator::new(&model)
            .with_max_corrections(self.config.max_correction_cycles);
        let mut gen_request = GenerationRequest::new(request.question.clone(), technique);
        gen_request.plan = request.plan;
        gen_request.max_corrections = request.max_corrections;

        let session = generator.run(&gen_request).await?;
        let (attempt_log, trace) = if request.include_trace {
            (session.attempts.clone(), session.trace.clone())
        } else {
            (Vec::new(), Vec::new())
        };
        Ok(GenerateResponse {
            session_id: session.id,
            accepted: session.accepted(),
            status: session.status,
            attempts: session.attempts.len(),
            technique: session.technique,
            provider: session.provider,
            model: session.model,
            plan: session.plan,
            sparql: session.final_sparql,
            attempt_log,
            trace,
        })
    }

    pub async fn plan(&self, request: PlanRequest) -> Result<PlanResponse, ServiceError> {
        if request.question.trim().is_empty() {
            return Err(ServiceError::EmptyQuestion);
        }
        let model = self
            .router
            .route(request.provider.as_deref(), request.model.as_deref())?;
        let plan = planner::plan_question(&request.question, &model).await?;
        Ok(PlanResponse {
            plan,
            provider: model.provider_name().to_string(),
            model: model.model_name().to_string(),
        })
    }
}
