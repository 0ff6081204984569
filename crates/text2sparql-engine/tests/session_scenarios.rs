//! Session scenarios for the self-validating generator
//!
//! Drives complete sessions with a scripted model:
//! 1. Acceptance on the first review
//! 2. Correction cycles that carry only the latest rejection
//! 3. Budget exhaustion, including budget 0
//! 4. Planning and provider failures

use text2sparql_engine::generator::{
    AttemptKind, GenerationError, GenerationRequest, SelfValidatingGenerator, SessionStatus,
};
use text2sparql_engine::plan::{Plan, PlanItem};
use text2sparql_engine::planner::PlanParseError;
use text2sparql_engine::prompt::{Prompt, PromptKind, Technique};
use text2sparql_engine::provider::ScriptedModel;
use text2sparql_engine::trace::TraceEvent;

const Q1: &str = "SELECT ?c WHERE { dbr:France dbp:capital ?c }";
const Q2: &str = "SELECT ?c WHERE { dbr:France dbo:capital ?c . ?c a dbo:City }";
const Q3: &str = "SELECT ?c WHERE { dbr:France dbo:capital ?c }";

fn fenced(q: &str) -> String {
    format!("Here you go:\n```sparql\n{q}\n```")
}

fn generation_prompts(model: &ScriptedModel) -> Vec<Prompt> {
    model
        .prompts()
        .into_iter()
        .filter(|p| matches!(p.kind, PromptKind::Generation | PromptKind::Correction))
        .collect()
}

const PLAN_JSON: &str = r#"{"entities": [{"text": "France", "uri": "http://dbpedia.org/resource/France"}],
    "relations": [{"text": "capital", "uri": "http://dbpedia.org/ontology/capital"}],
    "chain_of_thought": ["Find France", "Follow dbo:capital"]}"#;

// ============================================================================
// Acceptance
// ============================================================================

#[tokio::test]
async fn zero_shot_accepted_on_first_review() {
    let model = ScriptedModel::new()
        .with_generations([fenced(Q3)])
        .with_reviews(["YES. It asks for the capital of France."]);
    let generator = SelfValidatingGenerator::new(&model).with_max_corrections(3);

    let session = generator
        .run(&GenerationRequest::new(
            "What is the capital of France?",
            Technique::ZeroShot,
        ))
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Accepted);
    assert!(session.reviewed());
    assert_eq!(session.attempts.len(), 1);
    assert_eq!(session.final_sparql, Q3);
    assert_eq!(session.plan, None);
    assert_eq!(model.calls(PromptKind::Planning), 0);

    let first = &session.trace.first().unwrap().event;
    assert!(matches!(first, TraceEvent::SessionStarted { .. }));
    let last = &session.trace.last().unwrap().event;
    assert!(matches!(
        last,
        TraceEvent::SessionFinished {
            status: SessionStatus::Accepted,
            attempts: 1
        }
    ));
    let seqs: Vec<usize> = session.trace.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (0..session.trace.len()).collect::<Vec<_>>());
}

#[tokio::test]
async fn chain_of_thought_corrects_twice_then_accepts() {
    let model = ScriptedModel::new()
        .with_plans([PLAN_JSON])
        .with_generations([fenced(Q1), fenced(Q2), fenced(Q3)])
        .with_reviews([
            "NO: dbp:capital is a raw property, use dbo:capital.",
            "NO - the type restriction excludes valid answers.",
            "YES",
        ]);
    let generator = SelfValidatingGenerator::new(&model).with_max_corrections(3);

    let session = generator
        .run(&GenerationRequest::new(
            "What is the capital of France?",
            Technique::ChainOfThought,
        ))
        .await
        .unwrap();

    assert!(session.accepted());
    assert_eq!(session.attempts.len(), 3);
    assert_eq!(session.final_sparql, Q3);
    assert_eq!(
        session.plan.as_ref().unwrap().entities[0],
        PlanItem::new("France", Some("http://dbpedia.org/resource/France"))
    );

    let kinds: Vec<AttemptKind> = session.attempts.iter().map(|a| a.kind).collect();
    assert_eq!(
        kinds,
        vec![AttemptKind::Initial, AttemptKind::Correction, AttemptKind::Correction]
    );

    let prompts = generation_prompts(&model);
    assert_eq!(prompts.len(), 3);
    assert!(prompts[0].user.contains("http://dbpedia.org/resource/France"));
    assert!(prompts[1].user.contains(Q1));
    assert!(prompts[1].user.contains("use dbo:capital"));
    assert!(prompts[2].user.contains(Q2));
    assert!(!prompts[2].user.contains(Q1));
    assert!(prompts[2].user.contains("type restriction"));
}

#[tokio::test]
async fn supplied_plan_skips_the_planner() {
    let plan = Plan {
        entities: vec![PlanItem::new("France", None)],
        relations: vec![],
        chain_of_thought: vec!["Look up the capital".into()],
    };
    let model = ScriptedModel::new()
        .with_generations([fenced(Q3)])
        .with_reviews(["YES"]);
    let session = SelfValidatingGenerator::new(&model)
        .run(&GenerationRequest::new("Capital of France?", Technique::ChainOfThought).with_plan(plan.clone()))
        .await
        .unwrap();

    assert_eq!(model.calls(PromptKind::Planning), 0);
    assert_eq!(session.plan, Some(plan));
    assert!(session
        .trace
        .iter()
        .any(|e| matches!(e.event, TraceEvent::PlanReady { supplied: true, .. })));
}

// ============================================================================
// Exhaustion
// ============================================================================

#[tokio::test]
async fn every_review_rejects_until_the_budget_is_spent() {
    let model = ScriptedModel::new()
        .with_generations([fenced(Q1), fenced(Q2), fenced(Q3)])
        .with_reviews(["NO: wrong", "NO: still wrong", "NO: nope"]);
    let session = SelfValidatingGenerator::new(&model)
        .run(&GenerationRequest::new("Capital of France?", Technique::ZeroShot).with_max_corrections(2))
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Exhausted);
    assert_eq!(session.attempts.len(), 3);
    assert_eq!(session.final_sparql, Q3);
    assert_eq!(model.calls(PromptKind::Review), 3);
    assert!(session.attempts.iter().all(|a| a.verdict.as_ref().is_some_and(|v| !v.accepted)));
}

#[tokio::test]
async fn budget_zero_returns_unreviewed_query() {
    let model = ScriptedModel::new().with_generations([fenced(Q1)]);
    let session = SelfValidatingGenerator::new(&model)
        .with_max_corrections(0)
        .run(&GenerationRequest::new("Capital of France?", Technique::DynamicPrompt))
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Accepted);
    assert!(!session.reviewed());
    assert_eq!(session.attempts.len(), 1);
    assert_eq!(model.calls(PromptKind::Review), 0);
    assert!(session
        .trace
        .iter()
        .any(|e| matches!(e.event, TraceEvent::ReviewSkipped { attempt: 1 })));
}

#[tokio::test]
async fn budget_zero_without_a_query_is_exhausted() {
    let model = ScriptedModel::new().with_generations(["I am not sure how to express that."]);
    let session = SelfValidatingGenerator::new(&model)
        .with_max_corrections(0)
        .run(&GenerationRequest::new("Capital of France?", Technique::ZeroShot))
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Exhausted);
    assert_eq!(session.final_sparql, "");
    assert!(session.attempts[0].extraction_error.is_some());
}

#[tokio::test]
async fn extraction_failure_feeds_a_correction() {
    let model = ScriptedModel::new()
        .with_generations(["The capital is Paris.".to_string(), fenced(Q3)])
        .with_reviews(["YES"]);
    let session = SelfValidatingGenerator::new(&model)
        .run(&GenerationRequest::new("Capital of France?", Technique::ZeroShot))
        .await
        .unwrap();

    assert!(session.accepted());
    assert_eq!(session.attempts.len(), 2);
    assert!(session.attempts[0].sparql.is_none());
    assert!(session.attempts[0].verdict.is_none());
    let prompts = generation_prompts(&model);
    assert_eq!(prompts[1].kind, PromptKind::Correction);
    assert!(prompts[1].user.contains("The capital is Paris."));
}

#[tokio::test]
async fn exhausted_session_keeps_the_last_extracted_query() {
    let model = ScriptedModel::new()
        .with_generations([fenced(Q1), "no idea".to_string()])
        .with_reviews(["NO: wrong property"]);
    let session = SelfValidatingGenerator::new(&model)
        .run(&GenerationRequest::new("Capital of France?", Technique::ZeroShot).with_max_corrections(1))
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Exhausted);
    assert_eq!(session.final_sparql, Q1);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn unusable_plan_fails_the_session() {
    let model = ScriptedModel::new()
        .with_plans(["Entities: France. Relation: capital."])
        .with_generations([fenced(Q3)]);
    let failure = SelfValidatingGenerator::new(&model)
        .run(&GenerationRequest::new("Capital of France?", Technique::ChainOfThought))
        .await
        .unwrap_err();

    assert!(matches!(
        failure.error,
        GenerationError::PlanningFailed {
            error: PlanParseError::NoJsonObject,
            ..
        }
    ));
    assert_eq!(model.calls(PromptKind::Generation), 0);
    assert!(failure
        .trace
        .iter()
        .any(|e| matches!(e.event, TraceEvent::PlanFailed { .. })));
}

#[tokio::test]
async fn provider_failure_ends_the_session_without_a_query() {
    // No review answers queued: the review call fails.
    let model = ScriptedModel::new().with_generations([fenced(Q1)]);
    let failure = SelfValidatingGenerator::new(&model)
        .run(&GenerationRequest::new("Capital of France?", Technique::ZeroShot))
        .await
        .unwrap_err();

    assert!(matches!(failure.error, GenerationError::Provider(_)));
    assert_eq!(failure.error.kind(), "provider_error");
    assert!(failure
        .trace
        .iter()
        .any(|e| matches!(e.event, TraceEvent::ProviderFailed { .. })));
    assert!(!failure
        .trace
        .iter()
        .any(|e| matches!(e.event, TraceEvent::SessionFinished { .. })));
}

#[tokio::test]
async fn blank_question_is_rejected() {
    let model = ScriptedModel::new();
    let failure = SelfValidatingGenerator::new(&model)
        .run(&GenerationRequest::new("   ", Technique::ZeroShot))
        .await
        .unwrap_err();
    assert!(matches!(failure.error, GenerationError::EmptyQuestion));
    assert!(model.prompts().is_empty());
}
