//! Integration tests for the complete text2sparql pipeline
//!
//! These tests verify end-to-end functionality across modules:
//! - Config → Router → Service (mock provider)
//! - Dataset file → Batch → Prediction JSONL → Resume
//! - Session traces → JSONL
//!
//! Run with: cargo test --test integration_tests

use std::sync::Arc;
use tempfile::tempdir;

use text2sparql_engine::batch::{self, BatchOptions, PredictionSink};
use text2sparql_engine::dataset;
use text2sparql_engine::jsonl;
use text2sparql_engine::trace::TraceWriter;
use text2sparql_engine::{
    AppConfig, GenerateRequest, ModelRouter, ProviderKind, Technique, Text2SparqlService,
    TraceEntry, TraceEvent,
};

fn mock_config() -> AppConfig {
    let mut config = AppConfig::default();
    config
        .apply_overrides(|name: &str| match name {
            "TEXT2SPARQL_PROVIDER" => Some("mock".to_string()),
            _ => None,
        })
        .expect("overrides");
    config.validate().expect("valid config");
    config
}

// ============================================================================
// Config → Service
// ============================================================================

#[tokio::test]
async fn test_env_override_routes_to_mock_provider() {
    let config = mock_config();
    assert_eq!(config.default_provider, ProviderKind::Mock);

    let service = Text2SparqlService::new(config).expect("service");
    let resp = service
        .generate(GenerateRequest {
            question: "Who directed Alien?".into(),
            ..Default::default()
        })
        .await
        .expect("generate");
    assert_eq!(resp.provider, "mock");
    assert_eq!(resp.model, "mock");
    assert_eq!(resp.technique, Technique::ZeroShot);
    assert!(resp.accepted);
    assert!(resp.attempt_log.is_empty());
}

#[tokio::test]
async fn test_request_overrides_beat_config_defaults() {
    let service = Text2SparqlService::new(mock_config()).expect("service");
    let resp = service
        .generate(GenerateRequest {
            question: "How many moons does Mars have?".into(),
            technique: Some("graph_of_thought".into()),
            max_corrections: Some(0),
            include_trace: true,
            ..Default::default()
        })
        .await
        .expect("generate");
    assert_eq!(resp.technique, Technique::ChainOfThought);
    assert!(resp.plan.is_some());
    assert!(resp
        .trace
        .iter()
        .any(|e| matches!(e.event, TraceEvent::ReviewSkipped { .. })));
}

// ============================================================================
// Dataset → Batch → JSONL
// ============================================================================

#[tokio::test]
async fn test_official_dataset_batch_with_traces_and_resume() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("qald9.json");
    std::fs::write(
        &data,
        r#"{"questions": [
            {"id": "1", "question": [{"language": "en", "string": "Who is the mayor of Paris?"}],
             "query": {"sparql": "SELECT ?m WHERE { dbr:Paris dbo:mayor ?m }"}},
            {"id": "2", "question": [{"language": "en", "string": "Which rivers flow through Vienna?"}]},
            {"id": "3", "question": [{"language": "de", "string": "Nur Deutsch"}]},
            {"id": "4", "question": [{"language": "en", "string": "When was Tesla founded?"}]}
        ]}"#,
    )
    .unwrap();

    let entries = dataset::load_dataset(&data).expect("dataset");
    assert_eq!(entries.len(), 3);

    let router = Arc::new(ModelRouter::from_config(&mock_config()).expect("router"));
    let out = dir.path().join("predicted/preds.jsonl");
    let traces_path = dir.path().join("predicted/traces.jsonl");
    let options = BatchOptions {
        technique: Technique::ChainOfThought,
        provider: None,
        model: None,
        max_corrections: 3,
        concurrency: 2,
        resume: true,
    };

    let sink = Arc::new(PredictionSink::open(&out).unwrap());
    let traces = Arc::new(TraceWriter::create(&traces_path).unwrap());
    let summary = batch::run_batch(
        Arc::clone(&router),
        entries[..2].to_vec(),
        sink,
        Some(traces),
        &options,
    )
    .await
    .expect("batch");
    assert_eq!((summary.total, summary.accepted), (2, 2));

    // A fresh sink on the same file picks up where the first run stopped.
    let sink = Arc::new(PredictionSink::open(&out).unwrap());
    let summary = batch::run_batch(router, entries.clone(), sink, None, &options)
        .await
        .expect("resumed batch");
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.accepted, 1);

    let records = batch::read_predictions(&out).unwrap();
    assert_eq!(records.len(), 3);
    let paris = records.iter().find(|r| r.id == "1").unwrap();
    assert!(paris.expected_sparql.is_some());
    assert!(records.iter().all(|r| r.technique == Technique::ChainOfThought));

    let trace: Vec<TraceEntry> = jsonl::read_lines(&traces_path).unwrap();
    let sessions: std::collections::HashSet<_> = trace.iter().map(|e| e.session_id).collect();
    assert_eq!(sessions.len(), 2);
    assert!(trace
        .iter()
        .any(|e| matches!(e.event, TraceEvent::PlanReady { supplied: false, .. })));
}
