//! Run many sessions over a dataset, one prediction line per question.
//!
//! Sessions run as tokio tasks gated by a semaphore. The only shared state is
//! the router (behind an `Arc`) and the append-only sinks. A failed session
//! still produces a record, with `error` set, and the run moves on.
//!
//! Records are never rewritten. A retried question appends a new record, and
//! readers take the latest record per id.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::dataset::DatasetEntry;
use crate::generator::{
    GenerationRequest, GenerationSession, SelfValidatingGenerator, SessionFailure, SessionStatus,
};
use crate::jsonl::{self, JsonlWriter};
use crate::prompt::Technique;
use crate::provider::LanguageModel;
use crate::router::{ModelRouter, RoutedModel};
use crate::trace::TraceWriter;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub id: String,
    pub question: String,
    pub technique: Technique,
    pub provider: String,
    pub model: String,
    /// Empty when nothing was extracted or the session failed.
    pub sparql: String,
    pub attempts: usize,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_sparql: Option<String>,
}

impl PredictionRecord {
    pub fn from_session(entry: &DatasetEntry, session: &GenerationSession) -> Self {
        Self {
            id: entry.id.clone(),
            question: entry.question.clone(),
            technique: session.technique,
            provider: session.provider.clone(),
            model: session.model.clone(),
            sparql: session.final_sparql.clone(),
            attempts: session.attempts.len(),
            accepted: session.accepted(),
            status: Some(session.status),
            error: None,
            expected_sparql: entry.expected_sparql.clone(),
        }
    }

    pub fn from_failure(
        entry: &DatasetEntry,
        technique: Technique,
        model: &dyn LanguageModel,
        failure: &SessionFailure,
    ) -> Self {
        Self {
            id: entry.id.clone(),
            question: entry.question.clone(),
            technique,
            provider: model.provider_name().to_string(),
            model: model.model_name().to_string(),
            sparql: String::new(),
            attempts: 0,
            accepted: false,
            status: None,
            error: Some(failure.error.to_string()),
            expected_sparql: entry.expected_sparql.clone(),
        }
    }
}

/// Append-only prediction output.
#[derive(Debug)]
pub struct PredictionSink {
    out: JsonlWriter,
}

impl PredictionSink {
    pub fn open(path: &Path) -> Result<Self> {
        let out = JsonlWriter::append(path)
            .with_context(|| format!("failed to open prediction output {}", path.display()))?;
        Ok(Self { out })
    }

    pub fn path(&self) -> &Path {
        self.out.path()
    }

    pub fn append(&self, record: &PredictionRecord) -> Result<()> {
        self.out
            .write(record)
            .with_context(|| format!("failed to append to {}", self.out.path().display()))
    }
}

/// Ids whose latest record finished without an error (empty if the file does
/// not exist). Failed ids are left out so a resumed run retries them.
pub fn completed_ids(path: &Path) -> Result<HashSet<String>> {
    if !path.exists() {
        return Ok(HashSet::new());
    }
    Ok(latest_predictions(path)?
        .into_iter()
        .filter(|r| r.error.is_none())
        .map(|r| r.id)
        .collect())
}

/// Every line of a prediction file, retries included.
pub fn read_predictions(path: &Path) -> Result<Vec<PredictionRecord>> {
    jsonl::read_lines(path).with_context(|| format!("failed to read predictions {}", path.display()))
}

/// The latest record per id, in the order ids first appear.
pub fn latest_predictions(path: &Path) -> Result<Vec<PredictionRecord>> {
    let mut out: Vec<PredictionRecord> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for record in read_predictions(path)? {
        match index.get(&record.id) {
            Some(&i) => out[i] = record,
            None => {
                index.insert(record.id.clone(), out.len());
                out.push(record);
            }
        }
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub technique: Technique,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub max_corrections: u32,
    pub concurrency: usize,
    /// Skip ids whose latest record in the output file has no error.
    pub resume: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub skipped: usize,
    pub accepted: usize,
    pub exhausted: usize,
    pub failed: usize,
    pub mean_attempts: f64,
}

impl BatchSummary {
    fn from_records(total: usize, skipped: usize, records: &[PredictionRecord]) -> Self {
        let mut summary = BatchSummary {
            total,
            skipped,
            ..Default::default()
        };
        let mut attempts = 0usize;
        for r in records {
            match (r.status, r.error.is_some()) {
                (_, true) => summary.failed += 1,
                (Some(SessionStatus::Accepted), _) => summary.accepted += 1,
                (Some(SessionStatus::Exhausted), _) => summary.exhausted += 1,
                (None, false) => summary.failed += 1,
            }
            attempts += r.attempts;
        }
        if !records.is_empty() {
            summary.mean_attempts = attempts as f64 / records.len() as f64;
        }
        summary
    }
}

/// Run every entry not yet in `sink`, appending records as sessions finish.
pub async fn run_batch(
    router: Arc<ModelRouter>,
    entries: Vec<DatasetEntry>,
    sink: Arc<PredictionSink>,
    traces: Option<Arc<TraceWriter>>,
    options: &BatchOptions,
) -> Result<BatchSummary> {
    // Unknown providers fail the run before any work is scheduled.
    let model: Arc<RoutedModel> = Arc::new(
        router
            .route(options.provider.as_deref(), options.model.as_deref())
            .context("cannot route batch model")?,
    );

    let total = entries.len();
    let done = if options.resume {
        completed_ids(sink.path())?
    } else {
        HashSet::new()
    };
    let pending: Vec<DatasetEntry> = entries
        .into_iter()
        .filter(|e| !done.contains(&e.id))
        .collect();
    let skipped = total - pending.len();
    tracing::info!(
        total,
        skipped,
        pending = pending.len(),
        provider = model.provider_name(),
        model = model.model_name(),
        technique = %options.technique,
        "batch started"
    );

    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut tasks = JoinSet::new();
    for entry in pending {
        let semaphore = Arc::clone(&semaphore);
        let model = Arc::clone(&model);
        let sink = Arc::clone(&sink);
        let traces = traces.clone();
        let technique = options.technique;
        let max_corrections = options.max_corrections;

        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .context("batch semaphore closed")?;
            let generator =
                SelfValidatingGenerator::new(&*model).with_max_corrections(max_corrections);
            let request = GenerationRequest::new(entry.question.clone(), technique);

            let (record, trace) = match generator.run(&request).await {
                Ok(session) => (PredictionRecord::from_session(&entry, &session), session.trace),
                Err(failure) => {
                    tracing::warn!(id = %entry.id, error = %failure, "session failed");
                    (
                        PredictionRecord::from_failure(&entry, technique, &*model, &failure),
                        failure.trace,
                    )
                }
            };
            sink.append(&record)?;
            if let Some(traces) = traces {
                traces
                    .write_session(&trace)
                    .context("failed to write session trace")?;
            }
            tracing::info!(
                id = %record.id,
                accepted = record.accepted,
                attempts = record.attempts,
                "prediction written"
            );
            anyhow::Ok(record)
        });
    }

    let mut records = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let record = joined.context("batch task panicked")??;
        records.push(record);
    }

    let summary = BatchSummary::from_records(total, skipped, &records);
    tracing::info!(
        accepted = summary.accepted,
        exhausted = summary.exhausted,
        failed = summary.failed,
        mean_attempts = summary.mean_attempts,
        "batch finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::provider::ProviderKind;
    use tempfile::tempdir;

    fn entries(n: usize) -> Vec<DatasetEntry> {
        (1..=n)
            .map(|i| DatasetEntry {
                id: i.to_string(),
                question: format!("Who founded Company{i}?"),
                expected_sparql: None,
            })
            .collect()
    }

    fn mock_router() -> Arc<ModelRouter> {
        let config = AppConfig {
            default_provider: ProviderKind::Mock,
            default_model: String::new(),
            ..AppConfig::default()
        };
        Arc::new(ModelRouter::from_config(&config).unwrap())
    }

    fn options() -> BatchOptions {
        BatchOptions {
            technique: Technique::ZeroShot,
            provider: None,
            model: None,
            max_corrections: 2,
            concurrency: 3,
            resume: true,
        }
    }

    #[tokio::test]
    async fn writes_one_line_per_question_and_resumes() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("preds.jsonl");
        let sink = Arc::new(PredictionSink::open(&out).unwrap());

        let summary = run_batch(mock_router(), entries(5), Arc::clone(&sink), None, &options())
            .await
            .unwrap();
        assert_eq!(summary.total, 5);
        assert_eq!(summary.accepted, 5);
        assert_eq!(summary.mean_attempts, 1.0);

        let records = read_predictions(&out).unwrap();
        assert_eq!(records.len(), 5);
        let ids: HashSet<_> = records.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids.len(), 5);

        let summary = run_batch(mock_router(), entries(7), sink, None, &options())
            .await
            .unwrap();
        assert_eq!(summary.skipped, 5);
        assert_eq!(summary.accepted, 2);
        assert_eq!(read_predictions(&out).unwrap().len(), 7);
    }

    #[tokio::test]
    async fn failed_sessions_are_recorded_and_the_run_continues() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("preds.jsonl");
        let sink = Arc::new(PredictionSink::open(&out).unwrap());
        let opts = BatchOptions {
            provider: Some("openai".into()),
            ..options()
        };
        let summary = run_batch(mock_router(), entries(3), sink, None, &opts).await.unwrap();
        assert_eq!(summary.failed, 3);
        let records = read_predictions(&out).unwrap();
        assert!(records.iter().all(|r| r.error.as_deref().is_some_and(|e| e.contains("OPENAI_API_KEY"))));
    }

    #[tokio::test]
    async fn resume_retries_failed_ids() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("preds.jsonl");
        let sink = Arc::new(PredictionSink::open(&out).unwrap());

        // First run: no API key, so every session fails.
        let opts = BatchOptions {
            provider: Some("openai".into()),
            ..options()
        };
        let summary = run_batch(mock_router(), entries(2), Arc::clone(&sink), None, &opts)
            .await
            .unwrap();
        assert_eq!(summary.failed, 2);
        assert!(completed_ids(&out).unwrap().is_empty());

        let summary = run_batch(mock_router(), entries(3), sink, None, &options())
            .await
            .unwrap();
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.accepted, 3);

        // Old failures stay in the file; the retry wins.
        assert_eq!(read_predictions(&out).unwrap().len(), 5);
        let latest = latest_predictions(&out).unwrap();
        let mut ids: Vec<&str> = latest.iter().map(|r| r.id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, ["1", "2", "3"]);
        assert!(latest.iter().all(|r| r.accepted && r.error.is_none()));
        assert_eq!(completed_ids(&out).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unknown_provider_fails_before_writing() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("preds.jsonl");
        let sink = Arc::new(PredictionSink::open(&out).unwrap());
        let opts = BatchOptions {
            provider: Some("bard".into()),
            ..options()
        };
        assert!(run_batch(mock_router(), entries(2), sink, None, &opts).await.is_err());
        assert!(read_predictions(&out).unwrap().is_empty());
    }

    #[test]
    fn summary_counts() {
        let base = PredictionRecord {
            id: "1".into(),
            question: "q".into(),
            technique: Technique::ZeroShot,
            provider: "mock".into(),
            model: "mock".into(),
            sparql: String::new(),
            attempts: 4,
            accepted: false,
            status: Some(SessionStatus::Exhausted),
            error: None,
            expected_sparql: None,
        };
        let ok = PredictionRecord {
            attempts: 2,
            accepted: true,
            status: Some(SessionStatus::Accepted),
            ..base.clone()
        };
        let s = BatchSummary::from_records(3, 0, &[base, ok]);
        assert_eq!((s.accepted, s.exhausted, s.failed), (1, 1, 0));
        assert_eq!(s.mean_attempts, 3.0);
    }
}
