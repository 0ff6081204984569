//! Execute predicted queries against a SPARQL endpoint and export the
//! answers in the QALD document layout used by benchmark scorers.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::batch::PredictionRecord;

pub const SPARQL_RESULTS_JSON: &str = "application/sparql-results+json";

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("invalid endpoint URL `{url}`: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("endpoint request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparqlHead {
    #[serde(default)]
    pub vars: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparqlBindings {
    #[serde(default)]
    pub bindings: Vec<Map<String, Value>>,
}

/// W3C SPARQL 1.1 JSON results: bindings for SELECT, `boolean` for ASK.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparqlResults {
    #[serde(default)]
    pub head: SparqlHead,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<SparqlBindings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boolean: Option<bool>,
}

impl SparqlResults {
    /// What a failed or skipped query is scored as.
    pub fn empty() -> Self {
        Self {
            head: SparqlHead::default(),
            results: Some(SparqlBindings::default()),
            boolean: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaldQuestionText {
    pub language: String,
    pub string: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaldQuery {
    pub sparql: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaldAnswerItem {
    pub id: String,
    pub question: Vec<QaldQuestionText>,
    pub query: QaldQuery,
    pub answers: Vec<SparqlResults>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QaldAnswerDocument {
    pub questions: Vec<QaldAnswerItem>,
}

#[derive(Debug, Clone)]
pub struct SparqlEndpoint {
    http: reqwest::Client,
    url: Url,
    timeout: Duration,
}

impl SparqlEndpoint {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, EndpointError> {
        let url = Url::parse(url).map_err(|source| EndpointError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        Ok(Self {
            http: reqwest::Client::new(),
            url,
            timeout,
        })
    }

    pub fn query_url(&self, query: &str) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair("query", query)
            .append_pair("format", "json");
        url
    }

    pub async fn query(&self, query: &str) -> Result<SparqlResults, EndpointError> {
        let resp = self
            .http
            .get(self.query_url(query))
            .header(reqwest::header::ACCEPT, SPARQL_RESULTS_JSON)
            .timeout(self.timeout)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EndpointError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json().await?)
    }
}

/// Pause `pause` after every `every` executed queries.
#[derive(Debug, Clone, Copy)]
pub struct Throttle {
    pub every: usize,
    pub pause: Duration,
}

/// Run every prediction in order. Failures become empty answers.
pub async fn execute_predictions(
    endpoint: &SparqlEndpoint,
    records: &[PredictionRecord],
    throttle: Option<Throttle>,
) -> QaldAnswerDocument {
    let mut doc = QaldAnswerDocument::default();
    let mut executed = 0usize;

    for record in records {
        let answer = if record.sparql.trim().is_empty() {
            tracing::debug!(id = %record.id, "no query to execute");
            SparqlResults::empty()
        } else {
            executed += 1;
            let result = match endpoint.query(&record.sparql).await {
                Ok(results) => results,
                Err(error) => {
                    tracing::warn!(id = %record.id, %error, "query execution failed");
                    SparqlResults::empty()
                }
            };
            if let Some(t) = throttle.filter(|t| t.every > 0) {
                if executed % t.every == 0 {
                    tracing::info!(executed, pause_secs = t.pause.as_secs_f64(), "pausing");
                    tokio::time::sleep(t.pause).await;
                }
            }
            result
        };

        doc.questions.push(QaldAnswerItem {
            id: record.id.clone(),
            question: vec![QaldQuestionText {
                language: "en".to_string(),
                string: record.question.clone(),
            }],
            query: QaldQuery {
                sparql: record.sparql.clone(),
            },
            answers: vec![answer],
        });
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::Technique;

    #[test]
    fn query_url_is_encoded() {
        let ep = SparqlEndpoint::new("https://dbpedia.org/sparql", Duration::from_secs(5)).unwrap();
        let url = ep.query_url("ASK { ?s ?p ?o }");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs[0], ("query".into(), "ASK { ?s ?p ?o }".into()));
        assert_eq!(pairs[1], ("format".into(), "json".into()));
        assert!(SparqlEndpoint::new("not a url", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn results_json_shapes() {
        let select: SparqlResults = serde_json::from_str(
            r#"{"head": {"vars": ["uri"]}, "results": {"bindings": [{"uri": {"type": "uri", "value": "http://dbpedia.org/resource/Paris"}}]}}"#,
        )
        .unwrap();
        assert_eq!(select.results.unwrap().bindings.len(), 1);
        let ask: SparqlResults = serde_json::from_str(r#"{"head": {}, "boolean": true}"#).unwrap();
        assert_eq!(ask.boolean, Some(true));
    }

    #[tokio::test]
    async fn empty_predictions_need_no_network() {
        let ep = SparqlEndpoint::new("http://127.0.0.1:9/sparql", Duration::from_millis(100)).unwrap();
        let record = PredictionRecord {
            id: "7".into(),
            question: "Who?".into(),
            technique: Technique::ZeroShot,
            provider: "mock".into(),
            model: "mock".into(),
            sparql: String::new(),
            attempts: 1,
            accepted: false,
            status: None,
            error: Some("boom".into()),
            expected_sparql: None,
        };
        let doc = execute_predictions(&ep, &[record], None).await;
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["questions"][0]["id"], "7");
        assert_eq!(json["questions"][0]["question"][0]["language"], "en");
        assert_eq!(
            json["questions"][0]["answers"][0]["results"]["bindings"],
            serde_json::json!([])
        );
    }
}
