//! HTTP server.
//!
//! A thin hyper front end over [`Text2SparqlService`]; every request runs its
//! own session and nothing is shared between requests except the config and
//! the model router.
//!
//! Routes
//! ------
//! - `GET /healthz`
//! - `GET /config`: effective configuration (API keys are never serialised)
//! - `POST /generate`: `{question, provider?, model?, technique?, plan?,
//!   max_corrections?, include_trace?}`
//! - `POST /plan`: `{question, provider?, model?}`
//!
//! Errors are `{"error": "...", "kind": "..."}`: 400 for bad requests, 502
//! when the provider failed, 500 otherwise.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpListener;

use text2sparql_engine::{GenerateRequest, PlanRequest, ServiceError, Text2SparqlService};

pub(crate) async fn serve(
    service: Text2SparqlService,
    listen: SocketAddr,
    ready_file: Option<PathBuf>,
) -> Result<()> {
    let service = Arc::new(service);
    let listener = TcpListener::bind(listen)
        .await
        .map_err(|e| anyhow!("serve: failed to bind {listen}: {e}"))?;
    let bound = listener
        .local_addr()
        .map_err(|e| anyhow!("serve: failed to read bound addr: {e}"))?;

    tracing::info!(
        addr = %bound,
        provider = %service.config().default_provider,
        technique = %service.config().default_technique,
        "listening"
    );
    eprintln!("serve: listening on http://{bound}");
    if let Some(path) = ready_file.as_deref() {
        write_ready_file(path, bound);
    }

    loop {
        let (stream, _peer) = listener
            .accept()
            .await
            .map_err(|e| anyhow!("serve: accept failed: {e}"))?;
        let io = TokioIo::new(stream);
        let service = Arc::clone(&service);

        tokio::spawn(async move {
            let svc = service_fn(move |req| handle_request(req, Arc::clone(&service)));
            if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                tracing::warn!(error = %e, "connection error");
            }
        });
    }
}

fn write_ready_file(path: &Path, bound: SocketAddr) {
    let payload = serde_json::json!({
        "version": "text2sparql_server_ready_v1",
        "addr": bound.to_string(),
        "pid": std::process::id(),
    });
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::write(path, payload.to_string()) {
        tracing::warn!(path = %path.display(), error = %e, "failed to write ready file");
    }
}

async fn handle_request(
    req: Request<Incoming>,
    service: Arc<Text2SparqlService>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let resp = match (method.clone(), path.as_str()) {
        (Method::GET, "/healthz") => text_response(StatusCode::OK, "ok\n"),
        (Method::GET, "/config") => json_response(StatusCode::OK, service.config()),
        (Method::POST, "/generate") => match read_json::<GenerateRequest>(req).await? {
            Ok(request) => match service.generate(request).await {
                Ok(v) => json_response(StatusCode::OK, &v),
                Err(e) => service_error(&e),
            },
            Err(resp) => resp,
        },
        (Method::POST, "/plan") => match read_json::<PlanRequest>(req).await? {
            Ok(request) => match service.plan(request).await {
                Ok(v) => json_response(StatusCode::OK, &v),
                Err(e) => service_error(&e),
            },
            Err(resp) => resp,
        },
        (_, "/generate" | "/plan" | "/healthz" | "/config") => json_error(
            StatusCode::METHOD_NOT_ALLOWED,
            "method_not_allowed",
            &format!("{method} not allowed on {path}"),
        ),
        _ => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
    };

    tracing::info!(
        %method,
        %path,
        status = resp.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    Ok(resp)
}

/// Body as `T`, or a ready 400 response.
async fn read_json<T: DeserializeOwned>(
    req: Request<Incoming>,
) -> Result<Result<T, Response<Full<Bytes>>>, hyper::Error> {
    let body = req.into_body().collect().await?.to_bytes();
    Ok(serde_json::from_slice(&body).map_err(|e| {
        json_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            &format!("invalid request body: {e}"),
        )
    }))
}

fn error_status(e: &ServiceError) -> StatusCode {
    if e.is_client_error() {
        return StatusCode::BAD_REQUEST;
    }
    match e.kind() {
        "provider_error" | "planning_failed" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn service_error(e: &ServiceError) -> Response<Full<Bytes>> {
    let status = error_status(e);
    tracing::warn!(kind = e.kind(), status = status.as_u16(), error = %e, "request failed");
    let mut body = serde_json::json!({ "error": e.to_string(), "kind": e.kind() });
    if let Some(upstream) = e.upstream_status() {
        body["upstream_status"] = upstream.into();
    }
    json_response(status, &body)
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from_static(b"internal error"))))
}

fn json_response<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{\"error\":\"serialize\"}".to_vec());
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from_static(b"{\"error\":\"internal\"}"))))
}

fn json_error(status: StatusCode, kind: &str, msg: &str) -> Response<Full<Bytes>> {
    let v = serde_json::json!({ "error": msg, "kind": kind });
    json_response(status, &v)
}
