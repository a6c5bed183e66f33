//! Warms the cache from a JSON batch of synthetic requests.
//!
//! Accepted bodies are either `{"requests": [...]}` or a bare array. Every item is validated
//! before any of them is fetched, so a malformed batch has no side effects.

use std::collections::BTreeMap;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::metrics;
use crate::proxy::headers::{HeaderDisposition, classify_request_header};
use crate::proxy::pipeline::{CachePipeline, StoreStatus};
use crate::proxy::request::ProxyRequest;

#[derive(Debug, Error)]
pub enum PreseedError {
    #[error("malformed preseed batch: {0}")]
    BadRequest(String),
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SeedItem {
    #[serde(default = "default_method")]
    method: String,
    target: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SeedBatch {
    Wrapped { requests: Vec<SeedItem> },
    Bare(Vec<SeedItem>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedOutcome {
    AlreadyCached,
    Fetched,
    Failed,
}

impl SeedOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeedOutcome::AlreadyCached => "already_cached",
            SeedOutcome::Fetched => "fetched",
            SeedOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SeedItemReport {
    pub method: String,
    pub target: String,
    pub key: Option<String>,
    pub outcome: SeedOutcome,
    pub status: Option<u16>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PreseedSummary {
    pub cached: usize,
    pub fetched: usize,
    pub failed: usize,
    pub items: Vec<SeedItemReport>,
}

impl PreseedSummary {
    fn push(&mut self, report: SeedItemReport) {
        match report.outcome {
            SeedOutcome::AlreadyCached => self.cached += 1,
            SeedOutcome::Fetched => self.fetched += 1,
            SeedOutcome::Failed => self.failed += 1,
        }
        metrics::record_preseed_item(report.outcome.as_str());
        self.items.push(report);
    }
}

/// Parses and validates a whole batch into requests.
pub fn parse_batch(body: &[u8]) -> Result<Vec<ProxyRequest>, PreseedError> {
    let batch: SeedBatch = serde_json::from_slice(body)
        .map_err(|err| PreseedError::BadRequest(format!("invalid JSON: {err}")))?;
    let items = match batch {
        SeedBatch::Wrapped { requests } => requests,
        SeedBatch::Bare(items) => items,
    };
    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            to_request(item)
                .map_err(|reason| PreseedError::BadRequest(format!("item {index}: {reason}")))
        })
        .collect()
}

fn to_request(item: SeedItem) -> Result<ProxyRequest, String> {
    let method = Method::from_bytes(item.method.trim().to_ascii_uppercase().as_bytes())
        .map_err(|_| format!("invalid method '{}'", item.method))?;
    if !item.target.starts_with('/') {
        return Err(format!("target '{}' must start with '/'", item.target));
    }
    item.target
        .parse::<http::uri::PathAndQuery>()
        .map_err(|_| format!("invalid target '{}'", item.target))?;

    let mut headers = HeaderMap::new();
    for (name, value) in &item.headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| format!("invalid header name '{name}'"))?;
        if classify_request_header(header_name.as_str()) != HeaderDisposition::Forward {
            continue;
        }
        let header_value = HeaderValue::from_str(value)
            .map_err(|_| format!("invalid value for header '{name}'"))?;
        headers.append(header_name, header_value);
    }

    let body = item.body.map(Bytes::from).unwrap_or_default();
    Ok(ProxyRequest::new(method, item.target)
        .with_headers(headers)
        .with_body(body))
}

/// Drives each request through the cache pipeline in order. Item failures are reported in the
/// summary and never abort the batch.
pub async fn run_batch(pipeline: &CachePipeline, requests: Vec<ProxyRequest>) -> PreseedSummary {
    let mut summary = PreseedSummary::default();
    for request in requests {
        let method = request.method.to_string();
        let target = request.target.clone();
        let key = match pipeline.resolve(&request).await {
            Ok(key) => key,
            Err(err) => {
                summary.push(SeedItemReport {
                    method,
                    target,
                    key: None,
                    outcome: SeedOutcome::Failed,
                    status: Some(err.status().as_u16()),
                    error: Some(err.to_string()),
                });
                continue;
            }
        };

        let report = match pipeline.serve_key(key.clone(), request).await {
            Ok(served) => {
                let (outcome, error) = match served.store {
                    None => (SeedOutcome::AlreadyCached, None),
                    Some(StoreStatus::PersistFailed) => (
                        SeedOutcome::Failed,
                        Some("fetched but failed to persist".to_string()),
                    ),
                    Some(StoreStatus::Stored | StoreStatus::Exists) => (SeedOutcome::Fetched, None),
                };
                SeedItemReport {
                    method,
                    target,
                    key: Some(served.key.to_string()),
                    outcome,
                    status: Some(served.entry.status.as_u16()),
                    error,
                }
            }
            Err(err) => {
                warn!(key = %key, target = %target, error = %err, "preseed item failed");
                SeedItemReport {
                    method,
                    target,
                    key: Some(key.to_string()),
                    outcome: SeedOutcome::Failed,
                    status: Some(err.status().as_u16()),
                    error: Some(err.to_string()),
                }
            }
        };
        summary.push(report);
    }
    info!(
        cached = summary.cached,
        fetched = summary.fetched,
        failed = summary.failed,
        "preseed batch finished"
    );
    summary
}
