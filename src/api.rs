//! Remote graph API client.
//!
//! The harvester talks to a Graph-style REST API with two operations:
//!
//! - a single `GET {base}/{path}?access_token=...`
//! - a composite `POST {base}` carrying `access_token` and a `batch` form
//!   field (JSON array of `{method, relative_url}`), answered by a parallel
//!   array of `{code, body}` where `body` is itself a JSON string
//!
//! Listing responses carry `paging.next` as an absolute URL. It is reduced
//! to a path relative to the configured base (without the access token) so
//! it can be queued like any other call.
//!
//! Rate and batch limits are enforced by the [`Scheduler`](crate::scheduler::Scheduler),
//! never here.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::ApiConfig;
use crate::models::Page;

/// Failure of a single logical call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    /// Structured error payload returned by the API.
    #[error("API error {code}: {message}")]
    Remote { code: i64, message: String },
    /// No structured payload: connectivity, HTTP framing or decoding failed.
    #[error("connectivity error: {0}")]
    Transport(String),
}

/// Outcome of each item in a composite call, positionally aligned.
pub type BatchResults = Vec<Result<Page, CallError>>;

/// The remote data API.
///
/// `batch` returns `Err` only when the composite call itself failed at the
/// transport level; per-item failures are reported inside the results.
#[async_trait]
pub trait GraphApi: Send + Sync {
    async fn get(&self, path: &str) -> Result<Page, CallError>;

    async fn batch(&self, paths: &[String]) -> Result<BatchResults, CallError>;
}

#[derive(Debug, Serialize)]
struct BatchRequestItem<'a> {
    method: &'static str,
    relative_url: &'a str,
}

#[derive(Debug, Deserialize)]
struct BatchResponseItem {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    body: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════
// HTTP implementation
// ═══════════════════════════════════════════════════════════════════════

/// [`GraphApi`] over HTTPS with `reqwest`.
pub struct HttpGraphApi {
    client: reqwest::Client,
    base_url: Url,
    access_token: String,
}

impl HttpGraphApi {
    pub fn new(config: &ApiConfig, access_token: String) -> Result<Self> {
        let base_url = parse_base_url(&config.base_url)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url,
            access_token,
        })
    }
}

#[async_trait]
impl GraphApi for HttpGraphApi {
    async fn get(&self, path: &str) -> Result<Page, CallError> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|e| CallError::Transport(format!("invalid path '{}': {}", path, e)))?;
        url.query_pairs_mut()
            .append_pair("access_token", &self.access_token);

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CallError::Transport(e.to_string()))?;
        let status = resp.status().as_u16() as i64;
        let body = resp
            .text()
            .await
            .map_err(|e| CallError::Transport(e.to_string()))?;

        parse_body(status, &body, &self.base_url)
    }

    async fn batch(&self, paths: &[String]) -> Result<BatchResults, CallError> {
        let items: Vec<BatchRequestItem> = paths
            .iter()
            .map(|path| BatchRequestItem {
                method: "GET",
                relative_url: path,
            })
            .collect();
        let batch_json =
            serde_json::to_string(&items).map_err(|e| CallError::Transport(e.to_string()))?;

        let resp = self
            .client
            .post(self.base_url.clone())
            .form(&[
                ("access_token", self.access_token.as_str()),
                ("batch", batch_json.as_str()),
            ])
            .send()
            .await
            .map_err(|e| CallError::Transport(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| CallError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(CallError::Transport(format!(
                "batch request failed (HTTP {}): {}",
                status,
                text.chars().take(300).collect::<String>()
            )));
        }

        parse_batch_response(&text, paths.len(), &self.base_url)
    }
}

pub fn parse_base_url(base_url: &str) -> Result<Url> {
    let mut base = base_url.to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    Url::parse(&base).with_context(|| format!("Invalid API base URL: {}", base_url))
}

/// Parse the body of one call (single GET or one batch item).
pub fn parse_body(status: i64, body: &str, base_url: &Url) -> Result<Page, CallError> {
    let value: Value = serde_json::from_str(body).map_err(|e| {
        CallError::Transport(format!("unparseable response body (HTTP {}): {}", status, e))
    })?;

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(status);
        return Err(CallError::Remote { code, message });
    }

    if !(200..300).contains(&status) {
        return Err(CallError::Remote {
            code: status,
            message: format!("HTTP {}", status),
        });
    }

    let next = value
        .get("paging")
        .and_then(|paging| paging.get("next"))
        .and_then(Value::as_str)
        .and_then(|next| relative_path(next, base_url));

    Ok(Page { body: value, next })
}

fn parse_batch_response(
    text: &str,
    expected: usize,
    base_url: &Url,
) -> Result<BatchResults, CallError> {
    let items: Vec<Option<BatchResponseItem>> = serde_json::from_str(text)
        .map_err(|e| CallError::Transport(format!("unparseable batch response: {}", e)))?;

    let mut results: BatchResults = items
        .into_iter()
        .take(expected)
        .map(|item| match item {
            Some(BatchResponseItem {
                code,
                body: Some(body),
            }) => parse_body(code.unwrap_or(200), &body, base_url),
            // The API answers null for items it gave up on
            _ => Err(CallError::Transport("no response for batch item".into())),
        })
        .collect();

    while results.len() < expected {
        results.push(Err(CallError::Transport(
            "batch response shorter than request".into(),
        )));
    }

    Ok(results)
}

/// Reduce a continuation URL to a path relative to `base_url`, dropping the
/// access token. Returns `None` if the URL points at another host.
pub fn relative_path(next: &str, base_url: &Url) -> Option<String> {
    let url = base_url.join(next).ok()?;
    if url.host_str() != base_url.host_str() {
        return None;
    }

    let path = url
        .path()
        .strip_prefix(base_url.path())
        .unwrap_or_else(|| url.path().trim_start_matches('/'));

    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != "access_token")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    if pairs.is_empty() {
        return Some(path.to_string());
    }

    let mut query = url.clone();
    query.set_query(None);
    query.query_pairs_mut().extend_pairs(pairs);
    Some(format!("{}?{}", path, query.query().unwrap_or_default()))
}

// ═══════════════════════════════════════════════════════════════════════
// Fixture implementation
// ═══════════════════════════════════════════════════════════════════════

/// One batch as seen by [`FixtureGraphApi`].
#[derive(Debug, Clone)]
pub struct RecordedBatch {
    pub at: tokio::time::Instant,
    pub paths: Vec<String>,
}

/// In-memory [`GraphApi`] answering from canned bodies keyed by relative
/// path. Bodies go through the same parsing as HTTP responses, so paging
/// URLs and error payloads behave exactly like the real API.
pub struct FixtureGraphApi {
    base_url: Url,
    bodies: Mutex<HashMap<String, Value>>,
    failing_batches: Mutex<usize>,
    batches: Mutex<Vec<RecordedBatch>>,
    gets: Mutex<Vec<String>>,
}

impl FixtureGraphApi {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            base_url: parse_base_url(base_url)?,
            bodies: Mutex::new(HashMap::new()),
            failing_batches: Mutex::new(0),
            batches: Mutex::new(Vec::new()),
            gets: Mutex::new(Vec::new()),
        })
    }

    /// Answer `path` with `body` (a listing, an object, or an `error` payload).
    pub fn respond(&self, path: &str, body: Value) {
        self.bodies.lock().unwrap().insert(path.to_string(), body);
    }

    /// Fail the next `n` composite calls at the transport level.
    pub fn fail_next_batches(&self, n: usize) {
        *self.failing_batches.lock().unwrap() = n;
    }

    pub fn batches(&self) -> Vec<RecordedBatch> {
        self.batches.lock().unwrap().clone()
    }

    pub fn dispatched_paths(&self) -> Vec<String> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|batch| batch.paths.clone())
            .collect()
    }

    pub fn gets(&self) -> Vec<String> {
        self.gets.lock().unwrap().clone()
    }

    fn answer(&self, path: &str) -> Result<Page, CallError> {
        let body = self.bodies.lock().unwrap().get(path).cloned();
        match body {
            Some(body) => parse_body(200, &body.to_string(), &self.base_url),
            None => Err(CallError::Remote {
                code: 404,
                message: format!("Unknown path: {}", path),
            }),
        }
    }
}

#[async_trait]
impl GraphApi for FixtureGraphApi {
    async fn get(&self, path: &str) -> Result<Page, CallError> {
        self.gets.lock().unwrap().push(path.to_string());
        self.answer(path)
    }

    async fn batch(&self, paths: &[String]) -> Result<BatchResults, CallError> {
        self.batches.lock().unwrap().push(RecordedBatch {
            at: tokio::time::Instant::now(),
            paths: paths.to_vec(),
        });

        {
            let mut failing = self.failing_batches.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(CallError::Transport("connection reset".into()));
            }
        }

        Ok(paths.iter().map(|path| self.answer(path)).collect())
    }
}
