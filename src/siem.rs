//! SIEM enrichment client.
//!
//! Thin request/response adapter over the SIEM's query endpoint. Enrichment
//! failures never propagate into the pipeline: every failure mode degrades
//! to the no-op sentinel (`SiemResult::default()`) with a structured
//! warning.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::SiemConfig;
use crate::models::{KillReport, SiemResult};

const MAX_RECOMMENDATION_BYTES: usize = 1024;
const QUERY_WINDOW_HOURS: u32 = 24;

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    kill_id: &'a str,
    target_module: &'a str,
    window_hours: u32,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    risk_score: f64,
    false_positive_history: u32,
    recommendation: String,
}

enum SiemAuth {
    Bearer(String),
    Basic { username: String, password: String },
    None,
}

pub enum SiemClient {
    Http(HttpSiemClient),
    Noop,
    /// Canned response, for tests and local experiments.
    Fixed(SiemResult),
}

pub struct HttpSiemClient {
    base_url: String,
    timeout: Duration,
    auth: SiemAuth,
    client: reqwest::Client,
}

impl SiemClient {
    /// Build a client from config. Credentials come from the environment
    /// only (`SIEM_TOKEN`, or `SIEM_USERNAME`/`SIEM_PASSWORD`); they are
    /// never read from config files or written to logs.
    pub fn from_config(config: &SiemConfig) -> Self {
        if !config.enabled || config.base_url.is_empty() {
            tracing::info!("SIEM enrichment disabled, using no-op client");
            return Self::Noop;
        }

        let auth = if let Ok(token) = std::env::var("SIEM_TOKEN") {
            SiemAuth::Bearer(token)
        } else if let (Ok(username), Ok(password)) =
            (std::env::var("SIEM_USERNAME"), std::env::var("SIEM_PASSWORD"))
        {
            SiemAuth::Basic { username, password }
        } else {
            tracing::warn!("SIEM enabled but no credentials in environment");
            SiemAuth::None
        };

        let timeout = Duration::from_millis(config.timeout_ms);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        tracing::info!(base_url = %config.base_url, "SIEM enrichment enabled");
        Self::Http(HttpSiemClient {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout,
            auth,
            client,
        })
    }

    /// Enrich a kill report. Infallible by contract: returns the no-op
    /// sentinel on any failure.
    pub async fn enrich(&self, report: &KillReport) -> SiemResult {
        match self {
            Self::Noop => SiemResult::default(),
            Self::Fixed(result) => result.clone(),
            Self::Http(client) => client.enrich(report).await,
        }
    }
}

impl HttpSiemClient {
    async fn enrich(&self, report: &KillReport) -> SiemResult {
        let url = format!("{}/query", self.base_url);
        let body = QueryRequest {
            kill_id: &report.kill_id,
            target_module: &report.target_module,
            window_hours: QUERY_WINDOW_HOURS,
        };

        match self.query_once(&url, &body).await {
            QueryAttempt::Done(result) => result,
            QueryAttempt::RateLimited(retry_after) => {
                // Back off once on 429, then fall back to the sentinel.
                tokio::time::sleep(retry_after).await;
                match self.query_once(&url, &body).await {
                    QueryAttempt::Done(result) => result,
                    _ => {
                        tracing::warn!(
                            kill_id = %report.kill_id,
                            "SIEM still rate-limited after backoff, using defaults"
                        );
                        SiemResult::default()
                    }
                }
            }
        }
    }

    async fn query_once(&self, url: &str, body: &QueryRequest<'_>) -> QueryAttempt {
        let mut request = self.client.post(url).json(body);
        request = match &self.auth {
            SiemAuth::Bearer(token) => request.bearer_auth(token),
            SiemAuth::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            SiemAuth::None => request,
        };

        let response = match request.send().await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(
                    kill_id = body.kill_id,
                    target_module = body.target_module,
                    error = %e,
                    "SIEM query failed, using defaults"
                );
                return QueryAttempt::Done(SiemResult::default());
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(1))
                .min(self.timeout);
            tracing::warn!(
                kill_id = body.kill_id,
                retry_after_s = retry_after.as_secs(),
                "SIEM rate-limited"
            );
            return QueryAttempt::RateLimited(retry_after);
        }

        if !status.is_success() {
            tracing::warn!(
                kill_id = body.kill_id,
                status = status.as_u16(),
                "SIEM returned error status, using defaults"
            );
            return QueryAttempt::Done(SiemResult::default());
        }

        match response.json::<QueryResponse>().await {
            Ok(payload) => QueryAttempt::Done(SiemResult {
                risk_score: payload.risk_score.clamp(0.0, 1.0),
                false_positive_history: payload.false_positive_history,
                recommendation: truncate_utf8(payload.recommendation, MAX_RECOMMENDATION_BYTES),
            }),
            Err(e) => {
                tracing::warn!(
                    kill_id = body.kill_id,
                    error = %e,
                    "SIEM response unparseable, using defaults"
                );
                QueryAttempt::Done(SiemResult::default())
            }
        }
    }
}

enum QueryAttempt {
    Done(SiemResult),
    RateLimited(Duration),
}

/// Truncate a string to at most `max` bytes on a char boundary.
fn truncate_utf8(mut s: String, max: usize) -> String {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
    s
}
