//! Retrying HTTP client that pushes sponsor records into a running
//! SponsorHub instance through its authenticated JSON API.

use std::time::Duration;

use anyhow::Context;
use reqwest::{header, StatusCode};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

/// What the importer does after one failed sponsor POST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImportAttempt {
    RetryLater,
    GiveUp,
}

impl ImportAttempt {
    /// A rejected sponsor (validation, duplicate id, expired session) fails
    /// the same way on every try; an overloaded or restarting server may not.
    fn after_status(status: StatusCode) -> Self {
        match status {
            StatusCode::TOO_MANY_REQUESTS => Self::RetryLater,
            s if s.is_server_error() => Self::RetryLater,
            _ => Self::GiveUp,
        }
    }

    fn after_transport_error(err: &reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            Self::RetryLater
        } else {
            Self::GiveUp
        }
    }
}

/// Pause between import attempts: `base_delay * 2^retry`, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    /// Three attempts per sponsor.
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    fn pause_before_retry(&self, retry: usize) -> Duration {
        u32::try_from(retry)
            .ok()
            .and_then(|exp| 2u32.checked_pow(exp))
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: Some(format!("sponsorhub/{}", env!("CARGO_PKG_VERSION"))),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl HttpClientConfig {
    /// Redirects are never followed: the login exchange needs the raw 303
    /// to read its `Set-Cookie`.
    pub fn build_client(&self) -> anyhow::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(self.timeout)
            .redirect(reqwest::redirect::Policy::none());
        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        builder.build().context("building reqwest client")
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("login rejected (status {status})")]
    LoginRejected { status: u16 },
}

/// `Set-Cookie: sponsorhub.sid=abc.def; Path=/; HttpOnly` -> `sponsorhub.sid=abc.def`.
pub fn session_cookie_from_header(raw: &str) -> Option<String> {
    let pair = raw.split(';').next()?.trim();
    if pair.contains('=') && !pair.starts_with('=') {
        Some(pair.to_string())
    } else {
        None
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportSummary {
    pub total: usize,
    pub created: usize,
    pub failures: Vec<ImportFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportFailure {
    pub index: usize,
    pub label: String,
    pub error: String,
}

pub struct SponsorImporter {
    client: reqwest::Client,
    base_url: String,
    backoff: BackoffPolicy,
    session_cookie: Option<String>,
}

impl SponsorImporter {
    pub fn new(base_url: &str, config: &HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: config.build_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            backoff: config.backoff,
            session_cookie: None,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn login(&mut self, email: &str, password: &str) -> Result<(), FetchError> {
        let resp = self
            .client
            .post(self.url("/login"))
            .form(&[("email", email), ("password", password)])
            .send()
            .await?;
        let status = resp.status();
        let cookie = resp
            .headers()
            .get(header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .and_then(session_cookie_from_header);
        match cookie {
            Some(cookie) => {
                self.session_cookie = Some(cookie);
                Ok(())
            }
            None => Err(FetchError::LoginRejected {
                status: status.as_u16(),
            }),
        }
    }

    /// POSTs one sponsor, retrying transport errors and 5xx/429 with backoff.
    pub async fn post_sponsor(&self, sponsor: &Value) -> Result<Value, FetchError> {
        let url = self.url("/api/sponsors");
        let mut attempt = 0;
        loop {
            let mut request = self.client.post(&url).json(sponsor);
            if let Some(cookie) = &self.session_cookie {
                request = request.header(header::COOKIE, cookie);
            }

            let retryable = match request.send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp.json().await?),
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    let err = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: url.clone(),
                        body: body.chars().take(200).collect(),
                    };
                    (ImportAttempt::after_status(status), err)
                }
                Err(err) => (ImportAttempt::after_transport_error(&err), FetchError::Request(err)),
            };

            match retryable {
                (ImportAttempt::RetryLater, err) if attempt < self.backoff.max_retries => {
                    warn!(attempt, error = %err, "sponsor import attempt failed; retrying");
                    tokio::time::sleep(self.backoff.pause_before_retry(attempt)).await;
                    attempt += 1;
                }
                (_, err) => return Err(err),
            }
        }
    }

    pub async fn import_all(&self, sponsors: &[Value]) -> ImportSummary {
        let mut summary = ImportSummary {
            total: sponsors.len(),
            ..Default::default()
        };
        for (index, sponsor) in sponsors.iter().enumerate() {
            let label = sponsor_label(sponsor, index);
            let span = info_span!("import_sponsor", index, label = %label);
            match self.post_sponsor(sponsor).instrument(span).await {
                Ok(saved) => {
                    summary.created += 1;
                    info!(
                        "imported {}/{}: {}",
                        index + 1,
                        sponsors.len(),
                        sponsor_label(&saved, index)
                    );
                }
                Err(err) => summary.failures.push(ImportFailure {
                    index,
                    label,
                    error: err.to_string(),
                }),
            }
        }
        summary
    }
}

fn sponsor_label(sponsor: &Value, index: usize) -> String {
    ["id", "company", "name"]
        .iter()
        .find_map(|key| sponsor.get(key).and_then(Value::as_str).filter(|s| !s.is_empty()))
        .map(str::to_string)
        .unwrap_or_else(|| format!("#{index}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pauses_double_until_the_cap() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(1500),
        };
        let pauses: Vec<_> = (0..3).map(|retry| policy.pause_before_retry(retry)).collect();
        assert_eq!(
            pauses,
            [500, 1000, 1500].map(Duration::from_millis).to_vec()
        );
        assert_eq!(policy.pause_before_retry(40), Duration::from_millis(1500));
        assert_eq!(BackoffPolicy::default().max_retries + 1, 3);
    }

    #[test]
    fn rejected_sponsors_are_not_retried() {
        for status in [StatusCode::BAD_REQUEST, StatusCode::UNAUTHORIZED, StatusCode::CONFLICT] {
            assert_eq!(ImportAttempt::after_status(status), ImportAttempt::GiveUp, "{status}");
        }
        for status in [StatusCode::TOO_MANY_REQUESTS, StatusCode::BAD_GATEWAY, StatusCode::SERVICE_UNAVAILABLE] {
            assert_eq!(ImportAttempt::after_status(status), ImportAttempt::RetryLater, "{status}");
        }
    }

    #[test]
    fn session_cookie_is_the_first_pair() {
        assert_eq!(
            session_cookie_from_header("sponsorhub.sid=abc.def; Path=/; HttpOnly; SameSite=Lax"),
            Some("sponsorhub.sid=abc.def".to_string())
        );
        assert_eq!(session_cookie_from_header("; Path=/"), None);
    }

    #[test]
    fn labels_prefer_id_then_company() {
        assert_eq!(sponsor_label(&json!({"id": "id-1", "company": "Acme"}), 0), "id-1");
        assert_eq!(sponsor_label(&json!({"company": "Acme"}), 0), "Acme");
        assert_eq!(sponsor_label(&json!({}), 4), "#4");
    }
}
