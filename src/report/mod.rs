//! Control-plane report client.
//!
//! Authenticated JSON POST with bounded retries. The shared token and cloud
//! id are injected at the top level of the body next to the hot-key batch.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{REPORT_ATTEMPTS, REPORT_BACKOFF, REPORT_TIMEOUT};

/// Report sink path under the API base URL.
const REPORT_PATH: &str = "/apis/proxypass/create_analysis_report/";

/// One reported hot key.
#[derive(Debug, Clone, Serialize)]
pub struct HotKeyInfo {
    pub ticket_id: i64,
    pub record_id: i64,
    pub bk_biz_id: i64,
    pub cluster_id: i64,
    /// Observed endpoint, `<ip>:<port>`.
    pub ins: String,
    pub key: String,
    /// `"cmd1:n1 cmd2:n2 "`; the trailing space is part of the format.
    pub cmd_info: String,
    pub exec_count: i64,
    /// Percentage of the instance's total requests, two decimals.
    pub ratio: String,
}

#[derive(Serialize)]
struct ReportBody<'a> {
    db_cloud_token: &'a str,
    bk_cloud_id: i64,
    hot_key_infos: &'a [HotKeyInfo],
}

/// Control-plane response envelope. Any non-zero `code` is an
/// application-level rejection.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    #[allow(dead_code)]
    data: serde_json::Value,
}

/// Report delivery failure.
#[derive(Error, Debug)]
pub enum ReportError {
    /// The API answered HTTP 200 with a non-zero code. Not retried.
    #[error("control-plane rejected report (code {code}): {message}")]
    Rejected { code: i64, message: String },

    /// Every attempt failed at the transport or HTTP level.
    #[error("control-plane unreachable after {attempts} attempts: {last}")]
    Unreachable { attempts: u32, last: String },
}

/// HTTP client for the control-plane report sink.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    url: String,
    token: String,
    bk_cloud_id: i64,
    attempts: u32,
    backoff: Duration,
}

impl Client {
    pub fn new(base_url: &str, token: &str, bk_cloud_id: i64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REPORT_TIMEOUT)
            .build()
            .context("building report HTTP client")?;

        Ok(Self {
            http,
            url: format!("{}{REPORT_PATH}", base_url.trim_end_matches('/')),
            token: token.to_string(),
            bk_cloud_id,
            attempts: REPORT_ATTEMPTS,
            backoff: REPORT_BACKOFF,
        })
    }

    /// Override the retry schedule. Used by tests to avoid real back-off
    /// sleeps.
    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }

    /// Deliver one batch, retrying transport and HTTP-status failures with a
    /// fixed back-off. Application-level rejections are final.
    pub async fn send(&self, hot_key_infos: &[HotKeyInfo]) -> Result<(), ReportError> {
        let body = ReportBody {
            db_cloud_token: &self.token,
            bk_cloud_id: self.bk_cloud_id,
            hot_key_infos,
        };

        let mut last = String::new();

        for attempt in 1..=self.attempts {
            match self.try_send(&body).await {
                Ok(()) => {
                    debug!(attempt, keys = hot_key_infos.len(), "report delivered");
                    return Ok(());
                }
                Err(SendError::Rejected { code, message }) => {
                    return Err(ReportError::Rejected { code, message });
                }
                Err(SendError::Transient(reason)) => {
                    warn!(attempt, max_attempts = self.attempts, %reason, "report attempt failed");
                    last = reason;

                    if attempt < self.attempts {
                        tokio::time::sleep(self.backoff).await;
                    }
                }
            }
        }

        Err(ReportError::Unreachable {
            attempts: self.attempts,
            last,
        })
    }

    async fn try_send(&self, body: &ReportBody<'_>) -> Result<(), SendError> {
        let resp = self
            .http
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| SendError::Transient(format!("sending report: {e}")))?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            return Err(SendError::Transient(format!("unexpected status: {status}")));
        }

        let envelope: ApiResponse = resp
            .json()
            .await
            .map_err(|e| SendError::Transient(format!("decoding response: {e}")))?;

        if envelope.code != 0 {
            return Err(SendError::Rejected {
                code: envelope.code,
                message: envelope.message,
            });
        }

        Ok(())
    }
}

enum SendError {
    Rejected { code: i64, message: String },
    Transient(String),
}
