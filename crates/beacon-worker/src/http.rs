//! In-process page probe over HTTP.
//!
//! Fetches the task URL with the task's timeout, user agent and headers,
//! follows redirects, and reports the final URL, status code and `<title>`.
//! Any HTTP status counts as a completed probe; only transport errors fail.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect::Policy;
use tracing::{debug, instrument};

use beacon_scheduler::{JobExecutor, JobPayload, RunFailure, RunReport, UnitError};

use crate::error::WorkerError;

/// Timeout applied when a task does not set one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// User agent sent when a task does not set one.
pub const DEFAULT_USER_AGENT: &str = concat!("beacon/", env!("CARGO_PKG_VERSION"));

const MAX_REDIRECTS: usize = 10;

/// Bytes of the response body searched for a `<title>`.
pub const MAX_BODY_SCAN: usize = 512 * 1024;

static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid title pattern"));

/// Page details gathered by one fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageProbe {
    pub final_url: String,
    pub http_status: u16,
    pub title: Option<String>,
}

/// Executor that probes pages with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    default_timeout: Duration,
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl HttpExecutor {
    /// Create an executor with a custom default timeout.
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    /// Fetch the job's URL.
    #[instrument(skip(self, job), fields(task_id = %job.task_id, run_index = job.run_index))]
    pub async fn probe(&self, job: &JobPayload) -> Result<PageProbe, WorkerError> {
        let options = &job.options;
        let timeout = options
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        let user_agent = options.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT);

        let mut headers = HeaderMap::new();
        for (name, value) in options.headers.iter().flatten() {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| WorkerError::InvalidHeader(name.clone()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| WorkerError::InvalidHeader(name.as_str().to_string()))?;
            headers.insert(name, value);
        }

        if options.screenshot == Some(true) {
            debug!("screenshots are not captured by the http probe");
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .default_headers(headers)
            .redirect(Policy::limited(MAX_REDIRECTS))
            .build()?;

        let mut response = client.get(&job.url).send().await?;
        let http_status = response.status().as_u16();
        let final_url = response.url().to_string();

        let mut body = Vec::new();
        while body.len() < MAX_BODY_SCAN {
            match response.chunk().await? {
                Some(chunk) => body.extend_from_slice(&chunk),
                None => break,
            }
        }
        body.truncate(MAX_BODY_SCAN);

        debug!(http_status, final_url = %final_url, scanned = body.len(), "probe finished");

        Ok(PageProbe {
            final_url,
            http_status,
            title: extract_title(&String::from_utf8_lossy(&body)),
        })
    }
}

#[async_trait]
impl JobExecutor for HttpExecutor {
    async fn execute(&self, job: JobPayload) -> Result<RunReport, UnitError> {
        let started_at = Utc::now();
        match self.probe(&job).await {
            Ok(page) => Ok(RunReport {
                started_at,
                ended_at: Utc::now(),
                title: page.title,
                final_url: Some(page.final_url),
                http_status: Some(page.http_status),
                screenshot_path: None,
            }),
            Err(e) => Err(UnitError::Reported(RunFailure {
                started_at: Some(started_at),
                ended_at: Some(Utc::now()),
                error_snippet: e.to_string(),
            })),
        }
    }
}

/// Text of the first `<title>` element, whitespace collapsed.
pub fn extract_title(html: &str) -> Option<String> {
    let raw = TITLE_RE.captures(html)?.get(1)?.as_str();
    let title = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    (!title.is_empty()).then_some(title)
}
