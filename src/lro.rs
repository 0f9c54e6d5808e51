use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::PipexResult;
use crate::context::Context;
use crate::error::Error;
use crate::pipeline::Pipeline;
use crate::request::Request;
use crate::util::{parse_retry_after, truncate_body};

const MONITOR_HEADERS: [&str; 3] = ["operation-location", "azure-asyncoperation", "location"];
const POLL_SUCCESS_STATUSES: [u16; 4] = [200, 201, 202, 204];

/// Lifecycle of a server-side long-running operation. Terminal states are
/// absorbing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    NotStarted,
    InProgress,
    Succeeded,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Parses the status-field spellings control planes use.
    pub fn parse(text: &str) -> Option<Self> {
        let normalized = text.trim();
        if normalized.eq_ignore_ascii_case("NotStarted") {
            Some(Self::NotStarted)
        } else if normalized.eq_ignore_ascii_case("InProgress")
            || normalized.eq_ignore_ascii_case("Running")
        {
            Some(Self::InProgress)
        } else if normalized.eq_ignore_ascii_case("Succeeded") {
            Some(Self::Succeeded)
        } else if normalized.eq_ignore_ascii_case("Failed") {
            Some(Self::Failed)
        } else if normalized.eq_ignore_ascii_case("Canceled")
            || normalized.eq_ignore_ascii_case("Cancelled")
        {
            Some(Self::Cancelled)
        } else {
            None
        }
    }
}

/// Extracts an [`OperationStatus`] from a poll response. Endpoints report
/// status through two conventions — a `status` field in the body, or the
/// HTTP status code alone — and upstream fixes no precedence between them,
/// so the extraction is pluggable rather than hard-coded.
pub trait StatusStrategy: Send + Sync + std::fmt::Debug {
    fn status(
        &self,
        http_status: StatusCode,
        headers: &HeaderMap,
        body: &[u8],
    ) -> PipexResult<OperationStatus>;
}

/// Reads the body's `status` field, falling back to the HTTP status code
/// when the body carries none.
#[derive(Clone, Copy, Debug, Default)]
pub struct BodyStatus;

impl StatusStrategy for BodyStatus {
    fn status(
        &self,
        http_status: StatusCode,
        headers: &HeaderMap,
        body: &[u8],
    ) -> PipexResult<OperationStatus> {
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body)
            && let Some(text) = value.get("status").and_then(|status| status.as_str())
            && let Some(status) = OperationStatus::parse(text)
        {
            return Ok(status);
        }
        HttpStatus.status(http_status, headers, body)
    }
}

/// Maps the HTTP status code alone: 202 is in progress, success codes are
/// terminal success, anything else is failure.
#[derive(Clone, Copy, Debug, Default)]
pub struct HttpStatus;

impl StatusStrategy for HttpStatus {
    fn status(
        &self,
        http_status: StatusCode,
        _headers: &HeaderMap,
        _body: &[u8],
    ) -> PipexResult<OperationStatus> {
        if http_status == StatusCode::ACCEPTED {
            return Ok(OperationStatus::InProgress);
        }
        if http_status.is_success() {
            return Ok(OperationStatus::Succeeded);
        }
        Ok(OperationStatus::Failed)
    }
}

/// Data-only snapshot of one tracked operation: everything needed to keep
/// polling, and nothing tied to the initial call context. Its JSON encoding
/// is the resume token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperationState {
    pub status: OperationStatus,
    /// Status-monitor URL polled while in progress; `None` when the
    /// initial response was already terminal.
    pub monitor_url: Option<String>,
    /// Resource fetched once after success when the status payload does
    /// not embed the result.
    pub resource_url: Option<String>,
    /// Last server-provided delay hint.
    pub poll_interval: Option<Duration>,
}

/// Per-poller options; everything falls back to the pipeline's defaults.
#[derive(Clone, Default)]
pub struct PollerOptions {
    pub poll_interval: Option<Duration>,
    pub resource_url: Option<String>,
    pub strategy: Option<Arc<dyn StatusStrategy>>,
}

impl std::fmt::Debug for PollerOptions {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("PollerOptions")
            .field("poll_interval", &self.poll_interval)
            .field("resource_url", &self.resource_url)
            .finish()
    }
}

impl PollerOptions {
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = Some(poll_interval.max(Duration::from_millis(1)));
        self
    }

    pub fn resource_url(mut self, resource_url: impl Into<String>) -> Self {
        self.resource_url = Some(resource_url.into());
        self
    }

    pub fn strategy(mut self, strategy: Arc<dyn StatusStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

/// Deserializes the operation's final result from a buffered payload.
pub type ResultDeserializer<T> = Arc<dyn Fn(&Bytes) -> PipexResult<T> + Send + Sync>;

/// JSON deserializer for the common case.
pub fn json_deserializer<T>() -> ResultDeserializer<T>
where
    T: DeserializeOwned,
{
    Arc::new(|body: &Bytes| {
        serde_json::from_slice(body).map_err(|source| Error::Deserialize {
            source,
            body: truncate_body(body),
        })
    })
}

struct LastPoll {
    http_status: u16,
    body: Bytes,
}

/// Drives a long-running operation to completion: initial call, poll loop
/// against the status monitor, one optional final fetch, terminal result.
///
/// The poller never spawns background work; the poll loop suspends in the
/// caller's context between polls. A poller is resumable: the token from
/// [`resume_token`](Poller::resume_token) reconstructs an equivalent
/// poller — in this process or another — that continues polling without
/// re-issuing the side-effecting initial request.
pub struct Poller<T> {
    pipeline: Pipeline,
    context: Context,
    state: OperationState,
    strategy: Arc<dyn StatusStrategy>,
    deserializer: ResultDeserializer<T>,
    poll_interval: Duration,
    cancellation: CancellationToken,
    last: Option<LastPoll>,
}

impl<T> std::fmt::Debug for Poller<T> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Poller")
            .field("state", &self.state)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl<T> Poller<T> {
    /// Issues the initial — possibly mutating — request exactly once and
    /// wraps its response in a poller.
    pub async fn begin(
        pipeline: Pipeline,
        context: Context,
        request: Request,
        options: PollerOptions,
        deserializer: ResultDeserializer<T>,
    ) -> PipexResult<Self> {
        let resource_url = options
            .resource_url
            .clone()
            .or_else(|| default_resource_url(&request));
        let response = pipeline.run(&context, request).await?;
        let options = PollerOptions {
            resource_url,
            ..options
        };
        Self::from_initial_response(pipeline, context, response, options, deserializer).await
    }

    /// Builds a poller from an initial response obtained elsewhere. The
    /// response is consumed; callers keep no release obligation.
    pub async fn from_initial_response(
        pipeline: Pipeline,
        context: Context,
        response: crate::response::Response,
        options: PollerOptions,
        deserializer: ResultDeserializer<T>,
    ) -> PipexResult<Self> {
        let mut response = response
            .error_for_status_in(&POLL_SUCCESS_STATUSES)
            .await?;
        let http_status = response.status();
        let headers = response.headers().clone();
        let body = response.collect().await?;

        let monitor_url = monitor_url_from_headers(&headers);
        let poll_interval_hint = parse_retry_after(&headers, SystemTime::now());

        let strategy = options
            .strategy
            .clone()
            .unwrap_or_else(|| Arc::new(BodyStatus));
        let status = match &monitor_url {
            Some(_) => strategy.status(http_status, &headers, &body)?,
            None if http_status == StatusCode::ACCEPTED => {
                return Err(Error::MissingOperationLocation {
                    status: http_status.as_u16(),
                });
            }
            None => OperationStatus::Succeeded,
        };

        let state = OperationState {
            status,
            monitor_url,
            resource_url: options.resource_url.clone(),
            poll_interval: poll_interval_hint,
        };
        let poll_interval = options
            .poll_interval
            .unwrap_or_else(|| pipeline.default_poll_interval());
        let cancellation = context.cancellation().child_token();
        Ok(Self {
            pipeline,
            context,
            state,
            strategy,
            deserializer,
            poll_interval,
            cancellation,
            last: Some(LastPoll {
                http_status: http_status.as_u16(),
                body,
            }),
        })
    }

    /// Reconstructs a poller from a resume token. The initial request is
    /// not re-issued: resumption continues from the recorded state.
    pub fn from_resume_token(
        pipeline: Pipeline,
        context: Context,
        token: &str,
        options: PollerOptions,
        deserializer: ResultDeserializer<T>,
    ) -> PipexResult<Self> {
        let state: OperationState =
            serde_json::from_str(token).map_err(|source| Error::ResumeToken {
                message: source.to_string(),
            })?;
        let strategy = options
            .strategy
            .clone()
            .unwrap_or_else(|| Arc::new(BodyStatus));
        let poll_interval = options
            .poll_interval
            .unwrap_or_else(|| pipeline.default_poll_interval());
        let cancellation = context.cancellation().child_token();
        Ok(Self {
            pipeline,
            context,
            state,
            strategy,
            deserializer,
            poll_interval,
            cancellation,
            last: None,
        })
    }

    /// Serializable snapshot sufficient to reconstruct this poller without
    /// the original call context.
    pub fn resume_token(&self) -> PipexResult<String> {
        serde_json::to_string(&self.state).map_err(|source| Error::ResumeToken {
            message: source.to_string(),
        })
    }

    pub fn status(&self) -> OperationStatus {
        self.state.status
    }

    pub fn state(&self) -> &OperationState {
        &self.state
    }

    /// Requests cancellation of the polling loop. Takes effect at the next
    /// safe point — never mid-request — and does not assert that the
    /// server-side operation stopped.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Issues one poll against the status monitor and records the observed
    /// state. No-op once terminal.
    pub async fn poll_once(&mut self) -> PipexResult<OperationStatus> {
        if self.state.status.is_terminal() {
            return Ok(self.state.status);
        }
        let Some(monitor_url) = self.state.monitor_url.clone() else {
            // No monitor means the initial response was already terminal.
            self.state.status = OperationStatus::Succeeded;
            return Ok(self.state.status);
        };

        let request = Request::get(monitor_url);
        let mut response = self
            .pipeline
            .run(&self.context, request)
            .await?
            .error_for_status_in(&POLL_SUCCESS_STATUSES)
            .await?;
        let http_status = response.status();
        let headers = response.headers().clone();
        let body = response.collect().await?;

        let status = self.strategy.status(http_status, &headers, &body)?;
        debug!(status = ?status, http_status = http_status.as_u16(), "polled operation status");
        self.state.status = status;
        self.state.poll_interval = parse_retry_after(&headers, SystemTime::now());
        self.last = Some(LastPoll {
            http_status: http_status.as_u16(),
            body,
        });
        Ok(status)
    }

    /// Polls until the operation reaches a terminal state, then resolves
    /// the result. Sleeps the server-provided delay hint (else the
    /// configured default) between polls, in the caller's own context.
    pub async fn wait(&mut self) -> PipexResult<T> {
        while !self.state.status.is_terminal() {
            let delay = self.state.poll_interval.unwrap_or(self.poll_interval);
            tokio::select! {
                _ = self.cancellation.cancelled() => {
                    self.state.status = OperationStatus::Cancelled;
                    return Err(Error::OperationCancelled);
                }
                _ = sleep(delay) => {}
            }
            self.poll_once().await?;
        }

        match self.state.status {
            OperationStatus::Succeeded => self.final_result().await,
            OperationStatus::Failed => {
                let (status, body) = self
                    .last
                    .as_ref()
                    .map(|last| (last.http_status, truncate_body(&last.body)))
                    .unwrap_or((0, String::new()));
                Err(Error::OperationFailed { status, body })
            }
            _ => Err(Error::OperationCancelled),
        }
    }

    /// Fetches the result payload: the last status payload when it embeds
    /// the result, else one final fetch of the resource.
    async fn final_result(&mut self) -> PipexResult<T> {
        let needs_final_fetch = match (&self.state.resource_url, &self.state.monitor_url) {
            (Some(resource), Some(monitor)) => resource != monitor,
            (Some(_), None) => false,
            (None, _) => false,
        };
        if needs_final_fetch
            && let Some(resource_url) = self.state.resource_url.clone()
        {
            let request = Request::get(resource_url);
            let mut response = self
                .pipeline
                .run(&self.context, request)
                .await?
                .error_for_status()
                .await?;
            let body = response.collect().await?;
            return (self.deserializer)(&body);
        }

        match &self.last {
            Some(last) => (self.deserializer)(&last.body),
            None => {
                // Resumed poller that went terminal before its first poll
                // observed a payload; re-read the monitor for the result.
                self.refetch_result().await
            }
        }
    }

    async fn refetch_result(&mut self) -> PipexResult<T> {
        let url = self
            .state
            .resource_url
            .clone()
            .or_else(|| self.state.monitor_url.clone());
        let Some(url) = url else {
            return Err(Error::ResumeToken {
                message: "resume token carries neither monitor nor resource url".to_owned(),
            });
        };
        let request = Request::get(url);
        let mut response = self
            .pipeline
            .run(&self.context, request)
            .await?
            .error_for_status()
            .await?;
        let body = response.collect().await?;
        (self.deserializer)(&body)
    }
}

fn monitor_url_from_headers(headers: &HeaderMap) -> Option<String> {
    for name in MONITOR_HEADERS {
        if let Some(value) = headers.get(name)
            && let Ok(text) = value.to_str()
        {
            return Some(text.to_owned());
        }
    }
    None
}

fn default_resource_url(request: &Request) -> Option<String> {
    match *request.method() {
        http::Method::PUT | http::Method::PATCH => Some(request.url().to_owned()),
        _ => None,
    }
}
