use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use http::{HeaderMap, Method};
use rand::Rng;
use tokio::time::sleep;
use tracing::{Instrument, info_span, warn};

use crate::PipexResult;
use crate::context::Context;
use crate::error::Error;
use crate::policy::{Policy, send_next};
use crate::request::Request;
use crate::response::Response;
use crate::util::{parse_retry_after, redact_uri_for_logs};

/// Attempt counter recorded in the call's [`Context`] value bag.
#[derive(Debug, Default)]
pub struct RetryAttempts(AtomicUsize);

impl RetryAttempts {
    pub fn attempts(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    fn record(&self, attempt: usize) {
        self.0.fetch_max(attempt, Ordering::Relaxed);
    }
}

/// Bounded retry with exponential backoff and jitter.
///
/// Retryable outcomes: transient transport failures, and response status
/// codes in the configured retryable set. Both are gated on request
/// eligibility: idempotent methods retry by default, POST only with an
/// idempotency-key header, streaming request bodies never. A `Retry-After`
/// header on the response takes precedence over computed backoff verbatim.
/// Exhaustion surfaces the last real response or error unchanged.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    base_backoff: Duration,
    max_backoff: Duration,
    jitter_ratio: f64,
    retryable_status_codes: BTreeSet<u16>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_backoff", &self.base_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("jitter_ratio", &self.jitter_ratio)
            .field("retryable_status_codes", &self.retryable_status_codes)
            .finish()
    }
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            jitter_ratio: 0.0,
            retryable_status_codes: default_retryable_status_codes(),
        }
    }

    pub fn standard() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            jitter_ratio: 0.2,
            retryable_status_codes: default_retryable_status_codes(),
        }
    }

    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn base_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff.max(Duration::from_millis(1));
        if self.max_backoff < self.base_backoff {
            self.max_backoff = self.base_backoff;
        }
        self
    }

    pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff.max(self.base_backoff);
        self
    }

    pub fn jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio.clamp(0.0, 1.0);
        self
    }

    pub fn retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    pub(crate) fn max_attempts_value(&self) -> usize {
        self.max_attempts
    }

    pub(crate) fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_status_codes.contains(&status)
    }

    /// Backoff before retry number `retry_index` (1-based): exponential
    /// from the base, capped, jittered.
    pub(crate) fn backoff_for_retry(&self, retry_index: usize) -> Duration {
        let capped_exponent = retry_index.saturating_sub(1).min(31) as u32;
        let multiplier = 1_u128 << capped_exponent;
        let base_ms = self.base_backoff.as_millis().max(1);
        let max_ms = self.max_backoff.as_millis().max(base_ms);
        let delay_ms = base_ms
            .saturating_mul(multiplier)
            .min(max_ms)
            .min(u64::MAX as u128) as u64;
        self.apply_jitter(Duration::from_millis(delay_ms))
    }

    fn apply_jitter(&self, backoff: Duration) -> Duration {
        if self.jitter_ratio <= f64::EPSILON {
            return backoff;
        }

        let backoff_ms = backoff.as_millis().min(u64::MAX as u128) as u64;
        if backoff_ms <= 1 {
            return backoff;
        }
        let max_backoff_ms = self.max_backoff.as_millis().min(u64::MAX as u128) as u64;

        let jitter_span = ((backoff_ms as f64) * self.jitter_ratio).round().max(1.0) as u64;
        let low = backoff_ms.saturating_sub(jitter_span);
        let high = backoff_ms.saturating_add(jitter_span).max(low);
        let mut rng = rand::rng();
        let sampled_ms = rng.random_range(low..=high).min(max_backoff_ms.max(1));
        Duration::from_millis(sampled_ms)
    }

    /// Sleeps out a backoff delay, aborting immediately on cancellation and
    /// refusing delays that would overrun the call deadline.
    async fn backoff(
        &self,
        context: &Context,
        delay: Duration,
        method: &Method,
        uri: &str,
    ) -> PipexResult<()> {
        if let Some(remaining) = context.remaining()
            && delay >= remaining
        {
            return Err(Error::DeadlineExceeded {
                method: method.clone(),
                uri: uri.to_owned(),
            });
        }
        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = context.cancelled() => Err(Error::Cancelled),
            _ = sleep(delay) => Ok(()),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

#[async_trait]
impl Policy for RetryPolicy {
    async fn send(
        &self,
        context: &Context,
        request: &mut Request,
        next: &[Arc<dyn Policy>],
    ) -> PipexResult<Response> {
        let policy = request
            .options()
            .retry
            .clone()
            .unwrap_or_else(|| self.clone());
        let method = request.method().clone();
        let redacted_uri = redact_uri_for_logs(request.url());
        let max_attempts = if request_supports_retry(&method, request.headers())
            && request.body().is_replayable()
        {
            policy.max_attempts_value()
        } else {
            1
        };
        let attempts = context.insert_value(RetryAttempts::default());

        let mut attempt = 1_usize;
        loop {
            if context.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let span = info_span!(
                "pipex.attempt",
                method = %method,
                uri = %redacted_uri,
                attempt = attempt,
                max_attempts = max_attempts
            );
            attempts.record(attempt);

            let mut attempt_request = request.clone();
            match send_next(context, &mut attempt_request, next)
                .instrument(span)
                .await
            {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if attempt < max_attempts && policy.is_retryable_status(status) {
                        let delay = parse_retry_after(response.headers(), SystemTime::now())
                            .unwrap_or_else(|| policy.backoff_for_retry(attempt));
                        // Release the abandoned response's connection
                        // before sleeping out the backoff.
                        drop(response);
                        warn!(
                            status = status,
                            delay_ms = delay.as_millis() as u64,
                            attempt = attempt,
                            "retrying request after retryable status"
                        );
                        policy
                            .backoff(context, delay, &method, &redacted_uri)
                            .await?;
                        attempt += 1;
                        continue;
                    }
                    return Ok(response);
                }
                Err(error) => {
                    if attempt < max_attempts && error.is_transient_transport() {
                        let delay = policy.backoff_for_retry(attempt);
                        warn!(
                            error = %error,
                            delay_ms = delay.as_millis() as u64,
                            attempt = attempt,
                            "retrying request after transport error"
                        );
                        policy
                            .backoff(context, delay, &method, &redacted_uri)
                            .await?;
                        attempt += 1;
                        continue;
                    }
                    return Err(error);
                }
            }
        }
    }

    fn is_retry_anchor(&self) -> bool {
        true
    }
}

fn default_retryable_status_codes() -> BTreeSet<u16> {
    [408_u16, 429, 500, 502, 503, 504].into_iter().collect()
}

pub(crate) fn request_supports_retry(method: &Method, headers: &HeaderMap) -> bool {
    is_method_idempotent(method) || headers.get(crate::IDEMPOTENCY_KEY_HEADER).is_some()
}

fn is_method_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS | Method::TRACE
    )
}
