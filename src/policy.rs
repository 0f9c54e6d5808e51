use std::sync::Arc;

use async_trait::async_trait;
use http::header::{HeaderName, HeaderValue, USER_AGENT};
use http::{HeaderMap, Method};
use rand::Rng;
use tracing::{Instrument, debug, info_span, warn};

use crate::PipexResult;
use crate::context::Context;
use crate::error::Error;
use crate::request::Request;
use crate::response::Response;
use crate::util::{
    is_redirect_status, redact_uri_for_logs, redirect_location, redirect_method,
    resolve_redirect_uri, same_origin, sanitize_headers_for_redirect,
};

pub(crate) const CLIENT_REQUEST_ID_HEADER: &str = "x-client-request-id";

/// A middleware unit of the pipeline. Policies observe or mutate the
/// request on the way down, forward it to the rest of the chain, and
/// observe or mutate the response (or error) on the way back up.
///
/// Only the retry policy may call through the remaining chain more than
/// once. Network I/O happens exclusively in the terminal transport policy.
#[async_trait]
pub trait Policy: Send + Sync + std::fmt::Debug {
    async fn send(
        &self,
        context: &Context,
        request: &mut Request,
        next: &[Arc<dyn Policy>],
    ) -> PipexResult<Response>;

    /// True only for the retry policy; the pipeline builder uses this to
    /// locate the per-call / per-retry insertion anchor in a custom chain.
    fn is_retry_anchor(&self) -> bool {
        false
    }
}

/// Forwards the request to the remainder of the chain.
pub async fn send_next(
    context: &Context,
    request: &mut Request,
    next: &[Arc<dyn Policy>],
) -> PipexResult<Response> {
    let Some((first, rest)) = next.split_first() else {
        return Err(Error::Configuration {
            message: "policy chain ended without reaching a transport".to_owned(),
        });
    };
    first.send(context, request, rest).await
}

/// Stamps a per-call client request id header unless the caller set one.
/// Runs once per logical call, so every retry attempt carries the same id.
#[derive(Debug, Default)]
pub struct RequestIdPolicy;

#[async_trait]
impl Policy for RequestIdPolicy {
    async fn send(
        &self,
        context: &Context,
        request: &mut Request,
        next: &[Arc<dyn Policy>],
    ) -> PipexResult<Response> {
        if !request.headers().contains_key(CLIENT_REQUEST_ID_HEADER) {
            let id = format!("{:032x}", rand::rng().random::<u128>());
            if let Ok(value) = HeaderValue::from_str(&id) {
                request
                    .headers_mut()
                    .insert(HeaderName::from_static(CLIENT_REQUEST_ID_HEADER), value);
            }
        }
        send_next(context, request, next).await
    }
}

#[derive(Debug)]
pub struct UserAgentPolicy {
    value: HeaderValue,
}

impl UserAgentPolicy {
    pub fn new(client_name: &str) -> Self {
        let agent = format!(
            "{client_name} pipex/{version}",
            version = env!("CARGO_PKG_VERSION")
        );
        let value = HeaderValue::from_str(&agent)
            .unwrap_or_else(|_| HeaderValue::from_static(concat!("pipex/", env!("CARGO_PKG_VERSION"))));
        Self { value }
    }
}

#[async_trait]
impl Policy for UserAgentPolicy {
    async fn send(
        &self,
        context: &Context,
        request: &mut Request,
        next: &[Arc<dyn Policy>],
    ) -> PipexResult<Response> {
        if !request.headers().contains_key(USER_AGENT) {
            request.headers_mut().insert(USER_AGENT, self.value.clone());
        }
        send_next(context, request, next).await
    }
}

/// Injects configured default headers where the request has none.
#[derive(Debug, Default)]
pub struct HeadersPolicy {
    headers: HeaderMap,
}

impl HeadersPolicy {
    pub fn new(headers: HeaderMap) -> Self {
        Self { headers }
    }
}

#[async_trait]
impl Policy for HeadersPolicy {
    async fn send(
        &self,
        context: &Context,
        request: &mut Request,
        next: &[Arc<dyn Policy>],
    ) -> PipexResult<Response> {
        for (name, value) in &self.headers {
            if !request.headers().contains_key(name) {
                request.headers_mut().insert(name.clone(), value.clone());
            }
        }
        send_next(context, request, next).await
    }
}

/// Observes the outcome of each attempt. Never swallows a failure: errors
/// are logged and re-raised unchanged.
#[derive(Debug, Default)]
pub struct LoggingPolicy;

#[async_trait]
impl Policy for LoggingPolicy {
    async fn send(
        &self,
        context: &Context,
        request: &mut Request,
        next: &[Arc<dyn Policy>],
    ) -> PipexResult<Response> {
        let method = request.method().clone();
        let uri = redact_uri_for_logs(request.url());
        debug!(method = %method, uri = %uri, "sending request");
        match send_next(context, request, next).await {
            Ok(response) => {
                debug!(method = %method, uri = %uri, status = response.status().as_u16(), "request completed");
                Ok(response)
            }
            Err(error) => {
                warn!(method = %method, uri = %uri, error = %error, "request failed");
                Err(error)
            }
        }
    }
}

/// Wraps each attempt in a tracing span carrying method and redacted URI.
#[derive(Debug, Default)]
pub struct TracingPolicy;

#[async_trait]
impl Policy for TracingPolicy {
    async fn send(
        &self,
        context: &Context,
        request: &mut Request,
        next: &[Arc<dyn Policy>],
    ) -> PipexResult<Response> {
        let span = info_span!(
            "pipex.request",
            method = %request.method(),
            uri = %redact_uri_for_logs(request.url()),
        );
        send_next(context, request, next).instrument(span).await
    }
}

/// Follows `Location` redirects up to a configured limit. Placed before
/// the retry anchor so each redirect hop gets its own retry window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RedirectPolicy {
    enabled: bool,
    max_redirects: usize,
}

impl RedirectPolicy {
    pub const fn none() -> Self {
        Self {
            enabled: false,
            max_redirects: 0,
        }
    }

    pub const fn limited(max_redirects: usize) -> Self {
        Self {
            enabled: true,
            max_redirects,
        }
    }

    pub const fn follow() -> Self {
        Self::limited(10)
    }

    pub const fn enabled(self) -> bool {
        self.enabled
    }

    pub const fn max_redirects(self) -> usize {
        if self.enabled { self.max_redirects } else { 0 }
    }
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        Self::none()
    }
}

#[async_trait]
impl Policy for RedirectPolicy {
    async fn send(
        &self,
        context: &Context,
        request: &mut Request,
        next: &[Arc<dyn Policy>],
    ) -> PipexResult<Response> {
        if !self.enabled {
            return send_next(context, request, next).await;
        }

        let mut redirect_count = 0_usize;
        loop {
            let mut response = send_next(context, request, next).await?;
            let status = response.status();
            if !is_redirect_status(status) {
                return Ok(response);
            }
            if !request.body().is_replayable()
                && !matches!(
                    redirect_method(request.method(), status),
                    Method::GET | Method::HEAD
                )
            {
                // A one-shot streaming body cannot be resent; hand the
                // redirect response back to the caller unfollowed.
                return Ok(response);
            }
            if redirect_count >= self.max_redirects {
                response.close();
                return Err(Error::RedirectLimitExceeded {
                    max_redirects: self.max_redirects,
                    method: request.method().clone(),
                    uri: redact_uri_for_logs(request.url()),
                });
            }
            let Some(location) = redirect_location(response.headers()) else {
                response.close();
                return Err(Error::MissingRedirectLocation {
                    status: status.as_u16(),
                    method: request.method().clone(),
                    uri: redact_uri_for_logs(request.url()),
                });
            };
            let Some(next_url) = resolve_redirect_uri(request.url(), &location) else {
                response.close();
                return Err(Error::InvalidRedirectLocation {
                    location,
                    method: request.method().clone(),
                    uri: redact_uri_for_logs(request.url()),
                });
            };
            response.close();

            let next_method = redirect_method(request.method(), status);
            let method_changed_to_get =
                next_method == Method::GET && *request.method() != Method::GET;
            let same_origin_redirect = same_origin(request.url(), &next_url);
            sanitize_headers_for_redirect(
                request.headers_mut(),
                method_changed_to_get,
                same_origin_redirect,
            );
            debug!(from = %redact_uri_for_logs(request.url()), to = %redact_uri_for_logs(&next_url), "following redirect");
            request.set_method(next_method);
            request.set_url(next_url);
            redirect_count += 1;
        }
    }
}
