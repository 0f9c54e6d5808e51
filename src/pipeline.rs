use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;

use crate::PipexResult;
use crate::context::Context;
use crate::decode::ContentDecodePolicy;
use crate::error::Error;
use crate::handle::ResponseHandle;
use crate::policy::{
    HeadersPolicy, LoggingPolicy, Policy, RedirectPolicy, RequestIdPolicy, TracingPolicy,
    UserAgentPolicy, send_next,
};
use crate::request::Request;
use crate::response::Response;
use crate::retry::RetryPolicy;
use crate::transport::{HyperTransport, Transport, TransportPolicy};

const DEFAULT_CLIENT_NAME: &str = "pipex";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// An ordered policy chain terminated by a transport. Configured once at
/// build time; cheap to clone and safe for concurrent reuse — all per-call
/// mutable state lives in each call's [`Context`] and locals.
#[derive(Clone, Debug)]
pub struct Pipeline {
    chain: Arc<[Arc<dyn Policy>]>,
    api_version: Option<Arc<str>>,
    default_poll_interval: Duration,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Runs one logical call end-to-end through the policy chain.
    pub async fn run(&self, context: &Context, mut request: Request) -> PipexResult<Response> {
        if context.is_cancelled() {
            return Err(Error::Cancelled);
        }
        send_next(context, &mut request, &self.chain).await
    }

    /// Wraps the call in a dual-mode handle: await it for the response, or
    /// acquire it as a scoped resource that closes the response on exit.
    /// The underlying call executes at most once.
    pub fn send(&self, context: &Context, request: Request) -> ResponseHandle {
        let pipeline = self.clone();
        let context = context.clone();
        ResponseHandle::new(Box::pin(async move {
            pipeline.run(&context, request).await
        }))
    }

    pub fn api_version(&self) -> Option<&str> {
        self.api_version.as_deref()
    }

    pub fn default_poll_interval(&self) -> Duration {
        self.default_poll_interval
    }
}

/// Assembles a [`Pipeline`]. The default chain is
///
/// ```text
/// request-id → user-agent → headers → [per_call…] → redirect → retry →
/// [per_retry…] → logging → tracing → content-decode → transport
/// ```
///
/// Per-call policies run once per logical call; per-retry policies run on
/// every attempt (credentials may need refreshing between attempts). A
/// custom `policies` list replaces the built-ins entirely but keeps the
/// same insertion rule: per-call policies are prepended, per-retry
/// policies are spliced in after the retry anchor found in the list.
#[derive(Default)]
pub struct PipelineBuilder {
    client_name: Option<String>,
    default_headers: HeaderMap,
    retry: Option<RetryPolicy>,
    redirect: Option<RedirectPolicy>,
    per_call_policies: Vec<Arc<dyn Policy>>,
    per_retry_policies: Vec<Arc<dyn Policy>>,
    policies: Option<Vec<Arc<dyn Policy>>>,
    transport: Option<Arc<dyn Transport>>,
    api_version: Option<String>,
    default_poll_interval: Option<Duration>,
}

impl PipelineBuilder {
    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = Some(client_name.into());
        self
    }

    pub fn default_headers(mut self, default_headers: HeaderMap) -> Self {
        self.default_headers = default_headers;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn redirect(mut self, redirect: RedirectPolicy) -> Self {
        self.redirect = Some(redirect);
        self
    }

    /// Policies inserted before the retry anchor; run once per logical call.
    pub fn per_call_policy(mut self, policy: Arc<dyn Policy>) -> Self {
        self.per_call_policies.push(policy);
        self
    }

    /// Policies inserted after the retry anchor; re-run on every attempt.
    pub fn per_retry_policy(mut self, policy: Arc<dyn Policy>) -> Self {
        self.per_retry_policies.push(policy);
        self
    }

    /// Replaces the default chain entirely. The transport policy is still
    /// appended; supplying per-retry policies requires this list to contain
    /// a retry anchor.
    pub fn policies(mut self, policies: Vec<Arc<dyn Policy>>) -> Self {
        self.policies = Some(policies);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Service API version, applied to continuation links by pagers built
    /// on this pipeline.
    pub fn api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = Some(api_version.into());
        self
    }

    pub fn default_poll_interval(mut self, default_poll_interval: Duration) -> Self {
        self.default_poll_interval = Some(default_poll_interval.max(Duration::from_millis(1)));
        self
    }

    pub fn build(self) -> PipexResult<Pipeline> {
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HyperTransport::new()));
        let transport_policy: Arc<dyn Policy> = Arc::new(TransportPolicy::new(transport));

        let mut chain: Vec<Arc<dyn Policy>> = Vec::new();
        match self.policies {
            None => {
                let client_name = self.client_name.as_deref().unwrap_or(DEFAULT_CLIENT_NAME);
                chain.push(Arc::new(RequestIdPolicy));
                chain.push(Arc::new(UserAgentPolicy::new(client_name)));
                if !self.default_headers.is_empty() {
                    chain.push(Arc::new(HeadersPolicy::new(self.default_headers)));
                }
                chain.extend(self.per_call_policies);
                chain.push(Arc::new(self.redirect.unwrap_or_default()));
                chain.push(Arc::new(self.retry.unwrap_or_default()));
                chain.extend(self.per_retry_policies);
                chain.push(Arc::new(LoggingPolicy));
                chain.push(Arc::new(TracingPolicy));
                chain.push(Arc::new(ContentDecodePolicy));
            }
            Some(policies) => {
                chain.extend(self.per_call_policies);
                chain.extend(policies);
                if !self.per_retry_policies.is_empty() {
                    let anchor = chain.iter().rposition(|policy| policy.is_retry_anchor());
                    let Some(anchor) = anchor else {
                        return Err(Error::Configuration {
                            message: "per_retry_policies supplied but the custom policy list \
                                      contains no retry policy"
                                .to_owned(),
                        });
                    };
                    let mut splice_at = anchor + 1;
                    for policy in self.per_retry_policies {
                        chain.insert(splice_at, policy);
                        splice_at += 1;
                    }
                }
            }
        }
        chain.push(transport_policy);

        Ok(Pipeline {
            chain: chain.into(),
            api_version: self.api_version.map(Into::into),
            default_poll_interval: self
                .default_poll_interval
                .unwrap_or(DEFAULT_POLL_INTERVAL),
        })
    }
}
