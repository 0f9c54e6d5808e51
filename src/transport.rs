use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_core::Stream;
use http_body_util::BodyExt;
use hyper::body::{Frame, SizeHint};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

use crate::PipexResult;
use crate::context::Context;
use crate::error::{BoxError, Error, TransportErrorKind};
use crate::policy::Policy;
use crate::request::{Body, ByteStream, Request};
use crate::response::{Response, ResponseBody};
use crate::util::{parse_uri, redact_uri_for_logs};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 8;

/// Sends one fully-formed request descriptor over the network. The only
/// component of the pipeline that performs I/O. Implementations must
/// observe the context's cancellation signal and deadline, own their
/// connection pooling, and be safe for concurrent reuse.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    async fn send(&self, context: &Context, request: &mut Request) -> PipexResult<Response>;
}

/// Pooled hyper transport over rustls (webpki roots).
pub struct HyperTransport {
    client: Client<HttpsConnector<HttpConnector>, PipexBody>,
    request_timeout: Duration,
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HyperTransport")
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl HyperTransport {
    pub fn new() -> Self {
        let https = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(DEFAULT_POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(DEFAULT_POOL_MAX_IDLE_PER_HOST)
            .build(https);
        Self {
            client,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Per-attempt timeout covering connect plus response headers.
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout.max(Duration::from_millis(1));
        self
    }
}

impl Default for HyperTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn send(&self, context: &Context, request: &mut Request) -> PipexResult<Response> {
        let method = request.method().clone();
        let url = request.url().to_owned();
        let redacted_uri = redact_uri_for_logs(&url);
        let uri = parse_uri(&url)?;

        let body = match request.body() {
            Body::Empty => PipexBody(BodyInner::Empty),
            Body::Buffered(bytes) => PipexBody(BodyInner::Full(Some(bytes.clone()))),
            Body::Streaming(shared) => match shared.take() {
                Some(stream) => PipexBody(BodyInner::Stream(stream)),
                None => {
                    return Err(Error::Configuration {
                        message: "streaming request body was already consumed".to_owned(),
                    });
                }
            },
        };
        let mut http_request = http::Request::builder()
            .method(method.clone())
            .uri(uri)
            .body(body)
            .map_err(|source| Error::RequestBuild { source })?;
        *http_request.headers_mut() = request.headers().clone();

        let mut timeout_value = request
            .options()
            .request_timeout
            .unwrap_or(self.request_timeout);
        if let Some(remaining) = context.remaining() {
            if remaining.is_zero() {
                return Err(Error::DeadlineExceeded {
                    method,
                    uri: redacted_uri,
                });
            }
            timeout_value = timeout_value.min(remaining);
        }

        let http_response = tokio::select! {
            _ = context.cancelled() => return Err(Error::Cancelled),
            outcome = tokio::time::timeout(timeout_value, self.client.request(http_request)) => {
                match outcome {
                    Err(_elapsed) => {
                        return Err(Error::Timeout {
                            timeout_ms: timeout_value.as_millis(),
                            method,
                            uri: redacted_uri,
                        });
                    }
                    Ok(Err(source)) => {
                        let kind = classify_transport_error(&source);
                        return Err(Error::Transport {
                            kind,
                            method,
                            uri: redacted_uri,
                            source: Box::new(source),
                        });
                    }
                    Ok(Ok(response)) => response,
                }
            }
        };

        let (parts, incoming) = http_response.into_parts();
        // The streaming body owns the pooled connection; dropping or fully
        // consuming it releases the connection.
        let streaming: crate::response::StreamingBody =
            Box::pin(incoming.map_err(|source| Box::new(source) as BoxError));
        Ok(
            Response::new(parts.status, parts.headers, ResponseBody::Streaming(streaming))
                .with_request_context(method, url),
        )
    }
}

pub(crate) fn classify_transport_error(
    error: &hyper_util::client::legacy::Error,
) -> TransportErrorKind {
    if error.is_connect() {
        let text = error.to_string().to_ascii_lowercase();
        if text.contains("dns")
            || text.contains("name or service not known")
            || text.contains("failed to lookup address")
        {
            return TransportErrorKind::Dns;
        }
        if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
            return TransportErrorKind::Tls;
        }
        return TransportErrorKind::Connect;
    }

    let text = error.to_string().to_ascii_lowercase();
    if text.contains("read")
        || text.contains("connection reset")
        || text.contains("broken pipe")
        || text.contains("unexpected eof")
    {
        return TransportErrorKind::Read;
    }

    TransportErrorKind::Other
}

/// Terminal policy adapting the injected transport to the policy chain.
#[derive(Debug)]
pub(crate) struct TransportPolicy {
    transport: Arc<dyn Transport>,
}

impl TransportPolicy {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Policy for TransportPolicy {
    async fn send(
        &self,
        context: &Context,
        request: &mut Request,
        next: &[Arc<dyn Policy>],
    ) -> PipexResult<Response> {
        debug_assert!(next.is_empty(), "transport must terminate the chain");
        self.transport.send(context, request).await
    }
}

/// Request body handed to hyper: empty, buffered, or a one-shot stream.
pub(crate) struct PipexBody(BodyInner);

enum BodyInner {
    Empty,
    Full(Option<Bytes>),
    Stream(ByteStream),
}

impl hyper::body::Body for PipexBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        task_context: &mut std::task::Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match &mut self.get_mut().0 {
            BodyInner::Empty => Poll::Ready(None),
            BodyInner::Full(bytes) => Poll::Ready(bytes.take().map(|data| Ok(Frame::data(data)))),
            BodyInner::Stream(stream) => stream
                .as_mut()
                .poll_next(task_context)
                .map(|item| item.map(|result| result.map(Frame::data))),
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.0 {
            BodyInner::Empty => true,
            BodyInner::Full(bytes) => bytes.is_none(),
            BodyInner::Stream(_) => false,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.0 {
            BodyInner::Empty => SizeHint::with_exact(0),
            BodyInner::Full(Some(bytes)) => SizeHint::with_exact(bytes.len() as u64),
            BodyInner::Full(None) => SizeHint::with_exact(0),
            BodyInner::Stream(_) => SizeHint::default(),
        }
    }
}
