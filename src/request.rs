use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_core::Stream;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::Serialize;

use crate::PipexResult;
use crate::error::{BoxError, Error};
use crate::retry::RetryPolicy;
use crate::util::{parse_header_name, parse_header_value};

pub(crate) type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send + Sync>>;

/// How the pipeline should hand back the response body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResponseMode {
    /// Body is read, content-decoded, and buffered inside the pipeline.
    #[default]
    Buffered,
    /// Body is left as a stream owning the pooled connection; the caller
    /// must consume or close it to release the connection.
    Streamed,
}

/// Per-call options, constructed once per call and carried on the request.
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    pub response_mode: ResponseMode,
    /// Overrides the pipeline's retry policy for this call only.
    pub retry: Option<RetryPolicy>,
    /// Per-attempt transport timeout override.
    pub request_timeout: Option<Duration>,
}

/// Request body. Buffered bodies are replayable across retry attempts;
/// a streaming body can be sent at most once.
#[derive(Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    Buffered(Bytes),
    Streaming(SharedStream),
}

impl Body {
    pub fn is_replayable(&self) -> bool {
        !matches!(self, Self::Streaming(_))
    }

    pub fn len(&self) -> Option<usize> {
        match self {
            Self::Empty => Some(0),
            Self::Buffered(bytes) => Some(bytes.len()),
            Self::Streaming(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.len(), Some(0))
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => formatter.write_str("Body::Empty"),
            Self::Buffered(bytes) => write!(formatter, "Body::Buffered({} bytes)", bytes.len()),
            Self::Streaming(_) => formatter.write_str("Body::Streaming"),
        }
    }
}

/// Take-at-most-once streaming source, shared across request clones so the
/// retry policy can clone the descriptor without duplicating the stream.
#[derive(Clone)]
pub struct SharedStream {
    inner: Arc<Mutex<Option<ByteStream>>>,
}

impl SharedStream {
    pub(crate) fn new(stream: ByteStream) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(stream))),
        }
    }

    pub(crate) fn take(&self) -> Option<ByteStream> {
        let mut slot = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.take()
    }
}

/// A fully-described HTTP request: method, URL, header multimap, body, and
/// per-call options. Policies may mutate it on the way down the chain; the
/// retry policy clones it per attempt.
#[derive(Clone, Debug)]
pub struct Request {
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Body,
    options: CallOptions,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: Body::Empty,
            options: CallOptions::default(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::PUT, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub fn set_url(&mut self, url: impl Into<String>) {
        self.url = url.into();
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> PipexResult<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    /// Marks a POST safe to retry; see [`RetryPolicy`] for the eligibility
    /// rules.
    pub fn idempotency_key(self, key: &str) -> PipexResult<Self> {
        self.try_header(crate::IDEMPOTENCY_KEY_HEADER, key)
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn set_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Body::Buffered(body.into());
        self
    }

    pub fn body_stream<S, E>(mut self, stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + Sync + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let mapped = MapErrStream {
            inner: Box::pin(stream),
        };
        self.body = Body::Streaming(SharedStream::new(Box::pin(mapped)));
        self
    }

    pub fn json<T>(self, payload: &T) -> PipexResult<Self>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload).map_err(|source| Error::Serialize { source })?;
        let with_body = self.set_body(Bytes::from(body));
        Ok(with_body.header(CONTENT_TYPE, HeaderValue::from_static("application/json")))
    }

    pub fn options(&self) -> &CallOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut CallOptions {
        &mut self.options
    }

    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    pub fn response_mode(mut self, response_mode: ResponseMode) -> Self {
        self.options.response_mode = response_mode;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.options.retry = Some(retry);
        self
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.options.request_timeout = Some(request_timeout.max(Duration::from_millis(1)));
        self
    }
}

struct MapErrStream<S> {
    inner: Pin<Box<S>>,
}

impl<S, E> Stream for MapErrStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    type Item = Result<Bytes, BoxError>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        task_context: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.inner
            .as_mut()
            .poll_next(task_context)
            .map(|item| item.map(|result| result.map_err(|error| Box::new(error) as BoxError)))
    }
}
