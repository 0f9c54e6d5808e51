use std::any::Any;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;

use crate::PipexResult;
use crate::error::{BoxError, Error, HttpErrorKind};
use crate::util::truncate_body;

/// Boxed streaming response body; owns the transport-level resource.
pub type StreamingBody = Pin<Box<dyn hyper::body::Body<Data = Bytes, Error = BoxError> + Send>>;

/// Response body: buffered bytes, or a stream still owning the pooled
/// transport connection.
#[derive(Default)]
pub enum ResponseBody {
    #[default]
    Empty,
    Buffered(Bytes),
    Streaming(StreamingBody),
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => formatter.write_str("ResponseBody::Empty"),
            Self::Buffered(bytes) => {
                write!(formatter, "ResponseBody::Buffered({} bytes)", bytes.len())
            }
            Self::Streaming(_) => formatter.write_str("ResponseBody::Streaming"),
        }
    }
}

/// A response descriptor: status, header multimap, and a body that owns at
/// most one transport-level resource. Every path that obtains a `Response`
/// must release that resource — by dropping the response, calling
/// [`close`](Response::close), or fully consuming the body — exactly once.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: ResponseBody,
    release_guard: Option<ReleaseGuard>,
    /// Request context for error reporting.
    method: http::Method,
    url: String,
}

impl Response {
    pub fn new(status: StatusCode, headers: HeaderMap, body: ResponseBody) -> Self {
        Self {
            status,
            headers,
            body,
            release_guard: None,
            method: http::Method::GET,
            url: String::new(),
        }
    }

    /// Attaches an object dropped exactly once when the response is closed
    /// or its body fully consumed. Transports use this to tie connection
    /// release to body lifetime; tests use it to observe the release.
    pub fn with_release_guard(mut self, guard: Box<dyn Any + Send>) -> Self {
        self.release_guard = Some(ReleaseGuard(guard));
        self
    }

    pub(crate) fn with_request_context(mut self, method: http::Method, url: String) -> Self {
        self.method = method;
        self.url = url;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    pub(crate) fn take_body(&mut self) -> ResponseBody {
        std::mem::take(&mut self.body)
    }

    pub(crate) fn set_body(&mut self, body: ResponseBody) {
        self.body = body;
    }

    /// Buffers the body in place, releasing the transport resource, and
    /// returns the bytes. Idempotent: a second call returns the buffer.
    pub async fn collect(&mut self) -> PipexResult<Bytes> {
        match std::mem::take(&mut self.body) {
            ResponseBody::Empty => Ok(Bytes::new()),
            ResponseBody::Buffered(bytes) => {
                self.body = ResponseBody::Buffered(bytes.clone());
                Ok(bytes)
            }
            ResponseBody::Streaming(mut stream) => {
                let mut collected = BytesMut::new();
                loop {
                    let Some(frame) = stream.frame().await else {
                        break;
                    };
                    let frame = frame.map_err(|source| Error::ReadBody { source })?;
                    if let Some(data) = frame.data_ref() {
                        collected.extend_from_slice(data);
                    }
                }
                drop(stream);
                self.release_guard = None;
                let bytes = collected.freeze();
                self.body = ResponseBody::Buffered(bytes.clone());
                Ok(bytes)
            }
        }
    }

    /// Releases the transport resource without reading the body. Safe to
    /// call more than once; only the first call has an effect.
    pub fn close(&mut self) {
        self.body = ResponseBody::Empty;
        self.release_guard = None;
    }

    pub async fn text_lossy(&mut self) -> PipexResult<String> {
        let body = self.collect().await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    pub async fn json<T>(&mut self) -> PipexResult<T>
    where
        T: DeserializeOwned,
    {
        let body = self.collect().await?;
        serde_json::from_slice(&body).map_err(|source| Error::Deserialize {
            source,
            body: truncate_body(&body),
        })
    }

    /// Maps any non-2xx status to [`Error::HttpStatus`], buffering the body
    /// for caller inspection. 401/404/409/304 carry their distinct error
    /// kinds regardless of body content.
    pub async fn error_for_status(self) -> PipexResult<Self> {
        if self.status.is_success() {
            return Ok(self);
        }
        Err(self.into_status_error().await)
    }

    /// Like [`error_for_status`](Response::error_for_status), but with an
    /// explicit success set: operation kinds differ in which of
    /// 200/201/202/204 they accept.
    pub async fn error_for_status_in(self, allowed: &[u16]) -> PipexResult<Self> {
        if allowed.contains(&self.status.as_u16()) {
            return Ok(self);
        }
        Err(self.into_status_error().await)
    }

    pub(crate) async fn into_status_error(mut self) -> Error {
        let status = self.status.as_u16();
        let body = match self.collect().await {
            Ok(bytes) => truncate_body(&bytes),
            Err(_) => String::new(),
        };
        Error::HttpStatus {
            status,
            kind: HttpErrorKind::from_status(status),
            method: self.method.clone(),
            uri: self.url.clone(),
            headers: Box::new(self.headers.clone()),
            body,
        }
    }
}

struct ReleaseGuard(#[allow(dead_code)] Box<dyn Any + Send>);

impl std::fmt::Debug for ReleaseGuard {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str("ReleaseGuard")
    }
}
