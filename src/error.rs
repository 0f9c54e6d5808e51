use std::sync::Arc;

use http::{HeaderMap, Method};
use thiserror::Error;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// Classification of a non-success HTTP status, independent of body content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum HttpErrorKind {
    Authentication,
    NotFound,
    Conflict,
    NotModified,
    Other,
}

impl HttpErrorKind {
    pub const fn from_status(status: u16) -> Self {
        match status {
            401 => Self::Authentication,
            404 => Self::NotFound,
            409 => Self::Conflict,
            304 => Self::NotModified,
            _ => Self::Other,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::NotModified => "not_modified",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for HttpErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUri,
    InvalidHeaderName,
    InvalidHeaderValue,
    RequestBuild,
    Serialize,
    Transport,
    Timeout,
    DeadlineExceeded,
    Cancelled,
    ReadBody,
    HttpStatus,
    Deserialize,
    DecodeContentEncoding,
    Configuration,
    MissingRedirectLocation,
    InvalidRedirectLocation,
    RedirectLimitExceeded,
    MissingOperationLocation,
    OperationFailed,
    OperationCancelled,
    ResumeToken,
    Runtime,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_uri",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::RequestBuild => "request_build",
            Self::Serialize => "serialize",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Cancelled => "cancelled",
            Self::ReadBody => "read_body",
            Self::HttpStatus => "http_status",
            Self::Deserialize => "deserialize",
            Self::DecodeContentEncoding => "decode_content_encoding",
            Self::Configuration => "configuration",
            Self::MissingRedirectLocation => "missing_redirect_location",
            Self::InvalidRedirectLocation => "invalid_redirect_location",
            Self::RedirectLimitExceeded => "redirect_limit_exceeded",
            Self::MissingOperationLocation => "missing_operation_location",
            Self::OperationFailed => "operation_failed",
            Self::OperationCancelled => "operation_cancelled",
            Self::ResumeToken => "resume_token",
            Self::Runtime => "runtime",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("failed to build http request: {source}")]
    RequestBuild {
        #[source]
        source: http::Error,
    },
    #[error("failed to serialize request body: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("http request timed out after {timeout_ms}ms for {method} {uri}")]
    Timeout {
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("call deadline exceeded for {method} {uri}")]
    DeadlineExceeded { method: Method, uri: String },
    #[error("call cancelled by caller")]
    Cancelled,
    #[error("failed to read response body: {source}")]
    ReadBody {
        #[source]
        source: BoxError,
    },
    #[error("http status error {status} ({kind}) for {method} {uri}: {body}")]
    HttpStatus {
        status: u16,
        kind: HttpErrorKind,
        method: Method,
        uri: String,
        headers: Box<HeaderMap>,
        body: String,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
        body: String,
    },
    #[error("failed to decode response content-encoding {encoding}: {message}")]
    DecodeContentEncoding { encoding: String, message: String },
    #[error("invalid pipeline configuration: {message}")]
    Configuration { message: String },
    #[error("redirect response {status} missing location header for {method} {uri}")]
    MissingRedirectLocation {
        status: u16,
        method: Method,
        uri: String,
    },
    #[error("invalid redirect location {location} for {method} {uri}")]
    InvalidRedirectLocation {
        location: String,
        method: Method,
        uri: String,
    },
    #[error("redirect limit exceeded ({max_redirects}) for {method} {uri}")]
    RedirectLimitExceeded {
        max_redirects: usize,
        method: Method,
        uri: String,
    },
    #[error("response {status} carries no operation monitor header")]
    MissingOperationLocation { status: u16 },
    #[error("long-running operation failed with status {status}: {body}")]
    OperationFailed { status: u16, body: String },
    #[error("long-running operation was cancelled")]
    OperationCancelled,
    #[error("invalid resume token: {message}")]
    ResumeToken { message: String },
    #[error("failed to start blocking runtime: {source}")]
    Runtime {
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Shared(Arc<Error>),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::RequestBuild { .. } => ErrorCode::RequestBuild,
            Self::Serialize { .. } => ErrorCode::Serialize,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::DeadlineExceeded { .. } => ErrorCode::DeadlineExceeded,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::ReadBody { .. } => ErrorCode::ReadBody,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::DecodeContentEncoding { .. } => ErrorCode::DecodeContentEncoding,
            Self::Configuration { .. } => ErrorCode::Configuration,
            Self::MissingRedirectLocation { .. } => ErrorCode::MissingRedirectLocation,
            Self::InvalidRedirectLocation { .. } => ErrorCode::InvalidRedirectLocation,
            Self::RedirectLimitExceeded { .. } => ErrorCode::RedirectLimitExceeded,
            Self::MissingOperationLocation { .. } => ErrorCode::MissingOperationLocation,
            Self::OperationFailed { .. } => ErrorCode::OperationFailed,
            Self::OperationCancelled => ErrorCode::OperationCancelled,
            Self::ResumeToken { .. } => ErrorCode::ResumeToken,
            Self::Runtime { .. } => ErrorCode::Runtime,
            Self::Shared(inner) => inner.code(),
        }
    }

    /// Status code of the underlying response, when this error carries one.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::OperationFailed { status, .. } => Some(*status),
            Self::Shared(inner) => inner.http_status(),
            _ => None,
        }
    }

    pub fn http_error_kind(&self) -> Option<HttpErrorKind> {
        match self {
            Self::HttpStatus { kind, .. } => Some(*kind),
            Self::Shared(inner) => inner.http_error_kind(),
            _ => None,
        }
    }

    pub fn transport_kind(&self) -> Option<TransportErrorKind> {
        match self {
            Self::Transport { kind, .. } => Some(*kind),
            Self::Shared(inner) => inner.transport_kind(),
            _ => None,
        }
    }

    /// Cancellation-class failures are never treated as retryable.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::Cancelled | ErrorCode::DeadlineExceeded | ErrorCode::OperationCancelled
        )
    }

    pub(crate) fn is_transient_transport(&self) -> bool {
        matches!(self.code(), ErrorCode::Transport | ErrorCode::Timeout)
    }
}

impl From<Arc<Error>> for Error {
    fn from(shared: Arc<Error>) -> Self {
        Self::Shared(shared)
    }
}
