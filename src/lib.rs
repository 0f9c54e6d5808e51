//! `pipex` is an internal HTTP pipeline runtime for control-plane API SDKs.
//!
//! Requests flow through an ordered chain of policies — request stamping,
//! redirects, bounded retry with backoff, logging, tracing, content
//! decoding — terminated by a pluggable transport. On top of the pipeline
//! sit the two request shapes control planes need: resumable long-running
//! operations and cursor-paginated listings.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use pipex::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = Pipeline::builder()
//!         .client_name("widgets-sdk")
//!         .api_version("2023-06-01")
//!         .retry(
//!             RetryPolicy::standard()
//!                 .max_attempts(4)
//!                 .base_backoff(Duration::from_millis(200)),
//!         )
//!         .build()?;
//!
//!     let context = Context::new();
//!     let request = Request::get("https://api.example.com/v1/widgets/w1");
//!
//!     // Await the handle directly, or use it as a scoped acquisition that
//!     // releases the connection on every exit path.
//!     let mut handle = pipeline.send(&context, request);
//!     {
//!         let scoped = handle.scoped().await?;
//!         println!("status={}", scoped.status());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Recommended Defaults
//!
//! - Use `RetryPolicy::standard()` for SDK traffic.
//! - Give every call a `Context` with a deadline or cancellation token.
//! - For `POST` retries, always set `idempotency_key(...)`.

pub(crate) const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

pub mod blocking;
mod context;
mod decode;
mod error;
mod handle;
mod lro;
mod paging;
mod pipeline;
mod policy;
mod request;
mod response;
mod retry;
mod transport;
mod util;

pub use tokio_util::sync::CancellationToken;

pub use crate::context::Context;
pub use crate::decode::ContentDecodePolicy;
pub use crate::error::{Error, ErrorCode, HttpErrorKind, TransportErrorKind};
pub use crate::handle::{ResponseHandle, ScopedResponse};
pub use crate::lro::{
    BodyStatus, HttpStatus, OperationState, OperationStatus, Poller, PollerOptions,
    ResultDeserializer, StatusStrategy, json_deserializer,
};
pub use crate::paging::{Page, PageExtractor, Pager, PagerStream, json_page_extractor};
pub use crate::pipeline::{Pipeline, PipelineBuilder};
pub use crate::policy::{
    HeadersPolicy, LoggingPolicy, Policy, RedirectPolicy, RequestIdPolicy, TracingPolicy,
    UserAgentPolicy, send_next,
};
pub use crate::request::{Body, CallOptions, Request, ResponseMode, SharedStream};
pub use crate::response::{Response, ResponseBody, StreamingBody};
pub use crate::retry::{RetryAttempts, RetryPolicy};
pub use crate::transport::{HyperTransport, Transport};

pub type PipexResult<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        BodyStatus, CancellationToken, Context, Error, ErrorCode, HttpErrorKind, OperationStatus,
        Page, Pager, Pipeline, PipelineBuilder, PipexResult, Policy, Poller, PollerOptions,
        RedirectPolicy, Request, Response, ResponseHandle, ResponseMode, RetryPolicy, Transport,
        TransportErrorKind, json_deserializer, json_page_extractor,
    };
}
