use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::PipexResult;
use crate::context::Context;
use crate::error::Error;
use crate::pipeline::Pipeline;
use crate::request::Request;
use crate::util::{rewrite_query_parameter, truncate_body};

const API_VERSION_PARAMETER: &str = "api-version";

/// One fetched page: an ordered item sequence plus an optional
/// continuation reference. Immutable once produced.
#[derive(Clone, Debug)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub continuation: Option<String>,
}

/// Turns a fetched response into a [`Page`].
pub type PageExtractor<T> =
    Arc<dyn Fn(StatusCode, &HeaderMap, &Bytes) -> PipexResult<Page<T>> + Send + Sync>;

/// JSON page extractor reading an item array and a continuation link by
/// field name (`"value"`/`"nextLink"` in the common control-plane shape).
pub fn json_page_extractor<T>(
    items_field: &'static str,
    next_link_field: &'static str,
) -> PageExtractor<T>
where
    T: DeserializeOwned,
{
    Arc::new(move |_status, _headers, body: &Bytes| {
        let value: serde_json::Value =
            serde_json::from_slice(body).map_err(|source| Error::Deserialize {
                source,
                body: truncate_body(body),
            })?;
        let items = match value.get(items_field) {
            Some(serde_json::Value::Array(raw_items)) => raw_items
                .iter()
                .map(|item| {
                    serde_json::from_value(item.clone()).map_err(|source| Error::Deserialize {
                        source,
                        body: truncate_body(body),
                    })
                })
                .collect::<PipexResult<Vec<T>>>()?,
            _ => Vec::new(),
        };
        let continuation = value
            .get(next_link_field)
            .and_then(|link| link.as_str())
            .filter(|link| !link.is_empty())
            .map(ToOwned::to_owned);
        Ok(Page { items, continuation })
    })
}

enum PagerState {
    Initial(Box<Request>),
    Continuation(String),
    Done,
}

/// Lazy, forward-only, non-restartable iterator over a paginated
/// collection. Alternates a fetch phase (initial request, then requests
/// rebuilt from each continuation reference) with an extract phase, and
/// hides page mechanics behind an item-at-a-time interface.
///
/// Continuation links keep every query parameter the server sent verbatim,
/// except the api-version parameter, which is overwritten with the
/// pipeline's configured version — servers may embed an inconsistent one.
/// Empty pages that carry a continuation are followed, not treated as the
/// end.
pub struct Pager<T> {
    pipeline: Pipeline,
    context: Context,
    state: PagerState,
    extractor: PageExtractor<T>,
    buffered: VecDeque<T>,
}

impl<T> std::fmt::Debug for Pager<T> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            PagerState::Initial(_) => "initial",
            PagerState::Continuation(_) => "continuation",
            PagerState::Done => "done",
        };
        formatter
            .debug_struct("Pager")
            .field("state", &state)
            .field("buffered", &self.buffered.len())
            .finish()
    }
}

impl<T> Pager<T> {
    pub fn new(
        pipeline: Pipeline,
        context: Context,
        first_request: Request,
        extractor: PageExtractor<T>,
    ) -> Self {
        Self {
            pipeline,
            context,
            state: PagerState::Initial(Box::new(first_request)),
            extractor,
            buffered: VecDeque::new(),
        }
    }

    /// Fetches the next page, or `None` once the last page reported no
    /// continuation reference.
    pub async fn next_page(&mut self) -> Option<PipexResult<Page<T>>> {
        let request = match std::mem::replace(&mut self.state, PagerState::Done) {
            PagerState::Initial(request) => *request,
            PagerState::Continuation(link) => match self.continuation_request(&link) {
                Ok(request) => request,
                Err(error) => return Some(Err(error)),
            },
            PagerState::Done => return None,
        };

        match self.fetch_page(request).await {
            Ok(page) => {
                if let Some(link) = &page.continuation {
                    self.state = PagerState::Continuation(link.clone());
                }
                Some(Ok(page))
            }
            Err(error) => Some(Err(error)),
        }
    }

    /// Yields the next item, transparently crossing page boundaries and
    /// following empty pages that still carry a continuation.
    pub async fn next(&mut self) -> Option<PipexResult<T>> {
        loop {
            if let Some(item) = self.buffered.pop_front() {
                return Some(Ok(item));
            }
            match self.next_page().await? {
                Ok(page) => {
                    debug!(items = page.items.len(), more = page.continuation.is_some(), "fetched page");
                    self.buffered.extend(page.items);
                }
                Err(error) => return Some(Err(error)),
            }
        }
    }

    /// Adapts the pager into a [`futures_core::Stream`] of items.
    pub fn into_stream(self) -> PagerStream<T>
    where
        T: Send + 'static,
    {
        PagerStream {
            inner: PagerStreamState::Idle(Box::new(self)),
        }
    }

    async fn fetch_page(&mut self, request: Request) -> PipexResult<Page<T>> {
        let mut response = self
            .pipeline
            .run(&self.context, request)
            .await?
            .error_for_status()
            .await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.collect().await?;
        (self.extractor)(status, &headers, &body)
    }

    fn continuation_request(&self, link: &str) -> PipexResult<Request> {
        let url = match self.pipeline.api_version() {
            Some(version) => rewrite_query_parameter(link, API_VERSION_PARAMETER, version)?,
            None => link.to_owned(),
        };
        Ok(Request::get(url))
    }
}

type PagerStepFuture<T> =
    Pin<Box<dyn Future<Output = (Option<PipexResult<T>>, Box<Pager<T>>)> + Send>>;

enum PagerStreamState<T> {
    Idle(Box<Pager<T>>),
    Fetching(PagerStepFuture<T>),
    Done,
}

/// Stream adapter over [`Pager::next`].
pub struct PagerStream<T> {
    inner: PagerStreamState<T>,
}

impl<T> futures_core::Stream for PagerStream<T>
where
    T: Send + 'static,
{
    type Item = PipexResult<T>;

    fn poll_next(
        self: Pin<&mut Self>,
        task_context: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match std::mem::replace(&mut this.inner, PagerStreamState::Done) {
                PagerStreamState::Idle(mut pager) => {
                    this.inner = PagerStreamState::Fetching(Box::pin(async move {
                        let item = pager.next().await;
                        (item, pager)
                    }));
                }
                PagerStreamState::Fetching(mut step) => match step.as_mut().poll(task_context) {
                    Poll::Pending => {
                        this.inner = PagerStreamState::Fetching(step);
                        return Poll::Pending;
                    }
                    Poll::Ready((item, pager)) => {
                        if item.is_some() {
                            this.inner = PagerStreamState::Idle(pager);
                        }
                        return Poll::Ready(item);
                    }
                },
                PagerStreamState::Done => return Poll::Ready(None),
            }
        }
    }
}
