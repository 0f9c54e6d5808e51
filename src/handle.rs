use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::Arc;

use crate::PipexResult;
use crate::error::Error;
use crate::response::Response;

type ResponseFuture = Pin<Box<dyn Future<Output = PipexResult<Response>> + Send>>;

/// A two-phase handle over one pipeline invocation.
///
/// The wrapped call executes at most once: the first await memoizes its
/// outcome, and every later access — [`get`](ResponseHandle::get),
/// [`scoped`](ResponseHandle::scoped), or
/// [`into_response`](ResponseHandle::into_response) — reuses the stored
/// response without issuing a second network call.
///
/// Two consumption modes are supported from the same handle:
///
/// - await the response directly with `get`/`into_response`, making
///   resource release the caller's responsibility;
/// - acquire it as a scoped resource with `scoped`: the returned guard
///   dereferences to the response and closes it exactly once on every exit
///   path, read or unread.
///
/// Dropping a handle that was never awaited drops the call without issuing
/// it — futures are lazy. A request built but never awaited is a caller
/// error, not something the runtime papers over with hidden background
/// work.
pub struct ResponseHandle {
    state: HandleState,
}

enum HandleState {
    Pending(ResponseFuture),
    Ready(Result<Response, Arc<Error>>),
}

impl std::fmt::Debug for ResponseHandle {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            HandleState::Pending(_) => "pending",
            HandleState::Ready(_) => "ready",
        };
        formatter
            .debug_struct("ResponseHandle")
            .field("state", &state)
            .finish()
    }
}

impl ResponseHandle {
    pub(crate) fn new(future: ResponseFuture) -> Self {
        Self {
            state: HandleState::Pending(future),
        }
    }

    async fn resolve(&mut self) {
        if let HandleState::Pending(future) = &mut self.state {
            let outcome = future.await.map_err(Arc::new);
            self.state = HandleState::Ready(outcome);
        }
    }

    /// Awaits the call (first time only) and returns the memoized response.
    pub async fn get(&mut self) -> PipexResult<&mut Response> {
        self.resolve().await;
        match &mut self.state {
            HandleState::Ready(Ok(response)) => Ok(response),
            HandleState::Ready(Err(shared)) => Err(Error::Shared(Arc::clone(shared))),
            HandleState::Pending(_) => unreachable!("resolve leaves the handle ready"),
        }
    }

    /// Awaits the call and returns a guard that closes the response —
    /// releasing its transport resource — when the scope ends.
    pub async fn scoped(&mut self) -> PipexResult<ScopedResponse<'_>> {
        let response = self.get().await?;
        Ok(ScopedResponse { response })
    }

    /// Awaits the call and takes ownership of the response.
    pub async fn into_response(mut self) -> PipexResult<Response> {
        self.resolve().await;
        match self.state {
            HandleState::Ready(Ok(response)) => Ok(response),
            HandleState::Ready(Err(shared)) => Err(Error::Shared(shared)),
            HandleState::Pending(_) => unreachable!("resolve leaves the handle ready"),
        }
    }
}

/// Scoped view of a memoized response. Dereferences to [`Response`]; the
/// drop closes the response exactly once, whether or not the body was read.
#[derive(Debug)]
pub struct ScopedResponse<'a> {
    response: &'a mut Response,
}

impl Deref for ScopedResponse<'_> {
    type Target = Response;

    fn deref(&self) -> &Self::Target {
        self.response
    }
}

impl DerefMut for ScopedResponse<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.response
    }
}

impl Drop for ScopedResponse<'_> {
    fn drop(&mut self) {
        self.response.close();
    }
}
