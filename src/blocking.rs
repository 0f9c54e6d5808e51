use std::sync::Arc;

use bytes::Bytes;
use tokio::runtime::Runtime;

use crate::PipexResult;
use crate::context::Context;
use crate::error::Error;
use crate::lro::{Poller, PollerOptions, ResultDeserializer};
use crate::paging::Pager;
use crate::pipeline::Pipeline;
use crate::request::Request;
use crate::response::Response;

/// Thread-per-call execution mode over the shared async core.
///
/// Owns a runtime and blocks the calling thread for each call; pipeline,
/// retry, polling, and paging semantics are identical to the async mode
/// because the same [`Pipeline`] runs underneath. Must not be used from
/// inside an async runtime — blocking a runtime thread deadlocks it.
#[derive(Clone, Debug)]
pub struct BlockingPipeline {
    pipeline: Pipeline,
    runtime: Arc<Runtime>,
}

impl BlockingPipeline {
    pub fn new(pipeline: Pipeline) -> PipexResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .map_err(|source| Error::Runtime { source })?;
        Ok(Self {
            pipeline,
            runtime: Arc::new(runtime),
        })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Runs one call to completion, blocking the current thread.
    pub fn run(&self, context: &Context, request: Request) -> PipexResult<Response> {
        self.runtime.block_on(self.pipeline.run(context, request))
    }

    /// Buffers a response body obtained from [`run`](BlockingPipeline::run).
    pub fn collect(&self, response: &mut Response) -> PipexResult<Bytes> {
        self.runtime.block_on(response.collect())
    }

    /// Issues the initial request of a long-running operation and returns
    /// its poller.
    pub fn begin_operation<T>(
        &self,
        context: &Context,
        request: Request,
        options: PollerOptions,
        deserializer: ResultDeserializer<T>,
    ) -> PipexResult<Poller<T>> {
        self.runtime.block_on(Poller::begin(
            self.pipeline.clone(),
            context.clone(),
            request,
            options,
            deserializer,
        ))
    }

    /// Drives a poller to its terminal state, blocking between polls.
    pub fn wait_for<T>(&self, poller: &mut Poller<T>) -> PipexResult<T> {
        self.runtime.block_on(poller.wait())
    }

    /// Adapts a pager into a blocking iterator of items.
    pub fn iter_pages<T>(&self, pager: Pager<T>) -> BlockingPages<T> {
        BlockingPages {
            runtime: Arc::clone(&self.runtime),
            pager,
        }
    }
}

/// Blocking iterator over a [`Pager`]; each `next` may perform network I/O.
pub struct BlockingPages<T> {
    runtime: Arc<Runtime>,
    pager: Pager<T>,
}

impl<T> Iterator for BlockingPages<T> {
    type Item = PipexResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.runtime.block_on(self.pager.next())
    }
}
