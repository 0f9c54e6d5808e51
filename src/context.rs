use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Per-call state threaded through every policy of a single logical call,
/// including all of its retries: a cancellation signal, an optional
/// deadline, and an insert-only bag of per-policy metadata.
///
/// Cloning a `Context` shares the same cancellation token and value bag;
/// the clone is not a fresh call scope.
#[derive(Clone, Debug, Default)]
pub struct Context {
    cancellation: CancellationToken,
    deadline: Option<Instant>,
    values: Arc<ValueBag>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches an externally owned cancellation token. Cancelling it aborts
    /// in-flight transport I/O, pending retry backoff, and LRO poll loops.
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Absolute deadline for the whole call, retries included.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.with_deadline(deadline)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancellation.cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Remaining time before the deadline; `None` when no deadline is set,
    /// `Some(ZERO)` once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn deadline_exceeded(&self) -> bool {
        matches!(self.remaining(), Some(remaining) if remaining.is_zero())
    }

    /// Records a value in the call's metadata bag. The first insert for a
    /// type wins; later inserts of the same type are ignored so policies
    /// re-run on retry attempts observe stable metadata.
    pub fn insert_value<T: Any + Send + Sync>(&self, value: T) -> Arc<T> {
        self.values.insert(value)
    }

    pub fn value<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.values.get()
    }
}

#[derive(Debug, Default)]
struct ValueBag {
    entries: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl ValueBag {
    fn insert<T: Any + Send + Sync>(&self, value: T) -> Arc<T> {
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = entries
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Arc::new(value));
        Arc::clone(entry)
            .downcast::<T>()
            .unwrap_or_else(|_| unreachable!("value bag entry keyed by its own TypeId"))
    }

    fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|entry| entry.downcast::<T>().ok())
    }
}
