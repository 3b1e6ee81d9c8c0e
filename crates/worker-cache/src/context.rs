//! Cancellation and progress reporting for resource construction.
//!
//! Every [`Cache::require`](crate::caching::Cache::require) call is made on behalf of a task,
//! and the task's [`Context`] decides how long the caller is willing to wait. Constructors
//! receive a context as well, which they use to notice that nobody is interested in the
//! resource anymore and to report download or build progress to the task logs.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// The reason a [`Context`] is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    /// The context was cancelled explicitly.
    #[error("context canceled")]
    Canceled,
    /// The deadline of the context has passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// A cancellable scope with a progress sink.
pub trait Context: Send + Sync {
    /// Resolves once the context is done.
    fn done(&self) -> BoxFuture<'_, ()>;

    /// Returns why the context is done, or `None` while it is still live.
    fn err(&self) -> Option<ContextError>;

    /// The point in time at which the context is done on its own.
    fn deadline(&self) -> Option<Instant> {
        None
    }

    /// Reports progress of a long running operation.
    ///
    /// `percent` is in the range `0.0..=1.0`.
    fn progress(&self, description: &str, percent: f64);
}

/// A shared, type-erased [`Context`].
pub type ContextRef = Arc<dyn Context>;

/// Receives progress reports of a [`TaskContext`].
pub type ProgressSink = Arc<dyn Fn(&str, f64) + Send + Sync>;

/// The [`Context`] of a single task.
///
/// Cancellation is driven by a [`CancellationToken`], so a task context can be cancelled from
/// anywhere that holds a clone of it. Progress goes to the sink configured with
/// [`with_progress`](Self::with_progress), or to a `debug` event otherwise.
#[derive(Clone, Default)]
pub struct TaskContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    progress: Option<ProgressSink>,
}

impl TaskContext {
    /// Creates a context that is only done once cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a deadline after which the context is done.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets a deadline `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Forwards progress reports to `sink`.
    pub fn with_progress<F>(mut self, sink: F) -> Self
    where
        F: Fn(&str, f64) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(sink));
        self
    }

    /// Creates a context that is cancelled together with this one, but can also be cancelled
    /// on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            progress: self.progress.clone(),
        }
    }

    /// Cancels this context and all of its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The token driving cancellation of this context.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Wraps the context into a [`ContextRef`].
    pub fn into_ref(self) -> ContextRef {
        Arc::new(self)
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("cancelled", &self.token.is_cancelled())
            .field("deadline", &self.deadline)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl Context for TaskContext {
    fn done(&self) -> BoxFuture<'_, ()> {
        async move {
            match self.deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = self.token.cancelled() => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => self.token.cancelled().await,
            }
        }
        .boxed()
    }

    fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            Some(ContextError::Canceled)
        } else if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            Some(ContextError::DeadlineExceeded)
        } else {
            None
        }
    }

    fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn progress(&self, description: &str, percent: f64) {
        match self.progress {
            Some(ref sink) => sink(description, percent),
            None => tracing::debug!(description, percent, "Progress"),
        }
    }
}
