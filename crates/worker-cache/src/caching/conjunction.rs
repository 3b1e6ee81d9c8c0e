use std::fmt;
use std::sync::{Arc, OnceLock};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::context::{Context, ContextError, ContextRef};

#[derive(Default)]
struct Members {
    contexts: Vec<ContextRef>,
    resolved: bool,
}

/// A [`Context`] that is done once all of its member contexts are done.
///
/// A construction runs under the conjunction of the contexts of everybody waiting for it, so it
/// keeps going as long as one of them is still interested. The conjunction is also resolved
/// when it is disposed, which happens once the construction finished.
pub struct ContextConjunction {
    members: Mutex<Members>,
    disposed: CancellationToken,
    resolved: CancellationToken,
    error: OnceLock<ContextError>,
}

impl ContextConjunction {
    /// Creates a conjunction of `founder` and starts watching it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(founder: ContextRef) -> Arc<Self> {
        let conjunction = Arc::new(Self {
            members: Mutex::new(Members {
                contexts: vec![founder],
                resolved: false,
            }),
            disposed: CancellationToken::new(),
            resolved: CancellationToken::new(),
            error: OnceLock::new(),
        });

        tokio::spawn(Arc::clone(&conjunction).watch());
        conjunction
    }

    /// Adds a member, returning `false` if the conjunction is already resolved.
    pub fn add_context(&self, ctx: ContextRef) -> bool {
        let mut members = self.members.lock();
        if members.resolved {
            return false;
        }
        members.contexts.push(ctx);
        true
    }

    /// Resolves the conjunction regardless of its members.
    pub fn dispose(&self) {
        self.disposed.cancel();
    }

    /// Whether the conjunction is resolved.
    pub fn is_resolved(&self) -> bool {
        self.resolved.is_cancelled()
    }

    /// Awaits the members one after another, including the ones added while waiting.
    async fn watch(self: Arc<Self>) {
        let mut first_error = None;
        let mut index = 0;

        let error = loop {
            let next = {
                let mut members = self.members.lock();
                match members.contexts.get(index) {
                    Some(ctx) => Some(Arc::clone(ctx)),
                    None => {
                        members.resolved = true;
                        None
                    }
                }
            };
            let Some(ctx) = next else {
                break first_error.unwrap_or(ContextError::Canceled);
            };

            tokio::select! {
                biased;
                _ = self.disposed.cancelled() => {
                    self.members.lock().resolved = true;
                    break ContextError::Canceled;
                }
                _ = ctx.done() => {
                    first_error.get_or_insert(ctx.err().unwrap_or(ContextError::Canceled));
                    index += 1;
                }
            }
        };

        let _ = self.error.set(error);
        self.resolved.cancel();
    }
}

impl Context for ContextConjunction {
    fn done(&self) -> BoxFuture<'_, ()> {
        self.resolved.cancelled().boxed()
    }

    fn err(&self) -> Option<ContextError> {
        self.error.get().copied()
    }

    fn deadline(&self) -> Option<Instant> {
        None
    }

    /// Forwards the report to every member, one after another, in the order they joined.
    ///
    /// Members joining while the report is sent only receive the next one.
    fn progress(&self, description: &str, percent: f64) {
        let contexts = self.members.lock().contexts.clone();
        for ctx in contexts {
            ctx.progress(description, percent);
        }
    }
}

impl fmt::Debug for ContextConjunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextConjunction")
            .field("members", &self.members.lock().contexts.len())
            .field("resolved", &self.is_resolved())
            .field("error", &self.error.get())
            .finish()
    }
}
