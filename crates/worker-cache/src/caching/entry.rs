use std::sync::{Arc, OnceLock, Weak};

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::Shared;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::context::ContextRef;
use crate::gc::{Disposable, DisposeError, LastUsed, SizeError};

use super::{ContextConjunction, OptionsHash, Resource};

/// The entries of a cache, in creation order.
pub(crate) type EntryList<R> = Mutex<Vec<Arc<CacheEntry<R>>>>;

/// The result of a construction, shared by everybody waiting for it.
pub(crate) type Outcome<R> = Result<Arc<R>, Arc<anyhow::Error>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    /// The entry can be joined.
    Active,
    /// The entry was purged while referenced and is disposed by the last release.
    PendingPurge,
    /// The entry is gone. Its resource was disposed, or never came to be.
    Disposed,
}

#[derive(Debug)]
struct EntryState {
    ref_count: usize,
    lifecycle: Lifecycle,
}

/// What [`CacheEntry::mark_for_purge`] decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PurgeMark {
    /// The entry was not active.
    Skipped,
    /// The entry is referenced, its last release disposes it.
    Deferred,
    /// The entry is unreferenced and must be disposed with [`CacheEntry::dispose_marked`].
    Dispose,
}

/// A single construction and the resource it produced.
///
/// Lock order: the entry list of the cache is always locked before the state of an entry, and
/// no method calls into the list or a tracker while holding the state lock.
pub(crate) struct CacheEntry<R> {
    options_hash: OptionsHash,
    cache_name: &'static str,
    state: Mutex<EntryState>,
    last_used: LastUsed,
    outcome: OnceLock<Outcome<R>>,
    completed: Shared<oneshot::Receiver<()>>,
    conjunction: Arc<ContextConjunction>,
    entries: Weak<EntryList<R>>,
}

impl<R: Resource> CacheEntry<R> {
    /// Creates an entry referenced by `founder`.
    ///
    /// The returned sender signals completion once the outcome is set.
    pub fn new(
        options_hash: OptionsHash,
        cache_name: &'static str,
        founder: ContextRef,
        entries: Weak<EntryList<R>>,
    ) -> (Arc<Self>, oneshot::Sender<()>) {
        let (sender, receiver) = oneshot::channel();
        let entry = Arc::new(Self {
            options_hash,
            cache_name,
            state: Mutex::new(EntryState {
                ref_count: 1,
                lifecycle: Lifecycle::Active,
            }),
            last_used: LastUsed::new(),
            outcome: OnceLock::new(),
            completed: receiver.shared(),
            conjunction: ContextConjunction::new(founder),
            entries,
        });
        (entry, sender)
    }

    pub fn options_hash(&self) -> &OptionsHash {
        &self.options_hash
    }

    /// The context constructions of this entry run under.
    pub fn conjunction(&self) -> &Arc<ContextConjunction> {
        &self.conjunction
    }

    /// The outcome of the construction, once finished.
    pub fn outcome(&self) -> Option<&Outcome<R>> {
        self.outcome.get()
    }

    /// The constructed resource, if construction succeeded.
    pub fn resource(&self) -> Option<&Arc<R>> {
        self.outcome.get().and_then(|outcome| outcome.as_ref().ok())
    }

    /// Resolves once the construction finished or was abandoned.
    pub fn completed(&self) -> Shared<oneshot::Receiver<()>> {
        self.completed.clone()
    }

    #[cfg(test)]
    pub fn ref_count(&self) -> usize {
        self.state.lock().ref_count
    }

    /// Whether the entry was neither purged nor disposed.
    pub fn is_active(&self) -> bool {
        self.state.lock().lifecycle == Lifecycle::Active
    }

    /// Adds a reference on behalf of `ctx` if the entry can be reused.
    ///
    /// Exclusive entries are only reused once every previous holder released them. An entry
    /// still under construction is only joined if `ctx` could join its conjunction, since the
    /// construction is about to be cancelled otherwise.
    pub fn try_join(&self, ctx: &ContextRef, shared: bool) -> bool {
        let mut state = self.state.lock();
        if state.lifecycle != Lifecycle::Active {
            return false;
        }
        if !shared && state.ref_count > 0 {
            return false;
        }
        if !self.conjunction.add_context(Arc::clone(ctx)) && self.outcome.get().is_none() {
            return false;
        }
        state.ref_count += 1;
        true
    }

    /// Stores the constructed resource.
    pub fn complete(&self, resource: Arc<R>) {
        let _ = self.outcome.set(Ok(resource));
    }

    /// Stores a construction error and removes the entry from its cache.
    pub fn fail(&self, error: Arc<anyhow::Error>) {
        self.state.lock().lifecycle = Lifecycle::Disposed;
        let _ = self.outcome.set(Err(error));
        self.remove_from_cache();
    }

    /// Drops a reference, disposing the resource if this was the last reference of a purged
    /// entry.
    ///
    /// # Panics
    ///
    /// Panics if the entry is not referenced.
    pub fn release(&self) {
        let dispose = {
            let mut state = self.state.lock();
            assert!(state.ref_count > 0, "released an unreferenced cache entry");
            state.ref_count -= 1;
            self.last_used.touch();

            let dispose = state.ref_count == 0 && state.lifecycle == Lifecycle::PendingPurge;
            if dispose {
                state.lifecycle = Lifecycle::Disposed;
            }
            dispose
        };

        if dispose {
            match self.dispose_marked(Lifecycle::PendingPurge) {
                Ok(()) | Err(DisposeError::InUse) => {}
                Err(e) => {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        cache = self.cache_name,
                        options_hash = %self.options_hash,
                        "Failed to dispose purged resource"
                    );
                }
            }
        }
    }

    /// Marks a successfully constructed, active entry for purging.
    pub fn mark_for_purge(&self) -> PurgeMark {
        let mut state = self.state.lock();
        if state.lifecycle != Lifecycle::Active || self.resource().is_none() {
            return PurgeMark::Skipped;
        }
        if state.ref_count > 0 {
            state.lifecycle = Lifecycle::PendingPurge;
            PurgeMark::Deferred
        } else {
            state.lifecycle = Lifecycle::Disposed;
            PurgeMark::Dispose
        }
    }

    /// Claims a purged entry whose resource refused an earlier disposal.
    ///
    /// Returns `true` if the entry must now be disposed with [`Self::dispose_purged`].
    pub fn retry_pending_purge(&self) -> bool {
        let mut state = self.state.lock();
        if state.lifecycle == Lifecycle::PendingPurge && state.ref_count == 0 {
            state.lifecycle = Lifecycle::Disposed;
            true
        } else {
            false
        }
    }

    /// Disposes an entry claimed by [`Self::mark_for_purge`] or [`Self::retry_pending_purge`].
    ///
    /// If the resource refuses with [`DisposeError::InUse`] the purge mark stays.
    pub fn dispose_purged(&self) -> Result<(), DisposeError> {
        self.dispose_marked(Lifecycle::PendingPurge)
    }

    /// Disposes the resource of an entry that was just moved to [`Lifecycle::Disposed`].
    ///
    /// `rollback` is restored if the resource refuses with [`DisposeError::InUse`]. Any other
    /// outcome removes the entry from its cache for good.
    fn dispose_marked(&self, rollback: Lifecycle) -> Result<(), DisposeError> {
        let result = match self.resource() {
            Some(resource) => resource.dispose(),
            None => Ok(()),
        };

        match result {
            Err(DisposeError::InUse) => {
                self.state.lock().lifecycle = rollback;
                tracing::debug!(
                    cache = self.cache_name,
                    options_hash = %self.options_hash,
                    "Resource refused disposal while in use"
                );
                Err(DisposeError::InUse)
            }
            result => {
                self.remove_from_cache();
                if result.is_ok() {
                    tracing::info!(
                        cache = self.cache_name,
                        options_hash = %self.options_hash,
                        "Disposed resource"
                    );
                }
                result
            }
        }
    }

    /// Removes this entry from the entry list of its cache, if it is still there.
    fn remove_from_cache(&self) {
        if let Some(entries) = self.entries.upgrade() {
            entries
                .lock()
                .retain(|entry| !std::ptr::eq(Arc::as_ptr(entry), self));
        }
    }
}

impl<R: Resource> Disposable for CacheEntry<R> {
    fn memory_size(&self) -> Result<u64, SizeError> {
        match self.resource() {
            Some(resource) => resource.memory_size(),
            None => Err(SizeError::NotSupported),
        }
    }

    fn disk_size(&self) -> Result<u64, SizeError> {
        match self.resource() {
            Some(resource) => resource.disk_size(),
            None => Err(SizeError::NotSupported),
        }
    }

    fn dispose(&self) -> Result<(), DisposeError> {
        let previous = {
            let mut state = self.state.lock();
            if state.ref_count > 0 {
                return Err(DisposeError::InUse);
            }
            if state.lifecycle == Lifecycle::Disposed {
                return Ok(());
            }
            std::mem::replace(&mut state.lifecycle, Lifecycle::Disposed)
        };

        self.dispose_marked(previous)
    }

    fn last_used(&self) -> Instant {
        self.last_used.get()
    }
}
