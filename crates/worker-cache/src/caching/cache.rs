use std::fmt;
use std::sync::Arc;

use anyhow::anyhow;
use futures::channel::oneshot;
use sentry::{Hub, SentryFutureExt};

use crate::context::{Context, ContextError, ContextRef};
use crate::gc::{Disposable, DisposeError, ResourceTracker};
use crate::utils::defer::defer;

use super::entry::{CacheEntry, EntryList, PurgeMark};
use super::{CacheError, Constructor, Handle, OptionsHash};

/// Counts of a single purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    /// Entries that were disposed right away.
    pub disposed: usize,
    /// Entries that are disposed once released, because they are referenced.
    pub deferred: usize,
}

/// A cache of resources built by a [`Constructor`].
///
/// See the [module documentation](super) for how entries are shared, reused and disposed.
pub struct Cache<C: Constructor> {
    constructor: Arc<C>,
    shared: bool,
    tracker: Arc<dyn ResourceTracker>,
    entries: Arc<EntryList<C::Resource>>,
}

impl<C: Constructor> Cache<C> {
    /// Creates a cache.
    ///
    /// A `shared` cache hands the same resource to all concurrent callers, an exclusive one never
    /// hands out a resource that is already held. Constructed resources are registered with
    /// `tracker`.
    pub fn new(constructor: C, shared: bool, tracker: Arc<dyn ResourceTracker>) -> Self {
        Self {
            constructor: Arc::new(constructor),
            shared,
            tracker,
            entries: Arc::new(EntryList::default()),
        }
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// The number of entries, including the ones still under construction.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a handle to the resource described by `options`, constructing it if needed.
    ///
    /// Concurrent calls for the same resource share a single construction. Waiting stops with
    /// [`CacheError::Canceled`] once `ctx` is done, which does not affect the construction
    /// as long as somebody else is still waiting for it.
    pub async fn require(
        &self,
        ctx: ContextRef,
        options: C::Options,
    ) -> Result<Handle<C::Resource>, CacheError> {
        let options_hash = OptionsHash::new(&options)?;
        let name = C::NAME;

        let (entry, sender) = {
            let mut entries = self.entries.lock();
            let joined = entries
                .iter()
                .find(|entry| {
                    entry.options_hash() == &options_hash && entry.try_join(&ctx, self.shared)
                })
                .cloned();

            match joined {
                Some(entry) => (entry, None),
                None => {
                    let (entry, sender) = CacheEntry::new(
                        options_hash,
                        name,
                        Arc::clone(&ctx),
                        Arc::downgrade(&self.entries),
                    );
                    entries.push(Arc::clone(&entry));
                    (entry, Some(sender))
                }
            }
        };

        match sender {
            Some(sender) => {
                tracing::debug!(cache = name, %options_hash, "Constructing resource");
                metric!(counter("caches.require") += 1, "cache" => name, "hit" => "false");
                self.spawn_construction(Arc::clone(&entry), sender, options);
            }
            None => {
                tracing::debug!(cache = name, %options_hash, "Joined existing resource");
                metric!(counter("caches.require") += 1, "cache" => name, "hit" => "true");
            }
        }

        wait(entry, ctx.as_ref()).await
    }

    /// Runs the constructor for a new entry on a separate task.
    fn spawn_construction(
        &self,
        entry: Arc<CacheEntry<C::Resource>>,
        sender: oneshot::Sender<()>,
        options: C::Options,
    ) {
        let constructor = Arc::clone(&self.constructor);
        let tracker = Arc::clone(&self.tracker);
        let ctx: ContextRef = Arc::clone(entry.conjunction()) as ContextRef;

        let construction = async move {
            // Fails the entry if this task is dropped or panics before finishing.
            let abandoned = defer({
                let entry = Arc::clone(&entry);
                move || {
                    entry.fail(Arc::new(anyhow!("resource construction was abandoned")));
                    entry.conjunction().dispose();
                }
            });

            let result = constructor.construct(ctx, options).await;
            abandoned.cancel();

            match result {
                Ok(resource) => {
                    entry.complete(Arc::new(resource));
                    let disposable = Arc::clone(&entry) as Arc<dyn Disposable>;
                    tracker.register(Arc::clone(&disposable));
                    // A purge between `complete` and `register` could not unregister the entry.
                    if !entry.is_active() {
                        tracker.unregister(&disposable);
                    }
                    metric!(counter("caches.construction") += 1, "cache" => C::NAME, "status" => "ok");
                }
                Err(e) => {
                    let error: &dyn std::error::Error = e.as_ref();
                    tracing::warn!(
                        error,
                        cache = C::NAME,
                        options_hash = %entry.options_hash(),
                        "Failed to construct resource"
                    );
                    metric!(counter("caches.construction") += 1, "cache" => C::NAME, "status" => "error");
                    entry.fail(Arc::new(e));
                }
            }

            entry.conjunction().dispose();
            sender.send(()).ok();
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        tokio::spawn(construction);
    }

    /// Purges all constructed resources matching `filter`.
    ///
    /// Unreferenced resources are disposed right away, referenced ones once their last handle
    /// is released. Purged resources are no longer handed out and stop being tracked. A
    /// dispose error other than [`DisposeError::InUse`] stops the purge.
    pub fn purge<F>(&self, mut filter: F) -> Result<PurgeStats, DisposeError>
    where
        F: FnMut(&C::Resource) -> bool,
    {
        let mut stats = PurgeStats::default();
        for entry in self.snapshot() {
            self.purge_entry(&entry, &mut filter, &mut stats)?;
        }
        report_purge(C::NAME, &stats);
        Ok(stats)
    }

    /// Purges all constructed resources.
    ///
    /// Unlike [`purge`](Self::purge) this keeps going after a failed disposal, and returns the
    /// first error.
    pub fn purge_all(&self) -> Result<PurgeStats, DisposeError> {
        let mut stats = PurgeStats::default();
        let mut first_error = None;
        for entry in self.snapshot() {
            if let Err(err) = self.purge_entry(&entry, &mut |_: &C::Resource| true, &mut stats) {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    cache = C::NAME,
                    "Failed to purge resource"
                );
                first_error.get_or_insert(err);
            }
        }
        report_purge(C::NAME, &stats);
        match first_error {
            Some(err) => Err(err),
            None => Ok(stats),
        }
    }

    fn snapshot(&self) -> Vec<Arc<CacheEntry<C::Resource>>> {
        self.entries.lock().clone()
    }

    fn purge_entry<F>(
        &self,
        entry: &Arc<CacheEntry<C::Resource>>,
        filter: &mut F,
        stats: &mut PurgeStats,
    ) -> Result<(), DisposeError>
    where
        F: FnMut(&C::Resource) -> bool,
    {
        // A resource that refused an earlier purge with `InUse` is retried regardless of the
        // filter, it was selected back then.
        let mark = if entry.retry_pending_purge() {
            PurgeMark::Dispose
        } else {
            match entry.resource() {
                Some(resource) if filter(&**resource) => entry.mark_for_purge(),
                _ => PurgeMark::Skipped,
            }
        };

        if mark == PurgeMark::Skipped {
            return Ok(());
        }
        self.tracker
            .unregister(&(Arc::clone(entry) as Arc<dyn Disposable>));

        match mark {
            PurgeMark::Dispose => match entry.dispose_purged() {
                Ok(()) => stats.disposed += 1,
                Err(DisposeError::InUse) => stats.deferred += 1,
                Err(e) => return Err(e),
            },
            _ => stats.deferred += 1,
        }
        Ok(())
    }
}

/// Waits for the construction of `entry` on behalf of a caller holding a reference to it.
///
/// The reference is handed over to the returned handle, or released on any error or when this
/// future is dropped.
async fn wait<R: super::Resource>(
    entry: Arc<CacheEntry<R>>,
    ctx: &dyn Context,
) -> Result<Handle<R>, CacheError> {
    let release = defer(|| entry.release());

    tokio::select! {
        biased;
        _ = entry.completed() => {}
        _ = ctx.done() => {
            return Err(CacheError::Canceled(ctx.err().unwrap_or(ContextError::Canceled)));
        }
    }

    match entry.outcome() {
        Some(Ok(resource)) => {
            let resource = Arc::clone(resource);
            release.cancel();
            Ok(Handle::new(Arc::clone(&entry), resource))
        }
        Some(Err(error)) => match ctx.err() {
            // The construction most likely stopped because this caller gave up as well.
            Some(err) => Err(CacheError::Canceled(err)),
            None => Err(CacheError::Construction(Arc::clone(error))),
        },
        None => Err(CacheError::Construction(Arc::new(anyhow!(
            "resource construction was abandoned"
        )))),
    }
}

fn report_purge(name: &'static str, stats: &PurgeStats) {
    if stats.disposed > 0 || stats.deferred > 0 {
        tracing::info!(
            cache = name,
            disposed = stats.disposed,
            deferred = stats.deferred,
            "Purged resources"
        );
    }
    metric!(counter("caches.purged") += (stats.disposed + stats.deferred) as i64, "cache" => name);
}

impl<C: Constructor> fmt::Debug for Cache<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("name", &C::NAME)
            .field("entries", &self.len())
            .field("shared", &self.shared)
            .finish()
    }
}
