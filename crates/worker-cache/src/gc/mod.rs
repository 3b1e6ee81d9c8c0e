//! Garbage collection of idle resources under disk and memory pressure.
//!
//! Anything that can be reclaimed implements [`Disposable`] and is registered with a
//! [`ResourceTracker`], usually the [`GarbageCollector`]. The collector never looks inside a
//! resource: it asks for sizes, orders by [`Disposable::last_used`] and calls
//! [`Disposable::dispose`].

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;

mod collector;
mod monitor;

pub use collector::*;
pub use monitor::*;

/// An error returned when querying the size of a resource.
#[derive(Debug, Error)]
pub enum SizeError {
    /// The resource cannot tell how much it occupies.
    ///
    /// The collector treats such resources as worth reclaiming.
    #[error("size not supported")]
    NotSupported,
    /// Querying the size failed.
    #[error(transparent)]
    Other(anyhow::Error),
}

/// An error returned when disposing a resource.
#[derive(Debug, Error)]
pub enum DisposeError {
    /// The resource is still referenced and was left untouched.
    #[error("resource is in use")]
    InUse,
    /// Disposing failed.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A resource that can be reclaimed by the [`GarbageCollector`].
pub trait Disposable: Send + Sync {
    /// The amount of memory in bytes that disposing would free.
    fn memory_size(&self) -> Result<u64, SizeError>;

    /// The amount of disk space in bytes that disposing would free.
    fn disk_size(&self) -> Result<u64, SizeError>;

    /// Releases the resource.
    ///
    /// Returns [`DisposeError::InUse`] if the resource is currently referenced. Once this
    /// returned `Ok`, it is not called again.
    fn dispose(&self) -> Result<(), DisposeError>;

    /// The last time the resource was used.
    fn last_used(&self) -> Instant;
}

/// Keeps track of resources eligible for collection.
pub trait ResourceTracker: Send + Sync {
    /// Starts tracking `resource`. Registering the same resource twice is a no-op.
    fn register(&self, resource: Arc<dyn Disposable>);

    /// Stops tracking `resource`, returning whether it was tracked.
    fn unregister(&self, resource: &Arc<dyn Disposable>) -> bool;
}

/// A [`ResourceTracker`] that tracks nothing.
///
/// Resources of a cache using this tracker are only ever disposed by a purge.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracker;

impl ResourceTracker for NoopTracker {
    fn register(&self, _resource: Arc<dyn Disposable>) {}

    fn unregister(&self, _resource: &Arc<dyn Disposable>) -> bool {
        false
    }
}

/// Records when a resource was last used.
#[derive(Debug)]
pub struct LastUsed(Mutex<Instant>);

impl LastUsed {
    pub fn new() -> Self {
        Self(Mutex::new(Instant::now()))
    }

    /// Marks the resource as used right now.
    pub fn touch(&self) {
        *self.0.lock() = Instant::now();
    }

    pub fn get(&self) -> Instant {
        *self.0.lock()
    }
}

impl Default for LastUsed {
    fn default() -> Self {
        Self::new()
    }
}

/// The identity of a tracked resource, which is the address of its allocation.
pub(crate) fn resource_key(resource: &Arc<dyn Disposable>) -> usize {
    Arc::as_ptr(resource) as *const () as usize
}
