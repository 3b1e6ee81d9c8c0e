//! # Resource caching
//!
//! Building a sandbox usually needs a couple of expensive resources: a pulled image, a
//! preloaded volume, a downloaded archive. Many tasks ask for the very same resources, often at
//! the same time, so the worker keeps them around in a [`Cache`].
//!
//! ## Identity
//!
//! A resource is described by the options passed to its [`Constructor`]. The options are
//! serialized to canonical JSON and hashed into an [`OptionsHash`], which is the identity of the
//! resource. Two option values that only differ in the order of their object keys describe the
//! same resource.
//!
//! ## Entries
//!
//! Every construction lives in a cache entry, which goes through these steps:
//!
//! - It is created by the first [`Cache::require`] that finds no reusable entry. Exactly one
//!   construction task is spawned for it.
//! - Further requests for the same identity join the entry while it is constructing or after it
//!   completed. Each request holds a reference until its [`Handle`] is released.
//! - A failed construction removes the entry right away. Errors are never cached; the next
//!   request constructs again.
//! - A successful construction is registered with the [`ResourceTracker`] of the cache, which
//!   usually is the [`GarbageCollector`](crate::gc::GarbageCollector).
//! - The entry is disposed by the collector or by [`Cache::purge`] once nobody references it.
//!   Purging a referenced entry defers the disposal to the release of its last handle.
//!
//! ## Shared and exclusive caches
//!
//! A shared cache hands the same resource to every concurrent caller, which suits read-only
//! resources like images. An exclusive cache never hands a resource to a second caller while
//! the first one still holds it, and constructs another instance instead. This suits resources
//! that are mutated while in use, like writable volumes.
//!
//! ## Cancellation
//!
//! The construction runs under a [`ContextConjunction`] of the contexts of all callers waiting
//! for it. A caller giving up only stops its own wait; the construction is cancelled once every
//! caller gave up.
//!
//! ### Metrics
//!
//! All metrics are tagged with a `cache` field that corresponds to [`Constructor::NAME`]:
//!
//! - `caches.require`: All requests, tagged with `hit` whether an existing entry was joined.
//! - `caches.construction`: Finished constructions, tagged with `status`.
//! - `caches.purged`: Entries disposed or marked by a purge.

use futures::future::BoxFuture;
use serde::Serialize;

use crate::context::ContextRef;
use crate::gc::{DisposeError, SizeError};

mod cache;
mod conjunction;
mod entry;
mod error;
mod handle;
mod options_hash;


pub use cache::*;
pub use conjunction::*;
pub use error::*;
pub use handle::*;
pub use options_hash::*;

/// A resource held by a [`Cache`].
///
/// The cache keeps track of when a resource was last used, so unlike
/// [`Disposable`](crate::gc::Disposable) this only deals with sizes and disposal.
pub trait Resource: Send + Sync + 'static {
    /// The amount of memory in bytes that disposing would free.
    fn memory_size(&self) -> Result<u64, SizeError> {
        Err(SizeError::NotSupported)
    }

    /// The amount of disk space in bytes that disposing would free.
    fn disk_size(&self) -> Result<u64, SizeError> {
        Err(SizeError::NotSupported)
    }

    /// Releases the resource.
    ///
    /// The cache calls this at most once per successful call, and only when no handle to the
    /// resource is held. [`DisposeError::InUse`] makes the cache retry later.
    fn dispose(&self) -> Result<(), DisposeError>;
}

/// Builds the resources of a [`Cache`].
pub trait Constructor: Send + Sync + 'static {
    /// The description of a resource. Its hash is the identity of the resource.
    type Options: Serialize + Send + 'static;

    /// The resource being built.
    type Resource: Resource;

    /// The name of the cache, used in logs and metrics.
    const NAME: &'static str = "resources";

    /// Builds a new resource.
    ///
    /// Must stop early once `ctx` is done.
    fn construct(
        &self,
        ctx: ContextRef,
        options: Self::Options,
    ) -> BoxFuture<'_, anyhow::Result<Self::Resource>>;
}
