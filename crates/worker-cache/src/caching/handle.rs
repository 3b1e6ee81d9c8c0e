use std::fmt;
use std::sync::Arc;

use super::entry::CacheEntry;
use super::{OptionsHash, Resource};

/// A reference to a cached resource, returned by [`Cache::require`](super::Cache::require).
///
/// The resource is not disposed while the handle is held. Dropping the handle releases it.
pub struct Handle<R: Resource> {
    entry: Arc<CacheEntry<R>>,
    resource: Option<Arc<R>>,
}

impl<R: Resource> Handle<R> {
    pub(crate) fn new(entry: Arc<CacheEntry<R>>, resource: Arc<R>) -> Self {
        Self {
            entry,
            resource: Some(resource),
        }
    }

    /// The resource.
    ///
    /// # Panics
    ///
    /// Panics if the handle was released.
    pub fn resource(&self) -> &R {
        match self.resource {
            Some(ref resource) => resource,
            None => panic!("resource accessed through a released handle"),
        }
    }

    /// The identity of the resource.
    pub fn options_hash(&self) -> &OptionsHash {
        self.entry.options_hash()
    }

    pub fn is_released(&self) -> bool {
        self.resource.is_none()
    }

    /// Releases the resource. Releasing twice has no effect.
    pub fn release(&mut self) {
        if self.resource.take().is_some() {
            self.entry.release();
        }
    }
}

impl<R: Resource> Drop for Handle<R> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<R: Resource> fmt::Debug for Handle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("options_hash", self.entry.options_hash())
            .field("released", &self.is_released())
            .finish()
    }
}
