use std::sync::Arc;

use thiserror::Error;

use crate::context::ContextError;

/// An error returned by [`Cache::require`](super::Cache::require).
///
/// This is cheap to clone, so that every caller waiting for the same construction receives the
/// very same error.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The options could not be serialized into their canonical form.
    #[error("invalid resource options")]
    InvalidOptions(#[source] Arc<serde_json::Error>),
    /// The context of the caller was done before the resource was ready.
    #[error(transparent)]
    Canceled(#[from] ContextError),
    /// Constructing the resource failed.
    #[error("failed to construct resource: {0:#}")]
    Construction(Arc<anyhow::Error>),
}

impl CacheError {
    /// Whether this error originates from the context of the caller.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled(_))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidOptions(Arc::new(err))
    }
}
