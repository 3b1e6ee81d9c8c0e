//! Resource caching and garbage collection for the sandbox worker.
//!
//! The worker pulls images, preloads volumes and downloads artifacts on behalf of the tasks it
//! runs. This crate keeps those resources around between tasks:
//!
//!  - [`caching::Cache`] deduplicates concurrent requests for the same resource, hands out
//!    reference counted [`caching::Handle`]s and disposes purged resources once their last
//!    handle is released.
//!  - [`gc::GarbageCollector`] disposes the least recently used idle resources whenever free
//!    disk space or memory drops below the configured thresholds.
//!
//! Both only talk to the concrete resources through the [`caching::Resource`],
//! [`caching::Constructor`] and [`gc::Disposable`] traits.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod context;
pub mod gc;
pub mod logging;
pub mod utils;
