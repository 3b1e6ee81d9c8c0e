use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use worker_cache::caching::{Cache, CacheError, Constructor, Resource};
use worker_cache::context::{ContextRef, TaskContext};
use worker_cache::gc::{DisposeError, ResourceTracker, SizeError};

#[derive(Debug, Deserialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize)]
pub struct Workload {
    /// Number of callers requiring resources in parallel.
    pub concurrency: usize,
    /// Whether callers share resources or get one each.
    #[serde(default = "default_shared")]
    pub shared: bool,
    /// Number of distinct option sets the callers cycle through.
    #[serde(default = "default_variants")]
    pub variants: usize,
    /// Bytes allocated by every resource.
    #[serde(default)]
    pub size: usize,
    /// How long constructing a resource takes.
    #[serde(default, with = "humantime_serde")]
    pub construct: Duration,
    /// How long a caller keeps its handle.
    #[serde(default, with = "humantime_serde")]
    pub hold: Duration,
    /// Gives up on a `require` after this long.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

fn default_shared() -> bool {
    true
}

fn default_variants() -> usize {
    1
}

#[derive(Debug, Serialize)]
pub struct BlobOptions {
    workload: usize,
    variant: usize,
}

/// A chunk of memory standing in for a real resource.
pub struct Blob {
    data: Vec<u8>,
}

impl Resource for Blob {
    fn memory_size(&self) -> Result<u64, SizeError> {
        Ok(self.data.len() as u64)
    }

    fn disk_size(&self) -> Result<u64, SizeError> {
        Ok(0)
    }

    fn dispose(&self) -> Result<(), DisposeError> {
        Ok(())
    }
}

pub struct BlobFactory {
    size: usize,
    delay: Duration,
}

impl Constructor for BlobFactory {
    type Options = BlobOptions;
    type Resource = Blob;

    const NAME: &'static str = "blobs";

    fn construct(
        &self,
        ctx: ContextRef,
        options: BlobOptions,
    ) -> BoxFuture<'_, anyhow::Result<Blob>> {
        async move {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = ctx.done() => anyhow::bail!("construction of blob {} canceled", options.variant),
            }
            ctx.progress("allocate", 0.5);
            let data = vec![0xab; self.size];
            ctx.progress("allocate", 1.0);

            Ok(Blob { data })
        }
        .boxed()
    }
}

/// A workload with its own cache, ready to be run.
pub struct PreparedWorkload {
    pub concurrency: usize,
    index: usize,
    variants: usize,
    hold: Duration,
    timeout: Option<Duration>,
    next_variant: AtomicUsize,
    cache: Cache<BlobFactory>,
}

impl PreparedWorkload {
    pub fn new(index: usize, workload: Workload, tracker: Arc<dyn ResourceTracker>) -> Self {
        let factory = BlobFactory {
            size: workload.size,
            delay: workload.construct,
        };

        Self {
            concurrency: workload.concurrency,
            index,
            variants: workload.variants.max(1),
            hold: workload.hold,
            timeout: workload.timeout,
            next_variant: AtomicUsize::new(0),
            cache: Cache::new(factory, workload.shared, tracker),
        }
    }

    pub fn cache(&self) -> &Cache<BlobFactory> {
        &self.cache
    }

    /// Requires the next variant, holds it for a while and releases it again.
    pub async fn process(&self) -> Result<(), CacheError> {
        let variant = self.next_variant.fetch_add(1, Ordering::Relaxed) % self.variants;
        let mut ctx = TaskContext::new();
        if let Some(timeout) = self.timeout {
            ctx = ctx.with_timeout(timeout);
        }

        let options = BlobOptions {
            workload: self.index,
            variant,
        };
        let handle = self.cache.require(ctx.into_ref(), options).await?;
        // try to prevent the compiler from optimizing away the allocation:
        std::hint::black_box(handle.resource().data.first());

        tokio::time::sleep(self.hold).await;
        drop(handle);

        Ok(())
    }
}
