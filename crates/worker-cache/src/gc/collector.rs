use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::GcConfig;

use super::{
    Disposable, DisposeError, ResourceTracker, SizeError, SysinfoMonitor, SystemMonitor,
    resource_key,
};

/// Counts of a single collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectStats {
    /// Resources that were disposed and left the registry.
    pub disposed: usize,
    /// Resources that were chosen but refused disposal because they are referenced.
    pub in_use: usize,
    /// Resources that were not chosen.
    pub retained: usize,
}

/// Disposes the least recently used resources while the system runs short on disk space or
/// memory.
///
/// Without a disk threshold (or without a storage folder to sample) disk space is always
/// considered short, and the same goes for memory. A collector without any configuration
/// therefore reclaims every idle resource on each pass.
pub struct GarbageCollector {
    storage_folder: Option<PathBuf>,
    min_free_disk_space: Option<u64>,
    min_free_memory: Option<u64>,
    monitor: Box<dyn SystemMonitor>,
    resources: Mutex<FxHashMap<usize, Arc<dyn Disposable>>>,
}

impl GarbageCollector {
    /// Creates a collector sampling the system through `sysinfo`.
    pub fn new(config: &GcConfig) -> Self {
        Self::with_monitor(config, SysinfoMonitor::new())
    }

    /// Creates a collector sampling the system through `monitor`.
    pub fn with_monitor<M: SystemMonitor + 'static>(config: &GcConfig, monitor: M) -> Self {
        if config.storage_folder.is_none() || config.min_free_disk_space.is_none() {
            tracing::warn!(
                "No disk space threshold configured, garbage collection reclaims all idle resources"
            );
        } else if config.min_free_memory.is_none() {
            tracing::warn!(
                "No memory threshold configured, garbage collection reclaims all idle resources"
            );
        }

        Self {
            storage_folder: config.storage_folder.clone(),
            min_free_disk_space: config.min_free_disk_space,
            min_free_memory: config.min_free_memory,
            monitor: Box::new(monitor),
            resources: Mutex::new(FxHashMap::default()),
        }
    }

    /// The number of registered resources.
    pub fn len(&self) -> usize {
        self.resources.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether free disk space is below the configured minimum.
    pub fn need_disk_space(&self) -> bool {
        let (Some(folder), Some(min_free)) = (&self.storage_folder, self.min_free_disk_space)
        else {
            return true;
        };

        match self.monitor.free_disk_space(folder) {
            Ok(free) => free < min_free,
            Err(e) => {
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    folder = %folder.display(),
                    "Failed to sample free disk space"
                );
                true
            }
        }
    }

    /// Whether available memory is below the configured minimum.
    pub fn need_memory(&self) -> bool {
        match self.min_free_memory {
            Some(min_free) => self.monitor.available_memory() < min_free,
            None => true,
        }
    }

    /// Disposes resources, least recently used first, until enough disk space and memory is
    /// free.
    ///
    /// Referenced resources stay registered. Any dispose error other than
    /// [`DisposeError::InUse`] aborts the pass.
    pub fn collect(&self) -> Result<CollectStats, DisposeError> {
        let start = Instant::now();
        let mut resources = self.resources.lock();

        let mut candidates: Vec<_> = resources
            .iter()
            .map(|(key, resource)| (*key, Arc::clone(resource), resource.last_used()))
            .collect();
        candidates.sort_by_key(|(_, _, last_used)| *last_used);

        let mut stats = CollectStats::default();
        let mut remaining = candidates.len();
        for (key, resource, _) in candidates {
            let need_disk_space = self.need_disk_space();
            let need_memory = self.need_memory();
            if !need_disk_space && !need_memory {
                break;
            }
            remaining -= 1;

            let mut chosen = need_disk_space && worth_reclaiming(resource.disk_size(), "disk");
            if !chosen && need_memory {
                chosen = worth_reclaiming(resource.memory_size(), "memory");
            }
            if !chosen {
                stats.retained += 1;
                continue;
            }

            match resource.dispose() {
                Ok(()) => {
                    resources.remove(&key);
                    stats.disposed += 1;
                }
                Err(DisposeError::InUse) => stats.in_use += 1,
                Err(e) => {
                    metric!(gauge("gc.registered") = resources.len() as u64);
                    return Err(e);
                }
            }
        }
        stats.retained += remaining;

        metric!(gauge("gc.registered") = resources.len() as u64);
        drop(resources);
        report(&stats, start.elapsed(), "collect");

        Ok(stats)
    }

    /// Disposes every resource regardless of system pressure.
    ///
    /// Referenced resources stay registered. Any dispose error other than
    /// [`DisposeError::InUse`] aborts the pass.
    pub fn collect_all(&self) -> Result<CollectStats, DisposeError> {
        let start = Instant::now();
        let mut resources = self.resources.lock();

        let mut stats = CollectStats::default();
        let mut result = Ok(());
        resources.retain(|_, resource| {
            if result.is_err() {
                return true;
            }
            match resource.dispose() {
                Ok(()) => {
                    stats.disposed += 1;
                    false
                }
                Err(DisposeError::InUse) => {
                    stats.in_use += 1;
                    true
                }
                Err(e) => {
                    result = Err(e);
                    true
                }
            }
        });

        metric!(gauge("gc.registered") = resources.len() as u64);
        drop(resources);
        result?;
        report(&stats, start.elapsed(), "collect_all");

        Ok(stats)
    }
}

/// Decides whether a resource of the given size is worth disposing.
fn worth_reclaiming(size: Result<u64, SizeError>, kind: &str) -> bool {
    match size {
        Ok(size) => size > 0,
        Err(SizeError::NotSupported) => true,
        Err(SizeError::Other(e)) => {
            let error: &dyn std::error::Error = e.as_ref();
            tracing::warn!(error, kind, "Failed to query resource size");
            false
        }
    }
}

fn report(stats: &CollectStats, duration: Duration, pass: &str) {
    if stats.disposed > 0 || stats.in_use > 0 {
        tracing::info!(
            disposed = stats.disposed,
            in_use = stats.in_use,
            retained = stats.retained,
            "Garbage collection ({pass}) complete"
        );
    } else {
        tracing::debug!(retained = stats.retained, "Nothing to collect ({pass})");
    }

    metric!(counter("gc.disposed") += stats.disposed as i64, "pass" => pass);
    metric!(counter("gc.in_use") += stats.in_use as i64, "pass" => pass);
    metric!(timer("gc.collect.duration") = duration, "pass" => pass);
}

impl ResourceTracker for GarbageCollector {
    fn register(&self, resource: Arc<dyn Disposable>) {
        let mut resources = self.resources.lock();
        resources.entry(resource_key(&resource)).or_insert(resource);
        metric!(gauge("gc.registered") = resources.len() as u64);
    }

    fn unregister(&self, resource: &Arc<dyn Disposable>) -> bool {
        let mut resources = self.resources.lock();
        let removed = resources.remove(&resource_key(resource)).is_some();
        metric!(gauge("gc.registered") = resources.len() as u64);
        removed
    }
}

impl fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("storage_folder", &self.storage_folder)
            .field("min_free_disk_space", &self.min_free_disk_space)
            .field("min_free_memory", &self.min_free_memory)
            .field("resources", &self.len())
            .finish()
    }
}

/// Runs [`GarbageCollector::collect`] every `interval` until `token` is cancelled.
///
/// Passes run on the blocking thread pool, since disposing resources may touch the file system.
/// Failed passes are logged and retried on the next tick.
pub fn spawn_collector(
    gc: Arc<GarbageCollector>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let gc = Arc::clone(&gc);
            match tokio::task::spawn_blocking(move || gc.collect()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        "Garbage collection failed"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        "Garbage collection panicked"
                    );
                }
            }
        }

        tracing::debug!("Garbage collector stopped");
    })
}

#[cfg(test)]
mod tests {
    use crate::test::{FakeDisposable, FakeMonitor};

    use super::*;

    const MB: u64 = 1024 * 1024;

    fn thresholds(disk: Option<u64>, memory: Option<u64>) -> GcConfig {
        GcConfig {
            storage_folder: Some(PathBuf::from("/var/cache/worker")),
            min_free_disk_space: disk,
            min_free_memory: memory,
            ..Default::default()
        }
    }

    fn register_all(gc: &GarbageCollector, resources: &[Arc<FakeDisposable>]) {
        for resource in resources {
            gc.register(Arc::clone(resource) as Arc<dyn Disposable>);
        }
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let gc = GarbageCollector::with_monitor(&GcConfig::default(), FakeMonitor::new(0, 0));
        let resource: Arc<dyn Disposable> = FakeDisposable::new().disk(MB).build();

        gc.register(Arc::clone(&resource));
        gc.register(Arc::clone(&resource));
        assert_eq!(gc.len(), 1);

        assert!(gc.unregister(&resource));
        assert!(!gc.unregister(&resource));
        assert!(gc.is_empty());
    }

    #[tokio::test]
    async fn test_collect_oldest_first() {
        tokio::time::pause();
        let monitor = FakeMonitor::new(10 * MB, u64::MAX);
        let gc = GarbageCollector::with_monitor(
            &thresholds(Some(25 * MB), Some(0)),
            monitor.clone(),
        );

        let mut resources = Vec::new();
        for _ in 0..4 {
            resources.push(FakeDisposable::new().disk(10 * MB).freeing(&monitor).build());
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        // Shuffle registration order, the collector goes by last use only.
        register_all(
            &gc,
            &[
                resources[2].clone(),
                resources[0].clone(),
                resources[3].clone(),
                resources[1].clone(),
            ],
        );

        let stats = gc.collect().unwrap();

        assert_eq!(stats.disposed, 2);
        assert_eq!(stats.retained, 2);
        assert!(resources[0].is_disposed());
        assert!(resources[1].is_disposed());
        assert!(!resources[2].is_disposed());
        assert!(!resources[3].is_disposed());
        assert_eq!(gc.len(), 2);
    }

    #[tokio::test]
    async fn test_collect_nothing_without_pressure() {
        let monitor = FakeMonitor::new(100 * MB, 100 * MB);
        let gc = GarbageCollector::with_monitor(
            &thresholds(Some(10 * MB), Some(10 * MB)),
            monitor.clone(),
        );
        let resource = FakeDisposable::new().disk(MB).memory(MB).build();
        register_all(&gc, &[resource.clone()]);

        let stats = gc.collect().unwrap();

        assert_eq!(stats.disposed, 0);
        assert_eq!(stats.retained, 1);
        assert!(!resource.is_disposed());
    }

    #[tokio::test]
    async fn test_collect_memory_pressure() {
        tokio::time::pause();
        let monitor = FakeMonitor::new(100 * MB, 0);
        let gc = GarbageCollector::with_monitor(
            &thresholds(Some(10 * MB), Some(5 * MB)),
            monitor.clone(),
        );

        // No memory to gain from the disk-only resource.
        let disk_only = FakeDisposable::new().disk(MB).memory(0).freeing(&monitor).build();
        tokio::time::advance(Duration::from_secs(1)).await;
        let in_memory = FakeDisposable::new().memory(8 * MB).freeing(&monitor).build();
        register_all(&gc, &[disk_only.clone(), in_memory.clone()]);

        let stats = gc.collect().unwrap();

        assert_eq!(stats, CollectStats {
            disposed: 1,
            in_use: 0,
            retained: 1
        });
        assert!(!disk_only.is_disposed());
        assert!(in_memory.is_disposed());
    }

    #[tokio::test]
    async fn test_collect_unsupported_size_is_reclaimed() {
        let monitor = FakeMonitor::new(0, 0);
        let gc = GarbageCollector::with_monitor(&thresholds(Some(MB), Some(MB)), monitor);
        let unknown_size = FakeDisposable::new().build();
        let broken = FakeDisposable::new().failing_size().build();
        register_all(&gc, &[unknown_size.clone(), broken.clone()]);

        let stats = gc.collect().unwrap();

        assert_eq!(stats.disposed, 1);
        assert_eq!(stats.retained, 1);
        assert!(unknown_size.is_disposed());
        assert!(!broken.is_disposed());
    }

    #[tokio::test]
    async fn test_collect_keeps_resources_in_use() {
        let gc = GarbageCollector::with_monitor(&GcConfig::default(), FakeMonitor::new(0, 0));
        let busy = FakeDisposable::new().disk(MB).build();
        busy.set_in_use(true);
        register_all(&gc, &[busy.clone()]);

        let stats = gc.collect().unwrap();
        assert_eq!(stats.in_use, 1);
        assert_eq!(gc.len(), 1);

        busy.set_in_use(false);
        let stats = gc.collect().unwrap();
        assert_eq!(stats.disposed, 1);
        assert!(gc.is_empty());
        assert_eq!(busy.dispose_count(), 1);
    }

    #[tokio::test]
    async fn test_collect_aborts_on_error() {
        tokio::time::pause();
        let gc = GarbageCollector::with_monitor(&GcConfig::default(), FakeMonitor::new(0, 0));
        let broken = FakeDisposable::new().disk(MB).failing_dispose().build();
        tokio::time::advance(Duration::from_secs(1)).await;
        let healthy = FakeDisposable::new().disk(MB).build();
        register_all(&gc, &[broken.clone(), healthy.clone()]);

        let result = gc.collect();

        assert!(matches!(result, Err(DisposeError::Other(_))));
        assert!(!healthy.is_disposed());
        assert_eq!(gc.len(), 2);
    }

    #[tokio::test]
    async fn test_collect_disk_sampling_failure() {
        let monitor = FakeMonitor::new(100 * MB, u64::MAX);
        monitor.fail_disk_sampling();
        let gc = GarbageCollector::with_monitor(&thresholds(Some(MB), None), monitor);

        assert!(gc.need_disk_space());
    }

    #[tokio::test]
    async fn test_collect_all() {
        let monitor = FakeMonitor::new(u64::MAX, u64::MAX);
        let gc = GarbageCollector::with_monitor(&thresholds(Some(MB), Some(MB)), monitor);
        let idle = FakeDisposable::new().disk(MB).build();
        let busy = FakeDisposable::new().disk(MB).build();
        busy.set_in_use(true);
        register_all(&gc, &[idle.clone(), busy.clone()]);

        let stats = gc.collect_all().unwrap();

        assert_eq!(stats.disposed, 1);
        assert_eq!(stats.in_use, 1);
        assert!(idle.is_disposed());
        assert!(!busy.is_disposed());
        assert_eq!(gc.len(), 1);
    }

    #[tokio::test]
    async fn test_spawn_collector() {
        let gc = Arc::new(GarbageCollector::with_monitor(
            &GcConfig::default(),
            FakeMonitor::new(0, 0),
        ));
        let resource = FakeDisposable::new().disk(MB).build();
        register_all(&gc, &[resource.clone()]);

        let token = CancellationToken::new();
        let handle = spawn_collector(Arc::clone(&gc), Duration::from_millis(10), token.clone());

        for _ in 0..100 {
            if resource.is_disposed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(resource.is_disposed());
        assert!(gc.is_empty());

        token.cancel();
        handle.await.unwrap();
    }
}
