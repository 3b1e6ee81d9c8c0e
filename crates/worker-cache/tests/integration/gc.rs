use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use worker_cache::caching::Cache;
use worker_cache::config::GcConfig;
use worker_cache::context::TaskContext;
use worker_cache::gc::{GarbageCollector, SysinfoMonitor, SystemMonitor, spawn_collector};
use worker_cache_test as test;

use crate::{ArtifactOptions, Downloader, FolderMonitor, list_files};

const KB: u64 = 1024;

fn gc_config(storage: &test::TempDir, min_free_disk_space: u64) -> GcConfig {
    GcConfig {
        storage_folder: Some(storage.path().to_owned()),
        min_free_disk_space: Some(min_free_disk_space),
        min_free_memory: Some(0),
        collect_interval: None,
    }
}

#[tokio::test]
async fn test_collect_oldest_artifacts_first() {
    test::setup();
    let storage = test::tempdir();
    // 100 KB of capacity, at least 50 KB must stay free.
    let gc = Arc::new(GarbageCollector::with_monitor(
        &gc_config(&storage, 50 * KB),
        FolderMonitor::new(100 * KB),
    ));
    let cache = Cache::new(Downloader::new(storage.path()), true, gc.clone());

    for name in ["a", "b", "c", "d"] {
        drop(
            cache
                .require(TaskContext::new().into_ref(), ArtifactOptions::new(name, 20 * KB))
                .await
                .unwrap(),
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(gc.len(), 4);

    // Touch `a`, which makes `b` the oldest.
    drop(
        cache
            .require(TaskContext::new().into_ref(), ArtifactOptions::new("a", 20 * KB))
            .await
            .unwrap(),
    );

    // 80 KB are used, so two artifacts have to go.
    let stats = gc.collect().unwrap();
    assert_eq!(stats.disposed, 2);
    assert_eq!(list_files(storage.path()), ["a-0", "d-3"]);
    assert_eq!(gc.len(), 2);
    assert_eq!(cache.len(), 2);

    // Enough space now.
    let stats = gc.collect().unwrap();
    assert_eq!(stats.disposed, 0);
}

#[tokio::test]
async fn test_held_artifacts_survive_collection() {
    test::setup();
    let storage = test::tempdir();
    let gc = Arc::new(GarbageCollector::with_monitor(
        &gc_config(&storage, u64::MAX),
        FolderMonitor::new(100 * KB),
    ));
    let cache = Cache::new(Downloader::new(storage.path()), true, gc.clone());

    let held = cache
        .require(TaskContext::new().into_ref(), ArtifactOptions::new("image", KB))
        .await
        .unwrap();
    drop(
        cache
            .require(TaskContext::new().into_ref(), ArtifactOptions::new("volume", KB))
            .await
            .unwrap(),
    );

    let stats = gc.collect_all().unwrap();
    assert_eq!(stats.disposed, 1);
    assert_eq!(stats.in_use, 1);
    assert_eq!(list_files(storage.path()), ["image-0"]);

    drop(held);
    let stats = gc.collect_all().unwrap();
    assert_eq!(stats.disposed, 1);
    assert!(list_files(storage.path()).is_empty());
    assert!(gc.is_empty());
    assert!(cache.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_periodic_collection() {
    test::setup();
    let storage = test::tempdir();
    let gc = Arc::new(GarbageCollector::with_monitor(
        &gc_config(&storage, u64::MAX),
        FolderMonitor::new(100 * KB),
    ));
    let cache = Cache::new(Downloader::new(storage.path()), true, gc.clone());
    let token = CancellationToken::new();
    let collector = spawn_collector(gc.clone(), Duration::from_millis(10), token.clone());

    drop(
        cache
            .require(TaskContext::new().into_ref(), ArtifactOptions::new("image", KB))
            .await
            .unwrap(),
    );

    test::wait_until(|| cache.is_empty()).await;
    assert!(list_files(storage.path()).is_empty());

    token.cancel();
    test::timeout(collector).await.unwrap();
}

#[tokio::test]
async fn test_sysinfo_monitor() {
    let monitor = SysinfoMonitor::new();
    assert!(monitor.available_memory() > 0);
    assert!(monitor.free_disk_space(&std::env::temp_dir().join("does-not-exist")).is_err());
}
