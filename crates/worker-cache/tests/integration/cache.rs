use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Barrier;
use worker_cache::caching::{Cache, CacheError};
use worker_cache::context::{ContextError, TaskContext};
use worker_cache::gc::NoopTracker;
use worker_cache_test as test;

use crate::{ArtifactOptions, Downloader, list_files};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requires_share_one_download() {
    test::setup();
    let storage = test::tempdir();
    let downloader = Downloader::new(storage.path()).with_delay(Duration::from_millis(50));
    let cache = Arc::new(Cache::new(downloader.clone(), true, Arc::new(NoopTracker)));

    let mut tasks = Vec::new();
    for _ in 0..32 {
        let cache = Arc::clone(&cache);
        tasks.push(tokio::spawn(async move {
            let handle = cache
                .require(TaskContext::new().into_ref(), ArtifactOptions::new("rootfs", 1024))
                .await
                .unwrap();
            handle.resource().path().to_owned()
        }));
    }

    let mut paths = BTreeSet::new();
    for task in tasks {
        paths.insert(task.await.unwrap());
    }

    assert_eq!(paths.len(), 1);
    assert_eq!(downloader.downloads(), 1);
    assert_eq!(list_files(storage.path()), ["rootfs-0"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exclusive_copies_under_concurrency() {
    test::setup();
    let storage = test::tempdir();
    let downloader = Downloader::new(storage.path());
    let cache = Arc::new(Cache::new(downloader.clone(), false, Arc::new(NoopTracker)));
    let holders = 8;
    let barrier = Arc::new(Barrier::new(holders));

    let mut tasks = Vec::new();
    for _ in 0..holders {
        let cache = Arc::clone(&cache);
        let barrier = Arc::clone(&barrier);
        tasks.push(tokio::spawn(async move {
            let handle = cache
                .require(TaskContext::new().into_ref(), ArtifactOptions::new("scratch", 16))
                .await
                .unwrap();
            let path = handle.resource().path().to_owned();
            // Keep holding until everybody got a copy.
            barrier.wait().await;
            path
        }));
    }

    let mut paths = BTreeSet::new();
    for task in tasks {
        paths.insert(task.await.unwrap());
    }

    assert_eq!(paths.len(), holders);
    assert_eq!(downloader.downloads(), holders);

    // All copies are idle now and get reused.
    let handle = cache
        .require(TaskContext::new().into_ref(), ArtifactOptions::new("scratch", 16))
        .await
        .unwrap();
    assert!(paths.contains(handle.resource().path()));
    assert_eq!(downloader.downloads(), holders);
}

#[tokio::test]
async fn test_purge_removes_files() {
    test::setup();
    let storage = test::tempdir();
    let cache = Cache::new(Downloader::new(storage.path()), true, Arc::new(NoopTracker));

    let mut kernel = cache
        .require(TaskContext::new().into_ref(), ArtifactOptions::new("kernel", 64))
        .await
        .unwrap();
    let initrd = cache
        .require(TaskContext::new().into_ref(), ArtifactOptions::new("initrd", 64))
        .await
        .unwrap();
    drop(initrd);
    assert_eq!(list_files(storage.path()), ["initrd-1", "kernel-0"]);

    let stats = cache.purge_all().unwrap();
    assert_eq!(stats.disposed, 1);
    assert_eq!(stats.deferred, 1);
    assert_eq!(list_files(storage.path()), ["kernel-0"]);

    kernel.release();
    assert!(list_files(storage.path()).is_empty());
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_slow_download_hits_deadline() {
    test::setup();
    let storage = test::tempdir();
    let downloader = Downloader::new(storage.path()).with_delay(Duration::from_secs(60));
    let cache = Cache::new(downloader.clone(), true, Arc::new(NoopTracker));

    let ctx = TaskContext::new()
        .with_timeout(Duration::from_millis(20))
        .into_ref();
    let result = cache.require(ctx, ArtifactOptions::new("image", 8)).await;

    assert!(matches!(
        result,
        Err(CacheError::Canceled(ContextError::DeadlineExceeded))
    ));
    test::wait_until(|| cache.is_empty()).await;
    assert!(list_files(storage.path()).is_empty());
}

#[tokio::test]
async fn test_failed_download_is_retried() {
    test::setup();
    let storage = test::tempdir();
    let missing = storage.path().join("missing");
    let cache = Cache::new(Downloader::new(&missing), true, Arc::new(NoopTracker));

    let err = cache
        .require(TaskContext::new().into_ref(), ArtifactOptions::new("image", 8))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("failed to write"));
    assert!(cache.is_empty());

    std::fs::create_dir(&missing).unwrap();
    let handle = cache
        .require(TaskContext::new().into_ref(), ArtifactOptions::new("image", 8))
        .await
        .unwrap();
    assert!(handle.resource().path().exists());
}
