use navspace_engine::StubEngine;
use navspace_workspace::{WorkspaceCache, WorkspaceCacheConfig, WorkspaceError};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

fn fast_config() -> WorkspaceCacheConfig {
    WorkspaceCacheConfig {
        idle_evict_after: Duration::from_millis(100),
        sweep_interval: Duration::from_millis(25),
        close_grace: Duration::from_millis(50),
    }
}

#[tokio::test]
async fn concurrent_acquires_coalesce_into_one_load() {
    let engine = Arc::new(StubEngine::new().with_load_delay(Duration::from_millis(50)));
    let cache = WorkspaceCache::start(engine.clone(), fast_config());
    let root = tempdir().unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        let root = root.path().to_path_buf();
        tasks.push(tokio::spawn(async move {
            cache
                .acquire(&root, false, &CancellationToken::new())
                .await
                .expect("acquire")
                .generation()
        }));
    }

    for task in tasks {
        assert_eq!(task.await.unwrap(), 1);
    }
    assert_eq!(engine.load_count(), 1);
    assert!(cache.stats().coalesced_waits >= 1);
}

#[tokio::test]
async fn distinct_roots_load_independently() {
    let engine = Arc::new(StubEngine::new());
    let cache = WorkspaceCache::start(engine.clone(), fast_config());
    let a = tempdir().unwrap();
    let b = tempdir().unwrap();
    let cancel = CancellationToken::new();

    let ha = cache.acquire(a.path(), false, &cancel).await.unwrap();
    let hb = cache.acquire(b.path(), false, &cancel).await.unwrap();
    assert_eq!(engine.load_count(), 2);
    assert_ne!(ha.root(), hb.root());
    assert_eq!(cache.list_active().len(), 2);
}

#[tokio::test]
async fn failed_load_does_not_poison_registry() {
    let engine = Arc::new(StubEngine::new());
    let cache = WorkspaceCache::start(engine.clone(), fast_config());
    let root = tempdir().unwrap();
    let cancel = CancellationToken::new();

    engine.fail_next_load("compiler toolchain missing");
    let err = cache.acquire(root.path(), false, &cancel).await.unwrap_err();
    assert!(err.to_string().contains("compiler toolchain missing"));
    assert_eq!(cache.stats().load_failures, 1);

    let handle = cache.acquire(root.path(), false, &cancel).await.unwrap();
    assert_eq!(handle.generation(), 1);
    assert_eq!(engine.load_count(), 1);
}

#[tokio::test]
async fn invalidate_reloads_with_higher_generation() {
    let engine = Arc::new(StubEngine::new());
    let cache = WorkspaceCache::start(engine.clone(), fast_config());
    let root = tempdir().unwrap();
    let cancel = CancellationToken::new();

    assert!(!cache.invalidate(root.path(), &cancel).await.unwrap());

    let first = cache.acquire(root.path(), false, &cancel).await.unwrap();
    assert_eq!(first.generation(), 1);
    drop(first);

    assert!(cache.invalidate(root.path(), &cancel).await.unwrap());
    let second = cache.acquire(root.path(), false, &cancel).await.unwrap();
    assert_eq!(second.generation(), 2);
    assert_eq!(engine.load_count(), 2);
    assert_eq!(cache.stats().invalidations, 1);
}

#[tokio::test]
async fn close_is_idempotent() {
    let engine = Arc::new(StubEngine::new());
    let cache = WorkspaceCache::start(engine.clone(), fast_config());
    let root = tempdir().unwrap();
    let cancel = CancellationToken::new();

    let handle = cache.acquire(root.path(), false, &cancel).await.unwrap();
    let project = handle.engine_project();
    drop(handle);

    assert!(cache.close(root.path()).await);
    assert!(!cache.close(root.path()).await);
    assert!(!engine.is_loaded(project));
    assert!(cache.list_active().is_empty());
}

#[tokio::test]
async fn close_with_inflight_operation_forces_release_after_grace() {
    let engine = Arc::new(StubEngine::new());
    let cache = WorkspaceCache::start(engine.clone(), fast_config());
    let root = tempdir().unwrap();
    let cancel = CancellationToken::new();

    let handle = cache.acquire(root.path(), false, &cancel).await.unwrap();
    let project = handle.engine_project();

    let started = std::time::Instant::now();
    assert!(cache.close(root.path()).await);
    // Close waited out the grace period for the held handle, then released.
    assert!(started.elapsed() >= Duration::from_millis(45));
    assert!(!engine.is_loaded(project));

    let err = handle.ensure_open().unwrap_err();
    assert!(matches!(err, WorkspaceError::HandleClosed(_)));
}

#[tokio::test]
async fn idle_root_is_evicted_by_sweep() {
    let engine = Arc::new(StubEngine::new());
    let cache = WorkspaceCache::start(engine.clone(), fast_config());
    let root = tempdir().unwrap();
    let cancel = CancellationToken::new();

    let handle = cache.acquire(root.path(), false, &cancel).await.unwrap();
    let project = handle.engine_project();
    drop(handle);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(cache.list_active().is_empty());
    assert!(cache.stats().evictions >= 1);
    assert!(!engine.is_loaded(project));

    // The root stays usable after eviction and keeps its generation history.
    let reloaded = cache.acquire(root.path(), false, &cancel).await.unwrap();
    assert_eq!(reloaded.generation(), 2);
}

#[tokio::test]
async fn held_handle_blocks_idle_eviction() {
    let engine = Arc::new(StubEngine::new());
    let cache = WorkspaceCache::start(engine.clone(), fast_config());
    let root = tempdir().unwrap();
    let cancel = CancellationToken::new();

    let handle = cache.acquire(root.path(), false, &cancel).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(cache.list_active().len(), 1);
    assert!(handle.ensure_open().is_ok());
}

#[tokio::test]
async fn cancelled_acquire_discards_partial_work() {
    let engine = Arc::new(StubEngine::new().with_load_delay(Duration::from_secs(5)));
    let cache = WorkspaceCache::start(engine.clone(), fast_config());
    let root = tempdir().unwrap();

    let cancel = CancellationToken::new();
    let cache2 = cache.clone();
    let root_path = root.path().to_path_buf();
    let task = tokio::spawn(async move { cache2.acquire(&root_path, false, &cancel).await });
    // Give the load a moment to start, then cancel from the outside.
    tokio::time::sleep(Duration::from_millis(30)).await;
    task.abort();
    let _ = task.await;

    let pre_cancelled = CancellationToken::new();
    pre_cancelled.cancel();
    let err = cache
        .acquire(root.path(), false, &pre_cancelled)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkspaceError::Cancelled));
}

#[tokio::test]
async fn get_does_not_autoload() {
    let engine = Arc::new(StubEngine::new());
    let cache = WorkspaceCache::start(engine.clone(), fast_config());
    let root = tempdir().unwrap();

    let err = cache.get(root.path()).unwrap_err();
    assert!(matches!(err, WorkspaceError::ProjectNotLoaded(_)));
    assert_eq!(engine.load_count(), 0);

    let _held = cache
        .acquire(root.path(), false, &CancellationToken::new())
        .await
        .unwrap();
    assert!(cache.get(root.path()).is_ok());
}

#[tokio::test]
async fn shutdown_closes_everything() {
    let engine = Arc::new(StubEngine::new());
    let cache = WorkspaceCache::start(engine.clone(), fast_config());
    let a = tempdir().unwrap();
    let b = tempdir().unwrap();
    let cancel = CancellationToken::new();

    let pa = cache
        .acquire(a.path(), false, &cancel)
        .await
        .unwrap()
        .engine_project();
    let pb = cache
        .acquire(b.path(), false, &cancel)
        .await
        .unwrap()
        .engine_project();

    cache.shutdown().await;
    assert!(cache.list_active().is_empty());
    assert!(!engine.is_loaded(pa));
    assert!(!engine.is_loaded(pb));

    // The registry still answers after shutdown; a fresh acquire reloads.
    let reloaded = cache.acquire(a.path(), false, &cancel).await;
    assert!(reloaded.is_ok());
}
