//! End-to-end walkthroughs of the public API
use polycache_core::{
    Cache, CacheError, CacheEvent, CacheSettings, Expiry, SpinOptions, WorkerOptions,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn walkthrough(cache: &Cache) {
    cache.set("foo", "Foo", Expiry::Never).await.unwrap();
    assert_eq!(
        cache.get::<String>("foo").await.unwrap().as_deref(),
        Some("Foo")
    );

    cache.set("quzz", "Quzz!", 100u64).await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(cache.get::<String>("quzz").await.unwrap(), None);

    assert!(cache.lock_acquire("x", Expiry::Never).await.unwrap());
    assert!(!cache.lock_acquire("x", Expiry::Never).await.unwrap());
    assert!(cache.lock_release("x").await.unwrap());
    assert!(!cache.lock_exists("x").await.unwrap());
}

#[tokio::test]
async fn test_walkthrough_on_memory() {
    init_tracing();
    let cache = Cache::open(CacheSettings::default()).await.unwrap();
    walkthrough(&cache).await;
    cache.destroy().await.unwrap();
}

#[tokio::test]
async fn test_walkthrough_on_filesystem() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let settings = CacheSettings::builder()
        .with_module("filesystem")
        .with_filesystem_path(dir.path())
        .build();
    let cache = Cache::open(settings).await.unwrap();
    walkthrough(&cache).await;
}

#[tokio::test]
async fn test_lifecycle_events_and_shutdown() {
    init_tracing();
    let cache = Cache::new(
        CacheSettings::builder()
            .with_modules(["nonexistent", "memory"])
            .build(),
    );
    let mut events = cache.subscribe();

    cache.init().await.unwrap();
    assert_eq!(cache.driver_id().as_deref(), Some("memory"));

    let mut seen = Vec::new();
    while let Ok(envelope) = events.try_recv() {
        seen.push(envelope.event);
    }
    assert!(matches!(
        &seen[0],
        CacheEvent::DriverRejected { driver, .. } if driver == "nonexistent"
    ));
    assert!(matches!(
        &seen[1],
        CacheEvent::DriverLoaded { driver } if driver == "memory"
    ));

    cache.destroy().await.unwrap();
    assert!(matches!(
        cache.get::<String>("anything").await,
        Err(CacheError::NotReady { .. })
    ));
}

#[tokio::test]
async fn test_worker_memoizes_rapid_calls() {
    init_tracing();
    let cache = Cache::open(CacheSettings::default()).await.unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let produce = || {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(vec!["a".to_string(), "b".to_string()])
        }
    };

    let first: Vec<String> = cache
        .worker(WorkerOptions::<Vec<String>>::new("listing").with_expiry("1m"), produce)
        .await
        .unwrap();
    let second: Vec<String> = cache
        .worker(WorkerOptions::<Vec<String>>::new("listing").with_expiry("1m"), produce)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_spin_lock_serializes_critical_sections() {
    init_tracing();
    let cache = Cache::open(CacheSettings::default()).await.unwrap();
    let active = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));

    let tasks = (0..4).map(|_| {
        let cache = cache.clone();
        let active = Arc::clone(&active);
        let finished = Arc::clone(&finished);
        tokio::spawn(async move {
            let options = SpinOptions::default()
                .with_retries(50)
                .with_delay(Duration::from_millis(20))
                .with_jitter(Duration::ZERO);
            cache.lock_spin("section", options).await.unwrap();

            assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
            tokio::time::sleep(Duration::from_millis(30)).await;
            active.fetch_sub(1, Ordering::SeqCst);

            cache.lock_release("section").await.unwrap();
            finished.fetch_add(1, Ordering::SeqCst);
        })
    });
    for task in tasks.collect::<Vec<_>>() {
        task.await.unwrap();
    }

    assert_eq!(finished.load(Ordering::SeqCst), 4);
}
