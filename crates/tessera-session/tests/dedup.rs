//! Call coalescing through a session backed by the in-memory engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;
use tessera_cache::{
    CacheResult, CallContext, Digest, MemoryCache, ValueWithCallbacks, initializer,
};
use tessera_session::SessionCache;

fn slow_build(
    runs: &Arc<AtomicUsize>,
    released: &Arc<AtomicUsize>,
    output: &'static str,
) -> tessera_cache::Initializer<String> {
    let runs = Arc::clone(runs);
    let released = Arc::clone(released);
    initializer(move |_ctx| async move {
        runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(25)).await;
        Ok(
            ValueWithCallbacks::new(output.to_string()).with_on_release(move |_ctx| async move {
                released.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
    })
}

#[tokio::test]
async fn test_concurrent_calls_run_once() {
    let session = SessionCache::new(MemoryCache::new());
    let ctx = CallContext::new();
    let key = Digest::of("cargo build --release");
    let runs = Arc::new(AtomicUsize::new(0));

    let calls = (0..8).map(|_| {
        let runs = Arc::clone(&runs);
        session.get_or_initialize(
            &ctx,
            key,
            move |_ctx| async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(25)).await;
                Ok("artifact".to_string())
            },
            &[],
        )
    });
    let handles: Vec<_> = join_all(calls)
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(handles.iter().all(|h| h.value() == "artifact"));
    assert_eq!(handles.iter().filter(|h| !h.was_cache_hit()).count(), 1);
    assert_eq!(session.tracked_len(), 8);
    assert_eq!(session.engine().ref_count(&key), Some(8));

    session.release_and_close(&ctx).await.unwrap();
    assert!(session.engine().is_empty());
}

#[tokio::test]
async fn test_skip_dedupe_runs_each_call_and_tracks_it() {
    let session = SessionCache::new(MemoryCache::new());
    let ctx = CallContext::new();
    let key = Digest::of("date +%s");
    let runs = Arc::new(AtomicUsize::new(0));
    let released = Arc::new(AtomicUsize::new(0));

    let (a, b) = tokio::join!(
        session.get_or_initialize_with_callbacks(
            &ctx,
            key,
            true,
            slow_build(&runs, &released, "first"),
            &[],
        ),
        session.get_or_initialize_with_callbacks(
            &ctx,
            key,
            true,
            slow_build(&runs, &released, "second"),
            &[],
        ),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(a.value(), "first");
    assert_eq!(b.value(), "second");
    assert_eq!(session.tracked_len(), 2);

    session.release_and_close(&ctx).await.unwrap();
    assert_eq!(released.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_two_callers_share_one_result_until_close() {
    let session = SessionCache::new(MemoryCache::new());
    let ctx = CallContext::new();
    let k1 = Digest::of("k1");
    let k2 = Digest::of("k2");
    let runs = Arc::new(AtomicUsize::new(0));
    let released = Arc::new(AtomicUsize::new(0));

    let (first, second) = tokio::join!(
        session.get_or_initialize_with_callbacks(
            &ctx,
            k1,
            false,
            slow_build(&runs, &released, "k1-out"),
            &[],
        ),
        session.get_or_initialize_with_callbacks(
            &ctx,
            k1,
            false,
            slow_build(&runs, &released, "k1-other"),
            &[],
        ),
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    let other = session
        .get_or_initialize_with_callbacks(&ctx, k2, false, slow_build(&runs, &released, "k2-out"), &[])
        .await
        .unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(first.value(), second.value());
    assert_eq!(first.value(), "k1-out");
    assert_ne!(first.was_cache_hit(), second.was_cache_hit());
    assert_eq!(other.value(), "k2-out");

    session.release_and_close(&ctx).await.unwrap();

    assert!(first.is_released() && second.is_released() && other.is_released());
    assert_eq!(released.load(Ordering::SeqCst), 2);
    assert!(session.engine().is_empty());
}

#[tokio::test]
async fn test_sessions_over_one_engine_share_results() {
    let engine = MemoryCache::new();
    let left = SessionCache::new(engine.clone());
    let right = SessionCache::new(engine.clone());
    let ctx = CallContext::new();
    let key = Digest::of("shared step");

    left.get_or_initialize_value(&ctx, key, "from-left".to_string(), &[])
        .await
        .unwrap();
    let seen = right
        .get_or_initialize_value(&ctx, key, "from-right".to_string(), &[])
        .await
        .unwrap();
    assert_eq!(seen.value(), "from-left");

    // Closing one session leaves the other's reference alive.
    left.release_and_close(&ctx).await.unwrap();
    assert_eq!(engine.ref_count(&key), Some(1));
    assert!(!seen.is_released());

    right.release_and_close(&ctx).await.unwrap();
    assert!(engine.is_empty());
}

#[tokio::test]
async fn test_caller_timeout_during_post_call_does_not_leak() {
    let session = SessionCache::new(MemoryCache::new());
    let ctx = CallContext::new();
    let key = Digest::of("slow post-call");

    let init = initializer(|_ctx| async {
        Ok(ValueWithCallbacks::new("v".to_string()).with_post_call(|_ctx| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        }))
    });
    let outcome = tokio::time::timeout(
        Duration::from_millis(20),
        session.get_or_initialize_with_callbacks(&ctx, key, false, init, &[]),
    )
    .await;
    assert!(outcome.is_err());

    session.release_and_close(&ctx).await.unwrap();
    assert_eq!(session.tracked_len(), 0);
    assert_eq!(session.engine().ref_count(&key), None);
    assert!(session.engine().is_empty());
}
