//! Race and fallback behavior of the fetch coordinator.
//!
//! Every test runs on a paused clock, so budgets and transport delays are
//! exact and elapsed times can be asserted.

mod common;

use common::*;
use lazyfetch::backend::{KeyValueStore, MemoryBackend};
use lazyfetch::{AttemptSource, Budgets, FetchDescription, FetchError, Policy, ReplayMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn k1() -> FetchDescription {
    FetchDescription::new("k1", "http://example.test/k1")
}

fn within(elapsed: Duration, expected: Duration) -> bool {
    elapsed >= expected && elapsed < expected + Duration::from_millis(50)
}

#[tokio::test(start_paused = true)]
async fn pessimistic_live_success_returns_body_and_warms_cache() {
    let backend = MemoryBackend::new();
    let transport = Arc::new(FakeTransport::responding(200, "ok"));
    let coordinator = coordinator(&backend, transport.clone(), budgets(1_000, 7_000, 500));

    let response = coordinator.fetch(&k1(), Policy::Pessimistic).await;

    assert_eq!(response.status_code, 200);
    assert_eq!(response.body, b"ok");
    assert_eq!(response.error, None);
    assert_eq!(response.source, Some(AttemptSource::Live));
    assert_eq!(backend.get("k1").await.unwrap(), Some(b"ok".to_vec()));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn warmed_value_is_served_to_later_cache_attempts() {
    let backend = MemoryBackend::new();
    let transport = Arc::new(FakeTransport::responding(200, "ok"));
    let coordinator = coordinator(&backend, transport.clone(), budgets(1_000, 7_000, 500));

    coordinator.fetch(&k1(), Policy::Pessimistic).await;
    tokio::time::advance(Duration::from_secs(60)).await;
    let response = coordinator.fetch(&k1(), Policy::Optimistic).await;

    assert_eq!(response.body, b"ok");
    assert_eq!(response.source, Some(AttemptSource::Cache));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn pessimistic_live_precedence_over_cached_value() {
    let backend = MemoryBackend::new();
    backend.set("k1", b"stale", Duration::ZERO).await.unwrap();
    let transport = Arc::new(FakeTransport::responding(200, "fresh").with_delay(Duration::from_millis(200)));
    let coordinator = coordinator(&backend, transport, budgets(1_000, 7_000, 500));

    let response = coordinator.fetch(&k1(), Policy::Pessimistic).await;

    assert_eq!(response.body, b"fresh");
    assert_eq!(response.source, Some(AttemptSource::Live));
    assert_eq!(backend.get("k1").await.unwrap(), Some(b"fresh".to_vec()));
}

#[tokio::test(start_paused = true)]
async fn pessimistic_live_timeout_serves_stale_cache_without_error() {
    let backend = MemoryBackend::new();
    backend.set("k1", b"stale", Duration::ZERO).await.unwrap();
    let transport = Arc::new(FakeTransport::responding(200, "late").with_delay(Duration::from_secs(5)));
    let coordinator = coordinator(&backend, transport, budgets(1_000, 7_000, 500));

    let started = Instant::now();
    let response = coordinator.fetch(&k1(), Policy::Pessimistic).await;

    assert_eq!(response.status_code, 200);
    assert_eq!(response.body, b"stale");
    assert_eq!(response.error, None);
    assert_eq!(response.source, Some(AttemptSource::Cache));
    assert!(within(started.elapsed(), Duration::from_secs(1)));
    assert_eq!(coordinator.stats().stale_fallbacks, 1);
}

#[tokio::test(start_paused = true)]
async fn slow_cache_hit_after_overall_budget_is_still_served() {
    let backend = MemoryBackend::new();
    backend.set("k1", b"stale", Duration::ZERO).await.unwrap();
    backend.set_read_latency(Duration::from_millis(1_500));
    let transport = Arc::new(FakeTransport::responding(200, "late").with_delay(Duration::from_secs(5)));
    let coordinator = coordinator(&backend, transport, budgets(1_000, 7_000, 2_000));

    let started = Instant::now();
    let response = coordinator.fetch(&k1(), Policy::Pessimistic).await;

    // The overall budget fires at 1s; the race keeps waiting for the cache
    assert!(within(started.elapsed(), Duration::from_millis(1_500)));
    assert_eq!(response.status_code, 200);
    assert_eq!(response.body, b"stale");
    assert_eq!(response.error, None);
    assert_eq!(response.source, Some(AttemptSource::Cache));
}

#[tokio::test(start_paused = true)]
async fn pessimistic_live_error_serves_stale_cache() {
    let backend = MemoryBackend::new();
    backend.set("k1", b"stale", Duration::ZERO).await.unwrap();
    let transport = Arc::new(FakeTransport::responding(503, "unavailable"));
    let coordinator = coordinator(&backend, transport, budgets(1_000, 7_000, 500));

    let response = coordinator.fetch(&k1(), Policy::Pessimistic).await;

    assert_eq!(response.status_code, 200);
    assert_eq!(response.body, b"stale");
    assert_eq!(response.error, None);
}

#[tokio::test(start_paused = true)]
async fn pessimistic_timeout_with_empty_cache_fails_at_overall_budget() {
    let backend = MemoryBackend::new();
    let transport = Arc::new(FakeTransport::responding(200, "late").with_delay(Duration::from_secs(3)));
    let coordinator = coordinator(&backend, transport, budgets(1_000, 7_000, 500));

    let started = Instant::now();
    let response = coordinator.fetch(&k1(), Policy::Pessimistic).await;

    // Returns when the overall budget fires, not when the slower live call would finish
    assert!(within(started.elapsed(), Duration::from_secs(1)));
    assert_eq!(response.status_code, 500);
    assert!(response.body.is_empty());
    assert_eq!(
        response.error,
        Some(FetchError::timeout("overall", Duration::from_secs(1)))
    );
    // Pessimistic fetches are never replayed
    assert!(backend.published().is_empty());
}

#[tokio::test(start_paused = true)]
async fn live_call_budget_bounds_the_live_attempt_inside_overall() {
    let backend = MemoryBackend::new();
    let transport = Arc::new(FakeTransport::responding(200, "late").with_delay(Duration::from_secs(3)));
    let coordinator = coordinator(&backend, transport, budgets(5_000, 1_000, 500));

    let started = Instant::now();
    let response = coordinator.fetch(&k1(), Policy::Pessimistic).await;

    assert!(within(started.elapsed(), Duration::from_secs(1)));
    assert_eq!(
        response.error,
        Some(FetchError::timeout("live call", Duration::from_secs(1)))
    );
}

#[tokio::test(start_paused = true)]
async fn abandoned_live_attempt_does_not_warm_cache() {
    let backend = MemoryBackend::new();
    backend.set("k1", b"stale", Duration::ZERO).await.unwrap();
    let transport = Arc::new(FakeTransport::responding(200, "late").with_delay(Duration::from_secs(3)));
    let coordinator = coordinator(&backend, transport, budgets(1_000, 7_000, 500));

    let response = coordinator.fetch(&k1(), Policy::Pessimistic).await;
    assert_eq!(response.body, b"stale");

    // The live call would have finished at 3s; its race was decided at 1s
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(backend.get("k1").await.unwrap(), Some(b"stale".to_vec()));
}

#[tokio::test(start_paused = true)]
async fn backend_outage_does_not_block_live_success() {
    let backend = MemoryBackend::new();
    backend.set_available(false);
    let transport = Arc::new(FakeTransport::responding(200, "ok"));
    let coordinator = coordinator(&backend, transport, budgets(1_000, 7_000, 500));

    let response = coordinator.fetch(&k1(), Policy::Pessimistic).await;

    assert_eq!(response.status_code, 200);
    assert_eq!(response.body, b"ok");
}

#[tokio::test(start_paused = true)]
async fn backend_outage_and_live_failure_surface_live_error() {
    let backend = MemoryBackend::new();
    backend.set_available(false);
    let transport = Arc::new(FakeTransport::failing(FetchError::live_call_failed(
        "connection refused",
    )));
    let coordinator = coordinator(&backend, transport, budgets(1_000, 7_000, 500));

    let response = coordinator.fetch(&k1(), Policy::Pessimistic).await;

    assert_eq!(response.status_code, 500);
    assert_eq!(
        response.error,
        Some(FetchError::live_call_failed("connection refused"))
    );
}

#[tokio::test(start_paused = true)]
async fn optimistic_cache_hit_never_invokes_transport() {
    let backend = MemoryBackend::new();
    backend.set("k1", b"cached", Duration::ZERO).await.unwrap();
    let transport = Arc::new(FakeTransport::responding(200, "fresh"));
    let coordinator = coordinator(&backend, transport.clone(), budgets(1_000, 7_000, 500));

    let response = coordinator.fetch(&k1(), Policy::Optimistic).await;

    assert_eq!(response.status_code, 200);
    assert_eq!(response.body, b"cached");
    assert_eq!(response.source, Some(AttemptSource::Cache));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn optimistic_miss_uses_live_and_warms_cache() {
    let backend = MemoryBackend::new();
    let transport = Arc::new(FakeTransport::responding(200, "fresh"));
    let coordinator = coordinator(&backend, transport.clone(), budgets(1_000, 7_000, 500));

    let response = coordinator.fetch(&k1(), Policy::Optimistic).await;

    assert_eq!(response.body, b"fresh");
    assert_eq!(response.source, Some(AttemptSource::Live));
    assert_eq!(backend.get("k1").await.unwrap(), Some(b"fresh".to_vec()));
    assert!(backend.published().is_empty());
}

#[tokio::test(start_paused = true)]
async fn optimistic_slow_cache_falls_through_to_live() {
    let backend = MemoryBackend::new();
    backend.set("k1", b"cached", Duration::ZERO).await.unwrap();
    backend.set_read_latency(Duration::from_secs(2));
    let transport = Arc::new(FakeTransport::responding(200, "fresh"));
    let coordinator = coordinator(&backend, transport.clone(), budgets(1_000, 7_000, 500));

    let started = Instant::now();
    let response = coordinator.fetch(&k1(), Policy::Optimistic).await;

    assert_eq!(response.body, b"fresh");
    assert_eq!(transport.calls(), 1);
    assert!(within(started.elapsed(), Duration::from_millis(500)));
}

#[tokio::test(start_paused = true)]
async fn optimistic_live_timeout_publishes_exactly_one_replay() {
    let backend = MemoryBackend::new();
    let transport = Arc::new(FakeTransport::responding(200, "late").with_delay(Duration::from_secs(5)));
    let coordinator = coordinator(&backend, transport, budgets(1_000, 7_000, 500));
    let descr = FetchDescription::new("k1", "http://example.test/orders")
        .with_method("POST")
        .with_header("Content-Type", "application/json")
        .with_payload(b"{\"order\":7}".to_vec());

    let started = Instant::now();
    let response = coordinator.fetch(&descr, Policy::Optimistic).await;

    assert!(within(started.elapsed(), Duration::from_secs(1)));
    assert_eq!(response.status_code, 500);
    assert!(response.body.is_empty());
    assert!(response.error.as_ref().is_some_and(FetchError::is_timeout));

    let published = backend.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].channel, RETRY_CHANNEL);
    let message = ReplayMessage::from_bytes(&published[0].payload).unwrap();
    assert_eq!(message.description(), &descr);
    assert_eq!(message.attempt(), 1);
    assert_eq!(coordinator.stats().replays_handed_off, 1);
}

#[tokio::test(start_paused = true)]
async fn optimistic_overall_budget_includes_cache_lookup_time() {
    let backend = MemoryBackend::new();
    backend.set_read_latency(Duration::from_millis(400));
    let transport = Arc::new(FakeTransport::responding(200, "fresh").with_delay(Duration::from_millis(800)));
    let coordinator = coordinator(&backend, transport, budgets(1_000, 7_000, 500));

    let started = Instant::now();
    let response = coordinator.fetch(&k1(), Policy::Optimistic).await;

    assert!(within(started.elapsed(), Duration::from_secs(1)));
    assert_eq!(
        response.error,
        Some(FetchError::timeout("overall", Duration::from_secs(1)))
    );
}

#[tokio::test(start_paused = true)]
async fn optimistic_replay_publish_failure_keeps_live_error() {
    let backend = MemoryBackend::new();
    backend.set_available(false);
    let transport = Arc::new(FakeTransport::responding(502, "bad gateway"));
    let coordinator = coordinator(&backend, transport, budgets(1_000, 7_000, 500));

    let response = coordinator.fetch(&k1(), Policy::Optimistic).await;

    assert_eq!(response.status_code, 500);
    assert_eq!(response.error, Some(FetchError::bad_status(502)));
    let stats = coordinator.stats();
    assert_eq!(stats.replay_publish_failures, 1);
    assert_eq!(stats.replays_handed_off, 0);
}

#[tokio::test(start_paused = true)]
async fn explicit_budgets_override_configured_ones() {
    let backend = MemoryBackend::new();
    let transport = Arc::new(FakeTransport::responding(200, "ok").with_delay(Duration::from_millis(300)));
    let coordinator = coordinator(&backend, transport, budgets(1_000, 7_000, 500));

    let response = coordinator
        .fetch_with_budgets(&k1(), Policy::Pessimistic, budgets(100, 7_000, 50))
        .await;

    assert_eq!(
        response.error,
        Some(FetchError::timeout("overall", Duration::from_millis(100)))
    );
}

#[tokio::test(start_paused = true)]
async fn unbounded_overall_budget_does_not_panic() {
    let backend = MemoryBackend::new();
    let transport = Arc::new(FakeTransport::responding(200, "ok").with_delay(Duration::from_millis(200)));
    let coordinator = coordinator(&backend, transport, budgets(1_000, 7_000, 500));
    let unbounded = Budgets::new(Duration::MAX, Duration::from_secs(1), Duration::from_millis(500));

    let response = coordinator
        .fetch_with_budgets(&k1(), Policy::Pessimistic, unbounded)
        .await;
    assert_eq!(response.status_code, 200);
    assert_eq!(response.body, b"ok");

    let response = coordinator
        .fetch_with_budgets(&FetchDescription::new("k2", "http://example.test/k2"), Policy::Optimistic, unbounded)
        .await;
    assert_eq!(response.body, b"ok");
    assert_eq!(response.source, Some(AttemptSource::Live));
}

#[tokio::test(start_paused = true)]
async fn unbounded_overall_budget_still_honors_live_call_budget() {
    let backend = MemoryBackend::new();
    let transport = Arc::new(FakeTransport::responding(200, "late").with_delay(Duration::from_secs(3)));
    let coordinator = coordinator(&backend, transport, budgets(1_000, 7_000, 500));
    let unbounded = Budgets::new(Duration::MAX, Duration::from_secs(1), Duration::from_millis(500));

    for policy in [Policy::Pessimistic, Policy::Optimistic] {
        let started = Instant::now();
        let response = coordinator.fetch_with_budgets(&k1(), policy, unbounded).await;

        assert!(within(started.elapsed(), Duration::from_secs(1)));
        assert_eq!(
            response.error,
            Some(FetchError::timeout("live call", Duration::from_secs(1)))
        );
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_fetches_of_one_key_do_independent_work() {
    let backend = MemoryBackend::new();
    let transport = Arc::new(FakeTransport::responding(200, "ok").with_delay(Duration::from_millis(100)));
    let coordinator = Arc::new(coordinator(&backend, transport.clone(), budgets(1_000, 7_000, 500)));

    let fetches: Vec<_> = (0..3)
        .map(|_| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.fetch(&k1(), Policy::Pessimistic).await })
        })
        .collect();
    for fetch in fetches {
        assert_eq!(fetch.await.unwrap().body, b"ok");
    }

    assert_eq!(transport.calls(), 3);
    assert_eq!(coordinator.stats().fetches, 3);
}
