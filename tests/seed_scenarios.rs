//! Cross-component integration tests, one per seed scenario in spec §8.

use std::sync::Arc;
use std::time::Duration;

use admission_core::concurrency_gate::ConcurrencyGate;
use admission_core::config::{
    ConcurrencyGateOptions, ConnLimitOptions, PacketConcurrencyLimitAttribute, PacketRateLimitAttribute,
    PolicyLimiterOptions, TokenBucketOptions,
};
use admission_core::connection_limiter::ConnectionLimiter;
use admission_core::endpoint::NetworkEndpoint;
use admission_core::error::{AdmissionError, RejectReason};
use admission_core::policy::Policy;
use admission_core::policy_limiter::{PolicyContext, PolicyRateLimiter};
use admission_core::scheduler::TokioTaskManager;
use admission_core::token_bucket::{DenyReason, TokenBucketLimiter};

fn seed_bucket_opts() -> TokenBucketOptions {
    TokenBucketOptions {
        capacity_tokens: 5,
        refill_tokens_per_second: 1.0,
        token_scale: 1_000_000,
        shard_count: 4,
        hard_lockout_seconds: 30,
        stale_entry_seconds: 300,
        cleanup_interval_seconds: 3600,
        max_tracked_endpoints: 0,
        soft_violation_window_seconds: 10,
        max_soft_violations: 3,
        initial_tokens: -1,
    }
}

#[tokio::test]
async fn seed_1_burst_drain_then_refill() {
    let lim = TokenBucketLimiter::new(seed_bucket_opts(), TokioTaskManager::new()).unwrap();
    let ep = NetworkEndpoint::new("203.0.113.1");

    for expected_credit in [4u16, 3, 2, 1, 0] {
        let d = lim.check(ep.clone()).unwrap();
        assert!(d.allowed);
        assert_eq!(d.credit, expected_credit);
    }

    tokio::time::sleep(Duration::from_millis(1)).await;
    let sixth = lim.check(ep.clone()).unwrap();
    assert!(!sixth.allowed);
    assert_eq!(sixth.reason, DenyReason::SoftThrottle);
    assert!((sixth.retry_after_ms - 999).abs() <= 2, "got {}", sixth.retry_after_ms);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let after_refill = lim.check(ep).unwrap();
    assert!(after_refill.allowed);
    assert_eq!(after_refill.credit, 0);
}

#[tokio::test]
async fn seed_2_escalation_to_hard_lockout() {
    let mut opts = seed_bucket_opts();
    opts.capacity_tokens = 1;
    opts.refill_tokens_per_second = 1.0;
    let lim = TokenBucketLimiter::new(opts, TokioTaskManager::new()).unwrap();
    let ep = NetworkEndpoint::new("203.0.113.2");

    assert!(lim.check(ep.clone()).unwrap().allowed);

    let first_violation = lim.check(ep.clone()).unwrap();
    assert_eq!(first_violation.reason, DenyReason::SoftThrottle);
    let second_violation = lim.check(ep.clone()).unwrap();
    assert_eq!(second_violation.reason, DenyReason::SoftThrottle);

    let third_violation = lim.check(ep.clone()).unwrap();
    assert_eq!(third_violation.reason, DenyReason::HardLockout);
    assert!(third_violation.retry_after_ms > 29_000);

    let fourth = lim.check(ep).unwrap();
    assert_eq!(fourth.reason, DenyReason::HardLockout);
    assert!(fourth.retry_after_ms <= third_violation.retry_after_ms);
}

#[test]
fn seed_3_policy_quantization() {
    assert_eq!(Policy::quantize(10, 20), Policy { rps: 16, burst: 32 });
    assert_eq!(Policy::quantize(10, 21), Policy { rps: 16, burst: 32 });
    assert_eq!(Policy::quantize(17, 33), Policy { rps: 32, burst: 64 });

    let limiter = PolicyRateLimiter::new(PolicyLimiterOptions::default(), TokioTaskManager::new()).unwrap();
    let ctx = |ep: &str, rps: i32, burst: i32| PolicyContext {
        endpoint: NetworkEndpoint::new(ep),
        declared: PacketRateLimitAttribute {
            requests_per_second: rps,
            burst,
        },
    };
    limiter.check(1, &ctx("203.0.113.10", 10, 20)).unwrap();
    limiter.check(1, &ctx("203.0.113.11", 10, 21)).unwrap();
    limiter.check(1, &ctx("203.0.113.12", 17, 33)).unwrap();
    // (10,20) and (10,21) quantize to the same tier and share one entry;
    // (17,33) quantizes to a distinct tier.
    assert_eq!(limiter.registry_len(), 2);
}

#[test]
fn seed_4_concurrency_gate_no_queue_admits_exactly_capacity() {
    let gate = ConcurrencyGate::new(ConcurrencyGateOptions::default(), TokioTaskManager::new()).unwrap();
    let attr = PacketConcurrencyLimitAttribute {
        max: 2,
        queue: false,
        queue_max: 0,
    };

    let a = gate.try_enter(1, attr);
    let b = gate.try_enter(1, attr);
    let c = gate.try_enter(1, attr);

    assert!(a.is_some());
    assert!(b.is_some());
    assert!(c.is_none());
}

#[tokio::test]
async fn seed_5_concurrency_gate_bounded_queue_fails_fast_when_full() {
    let gate = ConcurrencyGate::new(ConcurrencyGateOptions::default(), TokioTaskManager::new()).unwrap();
    let attr = PacketConcurrencyLimitAttribute {
        max: 1,
        queue: true,
        queue_max: 2,
    };
    let cancel = tokio_util::sync::CancellationToken::new();

    let holder = gate.enter_async(1, attr, &cancel).await.unwrap();

    let gate_a = gate.clone();
    let cancel_a = cancel.clone();
    let waiter_a = tokio::spawn(async move { gate_a.enter_async(1, attr, &cancel_a).await });
    let gate_b = gate.clone();
    let cancel_b = cancel.clone();
    let waiter_b = tokio::spawn(async move { gate_b.enter_async(1, attr, &cancel_b).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let fourth = gate.enter_async(1, attr, &cancel).await;
    assert!(matches!(
        fourth,
        Err(AdmissionError::ConcurrencyRejected(RejectReason::QueueFull))
    ));

    drop(holder);
    assert!(waiter_a.await.unwrap().is_ok());
    assert!(waiter_b.await.unwrap().is_ok());
}

#[tokio::test]
async fn seed_6_connection_limiter_cas_under_race() {
    let limiter = ConnectionLimiter::new(
        ConnLimitOptions {
            max_connections_per_ip: 5,
            ..ConnLimitOptions::default()
        },
        TokioTaskManager::new(),
    )
    .unwrap();
    let ip = Arc::new(NetworkEndpoint::new("203.0.113.20"));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let limiter = limiter.clone();
        let ip = ip.clone();
        handles.push(tokio::spawn(async move { limiter.is_connection_allowed(&ip) }));
    }

    let mut allowed = 0;
    for h in handles {
        if h.await.unwrap() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 5);

    for _ in 0..5 {
        assert!(limiter.connection_closed(&ip));
    }
    assert_eq!(limiter.get_connection_info(&ip).current, 0);
}
