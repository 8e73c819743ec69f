//! Sharded token bucket limiter (spec §4.1 `TokenBucketLimiter`).
//!
//! Grounded on the teacher's `proxy::filter::rate_limit::Bucket` — a
//! `DashMap`-sharded, fixed-point token bucket with a GC pass — generalized
//! over the key type so the same limiter backs both a plain per-endpoint
//! policy and the `(opcode, endpoint)` composite key a shared
//! `PolicyRateLimiter` bucket uses.

mod report;
mod shard;
mod state;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;

use crate::config::TokenBucketOptions;
use crate::endpoint::{fnv1a_32, CompositeEndpointKey, NetworkEndpoint};
use crate::error::{AdmissionError, Result};
use crate::list_pool::ListPool;
use crate::scheduler::{RecurringOptions, TaskManager};
use crate::time::{now_ticks, secs_to_ticks};

use state::EndpointState;

pub(crate) use report::ReportRow;
pub(crate) use shard::shard_index;

/// Why a check was denied. `None` on allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    None,
    SoftThrottle,
    HardLockout,
}

/// The outcome of a single [`TokenBucketLimiter::check`] call (spec §3
/// Decision). Never an error — admission outcomes are data, not exceptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub retry_after_ms: i32,
    pub credit: u16,
    pub reason: DenyReason,
}

/// A key a [`TokenBucketLimiter`] can track: something hashable, cloneable,
/// and cheap to place into one of the limiter's shards.
///
/// `shard_hash` is distinct from `Hash`/`Eq` (which the backing `DashMap`
/// uses for membership): it is the raw input to the avalanche mix in
/// [`shard::shard_index`], and must be stable across calls for the same
/// logical key.
pub trait ShardKey: std::hash::Hash + Eq + Clone + Send + Sync + 'static {
    fn shard_hash(&self) -> u32;

    /// Human-readable label for diagnostic reports.
    fn describe(&self) -> String;
}

impl ShardKey for NetworkEndpoint {
    fn shard_hash(&self) -> u32 {
        self.stable_hash()
    }

    fn describe(&self) -> String {
        self.address().to_string()
    }
}

impl ShardKey for CompositeEndpointKey {
    fn shard_hash(&self) -> u32 {
        let mut bytes = Vec::with_capacity(2 + self.endpoint.address().len());
        bytes.extend_from_slice(&self.opcode.to_le_bytes());
        bytes.extend_from_slice(self.endpoint.address().as_bytes());
        fnv1a_32(&bytes)
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.opcode, self.endpoint.address())
    }
}

/// Fixed-point configuration derived once from [`TokenBucketOptions`] at
/// construction, so the hot path never touches the float `refill_tokens_per_second`.
pub(crate) struct BucketConfig {
    pub capacity_micro: i64,
    pub refill_per_sec_micro: i64,
    pub token_scale: i64,
    pub hard_lockout_ticks: i64,
    pub soft_window_ticks: i64,
    pub max_soft_violations: i32,
}

impl BucketConfig {
    fn from_options(opts: &TokenBucketOptions) -> Self {
        Self {
            capacity_micro: opts.capacity_tokens as i64 * opts.token_scale as i64,
            refill_per_sec_micro: (opts.refill_tokens_per_second * opts.token_scale as f64).round() as i64,
            token_scale: opts.token_scale as i64,
            hard_lockout_ticks: secs_to_ticks(opts.hard_lockout_seconds as i64),
            soft_window_ticks: secs_to_ticks(opts.soft_violation_window_seconds as i64),
            max_soft_violations: opts.max_soft_violations,
        }
    }
}

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// A sharded, fixed-point token bucket rate limiter keyed by `K`.
pub struct TokenBucketLimiter<K: ShardKey> {
    shards: Vec<DashMap<K, Arc<Mutex<EndpointState>>>>,
    cfg: BucketConfig,
    options: TokenBucketOptions,
    total_endpoint_count: AtomicI64,
    task_manager: Arc<dyn TaskManager>,
    job_name: String,
    disposed: AtomicBool,
    cleanup_pool: ListPool<K>,
    cap_pool: ListPool<(K, i64)>,
    report_pool: ListPool<ReportRow>,
}

impl<K: ShardKey> TokenBucketLimiter<K> {
    /// Construct a new limiter and schedule its recurring cleanup job on
    /// `task_manager`. Returned already wrapped in `Arc` because the
    /// cleanup job holds a weak reference to `self`.
    pub fn new(options: TokenBucketOptions, task_manager: Arc<dyn TaskManager>) -> Result<Arc<Self>> {
        crate::config::validate_token_bucket(&options)?;

        let shard_count = options.shard_count as usize;
        let shards = (0..shard_count).map(|_| DashMap::new()).collect();
        let instance_id = NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed);
        let job_name = format!("TokenBucketLimiter.cleanup.{instance_id}");
        let cfg = BucketConfig::from_options(&options);

        let limiter = Arc::new(Self {
            shards,
            cfg,
            options,
            total_endpoint_count: AtomicI64::new(0),
            task_manager,
            job_name,
            disposed: AtomicBool::new(false),
            cleanup_pool: ListPool::new(4),
            cap_pool: ListPool::new(4),
            report_pool: ListPool::new(4),
        });
        limiter.schedule_cleanup();
        Ok(limiter)
    }

    /// Evaluate and consume (or deny) one admission for `key`.
    pub fn check(&self, key: K) -> Result<Decision> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(AdmissionError::Disposed);
        }

        let now = now_ticks();
        let state_arc = match self.get_or_create_state(&key, now) {
            Ok(s) => s,
            Err(decision) => return Ok(decision),
        };

        let decision = {
            let mut state = state_arc.lock().expect("endpoint state mutex poisoned");
            state.check(&self.cfg, now)
        };
        self.record_metrics(&decision);
        Ok(decision)
    }

    fn record_metrics(&self, decision: &Decision) {
        match decision.reason {
            DenyReason::None => metrics::counter!("admission_token_bucket_allowed_total").increment(1),
            DenyReason::SoftThrottle => {
                metrics::counter!("admission_token_bucket_soft_throttled_total").increment(1)
            }
            DenyReason::HardLockout => {
                metrics::counter!("admission_token_bucket_hard_locked_total").increment(1)
            }
        }
        metrics::gauge!("admission_token_bucket_tracked_endpoints")
            .set(self.total_endpoint_count.load(Ordering::Relaxed) as f64);
    }

    fn shard_for(&self, key: &K) -> &DashMap<K, Arc<Mutex<EndpointState>>> {
        let idx = shard_index(key.shard_hash(), self.shards.len());
        &self.shards[idx]
    }

    /// Returns the endpoint's state, creating it if unseen, or a synthetic
    /// denial if `max_tracked_endpoints` is already saturated (spec §4.1
    /// "Endpoint-limit enforcement").
    fn get_or_create_state(&self, key: &K, now: i64) -> std::result::Result<Arc<Mutex<EndpointState>>, Decision> {
        // Fast path: key already exists, no allocation (teacher's
        // `proxy::filter::rate_limit::Bucket::acquire` idiom).
        let shard = self.shard_for(key);
        if let Some(existing) = shard.get(key) {
            return Ok(existing.value().clone());
        }

        let max = self.options.max_tracked_endpoints as i64;
        if max > 0 && self.total_endpoint_count.load(Ordering::Acquire) >= max {
            return Err(self.synthetic_lockout());
        }

        let cfg = &self.cfg;
        let initial_tokens = self.options.initial_tokens;
        let inserted = AtomicBool::new(false);
        let state_arc = shard
            .entry(key.clone())
            .or_insert_with(|| {
                inserted.store(true, Ordering::Relaxed);
                Arc::new(Mutex::new(EndpointState::new(cfg, now, initial_tokens)))
            })
            .clone();

        if inserted.load(Ordering::Relaxed) {
            if max > 0 {
                let after = self.total_endpoint_count.fetch_add(1, Ordering::AcqRel) + 1;
                if after > max {
                    self.total_endpoint_count.fetch_sub(1, Ordering::AcqRel);
                    shard.remove(key);
                    return Err(self.synthetic_lockout());
                }
            } else {
                self.total_endpoint_count.fetch_add(1, Ordering::AcqRel);
            }
        }

        Ok(state_arc)
    }

    fn synthetic_lockout(&self) -> Decision {
        Decision {
            allowed: false,
            retry_after_ms: (self.options.hard_lockout_seconds as i64 * 1000).min(i32::MAX as i64) as i32,
            credit: 0,
            reason: DenyReason::HardLockout,
        }
    }

    fn schedule_cleanup(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = Duration::from_secs(self.options.cleanup_interval_seconds as u64);
        self.task_manager.schedule_recurring(
            self.job_name.clone(),
            interval,
            Arc::new(move || {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(limiter) = weak.upgrade() {
                        limiter.run_cleanup().await;
                    }
                })
            }),
            RecurringOptions {
                tag: "token_bucket_cleanup".to_string(),
                ..Default::default()
            },
        );
    }

    async fn run_cleanup(&self) {
        self.staleness_pass().await;
        self.cap_enforcement_pass().await;
    }

    async fn staleness_pass(&self) {
        let now = now_ticks();
        let stale_ticks = secs_to_ticks(self.options.stale_entry_seconds as i64);
        let mut visited: u32 = 0;

        for shard in &self.shards {
            if self.disposed.load(Ordering::Acquire) {
                return;
            }
            let mut to_remove = self.cleanup_pool.rent(shard.len() / 4 + 1);
            for entry in shard.iter() {
                visited += 1;
                let last_seen = entry.value().lock().expect("endpoint state mutex poisoned").last_seen_ticks;
                if now - last_seen > stale_ticks {
                    to_remove.push(entry.key().clone());
                }
                if visited % 256 == 0 {
                    tokio::task::yield_now().await;
                    if self.disposed.load(Ordering::Acquire) {
                        self.cleanup_pool.give_back(to_remove, true);
                        return;
                    }
                }
            }
            for key in to_remove.drain(..) {
                if shard.remove(&key).is_some() {
                    self.total_endpoint_count.fetch_sub(1, Ordering::AcqRel);
                }
            }
            self.cleanup_pool.give_back(to_remove, false);
            tokio::task::yield_now().await;
        }
    }

    async fn cap_enforcement_pass(&self) {
        let max = self.options.max_tracked_endpoints as i64;
        if max <= 0 {
            return;
        }
        let total = self.total_endpoint_count.load(Ordering::Acquire);
        if total <= max {
            return;
        }
        let overflow = (total - max) as usize;

        let mut snapshot = self.cap_pool.rent(total.max(0) as usize);
        for shard in &self.shards {
            for entry in shard.iter() {
                let last_seen = entry.value().lock().expect("endpoint state mutex poisoned").last_seen_ticks;
                snapshot.push((entry.key().clone(), last_seen));
            }
        }
        snapshot.sort_unstable_by_key(|(_, last_seen)| *last_seen);

        for (key, _) in snapshot.drain(..overflow.min(snapshot.len())) {
            if self.shard_for(&key).remove(&key).is_some() {
                self.total_endpoint_count.fetch_sub(1, Ordering::AcqRel);
            }
        }
        self.cap_pool.give_back(snapshot, true);
    }

    /// Idempotent teardown: cancels the cleanup job. Safe to call more than
    /// once; subsequent `check` calls return [`AdmissionError::Disposed`].
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.task_manager.cancel_recurring(&self.job_name);
    }

    pub async fn dispose_async(&self) {
        self.dispose();
    }
}
