//! Policy-quantization registry (spec §4.2 `PolicyRateLimiter`).
//!
//! Multiplexes an unbounded cardinality of `(opcode, endpoint, declared
//! policy)` triples onto a bounded set of shared [`TokenBucketLimiter`]s —
//! one per quantized [`Policy`] — so the background cleanup-job count stays
//! proportional to `max_policies` rather than to endpoint cardinality.
//! Grounded on the teacher's `CircuitBreakerRegistry`: a `DashMap<Key, Arc<_>>`
//! with a get-or-create fast path and a racing insert on miss.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::config::{validate_policy_limiter, PacketRateLimitAttribute, PolicyLimiterOptions, TokenBucketOptions};
use crate::endpoint::{CompositeEndpointKey, NetworkEndpoint};
use crate::error::Result;
use crate::policy::Policy;
use crate::scheduler::TaskManager;
use crate::time::now_utc_secs;
use crate::token_bucket::{Decision, DenyReason, TokenBucketLimiter};

struct PolicyEntry {
    limiter: Arc<TokenBucketLimiter<CompositeEndpointKey>>,
    last_used_utc: AtomicU64,
}

/// What a caller declared for one `(opcode, endpoint)` check.
pub struct PolicyContext {
    pub endpoint: NetworkEndpoint,
    pub declared: PacketRateLimitAttribute,
}

/// Bounded-cardinality policy registry routing checks to shared buckets.
pub struct PolicyRateLimiter {
    registry: DashMap<Policy, Arc<PolicyEntry>>,
    options: PolicyLimiterOptions,
    task_manager: Arc<dyn TaskManager>,
    check_count: AtomicU32,
}

impl PolicyRateLimiter {
    /// Validates `options` — including the shared `bucket_defaults` every
    /// quantized policy's limiter is seeded from — before constructing
    /// anything (spec §7: validation errors are fatal and must not start
    /// background work). `sweep_every_n == 0` would otherwise panic on the
    /// modulo in [`Self::check`].
    pub fn new(options: PolicyLimiterOptions, task_manager: Arc<dyn TaskManager>) -> Result<Self> {
        validate_policy_limiter(&options)?;
        Ok(Self {
            registry: DashMap::new(),
            options,
            task_manager,
            check_count: AtomicU32::new(0),
        })
    }

    /// Evaluate admission for `opcode` against `context.declared`, routed
    /// through the quantized policy's shared bucket (spec §4.2 Algorithm).
    pub fn check(&self, opcode: u16, context: &PolicyContext) -> Result<Decision> {
        if context.declared.requests_per_second <= 0 {
            return Ok(Decision {
                allowed: true,
                retry_after_ms: 0,
                credit: u16::MAX,
                reason: DenyReason::None,
            });
        }
        if context.declared.burst <= 0 {
            return Ok(Decision {
                allowed: false,
                retry_after_ms: i32::MAX,
                credit: 0,
                reason: DenyReason::HardLockout,
            });
        }

        let policy = Policy::quantize(context.declared.requests_per_second, context.declared.burst);
        let entry = self.resolve_entry(policy)?;
        entry.last_used_utc.store(now_utc_secs() as u64, Ordering::Relaxed);

        let key = CompositeEndpointKey::new(opcode, context.endpoint.clone());
        let decision = entry.limiter.check(key)?;

        if self.check_count.fetch_add(1, Ordering::Relaxed) % self.options.sweep_every_n == 0 {
            self.sweep();
        }

        Ok(decision)
    }

    fn resolve_entry(&self, policy: Policy) -> Result<Arc<PolicyEntry>> {
        if let Some(existing) = self.registry.get(&policy) {
            return Ok(existing.value().clone());
        }

        if self.registry.len() >= self.options.max_policies {
            return Ok(self.nearest_entry(policy));
        }

        let mut bucket_opts = self.options.bucket_defaults.clone();
        bucket_opts.capacity_tokens = policy.burst;
        bucket_opts.refill_tokens_per_second = policy.rps as f64;
        let candidate = TokenBucketLimiter::new(bucket_opts, self.task_manager.clone())?;
        let candidate_entry = Arc::new(PolicyEntry {
            limiter: candidate,
            last_used_utc: AtomicU64::new(now_utc_secs() as u64),
        });

        match self.registry.entry(policy) {
            Entry::Occupied(e) => {
                // Lost the race: another thread inserted first. Tear down
                // our speculative limiter so its cleanup job doesn't leak.
                candidate_entry.limiter.dispose();
                Ok(e.get().clone())
            }
            Entry::Vacant(e) => {
                metrics::counter!("admission_policy_registry_misses_total").increment(1);
                metrics::gauge!("admission_policy_registry_size").set(self.registry.len() as f64 + 1.0);
                Ok(e.insert(candidate_entry).clone())
            }
        }
    }

    /// Map `policy` onto the registry's nearest existing entry by L1
    /// distance, breaking ties by iteration order (spec §4.2 step 5). The
    /// registry is at its cap, so `policy` itself is never inserted.
    fn nearest_entry(&self, policy: Policy) -> Arc<PolicyEntry> {
        let mut best: Option<(i64, Arc<PolicyEntry>)> = None;
        for item in self.registry.iter() {
            let distance = policy.l1_distance(item.key());
            if best.as_ref().map(|(d, _)| distance < *d).unwrap_or(true) {
                best = Some((distance, item.value().clone()));
            }
        }
        best.map(|(_, entry)| entry)
            .expect("registry at cap must have at least one entry")
    }

    fn sweep(&self) {
        let now = now_utc_secs();
        let ttl = self.options.policy_ttl_seconds;
        let stale: Vec<Policy> = self
            .registry
            .iter()
            .filter(|item| now - item.value().last_used_utc.load(Ordering::Relaxed) as i64 > ttl)
            .map(|item| *item.key())
            .collect();

        for policy in stale {
            if let Some((_, entry)) = self.registry.remove(&policy) {
                entry.limiter.dispose();
            }
        }
        metrics::gauge!("admission_policy_registry_size").set(self.registry.len() as f64);
    }

    /// Number of distinct quantized policies currently registered.
    pub fn registry_len(&self) -> usize {
        self.registry.len()
    }
}
