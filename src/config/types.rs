use serde::{Deserialize, Serialize};

/// Construction-time options for a [`crate::token_bucket::TokenBucketLimiter`]
/// (spec §6 TokenBucketOptions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBucketOptions {
    #[serde(default = "default_capacity_tokens")]
    pub capacity_tokens: i32,

    #[serde(default = "default_refill_rate")]
    pub refill_tokens_per_second: f64,

    #[serde(default = "default_token_scale")]
    pub token_scale: i32,

    #[serde(default = "default_shard_count")]
    pub shard_count: i32,

    #[serde(default = "default_hard_lockout_seconds")]
    pub hard_lockout_seconds: i32,

    #[serde(default = "default_stale_entry_seconds")]
    pub stale_entry_seconds: i32,

    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: i32,

    #[serde(default)]
    pub max_tracked_endpoints: i32,

    #[serde(default = "default_soft_violation_window_seconds")]
    pub soft_violation_window_seconds: i32,

    #[serde(default = "default_max_soft_violations")]
    pub max_soft_violations: i32,

    #[serde(default = "default_initial_tokens")]
    pub initial_tokens: i32,
}

impl Default for TokenBucketOptions {
    fn default() -> Self {
        Self {
            capacity_tokens: default_capacity_tokens(),
            refill_tokens_per_second: default_refill_rate(),
            token_scale: default_token_scale(),
            shard_count: default_shard_count(),
            hard_lockout_seconds: default_hard_lockout_seconds(),
            stale_entry_seconds: default_stale_entry_seconds(),
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
            max_tracked_endpoints: 0,
            soft_violation_window_seconds: default_soft_violation_window_seconds(),
            max_soft_violations: default_max_soft_violations(),
            initial_tokens: default_initial_tokens(),
        }
    }
}

fn default_capacity_tokens() -> i32 {
    32
}
fn default_refill_rate() -> f64 {
    10.0
}
fn default_token_scale() -> i32 {
    1_000_000
}
fn default_shard_count() -> i32 {
    16
}
fn default_hard_lockout_seconds() -> i32 {
    30
}
fn default_stale_entry_seconds() -> i32 {
    300
}
fn default_cleanup_interval_seconds() -> i32 {
    60
}
fn default_soft_violation_window_seconds() -> i32 {
    10
}
fn default_max_soft_violations() -> i32 {
    3
}
fn default_initial_tokens() -> i32 {
    -1
}

/// Registry-level options for [`crate::policy_limiter::PolicyRateLimiter`].
///
/// Not named as a standalone struct in the protocol-facing recognized
/// options of spec §6 (only the per-request attributes are), but every
/// quantized policy still needs somewhere to read its bucket defaults and
/// registry bounds from — this is that home, following the same
/// defaulted-struct shape as [`TokenBucketOptions`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyLimiterOptions {
    #[serde(default = "default_max_policies")]
    pub max_policies: usize,

    #[serde(default = "default_policy_ttl_seconds")]
    pub policy_ttl_seconds: i64,

    #[serde(default = "default_sweep_every_n")]
    pub sweep_every_n: u32,

    /// Shared defaults used when constructing a new per-policy bucket;
    /// `capacity_tokens`/`refill_tokens_per_second` are overridden per
    /// policy with the quantized `(burst, rps)`.
    #[serde(default)]
    pub bucket_defaults: TokenBucketOptions,
}

impl Default for PolicyLimiterOptions {
    fn default() -> Self {
        Self {
            max_policies: default_max_policies(),
            policy_ttl_seconds: default_policy_ttl_seconds(),
            sweep_every_n: default_sweep_every_n(),
            bucket_defaults: TokenBucketOptions::default(),
        }
    }
}

fn default_max_policies() -> usize {
    64
}
fn default_policy_ttl_seconds() -> i64 {
    600
}
fn default_sweep_every_n() -> u32 {
    1024
}

/// Handler-declared rate policy (spec §6 PacketRateLimitAttribute).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketRateLimitAttribute {
    pub requests_per_second: i32,
    pub burst: i32,
}

/// Handler-declared concurrency policy (spec §6 PacketConcurrencyLimitAttribute).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketConcurrencyLimitAttribute {
    pub max: i32,
    pub queue: bool,
    pub queue_max: i32,
}

/// Gate-wide options for [`crate::concurrency_gate::ConcurrencyGate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyGateOptions {
    #[serde(default = "default_idle_scan_interval_secs", rename = "idle_scan_interval_secs")]
    pub idle_scan_interval_secs: u64,

    #[serde(default = "default_min_idle_age_secs", rename = "min_idle_age_secs")]
    pub min_idle_age_secs: u64,

    #[serde(default = "default_dispose_spin_wait_millis", rename = "dispose_spin_wait_millis")]
    pub dispose_spin_wait_millis: u64,
}

impl Default for ConcurrencyGateOptions {
    fn default() -> Self {
        Self {
            idle_scan_interval_secs: default_idle_scan_interval_secs(),
            min_idle_age_secs: default_min_idle_age_secs(),
            dispose_spin_wait_millis: default_dispose_spin_wait_millis(),
        }
    }
}

fn default_idle_scan_interval_secs() -> u64 {
    60
}
fn default_min_idle_age_secs() -> u64 {
    600
}
fn default_dispose_spin_wait_millis() -> u64 {
    100
}

/// Options for [`crate::connection_limiter::ConnectionLimiter`] (spec §6
/// ConnLimitOptions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnLimitOptions {
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: i32,

    #[serde(default = "default_inactivity_threshold_secs", rename = "inactivity_threshold_secs")]
    pub inactivity_threshold_secs: u64,

    #[serde(default = "default_cleanup_interval_secs", rename = "cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    #[serde(default = "default_max_keys_per_run")]
    pub max_keys_per_run: usize,
}

impl Default for ConnLimitOptions {
    fn default() -> Self {
        Self {
            max_connections_per_ip: default_max_connections_per_ip(),
            inactivity_threshold_secs: default_inactivity_threshold_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            max_keys_per_run: default_max_keys_per_run(),
        }
    }
}

fn default_max_connections_per_ip() -> i32 {
    100
}
fn default_inactivity_threshold_secs() -> u64 {
    3600
}
fn default_cleanup_interval_secs() -> u64 {
    120
}
fn default_max_keys_per_run() -> usize {
    4096
}

/// Top-level aggregate, the unit `AdmissionConfig::load` reads from a
/// TOML/JSON file (spec §1.2 addition — mirrors the teacher's
/// `GatewayConfig`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default)]
    pub token_bucket: TokenBucketOptions,

    #[serde(default)]
    pub policy_limiter: PolicyLimiterOptions,

    #[serde(default)]
    pub concurrency_gate: ConcurrencyGateOptions,

    #[serde(default)]
    pub connection_limiter: ConnLimitOptions,
}
