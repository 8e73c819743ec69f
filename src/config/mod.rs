pub mod types;

pub use types::*;

use crate::error::AdmissionError;
use std::path::Path;

impl AdmissionConfig {
    /// Load configuration from a file (if it exists), apply environment
    /// overrides, then validate. Mirrors the teacher's
    /// `GatewayConfig::load`: a missing file falls back to built-in
    /// defaults so the crate can be exercised with zero configuration.
    pub fn load(path: &Path) -> Result<Self, AdmissionError> {
        let mut config: AdmissionConfig = if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| AdmissionError::Validation(format!("reading {}: {e}", path.display())))?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)
                    .map_err(|e| AdmissionError::Validation(format!("parsing toml: {e}")))?,
                Some("json") => serde_json::from_str(&content)
                    .map_err(|e| AdmissionError::Validation(format!("parsing json: {e}")))?,
                Some(ext) => {
                    return Err(AdmissionError::Validation(format!(
                        "unsupported config format: .{ext}, use .toml or .json"
                    )))
                }
                None => {
                    return Err(AdmissionError::Validation(
                        "config file has no extension, use .toml or .json".to_string(),
                    ))
                }
            }
        } else {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            AdmissionConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!("loaded admission core configuration");
        Ok(config)
    }

    /// A handful of knobs an operator would reasonably flip without a
    /// redeploy; everything else lives in the config file.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ADMISSION_TOKEN_BUCKET_CAPACITY") {
            if let Ok(n) = v.parse() {
                self.token_bucket.capacity_tokens = n;
            }
        }
        if let Ok(v) = std::env::var("ADMISSION_TOKEN_BUCKET_REFILL_PER_SEC") {
            if let Ok(n) = v.parse() {
                self.token_bucket.refill_tokens_per_second = n;
            }
        }
        if let Ok(v) = std::env::var("ADMISSION_MAX_CONNECTIONS_PER_IP") {
            if let Ok(n) = v.parse() {
                self.connection_limiter.max_connections_per_ip = n;
            }
        }
    }

    pub fn validate(&self) -> Result<(), AdmissionError> {
        validate_token_bucket(&self.token_bucket)?;
        validate_policy_limiter(&self.policy_limiter)?;
        validate_concurrency_gate(&self.concurrency_gate)?;
        validate_conn_limiter(&self.connection_limiter)?;
        Ok(())
    }
}

/// Validation rules from spec §4.1 "Validation (construction)".
pub(crate) fn validate_token_bucket(opts: &TokenBucketOptions) -> Result<(), AdmissionError> {
    if opts.capacity_tokens <= 0 {
        return Err(AdmissionError::Validation("capacity_tokens must be > 0".into()));
    }
    if opts.refill_tokens_per_second <= 0.0 {
        return Err(AdmissionError::Validation(
            "refill_tokens_per_second must be > 0".into(),
        ));
    }
    if opts.token_scale <= 0 {
        return Err(AdmissionError::Validation("token_scale must be > 0".into()));
    }
    if opts.shard_count <= 0 || !(opts.shard_count as u32).is_power_of_two() {
        return Err(AdmissionError::Validation(
            "shard_count must be a positive power of two".into(),
        ));
    }
    if opts.stale_entry_seconds <= 0 {
        return Err(AdmissionError::Validation("stale_entry_seconds must be > 0".into()));
    }
    if opts.cleanup_interval_seconds <= 0 {
        return Err(AdmissionError::Validation(
            "cleanup_interval_seconds must be > 0".into(),
        ));
    }
    if opts.max_tracked_endpoints < 0 {
        return Err(AdmissionError::Validation(
            "max_tracked_endpoints must be >= 0".into(),
        ));
    }
    if opts.hard_lockout_seconds < 0 {
        return Err(AdmissionError::Validation(
            "hard_lockout_seconds must be >= 0".into(),
        ));
    }
    if opts.soft_violation_window_seconds <= 0 {
        return Err(AdmissionError::Validation(
            "soft_violation_window_seconds must be > 0".into(),
        ));
    }
    if opts.max_soft_violations <= 0 {
        return Err(AdmissionError::Validation("max_soft_violations must be > 0".into()));
    }
    Ok(())
}

/// Validation rules for [`crate::policy_limiter::PolicyRateLimiter`]
/// construction (spec §4.2, plus the shared bucket defaults it seeds new
/// per-policy limiters from).
pub(crate) fn validate_policy_limiter(opts: &PolicyLimiterOptions) -> Result<(), AdmissionError> {
    if opts.max_policies == 0 {
        return Err(AdmissionError::Validation(
            "policy_limiter.max_policies must be > 0".to_string(),
        ));
    }
    if opts.sweep_every_n == 0 {
        return Err(AdmissionError::Validation(
            "policy_limiter.sweep_every_n must be > 0".to_string(),
        ));
    }
    validate_token_bucket(&opts.bucket_defaults)
}

/// Validation rules for [`crate::concurrency_gate::ConcurrencyGate`]
/// construction. `idle_scan_interval_secs` feeds `tokio::time::interval`
/// directly, which panics on a zero period.
pub(crate) fn validate_concurrency_gate(opts: &ConcurrencyGateOptions) -> Result<(), AdmissionError> {
    if opts.idle_scan_interval_secs == 0 {
        return Err(AdmissionError::Validation(
            "concurrency_gate.idle_scan_interval_secs must be > 0".to_string(),
        ));
    }
    Ok(())
}

/// Validation rules for [`crate::connection_limiter::ConnectionLimiter`]
/// construction (spec §4.4 "Validation").
pub(crate) fn validate_conn_limiter(opts: &ConnLimitOptions) -> Result<(), AdmissionError> {
    if opts.max_connections_per_ip <= 0 {
        return Err(AdmissionError::Validation(
            "connection_limiter.max_connections_per_ip must be > 0".to_string(),
        ));
    }
    if opts.inactivity_threshold_secs == 0 {
        return Err(AdmissionError::Validation(
            "connection_limiter.inactivity_threshold_secs must be > 0".to_string(),
        ));
    }
    if opts.cleanup_interval_secs == 0 {
        return Err(AdmissionError::Validation(
            "connection_limiter.cleanup_interval_secs must be > 0".to_string(),
        ));
    }
    Ok(())
}
