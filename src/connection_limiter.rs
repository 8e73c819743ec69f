//! Per-source-address concurrent-connection counter with daily totals
//! (spec §4.4 `ConnectionLimiter`).
//!
//! The spec's reference algorithm describes a lock-free CAS retry loop over
//! the whole record (read, compute proposed, `try_update(old, new)`, retry on
//! contention). This implementation gets the same observable guarantee —
//! every `current`/`total_today`/`last_connection_utc` update is an atomic,
//! all-or-nothing transition of the whole record, and no address blocks any
//! other — via a per-entry `Mutex<ConnectionLimitInfo>` instead of an actual
//! compare-and-swap: the whole struct doesn't pack into one machine word
//! without unsafe code the CAS loop wouldn't buy back, so the mutex plays
//! the role the single `try_update` call would. `DashMap` still gives each
//! address its own independent lock, the same shape
//! `token_bucket::EndpointState` uses for its per-endpoint state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;

use crate::config::{validate_conn_limiter, ConnLimitOptions};
use crate::endpoint::NetworkEndpoint;
use crate::error::Result;
use crate::scheduler::{RecurringOptions, TaskManager};
use crate::time::{now_utc_secs, utc_day_number};

/// Snapshot of one address's connection bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimitInfo {
    pub current: i32,
    pub last_connection_utc: i64,
    pub total_today: i32,
}

impl Default for ConnectionLimitInfo {
    fn default() -> Self {
        Self {
            current: 0,
            last_connection_utc: 0,
            total_today: 0,
        }
    }
}

/// RAII handle returned by [`ConnectionLimiter::try_acquire`]. Dropping it
/// calls [`ConnectionLimiter::connection_closed`] exactly once.
pub struct ConnectionLease {
    limiter: Arc<ConnectionLimiter>,
    endpoint: NetworkEndpoint,
    active: bool,
}

impl ConnectionLease {
    pub fn dispose(&mut self) {
        if self.active {
            self.active = false;
            self.limiter.connection_closed(&self.endpoint);
        }
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.dispose();
    }
}

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

pub struct ConnectionLimiter {
    entries: DashMap<NetworkEndpoint, Arc<Mutex<ConnectionLimitInfo>>>,
    options: ConnLimitOptions,
    task_manager: Arc<dyn TaskManager>,
    job_name: String,
    disposed: AtomicBool,
    cleaning: AtomicBool,
}

impl ConnectionLimiter {
    /// Validates `options` (spec §4.4 "Validation") before constructing
    /// anything; a rejected configuration never schedules a cleanup job
    /// (spec §7: validation errors are fatal and must not start background
    /// work).
    pub fn new(options: ConnLimitOptions, task_manager: Arc<dyn TaskManager>) -> Result<Arc<Self>> {
        validate_conn_limiter(&options)?;

        let instance_id = NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed);
        let limiter = Arc::new(Self {
            entries: DashMap::new(),
            options,
            task_manager,
            job_name: format!("ConnectionLimiter.cleanup.{instance_id}"),
            disposed: AtomicBool::new(false),
            cleaning: AtomicBool::new(false),
        });
        limiter.schedule_cleanup();
        Ok(limiter)
    }

    /// Admit one more connection from `endpoint`, rolling the daily total
    /// over at UTC midnight (spec §4.4 Algorithm).
    pub fn is_connection_allowed(&self, endpoint: &NetworkEndpoint) -> bool {
        if self.disposed.load(Ordering::Acquire) {
            return false;
        }
        let record = self
            .entries
            .entry(endpoint.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ConnectionLimitInfo::default())))
            .clone();

        let mut info = record.lock().expect("connection record mutex poisoned");
        if info.current >= self.options.max_connections_per_ip {
            metrics::counter!("admission_connection_rejected_total").increment(1);
            return false;
        }

        let now = now_utc_secs();
        let is_new_day = info.last_connection_utc == 0 || utc_day_number(now) > utc_day_number(info.last_connection_utc);
        info.total_today = if is_new_day { 1 } else { info.total_today + 1 };
        info.current += 1;
        info.last_connection_utc = now;
        metrics::gauge!("admission_connection_tracked_addresses").set(self.entries.len() as f64);
        true
    }

    /// Returns `false` if `endpoint` has no tracked record.
    pub fn connection_closed(&self, endpoint: &NetworkEndpoint) -> bool {
        match self.entries.get(endpoint) {
            Some(record) => {
                let mut info = record.value().lock().expect("connection record mutex poisoned");
                info.current = (info.current - 1).max(0);
                true
            }
            None => false,
        }
    }

    /// Defaults to the Unix epoch for an address with no tracked record.
    pub fn get_connection_info(&self, endpoint: &NetworkEndpoint) -> ConnectionLimitInfo {
        match self.entries.get(endpoint) {
            Some(record) => *record.value().lock().expect("connection record mutex poisoned"),
            None => ConnectionLimitInfo::default(),
        }
    }

    pub fn try_acquire(self: &Arc<Self>, endpoint: &NetworkEndpoint) -> Option<ConnectionLease> {
        if self.is_connection_allowed(endpoint) {
            Some(ConnectionLease {
                limiter: self.clone(),
                endpoint: endpoint.clone(),
                active: true,
            })
        } else {
            None
        }
    }

    fn schedule_cleanup(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = Duration::from_secs(self.options.cleanup_interval_secs);
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
                tag: "connection_limiter_cleanup".to_string(),
                non_reentrant: true,
                ..Default::default()
            },
        );
    }

    async fn run_cleanup(&self) {
        if self.cleaning.swap(true, Ordering::AcqRel) {
            return;
        }

        let now = now_utc_secs();
        let threshold = self.options.inactivity_threshold_secs as i64;
        let mut to_remove = Vec::new();

        for (visited, item) in self.entries.iter().enumerate() {
            if visited >= self.options.max_keys_per_run {
                break;
            }
            let info = *item.value().lock().expect("connection record mutex poisoned");
            if info.current <= 0 && now - info.last_connection_utc > threshold {
                to_remove.push(item.key().clone());
            }
        }

        for key in &to_remove {
            self.entries.remove(key);
        }
        metrics::gauge!("admission_connection_tracked_addresses").set(self.entries.len() as f64);

        self.cleaning.store(false, Ordering::Release);
    }

    pub fn tracked_addresses(&self) -> usize {
        self.entries.len()
    }

    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.task_manager.cancel_recurring(&self.job_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TokioTaskManager;

    fn limiter(max: i32) -> Arc<ConnectionLimiter> {
        let opts = ConnLimitOptions {
            max_connections_per_ip: max,
            ..ConnLimitOptions::default()
        };
        ConnectionLimiter::new(opts, TokioTaskManager::new()).expect("valid options")
    }

    #[test]
    fn allows_up_to_the_configured_cap() {
        let lim = limiter(2);
        let ep = NetworkEndpoint::new("10.0.2.1");
        assert!(lim.is_connection_allowed(&ep));
        assert!(lim.is_connection_allowed(&ep));
        assert!(!lim.is_connection_allowed(&ep));
    }

    #[test]
    fn closing_a_connection_frees_a_slot() {
        let lim = limiter(1);
        let ep = NetworkEndpoint::new("10.0.2.2");
        assert!(lim.is_connection_allowed(&ep));
        assert!(!lim.is_connection_allowed(&ep));
        assert!(lim.connection_closed(&ep));
        assert!(lim.is_connection_allowed(&ep));
    }

    #[test]
    fn closing_unknown_address_returns_false() {
        let lim = limiter(4);
        let ep = NetworkEndpoint::new("10.0.2.3");
        assert!(!lim.connection_closed(&ep));
    }

    #[test]
    fn total_today_accumulates_within_the_same_day() {
        let lim = limiter(10);
        let ep = NetworkEndpoint::new("10.0.2.4");
        lim.is_connection_allowed(&ep);
        lim.connection_closed(&ep);
        lim.is_connection_allowed(&ep);
        let info = lim.get_connection_info(&ep);
        assert_eq!(info.total_today, 2);
    }

    #[test]
    fn unknown_address_defaults_to_epoch() {
        let lim = limiter(4);
        let ep = NetworkEndpoint::new("10.0.2.5");
        let info = lim.get_connection_info(&ep);
        assert_eq!(info, ConnectionLimitInfo::default());
        assert_eq!(info.last_connection_utc, 0);
    }

    #[test]
    fn rejects_zero_max_connections_per_ip() {
        let opts = ConnLimitOptions {
            max_connections_per_ip: 0,
            ..ConnLimitOptions::default()
        };
        let err = ConnectionLimiter::new(opts, TokioTaskManager::new()).unwrap_err();
        assert!(matches!(err, crate::error::AdmissionError::Validation(_)));
    }

    #[test]
    fn try_acquire_releases_on_drop() {
        let lim = limiter(1);
        let ep = NetworkEndpoint::new("10.0.2.6");
        {
            let _lease = lim.try_acquire(&ep).expect("first lease should succeed");
            assert!(lim.try_acquire(&ep).is_none());
        }
        assert!(lim.try_acquire(&ep).is_some());
    }
}
