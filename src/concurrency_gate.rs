//! Per-opcode concurrency guard with optional bounded FIFO queueing
//! (spec §4.3 `ConcurrencyGate`).
//!
//! Grounded on the teacher's `CircuitBreakerRegistry` for the
//! get-or-create/refcount shape, generalized to own a real `Semaphore`
//! per entry instead of an atomic state byte.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::{validate_concurrency_gate, ConcurrencyGateOptions, PacketConcurrencyLimitAttribute};
use crate::error::{AdmissionError, RejectReason, Result};
use crate::scheduler::{RecurringOptions, TaskManager};
use crate::time::now_utc_secs;

struct Entry {
    capacity: i32,
    semaphore: Arc<Semaphore>,
    queue_count: AtomicI32,
    active_users: AtomicI32,
    last_used_utc: AtomicI64,
    disposed: AtomicBool,
}

/// RAII handle for one acquired slot. Dropping it (or calling
/// [`Lease::dispose`] explicitly) releases the semaphore permit and
/// decrements the entry's refcount exactly once.
pub struct Lease {
    permit: Option<OwnedSemaphorePermit>,
    entry: Arc<Entry>,
}

impl Lease {
    /// Idempotent: a second call, or a drop after an explicit call, is a
    /// no-op.
    pub fn dispose(&mut self) {
        if self.permit.take().is_some() {
            self.entry.active_users.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Gate bounding concurrent in-flight operations per `u16` opcode.
pub struct ConcurrencyGate {
    entries: DashMap<u16, Arc<Entry>>,
    options: ConcurrencyGateOptions,
    task_manager: Arc<dyn TaskManager>,
    job_name: String,
    disposed: AtomicBool,
    total_acquired: AtomicU64,
    total_rejected: AtomicU64,
    total_queued: AtomicU64,
    total_cleaned_entries: AtomicU64,
}

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

impl ConcurrencyGate {
    /// Validates `options` before constructing anything; a rejected
    /// configuration never schedules the idle-scan job (spec §7: validation
    /// errors are fatal and must not start background work).
    pub fn new(options: ConcurrencyGateOptions, task_manager: Arc<dyn TaskManager>) -> Result<Arc<Self>> {
        validate_concurrency_gate(&options)?;

        let instance_id = NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed);
        let job_name = format!("ConcurrencyGate.idle_scan.{instance_id}");
        let gate = Arc::new(Self {
            entries: DashMap::new(),
            options,
            task_manager,
            job_name,
            disposed: AtomicBool::new(false),
            total_acquired: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
            total_queued: AtomicU64::new(0),
            total_cleaned_entries: AtomicU64::new(0),
        });
        gate.schedule_idle_scan();
        Ok(gate)
    }

    /// Non-blocking acquire: returns `None` immediately if the cap is
    /// reached, never enqueues.
    pub fn try_enter(&self, opcode: u16, attr: PacketConcurrencyLimitAttribute) -> Option<Lease> {
        if self.disposed.load(Ordering::Acquire) {
            return None;
        }
        let entry = self.acquire_entry(opcode, attr);

        match entry.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Some(self.finish_acquire(entry, permit)),
            Err(_) => {
                entry.active_users.fetch_sub(1, Ordering::AcqRel);
                self.total_rejected.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("admission_concurrency_rejected_total").increment(1);
                None
            }
        }
    }

    /// May suspend awaiting a free slot (spec §4.3 step 4) if `attr.queue`
    /// is set; honors `cancel`. Counters stay balanced on every exit path.
    pub async fn enter_async(
        &self,
        opcode: u16,
        attr: PacketConcurrencyLimitAttribute,
        cancel: &CancellationToken,
    ) -> Result<Lease> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(AdmissionError::Disposed);
        }
        let entry = self.acquire_entry(opcode, attr);

        if !attr.queue {
            return match entry.semaphore.clone().try_acquire_owned() {
                Ok(permit) => Ok(self.finish_acquire(entry, permit)),
                Err(_) => {
                    entry.active_users.fetch_sub(1, Ordering::AcqRel);
                    self.total_rejected.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("admission_concurrency_rejected_total").increment(1);
                    Err(AdmissionError::ConcurrencyRejected(RejectReason::AtCapacity))
                }
            };
        }

        if attr.queue_max > 0 && !try_reserve_queue_slot(&entry.queue_count, attr.queue_max) {
            entry.active_users.fetch_sub(1, Ordering::AcqRel);
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("admission_concurrency_rejected_total").increment(1);
            return Err(AdmissionError::ConcurrencyRejected(RejectReason::QueueFull));
        }
        self.total_queued.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("admission_concurrency_queued_total").increment(1);

        let semaphore = entry.semaphore.clone();
        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AdmissionError::Cancelled),
            permit = semaphore.acquire_owned() => permit.map_err(|_| AdmissionError::Disposed),
        };

        if attr.queue_max > 0 {
            entry.queue_count.fetch_sub(1, Ordering::AcqRel);
        }

        match acquired {
            Ok(permit) if cancel.is_cancelled() => {
                // Raced acquisition against cancellation: release the
                // permit immediately rather than handing out a lease.
                drop(permit);
                entry.active_users.fetch_sub(1, Ordering::AcqRel);
                Err(AdmissionError::Cancelled)
            }
            Ok(permit) => Ok(self.finish_acquire(entry, permit)),
            Err(e) => {
                entry.active_users.fetch_sub(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    fn finish_acquire(&self, entry: Arc<Entry>, permit: OwnedSemaphorePermit) -> Lease {
        entry.last_used_utc.store(now_utc_secs(), Ordering::Relaxed);
        self.total_acquired.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("admission_concurrency_acquired_total").increment(1);
        Lease {
            permit: Some(permit),
            entry,
        }
    }

    fn get_or_create(&self, opcode: u16, attr: PacketConcurrencyLimitAttribute) -> Arc<Entry> {
        if let Some(existing) = self.entries.get(&opcode) {
            return existing.value().clone();
        }
        self.entries
            .entry(opcode)
            .or_insert_with(|| {
                Arc::new(Entry {
                    capacity: attr.max,
                    semaphore: Arc::new(Semaphore::new(attr.max.max(0) as usize)),
                    queue_count: AtomicI32::new(0),
                    active_users: AtomicI32::new(0),
                    last_used_utc: AtomicI64::new(now_utc_secs()),
                    disposed: AtomicBool::new(false),
                })
            })
            .clone()
    }

    /// Acquire a refcount on the opcode's entry, retrying against a fresh
    /// entry if the one just looked up lost a race with idle reclamation
    /// (spec §4.3 step 2).
    fn acquire_entry(&self, opcode: u16, attr: PacketConcurrencyLimitAttribute) -> Arc<Entry> {
        loop {
            let entry = self.get_or_create(opcode, attr);
            entry.active_users.fetch_add(1, Ordering::AcqRel);
            if entry.disposed.load(Ordering::Acquire) {
                entry.active_users.fetch_sub(1, Ordering::AcqRel);
                self.entries.remove_if(&opcode, |_, v| Arc::ptr_eq(v, &entry));
                continue;
            }
            return entry;
        }
    }

    fn schedule_idle_scan(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = Duration::from_secs(self.options.idle_scan_interval_secs);
        self.task_manager.schedule_recurring(
            self.job_name.clone(),
            interval,
            Arc::new(move || {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(gate) = weak.upgrade() {
                        gate.run_idle_scan().await;
                    }
                })
            }),
            RecurringOptions {
                tag: "concurrency_gate_idle_scan".to_string(),
                ..Default::default()
            },
        );
    }

    async fn run_idle_scan(&self) {
        let now = now_utc_secs();
        let min_idle = self.options.min_idle_age_secs as i64;

        let candidates: Vec<u16> = self
            .entries
            .iter()
            .filter(|item| {
                let e = item.value();
                e.active_users.load(Ordering::Acquire) == 0
                    && e.queue_count.load(Ordering::Acquire) == 0
                    && e.semaphore.available_permits() == e.capacity.max(0) as usize
                    && now - e.last_used_utc.load(Ordering::Acquire) >= min_idle
            })
            .map(|item| *item.key())
            .collect();

        for opcode in candidates {
            if let Some((_, entry)) = self.entries.remove(&opcode) {
                entry.disposed.store(true, Ordering::Release);
                let deadline =
                    tokio::time::Instant::now() + Duration::from_millis(self.options.dispose_spin_wait_millis);
                while entry.active_users.load(Ordering::Acquire) != 0 && tokio::time::Instant::now() < deadline {
                    tokio::task::yield_now().await;
                }
                self.total_cleaned_entries.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Deterministic plain-text report, worst-off opcodes first (spec §6
    /// "Diagnostic reports").
    pub fn generate_report(&self) -> String {
        use std::fmt::Write as _;

        struct Row {
            opcode: u16,
            capacity: i32,
            active_users: i32,
            queue_count: i32,
        }

        let mut rows: Vec<Row> = self
            .entries
            .iter()
            .map(|item| {
                let e = item.value();
                Row {
                    opcode: *item.key(),
                    capacity: e.capacity,
                    active_users: e.active_users.load(Ordering::Acquire),
                    queue_count: e.queue_count.load(Ordering::Acquire),
                }
            })
            .collect();
        rows.sort_by(|a, b| {
            b.active_users
                .cmp(&a.active_users)
                .then_with(|| b.queue_count.cmp(&a.queue_count))
                .then_with(|| a.opcode.cmp(&b.opcode))
        });

        let mut out = String::new();
        let _ = writeln!(out, "ConcurrencyGate report");
        let _ = writeln!(
            out,
            "idle_scan_interval_secs={} min_idle_age_secs={}",
            self.options.idle_scan_interval_secs, self.options.min_idle_age_secs
        );
        let _ = writeln!(
            out,
            "acquired={} rejected={} queued={} cleaned={}",
            self.total_acquired(),
            self.total_rejected(),
            self.total_queued(),
            self.total_cleaned_entries()
        );
        let _ = writeln!(out, "{:-<54}", "");
        let _ = writeln!(out, "{:<10}{:>10}{:>14}{:>14}", "opcode", "capacity", "active_users", "queue_count");
        for row in rows.iter().take(20) {
            let _ = writeln!(
                out,
                "{:<10}{:>10}{:>14}{:>14}",
                row.opcode, row.capacity, row.active_users, row.queue_count
            );
        }
        if rows.len() > 20 {
            let _ = writeln!(out, "... {} more", rows.len() - 20);
        }
        out
    }

    pub fn total_acquired(&self) -> u64 {
        self.total_acquired.load(Ordering::Relaxed)
    }
    pub fn total_rejected(&self) -> u64 {
        self.total_rejected.load(Ordering::Relaxed)
    }
    pub fn total_queued(&self) -> u64 {
        self.total_queued.load(Ordering::Relaxed)
    }
    pub fn total_cleaned_entries(&self) -> u64 {
        self.total_cleaned_entries.load(Ordering::Relaxed)
    }

    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.task_manager.cancel_recurring(&self.job_name);
    }
}

/// CAS loop reserving one queue slot while `counter < max`.
fn try_reserve_queue_slot(counter: &AtomicI32, max: i32) -> bool {
    let mut current = counter.load(Ordering::Acquire);
    loop {
        if current >= max {
            return false;
        }
        match counter.compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return true,
            Err(observed) => current = observed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TokioTaskManager;

    fn gate() -> Arc<ConcurrencyGate> {
        ConcurrencyGate::new(ConcurrencyGateOptions::default(), TokioTaskManager::new()).expect("valid options")
    }

    fn attr(max: i32, queue: bool, queue_max: i32) -> PacketConcurrencyLimitAttribute {
        PacketConcurrencyLimitAttribute { max, queue, queue_max }
    }

    #[test]
    fn try_enter_respects_capacity() {
        let gate = gate();
        let a = gate.try_enter(1, attr(1, false, 0));
        assert!(a.is_some());
        let b = gate.try_enter(1, attr(1, false, 0));
        assert!(b.is_none());
        assert_eq!(gate.total_rejected(), 1);

        drop(a);
        let c = gate.try_enter(1, attr(1, false, 0));
        assert!(c.is_some());
    }

    #[tokio::test]
    async fn enter_async_without_queue_rejects_at_capacity() {
        let gate = gate();
        let cancel = CancellationToken::new();
        let _lease = gate.enter_async(1, attr(1, false, 0), &cancel).await.unwrap();
        let err = gate.enter_async(1, attr(1, false, 0), &cancel).await.unwrap_err();
        assert!(matches!(
            err,
            AdmissionError::ConcurrencyRejected(RejectReason::AtCapacity)
        ));
    }

    #[tokio::test]
    async fn enter_async_with_queue_waits_for_a_free_slot() {
        let gate = gate();
        let cancel = CancellationToken::new();
        let lease = gate.enter_async(1, attr(1, true, 4), &cancel).await.unwrap();

        let gate2 = gate.clone();
        let cancel2 = cancel.clone();
        let waiter = tokio::spawn(async move { gate2.enter_async(1, attr(1, true, 4), &cancel2).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(lease);

        let second = waiter.await.unwrap();
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn queue_full_is_rejected_without_waiting() {
        let gate = gate();
        let cancel = CancellationToken::new();
        let _lease = gate.enter_async(1, attr(1, true, 1), &cancel).await.unwrap();

        // Fill the one queue slot with a waiter that never completes...
        let gate2 = gate.clone();
        let cancel2 = cancel.clone();
        let _blocked = tokio::spawn(async move { gate2.enter_async(1, attr(1, true, 1), &cancel2).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // ...so a second queue attempt is rejected immediately.
        let err = gate.enter_async(1, attr(1, true, 1), &cancel).await.unwrap_err();
        assert!(matches!(
            err,
            AdmissionError::ConcurrencyRejected(RejectReason::QueueFull)
        ));
    }

    #[tokio::test]
    async fn cancellation_while_queued_leaves_counters_balanced() {
        let gate = gate();
        let cancel = CancellationToken::new();
        let _lease = gate.enter_async(1, attr(1, true, 4), &cancel).await.unwrap();

        let gate2 = gate.clone();
        let waiter_cancel = CancellationToken::new();
        let waiter_cancel2 = waiter_cancel.clone();
        let waiter = tokio::spawn(async move { gate2.enter_async(1, attr(1, true, 4), &waiter_cancel2).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter_cancel.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(AdmissionError::Cancelled)));
    }

    #[test]
    fn rejects_zero_idle_scan_interval() {
        let opts = ConcurrencyGateOptions {
            idle_scan_interval_secs: 0,
            ..ConcurrencyGateOptions::default()
        };
        let err = ConcurrencyGate::new(opts, TokioTaskManager::new()).unwrap_err();
        assert!(matches!(err, AdmissionError::Validation(_)));
    }

    #[test]
    fn dispose_rejects_new_try_enter() {
        let gate = gate();
        gate.dispose();
        gate.dispose(); // idempotent
        assert!(gate.try_enter(1, attr(4, false, 0)).is_none());
    }

    #[test]
    fn report_lists_active_opcodes() {
        let gate = gate();
        let lease = gate.try_enter(7, attr(2, false, 0));
        assert!(lease.is_some());
        let report = gate.generate_report();
        assert!(report.contains('7'));
        assert!(report.contains("acquired=1"));
    }
}
