//! Recurring-task scheduler contract (spec §6 TaskManager).
//!
//! The scheduler itself is named in spec §1 as an external collaborator
//! this core consumes rather than implements. `TaskManager` is that
//! consumed contract, expressed as a trait so a host process can supply its
//! own; [`TokioTaskManager`] is the default implementation, grounded in the
//! same `tokio::spawn` + `tokio::time::interval` + cancellation-token idiom
//! the teacher's `bootstrap::start_health_check_loop` uses for its own
//! recurring loops.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio_util::sync::CancellationToken;

/// A unit of recurring work. Boxed so `TaskManager` stays object-safe
/// without pulling in `async-trait`.
pub type RecurringWork = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Options accompanying a `schedule_recurring` call (spec §6).
#[derive(Clone)]
pub struct RecurringOptions {
    /// Free-form tag surfaced in logs/metrics for this job.
    pub tag: String,
    /// If true, a tick is skipped while the previous run is still in
    /// flight rather than overlapping it.
    pub non_reentrant: bool,
    /// Upper bound on a random per-tick delay, to avoid every instance of
    /// a component waking at exactly the same wall-clock moment.
    pub jitter: Duration,
    /// Each run is aborted (and logged) if it exceeds this.
    pub execution_timeout: Duration,
    /// Upper bound on the extra delay applied after a failing run before
    /// the next tick, to avoid a tight retry loop against a wedged job.
    pub backoff_cap: Duration,
}

impl Default for RecurringOptions {
    fn default() -> Self {
        Self {
            tag: String::new(),
            non_reentrant: true,
            jitter: Duration::from_millis(250),
            execution_timeout: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(5),
        }
    }
}

/// A named, cancellable recurring job, consumed by all four components.
pub trait TaskManager: Send + Sync {
    fn schedule_recurring(
        &self,
        name: String,
        interval: Duration,
        work: RecurringWork,
        options: RecurringOptions,
    );

    fn cancel_recurring(&self, name: &str);
}

/// Default [`TaskManager`] backed by `tokio::spawn`.
pub struct TokioTaskManager {
    jobs: DashMap<String, CancellationToken>,
}

impl TokioTaskManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            jobs: DashMap::new(),
        })
    }
}

impl Default for TokioTaskManager {
    fn default() -> Self {
        Self {
            jobs: DashMap::new(),
        }
    }
}

impl TaskManager for TokioTaskManager {
    fn schedule_recurring(
        &self,
        name: String,
        interval: Duration,
        work: RecurringWork,
        options: RecurringOptions,
    ) {
        let token = CancellationToken::new();
        if let Some(old) = self.jobs.insert(name.clone(), token.clone()) {
            old.cancel();
        }

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let running = Arc::new(AtomicBool::new(false));
            let mut consecutive_failures: u32 = 0;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!(job = %name, "scheduler: recurring job cancelled");
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                if options.non_reentrant && running.load(Ordering::Acquire) {
                    tracing::trace!(job = %name, "scheduler: skipped tick, previous run still in flight");
                    continue;
                }

                if !options.jitter.is_zero() {
                    let jitter_ms = options.jitter.as_millis().max(1) as u64;
                    let delay = Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms));
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }

                running.store(true, Ordering::Release);
                let run = tokio::time::timeout(options.execution_timeout, (work)()).await;
                running.store(false, Ordering::Release);

                match run {
                    Ok(()) => {
                        consecutive_failures = 0;
                    }
                    Err(_elapsed) => {
                        consecutive_failures = consecutive_failures.saturating_add(1);
                        tracing::warn!(
                            job = %name,
                            tag = %options.tag,
                            consecutive_failures,
                            "scheduler: recurring job exceeded execution_timeout"
                        );
                        let backoff = options
                            .backoff_cap
                            .min(options.execution_timeout * consecutive_failures.min(8));
                        if !backoff.is_zero() {
                            tokio::select! {
                                _ = token.cancelled() => return,
                                _ = tokio::time::sleep(backoff) => {}
                            }
                        }
                    }
                }
            }
        });
    }

    fn cancel_recurring(&self, name: &str) {
        if let Some((_, token)) = self.jobs.remove(name) {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn recurring_job_runs_and_can_be_cancelled() {
        let mgr = TokioTaskManager::new();
        let counter = Arc::new(AtomicU32::new(0));

        let c = counter.clone();
        mgr.schedule_recurring(
            "test.job".to_string(),
            Duration::from_millis(5),
            Arc::new(move || {
                let c = c.clone();
                Box::pin(async move {
                    c.fetch_add(1, Ordering::SeqCst);
                })
            }),
            RecurringOptions {
                jitter: Duration::ZERO,
                ..Default::default()
            },
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        mgr.cancel_recurring("test.job");
        let seen = counter.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected multiple ticks, got {seen}");

        tokio::time::sleep(Duration::from_millis(30)).await;
        let after_cancel = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            after_cancel,
            counter.load(Ordering::SeqCst),
            "job kept running after cancel"
        );
    }

    #[tokio::test]
    async fn rescheduling_same_name_cancels_previous() {
        let mgr = TokioTaskManager::new();
        let counter = Arc::new(AtomicU32::new(0));

        let c = counter.clone();
        mgr.schedule_recurring(
            "dup".to_string(),
            Duration::from_millis(500),
            Arc::new(move || {
                let c = c.clone();
                Box::pin(async move {
                    c.fetch_add(1, Ordering::SeqCst);
                })
            }),
            RecurringOptions::default(),
        );

        let c2 = counter.clone();
        mgr.schedule_recurring(
            "dup".to_string(),
            Duration::from_millis(5),
            Arc::new(move || {
                let c2 = c2.clone();
                Box::pin(async move {
                    c2.fetch_add(1, Ordering::SeqCst);
                })
            }),
            RecurringOptions {
                jitter: Duration::ZERO,
                ..Default::default()
            },
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        mgr.cancel_recurring("dup");
        assert!(counter.load(Ordering::SeqCst) >= 2);
    }
}
