//! Per-endpoint fixed-point bucket state and the refill/check algorithm
//! (spec §4.1 "Refill algorithm", "Check algorithm", invariants P1-P10).

use super::{BucketConfig, DenyReason, Decision};
use crate::time::{ticks_to_ms_ceil, STOPWATCH_FREQ};

/// One endpoint's bucket. Always accessed through a `Mutex`; never held
/// across an `.await`.
pub(crate) struct EndpointState {
    micro_balance: i64,
    last_refill_ticks: i64,
    /// Sub-micro-token remainder carried forward so repeated small refills
    /// don't lose precision to integer division (P1).
    accumulated_micro: i64,
    hard_blocked_until_ticks: i64,
    soft_violations: i32,
    last_violation_ticks: i64,
    pub(crate) last_seen_ticks: i64,
}

impl EndpointState {
    pub(crate) fn new(cfg: &BucketConfig, now: i64, initial_tokens: i32) -> Self {
        let micro_balance = if initial_tokens < 0 {
            cfg.capacity_micro
        } else if initial_tokens == 0 {
            0
        } else {
            (initial_tokens as i64 * cfg.token_scale).clamp(0, cfg.capacity_micro)
        };
        Self {
            micro_balance,
            last_refill_ticks: now,
            accumulated_micro: 0,
            hard_blocked_until_ticks: 0,
            soft_violations: 0,
            last_violation_ticks: 0,
            last_seen_ticks: now,
        }
    }

    /// Advance the bucket to `now` and evaluate one admission. Mutates
    /// `self` regardless of outcome (spec §4.1 "every check, allowed or
    /// not, updates `last_seen_ticks`").
    pub(crate) fn check(&mut self, cfg: &BucketConfig, now: i64) -> Decision {
        self.last_seen_ticks = now;

        if self.hard_blocked_until_ticks > now {
            return Decision {
                allowed: false,
                retry_after_ms: ticks_to_ms_ceil(self.hard_blocked_until_ticks - now),
                credit: 0,
                reason: DenyReason::HardLockout,
            };
        }

        self.refill(cfg, now);

        if self.micro_balance >= cfg.token_scale {
            self.micro_balance -= cfg.token_scale;
            self.soft_violations = 0;
            return Decision {
                allowed: true,
                retry_after_ms: 0,
                credit: clamp_credit(self.micro_balance / cfg.token_scale),
                reason: DenyReason::None,
            };
        }

        self.record_violation(cfg, now);

        if cfg.hard_lockout_ticks > 0 && self.soft_violations >= cfg.max_soft_violations {
            self.hard_blocked_until_ticks = now + cfg.hard_lockout_ticks;
            self.soft_violations = 0;
            return Decision {
                allowed: false,
                retry_after_ms: ticks_to_ms_ceil(cfg.hard_lockout_ticks),
                credit: 0,
                reason: DenyReason::HardLockout,
            };
        }

        let needed = cfg.token_scale - self.micro_balance;
        let retry_after_ms = if cfg.refill_per_sec_micro <= 0 {
            0
        } else {
            ceil_div(needed.saturating_mul(1000), cfg.refill_per_sec_micro).min(i32::MAX as i64) as i32
        };

        Decision {
            allowed: false,
            retry_after_ms,
            credit: 0,
            reason: DenyReason::SoftThrottle,
        }
    }

    fn refill(&mut self, cfg: &BucketConfig, now: i64) {
        let dt = now - self.last_refill_ticks;
        self.last_refill_ticks = now;
        if dt <= 0 {
            return;
        }

        match dt.checked_mul(cfg.refill_per_sec_micro) {
            Some(dt_refill) => {
                let total = dt_refill.saturating_add(self.accumulated_micro);
                let micro_to_add = total / STOPWATCH_FREQ;
                let remainder = total % STOPWATCH_FREQ;
                let new_balance = self.micro_balance.saturating_add(micro_to_add);
                if new_balance >= cfg.capacity_micro {
                    self.micro_balance = cfg.capacity_micro;
                    self.accumulated_micro = 0;
                } else {
                    self.micro_balance = new_balance;
                    self.accumulated_micro = remainder;
                }
            }
            None => {
                // dt * refill_per_sec_micro overflowed i64: treat as "more
                // than enough time has passed" and jump straight to full.
                self.micro_balance = cfg.capacity_micro;
                self.accumulated_micro = 0;
            }
        }
    }

    /// Read-only accessors for diagnostic reports.
    pub(crate) fn hard_blocked_at(&self, now: i64) -> bool {
        self.hard_blocked_until_ticks > now
    }

    pub(crate) fn balance(&self) -> i64 {
        self.micro_balance
    }

    fn record_violation(&mut self, cfg: &BucketConfig, now: i64) {
        if self.last_violation_ticks != 0 && now - self.last_violation_ticks <= cfg.soft_window_ticks {
            self.soft_violations += 1;
        } else {
            self.soft_violations = 1;
        }
        self.last_violation_ticks = now;
    }
}

fn clamp_credit(value: i64) -> u16 {
    value.clamp(0, u16::MAX as i64) as u16
}

fn ceil_div(num: i64, den: i64) -> i64 {
    (num + den - 1) / den
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> BucketConfig {
        BucketConfig {
            capacity_micro: 4_000_000,
            refill_per_sec_micro: 1_000_000,
            token_scale: 1_000_000,
            hard_lockout_ticks: 2 * STOPWATCH_FREQ,
            soft_window_ticks: 5 * STOPWATCH_FREQ,
            max_soft_violations: 2,
        }
    }

    #[test]
    fn full_bucket_allows_burst_then_denies() {
        let c = cfg();
        let mut s = EndpointState::new(&c, 0, -1);
        for _ in 0..4 {
            assert!(s.check(&c, 0).allowed);
        }
        let d = s.check(&c, 0);
        assert!(!d.allowed);
        assert_eq!(d.reason, DenyReason::SoftThrottle);
    }

    #[test]
    fn cold_start_empty_bucket_denies_immediately() {
        let c = cfg();
        let mut s = EndpointState::new(&c, 0, 0);
        let d = s.check(&c, 0);
        assert!(!d.allowed);
    }

    #[test]
    fn refill_restores_tokens_after_enough_time() {
        let c = cfg();
        let mut s = EndpointState::new(&c, 0, 0);
        assert!(!s.check(&c, 0).allowed);
        // one full second of refill at 1 token/sec -> exactly one token.
        let d = s.check(&c, STOPWATCH_FREQ);
        assert!(d.allowed);
    }

    #[test]
    fn balance_never_exceeds_capacity() {
        let c = cfg();
        let mut s = EndpointState::new(&c, 0, -1);
        // huge time jump must not overflow or exceed capacity.
        s.refill(&c, STOPWATCH_FREQ * 1_000_000);
        assert!(s.micro_balance <= c.capacity_micro);
    }

    #[test]
    fn exact_threshold_allows_with_zero_credit() {
        let c = cfg();
        let mut s = EndpointState::new(&c, 0, 1);
        let d = s.check(&c, 0);
        assert!(d.allowed);
        assert_eq!(d.credit, 0);
    }
}
