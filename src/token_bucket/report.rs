//! Diagnostic report generation (spec §4.1 "Report generation").

use std::fmt::Write as _;

use super::{ShardKey, TokenBucketLimiter};
use crate::time::now_ticks;

pub(crate) struct ReportRow {
    address: String,
    hard_blocked: bool,
    deficit_micro: i64,
}

impl<K: ShardKey> TokenBucketLimiter<K> {
    /// Snapshot every tracked endpoint into a pooled buffer and render a
    /// plain-text table, worst-off endpoints first. Operator-facing, not
    /// machine-parsed — unlike `check`, this is allowed to allocate freely
    /// per row and only pools the outer `Vec`.
    pub fn generate_report(&self) -> String {
        let now = now_ticks();
        let mut rows = self.report_pool.rent(32);

        for shard in &self.shards {
            for entry in shard.iter() {
                let st = entry.value().lock().expect("endpoint state mutex poisoned");
                rows.push(ReportRow {
                    address: entry.key().describe(),
                    hard_blocked: st.hard_blocked_at(now),
                    deficit_micro: self.cfg.capacity_micro - st.balance(),
                });
            }
        }

        let hard_blocked_count = rows.iter().filter(|r| r.hard_blocked).count();
        rows.sort_by(|a, b| {
            b.hard_blocked
                .cmp(&a.hard_blocked)
                .then_with(|| b.deficit_micro.cmp(&a.deficit_micro))
                .then_with(|| a.address.cmp(&b.address))
        });

        let mut out = String::new();
        let _ = writeln!(out, "TokenBucketLimiter report");
        let _ = writeln!(
            out,
            "capacity_tokens={} refill_tokens_per_second={:.3} shard_count={}",
            self.options.capacity_tokens, self.options.refill_tokens_per_second, self.options.shard_count
        );
        let _ = writeln!(out, "tracked_endpoints={} hard_blocked={}", rows.len(), hard_blocked_count);
        let _ = writeln!(out, "{:-<62}", "");
        let _ = writeln!(out, "{:<40}{:>10}{:>12}", "address", "blocked", "deficit");
        for row in rows.iter().take(20) {
            let _ = writeln!(
                out,
                "{:<40}{:>10}{:>12}",
                row.address, row.hard_blocked, row.deficit_micro
            );
        }
        if rows.len() > 20 {
            let _ = writeln!(out, "... {} more", rows.len() - 20);
        }

        self.report_pool.give_back(rows, true);
        out
    }
}
