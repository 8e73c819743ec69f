//! Policy quantization (spec §3 Policy, §4.2 `PolicyRateLimiter`).

/// Predefined `rps` tiers, ascending. Capped at the top tier.
pub const RPS_TIERS: &[i32] = &[1, 2, 4, 8, 16, 32, 64, 128, 256, 512];

/// Predefined `burst` tiers, ascending. Capped at the top tier.
pub const BURST_TIERS: &[i32] = &[1, 2, 4, 8, 16, 32, 64, 128, 256];

/// An immutable `(rps, burst)` pair, already quantized.
///
/// Construct via [`Policy::quantize`]; the raw tuple constructor is kept
/// private so a `Policy` can never smuggle in an un-quantized value and
/// silently blow the registry's bounded cardinality (spec P6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Policy {
    pub rps: i32,
    pub burst: i32,
}

impl Policy {
    /// Quantize a declared `(rps, burst)` pair to the nearest tiers ≥ the
    /// request, capped at the top tier (spec §3 Policy).
    pub fn quantize(rps: i32, burst: i32) -> Self {
        Self {
            rps: quantize_up(rps, RPS_TIERS),
            burst: quantize_up(burst, BURST_TIERS),
        }
    }

    /// L1 distance between two quantized policies, used by the registry's
    /// nearest-neighbor fallback when it is at its cap (spec §4.2 step 5).
    pub fn l1_distance(&self, other: &Policy) -> i64 {
        (self.rps as i64 - other.rps as i64).abs() + (self.burst as i64 - other.burst as i64).abs()
    }
}

/// Map `value` to the smallest tier ≥ `value`, capped at the top tier.
/// Values ≤ 0 map to the smallest tier (callers are expected to have
/// already special-cased `declared.rps <= 0` / `declared.burst <= 0`
/// per spec §4.2 steps 1-2; this function never panics on them).
fn quantize_up(value: i32, tiers: &[i32]) -> i32 {
    for &tier in tiers {
        if value <= tier {
            return tier;
        }
    }
    *tiers.last().expect("tier list is non-empty")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantize_rounds_up_to_smallest_covering_tier() {
        assert_eq!(Policy::quantize(10, 20), Policy { rps: 16, burst: 32 });
        assert_eq!(Policy::quantize(10, 21), Policy { rps: 16, burst: 32 });
        assert_eq!(Policy::quantize(17, 33), Policy { rps: 32, burst: 64 });
    }

    #[test]
    fn quantize_caps_at_top_tier() {
        assert_eq!(Policy::quantize(10_000, 10_000), Policy { rps: 512, burst: 256 });
    }

    #[test]
    fn quantize_of_exact_tier_is_identity() {
        assert_eq!(Policy::quantize(64, 64), Policy { rps: 64, burst: 64 });
    }

    #[test]
    fn quantize_is_idempotent() {
        // P5: quantize(quantize(x)) == quantize(x)
        let p = Policy::quantize(10, 20);
        let p2 = Policy::quantize(p.rps, p.burst);
        assert_eq!(p, p2);
    }

    #[test]
    fn l1_distance_is_symmetric() {
        let a = Policy::quantize(1, 1);
        let b = Policy::quantize(16, 32);
        assert_eq!(a.l1_distance(&b), b.l1_distance(&a));
        assert_eq!(a.l1_distance(&b), 15 + 31);
    }
}
