//! Deterministic partial-result redaction.
//!
//! Given a result-set size, a hide ratio, and a stable seed string, this
//! crate computes which result positions to withhold from the caller. The
//! mapping is a pure function of its inputs: the same arguments produce the
//! same index set in any process, on any platform, at any time. All
//! arithmetic in the seed hash and the generator is explicit 32-bit wrapping
//! arithmetic, pinned by test vectors.

use std::collections::BTreeSet;

use glimpse_contracts::SamplingSpec;

// FNV-1a offset basis; keeps the empty seed away from xorshift's zero
// fixed point.
const SEED_BASIS: u32 = 0x811c_9dc5;

// Substitute state for a seed that hashes to exactly zero.
const ZERO_SEED_SUBSTITUTE: u32 = 0x9e37_79b9;

/// Order-sensitive fold-multiply-xor hash of the seed bytes.
pub fn seed_hash(seed: &str) -> u32 {
    let mut h = SEED_BASIS;
    for byte in seed.bytes() {
        h = h.wrapping_mul(31).wrapping_add(u32::from(byte));
        h ^= h >> 15;
    }
    h
}

/// Xorshift (13/17/5) pseudo-random bit generator.
#[derive(Debug, Clone)]
pub struct XorShift32 {
    state: u32,
}

impl XorShift32 {
    pub fn new(seed: u32) -> Self {
        Self {
            state: if seed == 0 { ZERO_SEED_SUBSTITUTE } else { seed },
        }
    }

    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        x
    }

    /// Uniform draw in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        f64::from(self.next_u32()) / (f64::from(u32::MAX) + 1.0)
    }
}

/// Computes the set of hidden result positions for one request.
///
/// The target size is `round(result_count * hide_ratio)` with the ratio
/// clamped to `[0, 1]` (non-finite ratios count as 0) and the product
/// clamped to `[0, result_count]`. Never fails: extreme inputs yield the
/// empty set or the full range.
pub fn compute_hidden_indices(result_count: usize, hide_ratio: f64, seed: &str) -> BTreeSet<usize> {
    let mut hidden = BTreeSet::new();
    if result_count == 0 {
        return hidden;
    }

    let ratio = if hide_ratio.is_finite() {
        hide_ratio.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let target = (((result_count as f64) * ratio).round() as usize).min(result_count);
    if target == 0 {
        return hidden;
    }
    if target == result_count {
        hidden.extend(0..result_count);
        return hidden;
    }

    let mut rng = XorShift32::new(seed_hash(seed));
    let max_draws = result_count.saturating_mul(16).max(64);
    let mut draws = 0;
    while hidden.len() < target && draws < max_draws {
        let idx = (rng.next_f64() * result_count as f64) as usize;
        hidden.insert(idx.min(result_count - 1));
        draws += 1;
    }

    // Shortfall after the draw bound is filled by an ascending scan, so
    // termination and the exact target size hold unconditionally.
    if hidden.len() < target {
        for idx in 0..result_count {
            if hidden.len() >= target {
                break;
            }
            hidden.insert(idx);
        }
    }

    hidden
}

/// Convenience wrapper over [`compute_hidden_indices`] for callers that
/// already carry a [`SamplingSpec`].
pub fn hidden_for(spec: &SamplingSpec) -> BTreeSet<usize> {
    compute_hidden_indices(spec.result_count, spec.hide_ratio, &spec.seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_hash_matches_pinned_vectors() {
        // Wrapping-arithmetic pins; a platform that diverges here would
        // silently change every hidden-index set.
        assert_eq!(seed_hash(""), 0x811c_9dc5);
        assert_eq!(seed_hash("a"), 0xa276_5fd2);
        assert_eq!(seed_hash("query:test@example.com"), 0xf84c_b420);
    }

    #[test]
    fn seed_hash_is_order_sensitive() {
        assert_eq!(seed_hash("ab"), 0xac54_c27b);
        assert_eq!(seed_hash("ba"), 0xac54_c245);
        assert_ne!(seed_hash("ab"), seed_hash("ba"));
    }

    #[test]
    fn xorshift_zero_seed_is_remapped() {
        let mut rng = XorShift32::new(0);
        assert_ne!(rng.next_u32(), 0);
    }

    #[test]
    fn hidden_set_matches_pinned_vector() {
        let hidden = compute_hidden_indices(50, 0.4, "query:test@example.com");
        let expected: BTreeSet<usize> = [
            11, 14, 15, 16, 19, 20, 21, 22, 23, 28, 29, 31, 32, 33, 35, 38, 40, 46, 48, 49,
        ]
        .into_iter()
        .collect();
        assert_eq!(hidden, expected);
    }

    #[test]
    fn identical_inputs_yield_identical_sets() {
        let a = compute_hidden_indices(50, 0.4, "query:test@example.com");
        let b = compute_hidden_indices(50, 0.4, "query:test@example.com");
        assert_eq!(a, b);
        assert_eq!(a.len(), 20);
        assert!(a.iter().all(|&idx| idx < 50));
    }

    #[test]
    fn different_seeds_yield_different_sets() {
        let a = compute_hidden_indices(6, 0.5, "ab");
        let b = compute_hidden_indices(6, 0.5, "ba");
        assert_eq!(a, BTreeSet::from([0, 4, 5]));
        assert_eq!(b, BTreeSet::from([1, 4, 5]));
    }

    #[test]
    fn empty_seed_is_valid_and_deterministic() {
        let a = compute_hidden_indices(8, 0.5, "");
        assert_eq!(a, BTreeSet::from([0, 2, 5, 7]));
    }

    #[test]
    fn ratio_at_or_below_zero_hides_nothing() {
        assert!(compute_hidden_indices(10, 0.0, "x").is_empty());
        assert!(compute_hidden_indices(10, -1.0, "x").is_empty());
        assert!(compute_hidden_indices(10, f64::NEG_INFINITY, "x").is_empty());
        assert!(compute_hidden_indices(10, f64::NAN, "x").is_empty());
    }

    #[test]
    fn ratio_at_or_above_one_hides_everything() {
        let full: BTreeSet<usize> = (0..10).collect();
        assert_eq!(compute_hidden_indices(10, 1.0, "x"), full);
        assert_eq!(compute_hidden_indices(10, 10.0, "x"), full);
        assert_eq!(compute_hidden_indices(10, f64::INFINITY, "x"), full);
    }

    #[test]
    fn empty_result_set_hides_nothing() {
        assert!(compute_hidden_indices(0, 0.5, "x").is_empty());
        assert!(compute_hidden_indices(0, 1.0, "x").is_empty());
    }

    #[test]
    fn target_size_rounds_half_away_from_zero() {
        assert_eq!(compute_hidden_indices(5, 0.5, "x").len(), 3);
        assert_eq!(compute_hidden_indices(3, 0.5, "x").len(), 2);
    }

    #[test]
    fn size_and_bounds_laws_hold_across_ratios() {
        for n in [1usize, 2, 7, 33, 100] {
            for ratio in [0.1, 0.25, 0.5, 0.75, 0.9] {
                let hidden = compute_hidden_indices(n, ratio, "sweep");
                let target = (((n as f64) * ratio).round() as usize).min(n);
                assert_eq!(hidden.len(), target, "n={n} ratio={ratio}");
                assert!(hidden.iter().all(|&idx| idx < n), "n={n} ratio={ratio}");
            }
        }
    }

    #[test]
    fn spec_wrapper_delegates() {
        let spec = SamplingSpec {
            result_count: 50,
            hide_ratio: 0.4,
            seed: "query:test@example.com".to_string(),
        };
        assert_eq!(
            hidden_for(&spec),
            compute_hidden_indices(50, 0.4, "query:test@example.com")
        );
    }
}
