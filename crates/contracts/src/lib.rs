use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

pub mod canonical;

/// Metered resource types. Each carries its own daily free limit and hide
/// ratio, configured at the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    FaceSearch,
    QueryGen,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::FaceSearch => "face_search",
            ResourceKind::QueryGen => "query_gen",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "face_search" => Some(ResourceKind::FaceSearch),
            "query_gen" => Some(ResourceKind::QueryGen),
            _ => None,
        }
    }
}

/// How a reservation against the ledger resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationDecision {
    Free,
    Billed,
    Denied,
}

impl ReservationDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            ReservationDecision::Free => "FREE",
            ReservationDecision::Billed => "BILLED",
            ReservationDecision::Denied => "DENIED",
        }
    }

    /// The refundable kind of an accepted reservation; `Denied` reserved
    /// nothing and has nothing to refund.
    pub fn kind(self) -> Option<ReservationKind> {
        match self {
            ReservationDecision::Free => Some(ReservationKind::Free),
            ReservationDecision::Billed => Some(ReservationKind::Billed),
            ReservationDecision::Denied => None,
        }
    }
}

/// The kind handed back to `refund` when downstream work fails after a
/// successful reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationKind {
    Free,
    Billed,
}

impl ReservationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ReservationKind::Free => "FREE",
            ReservationKind::Billed => "BILLED",
        }
    }
}

/// Machine-readable denial reasons. The caller-facing layer routes
/// `QuotaExhausted` to a purchase flow and the retryable reasons to a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenialReason {
    QuotaExhausted,
    UpstreamFailure,
    LedgerUnavailable,
}

impl DenialReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenialReason::QuotaExhausted => "QUOTA_EXHAUSTED",
            DenialReason::UpstreamFailure => "UPSTREAM_FAILURE",
            DenialReason::LedgerUnavailable => "LEDGER_UNAVAILABLE",
        }
    }

    pub fn retryable(self) -> bool {
        match self {
            DenialReason::QuotaExhausted => false,
            DenialReason::UpstreamFailure | DenialReason::LedgerUnavailable => true,
        }
    }
}

/// Outcome of one gated request. Ephemeral; the gateway derives an audit
/// event from it but never persists the value itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOutcome {
    pub allowed: bool,
    pub billed_credit: bool,
    pub hidden_indices: BTreeSet<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenialReason>,
}

impl RequestOutcome {
    pub fn accepted(billed_credit: bool, hidden_indices: BTreeSet<usize>) -> Self {
        Self {
            allowed: true,
            billed_credit,
            hidden_indices,
            reason: None,
        }
    }

    pub fn denied(reason: DenialReason) -> Self {
        Self {
            allowed: false,
            billed_credit: false,
            hidden_indices: BTreeSet::new(),
            reason: Some(reason),
        }
    }
}

/// Input to the redactor: how many result items there are, which fraction to
/// hide, and the stable seed the hidden subset is derived from. Out-of-range
/// ratios are clamped by the redactor, never rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingSpec {
    pub result_count: usize,
    pub hide_ratio: f64,
    pub seed: String,
}

/// Per-resource gating configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatePolicy {
    pub daily_free_limit: u32,
    pub hide_ratio: f64,
}

impl GatePolicy {
    pub const DAILY_FREE_LIMIT_HARD_CAP: u32 = 10_000;

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.daily_free_limit > Self::DAILY_FREE_LIMIT_HARD_CAP {
            return Err("daily_free_limit out of range");
        }
        if !self.hide_ratio.is_finite() {
            return Err("hide_ratio must be finite");
        }
        Ok(())
    }
}

/// Remaining-usage counters surfaced to the caller-facing layer for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub used: u32,
    pub limit: u32,
    pub remaining: u32,
}

impl UsageCounters {
    pub fn new(used: u32, limit: u32) -> Self {
        Self {
            used,
            limit,
            remaining: limit.saturating_sub(used),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denial_reasons_split_purchase_from_retry() {
        assert!(!DenialReason::QuotaExhausted.retryable());
        assert!(DenialReason::UpstreamFailure.retryable());
        assert!(DenialReason::LedgerUnavailable.retryable());
    }

    #[test]
    fn denied_reservation_has_no_refundable_kind() {
        assert_eq!(ReservationDecision::Free.kind(), Some(ReservationKind::Free));
        assert_eq!(
            ReservationDecision::Billed.kind(),
            Some(ReservationKind::Billed)
        );
        assert_eq!(ReservationDecision::Denied.kind(), None);
    }

    #[test]
    fn gate_policy_validate_rejects_excessive_limit() {
        let policy = GatePolicy {
            daily_free_limit: GatePolicy::DAILY_FREE_LIMIT_HARD_CAP + 1,
            hide_ratio: 0.4,
        };
        assert_eq!(
            policy.validate().expect_err("limit must be rejected"),
            "daily_free_limit out of range"
        );
    }

    #[test]
    fn gate_policy_validate_rejects_non_finite_ratio() {
        let policy = GatePolicy {
            daily_free_limit: 5,
            hide_ratio: f64::NAN,
        };
        assert_eq!(
            policy.validate().expect_err("NaN ratio must be rejected"),
            "hide_ratio must be finite"
        );
    }

    #[test]
    fn gate_policy_validate_accepts_out_of_range_but_finite_ratio() {
        // Extreme ratios are clamped at sampling time, not rejected here.
        let policy = GatePolicy {
            daily_free_limit: 5,
            hide_ratio: 10.0,
        };
        policy.validate().expect("finite ratio should be accepted");
    }

    #[test]
    fn usage_counters_saturate_at_zero_remaining() {
        let counters = UsageCounters::new(7, 5);
        assert_eq!(counters.remaining, 0);

        let counters = UsageCounters::new(2, 5);
        assert_eq!(counters.remaining, 3);
    }

    #[test]
    fn denial_reason_serializes_screaming_snake() {
        let json =
            serde_json::to_string(&DenialReason::QuotaExhausted).expect("reason should serialize");
        assert_eq!(json, r#""QUOTA_EXHAUSTED""#);
    }
}
