//! The gate: sequences reserve -> produce -> redact for one request.
//!
//! The gate owns no persistent state. Every mutation goes through the
//! ledger, and a reservation made before a failed producer call is always
//! compensated with a refund.

use std::collections::BTreeSet;
use std::future::Future;

use chrono::NaiveDate;
use glimpse_contracts::canonical;
use glimpse_contracts::{
    DenialReason, GatePolicy, RequestOutcome, ReservationDecision, ResourceKind, UsageCounters,
};
use glimpse_ledger::QuotaLedger;

use crate::metrics;
use crate::producer::{ProducerError, ResultItem};

pub(crate) struct GateContext<'a> {
    pub caller_id: &'a str,
    pub resource: ResourceKind,
    pub normalized_query: &'a str,
    pub policy: GatePolicy,
    pub today: NaiveDate,
}

pub(crate) struct GateReply {
    pub outcome: RequestOutcome,
    pub results: Vec<ResultItem>,
    pub usage: UsageCounters,
}

impl GateReply {
    fn denied(reason: DenialReason, usage: UsageCounters) -> Self {
        Self {
            outcome: RequestOutcome::denied(reason),
            results: Vec::new(),
            usage,
        }
    }
}

/// Lowercases and collapses whitespace runs, so trivially different
/// spellings of one query land on the same redaction seed.
pub(crate) fn normalize_query(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Seed derived from stable request attributes: repeated identical requests
/// redact the same items.
pub(crate) fn redaction_seed(
    caller_id: &str,
    resource: ResourceKind,
    normalized_query: &str,
) -> String {
    format!("{}|{}|{}", caller_id, resource.as_str(), normalized_query)
}

pub(crate) async fn run_gate<F, Fut>(
    ledger: &QuotaLedger,
    ctx: GateContext<'_>,
    producer: F,
) -> GateReply
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<ResultItem>, ProducerError>>,
{
    let limit = ctx.policy.daily_free_limit;

    let reservation = match ledger.reserve(ctx.caller_id, ctx.today, limit).await {
        Ok(reservation) => reservation,
        Err(err) => {
            // Fail closed: an unreachable ledger denies, never meters for free.
            tracing::error!(
                caller_id = %ctx.caller_id,
                resource = ctx.resource.as_str(),
                error = %err,
                "ledger unavailable; denying request"
            );
            metrics::inc_denial(DenialReason::LedgerUnavailable.as_str());
            return GateReply::denied(
                DenialReason::LedgerUnavailable,
                UsageCounters::new(0, limit),
            );
        }
    };

    let usage = UsageCounters::new(reservation.free_calls_used, limit);

    if reservation.decision == ReservationDecision::Denied {
        metrics::observe_gate_outcome(ctx.resource.as_str(), reservation.decision.as_str());
        metrics::inc_denial(DenialReason::QuotaExhausted.as_str());
        record_gate_event(ledger, &ctx, "DENIED", usage, None).await;
        return GateReply::denied(DenialReason::QuotaExhausted, usage);
    }

    let results = match producer().await {
        Ok(results) => results,
        Err(err) => {
            tracing::warn!(
                caller_id = %ctx.caller_id,
                resource = ctx.resource.as_str(),
                error = %err,
                "producer failed after reservation; refunding"
            );
            metrics::inc_upstream_failure();

            let mut usage = usage;
            if let Some(kind) = reservation.decision.kind() {
                metrics::inc_refund(kind.as_str());
                match ledger.refund(ctx.caller_id, ctx.today, kind).await {
                    Ok(()) => {
                        if kind == glimpse_contracts::ReservationKind::Free {
                            usage = UsageCounters::new(usage.used.saturating_sub(1), limit);
                        }
                    }
                    Err(refund_err) => {
                        tracing::error!(
                            caller_id = %ctx.caller_id,
                            kind = kind.as_str(),
                            error = %refund_err,
                            "refund failed; reservation left unreconciled"
                        );
                    }
                }
            }

            record_gate_event(ledger, &ctx, "UPSTREAM_FAILURE", usage, None).await;
            return GateReply::denied(DenialReason::UpstreamFailure, usage);
        }
    };

    let seed = redaction_seed(ctx.caller_id, ctx.resource, ctx.normalized_query);
    let hidden =
        glimpse_redactor::compute_hidden_indices(results.len(), ctx.policy.hide_ratio, &seed);

    metrics::observe_gate_outcome(ctx.resource.as_str(), reservation.decision.as_str());
    metrics::add_hidden_items(hidden.len() as u64);

    record_gate_event(
        ledger,
        &ctx,
        reservation.decision.as_str(),
        usage,
        Some((results.len(), &hidden)),
    )
    .await;

    GateReply {
        outcome: RequestOutcome::accepted(
            reservation.decision == ReservationDecision::Billed,
            hidden,
        ),
        results,
        usage,
    }
}

/// Best-effort audit append; a failed append never fails the request.
async fn record_gate_event(
    ledger: &QuotaLedger,
    ctx: &GateContext<'_>,
    outcome: &str,
    usage: UsageCounters,
    redaction: Option<(usize, &BTreeSet<usize>)>,
) {
    let mut payload = serde_json::json!({
        "query_hash": canonical::sha256_hex(ctx.normalized_query.as_bytes()),
        "free_calls_used": usage.used,
        "daily_free_limit": usage.limit,
    });
    if let Some((result_count, hidden)) = redaction {
        payload["result_count"] = serde_json::json!(result_count);
        payload["hidden_count"] = serde_json::json!(hidden.len());
    }

    if let Err(err) = ledger
        .record_gate_event(ctx.caller_id, ctx.resource, outcome, payload)
        .await
    {
        tracing::warn!(
            caller_id = %ctx.caller_id,
            error = %err,
            "gate audit append failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use glimpse_ledger::MemoryLedger;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 7).expect("valid test date")
    }

    fn items(n: usize) -> Vec<ResultItem> {
        (0..n)
            .map(|idx| ResultItem {
                id: format!("m-{idx}"),
                url: format!("https://results.example/m-{idx}"),
                score: 1.0 - idx as f64 * 0.01,
            })
            .collect()
    }

    fn ctx(caller_id: &str, policy: GatePolicy) -> GateContext<'_> {
        GateContext {
            caller_id,
            resource: ResourceKind::FaceSearch,
            normalized_query: "smith john",
            policy,
            today: day(),
        }
    }

    #[test]
    fn normalize_query_collapses_whitespace_and_case() {
        assert_eq!(normalize_query("  Smith   JOHN "), "smith john");
        assert_eq!(normalize_query("smith john"), "smith john");
        assert_eq!(normalize_query("   "), "");
    }

    #[test]
    fn redaction_seed_separates_resources_and_callers() {
        let a = redaction_seed("alice", ResourceKind::FaceSearch, "smith john");
        let b = redaction_seed("alice", ResourceKind::QueryGen, "smith john");
        let c = redaction_seed("bob", ResourceKind::FaceSearch, "smith john");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn free_request_hides_the_configured_fraction() {
        let ledger = QuotaLedger::Memory(MemoryLedger::new());
        let policy = GatePolicy {
            daily_free_limit: 5,
            hide_ratio: 0.4,
        };

        let reply = run_gate(&ledger, ctx("alice", policy), || async { Ok(items(10)) }).await;

        assert!(reply.outcome.allowed);
        assert!(!reply.outcome.billed_credit);
        assert_eq!(reply.outcome.hidden_indices.len(), 4);
        assert!(reply.outcome.hidden_indices.iter().all(|&idx| idx < 10));
        assert_eq!(reply.results.len(), 10);
        assert_eq!(reply.usage.used, 1);
        assert_eq!(reply.usage.remaining, 4);
    }

    #[tokio::test]
    async fn repeated_identical_requests_hide_the_same_items() {
        let ledger = QuotaLedger::Memory(MemoryLedger::new());
        let policy = GatePolicy {
            daily_free_limit: 5,
            hide_ratio: 0.5,
        };

        let first = run_gate(&ledger, ctx("alice", policy), || async { Ok(items(12)) }).await;
        let second = run_gate(&ledger, ctx("alice", policy), || async { Ok(items(12)) }).await;

        assert_eq!(first.outcome.hidden_indices, second.outcome.hidden_indices);
    }

    #[tokio::test]
    async fn exhausted_allowance_bills_a_credit() {
        let memory = MemoryLedger::new();
        memory.grant_credits("alice", 1);
        let ledger = QuotaLedger::Memory(memory.clone());
        let policy = GatePolicy {
            daily_free_limit: 0,
            hide_ratio: 0.4,
        };

        let reply = run_gate(&ledger, ctx("alice", policy), || async { Ok(items(10)) }).await;

        assert!(reply.outcome.allowed);
        assert!(reply.outcome.billed_credit);
        assert_eq!(memory.credit_balance("alice"), 0);
    }

    #[tokio::test]
    async fn denied_request_never_reaches_the_producer() {
        let ledger = QuotaLedger::Memory(MemoryLedger::new());
        let policy = GatePolicy {
            daily_free_limit: 0,
            hide_ratio: 0.4,
        };

        let called = Arc::new(AtomicBool::new(false));
        let reply = {
            let called = Arc::clone(&called);
            run_gate(&ledger, ctx("alice", policy), move || async move {
                called.store(true, Ordering::SeqCst);
                Ok(items(10))
            })
            .await
        };

        assert!(!reply.outcome.allowed);
        assert_eq!(reply.outcome.reason, Some(DenialReason::QuotaExhausted));
        assert!(reply.results.is_empty());
        assert!(!called.load(Ordering::SeqCst), "producer must not be called");
    }

    #[tokio::test]
    async fn producer_failure_refunds_a_free_reservation() {
        let memory = MemoryLedger::new();
        let ledger = QuotaLedger::Memory(memory.clone());
        let policy = GatePolicy {
            daily_free_limit: 5,
            hide_ratio: 0.4,
        };

        let reply = run_gate(&ledger, ctx("alice", policy), || async {
            Err(ProducerError::Timeout)
        })
        .await;

        assert!(!reply.outcome.allowed);
        assert_eq!(reply.outcome.reason, Some(DenialReason::UpstreamFailure));
        assert_eq!(reply.usage.used, 0);
        assert_eq!(memory.usage_on("alice", day()), 0);
    }

    #[tokio::test]
    async fn producer_failure_refunds_a_billed_reservation() {
        let memory = MemoryLedger::new();
        memory.grant_credits("alice", 1);
        let ledger = QuotaLedger::Memory(memory.clone());
        let policy = GatePolicy {
            daily_free_limit: 0,
            hide_ratio: 0.4,
        };

        let reply = run_gate(&ledger, ctx("alice", policy), || async {
            Err(ProducerError::Timeout)
        })
        .await;

        assert!(!reply.outcome.allowed);
        assert_eq!(reply.outcome.reason, Some(DenialReason::UpstreamFailure));
        assert_eq!(memory.credit_balance("alice"), 1);
    }

    #[tokio::test]
    async fn accepted_outcomes_are_never_both_free_and_billed() {
        let memory = MemoryLedger::new();
        memory.grant_credits("alice", 1);
        let ledger = QuotaLedger::Memory(memory.clone());
        let policy = GatePolicy {
            daily_free_limit: 1,
            hide_ratio: 0.0,
        };

        let first = run_gate(&ledger, ctx("alice", policy), || async { Ok(items(3)) }).await;
        let second = run_gate(&ledger, ctx("alice", policy), || async { Ok(items(3)) }).await;

        assert!(first.outcome.allowed && !first.outcome.billed_credit);
        assert!(second.outcome.allowed && second.outcome.billed_credit);
        assert_eq!(memory.usage_on("alice", day()), 1);
        assert_eq!(memory.credit_balance("alice"), 0);
    }

    #[tokio::test]
    async fn gate_decisions_are_audited() {
        let memory = MemoryLedger::new();
        let ledger = QuotaLedger::Memory(memory.clone());
        let policy = GatePolicy {
            daily_free_limit: 1,
            hide_ratio: 0.5,
        };

        run_gate(&ledger, ctx("alice", policy), || async { Ok(items(4)) }).await;
        run_gate(&ledger, ctx("alice", policy), || async { Ok(items(4)) }).await;

        let events = memory.gate_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].outcome, "FREE");
        assert_eq!(events[1].outcome, "DENIED");
        assert_eq!(events[0].payload_json["result_count"], 4);
        assert_eq!(events[0].payload_json["hidden_count"], 2);
        assert!(glimpse_contracts::canonical::is_sha256_hex(
            events[0].payload_json["query_hash"]
                .as_str()
                .expect("query hash should be a string"),
        ));
    }
}
