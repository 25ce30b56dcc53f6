use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use glimpse_contracts::{DenialReason, ResourceKind, UsageCounters};
use glimpse_ledger::{LedgerError, MemoryLedger, PgLedger, QuotaLedger};
use serde::{Deserialize, Serialize};
use tracing::Instrument;
use ulid::Ulid;

use crate::config::{GatewayConfig, LedgerMode, StartupError};
use crate::gate::{self, GateContext};
use crate::present::{PresentedItem, present_results};
use crate::producer::ProducerClient;
use crate::rate_limit::RateLimiter;

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    ledger: QuotaLedger,
    producer: ProducerClient,
    rate_limiter: RateLimiter,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub async fn router(config: GatewayConfig) -> Result<Router, StartupError> {
    let ledger = match config.ledger_mode {
        LedgerMode::Postgres => {
            let db_url = config.db_url.clone().ok_or_else(|| StartupError {
                code: "ERR_MISSING_CONFIG",
                message: "postgres ledger mode requires GLIMPSE_DB_URL".to_string(),
            })?;
            let ledger = PgLedger::connect_and_migrate(
                &db_url,
                Duration::from_millis(config.ledger_write_timeout_ms),
            )
            .await
            .map_err(|err| StartupError {
                code: "ERR_LEDGER_UNAVAILABLE",
                message: format!("failed to initialize ledger: {}", err),
            })?;
            QuotaLedger::Pg(ledger)
        }
        LedgerMode::Memory => QuotaLedger::Memory(MemoryLedger::new()),
    };

    let producer = ProducerClient::new(
        config.producer_url.clone(),
        Duration::from_millis(config.producer_timeout_ms),
    )
    .map_err(|_| StartupError {
        code: "ERR_PRODUCER_UNAVAILABLE",
        message: "failed to initialize producer client".to_string(),
    })?;

    let rate_limiter = RateLimiter::new(
        Duration::from_secs(config.rate_limit_window_secs.max(1)),
        16_384,
    );

    let state = AppState {
        config,
        ledger,
        producer,
        rate_limiter,
    };

    Ok(Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/search", post(face_search))
        .route("/v1/query-gen", post(query_gen))
        .route("/v1/usage", get(usage))
        .route("/v1/credits/grant", post(grant_credits))
        .with_state(state))
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();
    checks.insert("ledger", state.ledger.ping().await.is_ok());

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
}

async fn metrics() -> impl IntoResponse {
    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MeteredRequest {
    query: String,
}

#[derive(Debug, Serialize)]
struct MeteredResponse {
    allowed: bool,
    billed_credit: bool,
    results: Vec<PresentedItem>,
    usage: UsageCounters,
}

async fn face_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<MeteredRequest>, JsonRejection>,
) -> Result<Json<MeteredResponse>, ApiError> {
    metered(state, headers, req, ResourceKind::FaceSearch).await
}

async fn query_gen(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<MeteredRequest>, JsonRejection>,
) -> Result<Json<MeteredResponse>, ApiError> {
    metered(state, headers, req, ResourceKind::QueryGen).await
}

async fn metered(
    state: AppState,
    headers: HeaderMap,
    req: Result<Json<MeteredRequest>, JsonRejection>,
    resource: ResourceKind,
) -> Result<Json<MeteredResponse>, ApiError> {
    let caller_id = extract_caller_id(&headers)?;
    let request_id = extract_request_id(&headers);
    let trace_id = extract_trace_id(&headers);
    let route = resource.as_str();

    if !state.rate_limiter.allow(
        format!("{}:{}", route, caller_id).as_str(),
        state.config.rate_limit_per_window,
    ) {
        return Err(json_error(
            StatusCode::TOO_MANY_REQUESTS,
            "ERR_RATE_LIMITED",
            "rate limit exceeded".to_string(),
            None,
            true,
        ));
    }

    let Json(req) = req.map_err(|_| {
        json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PARAMS",
            "invalid JSON body".to_string(),
            None,
            false,
        )
    })?;

    let normalized_query = gate::normalize_query(&req.query);
    if normalized_query.is_empty() {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PARAMS",
            "query must be non-empty".to_string(),
            None,
            false,
        ));
    }

    let policy = state.config.policy_for(resource);
    let today = Utc::now().date_naive();

    let span = tracing::info_span!(
        "gate.request",
        trace_id = %trace_id,
        request_id = %request_id,
        caller_id = %caller_id,
        resource = route,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let reply = {
        let producer = state.producer.clone();
        let query = normalized_query.clone();
        gate::run_gate(
            &state.ledger,
            GateContext {
                caller_id: &caller_id,
                resource,
                normalized_query: &normalized_query,
                policy,
                today,
            },
            move || async move { producer.fetch(resource, &query).await },
        )
        .instrument(span.clone())
        .await
    };

    let latency_ms = started.elapsed().as_millis() as u64;
    span.record("latency_ms", latency_ms);

    if reply.outcome.allowed {
        span.record(
            "outcome",
            if reply.outcome.billed_credit {
                "billed"
            } else {
                "free"
            },
        );
        crate::metrics::observe_http_request(route, "POST", 200, started.elapsed());

        let results = present_results(&reply.results, &reply.outcome.hidden_indices);
        Ok(Json(MeteredResponse {
            allowed: true,
            billed_credit: reply.outcome.billed_credit,
            results,
            usage: reply.usage,
        }))
    } else {
        let reason = reply
            .outcome
            .reason
            .unwrap_or(DenialReason::LedgerUnavailable);
        span.record("outcome", reason.as_str());

        let response = denial_response(reason, reply.usage);
        crate::metrics::observe_http_request(route, "POST", response.0.as_u16(), started.elapsed());
        Err(response)
    }
}

#[derive(Debug, Deserialize)]
struct UsageParams {
    resource: String,
}

#[derive(Debug, Serialize)]
struct UsageResponse {
    resource: ResourceKind,
    usage: UsageCounters,
    credit_balance: i64,
}

async fn usage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<UsageParams>,
) -> Result<Json<UsageResponse>, ApiError> {
    let caller_id = extract_caller_id(&headers)?;
    let resource = ResourceKind::parse(params.resource.trim()).ok_or_else(|| {
        json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PARAMS",
            "resource must be face_search or query_gen".to_string(),
            None,
            false,
        )
    })?;

    let policy = state.config.policy_for(resource);
    let today = Utc::now().date_naive();

    let usage = state
        .ledger
        .usage_counters(&caller_id, today, policy.daily_free_limit)
        .await
        .map_err(ledger_error_response)?;
    let credit_balance = state
        .ledger
        .credit_balance(&caller_id)
        .await
        .map_err(ledger_error_response)?;

    Ok(Json(UsageResponse {
        resource,
        usage,
        credit_balance,
    }))
}

const GRANT_AMOUNT_HARD_CAP: u32 = 1_000_000;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GrantCreditsRequest {
    caller_id: String,
    amount: u32,
}

#[derive(Debug, Serialize)]
struct GrantCreditsResponse {
    caller_id: String,
    credit_balance: i64,
}

/// Write-through for the payment collaborator: called after a purchase has
/// been captured, never as part of capture itself.
async fn grant_credits(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<GrantCreditsRequest>, JsonRejection>,
) -> Result<Json<GrantCreditsResponse>, ApiError> {
    let Some(expected) = state.config.admin_token.as_deref() else {
        return Err(json_error(
            StatusCode::FORBIDDEN,
            "ERR_ADMIN_DISABLED",
            "credit grants are disabled; set GLIMPSE_ADMIN_TOKEN".to_string(),
            None,
            false,
        ));
    };

    let provided = headers
        .get("x-glimpse-admin-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if provided != expected {
        return Err(json_error(
            StatusCode::UNAUTHORIZED,
            "ERR_ADMIN_TOKEN",
            "missing or invalid admin token".to_string(),
            None,
            false,
        ));
    }

    let Json(req) = req.map_err(|_| {
        json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PARAMS",
            "invalid JSON body".to_string(),
            None,
            false,
        )
    })?;

    let caller_id = sanitize_caller_id(req.caller_id.trim()).ok_or_else(|| {
        json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PARAMS",
            "caller_id must be non-empty".to_string(),
            None,
            false,
        )
    })?;

    if req.amount == 0 || req.amount > GRANT_AMOUNT_HARD_CAP {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PARAMS",
            format!("amount must be in 1..={}", GRANT_AMOUNT_HARD_CAP),
            None,
            false,
        ));
    }

    let credit_balance = state
        .ledger
        .grant_credits(&caller_id, req.amount)
        .await
        .map_err(ledger_error_response)?;

    tracing::info!(
        caller_id = %caller_id,
        amount = req.amount,
        credit_balance,
        "credits granted"
    );

    Ok(Json(GrantCreditsResponse {
        caller_id,
        credit_balance,
    }))
}

fn extract_caller_id(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-glimpse-caller-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .and_then(sanitize_caller_id)
        .ok_or_else(|| {
            json_error(
                StatusCode::UNAUTHORIZED,
                "ERR_MISSING_CALLER",
                "missing or invalid x-glimpse-caller-id header".to_string(),
                None,
                false,
            )
        })
}

fn sanitize_caller_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 128;
    if raw.is_empty() || raw.len() > MAX_LEN {
        return None;
    }

    raw.chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '@'))
        .then(|| raw.to_string())
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-glimpse-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn extract_trace_id(headers: &HeaderMap) -> String {
    headers
        .get("x-glimpse-trace-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse::<Ulid>().ok())
        .map(|u| u.to_string())
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    (!out.is_empty()).then_some(out)
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<DenialReason>,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
    reason: Option<DenialReason>,
    retryable: bool,
) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            code: code.into(),
            message: message.into(),
            reason,
            retryable,
            detail: None,
        }),
    )
}

fn denial_response(reason: DenialReason, usage: UsageCounters) -> ApiError {
    let (status, code, message) = match reason {
        DenialReason::QuotaExhausted => (
            StatusCode::PAYMENT_REQUIRED,
            "ERR_QUOTA_EXHAUSTED",
            "daily free allowance used and no credit remains",
        ),
        DenialReason::UpstreamFailure => (
            StatusCode::BAD_GATEWAY,
            "ERR_UPSTREAM_FAILURE",
            "result producer failed; try again",
        ),
        DenialReason::LedgerUnavailable => (
            StatusCode::SERVICE_UNAVAILABLE,
            "ERR_LEDGER_UNAVAILABLE",
            "usage ledger unavailable; try again",
        ),
    };

    (
        status,
        Json(ErrorResponse {
            code: code.to_string(),
            message: message.to_string(),
            reason: Some(reason),
            retryable: reason.retryable(),
            detail: Some(serde_json::json!({ "usage": usage })),
        }),
    )
}

fn ledger_error_response(err: LedgerError) -> ApiError {
    tracing::error!(error = %err, "ledger unavailable");
    json_error(
        StatusCode::SERVICE_UNAVAILABLE,
        "ERR_LEDGER_UNAVAILABLE",
        "usage ledger unavailable; try again".to_string(),
        Some(DenialReason::LedgerUnavailable),
        true,
    )
}
