//! Authoritative usage accounting for metered requests.
//!
//! The ledger answers one question per request — proceed for free, proceed
//! billed, or deny — and records the answer durably. Same-caller
//! reservations are serialized: the Postgres backend takes a per-caller
//! advisory lock for the whole read-check-write, the in-memory backend holds
//! a shard mutex for the same span. Callers treat any ledger error as a
//! denial (fail closed).

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::NaiveDate;
use glimpse_contracts::canonical;
use glimpse_contracts::{ReservationDecision, ReservationKind, ResourceKind, UsageCounters};
use sqlx::Row;
use sqlx::postgres::PgPoolOptions;
use ulid::Ulid;

#[derive(Debug)]
pub enum LedgerError {
    Timeout,
    Sqlx(sqlx::Error),
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::Timeout => write!(f, "ledger operation timed out"),
            LedgerError::Sqlx(err) => write!(f, "ledger sql error: {}", err),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<sqlx::Error> for LedgerError {
    fn from(value: sqlx::Error) -> Self {
        LedgerError::Sqlx(value)
    }
}

/// Result of a reservation, with the post-decision free-call count for the
/// day so callers can render usage counters without a second read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub decision: ReservationDecision,
    pub free_calls_used: u32,
}

/// Audit record of one gate decision.
#[derive(Debug, Clone)]
pub struct GateEvent {
    pub event_id: String,
    pub caller_id: String,
    pub resource: ResourceKind,
    pub outcome: String,
    pub payload_json: serde_json::Value,
    pub payload_hash: String,
}

/// Injectable ledger seam. Both backends implement the same semantics;
/// `Pg` is the cross-process deployment, `Memory` serves single-process
/// deployments and tests.
#[derive(Clone)]
pub enum QuotaLedger {
    Pg(PgLedger),
    Memory(MemoryLedger),
}

impl QuotaLedger {
    pub async fn reserve(
        &self,
        caller_id: &str,
        today: NaiveDate,
        daily_free_limit: u32,
    ) -> Result<Reservation, LedgerError> {
        match self {
            QuotaLedger::Pg(ledger) => ledger.reserve(caller_id, today, daily_free_limit).await,
            QuotaLedger::Memory(ledger) => Ok(ledger.reserve(caller_id, today, daily_free_limit)),
        }
    }

    /// Compensating reversal of a successful reservation. At most one call
    /// per reservation is the caller's obligation.
    pub async fn refund(
        &self,
        caller_id: &str,
        today: NaiveDate,
        kind: ReservationKind,
    ) -> Result<(), LedgerError> {
        match self {
            QuotaLedger::Pg(ledger) => ledger.refund(caller_id, today, kind).await,
            QuotaLedger::Memory(ledger) => {
                ledger.refund(caller_id, today, kind);
                Ok(())
            }
        }
    }

    pub async fn grant_credits(&self, caller_id: &str, amount: u32) -> Result<i64, LedgerError> {
        match self {
            QuotaLedger::Pg(ledger) => ledger.grant_credits(caller_id, amount).await,
            QuotaLedger::Memory(ledger) => Ok(ledger.grant_credits(caller_id, amount)),
        }
    }

    pub async fn credit_balance(&self, caller_id: &str) -> Result<i64, LedgerError> {
        match self {
            QuotaLedger::Pg(ledger) => ledger.credit_balance(caller_id).await,
            QuotaLedger::Memory(ledger) => Ok(ledger.credit_balance(caller_id)),
        }
    }

    pub async fn usage_on(&self, caller_id: &str, date: NaiveDate) -> Result<u32, LedgerError> {
        match self {
            QuotaLedger::Pg(ledger) => ledger.usage_on(caller_id, date).await,
            QuotaLedger::Memory(ledger) => Ok(ledger.usage_on(caller_id, date)),
        }
    }

    pub async fn usage_counters(
        &self,
        caller_id: &str,
        date: NaiveDate,
        daily_free_limit: u32,
    ) -> Result<UsageCounters, LedgerError> {
        let used = self.usage_on(caller_id, date).await?;
        Ok(UsageCounters::new(used, daily_free_limit))
    }

    pub async fn record_gate_event(
        &self,
        caller_id: &str,
        resource: ResourceKind,
        outcome: &str,
        payload_json: serde_json::Value,
    ) -> Result<String, LedgerError> {
        let event = GateEvent {
            event_id: Ulid::new().to_string(),
            caller_id: caller_id.to_string(),
            resource,
            outcome: outcome.to_string(),
            payload_hash: canonical::hash_canonical_json(&payload_json),
            payload_json,
        };
        match self {
            QuotaLedger::Pg(ledger) => ledger.insert_gate_event(event).await,
            QuotaLedger::Memory(ledger) => Ok(ledger.insert_gate_event(event)),
        }
    }

    pub async fn ping(&self) -> Result<(), LedgerError> {
        match self {
            QuotaLedger::Pg(ledger) => ledger.ping().await,
            QuotaLedger::Memory(_) => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct PgLedger {
    pool: sqlx::PgPool,
    write_timeout: Duration,
}

impl PgLedger {
    pub async fn connect(db_url: &str, write_timeout: Duration) -> Result<Self, LedgerError> {
        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            PgPoolOptions::new().max_connections(8).connect(db_url),
        )
        .await
        .map_err(|_| LedgerError::Timeout)??;

        Ok(Self {
            pool,
            write_timeout,
        })
    }

    pub async fn connect_and_migrate(
        db_url: &str,
        write_timeout: Duration,
    ) -> Result<Self, LedgerError> {
        let ledger = Self::connect(db_url, write_timeout).await?;
        ledger.migrate().await?;
        Ok(ledger)
    }

    pub async fn migrate(&self) -> Result<(), LedgerError> {
        tokio::time::timeout(Duration::from_secs(10), migrate(&self.pool))
            .await
            .map_err(|_| LedgerError::Timeout)??;
        Ok(())
    }

    pub async fn reserve(
        &self,
        caller_id: &str,
        today: NaiveDate,
        daily_free_limit: u32,
    ) -> Result<Reservation, LedgerError> {
        let reservation = tokio::time::timeout(self.write_timeout, async {
            let mut tx = self.pool.begin().await?;

            // Serializes all reservation/refund work for one caller.
            sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
                .bind(caller_id)
                .execute(&mut *tx)
                .await?;

            sqlx::query(
                "INSERT INTO glimpse_daily_usage (caller_id, usage_date, free_calls_used) VALUES ($1, $2, 0) ON CONFLICT (caller_id, usage_date) DO NOTHING",
            )
            .bind(caller_id)
            .bind(today)
            .execute(&mut *tx)
            .await?;

            let row = sqlx::query(
                "SELECT free_calls_used FROM glimpse_daily_usage WHERE caller_id = $1 AND usage_date = $2",
            )
            .bind(caller_id)
            .bind(today)
            .fetch_one(&mut *tx)
            .await?;
            let used: i32 = row.try_get("free_calls_used")?;
            let used = used.max(0) as u32;

            let reservation = if used < daily_free_limit {
                sqlx::query(
                    "UPDATE glimpse_daily_usage SET free_calls_used = free_calls_used + 1 WHERE caller_id = $1 AND usage_date = $2",
                )
                .bind(caller_id)
                .bind(today)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                Reservation {
                    decision: ReservationDecision::Free,
                    free_calls_used: used + 1,
                }
            } else {
                sqlx::query(
                    "INSERT INTO glimpse_accounts (caller_id, credit_balance) VALUES ($1, 0) ON CONFLICT (caller_id) DO NOTHING",
                )
                .bind(caller_id)
                .execute(&mut *tx)
                .await?;

                let row =
                    sqlx::query("SELECT credit_balance FROM glimpse_accounts WHERE caller_id = $1")
                        .bind(caller_id)
                        .fetch_one(&mut *tx)
                        .await?;
                let balance: i64 = row.try_get("credit_balance")?;

                if balance >= 1 {
                    sqlx::query(
                        "UPDATE glimpse_accounts SET credit_balance = credit_balance - 1 WHERE caller_id = $1",
                    )
                    .bind(caller_id)
                    .execute(&mut *tx)
                    .await?;
                    tx.commit().await?;
                    Reservation {
                        decision: ReservationDecision::Billed,
                        free_calls_used: used,
                    }
                } else {
                    // Denied mutates nothing.
                    tx.rollback().await?;
                    Reservation {
                        decision: ReservationDecision::Denied,
                        free_calls_used: used,
                    }
                }
            };

            Ok::<Reservation, sqlx::Error>(reservation)
        })
        .await
        .map_err(|_| LedgerError::Timeout)??;

        Ok(reservation)
    }

    pub async fn refund(
        &self,
        caller_id: &str,
        today: NaiveDate,
        kind: ReservationKind,
    ) -> Result<(), LedgerError> {
        tokio::time::timeout(self.write_timeout, async {
            let mut tx = self.pool.begin().await?;

            sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
                .bind(caller_id)
                .execute(&mut *tx)
                .await?;

            match kind {
                ReservationKind::Free => {
                    sqlx::query(
                        "UPDATE glimpse_daily_usage SET free_calls_used = GREATEST(free_calls_used - 1, 0) WHERE caller_id = $1 AND usage_date = $2",
                    )
                    .bind(caller_id)
                    .bind(today)
                    .execute(&mut *tx)
                    .await?;
                }
                ReservationKind::Billed => {
                    sqlx::query(
                        "INSERT INTO glimpse_accounts (caller_id, credit_balance) VALUES ($1, 1) ON CONFLICT (caller_id) DO UPDATE SET credit_balance = glimpse_accounts.credit_balance + 1",
                    )
                    .bind(caller_id)
                    .execute(&mut *tx)
                    .await?;
                }
            }

            tx.commit().await?;
            Ok::<(), sqlx::Error>(())
        })
        .await
        .map_err(|_| LedgerError::Timeout)??;

        Ok(())
    }

    pub async fn grant_credits(&self, caller_id: &str, amount: u32) -> Result<i64, LedgerError> {
        let balance = tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "INSERT INTO glimpse_accounts (caller_id, credit_balance) VALUES ($1, $2) ON CONFLICT (caller_id) DO UPDATE SET credit_balance = glimpse_accounts.credit_balance + EXCLUDED.credit_balance RETURNING credit_balance",
            )
            .bind(caller_id)
            .bind(i64::from(amount))
            .fetch_one(&self.pool),
        )
        .await
        .map_err(|_| LedgerError::Timeout)??
        .try_get("credit_balance")?;

        Ok(balance)
    }

    pub async fn credit_balance(&self, caller_id: &str) -> Result<i64, LedgerError> {
        let row = tokio::time::timeout(
            self.write_timeout,
            sqlx::query("SELECT credit_balance FROM glimpse_accounts WHERE caller_id = $1")
                .bind(caller_id)
                .fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| LedgerError::Timeout)??;

        match row {
            Some(row) => Ok(row.try_get("credit_balance")?),
            None => Ok(0),
        }
    }

    pub async fn usage_on(&self, caller_id: &str, date: NaiveDate) -> Result<u32, LedgerError> {
        let row = tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "SELECT free_calls_used FROM glimpse_daily_usage WHERE caller_id = $1 AND usage_date = $2",
            )
            .bind(caller_id)
            .bind(date)
            .fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| LedgerError::Timeout)??;

        match row {
            Some(row) => {
                let used: i32 = row.try_get("free_calls_used")?;
                Ok(used.max(0) as u32)
            }
            None => Ok(0),
        }
    }

    pub async fn insert_gate_event(&self, event: GateEvent) -> Result<String, LedgerError> {
        tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "INSERT INTO glimpse_gate_events (event_id, caller_id, resource, outcome, payload_json, payload_hash) VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(&event.event_id)
            .bind(&event.caller_id)
            .bind(event.resource.as_str())
            .bind(&event.outcome)
            .bind(&event.payload_json)
            .bind(&event.payload_hash)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| LedgerError::Timeout)??;

        Ok(event.event_id)
    }

    pub async fn ping(&self) -> Result<(), LedgerError> {
        tokio::time::timeout(
            self.write_timeout,
            sqlx::query("SELECT 1").execute(&self.pool),
        )
        .await
        .map_err(|_| LedgerError::Timeout)??;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

const SHARD_COUNT: usize = 16;

#[derive(Debug, Default)]
struct CallerState {
    credit_balance: i64,
    usage_date: Option<NaiveDate>,
    free_calls_used: u32,
}

impl CallerState {
    fn roll_to(&mut self, today: NaiveDate) {
        if self.usage_date.is_none_or(|date| date < today) {
            self.usage_date = Some(today);
            self.free_calls_used = 0;
        }
    }
}

/// In-process backend: a fixed set of mutex shards keyed by caller id. The
/// shard mutex is held for the whole read-check-write, so reservations for
/// one caller observe a serialized view.
#[derive(Clone)]
pub struct MemoryLedger {
    shards: Arc<Vec<Mutex<HashMap<String, CallerState>>>>,
    events: Arc<Mutex<Vec<GateEvent>>>,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>();
        Self {
            shards: Arc::new(shards),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn shard(&self, caller_id: &str) -> MutexGuard<'_, HashMap<String, CallerState>> {
        let mut hasher = DefaultHasher::new();
        caller_id.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        match self.shards[idx].lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn reserve(&self, caller_id: &str, today: NaiveDate, daily_free_limit: u32) -> Reservation {
        let mut shard = self.shard(caller_id);
        let state = shard.entry(caller_id.to_string()).or_default();
        state.roll_to(today);

        if state.free_calls_used < daily_free_limit {
            state.free_calls_used += 1;
            Reservation {
                decision: ReservationDecision::Free,
                free_calls_used: state.free_calls_used,
            }
        } else if state.credit_balance >= 1 {
            state.credit_balance -= 1;
            Reservation {
                decision: ReservationDecision::Billed,
                free_calls_used: state.free_calls_used,
            }
        } else {
            Reservation {
                decision: ReservationDecision::Denied,
                free_calls_used: state.free_calls_used,
            }
        }
    }

    pub fn refund(&self, caller_id: &str, today: NaiveDate, kind: ReservationKind) {
        let mut shard = self.shard(caller_id);
        let state = shard.entry(caller_id.to_string()).or_default();

        match kind {
            ReservationKind::Free => {
                if state.usage_date == Some(today) {
                    state.free_calls_used = state.free_calls_used.saturating_sub(1);
                }
            }
            ReservationKind::Billed => {
                state.credit_balance += 1;
            }
        }
    }

    pub fn grant_credits(&self, caller_id: &str, amount: u32) -> i64 {
        let mut shard = self.shard(caller_id);
        let state = shard.entry(caller_id.to_string()).or_default();
        state.credit_balance += i64::from(amount);
        state.credit_balance
    }

    pub fn credit_balance(&self, caller_id: &str) -> i64 {
        let mut shard = self.shard(caller_id);
        shard
            .entry(caller_id.to_string())
            .or_default()
            .credit_balance
    }

    pub fn usage_on(&self, caller_id: &str, date: NaiveDate) -> u32 {
        let shard = self.shard(caller_id);
        match shard.get(caller_id) {
            Some(state) if state.usage_date == Some(date) => state.free_calls_used,
            _ => 0,
        }
    }

    pub fn insert_gate_event(&self, event: GateEvent) -> String {
        let event_id = event.event_id.clone();
        let mut events = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        events.push(event);
        event_id
    }

    /// Snapshot of the audit trail, oldest first.
    pub fn gate_events(&self) -> Vec<GateEvent> {
        let events = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        events.clone()
    }
}
