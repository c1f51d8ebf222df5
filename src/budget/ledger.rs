//! The budget ledger: authorization, reservation, and spend tracking.
//!
//! `authorize` reserves the estimate under the attempt id before the call
//! goes out; `commit` replaces the reservation with the actual cost and
//! `release` returns it when the attempt dies without a bill. Because the
//! reservation happens inside the same lock as the limit check, two racing
//! attempts can never both squeeze through the same remaining budget.
//!
//! All amounts are integer micro-units; see [`super::pricing`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::store::{AuditKind, AuditRecord, LedgerStore};

/// What one budget limit spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPeriod {
    /// One limit per conversation session.
    Session,
    /// One shared limit per UTC calendar day.
    Day,
}

#[derive(Debug, Clone)]
pub struct BudgetConfig {
    pub limit_micros: i64,
    pub period: BudgetPeriod,
    /// Spend ratio past which the ledger reports elevated pressure.
    pub warn_ratio: f64,
    /// Display label only; all arithmetic is unit-agnostic.
    pub currency: String,
}

/// Outcome of an authorization request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow {
        remaining_micros: i64,
    },
    Deny {
        remaining_micros: i64,
        shortfall_micros: i64,
    },
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }
}

/// How close the period is to its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Pressure {
    Normal,
    Elevated,
}

/// Point-in-time view of one period's budget, for the API surface.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetSnapshot {
    pub period_key: String,
    pub currency: String,
    pub limit_micros: i64,
    pub spent_micros: i64,
    pub reserved_micros: i64,
    pub remaining_micros: i64,
    pub pressure: Pressure,
    pub degraded: bool,
}

#[derive(Debug, Default)]
struct PeriodState {
    spent: i64,
    reserved: i64,
    pending: HashMap<Uuid, i64>,
    committed: HashSet<Uuid>,
}

#[derive(Default)]
struct LedgerTable {
    periods: HashMap<String, PeriodState>,
}

/// Shared, internally locked budget ledger.
pub struct BudgetLedger {
    config: BudgetConfig,
    store: Option<Box<dyn LedgerStore>>,
    degraded: AtomicBool,
    inner: Mutex<LedgerTable>,
}

impl BudgetLedger {
    pub fn new(config: BudgetConfig, store: Option<Box<dyn LedgerStore>>) -> Self {
        Self {
            config,
            store,
            degraded: AtomicBool::new(false),
            inner: Mutex::new(LedgerTable::default()),
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// True while the durable store is unreachable and the ledger is
    /// enforcing from memory alone.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    fn period_key_at(&self, session_id: &str, now: DateTime<Utc>) -> String {
        match self.config.period {
            BudgetPeriod::Session => format!("session:{}", session_id),
            BudgetPeriod::Day => format!("day:{}", now.format("%Y-%m-%d")),
        }
    }

    fn period_key(&self, session_id: &str) -> String {
        self.period_key_at(session_id, Utc::now())
    }

    /// Reserve `estimate_micros` for an attempt, or deny without reserving.
    /// Re-authorizing an attempt the ledger already knows is a no-op allow.
    pub async fn authorize(
        &self,
        session_id: &str,
        attempt_id: Uuid,
        model_id: &str,
        estimate_micros: i64,
    ) -> Decision {
        let key = self.period_key(session_id);
        let record;
        let decision;
        {
            let mut table = self.inner.lock().await;
            let state = self.touch(&mut table, &key);

            if state.pending.contains_key(&attempt_id) || state.committed.contains(&attempt_id) {
                let remaining = self.config.limit_micros - state.spent - state.reserved;
                return Decision::Allow {
                    remaining_micros: remaining,
                };
            }

            let available = self.config.limit_micros - state.spent - state.reserved;
            if estimate_micros <= available {
                state.pending.insert(attempt_id, estimate_micros);
                state.reserved += estimate_micros;
                let remaining = self.config.limit_micros - state.spent - state.reserved;
                decision = Decision::Allow {
                    remaining_micros: remaining,
                };
                record = self.audit_record(
                    session_id,
                    &key,
                    attempt_id,
                    AuditKind::Authorize,
                    Some(model_id),
                    estimate_micros,
                    remaining,
                    None,
                );
            } else {
                decision = Decision::Deny {
                    remaining_micros: available,
                    shortfall_micros: estimate_micros - available,
                };
                record = self.audit_record(
                    session_id,
                    &key,
                    attempt_id,
                    AuditKind::Deny,
                    Some(model_id),
                    estimate_micros,
                    available,
                    Some(format!(
                        "estimate {} exceeds remaining {}",
                        estimate_micros, available
                    )),
                );
            }
        }
        self.persist(&record);
        decision
    }

    /// Non-reserving probe: would an estimate of this size be authorized
    /// right now? Used to gate tier escalation without touching state.
    pub async fn check(&self, session_id: &str, estimate_micros: i64) -> bool {
        let key = self.period_key(session_id);
        let mut table = self.inner.lock().await;
        let state = self.touch(&mut table, &key);
        estimate_micros <= self.config.limit_micros - state.spent - state.reserved
    }

    /// Charge the actual cost, replacing any reservation held for the
    /// attempt. Idempotent per attempt id; a replayed commit charges
    /// nothing. Returns the remaining budget.
    pub async fn commit(
        &self,
        session_id: &str,
        attempt_id: Uuid,
        model_id: &str,
        actual_micros: i64,
    ) -> i64 {
        let key = self.period_key(session_id);
        let record;
        let remaining;
        {
            let mut table = self.inner.lock().await;
            let state = self.touch(&mut table, &key);

            if let Some(reserved) = state.pending.remove(&attempt_id) {
                state.reserved -= reserved;
            }
            if state.committed.contains(&attempt_id) {
                return self.config.limit_micros - state.spent - state.reserved;
            }

            state.spent += actual_micros;
            state.committed.insert(attempt_id);
            remaining = self.config.limit_micros - state.spent - state.reserved;
            record = self.audit_record(
                session_id,
                &key,
                attempt_id,
                AuditKind::Commit,
                Some(model_id),
                actual_micros,
                remaining,
                None,
            );
        }
        self.persist(&record);
        remaining
    }

    /// Return a reservation without charging; the attempt failed before it
    /// produced a bill. Unknown attempt ids are ignored.
    pub async fn release(&self, session_id: &str, attempt_id: Uuid) {
        let key = self.period_key(session_id);
        let record;
        {
            let mut table = self.inner.lock().await;
            let state = self.touch(&mut table, &key);
            let Some(amount) = state.pending.remove(&attempt_id) else {
                return;
            };
            state.reserved -= amount;
            let remaining = self.config.limit_micros - state.spent - state.reserved;
            record = self.audit_record(
                session_id,
                &key,
                attempt_id,
                AuditKind::Release,
                None,
                amount,
                remaining,
                None,
            );
        }
        self.persist(&record);
    }

    /// Remaining budget for the session's period. Can go negative when a
    /// committed actual overshoots its estimate; the next authorize then
    /// denies.
    pub async fn remaining(&self, session_id: &str) -> i64 {
        let key = self.period_key(session_id);
        let mut table = self.inner.lock().await;
        let state = self.touch(&mut table, &key);
        self.config.limit_micros - state.spent - state.reserved
    }

    pub async fn pressure(&self, session_id: &str) -> Pressure {
        let key = self.period_key(session_id);
        let mut table = self.inner.lock().await;
        let state = self.touch(&mut table, &key);
        self.pressure_of(state)
    }

    pub async fn snapshot(&self, session_id: &str) -> BudgetSnapshot {
        let key = self.period_key(session_id);
        let mut table = self.inner.lock().await;
        let state = self.touch(&mut table, &key);
        BudgetSnapshot {
            period_key: key.clone(),
            currency: self.config.currency.clone(),
            limit_micros: self.config.limit_micros,
            spent_micros: state.spent,
            reserved_micros: state.reserved,
            remaining_micros: self.config.limit_micros - state.spent - state.reserved,
            pressure: self.pressure_of(state),
            degraded: self.is_degraded(),
        }
    }

    /// Drop in-memory state for a finished session. The audit trail keeps
    /// the history; a late commit recovers the spent total from it.
    pub async fn forget(&self, session_id: &str) {
        if self.config.period != BudgetPeriod::Session {
            return;
        }
        let key = self.period_key(session_id);
        let mut table = self.inner.lock().await;
        table.periods.remove(&key);
    }

    fn pressure_of(&self, state: &PeriodState) -> Pressure {
        let used = (state.spent + state.reserved) as f64;
        if used >= self.config.warn_ratio * self.config.limit_micros as f64 {
            Pressure::Elevated
        } else {
            Pressure::Normal
        }
    }

    fn touch<'a>(&self, table: &'a mut LedgerTable, key: &str) -> &'a mut PeriodState {
        if self.config.period == BudgetPeriod::Day {
            // A new day key means midnight passed; stale day entries only
            // hold reservations whose commits will land on the new key.
            table.periods.retain(|k, _| k == key);
        }
        table
            .periods
            .entry(key.to_string())
            .or_insert_with(|| self.recover(key))
    }

    fn recover(&self, key: &str) -> PeriodState {
        let mut state = PeriodState::default();
        if let Some(store) = &self.store {
            match store.load_period(key) {
                Ok(recovered) => {
                    state.spent = recovered.spent_micros;
                    state.committed = recovered.committed;
                }
                Err(err) => {
                    self.mark_degraded(&err);
                }
            }
        }
        state
    }

    #[allow(clippy::too_many_arguments)]
    fn audit_record(
        &self,
        session_id: &str,
        period_key: &str,
        attempt_id: Uuid,
        kind: AuditKind,
        model_id: Option<&str>,
        amount_micros: i64,
        remaining_micros: i64,
        note: Option<String>,
    ) -> AuditRecord {
        AuditRecord {
            id: Uuid::new_v4(),
            session_id: session_id.to_string(),
            period_key: period_key.to_string(),
            attempt_id,
            kind,
            model_id: model_id.map(|m| m.to_string()),
            amount_micros,
            remaining_micros,
            note,
            created_at: Utc::now(),
        }
    }

    fn persist(&self, record: &AuditRecord) {
        let Some(store) = &self.store else {
            return;
        };
        match store.append(record) {
            Ok(()) => {
                if self.degraded.swap(false, Ordering::Relaxed) {
                    tracing::info!("Budget store is reachable again");
                }
            }
            Err(err) => self.mark_degraded(&err),
        }
    }

    fn mark_degraded(&self, err: &anyhow::Error) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                "Budget store unavailable, enforcing from memory: {:#}",
                err
            );
        }
    }
}

/// Shared ledger handle.
pub type SharedBudgetLedger = std::sync::Arc<BudgetLedger>;
