//! Model cascade - walks a tier's models in priority order and escalates
//! to costlier tiers when they fail.
//!
//! One cascade lives for one turn. It holds the catalog snapshot it was
//! born with, so reloads cannot change its view, and it never offers the
//! same (tier, model) pair twice. Escalation into a pricier tier is gated
//! on the ledger: when even the cheapest model of the next tier would be
//! denied, the cascade ends with the budget flag set instead of silently
//! skipping ahead.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::budget::BudgetLedger;
use crate::catalog::{CatalogSnapshot, ModelDescriptor};

/// How one selection attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Picked but not yet reported on.
    Pending,
    Succeeded,
    /// The model call failed.
    Failed,
    /// The ledger refused to fund the call.
    Denied,
    TimedOut,
}

/// Audit record for one pick out of the cascade.
#[derive(Debug, Clone, Serialize)]
pub struct SelectionAttempt {
    pub id: Uuid,
    pub tier: String,
    pub model_id: String,
    /// 1-based position within this cascade.
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// A model the cascade wants tried next.
#[derive(Debug, Clone)]
pub struct PickedModel {
    pub attempt_id: Uuid,
    pub tier_idx: usize,
    pub model: ModelDescriptor,
}

/// Result of asking the cascade for its next candidate.
#[derive(Debug, Clone)]
pub enum Selection {
    Pick(PickedModel),
    /// No candidate left. `budget_limited` distinguishes "the ledger said
    /// no" from "we ran out of models or attempts".
    Exhausted { budget_limited: bool },
}

pub struct Cascade {
    catalog: Arc<CatalogSnapshot>,
    session_id: String,
    tier_idx: usize,
    attempt_in_tier: usize,
    attempts_made: u32,
    max_attempts: u32,
    tried: HashSet<(usize, String)>,
    records: Vec<SelectionAttempt>,
}

impl Cascade {
    /// Start a cascade at `start_tier` (clamped into the catalog).
    pub fn new(
        catalog: Arc<CatalogSnapshot>,
        session_id: impl Into<String>,
        start_tier: usize,
        max_attempts: u32,
    ) -> Self {
        let tier_idx = start_tier.min(catalog.tier_count().saturating_sub(1));
        Self {
            catalog,
            session_id: session_id.into(),
            tier_idx,
            attempt_in_tier: 0,
            attempts_made: 0,
            max_attempts,
            tried: HashSet::new(),
            records: Vec::new(),
        }
    }

    /// Next candidate, or the reason there is none. `estimate` prices a
    /// prospective call against a given model; the ledger probe uses it
    /// both for the candidate itself and for escalation gating.
    pub async fn next<F>(&mut self, ledger: &BudgetLedger, estimate: F) -> Selection
    where
        F: Fn(&ModelDescriptor) -> i64,
    {
        loop {
            if self.attempts_made >= self.max_attempts {
                tracing::warn!(
                    "Cascade for {} stopped at the attempt cap ({})",
                    self.session_id,
                    self.max_attempts
                );
                return Selection::Exhausted {
                    budget_limited: false,
                };
            }

            match self.catalog.model(self.tier_idx, self.attempt_in_tier) {
                Some(model) => {
                    let key = (self.tier_idx, model.id.clone());
                    if self.tried.contains(&key) {
                        self.attempt_in_tier += 1;
                        continue;
                    }

                    if !ledger.check(&self.session_id, estimate(model)).await {
                        tracing::warn!(
                            "Cascade for {} stopped: ledger denies {} in tier {}",
                            self.session_id,
                            model.id,
                            model.tier
                        );
                        return Selection::Exhausted {
                            budget_limited: true,
                        };
                    }

                    self.tried.insert(key);
                    self.attempts_made += 1;
                    self.attempt_in_tier += 1;

                    let attempt_id = Uuid::new_v4();
                    self.records.push(SelectionAttempt {
                        id: attempt_id,
                        tier: model.tier.clone(),
                        model_id: model.id.clone(),
                        attempt_number: self.attempts_made,
                        outcome: AttemptOutcome::Pending,
                        detail: None,
                        started_at: Utc::now(),
                    });

                    return Selection::Pick(PickedModel {
                        attempt_id,
                        tier_idx: self.tier_idx,
                        model: model.clone(),
                    });
                }
                None => {
                    // Tier exhausted; try to escalate.
                    let next_tier = self.tier_idx + 1;
                    if next_tier >= self.catalog.tier_count() {
                        return Selection::Exhausted {
                            budget_limited: false,
                        };
                    }

                    // Tiers are non-empty by catalog validation.
                    if let Some(cheapest) = self.catalog.cheapest(next_tier) {
                        if !ledger.check(&self.session_id, estimate(cheapest)).await {
                            tracing::warn!(
                                "Cascade for {} cannot escalate to tier {}: cheapest model denied",
                                self.session_id,
                                self.catalog.tier_name(next_tier).unwrap_or("?")
                            );
                            return Selection::Exhausted {
                                budget_limited: true,
                            };
                        }
                    }

                    tracing::info!(
                        "Cascade for {} escalating from tier {} to {}",
                        self.session_id,
                        self.catalog.tier_name(self.tier_idx).unwrap_or("?"),
                        self.catalog.tier_name(next_tier).unwrap_or("?")
                    );
                    self.tier_idx = next_tier;
                    self.attempt_in_tier = 0;
                }
            }
        }
    }

    /// Report how a picked attempt went.
    pub fn record(&mut self, attempt_id: Uuid, outcome: AttemptOutcome, detail: Option<String>) {
        if let Some(rec) = self.records.iter_mut().find(|r| r.id == attempt_id) {
            rec.outcome = outcome;
            rec.detail = detail;
        }
    }

    /// Everything this cascade tried, in order.
    pub fn attempts(&self) -> &[SelectionAttempt] {
        &self.records
    }

    pub fn current_tier(&self) -> Option<&str> {
        self.catalog.tier_name(self.tier_idx)
    }
}
