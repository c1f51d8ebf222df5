//! Budget module - cost authorization, spend tracking, and pricing.
//!
//! # Key Concepts
//! - Ledger: per-period limits with reserve-then-commit accounting
//! - Pricing: token costs in integer micro-units, rounded half-to-even
//! - Store: durable audit trail (SQLite primary, CSV fallback) the ledger
//!   degrades away from instead of failing open

mod ledger;
pub mod pricing;
mod store;

pub use ledger::{
    BudgetConfig, BudgetLedger, BudgetPeriod, BudgetSnapshot, Decision, Pressure,
    SharedBudgetLedger,
};
pub use store::{AuditKind, AuditRecord, CsvLedgerStore, LedgerStore, SqliteLedgerStore};
