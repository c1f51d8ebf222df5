//! Durable backends for the budget ledger.
//!
//! Every authorization decision leaves an audit row; commits are the rows
//! that carry spend. On startup (or a period rollover) the ledger replays
//! the current period's commits to rebuild the spent total, so a restart
//! never forgets money that already left the building.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a ledger action did, as recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditKind {
    /// Estimate reserved against the period.
    Authorize,
    /// Authorization refused; nothing reserved.
    Deny,
    /// Actual cost charged, replacing the reservation.
    Commit,
    /// Reservation returned without a charge.
    Release,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::Authorize => "authorize",
            AuditKind::Deny => "deny",
            AuditKind::Commit => "commit",
            AuditKind::Release => "release",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "authorize" => Some(AuditKind::Authorize),
            "deny" => Some(AuditKind::Deny),
            "commit" => Some(AuditKind::Commit),
            "release" => Some(AuditKind::Release),
            _ => None,
        }
    }
}

/// One row of the budget audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub session_id: String,
    pub period_key: String,
    pub attempt_id: Uuid,
    pub kind: AuditKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    /// Estimate for authorize/deny/release rows, actual cost for commits.
    pub amount_micros: i64,
    /// Remaining budget after the action was applied.
    pub remaining_micros: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Spend state recovered from the store for one period.
#[derive(Debug, Default)]
pub struct PeriodRecovery {
    pub spent_micros: i64,
    pub committed: HashSet<Uuid>,
}

/// Durable side of the ledger. Implementations only need to keep an
/// append-only trail and answer "what was committed this period".
pub trait LedgerStore: Send + Sync {
    fn append(&self, record: &AuditRecord) -> Result<()>;
    fn load_period(&self, period_key: &str) -> Result<PeriodRecovery>;
}

// ─────────────────────────────────────────────────────────────────────────────
// SQLite backend
// ─────────────────────────────────────────────────────────────────────────────

/// Primary backend: a single-table SQLite audit trail.
pub struct SqliteLedgerStore {
    conn: Mutex<Connection>,
}

impl SqliteLedgerStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open ledger database: {:?}", path))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS budget_audit (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                period_key TEXT NOT NULL,
                attempt_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                model_id TEXT,
                amount_micros INTEGER NOT NULL,
                remaining_micros INTEGER NOT NULL,
                note TEXT,
                created_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_period ON budget_audit(period_key, kind)",
            [],
        )?;

        Ok(())
    }
}

impl LedgerStore for SqliteLedgerStore {
    fn append(&self, record: &AuditRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO budget_audit
                (id, session_id, period_key, attempt_id, kind, model_id,
                 amount_micros, remaining_micros, note, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                record.id.to_string(),
                record.session_id,
                record.period_key,
                record.attempt_id.to_string(),
                record.kind.as_str(),
                record.model_id,
                record.amount_micros,
                record.remaining_micros,
                record.note,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn load_period(&self, period_key: &str) -> Result<PeriodRecovery> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT attempt_id, amount_micros FROM budget_audit
             WHERE period_key = ? AND kind = 'commit'",
        )?;

        let mut recovery = PeriodRecovery::default();
        let rows = stmt.query_map(params![period_key], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (attempt_id, amount) = row?;
            recovery.spent_micros += amount;
            if let Ok(id) = Uuid::parse_str(&attempt_id) {
                recovery.committed.insert(id);
            }
        }
        Ok(recovery)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CSV backend
// ─────────────────────────────────────────────────────────────────────────────

/// Fallback backend: an append-only CSV file. Slower to recover from but
/// with no moving parts at all; useful where SQLite cannot live.
pub struct CsvLedgerStore {
    path: PathBuf,
    lock: Mutex<()>,
}

const CSV_HEADER: &str =
    "id,session_id,period_key,attempt_id,kind,model_id,amount_micros,remaining_micros,note,created_at";

/// Free-text fields share a line with the delimiters; strip them on write.
fn csv_field(s: &str) -> String {
    s.replace([',', '\n', '\r'], ";")
}

impl CsvLedgerStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }
        if !path.exists() {
            std::fs::write(path, format!("{}\n", CSV_HEADER))
                .with_context(|| format!("Failed to create ledger file: {:?}", path))?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        })
    }
}

impl LedgerStore for CsvLedgerStore {
    fn append(&self, record: &AuditRecord) -> Result<()> {
        use std::io::Write;

        let _guard = self.lock.lock().unwrap();
        let line = format!(
            "{},{},{},{},{},{},{},{},{},{}\n",
            record.id,
            csv_field(&record.session_id),
            csv_field(&record.period_key),
            record.attempt_id,
            record.kind.as_str(),
            csv_field(record.model_id.as_deref().unwrap_or("")),
            record.amount_micros,
            record.remaining_micros,
            csv_field(record.note.as_deref().unwrap_or("")),
            record.created_at.to_rfc3339(),
        );

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open ledger file: {:?}", self.path))?;
        file.write_all(line.as_bytes())
            .context("Failed to append ledger record")?;
        Ok(())
    }

    fn load_period(&self, period_key: &str) -> Result<PeriodRecovery> {
        let _guard = self.lock.lock().unwrap();
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read ledger file: {:?}", self.path))?;

        let mut recovery = PeriodRecovery::default();
        for line in text.lines().skip(1) {
            let fields: Vec<&str> = line.split(',').collect();
            if fields.len() < 10 {
                continue;
            }
            if fields[2] != period_key {
                continue;
            }
            if AuditKind::parse(fields[4]) != Some(AuditKind::Commit) {
                continue;
            }
            if let Ok(amount) = fields[6].parse::<i64>() {
                recovery.spent_micros += amount;
            }
            if let Ok(id) = Uuid::parse_str(fields[3]) {
                recovery.committed.insert(id);
            }
        }
        Ok(recovery)
    }
}
