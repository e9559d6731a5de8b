//! Local reconciliation storage (SQLite)

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::rail::Confirmation;
use crate::reconciliation::{
    confirmation_columns, ReconciliationRecord, ReconciliationStore, SyncState,
};
use crate::types::{dedupe_key, Bounty, BountyId, BountyStatus, Principal};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS reconciliation (
    bounty_id INTEGER PRIMARY KEY,
    dedupe_key TEXT NOT NULL,
    repository TEXT NOT NULL,
    issue_id INTEGER NOT NULL,
    issue_url TEXT NOT NULL,
    creator TEXT NOT NULL,
    solver TEXT,
    solver_identity TEXT,
    pull_request_url TEXT,
    initial_amount TEXT NOT NULL,
    current_amount TEXT NOT NULL,
    max_amount TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    claimed_at INTEGER,
    closed_at INTEGER,
    expires_at INTEGER NOT NULL,
    escalation_count INTEGER NOT NULL,
    sync_state TEXT NOT NULL,
    submission_ref TEXT,
    settlement_ref TEXT,
    confirmation_height INTEGER,
    confirmation_time TEXT,
    failure_reason TEXT,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_reconciliation_confirmed_active
    ON reconciliation (dedupe_key)
    WHERE sync_state = 'confirmed' AND status = 'active';
CREATE INDEX IF NOT EXISTS idx_reconciliation_dedupe_key ON reconciliation (dedupe_key);
CREATE INDEX IF NOT EXISTS idx_reconciliation_creator_status ON reconciliation (creator, status);
CREATE INDEX IF NOT EXISTS idx_reconciliation_solver ON reconciliation (solver);
"#;

const SELECT_COLUMNS: &str = "SELECT bounty_id, dedupe_key, repository, issue_id, issue_url, \
     creator, solver, solver_identity, pull_request_url, initial_amount, current_amount, \
     max_amount, status, created_at, claimed_at, closed_at, expires_at, escalation_count, \
     sync_state, submission_ref, settlement_ref, confirmation_height, confirmation_time, \
     failure_reason, updated_at FROM reconciliation";

const UPSERT: &str = r#"
INSERT INTO reconciliation (
    bounty_id, dedupe_key, repository, issue_id, issue_url, creator, solver, solver_identity,
    pull_request_url, initial_amount, current_amount, max_amount, status, created_at,
    claimed_at, closed_at, expires_at, escalation_count, sync_state, submission_ref, updated_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)
ON CONFLICT (bounty_id) DO UPDATE SET
    dedupe_key = excluded.dedupe_key,
    repository = excluded.repository,
    issue_id = excluded.issue_id,
    issue_url = excluded.issue_url,
    creator = excluded.creator,
    solver = excluded.solver,
    solver_identity = excluded.solver_identity,
    pull_request_url = excluded.pull_request_url,
    initial_amount = excluded.initial_amount,
    current_amount = excluded.current_amount,
    max_amount = excluded.max_amount,
    status = excluded.status,
    created_at = excluded.created_at,
    claimed_at = excluded.claimed_at,
    closed_at = excluded.closed_at,
    expires_at = excluded.expires_at,
    escalation_count = excluded.escalation_count,
    sync_state = excluded.sync_state,
    submission_ref = excluded.submission_ref,
    settlement_ref = NULL,
    confirmation_height = NULL,
    confirmation_time = NULL,
    failure_reason = NULL,
    updated_at = excluded.updated_at
"#;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        info!("Opened reconciliation store at {}", path.display());
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .lock()
            .execute_batch(SCHEMA)
            .context("Failed to apply reconciliation schema")
    }

    fn query(&self, filter: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<ReconciliationRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{} {}", SELECT_COLUMNS, filter))?;
        let records = stmt
            .query_map(args, record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

fn upsert(
    conn: &Connection,
    bounty: &Bounty,
    sync_state: SyncState,
    submission_ref: Option<&str>,
    updated_at: &str,
) -> rusqlite::Result<usize> {
    conn.execute(
        UPSERT,
        params![
            bounty.id as i64,
            bounty.dedupe_key,
            bounty.repository,
            bounty.issue_id as i64,
            bounty.issue_url,
            bounty.creator.as_str(),
            bounty.solver.as_ref().map(|p| p.as_str()),
            bounty.solver_identity,
            bounty.pull_request_url,
            bounty.initial_amount.to_string(),
            bounty.current_amount.to_string(),
            bounty.max_amount.to_string(),
            bounty.status.as_str(),
            bounty.created_at as i64,
            bounty.claimed_at.map(|t| t as i64),
            bounty.closed_at.map(|t| t as i64),
            bounty.expires_at as i64,
            bounty.escalation_count as i64,
            sync_state.as_str(),
            submission_ref,
            updated_at,
        ],
    )
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn amount_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<u128> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|_| conversion_error(idx, format!("invalid amount '{}'", raw)))
}

fn time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, format!("invalid timestamp '{}': {}", s, e)))
    })
    .transpose()
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ReconciliationRecord> {
    let status: String = row.get(12)?;
    let sync_state: String = row.get(18)?;
    let updated_at = time_at(row, 24)?
        .ok_or_else(|| conversion_error(24, "missing updated_at".to_string()))?;

    Ok(ReconciliationRecord {
        bounty: Bounty {
            id: row.get::<_, i64>(0)? as BountyId,
            dedupe_key: row.get(1)?,
            repository: row.get(2)?,
            issue_id: row.get::<_, i64>(3)? as u64,
            issue_url: row.get(4)?,
            creator: Principal::new(row.get::<_, String>(5)?),
            solver: row.get::<_, Option<String>>(6)?.map(Principal::new),
            solver_identity: row.get(7)?,
            pull_request_url: row.get(8)?,
            initial_amount: amount_at(row, 9)?,
            current_amount: amount_at(row, 10)?,
            max_amount: amount_at(row, 11)?,
            status: BountyStatus::parse(&status)
                .ok_or_else(|| conversion_error(12, format!("unknown status '{}'", status)))?,
            created_at: row.get::<_, i64>(13)? as u64,
            claimed_at: row.get::<_, Option<i64>>(14)?.map(|t| t as u64),
            closed_at: row.get::<_, Option<i64>>(15)?.map(|t| t as u64),
            expires_at: row.get::<_, i64>(16)? as u64,
            escalation_count: row.get::<_, i64>(17)? as u32,
        },
        sync_state: SyncState::parse(&sync_state)
            .ok_or_else(|| conversion_error(18, format!("unknown sync state '{}'", sync_state)))?,
        submission_ref: row.get(19)?,
        settlement_ref: row.get(20)?,
        confirmation_height: row.get::<_, Option<i64>>(21)?.map(|h| h as u64),
        confirmation_time: time_at(row, 22)?,
        failure_reason: row.get(23)?,
        updated_at,
    })
}

#[async_trait]
impl ReconciliationStore for SqliteStore {
    async fn record_pending(&self, bounty: &Bounty, submission_ref: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        upsert(&tx, bounty, SyncState::Pending, Some(submission_ref), &now)?;
        if bounty.is_active() {
            let superseded = tx.execute(
                "UPDATE reconciliation SET sync_state = 'superseded', updated_at = ?1
                 WHERE dedupe_key = ?2 AND bounty_id <> ?3 AND sync_state IN ('pending', 'failed')",
                params![now, bounty.dedupe_key, bounty.id as i64],
            )?;
            if superseded > 0 {
                debug!(
                    "Superseded {} stale record(s) for work item {}#{}",
                    superseded, bounty.repository, bounty.issue_id
                );
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn confirm(
        &self,
        bounty_id: BountyId,
        settlement_ref: &str,
        confirmation: &Confirmation,
    ) -> Result<()> {
        let (height, time) = confirmation_columns(confirmation);
        let updated = self.conn.lock().execute(
            "UPDATE reconciliation SET sync_state = 'confirmed', settlement_ref = ?2,
                 confirmation_height = ?3, confirmation_time = ?4, failure_reason = NULL,
                 updated_at = ?5
             WHERE bounty_id = ?1",
            params![
                bounty_id as i64,
                settlement_ref,
                height.map(|h| h as i64),
                time.map(|t| t.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        )?;
        if updated == 0 {
            return Err(anyhow!("no reconciliation record for bounty {}", bounty_id));
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        bounty_id: BountyId,
        reason: &str,
        committed: Option<&Bounty>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        if let Some(bounty) = committed {
            let submission_ref: Option<String> = tx
                .query_row(
                    "SELECT submission_ref FROM reconciliation WHERE bounty_id = ?1",
                    params![bounty_id as i64],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();
            upsert(&tx, bounty, SyncState::Failed, submission_ref.as_deref(), &now)?;
        }
        let updated = tx.execute(
            "UPDATE reconciliation SET sync_state = 'failed', failure_reason = ?2, updated_at = ?3
             WHERE bounty_id = ?1",
            params![bounty_id as i64, reason, now],
        )?;
        tx.commit()?;
        if updated == 0 {
            return Err(anyhow!("no reconciliation record for bounty {}", bounty_id));
        }
        Ok(())
    }

    async fn get(&self, bounty_id: BountyId) -> Result<Option<ReconciliationRecord>> {
        Ok(self
            .query("WHERE bounty_id = ?1", &[&(bounty_id as i64)])?
            .into_iter()
            .next())
    }

    async fn by_work_item(
        &self,
        repository: &str,
        issue_id: u64,
    ) -> Result<Vec<ReconciliationRecord>> {
        let key = dedupe_key(repository, issue_id);
        self.query("WHERE dedupe_key = ?1 ORDER BY bounty_id DESC", &[&key])
    }

    async fn by_creator(
        &self,
        creator: &Principal,
        status: Option<BountyStatus>,
    ) -> Result<Vec<ReconciliationRecord>> {
        match status {
            Some(status) => self.query(
                "WHERE creator = ?1 AND status = ?2 ORDER BY bounty_id",
                &[&creator.as_str(), &status.as_str()],
            ),
            None => self.query("WHERE creator = ?1 ORDER BY bounty_id", &[&creator.as_str()]),
        }
    }

    async fn by_solver(&self, solver: &Principal) -> Result<Vec<ReconciliationRecord>> {
        self.query("WHERE solver = ?1 ORDER BY bounty_id", &[&solver.as_str()])
    }

    async fn rebuild(&self, bounties: &[Bounty]) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM reconciliation", [])?;
        for bounty in bounties {
            upsert(&tx, bounty, SyncState::Confirmed, None, &now)?;
        }
        tx.commit()?;
        info!("Rebuilt reconciliation store with {} bounties", bounties.len());
        Ok(bounties.len())
    }

    async fn highest_bounty_id(&self) -> Result<Option<BountyId>> {
        let conn = self.conn.lock();
        let max: Option<i64> =
            conn.query_row("SELECT MAX(bounty_id) FROM reconciliation", [], |row| row.get(0))?;
        Ok(max.map(|id| id as BountyId))
    }
}
