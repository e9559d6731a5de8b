//! PostgreSQL reconciliation storage
//!
//! Server-mode projection store. Connects with DATABASE_URL.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Pool, Runtime};
use tokio_postgres::{NoTls, Row};
use tracing::{debug, info};

use crate::rail::Confirmation;
use crate::reconciliation::{
    confirmation_columns, ReconciliationRecord, ReconciliationStore, SyncState,
};
use crate::types::{dedupe_key, Amount, Bounty, BountyId, BountyStatus, Principal};

/// Database pool configuration
const DB_POOL_MAX_SIZE: usize = 16;
const DB_QUERY_TIMEOUT_SECS: u64 = 30;

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
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, NOW())
ON CONFLICT (bounty_id) DO UPDATE SET
    dedupe_key = EXCLUDED.dedupe_key,
    repository = EXCLUDED.repository,
    issue_id = EXCLUDED.issue_id,
    issue_url = EXCLUDED.issue_url,
    creator = EXCLUDED.creator,
    solver = EXCLUDED.solver,
    solver_identity = EXCLUDED.solver_identity,
    pull_request_url = EXCLUDED.pull_request_url,
    initial_amount = EXCLUDED.initial_amount,
    current_amount = EXCLUDED.current_amount,
    max_amount = EXCLUDED.max_amount,
    status = EXCLUDED.status,
    created_at = EXCLUDED.created_at,
    claimed_at = EXCLUDED.claimed_at,
    closed_at = EXCLUDED.closed_at,
    expires_at = EXCLUDED.expires_at,
    escalation_count = EXCLUDED.escalation_count,
    sync_state = EXCLUDED.sync_state,
    submission_ref = EXCLUDED.submission_ref,
    settlement_ref = NULL,
    confirmation_height = NULL,
    confirmation_time = NULL,
    failure_reason = NULL,
    updated_at = NOW()
"#;

#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Create storage from DATABASE_URL
    pub async fn new(database_url: &str) -> Result<Self> {
        use deadpool_postgres::{ManagerConfig, PoolConfig, RecyclingMethod};
        use std::time::Duration;

        let mut config = Config::new();
        config.url = Some(database_url.to_string());

        config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        config.pool = Some(PoolConfig {
            max_size: DB_POOL_MAX_SIZE,
            timeouts: deadpool_postgres::Timeouts {
                wait: Some(Duration::from_secs(DB_QUERY_TIMEOUT_SECS)),
                create: Some(Duration::from_secs(10)),
                recycle: Some(Duration::from_secs(30)),
            },
            ..Default::default()
        });

        let pool = config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .context("Failed to create PostgreSQL pool")?;

        // Test connection
        let client = pool.get().await?;
        client
            .execute(
                &format!("SET statement_timeout = '{}s'", DB_QUERY_TIMEOUT_SECS),
                &[],
            )
            .await?;

        info!(
            "Connected to PostgreSQL (pool_size: {}, query_timeout: {}s)",
            DB_POOL_MAX_SIZE, DB_QUERY_TIMEOUT_SECS
        );

        let store = Self { pool };
        store.run_migrations().await?;

        Ok(store)
    }

    /// Create storage from DATABASE_URL environment variable
    pub async fn from_env() -> Result<Self> {
        let url = std::env::var("DATABASE_URL").map_err(|_| anyhow!("DATABASE_URL not set"))?;
        Self::new(&url).await
    }

    /// Run embedded migrations
    async fn run_migrations(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                     version INTEGER PRIMARY KEY,
                     applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                 )",
            )
            .await?;

        let applied: bool = client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE version = 1)",
                &[],
            )
            .await?
            .get(0);

        if !applied {
            let migration_sql = include_str!("../migrations/001_reconciliation.sql");
            client.batch_execute(migration_sql).await?;
            info!("Applied migration 001_reconciliation");
        }
        Ok(())
    }

    async fn query(
        &self,
        filter: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Vec<ReconciliationRecord>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(&format!("{} {}", SELECT_COLUMNS, filter), params)
            .await?;
        rows.iter().map(record_from_row).collect()
    }
}

async fn upsert(
    tx: &tokio_postgres::Transaction<'_>,
    bounty: &Bounty,
    sync_state: SyncState,
    submission_ref: Option<&str>,
) -> Result<u64> {
    let initial = bounty.initial_amount.to_string();
    let current = bounty.current_amount.to_string();
    let max = bounty.max_amount.to_string();
    let solver = bounty.solver.as_ref().map(|p| p.as_str());
    let claimed_at = bounty.claimed_at.map(|t| t as i64);
    let closed_at = bounty.closed_at.map(|t| t as i64);

    Ok(tx
        .execute(
            UPSERT,
            &[
                &(bounty.id as i64),
                &bounty.dedupe_key,
                &bounty.repository,
                &(bounty.issue_id as i64),
                &bounty.issue_url,
                &bounty.creator.as_str(),
                &solver,
                &bounty.solver_identity,
                &bounty.pull_request_url,
                &initial,
                &current,
                &max,
                &bounty.status.as_str(),
                &(bounty.created_at as i64),
                &claimed_at,
                &closed_at,
                &(bounty.expires_at as i64),
                &(bounty.escalation_count as i32),
                &sync_state.as_str(),
                &submission_ref,
            ],
        )
        .await?)
}

fn amount_column(row: &Row, column: &str) -> Result<Amount> {
    let raw: String = row.try_get(column)?;
    raw.parse()
        .with_context(|| format!("invalid {} '{}'", column, raw))
}

fn record_from_row(row: &Row) -> Result<ReconciliationRecord> {
    let status: String = row.try_get("status")?;
    let sync_state: String = row.try_get("sync_state")?;

    Ok(ReconciliationRecord {
        bounty: Bounty {
            id: row.try_get::<_, i64>("bounty_id")? as BountyId,
            dedupe_key: row.try_get("dedupe_key")?,
            repository: row.try_get("repository")?,
            issue_id: row.try_get::<_, i64>("issue_id")? as u64,
            issue_url: row.try_get("issue_url")?,
            creator: Principal::new(row.try_get::<_, String>("creator")?),
            solver: row
                .try_get::<_, Option<String>>("solver")?
                .map(Principal::new),
            solver_identity: row.try_get("solver_identity")?,
            pull_request_url: row.try_get("pull_request_url")?,
            initial_amount: amount_column(row, "initial_amount")?,
            current_amount: amount_column(row, "current_amount")?,
            max_amount: amount_column(row, "max_amount")?,
            status: BountyStatus::parse(&status)
                .ok_or_else(|| anyhow!("unknown status '{}'", status))?,
            created_at: row.try_get::<_, i64>("created_at")? as u64,
            claimed_at: row
                .try_get::<_, Option<i64>>("claimed_at")?
                .map(|t| t as u64),
            closed_at: row
                .try_get::<_, Option<i64>>("closed_at")?
                .map(|t| t as u64),
            expires_at: row.try_get::<_, i64>("expires_at")? as u64,
            escalation_count: row.try_get::<_, i32>("escalation_count")? as u32,
        },
        sync_state: SyncState::parse(&sync_state)
            .ok_or_else(|| anyhow!("unknown sync state '{}'", sync_state))?,
        submission_ref: row.try_get("submission_ref")?,
        settlement_ref: row.try_get("settlement_ref")?,
        confirmation_height: row
            .try_get::<_, Option<i64>>("confirmation_height")?
            .map(|h| h as u64),
        confirmation_time: row.try_get::<_, Option<DateTime<Utc>>>("confirmation_time")?,
        failure_reason: row.try_get("failure_reason")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl ReconciliationStore for PgStore {
    async fn record_pending(&self, bounty: &Bounty, submission_ref: &str) -> Result<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        upsert(&tx, bounty, SyncState::Pending, Some(submission_ref)).await?;
        if bounty.is_active() {
            let superseded = tx
                .execute(
                    "UPDATE reconciliation SET sync_state = 'superseded', updated_at = NOW()
                     WHERE dedupe_key = $1 AND bounty_id <> $2
                       AND sync_state IN ('pending', 'failed')",
                    &[&bounty.dedupe_key, &(bounty.id as i64)],
                )
                .await?;
            if superseded > 0 {
                debug!(
                    "Superseded {} stale record(s) for work item {}#{}",
                    superseded, bounty.repository, bounty.issue_id
                );
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn confirm(
        &self,
        bounty_id: BountyId,
        settlement_ref: &str,
        confirmation: &Confirmation,
    ) -> Result<()> {
        let (height, time) = confirmation_columns(confirmation);
        let height = height.map(|h| h as i64);
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE reconciliation SET sync_state = 'confirmed', settlement_ref = $2,
                     confirmation_height = $3, confirmation_time = $4, failure_reason = NULL,
                     updated_at = NOW()
                 WHERE bounty_id = $1",
                &[&(bounty_id as i64), &settlement_ref, &height, &time],
            )
            .await?;
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
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        if let Some(bounty) = committed {
            let submission_ref: Option<String> = tx
                .query_opt(
                    "SELECT submission_ref FROM reconciliation WHERE bounty_id = $1",
                    &[&(bounty_id as i64)],
                )
                .await?
                .map(|row| row.try_get::<_, Option<String>>(0))
                .transpose()?
                .flatten();
            upsert(&tx, bounty, SyncState::Failed, submission_ref.as_deref()).await?;
        }
        let updated = tx
            .execute(
                "UPDATE reconciliation SET sync_state = 'failed', failure_reason = $2,
                     updated_at = NOW()
                 WHERE bounty_id = $1",
                &[&(bounty_id as i64), &reason],
            )
            .await?;
        tx.commit().await?;
        if updated == 0 {
            return Err(anyhow!("no reconciliation record for bounty {}", bounty_id));
        }
        Ok(())
    }

    async fn get(&self, bounty_id: BountyId) -> Result<Option<ReconciliationRecord>> {
        Ok(self
            .query("WHERE bounty_id = $1", &[&(bounty_id as i64)])
            .await?
            .into_iter()
            .next())
    }

    async fn by_work_item(
        &self,
        repository: &str,
        issue_id: u64,
    ) -> Result<Vec<ReconciliationRecord>> {
        let key = dedupe_key(repository, issue_id);
        self.query("WHERE dedupe_key = $1 ORDER BY bounty_id DESC", &[&key])
            .await
    }

    async fn by_creator(
        &self,
        creator: &Principal,
        status: Option<BountyStatus>,
    ) -> Result<Vec<ReconciliationRecord>> {
        match status {
            Some(status) => {
                self.query(
                    "WHERE creator = $1 AND status = $2 ORDER BY bounty_id",
                    &[&creator.as_str(), &status.as_str()],
                )
                .await
            }
            None => {
                self.query("WHERE creator = $1 ORDER BY bounty_id", &[&creator.as_str()])
                    .await
            }
        }
    }

    async fn by_solver(&self, solver: &Principal) -> Result<Vec<ReconciliationRecord>> {
        self.query("WHERE solver = $1 ORDER BY bounty_id", &[&solver.as_str()])
            .await
    }

    async fn rebuild(&self, bounties: &[Bounty]) -> Result<usize> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        tx.execute("DELETE FROM reconciliation", &[]).await?;
        for bounty in bounties {
            upsert(&tx, bounty, SyncState::Confirmed, None).await?;
        }
        tx.commit().await?;
        info!("Rebuilt reconciliation store with {} bounties", bounties.len());
        Ok(bounties.len())
    }

    async fn highest_bounty_id(&self) -> Result<Option<BountyId>> {
        let client = self.pool.get().await?;
        let row = client
            .query_one("SELECT MAX(bounty_id) FROM reconciliation", &[])
            .await?;
        let max: Option<i64> = row.get(0);
        Ok(max.map(|id| id as BountyId))
    }
}
