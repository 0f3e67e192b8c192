//! SQLite-backed job store
//!
//! All statements from one store run on tokio-rusqlite's single background
//! thread. Several processes may open the same file; every write takes the
//! database lock up front (`BEGIN IMMEDIATE`) and waits out a busy peer, so a
//! check-then-write never interleaves with another process.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use labdash_shared::JobRecord;
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use tokio_rusqlite::Connection;

use super::{abandon, Claim, JobStore};
use crate::error::StoreError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id          TEXT PRIMARY KEY,
    status      TEXT NOT NULL,
    expires_at  INTEGER,
    owner       TEXT,
    lease_until INTEGER,
    record      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS jobs_expires_at ON jobs (expires_at);
";

/// How long a statement waits on another process holding the lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

fn map_tr_err(e: tokio_rusqlite::Error<rusqlite::Error>) -> StoreError {
    StoreError::Database(e.to_string())
}

fn write_tx(conn: &mut rusqlite::Connection) -> rusqlite::Result<Transaction<'_>> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
}

/// Column values of one record, serialized outside the database thread
struct Row {
    id: String,
    status: &'static str,
    expires_at: Option<i64>,
    owner: Option<String>,
    lease_until: Option<i64>,
    json: String,
}

impl Row {
    fn new(record: &JobRecord) -> Result<Self, StoreError> {
        Ok(Self {
            id: record.id.clone(),
            status: record.status().as_str(),
            expires_at: record.expires_at_ms().map(|ms| ms as i64),
            owner: record.owner.clone(),
            lease_until: record.lease_until_ms.map(|ms| ms as i64),
            json: serde_json::to_string(record)?,
        })
    }
}

/// Durable job store in a SQLite file
#[derive(Clone)]
pub struct SqliteJobStore {
    conn: Arc<Connection>,
}

impl SqliteJobStore {
    /// Open (creating if needed) the store at `path`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Self::init(conn).await
    }

    /// Open a private in-memory database
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            let tx = write_tx(conn)?;
            tx.execute_batch(SCHEMA)?;
            tx.commit()?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)?;

        Ok(Self {
            conn: Arc::new(conn),
        })
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn get(&self, id: &str) -> Result<Option<JobRecord>, StoreError> {
        let id = id.to_string();
        let raw: Option<String> = self
            .conn
            .call(move |conn| {
                let raw = conn
                    .query_row(
                        "SELECT record FROM jobs WHERE id = ?1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(raw)
            })
            .await
            .map_err(map_tr_err)?;

        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, record: &JobRecord) -> Result<(), StoreError> {
        let row = Row::new(record)?;

        self.conn
            .call(move |conn| {
                let tx = write_tx(conn)?;
                tx.execute(
                    "INSERT OR REPLACE INTO jobs (id, status, expires_at, owner, lease_until, record)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![row.id, row.status, row.expires_at, row.owner, row.lease_until, row.json],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)
    }

    async fn claim(&self, record: &JobRecord, now_ms: u64) -> Result<Claim, StoreError> {
        let row = Row::new(record)?;
        let now = now_ms as i64;

        let held: Option<String> = self
            .conn
            .call(move |conn| {
                let tx = write_tx(conn)?;
                let written = tx.execute(
                    "INSERT INTO jobs (id, status, expires_at, owner, lease_until, record)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT (id) DO UPDATE SET
                         status = excluded.status,
                         expires_at = excluded.expires_at,
                         owner = excluded.owner,
                         lease_until = excluded.lease_until,
                         record = excluded.record
                     WHERE (jobs.expires_at IS NOT NULL AND jobs.expires_at <= ?7)
                        OR (jobs.status IN ('queued', 'running')
                            AND (jobs.lease_until IS NULL OR jobs.lease_until <= ?7))",
                    params![
                        row.id,
                        row.status,
                        row.expires_at,
                        row.owner,
                        row.lease_until,
                        row.json,
                        now
                    ],
                )?;
                let held = if written == 0 {
                    Some(tx.query_row(
                        "SELECT record FROM jobs WHERE id = ?1",
                        params![row.id],
                        |r| r.get::<_, String>(0),
                    )?)
                } else {
                    None
                };
                tx.commit()?;
                Ok(held)
            })
            .await
            .map_err(map_tr_err)?;

        match held {
            Some(json) => Ok(Claim::Held(serde_json::from_str(&json)?)),
            None => Ok(Claim::Acquired),
        }
    }

    async fn update_owned(&self, record: &JobRecord) -> Result<bool, StoreError> {
        let row = Row::new(record)?;

        self.conn
            .call(move |conn| {
                let tx = write_tx(conn)?;
                let written = tx.execute(
                    "UPDATE jobs SET status = ?2, expires_at = ?3, lease_until = ?5, record = ?6
                     WHERE id = ?1 AND owner IS ?4 AND status IN ('queued', 'running')",
                    params![row.id, row.status, row.expires_at, row.owner, row.lease_until, row.json],
                )?;
                tx.commit()?;
                Ok(written > 0)
            })
            .await
            .map_err(map_tr_err)
    }

    async fn renew_leases(
        &self,
        owner: &str,
        ids: &[String],
        until_ms: u64,
    ) -> Result<usize, StoreError> {
        let owner = owner.to_string();
        let ids = ids.to_vec();
        let until = until_ms as i64;

        self.conn
            .call(move |conn| {
                let tx = write_tx(conn)?;
                let mut renewed = 0;
                {
                    let mut stmt = tx.prepare(
                        "UPDATE jobs
                         SET lease_until = ?1, record = json_set(record, '$.lease_until_ms', ?1)
                         WHERE id = ?2 AND owner = ?3 AND status IN ('queued', 'running')",
                    )?;
                    for id in &ids {
                        renewed += stmt.execute(params![until, id, owner])?;
                    }
                }
                tx.commit()?;
                Ok(renewed)
            })
            .await
            .map_err(map_tr_err)
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let tx = write_tx(conn)?;
                let removed = tx.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
                tx.commit()?;
                Ok(removed > 0)
            })
            .await
            .map_err(map_tr_err)
    }

    async fn purge_expired(&self, now_ms: u64) -> Result<Vec<String>, StoreError> {
        let now = now_ms as i64;
        self.conn
            .call(move |conn| {
                let tx = write_tx(conn)?;
                let expired = {
                    let mut stmt = tx.prepare(
                        "SELECT id FROM jobs
                         WHERE expires_at IS NOT NULL AND expires_at <= ?1
                         ORDER BY id",
                    )?;
                    let ids = stmt
                        .query_map(params![now], |row| row.get::<_, String>(0))?
                        .collect::<Result<Vec<_>, _>>()?;
                    ids
                };
                tx.execute(
                    "DELETE FROM jobs WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                    params![now],
                )?;
                tx.commit()?;
                Ok(expired)
            })
            .await
            .map_err(map_tr_err)
    }

    async fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
        let rows: Vec<String> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT record FROM jobs ORDER BY id")?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(map_tr_err)?;

        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .collect()
    }

    async fn recover_abandoned(&self, now_ms: u64) -> Result<Vec<String>, StoreError> {
        let now = now_ms as i64;
        let lapsed: Vec<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT record FROM jobs
                     WHERE status IN ('queued', 'running')
                       AND (lease_until IS NULL OR lease_until <= ?1)
                     ORDER BY id",
                )?;
                let rows = stmt
                    .query_map(params![now], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(map_tr_err)?;

        let mut rows = Vec::with_capacity(lapsed.len());
        for json in &lapsed {
            let mut record: JobRecord = serde_json::from_str(json)?;
            if abandon(&mut record, now_ms) {
                rows.push(Row::new(&record)?);
            }
        }

        // Re-checked under the lock: a lease renewed since the read wins
        self.conn
            .call(move |conn| {
                let tx = write_tx(conn)?;
                let mut recovered = Vec::new();
                {
                    let mut stmt = tx.prepare(
                        "UPDATE jobs SET status = ?2, expires_at = ?3, record = ?4
                         WHERE id = ?1 AND status IN ('queued', 'running')
                           AND (lease_until IS NULL OR lease_until <= ?5)",
                    )?;
                    for row in rows {
                        let written =
                            stmt.execute(params![row.id, row.status, row.expires_at, row.json, now])?;
                        if written > 0 {
                            recovered.push(row.id);
                        }
                    }
                }
                tx.commit()?;
                Ok(recovered)
            })
            .await
            .map_err(map_tr_err)
    }
}
