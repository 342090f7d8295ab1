//! SQLite persistence for identities, their embeddings and attendance rows.
//!
//! All statements run on tokio-rusqlite's dedicated connection thread, so
//! callers only ever await; nothing here blocks the runtime.

use chrono::{DateTime, NaiveDate, Utc};
use roster_core::{AttendanceEvent, Embedding, Identity};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),

    #[error("cannot prepare database directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("external id {0} is already enrolled")]
    DuplicateExternalId(String),

    #[error("identity {0} not found")]
    IdentityNotFound(i64),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS identities (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    external_id TEXT UNIQUE,
    role        TEXT NOT NULL DEFAULT 'staff',
    is_active   INTEGER NOT NULL DEFAULT 1,
    created_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS embeddings (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id INTEGER NOT NULL REFERENCES identities(id),
    dim         INTEGER NOT NULL,
    vector      BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_embeddings_identity ON embeddings(identity_id);
CREATE TABLE IF NOT EXISTS attendance (
    id          TEXT PRIMARY KEY,
    identity_id INTEGER NOT NULL REFERENCES identities(id),
    camera_id   TEXT NOT NULL,
    method      TEXT NOT NULL,
    confidence  REAL NOT NULL,
    timestamp   TEXT NOT NULL,
    date        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance(date);
CREATE INDEX IF NOT EXISTS idx_attendance_timestamp ON attendance(timestamp);
"#;

/// Fields supplied when enrolling a new identity.
#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub name: String,
    pub external_id: Option<String>,
    pub role: String,
}

/// One line of the recent-attendance listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRow {
    pub person_name: String,
    pub employee_id: Option<String>,
    pub date: String,
    pub time: String,
    pub method: String,
}

#[derive(Clone)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database file, creating parent directories.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let conn = Connection::open(path).await?;
        conn.call(|c| {
            c.pragma_update(None, "journal_mode", "WAL")?;
            c.busy_timeout(std::time::Duration::from_secs(5))?;
            Ok(())
        })
        .await?;
        let store = Self { conn };
        store.migrate().await?;
        tracing::info!(path = %path.display(), "database opened");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        self.conn
            .call(|c| {
                c.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Liveness probe for the health endpoint.
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.conn
            .call(|c| {
                c.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Insert an identity together with its first embedding in one transaction.
    pub async fn enroll_identity(
        &self,
        new: NewIdentity,
        embedding: &Embedding,
        now: DateTime<Utc>,
    ) -> Result<Identity, StoreError> {
        let vector = embedding.to_le_bytes();
        let dim = embedding.dim() as i64;
        let created_at = now.to_rfc3339();

        let outcome = self
            .conn
            .call(move |c| {
                let tx = c.transaction()?;
                if let Some(ext) = &new.external_id {
                    let existing: Option<i64> = tx
                        .query_row(
                            "SELECT id FROM identities WHERE external_id = ?1",
                            params![ext],
                            |r| r.get(0),
                        )
                        .optional()?;
                    if existing.is_some() {
                        return Ok(Err(StoreError::DuplicateExternalId(ext.clone())));
                    }
                }
                tx.execute(
                    "INSERT INTO identities (name, external_id, role, is_active, created_at)
                     VALUES (?1, ?2, ?3, 1, ?4)",
                    params![new.name, new.external_id, new.role, created_at],
                )?;
                let id = tx.last_insert_rowid();
                tx.execute(
                    "INSERT INTO embeddings (identity_id, dim, vector) VALUES (?1, ?2, ?3)",
                    params![id, dim, vector],
                )?;
                tx.commit()?;
                Ok(Ok(Identity {
                    id,
                    name: new.name,
                    external_id: new.external_id,
                    role: new.role,
                    is_active: true,
                    created_at: now,
                }))
            })
            .await??;

        tracing::info!(identity_id = outcome.id, name = %outcome.name, "identity enrolled");
        Ok(outcome)
    }

    /// Attach a further embedding to an existing identity.
    pub async fn add_embedding(&self, identity_id: i64, embedding: &Embedding) -> Result<i64, StoreError> {
        let vector = embedding.to_le_bytes();
        let dim = embedding.dim() as i64;
        self.conn
            .call(move |c| {
                let exists: Option<i64> = c
                    .query_row("SELECT id FROM identities WHERE id = ?1", params![identity_id], |r| {
                        r.get(0)
                    })
                    .optional()?;
                if exists.is_none() {
                    return Ok(Err(StoreError::IdentityNotFound(identity_id)));
                }
                c.execute(
                    "INSERT INTO embeddings (identity_id, dim, vector) VALUES (?1, ?2, ?3)",
                    params![identity_id, dim, vector],
                )?;
                Ok(Ok(c.last_insert_rowid()))
            })
            .await?
    }

    /// Every embedding of every active identity, in insertion order.
    pub async fn load_embeddings(&self) -> Result<Vec<(i64, Embedding)>, StoreError> {
        let rows = self
            .conn
            .call(|c| {
                let mut stmt = c.prepare(
                    "SELECT e.identity_id, e.vector FROM embeddings e
                     JOIN identities i ON i.id = e.identity_id
                     WHERE i.is_active = 1
                     ORDER BY e.id",
                )?;
                let rows = stmt
                    .query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, Vec<u8>>(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows
            .into_iter()
            .map(|(id, bytes)| (id, Embedding::from_le_bytes(&bytes)))
            .collect())
    }

    pub async fn identity(&self, id: i64) -> Result<Option<Identity>, StoreError> {
        let row = self
            .conn
            .call(move |c| {
                let row = c
                    .query_row(
                        "SELECT id, name, external_id, role, is_active, created_at
                         FROM identities WHERE id = ?1",
                        params![id],
                        |r| {
                            Ok((
                                r.get::<_, i64>(0)?,
                                r.get::<_, String>(1)?,
                                r.get::<_, Option<String>>(2)?,
                                r.get::<_, String>(3)?,
                                r.get::<_, bool>(4)?,
                                r.get::<_, String>(5)?,
                            ))
                        },
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;

        row.map(|(id, name, external_id, role, is_active, created_at)| -> Result<Identity, StoreError> {
            Ok(Identity {
                id,
                name,
                external_id,
                role,
                is_active,
                created_at: parse_timestamp(&created_at)?,
            })
        })
        .transpose()
    }

    pub async fn count_identities(&self) -> Result<u64, StoreError> {
        let n = self
            .conn
            .call(|c| Ok(c.query_row("SELECT COUNT(*) FROM identities", [], |r| r.get::<_, i64>(0))?))
            .await?;
        Ok(n.max(0) as u64)
    }

    pub async fn count_attendance_on(&self, date: NaiveDate) -> Result<u64, StoreError> {
        let date = date.format("%Y-%m-%d").to_string();
        let n = self
            .conn
            .call(move |c| {
                Ok(c.query_row(
                    "SELECT COUNT(*) FROM attendance WHERE date = ?1",
                    params![date],
                    |r| r.get::<_, i64>(0),
                )?)
            })
            .await?;
        Ok(n.max(0) as u64)
    }

    /// Append one attendance row. No uniqueness beyond the event id is enforced.
    pub async fn insert_attendance(&self, event: &AttendanceEvent) -> Result<(), StoreError> {
        let id = event.id.to_string();
        let identity_id = event.identity_id;
        let camera_id = event.camera_id.clone();
        let method = event.method.as_str();
        let confidence = f64::from(event.confidence);
        let timestamp = event.timestamp.to_rfc3339();
        let date = event.date().format("%Y-%m-%d").to_string();

        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO attendance (id, identity_id, camera_id, method, confidence, timestamp, date)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![id, identity_id, camera_id, method, confidence, timestamp, date],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Most recent attendance rows, newest first.
    pub async fn recent_attendance(&self, limit: usize) -> Result<Vec<AttendanceRow>, StoreError> {
        let limit = limit as i64;
        let rows = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(
                    "SELECT i.name, i.external_id, a.timestamp, a.method FROM attendance a
                     JOIN identities i ON i.id = a.identity_id
                     ORDER BY a.timestamp DESC
                     LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(params![limit], |r| {
                        Ok((
                            r.get::<_, String>(0)?,
                            r.get::<_, Option<String>>(1)?,
                            r.get::<_, String>(2)?,
                            r.get::<_, String>(3)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(person_name, employee_id, timestamp, method)| -> Result<AttendanceRow, StoreError> {
                let ts = parse_timestamp(&timestamp)?;
                Ok(AttendanceRow {
                    person_name,
                    employee_id,
                    date: ts.format("%Y-%m-%d").to_string(),
                    time: ts.format("%H:%M:%S").to_string(),
                    method,
                })
            })
            .collect()
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {s:?}: {e}")))
}
