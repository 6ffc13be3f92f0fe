//! SQLite-backed local store driven through `tokio-rusqlite`.
//!
//! Every operation runs on the connection's dedicated thread and is awaited
//! by the caller. WAL journaling with `synchronous = FULL` means a write has
//! reached disk by the time its future resolves.

use attend_core::{AttendanceKind, AttendanceRecord, Embedding, EmployeeRecord, NewAttendance};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio_rusqlite::Connection;

/// Metadata key holding the server-issued timestamp of the last identity sync.
pub const LAST_SYNC_TIME_KEY: &str = "last_sync_time";
/// Metadata key holding the office description shipped with the last snapshot.
pub const OFFICE_INFO_KEY: &str = "office_info";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS employees (
        employee_code   TEXT PRIMARY KEY,
        id              TEXT NOT NULL,
        name            TEXT NOT NULL,
        face_embeddings TEXT NOT NULL,
        is_active       INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS attendance_queue (
        local_id      INTEGER PRIMARY KEY AUTOINCREMENT,
        employee_code TEXT NOT NULL,
        kind          TEXT NOT NULL,
        timestamp     TEXT NOT NULL,
        confidence    REAL NOT NULL
    );
    CREATE TABLE IF NOT EXISTS sync_metadata (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("persistent storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("database: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("corrupt embedding column: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Handle to the kiosk's local store.
///
/// Cheap to construct; the database is opened lazily by [`open`](Self::open)
/// or by the first operation, whichever comes first. Concurrent callers
/// share a single initialization.
pub struct LocalStore {
    path: PathBuf,
    conn: OnceCell<Connection>,
}

impl fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStore")
            .field("path", &self.path)
            .field("opened", &self.conn.initialized())
            .finish()
    }
}

impl LocalStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            conn: OnceCell::new(),
        }
    }

    /// Construct and open in one step.
    pub async fn open_at(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self::new(path);
        store.open().await?;
        Ok(store)
    }

    /// Volatile store for tests and diagnostics. Nothing survives a restart.
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::open_at(":memory:").await
    }

    /// Initialize the database and schema. Idempotent and safe to race.
    pub async fn open(&self) -> Result<(), StoreError> {
        self.conn().await.map(|_| ())
    }

    /// Close the underlying connection. Later operations fail.
    pub async fn close(&self) -> Result<(), StoreError> {
        if let Some(conn) = self.conn.get() {
            conn.clone().close().await?;
            tracing::info!(path = %self.path.display(), "local store closed");
        }
        Ok(())
    }

    async fn conn(&self) -> Result<&Connection, StoreError> {
        self.conn
            .get_or_try_init(|| Self::connect(self.path.clone()))
            .await
    }

    async fn connect(path: PathBuf) -> Result<Connection, StoreError> {
        let in_memory = path.as_os_str() == ":memory:";
        if !in_memory {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::StorageUnavailable(format!("{}: {e}", parent.display()))
                })?;
            }
        }

        let conn = Connection::open(&path)
            .await
            .map_err(|e| StoreError::StorageUnavailable(format!("{}: {e}", path.display())))?;

        conn.call(|conn| {
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            conn.pragma_update(None, "synchronous", "FULL")?;
            conn.execute_batch(SCHEMA)?;
            tracing::debug!(journal_mode = %mode, "schema ready");
            Ok(())
        })
        .await
        .map_err(|e| StoreError::StorageUnavailable(format!("{}: {e}", path.display())))?;

        tracing::info!(path = %path.display(), "local store opened");
        Ok(conn)
    }

    // --- Employees ---

    /// Atomically replace the whole employee table.
    ///
    /// Readers see either the previous set or the new one. A failure part
    /// way through (e.g. a duplicate employee code) leaves the previous set
    /// untouched.
    pub async fn replace_employees(&self, records: Vec<EmployeeRecord>) -> Result<usize, StoreError> {
        let rows = encode_employees(records)?;
        let count = self
            .conn()
            .await?
            .call(move |conn| {
                let tx = conn.transaction()?;
                let count = write_employees(&tx, &rows)?;
                tx.commit()?;
                Ok(count)
            })
            .await?;
        tracing::debug!(count, "employee table replaced");
        Ok(count)
    }

    /// Replace the employee table and record the server's sync timestamp in
    /// a single transaction.
    pub async fn apply_identity_snapshot(
        &self,
        records: Vec<EmployeeRecord>,
        last_sync_time: String,
        office_info: Option<String>,
    ) -> Result<usize, StoreError> {
        let rows = encode_employees(records)?;
        let count = self
            .conn()
            .await?
            .call(move |conn| {
                let tx = conn.transaction()?;
                let count = write_employees(&tx, &rows)?;
                put_metadata(&tx, LAST_SYNC_TIME_KEY, &last_sync_time)?;
                if let Some(office) = &office_info {
                    put_metadata(&tx, OFFICE_INFO_KEY, office)?;
                }
                tx.commit()?;
                Ok(count)
            })
            .await?;
        tracing::debug!(count, "identity snapshot applied");
        Ok(count)
    }

    pub async fn get_employee(&self, employee_code: &str) -> Result<Option<EmployeeRecord>, StoreError> {
        let code = employee_code.to_string();
        let row = self
            .conn()
            .await?
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT id, employee_code, name, face_embeddings, is_active
                         FROM employees WHERE employee_code = ?1",
                        [&code],
                        employee_row,
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;
        row.map(decode_employee).transpose()
    }

    pub async fn list_employees(&self) -> Result<Vec<EmployeeRecord>, StoreError> {
        let rows = self
            .conn()
            .await?
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, employee_code, name, face_embeddings, is_active
                     FROM employees ORDER BY employee_code",
                )?;
                let rows = stmt
                    .query_map([], employee_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(decode_employee).collect()
    }

    /// Number of cached employees that are valid for kiosk verification.
    pub async fn count_active_employees(&self) -> Result<usize, StoreError> {
        let count = self
            .conn()
            .await?
            .call(|conn| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM employees WHERE is_active = 1",
                    [],
                    |row| row.get(0),
                )?;
                Ok(n as usize)
            })
            .await?;
        Ok(count)
    }

    // --- Attendance outbox ---

    /// Durably append an event; returns its local id once committed.
    pub async fn enqueue_attendance(&self, record: NewAttendance) -> Result<i64, StoreError> {
        let local_id = self
            .conn()
            .await?
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attendance_queue (employee_code, kind, timestamp, confidence)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        record.employee_code,
                        record.kind.as_str(),
                        encode_timestamp(&record.timestamp),
                        record.confidence as f64,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        tracing::debug!(local_id, "attendance queued");
        Ok(local_id)
    }

    /// Pending events, oldest first.
    pub async fn list_pending_attendance(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        let records = self
            .conn()
            .await?
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT local_id, employee_code, kind, timestamp, confidence
                     FROM attendance_queue ORDER BY local_id",
                )?;
                let records = stmt
                    .query_map([], attendance_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(records)
            })
            .await?;
        Ok(records)
    }

    pub async fn count_pending(&self) -> Result<usize, StoreError> {
        let count = self
            .conn()
            .await?
            .call(|conn| {
                let n: i64 =
                    conn.query_row("SELECT COUNT(*) FROM attendance_queue", [], |row| row.get(0))?;
                Ok(n as usize)
            })
            .await?;
        Ok(count)
    }

    /// Remove exactly the given entries. Ids that are no longer queued are
    /// ignored, so retries are harmless. Returns how many rows went away.
    pub async fn remove_attendance(&self, local_ids: &[i64]) -> Result<usize, StoreError> {
        if local_ids.is_empty() {
            return Ok(0);
        }
        let ids = local_ids.to_vec();
        let removed = self
            .conn()
            .await?
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut removed = 0;
                {
                    let mut stmt = tx.prepare("DELETE FROM attendance_queue WHERE local_id = ?1")?;
                    for id in &ids {
                        removed += stmt.execute([id])?;
                    }
                }
                tx.commit()?;
                Ok(removed)
            })
            .await?;
        tracing::debug!(requested = local_ids.len(), removed, "attendance removed");
        Ok(removed)
    }

    // --- Sync metadata ---

    pub async fn get_last_sync_time(&self) -> Result<Option<String>, StoreError> {
        self.get_metadata(LAST_SYNC_TIME_KEY).await
    }

    pub async fn set_last_sync_time(&self, value: &str) -> Result<(), StoreError> {
        self.set_metadata(LAST_SYNC_TIME_KEY, value).await
    }

    pub async fn get_metadata(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        let value = self
            .conn()
            .await?
            .call(move |conn| {
                let value = conn
                    .query_row(
                        "SELECT value FROM sync_metadata WHERE key = ?1",
                        [&key],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(value)
            })
            .await?;
        Ok(value)
    }

    pub async fn set_metadata(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.conn()
            .await?
            .call(move |conn| {
                put_metadata(conn, &key, &value)?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

/// Employee row with embeddings kept as JSON text, the shape that crosses
/// the connection thread boundary in both directions.
struct EmployeeRow {
    id: String,
    employee_code: String,
    name: String,
    face_embeddings: String,
    is_active: bool,
}

fn encode_employees(records: Vec<EmployeeRecord>) -> Result<Vec<EmployeeRow>, StoreError> {
    records
        .into_iter()
        .map(|r| {
            let face_embeddings = serde_json::to_string(&r.face_embeddings)?;
            Ok(EmployeeRow {
                id: r.id,
                employee_code: r.employee_code,
                name: r.name,
                face_embeddings,
                is_active: r.is_active,
            })
        })
        .collect()
}

fn write_employees(conn: &rusqlite::Connection, rows: &[EmployeeRow]) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM employees", [])?;
    let mut stmt = conn.prepare(
        "INSERT INTO employees (employee_code, id, name, face_embeddings, is_active)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for row in rows {
        stmt.execute(params![
            row.employee_code,
            row.id,
            row.name,
            row.face_embeddings,
            row.is_active,
        ])?;
    }
    Ok(rows.len())
}

fn put_metadata(conn: &rusqlite::Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO sync_metadata (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [key, value],
    )?;
    Ok(())
}

fn employee_row(row: &Row<'_>) -> rusqlite::Result<EmployeeRow> {
    Ok(EmployeeRow {
        id: row.get(0)?,
        employee_code: row.get(1)?,
        name: row.get(2)?,
        face_embeddings: row.get(3)?,
        is_active: row.get(4)?,
    })
}

/// Embeddings are decoded off the connection thread so a bad column
/// surfaces as [`StoreError::Corrupt`].
fn decode_employee(row: EmployeeRow) -> Result<EmployeeRecord, StoreError> {
    let face_embeddings: Vec<Embedding> = serde_json::from_str(&row.face_embeddings)?;
    Ok(EmployeeRecord {
        id: row.id,
        employee_code: row.employee_code,
        name: row.name,
        face_embeddings,
        is_active: row.is_active,
    })
}

fn attendance_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    let kind: String = row.get(2)?;
    let kind: AttendanceKind = kind
        .parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    let timestamp: String = row.get(3)?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?
        .with_timezone(&Utc);
    let confidence: f64 = row.get(4)?;
    Ok(AttendanceRecord {
        local_id: row.get(0)?,
        employee_code: row.get(1)?,
        kind,
        timestamp,
        confidence: confidence as f32,
    })
}

fn encode_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}
