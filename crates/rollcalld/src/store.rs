//! SQLite persistence: enrolled identities, reference embeddings and
//! committed attendance records.

use chrono::Utc;
use rollcall_core::{
    AttendanceRecord, Embedding, EnrolledIdentity, IdentityId, RecordStore, RecordStoreError,
};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    identity_id  TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    consent      INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS embeddings (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id TEXT NOT NULL REFERENCES identities(identity_id) ON DELETE CASCADE,
    vector      TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS attendance (
    record_id      TEXT PRIMARY KEY,
    identity_id    TEXT NOT NULL,
    context        TEXT NOT NULL,
    timestamp      TEXT NOT NULL,
    status         TEXT NOT NULL,
    capture_method TEXT NOT NULL
);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("embedding encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("failed to create data directory: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Upsert an identity and add one reference embedding, atomically.
    ///
    /// Re-enrolling an existing id updates its name and consent flag and
    /// keeps earlier references.
    pub fn enroll(
        &self,
        id: &IdentityId,
        display_name: &str,
        consent: bool,
        embedding: &Embedding,
    ) -> Result<(), StoreError> {
        let vector = serde_json::to_string(&embedding.values)?;
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO identities (identity_id, display_name, consent) VALUES (?1, ?2, ?3)
             ON CONFLICT(identity_id) DO UPDATE SET display_name = excluded.display_name,
                                                    consent = excluded.consent",
            params![id.as_str(), display_name, consent],
        )?;
        tx.execute(
            "INSERT INTO embeddings (identity_id, vector, created_at) VALUES (?1, ?2, ?3)",
            params![id.as_str(), vector, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// One row per reference embedding; identities without any get one row with `None`.
    pub fn load_identities(&self) -> Result<Vec<EnrolledIdentity>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT i.identity_id, i.display_name, i.consent, e.vector
             FROM identities i LEFT JOIN embeddings e ON e.identity_id = i.identity_id
             ORDER BY i.identity_id, e.id",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        let mut identities = Vec::new();
        for row in rows {
            let (id, display_name, consent, vector) = row?;
            let embedding = match vector.map(|v| serde_json::from_str::<Vec<f32>>(&v)) {
                Some(Ok(values)) => Some(Embedding::new(values)),
                Some(Err(e)) => {
                    tracing::warn!(identity = %id, error = %e, "unreadable embedding skipped");
                    None
                }
                None => None,
            };
            identities.push(EnrolledIdentity {
                identity_id: IdentityId::new(id),
                display_name,
                consent,
                embedding,
            });
        }
        Ok(identities)
    }

    pub fn attendance_count(&self, context: &str) -> Result<usize, StoreError> {
        let n: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM attendance WHERE context = ?1",
            params![context],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    fn insert_records(&self, records: &[AttendanceRecord]) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO attendance (record_id, identity_id, context, timestamp, status, capture_method)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for r in records {
                stmt.execute(params![
                    r.record_id.to_string(),
                    r.identity_id.as_str(),
                    r.context.as_str(),
                    r.timestamp.to_rfc3339(),
                    r.status.as_str(),
                    r.capture_method.as_str(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

impl RecordStore for Store {
    fn save(&self, records: &[AttendanceRecord]) -> Result<(), RecordStoreError> {
        self.insert_records(records)
            .map_err(|e| RecordStoreError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{AttendanceStatus, CaptureMethod, SessionContext, EMBEDDING_DIM};
    use uuid::Uuid;

    #[test]
    fn test_identities_round_trip_with_references() {
        let store = Store::open_in_memory().unwrap();
        let a = IdentityId::from("a");
        store.enroll(&a, "Ada", true, &Embedding::new(vec![0.1; EMBEDDING_DIM])).unwrap();
        store.enroll(&a, "Ada", true, &Embedding::new(vec![0.2; EMBEDDING_DIM])).unwrap();
        store.enroll(&"b".into(), "Bo", false, &Embedding::new(vec![0.3; EMBEDDING_DIM])).unwrap();

        let rows = store.load_identities().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows.iter().filter(|r| r.identity_id == a).count(), 2);
        let b = rows.iter().find(|r| r.identity_id.as_str() == "b").unwrap();
        assert!(!b.consent);
        assert!(b.embedding.is_some());
    }

    #[test]
    fn test_reenroll_updates_consent() {
        let store = Store::open_in_memory().unwrap();
        let id = IdentityId::from("x");
        let e = Embedding::new(vec![0.1; EMBEDDING_DIM]);
        store.enroll(&id, "X", false, &e).unwrap();
        store.enroll(&id, "Xavier", true, &e).unwrap();

        let rows = store.load_identities().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.consent && r.display_name == "Xavier"));
    }

    #[test]
    fn test_enroll_is_atomic() {
        let store = Store::open_in_memory().unwrap();
        store.conn().execute_batch("DROP TABLE embeddings;").unwrap();

        let e = Embedding::new(vec![0.1; EMBEDDING_DIM]);
        assert!(store.enroll(&"ghost".into(), "Ghost", true, &e).is_err());

        let n: i64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_save_is_atomic() {
        let store = Store::open_in_memory().unwrap();
        let record = AttendanceRecord {
            record_id: Uuid::new_v4(),
            identity_id: "a".into(),
            context: SessionContext::new("CS-101").unwrap(),
            timestamp: Utc::now(),
            status: AttendanceStatus::Present,
            capture_method: CaptureMethod::Automatic,
        };
        store.save(&[record.clone()]).unwrap();
        assert_eq!(store.attendance_count("CS-101").unwrap(), 1);

        // Duplicate primary key in the batch: nothing from it lands.
        let fresh = AttendanceRecord { record_id: Uuid::new_v4(), ..record.clone() };
        assert!(store.save(&[fresh, record]).is_err());
        assert_eq!(store.attendance_count("CS-101").unwrap(), 1);
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/rollcall.db");
        let store = Store::open(&path).unwrap();
        store.enroll(&"a".into(), "A", true, &Embedding::new(vec![0.0; EMBEDDING_DIM])).unwrap();
        assert!(path.exists());
    }
}
