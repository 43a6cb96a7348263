use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use opsgraph_core::error::{OpsError, Result};
use opsgraph_core::session::Session;
use opsgraph_core::traits::CheckpointBackend;
use opsgraph_core::types::SessionId;

fn persistence<E: std::fmt::Display>(context: &'static str) -> impl Fn(E) -> OpsError {
    move |e| OpsError::Persistence(format!("{}: {}", context, e))
}

/// Session snapshots in SQLite, one row per session, replaced on every checkpoint.
pub struct SqliteCheckpoints {
    conn: Mutex<Connection>,
}

impl SqliteCheckpoints {
    /// Open or create the checkpoint database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(persistence("failed to create checkpoint directory"))?;
        }
        let conn = Connection::open(path).map_err(persistence("failed to open checkpoint store"))?;
        Self::init(conn)
    }

    /// In-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(persistence("failed to open checkpoint store"))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS sessions (
                 id TEXT PRIMARY KEY,
                 cursor TEXT NOT NULL,
                 revision INTEGER NOT NULL,
                 snapshot TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );",
        )
        .map_err(persistence("failed to initialize checkpoint schema"))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl CheckpointBackend for SqliteCheckpoints {
    fn save(&self, session: &Session) -> Result<()> {
        let snapshot = serde_json::to_string(session).map_err(persistence("failed to serialize session"))?;
        let conn = self.conn.lock().map_err(persistence("checkpoint lock poisoned"))?;
        conn.execute(
            "INSERT INTO sessions (id, cursor, revision, snapshot, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                 cursor = excluded.cursor,
                 revision = excluded.revision,
                 snapshot = excluded.snapshot,
                 updated_at = excluded.updated_at",
            params![
                session.id.as_str(),
                session.cursor.to_string(),
                session.revision as i64,
                snapshot,
                session.updated_at.to_rfc3339(),
            ],
        )
        .map_err(persistence("failed to save checkpoint"))?;
        Ok(())
    }

    fn load(&self, id: &SessionId) -> Result<Option<Session>> {
        let conn = self.conn.lock().map_err(persistence("checkpoint lock poisoned"))?;
        let snapshot: Option<String> = conn
            .query_row(
                "SELECT snapshot FROM sessions WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(persistence("failed to load checkpoint"))?;

        snapshot
            .map(|json| serde_json::from_str(&json).map_err(persistence("corrupt checkpoint")))
            .transpose()
    }

    fn list(&self) -> Result<Vec<SessionId>> {
        let conn = self.conn.lock().map_err(persistence("checkpoint lock poisoned"))?;
        let mut stmt = conn
            .prepare("SELECT id FROM sessions ORDER BY updated_at DESC")
            .map_err(persistence("failed to prepare query"))?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(persistence("failed to list sessions"))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(persistence("failed to list sessions"))?;
        Ok(ids.into_iter().map(SessionId).collect())
    }
}

/// Process-local snapshots, for tests and `--ephemeral` runs.
#[derive(Default)]
pub struct MemoryCheckpoints {
    snapshots: Mutex<HashMap<SessionId, Session>>,
}

impl MemoryCheckpoints {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointBackend for MemoryCheckpoints {
    fn save(&self, session: &Session) -> Result<()> {
        self.snapshots
            .lock()
            .map_err(persistence("checkpoint lock poisoned"))?
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    fn load(&self, id: &SessionId) -> Result<Option<Session>> {
        Ok(self
            .snapshots
            .lock()
            .map_err(persistence("checkpoint lock poisoned"))?
            .get(id)
            .cloned())
    }

    fn list(&self) -> Result<Vec<SessionId>> {
        let mut ids: Vec<SessionId> = self
            .snapshots
            .lock()
            .map_err(persistence("checkpoint lock poisoned"))?
            .keys()
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }
}
