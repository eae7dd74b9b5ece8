use super::SessionBackend;
use crate::error::{FairSlotError, Result};
use crate::session::Session;
use crate::types::Address;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::Path;
use tokio::sync::Mutex;

/// SQLite persistence for sessions, one JSON row per contract address.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    pub async fn new(db_path: &Path) -> Result<Self> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                FairSlotError::internal(format!("Failed to create directory: {}", e))
            })?;
        }

        let conn = Connection::open(db_path)?;
        let backend = Self {
            conn: Mutex::new(conn),
        };

        backend.init_schema().await?;
        Ok(backend)
    }

    pub async fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let backend = Self {
            conn: Mutex::new(conn),
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    async fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().await;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                address TEXT PRIMARY KEY,
                role TEXT NOT NULL,
                state TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        Ok(())
    }
}

#[async_trait]
impl SessionBackend for SqliteBackend {
    async fn save(&self, session: &Session) -> Result<()> {
        let state = serde_json::to_string(session)?;
        let conn = self.conn.lock().await;

        conn.execute(
            "INSERT OR REPLACE INTO sessions (address, role, state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session.address.to_string(),
                session.role.to_string(),
                state,
                session.created_at.timestamp(),
                Utc::now().timestamp(),
            ],
        )?;

        Ok(())
    }

    async fn delete(&self, address: &Address) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM sessions WHERE address = ?1",
            params![address.to_string()],
        )?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Session>> {
        let conn = self.conn.lock().await;

        let mut stmt = conn.prepare("SELECT state FROM sessions ORDER BY address")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(serde_json::from_str(&row?)?);
        }

        Ok(sessions)
    }
}
