use std::collections::HashSet;
use std::path::{Path, PathBuf};

use rusqlite::Connection;

use crate::store::{StateBackend, StoreError};

/// Seen-item state in a SQLite database, for deployments that already keep one.
pub struct SqliteBackend {
    conn: Connection,
    path: PathBuf,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        init_schema(&conn)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS seen_items (
            id         TEXT PRIMARY KEY,
            first_seen TEXT NOT NULL
        );
        ",
    )
}

impl StateBackend for SqliteBackend {
    fn load(&self) -> Result<HashSet<String>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT id FROM seen_items")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<HashSet<String>, _>>()?;
        Ok(ids)
    }

    /// The set only grows, so inserting the missing rows in one transaction
    /// is equivalent to a full rewrite.
    fn save(&self, ids: &HashSet<String>) -> Result<(), StoreError> {
        let now = chrono::Utc::now().to_rfc3339();
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt =
                tx.prepare("INSERT OR IGNORE INTO seen_items (id, first_seen) VALUES (?1, ?2)")?;
            for id in ids {
                stmt.execute(rusqlite::params![id, now])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }
}
