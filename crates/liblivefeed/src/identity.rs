use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use livefeed_protocol::{User, UserId};

use crate::error::LiveFeedError;

/// Resolves a user id to a display identity.
pub trait IdentityStore: Send + Sync {
    fn lookup(&self, user_id: UserId) -> Result<Option<User>, LiveFeedError>;
}

/// Run a lookup on the blocking pool so synchronous store I/O never stalls
/// the runtime.
pub async fn lookup_user(
    store: Arc<dyn IdentityStore>,
    user_id: UserId,
) -> Result<Option<User>, LiveFeedError> {
    tokio::task::spawn_blocking(move || store.lookup(user_id))
        .await
        .map_err(|e| LiveFeedError::Store(format!("lookup task failed: {e}")))?
}

/// SQLite-backed `users(id, name)` table.
pub struct SqliteIdentityStore {
    conn: Mutex<Connection>,
}

impl SqliteIdentityStore {
    pub fn open(path: &Path) -> Result<Self, LiveFeedError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        // WAL lets lookups proceed while provisioning writes.
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        let store = Self::init(conn)?;
        info!(path = %path.display(), users = store.count()?, "identity store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, LiveFeedError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, LiveFeedError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id    INTEGER PRIMARY KEY NOT NULL,
                name  TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, LiveFeedError> {
        self.conn
            .lock()
            .map_err(|e| LiveFeedError::Store(format!("lock poisoned: {e}")))
    }

    /// Insert or rename a user.
    pub fn insert_user(&self, user_id: UserId, name: &str) -> Result<(), LiveFeedError> {
        self.conn()?.execute(
            "INSERT INTO users (id, name) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name",
            rusqlite::params![user_id, name],
        )?;
        Ok(())
    }

    pub fn count(&self) -> Result<i64, LiveFeedError> {
        let count = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count)
    }
}

impl IdentityStore for SqliteIdentityStore {
    fn lookup(&self, user_id: UserId) -> Result<Option<User>, LiveFeedError> {
        let user = self
            .conn()?
            .query_row(
                "SELECT id, name FROM users WHERE id = ?1",
                [user_id],
                |row| {
                    Ok(User {
                        user_id: row.get(0)?,
                        user_name: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_hit_and_miss() {
        let store = SqliteIdentityStore::open_in_memory().unwrap();
        store.insert_user(5, "alice").unwrap();

        let user = store.lookup(5).unwrap().expect("alice exists");
        assert_eq!(user.user_id, 5);
        assert_eq!(user.user_name, "alice");
        assert!(store.lookup(6).unwrap().is_none());
    }

    #[test]
    fn insert_user_renames_existing_id() {
        let store = SqliteIdentityStore::open_in_memory().unwrap();
        store.insert_user(1, "bob").unwrap();
        store.insert_user(1, "robert").unwrap();
        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.lookup(1).unwrap().unwrap().user_name, "robert");
    }

    #[test]
    fn file_store_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("users.db");
        {
            let store = SqliteIdentityStore::open(&path).unwrap();
            store.insert_user(9, "carol").unwrap();
        }
        let store = SqliteIdentityStore::open(&path).unwrap();
        assert_eq!(store.lookup(9).unwrap().unwrap().user_name, "carol");
    }

    #[tokio::test]
    async fn lookup_user_runs_off_the_runtime() {
        let store = SqliteIdentityStore::open_in_memory().unwrap();
        store.insert_user(2, "dave").unwrap();
        let store: Arc<dyn IdentityStore> = Arc::new(store);

        let user = lookup_user(Arc::clone(&store), 2).await.unwrap();
        assert_eq!(user.map(|u| u.user_name).as_deref(), Some("dave"));
        assert!(lookup_user(store, 3).await.unwrap().is_none());
    }
}
