//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees that
//! migrations are run before any other operation. Multi-entity writes go
//! through [`Database::transaction`], which nests as savepoints so CRUD
//! helpers compose inside a caller's transaction.

use std::cell::Cell;
use std::fmt;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use lnchat_shared::ChatError;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
    depth: Cell<u32>,
}

impl Database {
    /// Open (or create) the default application database.
    ///
    /// The database file is placed in the platform-appropriate data directory:
    /// - Linux:   `~/.local/share/lnchat/lnchat.db`
    /// - macOS:   `~/Library/Application Support/org.lnchat.lnchat/lnchat.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\lnchat\lnchat\data\lnchat.db`
    pub fn new() -> Result<Self> {
        Self::open_at(&Self::default_path()?)
    }

    /// Platform default location of the database file.
    pub fn default_path() -> Result<PathBuf> {
        let project_dirs =
            ProjectDirs::from("org", "lnchat", "lnchat").ok_or(StoreError::NoDataDir)?;
        Ok(project_dirs.data_dir().join("lnchat.db"))
    }

    /// Open (or create) a database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        tracing::info!(path = %path.display(), "opening database");

        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        // Recommended SQLite settings.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let integrity: String =
            conn.pragma_query_value(None, "quick_check", |row| row.get(0))?;
        if integrity != "ok" {
            return Err(StoreError::Migration(format!(
                "database failed integrity check: {integrity}"
            )));
        }

        // Run schema migrations.
        migrations::run_migrations(&conn)?;

        Ok(Self {
            conn,
            depth: Cell::new(0),
        })
    }

    /// Return a reference to the underlying `rusqlite::Connection`.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }

    /// Run `f` atomically.
    ///
    /// Writes made by `f` are visible to its own reads and are rolled back
    /// if it returns an error. Nested calls become savepoints of the
    /// enclosing transaction. An outermost transaction that fails with a
    /// busy/locked error is retried once.
    pub fn transaction<T, E, F>(&self, mut f: F) -> std::result::Result<T, E>
    where
        E: TxError,
        F: FnMut(&Database) -> std::result::Result<T, E>,
    {
        let outermost = self.depth.get() == 0;
        match self.savepoint(&mut f) {
            Err(e) if outermost && e.is_transient() => {
                tracing::warn!(error = %e, "transient database error, retrying once");
                self.savepoint(&mut f)
            }
            other => other,
        }
    }

    fn savepoint<T, E, F>(&self, f: &mut F) -> std::result::Result<T, E>
    where
        E: TxError,
        F: FnMut(&Database) -> std::result::Result<T, E>,
    {
        let depth = self.depth.get();
        let name = format!("sp_{depth}");
        self.conn
            .execute_batch(&format!("SAVEPOINT {name}"))
            .map_err(|e| E::from(StoreError::from(e)))?;
        self.depth.set(depth + 1);

        let result = f(self);
        self.depth.set(depth);

        match result {
            Ok(value) => {
                self.conn
                    .execute_batch(&format!("RELEASE {name}"))
                    .map_err(|e| E::from(StoreError::from(e)))?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self
                    .conn
                    .execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"))
                {
                    tracing::error!(error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }
}

/// Errors a [`Database::transaction`] closure may fail with.
pub trait TxError: From<StoreError> + fmt::Display {
    /// Busy/locked failures worth one more attempt.
    fn is_transient(&self) -> bool;
}

impl TxError for StoreError {
    fn is_transient(&self) -> bool {
        StoreError::is_transient(self)
    }
}

impl TxError for ChatError {
    fn is_transient(&self) -> bool {
        std::error::Error::source(self)
            .and_then(|source| source.downcast_ref::<StoreError>())
            .is_some_and(StoreError::is_transient)
    }
}

/// Convert a store id to the SQLite integer type.
pub(crate) fn sql_id(id: u64) -> i64 {
    id as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("test.db");

        let db = Database::open_at(&path).expect("should open");
        assert!(db.path().is_some());
        drop(db);

        // Reopening an existing file skips applied migrations.
        Database::open_at(&path).expect("should reopen");
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();
        let result: Result<()> = db.transaction(|tx| {
            tx.conn().execute(
                "INSERT INTO contacts (display_name, alias, address) VALUES ('a', 'a', 'x')",
                [],
            )?;
            Err(StoreError::Invariant("boom".into()))
        });
        assert!(result.is_err());

        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM contacts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn nested_transaction_failure_keeps_outer_writes() {
        let db = Database::open_in_memory().unwrap();
        db.transaction(|tx| -> Result<()> {
            tx.conn().execute(
                "INSERT INTO contacts (display_name, alias, address) VALUES ('a', 'a', 'x')",
                [],
            )?;
            let inner: Result<()> = tx.transaction(|inner| {
                inner.conn().execute(
                    "INSERT INTO contacts (display_name, alias, address) VALUES ('b', 'b', 'y')",
                    [],
                )?;
                Err(StoreError::Invariant("inner".into()))
            });
            assert!(inner.is_err());
            Ok(())
        })
        .unwrap();

        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM contacts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
