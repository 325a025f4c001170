//! Shared, closable handle to the [`Database`].
//!
//! SQLite connections are single-writer, so every caller goes through one
//! mutex. Background loops and request handlers clone the handle freely.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::database::{Database, TxError};
use crate::error::{Result, StoreError};

#[derive(Clone)]
pub struct Store {
    inner: Arc<Mutex<Option<Database>>>,
}

impl Store {
    pub fn new(database: Database) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(database))),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Database::open_at(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    fn lock(&self) -> MutexGuard<'_, Option<Database>> {
        // Poisoning does not invalidate the connection.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` against the open database.
    pub fn with<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce(&Database) -> std::result::Result<T, E>,
    {
        let guard = self.lock();
        let db = guard.as_ref().ok_or_else(|| E::from(StoreError::Closed))?;
        f(db)
    }

    /// Run `f` inside one transaction.
    pub fn tx<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        E: TxError,
        F: FnMut(&Database) -> std::result::Result<T, E>,
    {
        self.with(|db| db.transaction(f))
    }

    /// Close the database. Later calls fail with [`StoreError::Closed`].
    pub fn close(&self) {
        if self.lock().take().is_some() {
            tracing::info!("store closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::addr;
    use lnchat_shared::{MessageOptions, Node};

    #[test]
    fn test_shared_handle() {
        let store = Store::open_in_memory().unwrap();
        let clone = store.clone();

        let id = store
            .with(|db| {
                db.insert_contact(
                    "alice",
                    &Node {
                        alias: "alice".into(),
                        address: addr('a'),
                    },
                )
            })
            .unwrap();
        assert_eq!(
            clone.with(|db| db.get_contact(id)).unwrap().display_name,
            "alice"
        );
    }

    #[test]
    fn test_tx_is_atomic() {
        let store = Store::open_in_memory().unwrap();
        let result: Result<()> = store.tx(|db| {
            db.insert_discussion(&[addr('a')], &MessageOptions::default())?;
            db.insert_discussion(&[addr('a')], &MessageOptions::default())?;
            Ok(())
        });
        assert!(matches!(result, Err(StoreError::AlreadyExists(_))));
        assert!(store
            .with(|db| db.find_discussion_by_participants(&[addr('a')]))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_closed_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("lnchat.db")).unwrap();
        store.close();
        assert!(store.is_closed());
        assert!(matches!(
            store.with(|db| db.max_payment_index()),
            Err(StoreError::Closed)
        ));
    }
}
