// SPDX-License-Identifier: MPL-2.0

use super::{MqttClientPersistence, PersistenceError, PersistenceResult};
use sled::{Db, Tree};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// Crash-durable store on a sled database.
///
/// Each client id gets its own tree, so one database can back several
/// clients. Every write is flushed before it returns.
#[derive(Clone)]
pub struct SledPersistence {
    db: Db,
    tree: Tree,
    closed: std::sync::Arc<AtomicBool>,
}

impl SledPersistence {
    pub fn open(path: impl AsRef<Path>, client_id: &str) -> PersistenceResult<Self> {
        let db = sled::open(path)?;
        Self::with_db(db, client_id)
    }

    pub fn with_db(db: Db, client_id: &str) -> PersistenceResult<Self> {
        let tree = db.open_tree(format!("mqtt-client/{}", client_id))?;
        Ok(Self {
            db,
            tree,
            closed: Default::default(),
        })
    }

    fn check_open(&self) -> PersistenceResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PersistenceError::Closed);
        }
        Ok(())
    }
}

impl MqttClientPersistence for SledPersistence {
    fn put(&self, key: &str, value: &[u8]) -> PersistenceResult<()> {
        self.check_open()?;
        self.tree.insert(key.as_bytes(), value)?;
        self.tree.flush()?;
        Ok(())
    }

    fn get(&self, key: &str) -> PersistenceResult<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self.tree.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    fn remove(&self, key: &str) -> PersistenceResult<()> {
        self.check_open()?;
        self.tree.remove(key.as_bytes())?;
        self.tree.flush()?;
        Ok(())
    }

    fn keys(&self) -> PersistenceResult<Vec<String>> {
        self.check_open()?;
        self.tree
            .iter()
            .keys()
            .map(|key| {
                let key = key?;
                String::from_utf8(key.to_vec()).map_err(|e| PersistenceError::Corrupt {
                    key: hex::encode(&key),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    fn contains_key(&self, key: &str) -> PersistenceResult<bool> {
        self.check_open()?;
        Ok(self.tree.contains_key(key.as_bytes())?)
    }

    fn clear(&self) -> PersistenceResult<()> {
        self.check_open()?;
        self.tree.clear()?;
        self.tree.flush()?;
        Ok(())
    }

    fn close(&self) -> PersistenceResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.db.flush()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for SledPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledPersistence")
            .field("db", &"sled::Db")
            .field("tree", &String::from_utf8_lossy(&self.tree.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = SledPersistence::open(dir.path(), "client-a").unwrap();
            store.put("s-1", b"hello").unwrap();
            store.put("sc-2", b"rel").unwrap();
            store.remove("sc-2").unwrap();
            store.close().unwrap();
        }

        let store = SledPersistence::open(dir.path(), "client-a").unwrap();
        assert_eq!(store.keys().unwrap(), vec!["s-1".to_string()]);
        assert_eq!(store.get("s-1").unwrap(), Some(b"hello".to_vec()));
    }

    #[test]
    fn test_clients_are_isolated() {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let a = SledPersistence::with_db(db.clone(), "a").unwrap();
        let b = SledPersistence::with_db(db, "b").unwrap();

        a.put("r-5", b"x").unwrap();
        assert!(a.contains_key("r-5").unwrap());
        assert!(!b.contains_key("r-5").unwrap());

        a.clear().unwrap();
        assert!(a.keys().unwrap().is_empty());
    }

    #[test]
    fn test_closed_store_rejects_calls() {
        let dir = tempdir().unwrap();
        let store = SledPersistence::open(dir.path(), "c").unwrap();
        store.close().unwrap();
        assert!(matches!(store.get("s-1"), Err(PersistenceError::Closed)));
    }
}
