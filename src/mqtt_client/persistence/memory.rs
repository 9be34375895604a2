// SPDX-License-Identifier: MPL-2.0

use super::{MqttClientPersistence, PersistenceError, PersistenceResult};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Volatile store. Records survive reconnects of the same engine but not a
/// process restart.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    records: DashMap<String, Vec<u8>>,
    closed: AtomicBool,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> PersistenceResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PersistenceError::Closed);
        }
        Ok(())
    }
}

impl MqttClientPersistence for MemoryPersistence {
    fn put(&self, key: &str, value: &[u8]) -> PersistenceResult<()> {
        self.check_open()?;
        self.records.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> PersistenceResult<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self.records.get(key).map(|v| v.value().clone()))
    }

    fn remove(&self, key: &str) -> PersistenceResult<()> {
        self.check_open()?;
        self.records.remove(key);
        Ok(())
    }

    fn keys(&self) -> PersistenceResult<Vec<String>> {
        self.check_open()?;
        Ok(self.records.iter().map(|e| e.key().clone()).collect())
    }

    fn contains_key(&self, key: &str) -> PersistenceResult<bool> {
        self.check_open()?;
        Ok(self.records.contains_key(key))
    }

    fn clear(&self) -> PersistenceResult<()> {
        self.check_open()?;
        self.records.clear();
        Ok(())
    }

    fn close(&self) -> PersistenceResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_remove() {
        let store = MemoryPersistence::new();
        store.put("s-1", b"one").unwrap();
        store.put("r-2", b"two").unwrap();
        store.put("s-1", b"uno").unwrap();

        assert_eq!(store.get("s-1").unwrap(), Some(b"uno".to_vec()));
        assert!(store.contains_key("r-2").unwrap());

        let mut keys = store.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec!["r-2".to_string(), "s-1".to_string()]);

        store.remove("s-1").unwrap();
        store.remove("s-1").unwrap();
        assert_eq!(store.get("s-1").unwrap(), None);

        store.clear().unwrap();
        assert!(store.keys().unwrap().is_empty());
    }

    #[test]
    fn test_closed_store_rejects_calls() {
        let store = MemoryPersistence::new();
        store.close().unwrap();
        assert!(matches!(store.put("s-1", b"x"), Err(PersistenceError::Closed)));
        assert!(matches!(store.keys(), Err(PersistenceError::Closed)));
    }
}
