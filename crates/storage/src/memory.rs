//! In-memory store used by tests and ephemeral nodes.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::{Column, KeyValueStore, ScanResult, StoreError, WriteBatch, WriteOp};

#[derive(Default)]
pub struct MemoryStore {
    columns: RwLock<BTreeMap<(Column, Vec<u8>), Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_err() -> StoreError {
        StoreError::Backend("memory store lock poisoned".to_string())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let map = self.columns.read().map_err(|_| Self::lock_err())?;
        Ok(map.get(&(column, key.to_vec())).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut map = self.columns.write().map_err(|_| Self::lock_err())?;
        map.insert((column, key.to_vec()), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut map = self.columns.write().map_err(|_| Self::lock_err())?;
        map.remove(&(column, key.to_vec()));
        Ok(())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let map = self.columns.read().map_err(|_| Self::lock_err())?;
        let mut results = Vec::new();
        for ((col, key), value) in map.range((column, prefix.to_vec())..) {
            if *col != column || !key.starts_with(prefix) {
                break;
            }
            results.push((key.clone(), value.clone()));
        }
        Ok(results)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut map = self.columns.write().map_err(|_| Self::lock_err())?;
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    map.insert((*column, key.as_slice().to_vec()), value.clone());
                }
                WriteOp::Delete { column, key } => {
                    map.remove(&(*column, key.as_slice().to_vec()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_applies_in_order() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, b"key".as_slice(), b"one".as_slice());
        batch.put(Column::Meta, b"key".as_slice(), b"two".as_slice());
        batch.delete(Column::Utxo, b"key".as_slice());
        store.write_batch(&batch).unwrap();
        assert_eq!(store.get(Column::Meta, b"key").unwrap(), Some(b"two".to_vec()));
        assert_eq!(store.get(Column::Utxo, b"key").unwrap(), None);
    }

    #[test]
    fn prefix_scan_is_column_scoped() {
        let store = MemoryStore::new();
        store.put(Column::Utxo, b"aa1", b"x").unwrap();
        store.put(Column::Utxo, b"aa2", b"y").unwrap();
        store.put(Column::Utxo, b"ab1", b"z").unwrap();
        store.put(Column::Undo, b"aa9", b"w").unwrap();
        let results = store.scan_prefix(Column::Utxo, b"aa").unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, b"aa1".to_vec());
    }
}
