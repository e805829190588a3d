//! Key-value storage backing the chain and the world state.
//!
//! Provides a `Database` trait and two implementations: a sled-backed store
//! for durable deployments and an in-memory store for tests and throwaway
//! chains. Errors carry the backend's message so callers see the original
//! failure unchanged.

use std::collections::HashMap;
use std::sync::RwLock;

/// Errors from database operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum DbError {
    #[error("database I/O error: {0}")]
    Io(String),
}

/// Trait for key-value storage backends.
///
/// Implementations are shared across the engine, the chain store, and every
/// world-state view, so all operations take `&self`.
pub trait Database: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), DbError>;
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError>;
    fn has(&self, key: &[u8]) -> Result<bool, DbError>;
    fn delete(&self, key: &[u8]) -> Result<(), DbError>;
    fn close(&self) -> Result<(), DbError>;
}

/// Sled-backed database.
pub struct SledDb {
    db: sled::Db,
}

impl SledDb {
    /// Open or create a sled database at the given path.
    pub fn open(path: &std::path::Path) -> Result<Self, DbError> {
        let db = sled::open(path).map_err(|e| DbError::Io(e.to_string()))?;
        Ok(SledDb { db })
    }

    /// Open a temporary sled database that is discarded on drop (for testing).
    pub fn open_temporary() -> Result<Self, DbError> {
        let config = sled::Config::new().temporary(true);
        let db = config.open().map_err(|e| DbError::Io(e.to_string()))?;
        Ok(SledDb { db })
    }
}

impl Database for SledDb {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        self.db
            .insert(key, value)
            .map_err(|e| DbError::Io(e.to_string()))?;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        let value = self.db.get(key).map_err(|e| DbError::Io(e.to_string()))?;
        Ok(value.map(|v| v.to_vec()))
    }

    fn has(&self, key: &[u8]) -> Result<bool, DbError> {
        self.db
            .contains_key(key)
            .map_err(|e| DbError::Io(e.to_string()))
    }

    fn delete(&self, key: &[u8]) -> Result<(), DbError> {
        self.db
            .remove(key)
            .map_err(|e| DbError::Io(e.to_string()))?;
        Ok(())
    }

    fn close(&self) -> Result<(), DbError> {
        self.db.flush().map_err(|e| DbError::Io(e.to_string()))?;
        Ok(())
    }
}

/// In-memory database over a hash map.
#[derive(Default)]
pub struct MemoryDb {
    map: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        MemoryDb::default()
    }

    fn map_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Vec<u8>, Vec<u8>>> {
        self.map.read().unwrap_or_else(|e| e.into_inner())
    }

    fn map_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Vec<u8>, Vec<u8>>> {
        self.map.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Database for MemoryDb {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        self.map_write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        Ok(self.map_read().get(key).cloned())
    }

    fn has(&self, key: &[u8]) -> Result<bool, DbError> {
        Ok(self.map_read().contains_key(key))
    }

    fn delete(&self, key: &[u8]) -> Result<(), DbError> {
        self.map_write().remove(key);
        Ok(())
    }

    fn close(&self) -> Result<(), DbError> {
        Ok(())
    }
}
