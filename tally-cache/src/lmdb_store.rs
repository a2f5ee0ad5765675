//! LMDB-backed durable store.
//!
//! Uses the heed crate (Rust bindings for LMDB) to persist serialized cache
//! entries across sessions in a memory-mapped key-value file.
//!
//! # Key Layout
//!
//! Keys are the cache keys themselves (`"<operation>:<digest>"`), stored as
//! UTF-8 strings. LMDB keeps keys sorted, so all entries of one operation are
//! contiguous and `remove_prefix` touches only that range's keys.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. The store uses read transactions for
//! `load`/`load_all` and write transactions for everything else.

use std::path::Path;

use heed::types::Str;
use heed::{Database, Env, EnvOpenOptions};
use tally_core::StoreError;

use crate::traits::DurableStore;

/// LMDB-backed durable store.
///
/// # Example
///
/// ```ignore
/// use tally_cache::{CacheManager, LmdbStore};
///
/// let store = LmdbStore::open("/var/lib/tally/cache", 64)?;
/// let manager = CacheManager::new(config).with_store(Arc::new(store));
/// manager.hydrate();
/// ```
pub struct LmdbStore {
    env: Env,
    db: Database<Str, Str>,
}

impl LmdbStore {
    /// Open (or create) an LMDB store.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the LMDB
    /// environment/database cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per directory by this store
        // and never concurrently re-opened with different flags in-process.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| StoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| StoreError::Transaction(e.to_string()))?;

        let db: Database<Str, Str> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| StoreError::DbOpen(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| StoreError::Transaction(e.to_string()))?;

        Ok(Self { env, db })
    }

    /// Number of stored entries.
    pub fn len(&self) -> Result<u64, StoreError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        self.db
            .len(&rtxn)
            .map_err(|e| StoreError::Transaction(e.to_string()))
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Iterate over keys matching a prefix and collect them.
    fn collect_keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| StoreError::Transaction(e.to_string()))?;

        let iter = self
            .db
            .iter(&rtxn)
            .map_err(|e| StoreError::Transaction(e.to_string()))?;

        let mut keys = Vec::new();
        for result in iter {
            match result {
                Ok((key, _)) if key.starts_with(prefix) => keys.push(key.to_string()),
                Ok(_) => {}
                Err(_) => continue,
            }
        }

        Ok(keys)
    }
}

impl DurableStore for LmdbStore {
    fn persist(&self, key: &str, serialized_entry: &str) -> Result<(), StoreError> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| StoreError::Transaction(e.to_string()))?;

        self.db
            .put(&mut wtxn, key, serialized_entry)
            .map_err(|e| StoreError::Transaction(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| StoreError::Transaction(e.to_string()))
    }

    fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| StoreError::Transaction(e.to_string()))?;

        let value = self
            .db
            .get(&rtxn, key)
            .map_err(|e| StoreError::Transaction(e.to_string()))?;

        Ok(value.map(str::to_string))
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| StoreError::Transaction(e.to_string()))?;

        self.db
            .delete(&mut wtxn, key)
            .map_err(|e| StoreError::Transaction(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| StoreError::Transaction(e.to_string()))
    }

    fn remove_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let keys_to_delete = self.collect_keys_with_prefix(prefix)?;
        if keys_to_delete.is_empty() {
            return Ok(0);
        }

        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| StoreError::Transaction(e.to_string()))?;

        let mut deleted = 0u64;
        for key in &keys_to_delete {
            if self
                .db
                .delete(&mut wtxn, key)
                .map_err(|e| StoreError::Transaction(e.to_string()))?
            {
                deleted += 1;
            }
        }

        wtxn.commit()
            .map_err(|e| StoreError::Transaction(e.to_string()))?;

        Ok(deleted)
    }

    fn load_all(&self) -> Result<Vec<(String, String)>, StoreError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| StoreError::Transaction(e.to_string()))?;

        let iter = self
            .db
            .iter(&rtxn)
            .map_err(|e| StoreError::Transaction(e.to_string()))?;

        let mut entries = Vec::new();
        for result in iter {
            let (key, value) = result.map_err(|e| StoreError::Transaction(e.to_string()))?;
            entries.push((key.to_string(), value.to_string()));
        }

        Ok(entries)
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| StoreError::Transaction(e.to_string()))?;

        self.db
            .clear(&mut wtxn)
            .map_err(|e| StoreError::Transaction(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| StoreError::Transaction(e.to_string()))
    }
}
