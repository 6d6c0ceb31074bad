use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::{KvError, Result};
use crate::storage::skiplist::SkipList;

/// The store behind the server: a thin validation wrapper over the
/// [`SkipList`] index plus snapshot save/load.
///
/// All methods take `&self`; the index's internal lock is the serialization
/// point, so one `KvStore` can be shared across every I/O loop.
pub struct KvStore {
    index: SkipList<String, String>,
}

impl KvStore {
    /// creates an empty store
    pub fn new() -> KvStore {
        KvStore {
            index: SkipList::new(),
        }
    }

    /// Inserts or updates an entry. Returns `true` iff the key was newly
    /// created.
    ///
    /// # Errors
    /// refuses an empty key with [`KvError::EmptyKey`]
    pub fn put(&self, key: String, value: String) -> Result<bool> {
        if key.is_empty() {
            warn!("put with empty key refused");
            return Err(KvError::EmptyKey);
        }
        let created = self.index.insert(key, value);
        debug!(created, "put");
        Ok(created)
    }

    /// looks up a value
    pub fn get(&self, key: &str) -> Option<String> {
        if key.is_empty() {
            return None;
        }
        self.index.get(key)
    }

    /// removes an entry, returning whether it existed
    pub fn del(&self, key: &str) -> bool {
        if key.is_empty() {
            return false;
        }
        self.index.remove(key)
    }

    /// true if the key is present
    pub fn exists(&self, key: &str) -> bool {
        if key.is_empty() {
            return false;
        }
        self.index.contains(key)
    }

    /// number of stored entries
    pub fn size(&self) -> usize {
        self.index.len()
    }

    /// drops every entry
    pub fn clear(&self) {
        self.index.clear();
        info!("store cleared");
    }

    /// Snapshots the store to `filepath`.
    ///
    /// # Errors
    /// fails when the file cannot be created or written; the store itself is
    /// unaffected
    pub fn save(&self, filepath: &Path) -> Result<()> {
        self.index.dump_file(filepath)?;
        info!(path = %filepath.display(), entries = self.size(), "store saved");
        Ok(())
    }

    /// Replaces the store's contents with a snapshot: clears first, then
    /// re-inserts every entry through the normal insert path.
    ///
    /// # Errors
    /// fails when the file cannot be opened or read, leaving the store empty
    pub fn load(&self, filepath: &Path) -> Result<()> {
        self.clear();
        self.index.load_file(filepath)?;
        info!(path = %filepath.display(), entries = self.size(), "store loaded");
        Ok(())
    }
}

impl Default for KvStore {
    fn default() -> Self {
        KvStore::new()
    }
}
