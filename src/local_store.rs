//! Durable key-value persistence on the device.
//!
//! The entity graph and the pending-upload queue are each stored as one JSON
//! document under their own key and rewritten wholesale on every change.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use chrono::Utc;
use native_db::{native_db, Builder, Database, Models, ToKey};
use native_model::{native_model, Model};
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::models::{Field, PendingUpload};

pub const FIELDS_KEY: &str = "trap_sync.fields";
pub const PENDING_UPLOADS_KEY: &str = "trap_sync.pending_uploads";
pub const CORRUPT_SUFFIX: &str = ".corrupt";

/// String values under string keys. Implementations must be usable from
/// background tasks.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

// ===== NATIVE_DB BACKEND =====

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[native_model(id = 1, version = 1)]
#[native_db]
pub struct StoredEntry {
    #[primary_key]
    pub key: String,
    pub value: String,
    pub updated_at: String,
}

static MODELS: Lazy<Models> = Lazy::new(|| {
    let mut models = Models::new();
    models
        .define::<StoredEntry>()
        .expect("StoredEntry model definition is static and valid");
    models
});

/// `KeyValueStore` on an embedded native_db database file.
pub struct NativeDbStore {
    database: Database<'static>,
}

impl std::fmt::Debug for NativeDbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeDbStore").finish_non_exhaustive()
    }
}

impl NativeDbStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let database = Builder::new()
            .create(&MODELS, path)
            .map_err(|e| anyhow!("Failed to open local database {}: {}", path.display(), e))?;
        Ok(Self { database })
    }

    pub fn in_memory() -> Result<Self> {
        let database = Builder::new().create_in_memory(&MODELS)?;
        Ok(Self { database })
    }
}

impl KeyValueStore for NativeDbStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let r = self.database.r_transaction()?;
        let entry: Option<StoredEntry> = r.get().primary(key.to_string())?;
        Ok(entry.map(|e| e.value))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let rw = self.database.rw_transaction()?;
        rw.upsert(StoredEntry {
            key: key.to_string(),
            value: value.to_string(),
            updated_at: Utc::now().to_rfc3339(),
        })?;
        rw.commit()?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let rw = self.database.rw_transaction()?;
        let existing: Option<StoredEntry> = rw.get().primary(key.to_string())?;
        if let Some(entry) = existing {
            rw.remove(entry)?;
        }
        rw.commit()?;
        Ok(())
    }
}

// ===== IN-MEMORY BACKEND =====

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        entries.remove(key);
        Ok(())
    }
}

// ===== SNAPSHOTS =====

/// Reads and writes the two JSON snapshots the repository mirrors to disk.
#[derive(Clone)]
pub struct SnapshotStore {
    store: Arc<dyn KeyValueStore>,
}

impl SnapshotStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn load_fields(&self) -> Result<Vec<Field>> {
        self.load_list(FIELDS_KEY)
    }

    pub fn save_fields(&self, fields: &[Field]) -> Result<()> {
        self.save_list(FIELDS_KEY, fields)
    }

    pub fn load_pending_uploads(&self) -> Result<Vec<PendingUpload>> {
        self.load_list(PENDING_UPLOADS_KEY)
    }

    pub fn save_pending_uploads(&self, queue: &[PendingUpload]) -> Result<()> {
        self.save_list(PENDING_UPLOADS_KEY, queue)
    }

    /// A missing snapshot loads as empty. A corrupt one is copied to
    /// `<key>.corrupt` and then loads as empty. A store that cannot be read
    /// is an error, so nothing overwrites data that may still be intact.
    fn load_list<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>> {
        let raw = match self.store.get(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(Vec::new()),
            Err(e) => return Err(anyhow!("Failed to read {} from local store: {}", key, e)),
        };

        match serde_json::from_str::<Vec<T>>(&raw) {
            Ok(items) => {
                debug!("Loaded {} items from {}", items.len(), key);
                Ok(items)
            }
            Err(e) => {
                let backup = format!("{}{}", key, CORRUPT_SUFFIX);
                self.store
                    .set(&backup, &raw)
                    .map_err(|err| anyhow!("Failed to back up corrupt {}: {}", key, err))?;
                error!("Snapshot {} is corrupt, moved to {}: {}", key, backup, e);
                Ok(Vec::new())
            }
        }
    }

    fn save_list<T: Serialize>(&self, key: &str, items: &[T]) -> Result<()> {
        let json = serde_json::to_string(items)?;
        self.store.set(key, &json)
    }
}
