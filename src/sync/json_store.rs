//! On-disk local store: one pretty-printed JSON file per entity type under
//! the data directory, each a map from id to record.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tempfile::NamedTempFile;

use super::backend::LocalStore;
use crate::config::SyncConfig;
use crate::core::entity::Entity;
use crate::core::record::{EntityType, Syncable};
use crate::error::StoreError;

/// Write via a temp file in the same directory and rename over the target,
/// so readers never observe a half-written file.
pub fn atomic_write(path: &Path, content: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

type Table = BTreeMap<String, Entity>;

#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles on the table files.
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, StoreError> {
        Self::new(config.data_directory.join("records"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn table_path(&self, entity_type: EntityType) -> PathBuf {
        self.dir.join(format!("{}.json", entity_type.as_str()))
    }

    fn load(&self, entity_type: EntityType) -> Result<Table, StoreError> {
        let path = self.table_path(entity_type);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Table::new()),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    fn save(&self, entity_type: EntityType, table: &Table) -> Result<(), StoreError> {
        let path = self.table_path(entity_type);
        let json = serde_json::to_string_pretty(table)?;
        atomic_write(&path, json.as_bytes()).map_err(|source| StoreError::Io { path, source })
    }

    fn modify(&self, entity_type: EntityType, f: impl FnOnce(&mut Table)) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut table = self.load(entity_type)?;
        f(&mut table);
        self.save(entity_type, &table)
    }
}

impl LocalStore for JsonFileStore {
    fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Entity>, StoreError> {
        Ok(self.load(entity_type)?.remove(id))
    }

    fn put(&self, record: &Entity) -> Result<(), StoreError> {
        self.modify(record.entity_type(), |table| {
            table.insert(record.id().to_string(), record.clone());
        })
    }

    fn delete(&self, entity_type: EntityType, id: &str) -> Result<(), StoreError> {
        self.modify(entity_type, |table| {
            table.remove(id);
        })
    }

    fn list(&self, entity_type: EntityType) -> Result<Vec<Entity>, StoreError> {
        Ok(self.load(entity_type)?.into_values().collect())
    }
}
