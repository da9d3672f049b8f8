//! Snapshot persistence backends for the dialink device client.
//!
//! The runtime only defines *what* is persisted and *when*; this crate
//! supplies the storage seam and two backends: an in-memory store for tests
//! and a JSON-file store for real deployments.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use thiserror::Error;

use phone_core::Snapshot;

#[derive(Debug, Error)]
pub enum SnapshotStoreError {
    #[error("snapshot not found")]
    NotFound,
    #[error("snapshot serialization failed: {0}")]
    Serialization(String),
    #[error("snapshot store backend failure: {0}")]
    Backend(String),
}

impl From<io::Error> for SnapshotStoreError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            Self::NotFound
        } else {
            Self::Backend(err.to_string())
        }
    }
}

/// Storage seam for restart-recovery snapshots, keyed by device identity.
pub trait SnapshotStore: Send + Sync {
    fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotStoreError>;

    fn load(&self, device_id: &str) -> Result<Snapshot, SnapshotStoreError>;

    fn delete(&self, device_id: &str) -> Result<(), SnapshotStoreError>;
}

/// Volatile store for tests and ephemeral sessions.
#[derive(Clone, Default)]
pub struct InMemorySnapshotStore {
    data: Arc<RwLock<HashMap<String, Snapshot>>>,
}

impl SnapshotStore for InMemorySnapshotStore {
    fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotStoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| SnapshotStoreError::Backend("poisoned lock".to_owned()))?;
        data.insert(snapshot.device_id.clone(), snapshot.clone());
        Ok(())
    }

    fn load(&self, device_id: &str) -> Result<Snapshot, SnapshotStoreError> {
        let data = self
            .data
            .read()
            .map_err(|_| SnapshotStoreError::Backend("poisoned lock".to_owned()))?;
        data.get(device_id)
            .cloned()
            .ok_or(SnapshotStoreError::NotFound)
    }

    fn delete(&self, device_id: &str) -> Result<(), SnapshotStoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| SnapshotStoreError::Backend("poisoned lock".to_owned()))?;
        if data.remove(device_id).is_none() {
            return Err(SnapshotStoreError::NotFound);
        }
        Ok(())
    }
}

/// One JSON file per device under a base directory, written via a temp file
/// and rename so a crash mid-write never leaves a torn snapshot.
#[derive(Clone, Debug)]
pub struct JsonFileSnapshotStore {
    base_dir: PathBuf,
}

impl JsonFileSnapshotStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn path_for(&self, device_id: &str) -> PathBuf {
        let sanitized: String = device_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.base_dir.join(format!("snapshot-{sanitized}.json"))
    }
}

impl SnapshotStore for JsonFileSnapshotStore {
    fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotStoreError> {
        fs::create_dir_all(&self.base_dir)?;

        let encoded = serde_json::to_vec_pretty(snapshot)
            .map_err(|err| SnapshotStoreError::Serialization(err.to_string()))?;

        let path = self.path_for(&snapshot.device_id);
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, encoded)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn load(&self, device_id: &str) -> Result<Snapshot, SnapshotStoreError> {
        let raw = fs::read(self.path_for(device_id))?;
        serde_json::from_slice(&raw)
            .map_err(|err| SnapshotStoreError::Serialization(err.to_string()))
    }

    fn delete(&self, device_id: &str) -> Result<(), SnapshotStoreError> {
        let path = self.path_for(device_id);
        if !Path::new(&path).exists() {
            return Err(SnapshotStoreError::NotFound);
        }
        fs::remove_file(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phone_core::PhoneState;

    fn snapshot(device_id: &str) -> Snapshot {
        Snapshot::capture(device_id, &PhoneState::default(), 42.0)
    }

    #[test]
    fn in_memory_roundtrip() {
        let store = InMemorySnapshotStore::default();
        store.save(&snapshot("device-1")).expect("save should work");

        let loaded = store.load("device-1").expect("load should work");
        assert_eq!(loaded.device_id, "device-1");
        assert_eq!(loaded.saved_at, 42.0);

        store.delete("device-1").expect("delete should work");
        assert!(matches!(
            store.load("device-1"),
            Err(SnapshotStoreError::NotFound)
        ));
    }

    #[test]
    fn file_store_roundtrip_and_overwrite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonFileSnapshotStore::new(dir.path());

        store.save(&snapshot("device-2")).expect("save should work");
        let mut updated = snapshot("device-2");
        updated.saved_at = 43.0;
        store.save(&updated).expect("overwrite should work");

        let loaded = store.load("device-2").expect("load should work");
        assert_eq!(loaded.saved_at, 43.0);
    }

    #[test]
    fn file_store_sanitizes_device_ids_into_file_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonFileSnapshotStore::new(dir.path());

        store
            .save(&snapshot("10.0.0.7:8080/ws"))
            .expect("save should work");
        let loaded = store.load("10.0.0.7:8080/ws").expect("load should work");
        assert_eq!(loaded.device_id, "10.0.0.7:8080/ws");
    }

    #[test]
    fn missing_snapshot_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonFileSnapshotStore::new(dir.path());
        assert!(matches!(
            store.load("nope"),
            Err(SnapshotStoreError::NotFound)
        ));
        assert!(matches!(
            store.delete("nope"),
            Err(SnapshotStoreError::NotFound)
        ));
    }

    #[derive(Default)]
    struct FailingStore;

    impl SnapshotStore for FailingStore {
        fn save(&self, _snapshot: &Snapshot) -> Result<(), SnapshotStoreError> {
            Err(SnapshotStoreError::Backend("mock outage".to_owned()))
        }

        fn load(&self, _device_id: &str) -> Result<Snapshot, SnapshotStoreError> {
            Err(SnapshotStoreError::Backend("mock outage".to_owned()))
        }

        fn delete(&self, _device_id: &str) -> Result<(), SnapshotStoreError> {
            Err(SnapshotStoreError::Backend("mock outage".to_owned()))
        }
    }

    #[test]
    fn mock_failure_propagates_through_trait_object() {
        let store: Box<dyn SnapshotStore> = Box::new(FailingStore);
        let err = store.save(&snapshot("x")).expect_err("save must fail");
        assert!(matches!(err, SnapshotStoreError::Backend(_)));
    }
}
