use crate::chain::CameraEndpoint;
use crate::error::StoreError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// JSON-file persistence for the backup endpoint list.
///
/// The file is the source of truth for backups across restarts. Reads happen
/// once at startup; every mutation rewrites the whole file, which keeps the
/// on-disk state trivially consistent at the cost of an O(n) write.
#[derive(Debug, Clone)]
pub struct EndpointStore {
    path: PathBuf,
}

impl EndpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load persisted backups. An absent file is an empty list, not an error;
    /// a file that exists but cannot be read or parsed is.
    pub fn load(&self) -> Result<Vec<CameraEndpoint>, StoreError> {
        if !self.path.exists() {
            debug!("Endpoint store {} absent, starting empty", self.path.display());
            return Ok(Vec::new());
        }

        let raw = fs::read_to_string(&self.path).map_err(|source| StoreError::Read {
            path: self.path.display().to_string(),
            source,
        })?;

        let endpoints: Vec<CameraEndpoint> =
            serde_json::from_str(&raw).map_err(|e| StoreError::Malformed {
                path: self.path.display().to_string(),
                details: e.to_string(),
            })?;

        info!(
            "Loaded {} backup endpoint(s) from {}",
            endpoints.len(),
            self.path.display()
        );
        Ok(endpoints)
    }

    /// Persist the full backup list, replacing whatever was on disk.
    pub fn save(&self, endpoints: &[CameraEndpoint]) -> Result<(), StoreError> {
        let raw = serde_json::to_string_pretty(endpoints).map_err(|e| StoreError::Malformed {
            path: self.path.display().to_string(),
            details: e.to_string(),
        })?;

        fs::write(&self.path, raw).map_err(|source| StoreError::Write {
            path: self.path.display().to_string(),
            source,
        })?;

        debug!(
            "Persisted {} backup endpoint(s) to {}",
            endpoints.len(),
            self.path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn endpoint(id: &str) -> CameraEndpoint {
        CameraEndpoint::new(
            id,
            format!("Camera {}", id),
            "10.0.0.5",
            8080,
            Some("admin".to_string()),
            Some("secret".to_string()),
        )
        .unwrap()
    }

    #[test]
    fn test_absent_file_loads_empty() {
        let dir = tempdir().unwrap();
        let store = EndpointStore::new(dir.path().join("backup_cameras.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_round_trip_preserves_endpoints() {
        let dir = tempdir().unwrap();
        let store = EndpointStore::new(dir.path().join("backup_cameras.json"));

        let endpoints = vec![endpoint("cam_a"), endpoint("cam_b")];
        store.save(&endpoints).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, endpoints);
        assert_eq!(loaded[0].username.as_deref(), Some("admin"));
    }

    #[test]
    fn test_save_replaces_previous_contents() {
        let dir = tempdir().unwrap();
        let store = EndpointStore::new(dir.path().join("backup_cameras.json"));

        store.save(&[endpoint("old")]).unwrap();
        store.save(&[endpoint("new")]).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "new");
    }

    #[test]
    fn test_malformed_file_is_rejected_with_reason() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backup_cameras.json");
        fs::write(&path, "{ not json ]").unwrap();

        let store = EndpointStore::new(&path);
        match store.load() {
            Err(StoreError::Malformed { .. }) => {}
            other => panic!("expected Malformed, got {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn test_missing_required_field_is_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backup_cameras.json");
        fs::write(&path, r#"[{"id": "x", "name": "X"}]"#).unwrap();

        let store = EndpointStore::new(&path);
        assert!(matches!(store.load(), Err(StoreError::Malformed { .. })));
    }
}
