//! Key to blob store on local disk.
//!
//! One file per key, `<dir>/<key>.bin`, holding the raw bytes with no header
//! or versioning. Only small UI preferences live here (camera speed, last
//! opened asset); nothing the renderer needs for correctness.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

const EXTENSION: &str = "bin";

/// Directory-backed blob store.
#[derive(Clone, Debug)]
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    /// Opens the store, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        debug!("Blob store opened at {}", dir.display());
        Ok(Self { dir })
    }

    /// Directory holding the blobs.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key != "."
            && key != ".."
            && !key.contains(['/', '\\', '\0']);
        if !valid {
            return Err(Error::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.{EXTENSION}")))
    }

    /// Whether a blob exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.path_for(key).is_ok_and(|path| path.is_file())
    }

    /// Writes `bytes` under `key`, replacing any previous blob.
    pub fn store(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        fs::write(&path, bytes)?;
        debug!("Stored {} bytes under {:?}", bytes.len(), key);
        Ok(())
    }

    /// Reads the blob for `key`, or `None` if nothing was stored.
    pub fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Stores an `f32` as its little-endian bytes.
    pub fn store_f32(&self, key: &str, value: f32) -> Result<()> {
        self.store(key, &value.to_le_bytes())
    }

    /// Reads an `f32` stored by [`BlobStore::store_f32`].
    ///
    /// A blob of the wrong length is treated as absent.
    pub fn fetch_f32(&self, key: &str) -> Result<Option<f32>> {
        Ok(self
            .fetch(key)?
            .and_then(|bytes| <[u8; 4]>::try_from(bytes.as_slice()).ok())
            .map(f32::from_le_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path().join("ObjectStore")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_open_creates_directory() {
        let (_dir, store) = temp_store();
        assert!(store.dir().is_dir());
    }

    #[test]
    fn test_store_and_fetch() {
        let (_dir, store) = temp_store();
        store.store("lastAsset", b"scenes/sponza.gltf").unwrap();

        assert!(store.contains("lastAsset"));
        assert_eq!(
            store.fetch("lastAsset").unwrap().as_deref(),
            Some(&b"scenes/sponza.gltf"[..])
        );
        assert!(store.dir().join("lastAsset.bin").is_file());
    }

    #[test]
    fn test_fetch_missing_is_none() {
        let (_dir, store) = temp_store();
        assert!(!store.contains("missing"));
        assert!(store.fetch("missing").unwrap().is_none());
    }

    #[test]
    fn test_overwrite_replaces_bytes() {
        let (_dir, store) = temp_store();
        store.store("key", b"long value").unwrap();
        store.store("key", b"short").unwrap();
        assert_eq!(store.fetch("key").unwrap().unwrap(), b"short");
    }

    #[test]
    fn test_f32_round_trip() {
        let (_dir, store) = temp_store();
        store.store_f32("cameraMovementSpeed", 2.5).unwrap();
        assert_eq!(store.fetch_f32("cameraMovementSpeed").unwrap(), Some(2.5));
    }

    #[test]
    fn test_f32_wrong_length_is_none() {
        let (_dir, store) = temp_store();
        store.store("cameraMovementSpeed", b"abc").unwrap();
        assert_eq!(store.fetch_f32("cameraMovementSpeed").unwrap(), None);
    }

    #[test]
    fn test_path_like_keys_rejected() {
        let (_dir, store) = temp_store();
        for key in ["", "..", "a/b", "a\\b"] {
            assert!(matches!(store.store(key, b"x"), Err(Error::InvalidKey(_))));
        }
    }
}
