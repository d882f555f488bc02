use std::fs::File;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::error::{CacheError, IoKind, Result};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SlotRecord {
    pub slot: u32,
    pub entity_uuid: Uuid,
    pub source_uuid: Uuid,
    /// Position in the LRU order; 0 is most recently used.
    pub lru_rank: u32,
}

/// The on-disk metadata document that accompanies a table file: the schema
/// fingerprint it was created with plus the slot-to-entity index and LRU
/// order needed to reopen it.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Sidecar {
    pub fingerprint: Vec<u8>,
    pub metadata_version: u32,
    pub screen_scale: f32,
    pub slots: Vec<SlotRecord>,
}

impl Sidecar {
    /// Parse the sidecar at `path`. A missing, truncated or otherwise
    /// malformed document is treated as absent.
    pub fn load(path: &Path) -> Option<Sidecar> {
        let file = File::open(path).ok()?;
        ciborium::de::from_reader(std::io::BufReader::new(file)).ok()
    }

    /// Write via temp file + fsync + rename, so a crash never leaves a
    /// partially written document behind.
    pub fn store(&self, path: &Path) -> Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)
            .map_err(|e| CacheError::io(IoKind::WriteFailed, path, e))?;
        ciborium::ser::into_writer(self, tmp.as_file_mut()).map_err(|e| {
            CacheError::io(
                IoKind::WriteFailed,
                path,
                std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
            )
        })?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| CacheError::io(IoKind::WriteFailed, path, e))?;
        tmp.persist(path)
            .map_err(|e| CacheError::io(IoKind::WriteFailed, path, e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Sidecar {
        Sidecar {
            fingerprint: vec![1, 2, 3, 4],
            metadata_version: 1,
            screen_scale: 2.0,
            slots: vec![
                SlotRecord {
                    slot: 0,
                    entity_uuid: Uuid::from_u128(1),
                    source_uuid: Uuid::from_u128(2),
                    lru_rank: 1,
                },
                SlotRecord {
                    slot: 3,
                    entity_uuid: Uuid::from_u128(3),
                    source_uuid: Uuid::from_u128(4),
                    lru_rank: 0,
                },
            ],
        }
    }

    #[test]
    fn store_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("thumb.metadata");
        let doc = sample();
        doc.store(&path).unwrap();
        assert_eq!(Sidecar::load(&path), Some(doc));
    }

    #[test]
    fn missing_is_absent() {
        let dir = TempDir::new().unwrap();
        assert_eq!(Sidecar::load(&dir.path().join("nope.metadata")), None);
    }

    #[test]
    fn truncated_is_absent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("thumb.metadata");
        sample().store(&path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        assert_eq!(Sidecar::load(&path), None);
    }

    #[test]
    fn garbage_is_absent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("thumb.metadata");
        std::fs::write(&path, b"not cbor at all").unwrap();
        assert_eq!(Sidecar::load(&path), None);
    }
}
