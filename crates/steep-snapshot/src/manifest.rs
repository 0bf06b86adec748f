//! The on-disk snapshot manifest.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use steep_types::{CompressionCodec, Lsn, NodeId};

use crate::{SnapshotError, io_error};

/// Manifest file name under the snapshot directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Current manifest schema version. Appliers reject anything else.
pub const SCHEMA_VERSION: u32 = 1;

/// One exported table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableEntry {
    pub schema: String,
    pub table: String,
    /// Path relative to the snapshot root, e.g. `data/public.users.csv.zstd`.
    pub file: String,
    pub rows: u64,
    /// Uncompressed byte count.
    pub bytes: u64,
    /// SHA-256 over the uncompressed bytes, so files can be recompressed
    /// without invalidating the manifest.
    pub sha256: String,
}

/// One captured sequence value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceEntry {
    pub schema: String,
    pub name: String,
    pub last_value: i64,
    pub is_called: bool,
}

/// The snapshot header: written last, atomically, and the only file whose
/// presence declares the snapshot complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub snapshot_id: String,
    pub source_node_id: NodeId,
    pub lsn: Lsn,
    pub codec: CompressionCodec,
    pub schema_version: u32,
    pub tables: Vec<TableEntry>,
    pub sequences: Vec<SequenceEntry>,
}

impl SnapshotManifest {
    /// Loads and validates the manifest under `snapshot_dir`.
    pub fn load(snapshot_dir: &Path) -> Result<Self, SnapshotError> {
        let path = snapshot_dir.join(MANIFEST_FILE);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SnapshotError::ManifestNotFound(
                    snapshot_dir.display().to_string(),
                ));
            }
            Err(e) => return Err(io_error(&path, e)),
        };
        let manifest: SnapshotManifest = serde_json::from_slice(&raw)
            .map_err(|e| SnapshotError::ManifestInvalid(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Writes the manifest atomically: temp file in the same directory,
    /// fsync, rename.
    pub fn write(&self, snapshot_dir: &Path) -> Result<(), SnapshotError> {
        let target = snapshot_dir.join(MANIFEST_FILE);
        let temp = snapshot_dir.join(format!("{MANIFEST_FILE}.tmp"));
        let body = serde_json::to_vec_pretty(self)
            .map_err(|e| SnapshotError::ManifestInvalid(e.to_string()))?;
        fs::write(&temp, &body).map_err(|e| io_error(&temp, e))?;
        let file = fs::File::open(&temp).map_err(|e| io_error(&temp, e))?;
        file.sync_all().map_err(|e| io_error(&temp, e))?;
        fs::rename(&temp, &target).map_err(|e| io_error(&target, e))?;
        Ok(())
    }

    fn validate(&self) -> Result<(), SnapshotError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(SnapshotError::SchemaVersionUnsupported {
                found: self.schema_version,
                supported: SCHEMA_VERSION,
            });
        }
        if self.snapshot_id.is_empty() {
            return Err(SnapshotError::ManifestInvalid(
                "empty snapshot_id".to_string(),
            ));
        }
        for table in &self.tables {
            if table.sha256.len() != 64 || !table.sha256.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(SnapshotError::ManifestInvalid(format!(
                    "bad sha256 for {}.{}",
                    table.schema, table.table
                )));
            }
            if table.file.contains("..") || table.file.starts_with('/') {
                return Err(SnapshotError::ManifestInvalid(format!(
                    "file path escapes snapshot dir: {}",
                    table.file
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> SnapshotManifest {
        SnapshotManifest {
            snapshot_id: "snap-0001".to_string(),
            source_node_id: NodeId::new("node-a"),
            lsn: "0/1A234B00".parse().unwrap(),
            codec: CompressionCodec::Zstd,
            schema_version: SCHEMA_VERSION,
            tables: vec![TableEntry {
                schema: "public".to_string(),
                table: "users".to_string(),
                file: "data/public.users.csv.zstd".to_string(),
                rows: 2,
                bytes: 48,
                sha256: "a".repeat(64),
            }],
            sequences: vec![SequenceEntry {
                schema: "public".to_string(),
                name: "users_id_seq".to_string(),
                last_value: 2,
                is_called: true,
            }],
        }
    }

    #[test]
    fn write_then_load_roundtrips() {
        let dir = tempdir().unwrap();
        let manifest = sample();
        manifest.write(dir.path()).unwrap();

        let loaded = SnapshotManifest::load(dir.path()).unwrap();
        assert_eq!(loaded, manifest);
        // No temp file left behind.
        assert!(!dir.path().join("manifest.json.tmp").exists());
    }

    #[test]
    fn missing_manifest_is_not_found() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            SnapshotManifest::load(dir.path()),
            Err(SnapshotError::ManifestNotFound(_))
        ));
    }

    #[test]
    fn unknown_schema_version_rejected() {
        let dir = tempdir().unwrap();
        let mut manifest = sample();
        manifest.schema_version = 99;
        let body = serde_json::to_vec(&manifest).unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), body).unwrap();

        assert!(matches!(
            SnapshotManifest::load(dir.path()),
            Err(SnapshotError::SchemaVersionUnsupported { found: 99, .. })
        ));
    }

    #[test]
    fn path_escape_rejected() {
        let dir = tempdir().unwrap();
        let mut manifest = sample();
        manifest.tables[0].file = "../outside.csv".to_string();
        let body = serde_json::to_vec(&manifest).unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), body).unwrap();

        assert!(matches!(
            SnapshotManifest::load(dir.path()),
            Err(SnapshotError::ManifestInvalid(_))
        ));
    }

    #[test]
    fn malformed_json_rejected() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), b"{not json").unwrap();
        assert!(matches!(
            SnapshotManifest::load(dir.path()),
            Err(SnapshotError::ManifestInvalid(_))
        ));
    }
}
