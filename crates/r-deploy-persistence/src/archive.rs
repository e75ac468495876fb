//! ---
//! deploy_section: "03-persistence-logging"
//! deploy_subsection: "module"
//! deploy_type: "source"
//! deploy_scope: "code"
//! deploy_description: "Persistence abstractions and storage bindings."
//! deploy_version: "v0.0.0-prealpha"
//! deploy_owner: "tbd"
//! ---
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;
use walkdir::WalkDir;

use crate::{PersistenceError, Result};

/// Current envelope format revision.
pub const ENVELOPE_VERSION: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope<T> {
    version: u16,
    created_at: DateTime<Utc>,
    hash: String,
    payload: T,
}

/// Hex SHA-256 digest over the canonical JSON form of `payload`.
///
/// The payload is first converted into a `serde_json::Value`, whose maps are
/// key-sorted, so the digest does not depend on struct field order or on the
/// encoding the envelope was stored in.
pub fn content_hash<T: Serialize>(payload: &T) -> Result<String> {
    let canonical = serde_json::to_value(payload)?;
    Ok(value_digest(&canonical))
}

/// Hex SHA-256 digest of an already-built JSON value.
pub fn value_digest(value: &serde_json::Value) -> String {
    hex::encode(Sha256::digest(value.to_string().as_bytes()))
}

fn is_cbor(path: &Path) -> bool {
    matches!(path.extension().and_then(|ext| ext.to_str()), Some("cbor"))
}

/// Seal `payload` into a hashed envelope at `path`.
///
/// `.cbor` paths are written as CBOR, everything else as pretty JSON.
pub fn save_envelope<T: Serialize>(payload: &T, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let envelope = Envelope {
        version: ENVELOPE_VERSION,
        created_at: Utc::now(),
        hash: content_hash(payload)?,
        payload,
    };

    let mut writer = BufWriter::new(File::create(path)?);
    if is_cbor(path) {
        let bytes = serde_cbor::to_vec(&envelope)?;
        writer.write_all(&bytes)?;
    } else {
        let json = serde_json::to_vec_pretty(&envelope)?;
        writer.write_all(&json)?;
    }
    writer.flush()?;
    Ok(())
}

fn read_envelope<T: DeserializeOwned>(path: &Path) -> Result<Envelope<T>> {
    let mut file = File::open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    let envelope = if is_cbor(path) {
        serde_cbor::from_slice(&bytes)?
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok(envelope)
}

/// Load an envelope and return its payload after checking the digest.
pub fn load_envelope<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Serialize,
{
    let envelope: Envelope<T> = read_envelope(path)?;
    if envelope.version != ENVELOPE_VERSION {
        return Err(PersistenceError::UnsupportedVersion(envelope.version));
    }
    let expected = content_hash(&envelope.payload)?;
    if envelope.hash != expected {
        return Err(PersistenceError::HashMismatch(path.display().to_string()));
    }
    Ok(envelope.payload)
}

/// Verify the integrity of an envelope without knowing its payload type.
pub fn verify_envelope(path: &Path) -> bool {
    match read_envelope::<serde_json::Value>(path) {
        Ok(envelope) => content_hash(&envelope.payload)
            .map(|hash| hash == envelope.hash)
            .unwrap_or(false),
        Err(_) => false,
    }
}

/// Directory-backed archive storing one envelope per snapshot under
/// `<root>/<label>/<snapshot_id>.<ext>`.
#[derive(Debug, Clone)]
pub struct SnapshotArchive {
    root: PathBuf,
    extension: String,
}

impl SnapshotArchive {
    /// Open (and create if needed) an archive rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, extension: &str) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            extension: extension.trim_start_matches('.').to_owned(),
        })
    }

    /// Root directory of the archive.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location a snapshot is (or would be) stored at.
    pub fn path_for(&self, label: &str, snapshot_id: &str) -> PathBuf {
        self.root
            .join(sanitize(label))
            .join(format!("{}.{}", sanitize(snapshot_id), self.extension))
    }

    /// Seal and store a snapshot payload, returning the written path.
    pub fn save<T: Serialize>(
        &self,
        label: &str,
        snapshot_id: &str,
        payload: &T,
    ) -> Result<PathBuf> {
        let path = self.path_for(label, snapshot_id);
        save_envelope(payload, &path)?;
        debug!(label, snapshot_id, path = %path.display(), "snapshot archived");
        Ok(path)
    }

    /// Load and verify an archived snapshot.
    pub fn load<T>(&self, label: &str, snapshot_id: &str) -> Result<T>
    where
        T: DeserializeOwned + Serialize,
    {
        load_envelope(&self.path_for(label, snapshot_id))
    }

    /// Delete an archived snapshot. Returns `false` when nothing was stored.
    pub fn remove(&self, label: &str, snapshot_id: &str) -> Result<bool> {
        let path = self.path_for(label, snapshot_id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        Ok(true)
    }

    /// All archived envelope files, sorted by path.
    pub fn list(&self) -> Vec<PathBuf> {
        let mut entries: Vec<PathBuf> = WalkDir::new(&self.root)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect();
        entries.sort();
        entries
    }
}

fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        zeta: u32,
        alpha: String,
    }

    #[test]
    fn json_and_cbor_archives_verify() {
        let dir = tempdir().unwrap();
        let sample = Sample {
            zeta: 7,
            alpha: "ledger".into(),
        };
        for ext in ["json", "cbor"] {
            let archive = SnapshotArchive::open(dir.path().join(ext), ext).unwrap();
            let path = archive.save("pre-update-run1", "snap-1", &sample).unwrap();
            assert!(verify_envelope(&path));
            let loaded: Sample = archive.load("pre-update-run1", "snap-1").unwrap();
            assert_eq!(loaded, sample);
            assert_eq!(archive.list(), vec![path]);
        }
    }

    #[test]
    fn hash_is_independent_of_field_order() {
        let sample = Sample {
            zeta: 1,
            alpha: "x".into(),
        };
        let as_value = json!({"alpha": "x", "zeta": 1});
        assert_eq!(content_hash(&sample).unwrap(), content_hash(&as_value).unwrap());
    }

    #[test]
    fn tampered_envelope_is_rejected() {
        let dir = tempdir().unwrap();
        let archive = SnapshotArchive::open(dir.path(), "json").unwrap();
        let path = archive
            .save("label", "snap", &json!({"version": "1.0.0"}))
            .unwrap();

        let mut envelope: serde_json::Value =
            serde_json::from_reader(File::open(&path).unwrap()).unwrap();
        envelope["payload"]["version"] = json!("9.9.9");
        fs::write(&path, serde_json::to_vec_pretty(&envelope).unwrap()).unwrap();

        assert!(!verify_envelope(&path));
        assert!(matches!(
            archive.load::<serde_json::Value>("label", "snap"),
            Err(PersistenceError::HashMismatch(_))
        ));
    }

    #[test]
    fn remove_reports_missing_entries() {
        let dir = tempdir().unwrap();
        let archive = SnapshotArchive::open(dir.path(), ".json").unwrap();
        archive.save("a", "s1", &json!({})).unwrap();
        assert!(archive.remove("a", "s1").unwrap());
        assert!(!archive.remove("a", "s1").unwrap());
        assert!(archive.list().is_empty());
    }
}
