//! ---
//! deploy_section: "03-persistence-logging"
//! deploy_subsection: "module"
//! deploy_type: "source"
//! deploy_scope: "code"
//! deploy_description: "Persistence abstractions and storage bindings."
//! deploy_version: "v0.0.0-prealpha"
//! deploy_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! On-disk storage used behind the snapshot store and the update registry:
//! a hash-sealed snapshot archive and an append-only deployment journal.

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while reading/writing persistence files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Wrapper for CBOR serialization issues.
    #[error("cbor serialization error: {0}")]
    Cbor(#[from] serde_cbor::Error),
    /// Reported when an archived snapshot fails integrity verification.
    #[error("snapshot hash mismatch for {0}")]
    HashMismatch(String),
    /// Archived envelope written by an unknown format revision.
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u16),
    /// File header does not belong to a deployment journal.
    #[error("unknown journal format '{0}'")]
    UnknownFormat(String),
}

pub mod archive;
pub mod journal;

pub use archive::{
    content_hash, load_envelope, save_envelope, value_digest, verify_envelope, SnapshotArchive,
    ENVELOPE_VERSION,
};
pub use journal::replay as replay_journal;
pub use journal::{JournalEntry, JournalReader, JournalWriter};
