//! ---
//! deploy_section: "03-persistence-logging"
//! deploy_subsection: "module"
//! deploy_type: "source"
//! deploy_scope: "code"
//! deploy_description: "Persistence abstractions and storage bindings."
//! deploy_version: "v0.0.0-prealpha"
//! deploy_owner: "tbd"
//! ---
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{archive::ENVELOPE_VERSION, PersistenceError, Result};

const JOURNAL_FORMAT: &str = "r-deploy-journal";

/// First line of every journal file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalHeader {
    format: String,
    version: u16,
    created_at: DateTime<Utc>,
}

impl JournalHeader {
    fn new() -> Self {
        Self {
            format: JOURNAL_FORMAT.to_owned(),
            version: ENVELOPE_VERSION,
            created_at: Utc::now(),
        }
    }

    fn check(line: &str) -> Result<()> {
        let header: JournalHeader = serde_json::from_str(line)?;
        if header.format != JOURNAL_FORMAT {
            return Err(PersistenceError::UnknownFormat(header.format));
        }
        if header.version > ENVELOPE_VERSION {
            return Err(PersistenceError::UnsupportedVersion(header.version));
        }
        Ok(())
    }
}

/// One audit record in the deployment journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Sequential identifier assigned when appending.
    pub sequence: u64,
    /// Timestamp when the record was written.
    pub timestamp: DateTime<Utc>,
    /// Record kind, e.g. `update.created` or `run.transition`.
    pub kind: String,
    /// Deployment run the record belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Update the record refers to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_id: Option<String>,
    /// Arbitrary JSON detail.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl JournalEntry {
    /// Construct an entry of the given kind with the provided payload.
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            sequence: 0,
            timestamp: Utc::now(),
            kind: kind.into(),
            run_id: None,
            update_id: None,
            payload,
        }
    }

    /// Tag the entry with a run identifier.
    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Tag the entry with an update identifier.
    pub fn with_update(mut self, update_id: impl Into<String>) -> Self {
        self.update_id = Some(update_id.into());
        self
    }
}

/// Append-only writer for the journal.
#[derive(Debug)]
pub struct JournalWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    next_sequence: u64,
}

impl JournalWriter {
    /// Open a journal for appending, writing a header if the file is new.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let exists = path.exists();
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);

        if !exists || is_empty(path)? {
            let header = JournalHeader::new();
            let line = serde_json::to_string(&header)?;
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
            writer.flush()?;
            return Ok(Self {
                path: path.to_path_buf(),
                writer,
                next_sequence: 0,
            });
        }

        let next_sequence = determine_last_sequence(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            next_sequence,
        })
    }

    /// Append a record and return the assigned sequence number and byte count.
    pub fn append(&mut self, mut entry: JournalEntry) -> Result<(u64, usize)> {
        self.next_sequence += 1;
        entry.sequence = self.next_sequence;
        let line = serde_json::to_string(&entry)?;
        let bytes = line.len() + 1;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok((entry.sequence, bytes))
    }

    /// Flush buffered writes to the underlying file handle.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Location of the journal on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn is_empty(path: &Path) -> Result<bool> {
    Ok(fs::metadata(path)?.len() == 0)
}

fn determine_last_sequence(path: &Path) -> Result<u64> {
    // Torn trailing lines are skipped so a crash mid-append does not block reopening.
    let last = JournalReader::open(path)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.sequence)
        .last();
    Ok(last.unwrap_or(0))
}

/// Replay the journal in order, invoking the callback for each record.
pub fn replay<F>(path: &Path, mut handler: F) -> Result<usize>
where
    F: FnMut(JournalEntry) -> Result<()>,
{
    let mut count = 0usize;
    for entry in JournalReader::open(path)? {
        handler(entry?)?;
        count += 1;
    }
    Ok(count)
}

/// Streaming iterator over journal records.
pub struct JournalReader {
    lines: std::io::Lines<BufReader<File>>,
}

impl JournalReader {
    /// Open the journal for sequential reading.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut header = String::new();
        reader.read_line(&mut header)?;
        if !header.trim().is_empty() {
            JournalHeader::check(header.trim())?;
        }
        Ok(Self {
            lines: reader.lines(),
        })
    }
}

impl Iterator for JournalReader {
    type Item = Result<JournalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.lines.next()? {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => {
                    return Some(serde_json::from_str(&line).map_err(PersistenceError::from))
                }
                Err(err) => return Some(Err(err.into())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn append_and_replay_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.log");
        let mut writer = JournalWriter::open(&path).unwrap();

        writer
            .append(JournalEntry::new("update.created", json!({"title": "a"})).with_update("u1"))
            .unwrap();
        writer
            .append(JournalEntry::new("run.transition", json!({"phase": "committed"})).with_run("r1"))
            .unwrap();

        let mut kinds = Vec::new();
        let count = replay(&path, |entry| {
            kinds.push((entry.sequence, entry.kind));
            Ok(())
        })
        .unwrap();

        assert_eq!(count, 2);
        assert_eq!(
            kinds,
            vec![
                (1, "update.created".to_owned()),
                (2, "run.transition".to_owned())
            ]
        );
    }

    #[test]
    fn reopening_continues_sequence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.log");
        {
            let mut writer = JournalWriter::open(&path).unwrap();
            writer.append(JournalEntry::new("a", json!(1))).unwrap();
            writer.append(JournalEntry::new("b", json!(2))).unwrap();
        }
        let mut writer = JournalWriter::open(&path).unwrap();
        let (sequence, bytes) = writer.append(JournalEntry::new("c", json!(3))).unwrap();
        assert_eq!(sequence, 3);
        assert!(bytes > 0);

        let sequences: Vec<u64> = JournalReader::open(&path)
            .unwrap()
            .map(|entry| entry.unwrap().sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[test]
    fn foreign_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("other.log");
        fs::write(&path, "{\"format\":\"other\",\"version\":1,\"created_at\":\"2024-01-01T00:00:00Z\"}\n").unwrap();
        assert!(matches!(
            JournalWriter::open(&path),
            Err(PersistenceError::UnknownFormat(format)) if format == "other"
        ));
    }
}
