//! Durable commit journal
//!
//! Every committed transaction is written as one journal entry before it
//! becomes visible in memory. Reopening a store replays the journal.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{PresenceError, Result};

use super::transaction::CommitEntry;

/// Persistence backend for committed transactions.
///
/// The store calls `append` without holding any of its own locks, so commits
/// on unrelated rows may append concurrently.
pub trait Journal: Send + Sync {
    /// Durably record one commit. An error means the commit did not happen.
    fn append(&self, entry: &CommitEntry) -> Result<()>;

    /// Read back every commit, oldest first
    fn replay(&self) -> Result<Vec<CommitEntry>>;
}

impl<J: Journal + ?Sized> Journal for Arc<J> {
    fn append(&self, entry: &CommitEntry) -> Result<()> {
        (**self).append(entry)
    }

    fn replay(&self) -> Result<Vec<CommitEntry>> {
        (**self).replay()
    }
}

/// Volatile journal kept in memory.
#[derive(Default)]
pub struct MemoryJournal {
    entries: Mutex<Vec<CommitEntry>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Journal for MemoryJournal {
    fn append(&self, entry: &CommitEntry) -> Result<()> {
        self.entries
            .lock()
            .map_err(|_| PresenceError::StorageUnavailable("memory journal poisoned".into()))?
            .push(entry.clone());
        Ok(())
    }

    fn replay(&self) -> Result<Vec<CommitEntry>> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| PresenceError::StorageUnavailable("memory journal poisoned".into()))?
            .clone())
    }
}

/// JSON-lines journal: one committed transaction per line.
pub struct FileJournal {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileJournal {
    /// Open (or create) the journal at `path`. A torn final line left by a
    /// crash mid-append is cut off so later appends start on a clean line.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            truncate_torn_tail(&path)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Journal for FileJournal {
    fn append(&self, entry: &CommitEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut file = self
            .file
            .lock()
            .map_err(|_| PresenceError::StorageUnavailable("journal file lock poisoned".into()))?;
        file.write_all(&line)?;
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }

    fn replay(&self) -> Result<Vec<CommitEntry>> {
        let file = File::open(&self.path)?;
        let lines: Vec<String> = BufReader::new(file)
            .lines()
            .collect::<std::io::Result<_>>()?;

        let mut entries = Vec::with_capacity(lines.len());
        for (n, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str::<CommitEntry>(line).map_err(|e| {
                PresenceError::Serialization(format!(
                    "journal {} line {}: {}",
                    self.path.display(),
                    n + 1,
                    e
                ))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

fn truncate_torn_tail(path: &Path) -> Result<()> {
    let bytes = std::fs::read(path)?;
    if bytes.last().map_or(true, |b| *b == b'\n') {
        return Ok(());
    }
    let keep = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |pos| pos + 1);
    log::warn!(
        "Discarding {} bytes of incomplete commit at the end of {}",
        bytes.len() - keep,
        path.display()
    );
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(keep as u64)?;
    file.sync_data()?;
    Ok(())
}
