//! The durable journal: one sync per commit group is the fsync barrier of
//! the whole engine.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use quill_common::error::{QuillError, QuillResult};
use quill_common::ids::{ResourceName, RevisionId};

/// One staged mutation inside a commit record. `None` values are deletes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalWrite {
    /// Index the mutation targets.
    pub index: ResourceName,
    /// Mutated key.
    pub key: Vec<u8>,
    /// New value, or `None` for a delete.
    pub value: Option<Vec<u8>>,
}

/// Everything one commit group makes durable in a single sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    /// Revision the group publishes at.
    pub revision: RevisionId,
    /// Union of the members' staged mutations.
    pub writes: Vec<JournalWrite>,
}

/// Durable sync point used by the group-commit coordinator.
pub trait Journal: Send + Sync {
    /// Makes one commit record durable. This is the single fsync-equivalent
    /// barrier per commit group.
    ///
    /// # Errors
    ///
    /// Returns `QuillError::Io` when the record could not be made durable;
    /// the caller aborts the commit group.
    fn sync(&self, record: &CommitRecord) -> QuillResult<()>;

    /// Number of durable syncs performed so far.
    fn sync_count(&self) -> u64;
}

/// In-process journal used by tests and transient deployments. Counts syncs
/// and supports failure injection.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    records: Mutex<Vec<CommitRecord>>,
    syncs: AtomicU64,
    inject_failures: AtomicU64,
}

impl MemoryJournal {
    /// Creates an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` syncs fail with an I/O error.
    pub fn fail_next_syncs(&self, count: u64) {
        self.inject_failures.store(count, Ordering::Release);
    }

    /// Copies every durable record in commit order.
    #[must_use]
    pub fn records(&self) -> Vec<CommitRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Journal for MemoryJournal {
    fn sync(&self, record: &CommitRecord) -> QuillResult<()> {
        let remaining = self.inject_failures.load(Ordering::Acquire);
        if remaining > 0 {
            self.inject_failures.store(remaining - 1, Ordering::Release);
            return Err(QuillError::Io("injected journal sync failure".to_owned()));
        }
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        let _ = self.syncs.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::Acquire)
    }
}

/// Append-only file journal. Each sync appends one length-delimited record
/// and calls `sync_all` before returning.
#[derive(Debug)]
pub struct FileJournal {
    file: Mutex<File>,
    syncs: AtomicU64,
}

impl FileJournal {
    /// Opens (or creates) the journal file for appending.
    ///
    /// # Errors
    ///
    /// Returns `QuillError::Io` when the file cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P) -> QuillResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|error| QuillError::Io(error.to_string()))?;
        Ok(Self {
            file: Mutex::new(file),
            syncs: AtomicU64::new(0),
        })
    }
}

impl Journal for FileJournal {
    fn sync(&self, record: &CommitRecord) -> QuillResult<()> {
        let payload = encode_commit_record(record);
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(&payload)
            .and_then(|()| file.sync_all())
            .map_err(|error| QuillError::Io(error.to_string()))?;
        let _ = self.syncs.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::Acquire)
    }
}

fn encode_commit_record(record: &CommitRecord) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&record.revision.to_le_bytes());
    payload.extend_from_slice(&(record.writes.len() as u64).to_le_bytes());
    for write in &record.writes {
        encode_bytes(&mut payload, write.index.as_str().as_bytes());
        encode_bytes(&mut payload, &write.key);
        match &write.value {
            Some(value) => {
                payload.push(1);
                encode_bytes(&mut payload, value);
            }
            None => payload.push(0),
        }
    }
    payload
}

fn encode_bytes(payload: &mut Vec<u8>, bytes: &[u8]) {
    payload.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    payload.extend_from_slice(bytes);
}
