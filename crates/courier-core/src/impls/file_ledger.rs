//! FileLedger - durable ledger backed by a JSON-lines file.
//!
//! # On-disk format
//! One `LedgerEntry` per line, newline terminated, appended in sequence order.
//!
//! # Durability
//! - `append` writes the whole line and calls `sync_data` before returning
//! - a failed write or sync is rolled back by truncating to the previous length,
//!   so later appends never land behind a half-written line
//! - if that rollback fails too, the ledger refuses every later append
//!   (`LedgerError::Unavailable`) until it is reopened, which truncates the tail
//! - a trailing line without its newline is a torn write from a crash; `open`
//!   truncates it away
//! - a complete line that does not decode is corruption, and opening fails
//!
//! Blocking file I/O runs on tokio's blocking pool (`spawn_blocking`).

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::domain::{LedgerEntry, LedgerEvent, SequenceNr};
use crate::error::LedgerError;
use crate::ports::{Clock, DeliveryLedger, SystemClock};

struct FileLedgerState {
    file: File,
    /// Length of the committed prefix of the file.
    len: u64,
    next_sequence_nr: SequenceNr,
    /// Set when a failed append could not be rolled back.
    failed: Option<String>,
}

pub struct FileLedger {
    path: PathBuf,
    state: Arc<Mutex<FileLedgerState>>,
    clock: Arc<dyn Clock>,
}

impl FileLedger {
    /// Open (or create) the ledger at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        Self::open_with_clock(path, Arc::new(SystemClock)).await
    }

    pub async fn open_with_clock(
        path: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LedgerError> {
        let path = path.into();
        let open_path = path.clone();
        let state = tokio::task::spawn_blocking(move || open_blocking(&open_path))
            .await
            .map_err(|e| LedgerError::Join(e.to_string()))??;

        info!(
            path = %path.display(),
            next_sequence_nr = %state.next_sequence_nr,
            bytes = state.len,
            "delivery ledger opened"
        );

        Ok(Self {
            path,
            state: Arc::new(Mutex::new(state)),
            clock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_blocking(path: &Path) -> Result<FileLedgerState, LedgerError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)?;

    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    let scan = scan_entries(&data)?;

    if scan.valid_len < data.len() as u64 {
        warn!(
            path = %path.display(),
            torn_bytes = data.len() as u64 - scan.valid_len,
            "truncating torn tail of delivery ledger"
        );
        file.set_len(scan.valid_len)?;
        file.sync_data()?;
    }

    let next_sequence_nr = scan
        .entries
        .last()
        .map(|e| e.sequence_nr.next())
        .unwrap_or_else(SequenceNr::first);

    Ok(FileLedgerState {
        file,
        len: scan.valid_len,
        next_sequence_nr,
        failed: None,
    })
}

struct Scan {
    entries: Vec<LedgerEntry>,
    /// Byte length of the newline-terminated prefix.
    valid_len: u64,
}

/// Decode every complete line; stop at an unterminated tail.
fn scan_entries(data: &[u8]) -> Result<Scan, LedgerError> {
    let mut entries: Vec<LedgerEntry> = Vec::new();
    let mut valid_len = 0u64;

    for (idx, chunk) in data.split_inclusive(|b| *b == b'\n').enumerate() {
        let Some(line) = chunk.strip_suffix(b"\n") else {
            break; // torn tail
        };
        valid_len += chunk.len() as u64;

        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let entry: LedgerEntry = serde_json::from_slice(line)
            .map_err(|source| LedgerError::Corrupt { line: idx + 1, source })?;

        if let Some(previous) = entries.last()
            && entry.sequence_nr <= previous.sequence_nr
        {
            return Err(LedgerError::OutOfOrder {
                previous: previous.sequence_nr,
                found: entry.sequence_nr,
            });
        }
        entries.push(entry);
    }

    Ok(Scan { entries, valid_len })
}

fn append_blocking(
    state: &Mutex<FileLedgerState>,
    recorded_at: chrono::DateTime<chrono::Utc>,
    event: LedgerEvent,
) -> Result<LedgerEntry, LedgerError> {
    let mut state = state
        .lock()
        .map_err(|_| LedgerError::Unavailable("file ledger lock poisoned".into()))?;

    if let Some(reason) = &state.failed {
        return Err(LedgerError::Unavailable(format!(
            "file ledger disabled after a failed rollback: {reason}"
        )));
    }

    let entry = LedgerEntry::new(state.next_sequence_nr, recorded_at, event);
    let mut line = serde_json::to_vec(&entry).map_err(LedgerError::Encode)?;
    line.push(b'\n');

    let written = match state.file.write_all(&line) {
        Ok(()) => state.file.sync_data(),
        Err(e) => Err(e),
    };

    if let Err(e) = written {
        // roll back whatever part of the line reached the file
        let committed = state.len;
        if let Err(rollback) = state.file.set_len(committed) {
            error!(
                error = %rollback,
                committed_len = committed,
                "could not roll back failed ledger append; refusing further appends"
            );
            state.failed = Some(rollback.to_string());
        }
        return Err(LedgerError::Io(e));
    }

    state.len += line.len() as u64;
    state.next_sequence_nr = state.next_sequence_nr.next();
    Ok(entry)
}

#[async_trait]
impl DeliveryLedger for FileLedger {
    async fn append(&self, event: LedgerEvent) -> Result<LedgerEntry, LedgerError> {
        let state = Arc::clone(&self.state);
        let recorded_at = self.clock.now();

        let entry = tokio::task::spawn_blocking(move || append_blocking(&state, recorded_at, event))
            .await
            .map_err(|e| LedgerError::Join(e.to_string()))??;

        debug!(
            sequence_nr = %entry.sequence_nr,
            kind = entry.event.kind(),
            delivery_id = %entry.event.delivery_id(),
            "ledger entry committed"
        );
        Ok(entry)
    }

    async fn replay(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        let path = self.path.clone();
        let state = Arc::clone(&self.state);
        tokio::task::spawn_blocking(move || {
            // holding the lock keeps a concurrent append from showing up half written
            let _guard = state
                .lock()
                .map_err(|_| LedgerError::Unavailable("file ledger lock poisoned".into()))?;
            let mut data = Vec::new();
            File::open(&path)?.read_to_end(&mut data)?;
            scan_entries(&data).map(|scan| scan.entries)
        })
        .await
        .map_err(|e| LedgerError::Join(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DeliveryId, RequesterId, Task, TaskEnvelope};
    use ulid::Ulid;

    fn created(id: u64) -> LedgerEvent {
        LedgerEvent::DeliveryCreated {
            delivery_id: DeliveryId::new(id),
            envelope: TaskEnvelope::new(Task::new(id * 10), RequesterId::from_ulid(Ulid::new())),
        }
    }

    fn confirmed(id: u64) -> LedgerEvent {
        LedgerEvent::Confirmed {
            delivery_id: DeliveryId::new(id),
        }
    }

    #[tokio::test]
    async fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");

        {
            let ledger = FileLedger::open(&path).await.unwrap();
            ledger.append(created(1)).await.unwrap();
            ledger.append(confirmed(1)).await.unwrap();
        }

        let reopened = FileLedger::open(&path).await.unwrap();
        let entries = reopened.replay().await.unwrap();
        assert_eq!(entries.len(), 2);
        match &entries[0].event {
            LedgerEvent::DeliveryCreated { delivery_id, envelope } => {
                assert_eq!(*delivery_id, DeliveryId::new(1));
                assert_eq!(envelope.task(), Task::new(10));
            }
            other => panic!("expected DeliveryCreated, got {other:?}"),
        }
        assert_eq!(entries[1].event, confirmed(1));

        // numbering continues where the previous process stopped
        let next = reopened.append(created(2)).await.unwrap();
        assert_eq!(next.sequence_nr, SequenceNr::new(3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn replay_during_appends_sees_only_whole_entries() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(FileLedger::open(dir.path().join("ledger.jsonl")).await.unwrap());

        let writer = {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move {
                for id in 1..=50 {
                    ledger.append(created(id)).await.unwrap();
                }
            })
        };

        while !writer.is_finished() {
            let entries = ledger.replay().await.unwrap();
            for (i, entry) in entries.iter().enumerate() {
                assert_eq!(entry.sequence_nr, SequenceNr::new(i as u64 + 1));
            }
        }
        writer.await.unwrap();
        assert_eq!(ledger.replay().await.unwrap().len(), 50);
    }

    #[tokio::test]
    async fn torn_tail_is_truncated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");

        {
            let ledger = FileLedger::open(&path).await.unwrap();
            ledger.append(created(1)).await.unwrap();
        }
        let good_len = std::fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(br#"{"sequence_nr":2,"recorded_at":"#).unwrap();
        }

        let ledger = FileLedger::open(&path).await.unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);
        assert_eq!(ledger.replay().await.unwrap().len(), 1);

        let entry = ledger.append(confirmed(1)).await.unwrap();
        assert_eq!(entry.sequence_nr, SequenceNr::new(2));
        assert_eq!(ledger.replay().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn corrupt_middle_line_refuses_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        std::fs::write(&path, b"not json\n").unwrap();

        let err = FileLedger::open(&path).await.err().unwrap();
        assert!(matches!(err, LedgerError::Corrupt { line: 1, .. }));
    }

    #[tokio::test]
    async fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("ledger.jsonl");

        let ledger = FileLedger::open(&path).await.unwrap();
        ledger.append(created(1)).await.unwrap();

        assert!(path.exists());
        assert_eq!(ledger.path(), path.as_path());
    }

    #[tokio::test]
    async fn failed_write_without_rollback_disables_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        {
            let ledger = FileLedger::open(&path).await.unwrap();
            ledger.append(created(1)).await.unwrap();
        }
        let len = std::fs::metadata(&path).unwrap().len();

        // a read-only handle: both the write and the truncate fail
        let state = Mutex::new(FileLedgerState {
            file: File::open(&path).unwrap(),
            len,
            next_sequence_nr: SequenceNr::new(2),
            failed: None,
        });

        let first = append_blocking(&state, chrono::Utc::now(), confirmed(1)).unwrap_err();
        assert!(matches!(first, LedgerError::Io(_)));

        let second = append_blocking(&state, chrono::Utc::now(), created(2)).unwrap_err();
        assert!(matches!(second, LedgerError::Unavailable(_)));

        // nothing reached the file, and it still opens with entry 1 intact
        let reopened = FileLedger::open(&path).await.unwrap();
        assert_eq!(reopened.replay().await.unwrap().len(), 1);
    }

    #[test]
    fn scan_rejects_sequence_going_backwards() {
        let at = chrono::Utc::now();
        let a = LedgerEntry::new(SequenceNr::new(2), at, confirmed(1));
        let b = LedgerEntry::new(SequenceNr::new(1), at, confirmed(2));
        let mut data = serde_json::to_vec(&a).unwrap();
        data.push(b'\n');
        data.extend(serde_json::to_vec(&b).unwrap());
        data.push(b'\n');

        let err = scan_entries(&data).err().unwrap();
        assert!(matches!(err, LedgerError::OutOfOrder { .. }));
    }
}
