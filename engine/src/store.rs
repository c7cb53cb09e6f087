//! Durable queue store.
//!
//! Pending commits live in an append-only log (see [`crate::log`]) and in an
//! in-memory index rebuilt from that log on open. Every mutation is written
//! and synced to disk before the in-memory view changes, so a successful
//! call is never lost by a crash.
//!
//! All operations take one mutex for their own duration only. Nothing here
//! blocks on the network.
//!
//! A store holds an exclusive lock on `<queue>.lock` for as long as it is
//! open. A second store on the same path fails with [`StorageError::Locked`]
//! instead of building a diverging view of the log.

use crate::commit::{Commit, CommitId};
use crate::error::StorageError;
use crate::log::{self, LogEvent};
use crate::{Sequence, Timestamp};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Compaction kicks in once the log holds at least this many frames...
const COMPACT_MIN_FRAMES: usize = 256;
/// ...and dead frames outnumber live entries by this factor.
const COMPACT_RATIO: usize = 4;

/// A commit waiting for delivery, plus store bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    /// Position in the queue; assigned at append time, never reused
    pub seq: Sequence,
    /// The commit to deliver
    pub commit: Commit,
    /// Failed delivery attempts so far
    pub attempts: u32,
    /// Earliest time the next attempt may start
    pub next_attempt_at: Option<Timestamp>,
    /// Message of the most recent failure
    pub last_error: Option<String>,
}

/// What [`QueueStore::recover`] found on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    /// Entries still pending after replay
    pub pending: usize,
    /// Valid frames replayed
    pub frames: usize,
    /// Bytes of torn trailing frame that were truncated
    pub truncated_bytes: u64,
}

struct Inner {
    file: File,
    /// Length of the valid log prefix.
    len: u64,
    /// Frames currently in the log.
    frames: usize,
    entries: BTreeMap<Sequence, QueueEntry>,
    by_commit: HashMap<CommitId, Sequence>,
    next_seq: Sequence,
}

/// Crash-safe FIFO of pending commits backed by a single log file.
pub struct QueueStore {
    path: PathBuf,
    inner: Mutex<Inner>,
    /// Held for the lifetime of the store; dropping it releases the lock.
    _lock: File,
}

impl std::fmt::Debug for QueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl QueueStore {
    /// Open (or create) the queue at `path` and recover its contents.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }

        let lock = acquire_lock(&path)?;
        let file = open_log(&path)?;
        let store = Self {
            path,
            _lock: lock,
            inner: Mutex::new(Inner {
                file,
                len: 0,
                frames: 0,
                entries: BTreeMap::new(),
                by_commit: HashMap::new(),
                next_seq: 1,
            }),
        };
        store.recover()?;
        Ok(store)
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rebuild the in-memory view from the log.
    ///
    /// A torn trailing frame is dropped and truncated away. A damaged frame
    /// followed by valid data is reported as [`StorageError::Corrupt`].
    pub fn recover(&self) -> Result<RecoveryReport, StorageError> {
        let mut inner = self.lock()?;

        let bytes = fs::read(&self.path).map_err(|e| StorageError::io(&self.path, e))?;
        let scan = log::scan(&bytes).map_err(|c| StorageError::Corrupt {
            path: self.path.clone(),
            offset: c.offset,
            reason: c.reason,
        })?;

        if scan.torn_bytes > 0 {
            tracing::warn!(
                path = %self.path.display(),
                torn_bytes = scan.torn_bytes,
                "Truncating torn frame at end of queue log"
            );
            inner
                .file
                .set_len(scan.valid_len)
                .and_then(|_| inner.file.sync_data())
                .map_err(|e| StorageError::io(&self.path, e))?;
        }

        let mut entries = BTreeMap::new();
        let mut by_commit = HashMap::new();
        let mut next_seq: Sequence = 1;

        for event in &scan.events {
            match event {
                LogEvent::Append { entry } => {
                    entry
                        .commit
                        .validate()
                        .map_err(|source| StorageError::InvalidEntry {
                            seq: entry.seq,
                            source,
                        })?;
                    next_seq = next_seq.max(entry.seq + 1);
                    by_commit.insert(entry.commit.commit_id(), entry.seq);
                    entries.insert(entry.seq, entry.clone());
                }
                LogEvent::Attempt {
                    seq,
                    attempts,
                    next_attempt_at,
                    last_error,
                } => {
                    if let Some(entry) = entries.get_mut(seq) {
                        entry.attempts = *attempts;
                        entry.next_attempt_at = *next_attempt_at;
                        entry.last_error = last_error.clone();
                    }
                }
                LogEvent::Remove { seq } => {
                    if let Some(entry) = entries.remove(seq) {
                        by_commit.remove(&entry.commit.commit_id());
                    }
                    next_seq = next_seq.max(seq + 1);
                }
            }
        }

        inner.len = scan.valid_len;
        inner.frames = scan.events.len();
        inner.entries = entries;
        inner.by_commit = by_commit;
        inner.next_seq = next_seq;

        let report = RecoveryReport {
            pending: inner.entries.len(),
            frames: inner.frames,
            truncated_bytes: scan.torn_bytes,
        };

        tracing::debug!(
            path = %self.path.display(),
            pending = report.pending,
            frames = report.frames,
            "Recovered queue log"
        );

        self.maybe_compact(&mut inner);

        Ok(report)
    }

    /// Append a commit. Returns once the entry is synced to disk.
    ///
    /// Enqueueing a commit whose id is already pending is a no-op that
    /// returns the existing sequence number.
    pub fn enqueue(&self, commit: Commit) -> Result<Sequence, StorageError> {
        let mut inner = self.lock()?;

        if let Some(seq) = inner.by_commit.get(&commit.commit_id()) {
            tracing::debug!(seq = *seq, commit_id = %commit.commit_id(), "Commit already queued");
            return Ok(*seq);
        }

        let seq = inner.next_seq;
        let entry = QueueEntry {
            seq,
            commit,
            attempts: 0,
            next_attempt_at: None,
            last_error: None,
        };

        self.append(
            &mut inner,
            &LogEvent::Append {
                entry: entry.clone(),
            },
        )?;

        inner.next_seq = seq + 1;
        inner.by_commit.insert(entry.commit.commit_id(), seq);
        inner.entries.insert(seq, entry);

        Ok(seq)
    }

    /// Number of pending entries.
    pub fn len(&self) -> Result<usize, StorageError> {
        Ok(self.lock()?.entries.len())
    }

    /// Check whether nothing is pending.
    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.lock()?.entries.is_empty())
    }

    /// The entry with the lowest sequence number, left in place.
    pub fn peek_oldest(&self) -> Result<Option<QueueEntry>, StorageError> {
        Ok(self.lock()?.entries.values().next().cloned())
    }

    /// Look up one entry.
    pub fn get(&self, seq: Sequence) -> Result<Option<QueueEntry>, StorageError> {
        Ok(self.lock()?.entries.get(&seq).cloned())
    }

    /// All pending entries in FIFO order.
    pub fn entries(&self) -> Result<Vec<QueueEntry>, StorageError> {
        Ok(self.lock()?.entries.values().cloned().collect())
    }

    /// Delete a delivered entry. Removing an unknown sequence is a no-op.
    ///
    /// Returns whether an entry was removed.
    pub fn remove(&self, seq: Sequence) -> Result<bool, StorageError> {
        let mut inner = self.lock()?;

        if !inner.entries.contains_key(&seq) {
            return Ok(false);
        }

        self.append(&mut inner, &LogEvent::Remove { seq })?;

        if let Some(entry) = inner.entries.remove(&seq) {
            inner.by_commit.remove(&entry.commit.commit_id());
        }

        self.maybe_compact(&mut inner);
        Ok(true)
    }

    /// Persist a failed delivery attempt.
    ///
    /// Returns the updated entry, or `None` if it is no longer queued.
    pub fn record_failure(
        &self,
        seq: Sequence,
        next_attempt_at: Option<Timestamp>,
        error: &str,
    ) -> Result<Option<QueueEntry>, StorageError> {
        let mut inner = self.lock()?;

        let Some(current) = inner.entries.get(&seq) else {
            return Ok(None);
        };
        let attempts = current.attempts.saturating_add(1);

        self.append(
            &mut inner,
            &LogEvent::Attempt {
                seq,
                attempts,
                next_attempt_at,
                last_error: Some(error.to_string()),
            },
        )?;

        let entry = inner.entries.get_mut(&seq).map(|entry| {
            entry.attempts = attempts;
            entry.next_attempt_at = next_attempt_at;
            entry.last_error = Some(error.to_string());
            entry.clone()
        });

        self.maybe_compact(&mut inner);
        Ok(entry)
    }

    /// Rewrite the log so it only holds live entries.
    pub fn compact(&self) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        self.compact_locked(&mut inner)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StorageError> {
        self.inner.lock().map_err(|_| StorageError::Poisoned)
    }

    /// Write one frame and sync it. On failure the log is cut back to its
    /// previous length so a half-written frame cannot sit in front of later
    /// appends.
    fn append(&self, inner: &mut Inner, event: &LogEvent) -> Result<(), StorageError> {
        let frame = log::encode_frame(event)?;

        let written = inner
            .file
            .write_all(&frame)
            .and_then(|_| inner.file.sync_data());

        if let Err(e) = written {
            if let Err(rollback) = inner.file.set_len(inner.len) {
                tracing::error!(
                    path = %self.path.display(),
                    error = %rollback,
                    "Failed to roll back partial queue write"
                );
            }
            return Err(StorageError::io(&self.path, e));
        }

        inner.len += frame.len() as u64;
        inner.frames += 1;
        Ok(())
    }

    /// Compact when the log has grown stale. Runs after a mutation that is
    /// already durable, so a failure here is logged and the old log kept.
    fn maybe_compact(&self, inner: &mut Inner) {
        let live = inner.entries.len();
        // A drained log compacts down to at most one sequence marker.
        let drained = live == 0 && inner.frames > 1;
        let bloated =
            inner.frames >= COMPACT_MIN_FRAMES && inner.frames > live.saturating_mul(COMPACT_RATIO);

        if drained || bloated {
            if let Err(e) = self.compact_locked(inner) {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Queue log compaction failed; keeping the current log"
                );
            }
        }
    }

    fn compact_locked(&self, inner: &mut Inner) -> Result<(), StorageError> {
        let tmp = tmp_path(&self.path);

        let mut image = Vec::new();
        for entry in inner.entries.values() {
            image.extend(log::encode_frame(&LogEvent::Append {
                entry: entry.clone(),
            })?);
        }

        // The highest sequence must survive even when nothing is pending, or
        // sequence numbers would restart after a drained queue is reopened.
        let mut frames = inner.entries.len();
        if inner.entries.is_empty() && inner.next_seq > 1 {
            image.extend(log::encode_frame(&LogEvent::Remove {
                seq: inner.next_seq - 1,
            })?);
            frames += 1;
        }

        // The append handle is opened on the temp file before the rename, so
        // once the rename lands it already points at the live log.
        let file = match write_image(&tmp, &image) {
            Ok(file) => file,
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                return Err(e);
            }
        };
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(StorageError::io(&self.path, e));
        }
        sync_parent(&self.path);

        inner.file = file;
        inner.len = image.len() as u64;
        inner.frames = frames;

        tracing::debug!(
            path = %self.path.display(),
            pending = inner.entries.len(),
            "Compacted queue log"
        );
        Ok(())
    }
}

fn write_image(tmp: &Path, image: &[u8]) -> Result<File, StorageError> {
    let mut file = File::create(tmp).map_err(|e| StorageError::io(tmp, e))?;
    file.write_all(image)
        .and_then(|_| file.sync_all())
        .map_err(|e| StorageError::io(tmp, e))?;
    open_log(tmp)
}

fn acquire_lock(path: &Path) -> Result<File, StorageError> {
    let lock_path = lock_path(path);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .map_err(|e| StorageError::io(&lock_path, e))?;
    file.try_lock_exclusive()
        .map_err(|_| StorageError::Locked(path.to_path_buf()))?;
    Ok(file)
}

fn open_log(path: &Path) -> Result<File, StorageError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StorageError::io(path, e))
}

fn tmp_path(path: &Path) -> PathBuf {
    with_suffix(path, ".tmp")
}

fn lock_path(path: &Path) -> PathBuf {
    with_suffix(path, ".lock")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

/// Make a rename durable. Best effort: not every platform can open a
/// directory for syncing.
fn sync_parent(path: &Path) {
    #[cfg(unix)]
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}
