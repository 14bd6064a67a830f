//! File-backed rolling log.
//!
//! [`FileLog`] owns a directory of segment files plus the metadata of the
//! most recently installed snapshot. It enforces the structural invariants
//! of the replicated log: dense indices, non-decreasing terms, and a first
//! index equal to `snapshot.last_included_index + 1`.
//!
//! The log is an exclusive-writer structure: a process takes an advisory
//! lock on the directory and confines the handle to one task.

use std::fs::{self, File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::codec::{decode_entry, encode_entry};
use crate::error::{LogError, LogResult};
use crate::segment::{parse_segment_file_name, SegmentReader, SegmentWriter};
use crate::state::StateMachine;
use crate::types::{LogEntry, LogIndex, SnapshotMeta, Term};

/// Name of the advisory lock file inside the log directory.
const LOCK_FILE: &str = "LOCK";

/// Roll-over limits for segment files.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Maximum entries per segment before roll-over.
    pub max_entries_per_segment: usize,
    /// Maximum record bytes per segment before roll-over.
    pub max_bytes_per_segment: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_entries_per_segment: 16_384,
            max_bytes_per_segment: 64 * 1024 * 1024,
        }
    }
}

/// Counters exposed by the log for observability.
#[derive(Debug, Clone, Default)]
pub struct LogStats {
    /// Entries appended since open.
    pub entries_appended: u64,
    /// Segments sealed since open.
    pub segments_sealed: u64,
    /// Truncations performed.
    pub truncations: u64,
    /// Snapshots installed.
    pub snapshots_installed: u64,
}

/// Advisory exclusive lock on the log directory.
struct DirLock {
    _file: File,
}

impl DirLock {
    fn acquire(dir: &Path) -> LogResult<Self> {
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new().create(true).write(true).open(&path)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(LogError::DirectoryLocked {
                dir: dir.display().to_string(),
            });
        }
        Ok(Self { _file: file })
    }
}

#[derive(Debug, Clone)]
struct SealedSegment {
    path: PathBuf,
    first: LogIndex,
    last: LogIndex,
}

/// Durable, segmented, append-only log indexed by [`LogIndex`].
pub struct FileLog {
    dir: PathBuf,
    config: LogConfig,
    _lock: DirLock,
    sealed: Vec<SealedSegment>,
    active: Option<SegmentWriter>,
    snapshot_last: LogIndex,
    snapshot_term: Term,
    last_term: Term,
    stats: LogStats,
}

impl FileLog {
    /// Opens (or creates) the log in `dir`.
    ///
    /// `snapshot` is the metadata of the currently installed snapshot, if
    /// any; segments fully covered by it are deleted, and a torn tail
    /// record in the last segment is truncated before the log accepts
    /// writes.
    pub fn open(dir: &Path, config: LogConfig, snapshot: Option<SnapshotMeta>) -> LogResult<Self> {
        fs::create_dir_all(dir)?;
        let lock = DirLock::acquire(dir)?;
        let (snapshot_last, snapshot_term) = snapshot
            .map(|s| (s.last_included_index, s.last_included_term))
            .unwrap_or((LogIndex::ZERO, Term::ZERO));

        let mut names: Vec<(LogIndex, PathBuf)> = Vec::new();
        for dirent in fs::read_dir(dir)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(first) = parse_segment_file_name(name) {
                names.push((first, dirent.path()));
            }
        }
        names.sort_by_key(|(first, _)| *first);

        let mut sealed = Vec::new();
        let mut active = None;
        let total = names.len();
        for (i, (first, path)) in names.into_iter().enumerate() {
            let reader = SegmentReader::open(&path)?;
            let covered = match reader.last_index() {
                Some(last) => last <= snapshot_last,
                None => first <= snapshot_last,
            };
            if covered {
                info!(path = %path.display(), "removing segment covered by snapshot");
                drop(reader);
                fs::remove_file(&path)?;
                continue;
            }
            if reader.is_sealed() {
                let last = reader.last_index().ok_or_else(|| {
                    LogError::corrupt(format!("sealed segment {} is empty", path.display()))
                })?;
                sealed.push(SealedSegment { path, first, last });
            } else {
                if i + 1 != total {
                    return Err(LogError::corrupt(format!(
                        "unsealed segment {} is not the tail of the log",
                        path.display()
                    )));
                }
                drop(reader);
                let (writer, _) = SegmentReader::recover(&path)?;
                active = Some(writer);
            }
        }

        let log = Self {
            dir: dir.to_path_buf(),
            config,
            _lock: lock,
            sealed,
            active,
            snapshot_last,
            snapshot_term,
            last_term: snapshot_term,
            stats: LogStats::default(),
        };
        let mut log = log;
        log.check_contiguity()?;
        if let Some(last) = log.last_entry_index() {
            let entry = log.read(last)?.ok_or_else(|| {
                LogError::corrupt(format!("last entry {last} unreadable at open"))
            })?;
            log.last_term = entry.term;
        }
        debug!(
            dir = %dir.display(),
            first = log.first_index().as_u64(),
            last = log.last_index().as_u64(),
            segments = log.sealed.len(),
            "opened log"
        );
        Ok(log)
    }

    fn check_contiguity(&self) -> LogResult<()> {
        let mut expected = self.snapshot_last.next();
        let mut ranges: Vec<(LogIndex, Option<LogIndex>)> = self
            .sealed
            .iter()
            .map(|s| (s.first, Some(s.last)))
            .collect();
        if let Some(active) = &self.active {
            ranges.push((active.first_index(), active.last_index()));
        }
        for (i, (first, last)) in ranges.iter().enumerate() {
            // The first range may straddle the snapshot boundary; any other
            // overlap or gap is corruption.
            let ok = if i == 0 {
                *first <= expected
            } else {
                *first == expected
            };
            if !ok {
                return Err(LogError::corrupt(format!(
                    "segment starting at {} breaks contiguity (expected {})",
                    first, expected
                )));
            }
            if let Some(last) = last {
                expected = last.next();
            }
        }
        Ok(())
    }

    /// Index of the first entry logically present (`snapshot_last + 1`).
    pub fn first_index(&self) -> LogIndex {
        self.snapshot_last.next()
    }

    /// Highest index present, or `snapshot_last` when the log is empty.
    pub fn last_index(&self) -> LogIndex {
        self.last_entry_index().unwrap_or(self.snapshot_last)
    }

    fn last_entry_index(&self) -> Option<LogIndex> {
        if let Some(active) = &self.active {
            if let Some(last) = active.last_index() {
                return Some(last);
            }
        }
        self.sealed.last().map(|s| s.last)
    }

    /// Term of the most recent entry (or of the snapshot boundary).
    pub fn last_term(&self) -> Term {
        self.last_term
    }

    /// Metadata of the installed snapshot boundary, if any.
    pub fn snapshot_boundary(&self) -> Option<(LogIndex, Term)> {
        if self.snapshot_last.is_zero() {
            None
        } else {
            Some((self.snapshot_last, self.snapshot_term))
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> LogStats {
        self.stats.clone()
    }

    /// Durably appends an entry at the next index.
    ///
    /// The entry must carry the next dense index (or `LogIndex::ZERO` to
    /// have the log assign it) and a term no older than the current tail.
    pub fn append(&mut self, mut entry: LogEntry) -> LogResult<LogIndex> {
        let next = self.last_index().next();
        if entry.index.is_zero() {
            entry.index = next;
        } else if entry.index != next {
            return Err(LogError::InvalidArgument {
                msg: format!("append index {} breaks density, expected {next}", entry.index),
            });
        }
        if entry.term < self.last_term {
            return Err(LogError::InvalidArgument {
                msg: format!(
                    "append term {} older than tail term {}",
                    entry.term, self.last_term
                ),
            });
        }

        self.roll_if_needed()?;
        let active = match &mut self.active {
            Some(active) => active,
            slot => slot.insert(SegmentWriter::create(&self.dir, next)?),
        };
        active.append(&encode_entry(&entry))?;
        self.last_term = entry.term;
        self.stats.entries_appended += 1;
        Ok(entry.index)
    }

    fn roll_if_needed(&mut self) -> LogResult<()> {
        let full = match &self.active {
            Some(active) => {
                active.entry_count() >= self.config.max_entries_per_segment
                    || active.bytes_written() >= self.config.max_bytes_per_segment
            }
            None => false,
        };
        if !full {
            return Ok(());
        }
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        let first = active.first_index();
        let last = active.last_index().ok_or_else(|| {
            LogError::corrupt("rolling an empty segment".to_string())
        })?;
        let path = active.seal()?;
        self.sealed.push(SealedSegment { path, first, last });
        self.stats.segments_sealed += 1;
        Ok(())
    }

    /// Forces the active segment's records to stable storage.
    pub fn flush(&mut self) -> LogResult<()> {
        if let Some(active) = &mut self.active {
            active.flush()?;
        }
        Ok(())
    }

    fn read_encoded(&mut self, index: LogIndex) -> LogResult<Option<Vec<u8>>> {
        if index.is_zero() || index <= self.snapshot_last || index > self.last_index() {
            return Ok(None);
        }
        if let Some(active) = &mut self.active {
            if index >= active.first_index() {
                let rel = (index.as_u64() - active.first_index().as_u64()) as usize;
                return active.read_relative(rel).map(Some);
            }
        }
        let seg = self
            .sealed
            .iter()
            .find(|s| s.first <= index && index <= s.last);
        match seg {
            Some(seg) => {
                let mut reader = SegmentReader::open(&seg.path)?;
                reader.read_index(index)
            }
            None => Ok(None),
        }
    }

    /// Reads the entry at `index`. Indices at or below the snapshot
    /// boundary return None.
    pub fn read(&mut self, index: LogIndex) -> LogResult<Option<LogEntry>> {
        let Some(bytes) = self.read_encoded(index)? else {
            return Ok(None);
        };
        let entry = decode_entry(&bytes)?;
        if entry.index != index {
            return Err(LogError::corrupt(format!(
                "entry at position {index} claims index {}",
                entry.index
            )));
        }
        Ok(Some(entry))
    }

    /// Term of the entry at `index`, also answering for the snapshot
    /// boundary itself.
    pub fn term_at(&mut self, index: LogIndex) -> LogResult<Option<Term>> {
        if !self.snapshot_last.is_zero() && index == self.snapshot_last {
            return Ok(Some(self.snapshot_term));
        }
        Ok(self.read(index)?.map(|e| e.term))
    }

    /// Streams entries `[from, to]` in order into `cb`.
    ///
    /// Stops when the callback returns false, `to` is passed, or delivering
    /// the next entry would exceed `byte_budget` (0 = unlimited); at least
    /// one entry is delivered if any is in range. Returns the last index
    /// delivered (ZERO if none).
    pub fn read_range<F>(
        &mut self,
        from: LogIndex,
        to: LogIndex,
        byte_budget: u64,
        mut cb: F,
    ) -> LogResult<LogIndex>
    where
        F: FnMut(LogEntry) -> bool,
    {
        let mut idx = from.max(self.first_index());
        let end = to.min(self.last_index());
        let mut delivered = LogIndex::ZERO;
        let mut used: u64 = 0;
        while idx <= end {
            let Some(bytes) = self.read_encoded(idx)? else {
                return Err(LogError::corrupt(format!("gap at index {idx}")));
            };
            let cost = bytes.len() as u64;
            if byte_budget > 0 && used > 0 && used + cost > byte_budget {
                break;
            }
            let entry = decode_entry(&bytes)?;
            if entry.index != idx {
                return Err(LogError::corrupt(format!(
                    "entry at position {idx} claims index {}",
                    entry.index
                )));
            }
            let more = cb(entry);
            delivered = idx;
            used += cost;
            idx = idx.next();
            if !more {
                break;
            }
        }
        Ok(delivered)
    }

    /// Removes all entries with index greater than `index`. Idempotent.
    pub fn truncate_after(&mut self, index: LogIndex) -> LogResult<()> {
        if index < self.snapshot_last {
            return Err(LogError::InvalidArgument {
                msg: format!(
                    "cannot truncate below snapshot boundary {}",
                    self.snapshot_last
                ),
            });
        }
        if index >= self.last_index() {
            return Ok(());
        }
        self.stats.truncations += 1;

        // Drop whole segments that start past the cut.
        if let Some(active) = &self.active {
            if active.first_index() > index {
                let path = active.path().to_path_buf();
                self.active = None;
                fs::remove_file(&path)?;
            }
        }
        while self.sealed.last().is_some_and(|s| s.first > index) {
            if let Some(seg) = self.sealed.pop() {
                fs::remove_file(&seg.path)?;
            }
        }

        // Cut inside the segment now holding the boundary, if needed.
        if let Some(active) = &mut self.active {
            if active.last_index().is_some_and(|last| last > index) {
                let keep = (index.as_u64() + 1 - active.first_index().as_u64()) as usize;
                active.truncate_to(keep)?;
            }
        } else if let Some(seg) = self.sealed.last().cloned() {
            if seg.last > index {
                self.sealed.pop();
                let mut writer = Self::reopen_sealed_as_active(&seg.path, seg.first)?;
                let keep = (index.as_u64() + 1 - seg.first.as_u64()) as usize;
                writer.truncate_to(keep)?;
                self.active = Some(writer);
            }
        }

        self.last_term = match self.last_entry_index() {
            Some(last) => {
                self.read(last)?
                    .ok_or_else(|| LogError::corrupt(format!("entry {last} vanished")))?
                    .term
            }
            None => self.snapshot_term,
        };
        info!(up_to = index.as_u64(), "truncated log tail");
        Ok(())
    }

    /// Strips a sealed segment's footer so it can be appended to again.
    fn reopen_sealed_as_active(path: &Path, first: LogIndex) -> LogResult<SegmentWriter> {
        let reader = SegmentReader::open(path)?;
        let offsets = reader.offsets().to_vec();
        let data_len = reader.data_len();
        drop(reader);
        SegmentWriter::reopen(path.to_path_buf(), first, offsets, data_len)
    }

    /// Atomically advances the snapshot boundary to `meta`, deleting fully
    /// covered segments. Entries at or below the boundary become
    /// unreadable; the first index becomes `meta.last_included_index + 1`.
    pub fn install_snapshot(&mut self, meta: SnapshotMeta) -> LogResult<()> {
        let boundary = meta.last_included_index;
        if boundary <= self.snapshot_last {
            return Ok(());
        }
        self.sealed.retain(|seg| {
            if seg.last <= boundary {
                if let Err(e) = fs::remove_file(&seg.path) {
                    warn!(path = %seg.path.display(), error = %e, "failed to remove pruned segment");
                }
                false
            } else {
                true
            }
        });
        if let Some(active) = &self.active {
            let covered = match active.last_index() {
                Some(last) => last <= boundary,
                None => true,
            };
            if covered {
                let path = active.path().to_path_buf();
                self.active = None;
                fs::remove_file(&path)?;
            }
        }
        self.snapshot_last = boundary;
        self.snapshot_term = meta.last_included_term;
        if self.last_term < meta.last_included_term {
            self.last_term = meta.last_included_term;
        }
        self.stats.snapshots_installed += 1;
        self.sync_dir()?;
        info!(
            last_included = boundary.as_u64(),
            term = meta.last_included_term.as_u32(),
            "installed snapshot boundary"
        );
        Ok(())
    }

    fn sync_dir(&self) -> LogResult<()> {
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    /// Applies entries `sm.last_applied() + 1 ..= up_to` in order.
    ///
    /// Stops early when the machine signals backpressure via
    /// [`StateMachine::ready`]. Returns the machine's final applied index.
    pub fn feed_state_machine<S>(&mut self, sm: &mut S, up_to: LogIndex) -> LogResult<LogIndex>
    where
        S: StateMachine + ?Sized,
    {
        let target = up_to.min(self.last_index());
        let mut applied = sm.last_applied();
        while applied < target {
            if !sm.ready() {
                break;
            }
            let next = applied.next();
            let entry = self
                .read(next)?
                .ok_or_else(|| LogError::corrupt(format!("gap at index {next} while feeding")))?;
            sm.apply(&entry)?;
            applied = next;
        }
        Ok(applied)
    }

    /// Path of the segment containing `index`, if present.
    pub fn find_segment_of(&self, index: LogIndex) -> Option<PathBuf> {
        if index.is_zero() || index <= self.snapshot_last {
            return None;
        }
        if let Some(active) = &self.active {
            if index >= active.first_index() && Some(index) <= active.last_index() {
                return Some(active.path().to_path_buf());
            }
        }
        self.sealed
            .iter()
            .find(|s| s.first <= index && index <= s.last)
            .map(|s| s.path.clone())
    }

    /// Paths of sealed segments wholly before `index`, in index order.
    pub fn list_segments_before(&self, index: LogIndex) -> Vec<PathBuf> {
        self.sealed
            .iter()
            .filter(|s| s.last < index)
            .map(|s| s.path.clone())
            .collect()
    }
}
