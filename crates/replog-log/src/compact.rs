//! Log compaction.
//!
//! A compaction run feeds the log prefix `[first_index, target]` into a
//! state machine, streams the machine's serialized state into a new
//! snapshot file, installs the snapshot boundary into the log, and lets the
//! log delete the segments it has made obsolete.
//!
//! The error enum mirrors the `rlog-compact` tool's exit codes so the
//! binary stays a thin shell around [`run_compaction`].

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use crate::error::LogError;
use crate::log::{FileLog, LogConfig};
use crate::snapshot::{self, SnapshotFile, SnapshotWriter};
use crate::state::StateMachine;
use crate::types::{LogIndex, SnapshotMeta};

/// Highest accepted compression level.
pub const MAX_COMPRESSION_LEVEL: u32 = 9;

/// Compaction failures, each with a distinct process exit code.
#[derive(Debug, Error)]
pub enum CompactError {
    /// Unrecoverable failure.
    #[error("compaction failed: {0}")]
    Fatal(String),

    /// No target snapshot path was supplied.
    #[error("missing target snapshot path")]
    MissingTarget,

    /// The named state machine is not available.
    #[error("missing state machine: {name}")]
    MissingStateMachine {
        /// The unresolvable machine name.
        name: String,
    },

    /// Neither an explicit compaction index nor a peer to derive one from.
    #[error("missing compaction index or peer")]
    MissingIndex,

    /// The requested index is not present in the log.
    #[error("index {index} not present in log")]
    IndexNotInLog {
        /// The rejected index.
        index: LogIndex,
    },

    /// The state machine cannot serialize its state.
    #[error("state machine lacks serialization capability")]
    NotSerializable,

    /// Compression level outside `[0, 9]`.
    #[error("invalid compression level {level}")]
    InvalidCompressionLevel {
        /// The rejected level.
        level: u32,
    },

    /// The data root directory does not exist.
    #[error("missing data root {path}")]
    MissingDataRoot {
        /// The missing directory.
        path: String,
    },
}

impl CompactError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            CompactError::Fatal(_) => 1,
            CompactError::MissingTarget => 2,
            CompactError::MissingStateMachine { .. } => 3,
            CompactError::MissingIndex => 4,
            CompactError::IndexNotInLog { .. } => 5,
            CompactError::NotSerializable => 6,
            CompactError::InvalidCompressionLevel { .. } => 7,
            CompactError::MissingDataRoot { .. } => 8,
        }
    }
}

impl From<LogError> for CompactError {
    fn from(e: LogError) -> Self {
        CompactError::Fatal(e.to_string())
    }
}

/// Inputs to a compaction run.
#[derive(Debug, Clone)]
pub struct CompactionOptions {
    /// Root of the node's data directory.
    pub data_root: PathBuf,
    /// Target snapshot file path.
    pub snapshot_path: Option<PathBuf>,
    /// Override for the log directory (default `<data_root>/log`).
    pub log_dir: Option<PathBuf>,
    /// Compaction index; must already be resolved (explicitly or from a
    /// peer) before the run starts.
    pub target_index: Option<LogIndex>,
    /// zstd level `[0, 9]`; 0 stores the state uncompressed.
    pub compression_level: u32,
    /// Whether the stored (compressed) bytes are served verbatim to
    /// followers, or decompressed by the serving node.
    pub serve_compressed: bool,
}

impl CompactionOptions {
    /// Options with defaults for everything but the data root.
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            snapshot_path: None,
            log_dir: None,
            target_index: None,
            compression_level: 0,
            serve_compressed: false,
        }
    }

    /// Effective log directory.
    pub fn effective_log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.data_root.join("log"))
    }
}

/// Result of a successful compaction run.
#[derive(Debug)]
pub struct CompactionReport {
    /// Metadata of the produced snapshot.
    pub meta: SnapshotMeta,
    /// Where the snapshot landed.
    pub snapshot_path: PathBuf,
    /// Entries fed into the state machine during this run.
    pub entries_applied: u64,
    /// True if the stored data is zstd-compressed.
    pub compressed: bool,
}

/// Compresses snapshot state with zstd at `level` (1..=9).
pub fn compress_state(data: &[u8], level: u32) -> Result<Vec<u8>, CompactError> {
    zstd::encode_all(data, level as i32).map_err(|e| CompactError::Fatal(e.to_string()))
}

/// Decompresses zstd-compressed snapshot state.
pub fn decompress_state(data: &[u8]) -> Result<Vec<u8>, CompactError> {
    zstd::decode_all(data).map_err(|e| CompactError::Fatal(e.to_string()))
}

/// Runs a compaction against the log under `opts.data_root`.
///
/// The supplied state machine must already reflect any previously installed
/// snapshot (`last_applied == log.first_index() - 1`).
pub fn run_compaction<S>(opts: &CompactionOptions, sm: &mut S) -> Result<CompactionReport, CompactError>
where
    S: StateMachine + ?Sized,
{
    if opts.compression_level > MAX_COMPRESSION_LEVEL {
        return Err(CompactError::InvalidCompressionLevel {
            level: opts.compression_level,
        });
    }
    if !opts.data_root.is_dir() {
        return Err(CompactError::MissingDataRoot {
            path: opts.data_root.display().to_string(),
        });
    }
    let snapshot_path = opts
        .snapshot_path
        .clone()
        .ok_or(CompactError::MissingTarget)?;
    let target = opts.target_index.ok_or(CompactError::MissingIndex)?;

    let prior = existing_snapshot_meta(&snapshot_path)?;
    let mut log = FileLog::open(&opts.effective_log_dir(), LogConfig::default(), prior)?;

    if target < log.first_index() || target > log.last_index() {
        return Err(CompactError::IndexNotInLog { index: target });
    }
    if sm.last_applied().next() < log.first_index() {
        return Err(CompactError::Fatal(format!(
            "state machine applied through {} but log starts at {}",
            sm.last_applied(),
            log.first_index()
        )));
    }

    let before = sm.last_applied();
    let applied = log.feed_state_machine(sm, target)?;
    if applied != target {
        return Err(CompactError::Fatal(format!(
            "state machine stalled at {applied}, target {target}"
        )));
    }

    let state = sm.serialize().ok_or(CompactError::NotSerializable)?;
    let (data, compressed) = if opts.compression_level > 0 {
        (compress_state(&state, opts.compression_level)?, true)
    } else {
        (state, false)
    };
    let term = log
        .term_at(target)?
        .ok_or_else(|| CompactError::Fatal(format!("no term for target {target}")))?;

    if let Some(dir) = snapshot_path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| CompactError::Fatal(e.to_string()))?;
        snapshot::sweep_stale(dir)?;
    }
    let meta = SnapshotMeta {
        last_included_index: target,
        last_included_term: term,
        data_size: data.len() as u64,
    };
    let mut writer = SnapshotWriter::create(&snapshot_path, meta)?;
    writer.write_chunk(&data)?;
    let snap = writer.finish()?;

    log.install_snapshot(snap.meta())?;

    let report = CompactionReport {
        meta: snap.meta(),
        snapshot_path,
        entries_applied: target.as_u64() - before.as_u64(),
        compressed,
    };
    info!(
        target = target.as_u64(),
        entries = report.entries_applied,
        bytes = report.meta.data_size,
        compressed = report.compressed,
        "compaction complete"
    );
    Ok(report)
}

fn existing_snapshot_meta(path: &Path) -> Result<Option<SnapshotMeta>, CompactError> {
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(SnapshotFile::open(path)?.meta()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::VecState;
    use crate::types::{LogEntry, RequestId, Term};

    fn entry(index: u64) -> LogEntry {
        LogEntry::state(
            LogIndex::new(index),
            Term::new(1),
            RequestId::from_parts(1_700_000_000_000 + index, index),
            format!("payload-{index}").into_bytes(),
        )
    }

    fn seed_log(root: &Path, count: u64) {
        let mut log = FileLog::open(
            &root.join("log"),
            LogConfig {
                max_entries_per_segment: 100,
                max_bytes_per_segment: 1024 * 1024,
            },
            None,
        )
        .unwrap();
        for i in 1..=count {
            log.append(entry(i)).unwrap();
        }
        log.flush().unwrap();
    }

    #[test]
    fn test_compaction_install() {
        let dir = tempfile::tempdir().unwrap();
        seed_log(dir.path(), 1000);

        let mut opts = CompactionOptions::new(dir.path());
        opts.snapshot_path = Some(dir.path().join("snap"));
        opts.target_index = Some(LogIndex::new(500));
        let mut sm = VecState::new();
        let report = run_compaction(&opts, &mut sm).unwrap();

        assert_eq!(report.meta.last_included_index, LogIndex::new(500));
        assert_eq!(report.entries_applied, 500);
        assert!(!report.compressed);

        // Post-conditions on the log.
        let snap = SnapshotFile::open(&dir.path().join("snap")).unwrap();
        let mut log = FileLog::open(&dir.path().join("log"), LogConfig::default(), Some(snap.meta()))
            .unwrap();
        assert_eq!(log.first_index(), LogIndex::new(501));
        assert!(log.read(LogIndex::new(500)).unwrap().is_none());
        assert_eq!(log.read(LogIndex::new(501)).unwrap().unwrap(), entry(501));
        assert!(log.list_segments_before(LogIndex::new(501)).is_empty());
    }

    #[test]
    fn test_compaction_compressed_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        seed_log(dir.path(), 50);

        let mut opts = CompactionOptions::new(dir.path());
        opts.snapshot_path = Some(dir.path().join("snap"));
        opts.target_index = Some(LogIndex::new(50));
        opts.compression_level = 3;
        opts.serve_compressed = true;
        let mut sm = VecState::new();
        let report = run_compaction(&opts, &mut sm).unwrap();
        assert!(report.compressed);

        let mut snap = SnapshotFile::open(&dir.path().join("snap")).unwrap();
        let stored = snap.read_all().unwrap();
        let state = decompress_state(&stored).unwrap();
        let restored = VecState::restore(&state, LogIndex::new(50)).unwrap();
        assert_eq!(restored.len(), 50);
    }

    #[test]
    fn test_compaction_error_codes() {
        let dir = tempfile::tempdir().unwrap();
        seed_log(dir.path(), 10);
        let mut sm = VecState::new();

        let mut opts = CompactionOptions::new(dir.path().join("nope"));
        opts.snapshot_path = Some(dir.path().join("snap"));
        opts.target_index = Some(LogIndex::new(5));
        assert_eq!(run_compaction(&opts, &mut sm).unwrap_err().exit_code(), 8);

        let mut opts = CompactionOptions::new(dir.path());
        opts.target_index = Some(LogIndex::new(5));
        assert_eq!(run_compaction(&opts, &mut sm).unwrap_err().exit_code(), 2);

        let mut opts = CompactionOptions::new(dir.path());
        opts.snapshot_path = Some(dir.path().join("snap"));
        assert_eq!(run_compaction(&opts, &mut sm).unwrap_err().exit_code(), 4);

        let mut opts = CompactionOptions::new(dir.path());
        opts.snapshot_path = Some(dir.path().join("snap"));
        opts.target_index = Some(LogIndex::new(99));
        assert_eq!(run_compaction(&opts, &mut sm).unwrap_err().exit_code(), 5);

        let mut opts = CompactionOptions::new(dir.path());
        opts.snapshot_path = Some(dir.path().join("snap"));
        opts.target_index = Some(LogIndex::new(5));
        opts.compression_level = 10;
        assert_eq!(run_compaction(&opts, &mut sm).unwrap_err().exit_code(), 7);
    }

    #[test]
    fn test_compaction_unserializable_machine() {
        struct Opaque(LogIndex);
        impl StateMachine for Opaque {
            fn apply(&mut self, entry: &LogEntry) -> crate::error::LogResult<()> {
                self.0 = entry.index;
                Ok(())
            }
            fn last_applied(&self) -> LogIndex {
                self.0
            }
        }

        let dir = tempfile::tempdir().unwrap();
        seed_log(dir.path(), 10);
        let mut opts = CompactionOptions::new(dir.path());
        opts.snapshot_path = Some(dir.path().join("snap"));
        opts.target_index = Some(LogIndex::new(5));
        let mut sm = Opaque(LogIndex::ZERO);
        assert_eq!(run_compaction(&opts, &mut sm).unwrap_err().exit_code(), 6);
    }

    #[test]
    fn test_second_compaction_resumes_from_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        seed_log(dir.path(), 100);

        let mut opts = CompactionOptions::new(dir.path());
        opts.snapshot_path = Some(dir.path().join("snap"));
        opts.target_index = Some(LogIndex::new(40));
        let mut sm = VecState::new();
        run_compaction(&opts, &mut sm).unwrap();

        // Second run restores the machine from the first snapshot.
        let mut snap = SnapshotFile::open(&dir.path().join("snap")).unwrap();
        let state = snap.read_all().unwrap();
        let mut sm = VecState::restore(&state, LogIndex::new(40)).unwrap();
        opts.target_index = Some(LogIndex::new(80));
        let report = run_compaction(&opts, &mut sm).unwrap();
        assert_eq!(report.meta.last_included_index, LogIndex::new(80));
        assert_eq!(report.entries_applied, 40);
        assert_eq!(sm.len(), 80);
    }
}
