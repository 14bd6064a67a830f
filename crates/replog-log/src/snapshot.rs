//! Snapshot files.
//!
//! A snapshot is a single binary file: a fixed header
//! `[last_included_index u64 LE | last_included_term u32 LE | data_size u64 LE]`
//! followed by `data_size` bytes of opaque serialized state.
//!
//! Creation streams through a temporary file beside the target and renames
//! into place on `finish`, so a crash never leaves a half-written snapshot
//! at the final path. A `ready` watch fires once the header is durable,
//! letting the snapshot-install channel stream the body while it is still
//! being written.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use rand::RngCore;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{LogError, LogResult};
use crate::types::{LogIndex, SnapshotMeta, Term};

/// Size of the fixed snapshot header in bytes.
pub const SNAPSHOT_HEADER_LEN: usize = 8 + 4 + 8;

/// Marker embedded in temporary snapshot file names.
const TMP_MARKER: &str = ".tmp-";

fn encode_header(meta: &SnapshotMeta) -> [u8; SNAPSHOT_HEADER_LEN] {
    let mut buf = [0u8; SNAPSHOT_HEADER_LEN];
    buf[0..8].copy_from_slice(&meta.last_included_index.as_u64().to_le_bytes());
    buf[8..12].copy_from_slice(&meta.last_included_term.as_u32().to_le_bytes());
    buf[12..20].copy_from_slice(&meta.data_size.to_le_bytes());
    buf
}

fn decode_header(buf: &[u8; SNAPSHOT_HEADER_LEN]) -> SnapshotMeta {
    SnapshotMeta {
        last_included_index: LogIndex::new(u64::from_le_bytes(buf[0..8].try_into().unwrap())),
        last_included_term: Term::new(u32::from_le_bytes(buf[8..12].try_into().unwrap())),
        data_size: u64::from_le_bytes(buf[12..20].try_into().unwrap()),
    }
}

/// Streaming writer producing a snapshot file atomically.
pub struct SnapshotWriter {
    file: File,
    tmp_path: PathBuf,
    final_path: PathBuf,
    meta: SnapshotMeta,
    written: u64,
    ready_tx: watch::Sender<bool>,
    finished: bool,
}

impl SnapshotWriter {
    /// Starts a snapshot at `path`, writing through a temporary beside it.
    ///
    /// The header is written and fsynced immediately; the `ready` watch
    /// flips to true once that has happened.
    pub fn create(path: &Path, meta: SnapshotMeta) -> LogResult<Self> {
        let nonce = rand::thread_rng().next_u32();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| LogError::InvalidArgument {
                msg: format!("bad snapshot path {}", path.display()),
            })?;
        let tmp_path = path.with_file_name(format!("{file_name}{TMP_MARKER}{nonce:08x}"));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;
        file.write_all(&encode_header(&meta))?;
        file.sync_data()?;
        let (ready_tx, _) = watch::channel(true);
        debug!(
            tmp = %tmp_path.display(),
            last_included = meta.last_included_index.as_u64(),
            data_size = meta.data_size,
            "snapshot header persisted"
        );
        Ok(Self {
            file,
            tmp_path,
            final_path: path.to_path_buf(),
            meta,
            written: 0,
            ready_tx,
            finished: false,
        })
    }

    /// Watch that is true once the header is durable.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    /// Appends a chunk of snapshot data.
    pub fn write_chunk(&mut self, data: &[u8]) -> LogResult<()> {
        if self.written + data.len() as u64 > self.meta.data_size {
            return Err(LogError::InvalidArgument {
                msg: format!(
                    "snapshot data overrun: {} + {} > {}",
                    self.written,
                    data.len(),
                    self.meta.data_size
                ),
            });
        }
        self.file.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Bytes of data written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Fsyncs and atomically renames the temporary into place.
    pub fn finish(mut self) -> LogResult<SnapshotFile> {
        if self.written != self.meta.data_size {
            return Err(LogError::InvalidArgument {
                msg: format!(
                    "snapshot incomplete: wrote {} of {} bytes",
                    self.written, self.meta.data_size
                ),
            });
        }
        self.file.sync_all()?;
        fs::rename(&self.tmp_path, &self.final_path)?;
        if let Some(dir) = self.final_path.parent() {
            File::open(dir)?.sync_all()?;
        }
        self.finished = true;
        info!(
            path = %self.final_path.display(),
            last_included = self.meta.last_included_index.as_u64(),
            bytes = self.meta.data_size,
            "snapshot installed"
        );
        let path = self.final_path.clone();
        SnapshotFile::open(&path)
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = fs::remove_file(&self.tmp_path) {
                warn!(tmp = %self.tmp_path.display(), error = %e, "failed to remove snapshot temp");
            }
        }
    }
}

/// An installed snapshot file, open for chunked reads.
#[derive(Debug)]
pub struct SnapshotFile {
    file: File,
    path: PathBuf,
    meta: SnapshotMeta,
}

impl SnapshotFile {
    /// Opens and validates a snapshot file.
    pub fn open(path: &Path) -> LogResult<Self> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < SNAPSHOT_HEADER_LEN as u64 {
            return Err(LogError::corrupt(format!(
                "snapshot {} shorter than header",
                path.display()
            )));
        }
        let mut header = [0u8; SNAPSHOT_HEADER_LEN];
        file.read_exact(&mut header)?;
        let meta = decode_header(&header);
        if file_len != SNAPSHOT_HEADER_LEN as u64 + meta.data_size {
            return Err(LogError::corrupt(format!(
                "snapshot {} length {} disagrees with header data_size {}",
                path.display(),
                file_len,
                meta.data_size
            )));
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
            meta,
        })
    }

    /// Snapshot coverage metadata.
    pub fn meta(&self) -> SnapshotMeta {
        self.meta
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads up to `len` data bytes starting at `offset` into the data
    /// region. Returns an empty vec at end of data.
    pub fn read_chunk(&mut self, offset: u64, len: usize) -> LogResult<Vec<u8>> {
        if offset >= self.meta.data_size {
            return Ok(Vec::new());
        }
        let take = len.min((self.meta.data_size - offset) as usize);
        self.file
            .seek(SeekFrom::Start(SNAPSHOT_HEADER_LEN as u64 + offset))?;
        let mut buf = vec![0u8; take];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Reads the full data region.
    pub fn read_all(&mut self) -> LogResult<Vec<u8>> {
        self.read_chunk(0, self.meta.data_size as usize)
    }
}

/// One-shot helper: writes `data` as a complete snapshot at `path`.
pub fn write_snapshot(
    path: &Path,
    last_included_index: LogIndex,
    last_included_term: Term,
    data: &[u8],
) -> LogResult<SnapshotFile> {
    let meta = SnapshotMeta {
        last_included_index,
        last_included_term,
        data_size: data.len() as u64,
    };
    let mut writer = SnapshotWriter::create(path, meta)?;
    writer.write_chunk(data)?;
    writer.finish()
}

/// Removes orphaned snapshot temporaries left behind by a crash.
///
/// Returns the number of files removed.
pub fn sweep_stale(dir: &Path) -> LogResult<usize> {
    let mut removed = 0;
    for dirent in fs::read_dir(dir)? {
        let dirent = dirent?;
        let name = dirent.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.contains(TMP_MARKER) {
            info!(path = %dirent.path().display(), "removing stale snapshot temp");
            fs::remove_file(dirent.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}
