//! Log segment files.
//!
//! A segment holds a contiguous run of encoded entries as length-prefixed,
//! checksummed records. Sealed segments carry an index footer mapping
//! relative entry number to byte offset so reads by index are two seeks.
//! The active (unsealed) tail segment has no footer; it is recovered by a
//! forward scan that truncates any torn record.
//!
//! File layout:
//!
//! ```text
//! record   := [len u32 LE | entry bytes | crc32(entry bytes) u32 LE]
//! footer   := [offset u32 LE] * count
//! trailer  := [count u32 LE | first_index u64 LE | footer crc32 | magic u32 LE]
//! sealed   := record* footer trailer
//! unsealed := record*
//! ```

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{LogError, LogResult};
use crate::types::LogIndex;

/// Segment footer magic: "RSEG".
pub const SEGMENT_MAGIC: u32 = 0x5253_4547;

/// File extension for segment files.
pub const SEGMENT_EXT: &str = "seg";

/// Bytes of framing around each entry (length prefix + checksum).
pub const RECORD_OVERHEAD: u64 = 8;

/// Fixed trailer bytes after the offset table.
const TRAILER_LEN: u64 = 4 + 8 + 4 + 4;

/// Largest record body accepted when scanning. Bounds torn-length damage.
const MAX_RECORD_LEN: u32 = 256 * 1024 * 1024;

/// Builds the file name for a segment starting at `first_index`.
///
/// Names are zero-padded so lexicographic directory order equals index order.
pub fn segment_file_name(first_index: LogIndex) -> String {
    format!("{:020}.{}", first_index.as_u64(), SEGMENT_EXT)
}

/// Parses a segment file name back into its first index.
pub fn parse_segment_file_name(name: &str) -> Option<LogIndex> {
    let stem = name.strip_suffix(&format!(".{SEGMENT_EXT}"))?;
    if stem.len() != 20 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse::<u64>().ok().map(LogIndex::new)
}

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Append handle for the active segment.
pub struct SegmentWriter {
    file: File,
    path: PathBuf,
    first_index: LogIndex,
    offsets: Vec<u32>,
    bytes_written: u64,
}

impl SegmentWriter {
    /// Creates a new empty segment starting at `first_index`.
    pub fn create(dir: &Path, first_index: LogIndex) -> LogResult<Self> {
        if first_index.is_zero() {
            return Err(LogError::InvalidArgument {
                msg: "segment cannot start at index 0".to_string(),
            });
        }
        let path = dir.join(segment_file_name(first_index));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        debug!(path = %path.display(), first_index = first_index.as_u64(), "created segment");
        Ok(Self {
            file,
            path,
            first_index,
            offsets: Vec::new(),
            bytes_written: 0,
        })
    }

    /// Reopens an unsealed segment for further appends after recovery.
    ///
    /// `valid_len` and `offsets` come from the recovery scan; anything past
    /// `valid_len` is discarded.
    pub fn reopen(
        path: PathBuf,
        first_index: LogIndex,
        offsets: Vec<u32>,
        valid_len: u64,
    ) -> LogResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        file.set_len(valid_len)?;
        let mut writer = Self {
            file,
            path,
            first_index,
            offsets,
            bytes_written: valid_len,
        };
        writer.file.seek(SeekFrom::End(0))?;
        Ok(writer)
    }

    /// Appends one encoded entry record.
    pub fn append(&mut self, entry_bytes: &[u8]) -> LogResult<()> {
        let record_len = entry_bytes.len() as u64 + RECORD_OVERHEAD;
        if self.bytes_written + record_len > u32::MAX as u64 {
            return Err(LogError::InvalidArgument {
                msg: "segment would exceed addressable size".to_string(),
            });
        }
        let mut record = Vec::with_capacity(entry_bytes.len() + RECORD_OVERHEAD as usize);
        record.extend_from_slice(&(entry_bytes.len() as u32).to_le_bytes());
        record.extend_from_slice(entry_bytes);
        record.extend_from_slice(&crc32(entry_bytes).to_le_bytes());
        self.file.write_all(&record)?;
        self.offsets.push(self.bytes_written as u32);
        self.bytes_written += record_len;
        Ok(())
    }

    /// First index covered by this segment.
    pub fn first_index(&self) -> LogIndex {
        self.first_index
    }

    /// Index the next appended entry will occupy.
    pub fn next_index(&self) -> LogIndex {
        LogIndex::new(self.first_index.as_u64() + self.offsets.len() as u64)
    }

    /// Highest index written so far, if any.
    pub fn last_index(&self) -> Option<LogIndex> {
        if self.offsets.is_empty() {
            None
        } else {
            Some(LogIndex::new(
                self.first_index.as_u64() + self.offsets.len() as u64 - 1,
            ))
        }
    }

    /// Number of entries written so far.
    pub fn entry_count(&self) -> usize {
        self.offsets.len()
    }

    /// Bytes of record data written so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record offsets accumulated so far (for tail reads before seal).
    pub fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    /// Reads back the encoded entry at relative position `rel`.
    ///
    /// The append position is restored afterwards, so reads and appends can
    /// interleave on the active segment.
    pub fn read_relative(&mut self, rel: usize) -> LogResult<Vec<u8>> {
        let offset = *self.offsets.get(rel).ok_or(LogError::OutOfRange {
            index: LogIndex::new(self.first_index.as_u64() + rel as u64),
        })?;
        self.file.seek(SeekFrom::Start(offset as u64))?;
        let mut len_bytes = [0u8; 4];
        self.file.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes);
        let mut body = vec![0u8; len as usize];
        self.file.read_exact(&mut body)?;
        let mut crc_bytes = [0u8; 4];
        self.file.read_exact(&mut crc_bytes)?;
        self.file.seek(SeekFrom::End(0))?;
        if crc32(&body) != u32::from_le_bytes(crc_bytes) {
            return Err(LogError::corrupt(format!(
                "checksum mismatch at index {} in {}",
                self.first_index.as_u64() + rel as u64,
                self.path.display()
            )));
        }
        Ok(body)
    }

    /// Drops every record from relative position `count` onward.
    pub fn truncate_to(&mut self, count: usize) -> LogResult<()> {
        if count >= self.offsets.len() {
            return Ok(());
        }
        let new_len = self.offsets[count] as u64;
        self.file.set_len(new_len)?;
        self.offsets.truncate(count);
        self.bytes_written = new_len;
        self.file.seek(SeekFrom::End(0))?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Forces record data to stable storage.
    pub fn flush(&mut self) -> LogResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Writes the index footer and fsyncs. Consumes the writer.
    pub fn seal(mut self) -> LogResult<PathBuf> {
        let mut footer = Vec::with_capacity(self.offsets.len() * 4 + TRAILER_LEN as usize);
        for off in &self.offsets {
            footer.extend_from_slice(&off.to_le_bytes());
        }
        footer.extend_from_slice(&(self.offsets.len() as u32).to_le_bytes());
        footer.extend_from_slice(&self.first_index.as_u64().to_le_bytes());
        let footer_crc = crc32(&footer);
        footer.extend_from_slice(&footer_crc.to_le_bytes());
        footer.extend_from_slice(&SEGMENT_MAGIC.to_le_bytes());
        self.file.write_all(&footer)?;
        self.file.sync_all()?;
        debug!(
            path = %self.path.display(),
            entries = self.offsets.len(),
            bytes = self.bytes_written,
            "sealed segment"
        );
        Ok(self.path)
    }
}

/// Outcome of opening a segment file.
pub struct SegmentReader {
    file: File,
    path: PathBuf,
    first_index: LogIndex,
    offsets: Vec<u32>,
    sealed: bool,
    /// End of valid record data (excludes any footer).
    data_len: u64,
}

impl SegmentReader {
    /// Opens a segment, preferring the footer index and falling back to a
    /// forward scan for unsealed files.
    ///
    /// A scan that finds trailing garbage reports the valid prefix; the
    /// caller decides whether to truncate (see [`SegmentReader::recover`]).
    pub fn open(path: &Path) -> LogResult<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let named_first = parse_segment_file_name(&name).ok_or_else(|| LogError::CorruptLog {
            msg: format!("bad segment file name {name}"),
        })?;
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();

        if let Some(reader) = Self::try_open_sealed(&mut file, path, named_first, file_len)? {
            return Ok(reader);
        }

        // Unsealed (or torn) segment: forward scan.
        let (offsets, data_len) = Self::scan(&mut file, file_len)?;
        if data_len < file_len {
            warn!(
                path = %path.display(),
                valid = data_len,
                total = file_len,
                "segment has torn tail"
            );
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
            first_index: named_first,
            offsets,
            sealed: false,
            data_len,
        })
    }

    /// Opens the tail segment and truncates any torn trailing record so the
    /// log can accept writes again.
    pub fn recover(path: &Path) -> LogResult<(SegmentWriter, Vec<u32>)> {
        let reader = Self::open(path)?;
        if reader.sealed {
            return Err(LogError::InvalidArgument {
                msg: format!("{} is sealed; nothing to recover", path.display()),
            });
        }
        let file_len = reader.file.metadata()?.len();
        if reader.data_len < file_len {
            warn!(
                path = %path.display(),
                dropped = file_len - reader.data_len,
                "truncating torn segment tail"
            );
        }
        let offsets = reader.offsets.clone();
        let writer =
            SegmentWriter::reopen(reader.path.clone(), reader.first_index, offsets.clone(), reader.data_len)?;
        Ok((writer, offsets))
    }

    fn try_open_sealed(
        file: &mut File,
        path: &Path,
        named_first: LogIndex,
        file_len: u64,
    ) -> LogResult<Option<Self>> {
        if file_len < TRAILER_LEN {
            return Ok(None);
        }
        file.seek(SeekFrom::End(-(TRAILER_LEN as i64)))?;
        let mut trailer = [0u8; TRAILER_LEN as usize];
        file.read_exact(&mut trailer)?;
        let magic = u32::from_le_bytes(trailer[16..20].try_into().unwrap());
        if magic != SEGMENT_MAGIC {
            return Ok(None);
        }
        let count = u32::from_le_bytes(trailer[0..4].try_into().unwrap()) as u64;
        let first_index = u64::from_le_bytes(trailer[4..12].try_into().unwrap());
        let footer_crc = u32::from_le_bytes(trailer[12..16].try_into().unwrap());
        let footer_len = count * 4 + TRAILER_LEN;
        if footer_len > file_len {
            return Ok(None);
        }
        file.seek(SeekFrom::End(-(footer_len as i64)))?;
        let mut footer = vec![0u8; (count * 4 + 12) as usize];
        file.read_exact(&mut footer)?;
        if crc32(&footer) != footer_crc {
            return Ok(None);
        }
        if first_index != named_first.as_u64() {
            return Err(LogError::CorruptLog {
                msg: format!(
                    "segment {} footer first_index {} disagrees with file name",
                    path.display(),
                    first_index
                ),
            });
        }
        let offsets: Vec<u32> = footer[..(count * 4) as usize]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        for pair in offsets.windows(2) {
            if pair[1] <= pair[0] {
                return Err(LogError::CorruptLog {
                    msg: format!("segment {} footer offsets not increasing", path.display()),
                });
            }
        }
        Ok(Some(Self {
            file: file.try_clone()?,
            path: path.to_path_buf(),
            first_index: named_first,
            offsets,
            sealed: true,
            data_len: file_len - footer_len,
        }))
    }

    fn scan(file: &mut File, file_len: u64) -> LogResult<(Vec<u32>, u64)> {
        let mut offsets = Vec::new();
        let mut pos: u64 = 0;
        file.seek(SeekFrom::Start(0))?;
        loop {
            if pos + RECORD_OVERHEAD > file_len {
                break;
            }
            let mut len_bytes = [0u8; 4];
            file.seek(SeekFrom::Start(pos))?;
            file.read_exact(&mut len_bytes)?;
            let len = u32::from_le_bytes(len_bytes);
            if len > MAX_RECORD_LEN || pos + RECORD_OVERHEAD + len as u64 > file_len {
                break;
            }
            let mut body = vec![0u8; len as usize];
            file.read_exact(&mut body)?;
            let mut crc_bytes = [0u8; 4];
            file.read_exact(&mut crc_bytes)?;
            if crc32(&body) != u32::from_le_bytes(crc_bytes) {
                break;
            }
            offsets.push(pos as u32);
            pos += RECORD_OVERHEAD + len as u64;
        }
        Ok((offsets, pos))
    }

    /// First index covered by this segment.
    pub fn first_index(&self) -> LogIndex {
        self.first_index
    }

    /// Highest index present, if any.
    pub fn last_index(&self) -> Option<LogIndex> {
        if self.offsets.is_empty() {
            None
        } else {
            Some(LogIndex::new(
                self.first_index.as_u64() + self.offsets.len() as u64 - 1,
            ))
        }
    }

    /// Number of entries present.
    pub fn entry_count(&self) -> usize {
        self.offsets.len()
    }

    /// True if the segment carries a valid footer.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Byte offsets of each record, in order.
    pub fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    /// End of valid record data (excludes any footer).
    pub fn data_len(&self) -> u64 {
        self.data_len
    }

    /// Reads the encoded entry at relative position `rel`.
    pub fn read_relative(&mut self, rel: usize) -> LogResult<Vec<u8>> {
        let offset = *self.offsets.get(rel).ok_or(LogError::OutOfRange {
            index: LogIndex::new(self.first_index.as_u64() + rel as u64),
        })?;
        self.file.seek(SeekFrom::Start(offset as u64))?;
        let mut len_bytes = [0u8; 4];
        self.file.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes);
        if offset as u64 + RECORD_OVERHEAD + len as u64 > self.data_len {
            return Err(LogError::corrupt(format!(
                "record at offset {} overruns segment {}",
                offset,
                self.path.display()
            )));
        }
        let mut body = vec![0u8; len as usize];
        self.file.read_exact(&mut body)?;
        let mut crc_bytes = [0u8; 4];
        self.file.read_exact(&mut crc_bytes)?;
        if crc32(&body) != u32::from_le_bytes(crc_bytes) {
            return Err(LogError::corrupt(format!(
                "checksum mismatch at index {} in {}",
                self.first_index.as_u64() + rel as u64,
                self.path.display()
            )));
        }
        Ok(body)
    }

    /// Reads the encoded entry with absolute index `index`, if present here.
    pub fn read_index(&mut self, index: LogIndex) -> LogResult<Option<Vec<u8>>> {
        if index < self.first_index {
            return Ok(None);
        }
        let rel = (index.as_u64() - self.first_index.as_u64()) as usize;
        if rel >= self.offsets.len() {
            return Ok(None);
        }
        self.read_relative(rel).map(Some)
    }
}
