//! Binary framing for log entries.
//!
//! An encoded entry is a fixed header followed by the opaque payload:
//! `[request_id(12) | kind(1) | term(4, LE) | index varint]`. The same
//! encoding is used in segment files, broadcast frames and entry streams, so
//! an entry round-trips byte-identically across all three.

use crate::error::{LogError, LogResult};
use crate::types::{EntryKind, LogEntry, LogIndex, RequestId, Term, REQUEST_ID_LEN};

/// Fixed portion of the entry header, before the index varint.
pub const ENTRY_HEADER_FIXED: usize = REQUEST_ID_LEN + 1 + 4;

/// Longest legal varint encoding of a u64.
const MAX_VARINT_LEN: usize = 10;

/// Appends the LEB128 encoding of `value` to `out`.
pub fn write_varint_u64(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Decodes a LEB128 u64 from the front of `buf`.
///
/// Returns the value and the number of bytes consumed. Overlong encodings
/// are rejected so every value has exactly one wire form.
pub fn read_varint_u64(buf: &[u8]) -> LogResult<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= MAX_VARINT_LEN {
            return Err(LogError::InvalidEntry {
                reason: "varint longer than 10 bytes".to_string(),
            });
        }
        if i == MAX_VARINT_LEN - 1 && byte > 0x01 {
            return Err(LogError::InvalidEntry {
                reason: "varint overflows u64".to_string(),
            });
        }
        value |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            if byte == 0 && i > 0 {
                return Err(LogError::InvalidEntry {
                    reason: "non-canonical varint".to_string(),
                });
            }
            return Ok((value, i + 1));
        }
    }
    Err(LogError::InvalidEntry {
        reason: "truncated varint".to_string(),
    })
}

/// Encodes an entry into its wire form.
pub fn encode_entry(entry: &LogEntry) -> Vec<u8> {
    let mut out = Vec::with_capacity(ENTRY_HEADER_FIXED + MAX_VARINT_LEN + entry.payload.len());
    out.extend_from_slice(entry.request_id.as_bytes());
    out.push(entry.kind.as_u8());
    out.extend_from_slice(&entry.term.as_u32().to_le_bytes());
    write_varint_u64(&mut out, entry.index.as_u64());
    out.extend_from_slice(&entry.payload);
    out
}

/// Decodes an entry from its wire form.
pub fn decode_entry(buf: &[u8]) -> LogResult<LogEntry> {
    if buf.len() < ENTRY_HEADER_FIXED + 1 {
        return Err(LogError::InvalidEntry {
            reason: format!("entry shorter than header: {} bytes", buf.len()),
        });
    }
    let mut id = [0u8; REQUEST_ID_LEN];
    id.copy_from_slice(&buf[..REQUEST_ID_LEN]);
    let kind_tag = buf[REQUEST_ID_LEN];
    let kind = EntryKind::from_u8(kind_tag).ok_or_else(|| LogError::InvalidEntry {
        reason: format!("unknown entry kind tag {kind_tag}"),
    })?;
    let mut term_bytes = [0u8; 4];
    term_bytes.copy_from_slice(&buf[REQUEST_ID_LEN + 1..ENTRY_HEADER_FIXED]);
    let (index, varint_len) = read_varint_u64(&buf[ENTRY_HEADER_FIXED..])?;
    if index == 0 {
        return Err(LogError::InvalidEntry {
            reason: "entry index 0 is reserved".to_string(),
        });
    }
    Ok(LogEntry {
        index: LogIndex::new(index),
        term: Term::new(u32::from_le_bytes(term_bytes)),
        kind,
        request_id: RequestId::from_bytes(id),
        payload: buf[ENTRY_HEADER_FIXED + varint_len..].to_vec(),
    })
}

/// Extracts the request id from an encoded entry without a full decode.
pub fn request_id_of(buf: &[u8]) -> LogResult<RequestId> {
    if buf.len() < REQUEST_ID_LEN {
        return Err(LogError::InvalidEntry {
            reason: "entry shorter than request id".to_string(),
        });
    }
    let mut id = [0u8; REQUEST_ID_LEN];
    id.copy_from_slice(&buf[..REQUEST_ID_LEN]);
    Ok(RequestId::from_bytes(id))
}

/// Extracts the log index from an encoded entry without a full decode.
pub fn index_of(buf: &[u8]) -> LogResult<LogIndex> {
    if buf.len() < ENTRY_HEADER_FIXED + 1 {
        return Err(LogError::InvalidEntry {
            reason: "entry shorter than header".to_string(),
        });
    }
    let (index, _) = read_varint_u64(&buf[ENTRY_HEADER_FIXED..])?;
    Ok(LogIndex::new(index))
}
