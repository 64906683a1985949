//! Log record variants and their on-disk framing.

use crate::common::{Block, TransactionId};
use crate::error::{DbError, Result};
use crate::lsn::Lsn;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// A physiological before/after image captured at a page offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub offset: u32,
    pub before: Vec<u8>,
    pub after: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogRecord {
    Start { tx: TransactionId },
    Commit { tx: TransactionId },
    Rollback { tx: TransactionId },
    NQCheck { active: Vec<TransactionId> },
    Insert { tx: TransactionId, block: Block, image: Image },
    Delete { tx: TransactionId, block: Block, image: Image },
    Ready { tx: TransactionId, host: String },
    NotReady { tx: TransactionId },
    Prepare { tx: TransactionId, participants: Vec<String> },
    XaCommit { tx: TransactionId, participants: Vec<String> },
    XaAbort { tx: TransactionId, participants: Vec<String> },
}

impl LogRecord {
    pub fn tx(&self) -> TransactionId {
        match self {
            LogRecord::Start { tx }
            | LogRecord::Commit { tx }
            | LogRecord::Rollback { tx }
            | LogRecord::Insert { tx, .. }
            | LogRecord::Delete { tx, .. }
            | LogRecord::Ready { tx, .. }
            | LogRecord::NotReady { tx }
            | LogRecord::Prepare { tx, .. }
            | LogRecord::XaCommit { tx, .. }
            | LogRecord::XaAbort { tx, .. } => *tx,
            LogRecord::NQCheck { .. } => 0,
        }
    }
}

/// A record together with the LSN the allocator assigned it and the time it was written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub lsn: Lsn,
    pub record: LogRecord,
}

/// Encodes a frame with a length prefix *and* suffix, so scans can run forward or backward:
/// `u32 size | payload[size] | u32 size`.
pub fn encode_frame(entry: &LogEntry) -> Result<Vec<u8>> {
    let payload = bincode::serde::encode_to_vec(entry, bincode::config::standard())?;
    let mut checksum = crc32fast::Hasher::new();
    checksum.update(&payload);
    let crc = checksum.finalize();

    let size = (payload.len() + 4) as u32; // payload + trailing crc
    let mut buf = Vec::with_capacity(4 + payload.len() + 4 + 4);
    buf.extend_from_slice(&size.to_be_bytes());
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&crc.to_be_bytes());
    buf.extend_from_slice(&size.to_be_bytes());
    Ok(buf)
}

/// Reads one frame forward from `r`, positioned at a length prefix. Returns `None` at clean EOF.
pub fn read_frame_forward<R: Read>(r: &mut R) -> Result<Option<LogEntry>> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(DbError::Io(e)),
    }
    let size = u32::from_be_bytes(len_buf) as usize;
    decode_body(r, size)
}

fn decode_body<R: Read>(r: &mut R, size: usize) -> Result<Option<LogEntry>> {
    if size < 4 {
        return Err(DbError::Corruption(format!("frame size {size} too small for checksum")));
    }
    let mut body = vec![0u8; size];
    r.read_exact(&mut body).map_err(DbError::Io)?;
    let mut suffix_buf = [0u8; 4];
    r.read_exact(&mut suffix_buf).map_err(DbError::Io)?;
    let suffix = u32::from_be_bytes(suffix_buf);
    if suffix as usize != size {
        return Err(DbError::Corruption(format!(
            "frame length mismatch: prefix {size} suffix {suffix}"
        )));
    }
    let (payload, crc_buf) = body.split_at(size - 4);
    let expected_crc = u32::from_be_bytes(crc_buf.try_into().unwrap());
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    if hasher.finalize() != expected_crc {
        return Err(DbError::Corruption("checksum mismatch".into()));
    }
    let (entry, _): (LogEntry, usize) =
        bincode::serde::decode_from_slice(payload, bincode::config::standard())?;
    Ok(Some(entry))
}

/// Reads one frame backward, with `pos` pointing just past the trailing length suffix. Returns the
/// entry plus the new position (just before the leading length prefix), or `None` at the file start.
pub fn read_frame_backward(file: &mut std::fs::File, pos: u64) -> Result<Option<(LogEntry, u64)>> {
    use std::io::{Seek, SeekFrom};
    if pos < 4 {
        return Ok(None);
    }
    file.seek(SeekFrom::Start(pos - 4)).map_err(DbError::Io)?;
    let mut suffix_buf = [0u8; 4];
    file.read_exact(&mut suffix_buf).map_err(DbError::Io)?;
    let size = u32::from_be_bytes(suffix_buf) as u64;
    let frame_start = pos.checked_sub(4 + size + 4).ok_or_else(|| {
        DbError::Corruption("frame suffix points before file start".into())
    })?;
    file.seek(SeekFrom::Start(frame_start)).map_err(DbError::Io)?;
    let entry = read_frame_forward(file)?
        .ok_or_else(|| DbError::Corruption("expected frame, found EOF".into()))?;
    Ok(Some((entry, frame_start)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LogEntry {
        LogEntry {
            lsn: 42,
            record: LogRecord::Insert {
                tx: 7,
                block: Block::new("/data/t1", 3),
                image: Image { offset: 10, before: vec![], after: vec![1, 2, 3] },
            },
        }
    }

    #[test]
    fn round_trips_forward() {
        let entry = sample();
        let bytes = encode_frame(&entry).unwrap();
        let mut cursor = std::io::Cursor::new(bytes);
        let decoded = read_frame_forward(&mut cursor).unwrap().unwrap();
        assert_eq!(decoded.lsn, entry.lsn);
        assert_eq!(decoded.record, entry.record);
        assert!(read_frame_forward(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn detects_checksum_corruption() {
        let entry = sample();
        let mut bytes = encode_frame(&entry).unwrap();
        let last = bytes.len() - 5;
        bytes[last] ^= 0xFF;
        let mut cursor = std::io::Cursor::new(bytes);
        assert!(read_frame_forward(&mut cursor).is_err());
    }
}
