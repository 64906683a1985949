//! Append-only log file: durable writes plus forward/backward scans.

use crate::error::{DbError, Result};
use crate::log::record::{encode_frame, read_frame_backward, read_frame_forward, LogEntry};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A single append-only log file opened for durable read-write. One `LogFileStore` backs one
/// physical file (`active.log` or `xa.log`); archival beyond `target_log_size` is signaled to the
/// caller (the log manager, C3) rather than performed here.
pub struct LogFileStore {
    path: PathBuf,
    file: Mutex<File>,
    target_log_size: u64,
}

impl LogFileStore {
    pub fn open(path: impl AsRef<Path>, target_log_size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).read(true).append(true).open(&path)?;
        Ok(Self { path, file: Mutex::new(file), target_log_size })
    }

    /// Appends a framed record, fsyncs, and returns whether the file now exceeds
    /// `target_log_size` (the caller schedules archival).
    pub fn append(&self, entry: &LogEntry) -> Result<bool> {
        let bytes = encode_frame(entry)?;
        let mut file = self.file.lock();
        file.write_all(&bytes)?;
        file.sync_data()?;
        let len = file.metadata()?.len();
        Ok(len > self.target_log_size)
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    /// A lazy forward scan up to `end` (a snapshot of the file length at iterator-construction
    /// time), so writers appending concurrently do not perturb an in-flight scan.
    pub fn scan_forward(&self, end: u64) -> Result<ForwardScan> {
        let mut reader = File::open(&self.path)?;
        reader.seek(SeekFrom::Start(0))?;
        Ok(ForwardScan { reader: BufReader::new(reader), end, pos: 0 })
    }

    /// A lazy backward scan starting just before `end`.
    pub fn scan_backward(&self, end: u64) -> Result<BackwardScan> {
        let file = File::open(&self.path)?;
        Ok(BackwardScan { file, pos: end })
    }

    pub fn current_len(&self) -> Result<u64> {
        self.len()
    }
}

pub struct ForwardScan {
    reader: BufReader<File>,
    end: u64,
    pos: u64,
}

impl ForwardScan {
    /// Returns the next entry, or `None` once the snapshot boundary is reached.
    pub fn next(&mut self) -> Result<Option<LogEntry>> {
        if self.pos >= self.end {
            return Ok(None);
        }
        match read_frame_forward(&mut self.reader)? {
            Some(entry) => {
                self.pos = self.reader.stream_position().map_err(DbError::Io)?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }
}

pub struct BackwardScan {
    file: File,
    pos: u64,
}

impl BackwardScan {
    pub fn next(&mut self) -> Result<Option<LogEntry>> {
        match read_frame_backward(&mut self.file, self.pos)? {
            Some((entry, new_pos)) => {
                self.pos = new_pos;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::TransactionId;
    use crate::log::record::LogRecord;

    fn entry(tx: TransactionId) -> LogEntry {
        LogEntry { lsn: tx, record: LogRecord::Start { tx } }
    }

    #[test]
    fn appends_and_scans_forward() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogFileStore::open(dir.path().join("active.log"), 1 << 20).unwrap();
        for tx in 1..=5 {
            store.append(&entry(tx)).unwrap();
        }
        let end = store.current_len().unwrap();
        let mut scan = store.scan_forward(end).unwrap();
        let mut seen = vec![];
        while let Some(e) = scan.next().unwrap() {
            seen.push(e.lsn);
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn scans_backward_in_reverse_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogFileStore::open(dir.path().join("active.log"), 1 << 20).unwrap();
        for tx in 1..=5 {
            store.append(&entry(tx)).unwrap();
        }
        let end = store.current_len().unwrap();
        let mut scan = store.scan_backward(end).unwrap();
        let mut seen = vec![];
        while let Some(e) = scan.next().unwrap() {
            seen.push(e.lsn);
        }
        assert_eq!(seen, vec![5, 4, 3, 2, 1]);
    }

    #[test]
    fn signals_archival_past_target_size() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogFileStore::open(dir.path().join("active.log"), 16).unwrap();
        let mut triggered = false;
        for tx in 1..=20 {
            triggered |= store.append(&entry(tx)).unwrap();
        }
        assert!(triggered);
    }
}
