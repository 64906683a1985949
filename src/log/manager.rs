//! Log manager: per-file in-memory tail, batched flush-to-LSN, restartable iteration.

use crate::common::TransactionId;
use crate::error::Result;
use crate::log::record::{LogEntry, LogRecord};
use crate::log::store::LogFileStore;
use crate::lsn::{Lsn, LsnAllocator};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

struct FileState {
    store: LogFileStore,
    tail: Mutex<VecDeque<LogEntry>>,
}

/// Logical name of a log file: `"active"` (every node), `"xa"` (coordinator only), or a name
/// handed to [`LogManager::attach`] for a dynamically added log.
pub type FileName = &'static str;

pub struct LogManager {
    lsn: LsnAllocator,
    files: DashMap<FileName, Arc<FileState>>,
    log_dir: PathBuf,
    target_log_size: u64,
    shutdown: AtomicBool,
}

impl LogManager {
    pub fn new(log_dir: PathBuf, target_log_size: u64) -> Result<Self> {
        let files = DashMap::new();
        for name in ["active", "xa"] {
            let store = LogFileStore::open(log_dir.join(format!("{name}.log")), target_log_size)?;
            files.insert(name, Arc::new(FileState { store, tail: Mutex::new(VecDeque::new()) }));
        }
        Ok(Self { lsn: LsnAllocator::new(), files, log_dir, target_log_size, shutdown: AtomicBool::new(false) })
    }

    fn file(&self, name: FileName) -> Arc<FileState> {
        self.files.get(name).map(|e| e.clone()).expect("unknown log file")
    }

    /// Attaches a new log file at `path` under `name`, registering it for `write`/`flush`/the
    /// iterators just like `"active"` or `"xa"`. The caller still owns re-running recovery
    /// (`RecoveryEngine::run`) over the returned name afterward — attaching and recovering are
    /// separate collaborators here, same as at startup.
    ///
    /// `name` is leaked to produce the `'static` lifetime `FileName` requires; a log, once
    /// attached, lives for the rest of the process, so this isn't unbounded.
    pub fn attach(&self, name: String, path: &Path) -> Result<FileName> {
        let name: FileName = Box::leak(name.into_boxed_str());
        let store = LogFileStore::open(path.to_path_buf(), self.target_log_size)?;
        self.files.insert(name, Arc::new(FileState { store, tail: Mutex::new(VecDeque::new()) }));
        info!(name, path = %path.display(), "attached log file");
        Ok(name)
    }

    /// Assigns an LSN, appends the record to the in-memory tail, returns immediately (durability
    /// is established later by `flush`).
    pub fn write(&self, record: LogRecord, file: FileName) -> Lsn {
        let lsn = self.lsn.next();
        let entry = LogEntry { lsn, record };
        self.file(file).tail.lock().push_back(entry);
        lsn
    }

    /// Flushes every tail record with `lsn <= up_to_lsn`, in order, stopping at the first record
    /// that exceeds the bound (the tail is FIFO so this preserves order).
    pub fn flush(&self, up_to_lsn: Lsn, file: FileName) -> Result<()> {
        let state = self.file(file);
        loop {
            let next = {
                let mut tail = state.tail.lock();
                match tail.front() {
                    Some(e) if e.lsn <= up_to_lsn => tail.pop_front(),
                    _ => None,
                }
            };
            let Some(entry) = next else { break };
            let archive_due = state.store.append(&entry)?;
            if archive_due {
                info!(file, lsn = entry.lsn, "active log exceeded target size, archival due");
            }
        }
        Ok(())
    }

    /// `write` followed by a blocking flush of exactly that record — the synchronous durability
    /// boundary control records require.
    fn write_and_flush(&self, record: LogRecord, file: FileName) -> Result<Lsn> {
        let lsn = self.write(record, file);
        self.flush(lsn, file)?;
        Ok(lsn)
    }

    pub fn commit(&self, tx: TransactionId, file: FileName) -> Result<Lsn> {
        self.write_and_flush(LogRecord::Commit { tx }, file)
    }

    pub fn rollback(&self, tx: TransactionId, file: FileName) -> Result<Lsn> {
        self.write_and_flush(LogRecord::Rollback { tx }, file)
    }

    pub fn ready(&self, tx: TransactionId, host: String, file: FileName) -> Result<Lsn> {
        self.write_and_flush(LogRecord::Ready { tx, host }, file)
    }

    pub fn not_ready(&self, tx: TransactionId, file: FileName) -> Result<Lsn> {
        self.write_and_flush(LogRecord::NotReady { tx }, file)
    }

    pub fn prepare(&self, tx: TransactionId, participants: Vec<String>, file: FileName) -> Result<Lsn> {
        self.write_and_flush(LogRecord::Prepare { tx, participants }, file)
    }

    pub fn xa_commit(&self, tx: TransactionId, participants: Vec<String>, file: FileName) -> Result<Lsn> {
        self.write_and_flush(LogRecord::XaCommit { tx, participants }, file)
    }

    pub fn xa_abort(&self, tx: TransactionId, participants: Vec<String>, file: FileName) -> Result<Lsn> {
        self.write_and_flush(LogRecord::XaAbort { tx, participants }, file)
    }

    /// A restartable forward scan over the persisted (already-flushed) portion of `file`, as of
    /// this call's snapshot of the file length.
    pub fn forward_iterator(&self, file: FileName) -> Result<crate::log::store::ForwardScan> {
        let state = self.file(file);
        let end = state.store.current_len()?;
        state.store.scan_forward(end)
    }

    /// A restartable backward scan, symmetric to `forward_iterator`.
    pub fn iterator(&self, file: FileName) -> Result<crate::log::store::BackwardScan> {
        let state = self.file(file);
        let end = state.store.current_len()?;
        state.store.scan_backward(end)
    }

    pub fn log_dir(&self) -> &PathBuf {
        &self.log_dir
    }

    /// Runs the tail-drain loop on the current thread until `shutdown` is requested. One call per
    /// background worker thread spawned from `main.rs`.
    pub fn run_background_drain(self: &Arc<Self>, sleep: Duration) {
        while !self.shutdown.load(Ordering::Relaxed) {
            let mut did_work = false;
            let names: Vec<FileName> = self.files.iter().map(|e| *e.key()).collect();
            for name in names {
                let state = self.file(name);
                let head_lsn = state.tail.lock().front().map(|e| e.lsn);
                if let Some(lsn) = head_lsn {
                    if let Err(e) = self.flush(lsn, name) {
                        error!(file = name, error = %e, "fatal: background flush failed, stopping drain");
                        self.shutdown.store(true, Ordering::Relaxed);
                        return;
                    }
                    did_work = true;
                }
            }
            if !did_work {
                std::thread::sleep(sleep);
            }
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}
