//! Local transaction: tracks mutations and isolation level, drives log writes for every mutating
//! operation, and exposes the prefetch/read/rollback/commit surface the DML executor uses.

use crate::collaborators::{BufferPool, Page};
use crate::common::{Block, IsolationLevel, Rid, TransactionId};
use crate::error::Result;
use crate::log::record::Image;
use crate::log::{LogManager, LogRecord};
use std::sync::Arc;

/// Outcome of `update_row`: the row may have relocated if its new value no longer fits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RidChange {
    pub old: Rid,
    pub new: Rid,
}

/// One row-level mutation this transaction has applied, kept so a live (not crash-recovery)
/// rollback can compensate it directly instead of waiting for the next restart's undo pass.
struct UndoEntry {
    block: Block,
    offset: u32,
    before: Vec<u8>,
}

pub struct LocalTransaction {
    tx: TransactionId,
    isolation: IsolationLevel,
    log: Arc<LogManager>,
    buffer_pool: Arc<dyn BufferPool>,
    undo_log: parking_lot::Mutex<Vec<UndoEntry>>,
}

impl LocalTransaction {
    pub fn begin(tx: TransactionId, isolation: IsolationLevel, log: Arc<LogManager>, buffer_pool: Arc<dyn BufferPool>) -> Self {
        log.write(LogRecord::Start { tx }, "active");
        Self { tx, isolation, log, buffer_pool, undo_log: parking_lot::Mutex::new(Vec::new()) }
    }

    pub fn id(&self) -> TransactionId {
        self.tx
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn read(&self, block: &Block) -> Result<Page> {
        self.buffer_pool.read(block)
    }

    pub fn request_page(&self, block: &Block) -> Result<()> {
        self.buffer_pool.request_page(block)
    }

    pub fn request_pages(&self, blocks: &[Block]) -> Result<()> {
        self.buffer_pool.request_pages(blocks)
    }

    /// Applies `after` at `offset` in `block`, logging `before`/`after` for undo/redo, and writes
    /// the resulting page back through the buffer pool.
    pub fn insert_row(&self, block: &Block, offset: u32, before: Vec<u8>, after: Vec<u8>) -> Result<()> {
        self.log_and_apply(block, offset, before, after, true)
    }

    /// Clears the row's slot back to zeros; the `before` image is the row's serialized bytes so
    /// undo can restore them if this transaction never commits.
    pub fn delete_row(&self, block: &Block, offset: u32, before: Vec<u8>) -> Result<()> {
        let after = vec![0u8; before.len()];
        self.log_and_apply(block, offset, before, after, false)
    }

    /// Relocation is the caller's decision (the device executor computes the new RID when the
    /// updated row no longer fits in place); this only logs and applies the byte-level change.
    pub fn update_row(&self, block: &Block, offset: u32, before: Vec<u8>, after: Vec<u8>) -> Result<()> {
        self.log_and_apply(block, offset, before, after, true)
    }

    fn log_and_apply(&self, block: &Block, offset: u32, before: Vec<u8>, after: Vec<u8>, is_insert: bool) -> Result<()> {
        let image = Image { offset, before, after: after.clone() };
        let record = if is_insert {
            LogRecord::Insert { tx: self.tx, block: block.clone(), image }
        } else {
            LogRecord::Delete { tx: self.tx, block: block.clone(), image }
        };
        let lsn = self.log.write(record, "active");
        // WAL rule: the log record must be durable before the page that depends on it is.
        self.log.flush(lsn, "active")?;
        self.buffer_pool.advance_flushed_lsn(lsn);

        let mut page = self.buffer_pool.read(block)?;
        page.lsn = lsn;
        let start = offset as usize;
        if page.data.len() < start + after.len() {
            page.data.resize(start + after.len(), 0);
        }
        page.data[start..start + after.len()].copy_from_slice(&after);
        self.buffer_pool.write(block, page)?;

        self.undo_log.lock().push(UndoEntry { block: block.clone(), offset, before });
        Ok(())
    }

    /// Writes the transaction's durable `Commit` record. Mutations are already durable (each
    /// `insert_row`/`delete_row`/`update_row` flushed its own redo/undo record), so this is only
    /// the final control record.
    pub fn commit(self) -> Result<()> {
        self.log.commit(self.tx, "active")?;
        Ok(())
    }

    /// Compensates every mutation this transaction applied, most recent first. The pages already
    /// reflect the transaction's (after) images, and nothing else will revert them for a live
    /// rollback — recovery's own undo pass only runs after a crash.
    fn undo(&self) -> Result<()> {
        for entry in self.undo_log.lock().drain(..).rev() {
            let mut page = self.buffer_pool.read(&entry.block)?;
            let start = entry.offset as usize;
            if page.data.len() < start + entry.before.len() {
                page.data.resize(start + entry.before.len(), 0);
            }
            page.data[start..start + entry.before.len()].copy_from_slice(&entry.before);
            self.buffer_pool.write(&entry.block, page)?;
        }
        Ok(())
    }

    /// Undoes this transaction's mutations, then writes the durable `Rollback` record. Unlike
    /// `commit`, this must actively undo rather than just finalize.
    pub fn rollback(self) -> Result<()> {
        self.undo()?;
        self.log.rollback(self.tx, "active")?;
        Ok(())
    }

    /// Undoes this transaction's mutations without writing the control record. Used when several
    /// device-local transactions share one logical tx id: each undoes its own share, and the
    /// `Rollback` record is written exactly once, centrally, after all of them are done (see
    /// `NodeDmlExecutor::finish`).
    pub fn undo_only(self) -> Result<()> {
        self.undo()
    }
}
