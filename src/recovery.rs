//! ARIES-lite recovery: backward analysis/undo pass, forward redo pass, completion.
//!
//! Run once per log file at startup and again whenever a new log file is attached at runtime.

use crate::collaborators::BufferPool;
use crate::common::TransactionId;
use crate::error::Result;
use crate::log::{LogManager, LogRecord};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

/// What recovery needs from the 2PC coordinator for in-doubt transactions: asking a remote
/// coordinator for its durable decision, and resuming a phase-2 broadcast it already decided.
/// A narrow trait rather than a direct dependency on `xa::TwoPhaseCommitCoordinator` so recovery
/// can run against a same-process coordinator or one reached only over RPC.
#[async_trait]
pub trait XaResolver: Send + Sync {
    async fn ask_xa(&self, host: &str, tx: TransactionId) -> Result<bool>;
    async fn phase2_commit(&self, tx: TransactionId, participants: &[String]) -> Result<()>;
    async fn phase2_abort(&self, tx: TransactionId, participants: &[String]) -> Result<()>;
}

pub struct RecoveryEngine {
    log: Arc<LogManager>,
    buffer_pool: Arc<dyn BufferPool>,
    resolver: Arc<dyn XaResolver>,
}

impl RecoveryEngine {
    pub fn new(log: Arc<LogManager>, buffer_pool: Arc<dyn BufferPool>, resolver: Arc<dyn XaResolver>) -> Self {
        Self { log, buffer_pool, resolver }
    }

    pub async fn run(&self, file: &'static str) -> Result<()> {
        let mut committed = HashSet::new();
        let mut rolled_back = HashSet::new();
        let mut needs_commit = HashSet::new();
        let mut xa_committed = HashSet::new();
        let mut xa_rolled_back = HashSet::new();

        info!(file, "recovery: backward analysis/undo pass");
        {
            let mut it = self.log.iterator(file)?;
            while let Some(entry) = it.next()? {
                match entry.record {
                    LogRecord::Commit { tx } => {
                        committed.insert(tx);
                    }
                    LogRecord::Rollback { tx } | LogRecord::NotReady { tx } => {
                        rolled_back.insert(tx);
                    }
                    LogRecord::Ready { tx, ref host } => {
                        if self.resolver.ask_xa(host, tx).await? {
                            committed.insert(tx);
                            needs_commit.insert(tx);
                        } else {
                            rolled_back.insert(tx);
                        }
                    }
                    LogRecord::XaCommit { tx, ref participants } => {
                        self.resolver.phase2_commit(tx, participants).await?;
                        xa_committed.insert(tx);
                    }
                    LogRecord::XaAbort { tx, ref participants } => {
                        self.resolver.phase2_abort(tx, participants).await?;
                        xa_rolled_back.insert(tx);
                    }
                    LogRecord::Prepare { tx, ref participants } => {
                        if !xa_committed.contains(&tx) && !xa_rolled_back.contains(&tx) {
                            self.resolver.phase2_abort(tx, participants).await?;
                            xa_rolled_back.insert(tx);
                        }
                    }
                    LogRecord::Insert { tx, ref block, ref image } | LogRecord::Delete { tx, ref block, ref image } => {
                        if !committed.contains(&tx) && !rolled_back.contains(&tx) {
                            self.undo(block, image)?;
                        }
                    }
                    LogRecord::Start { .. } | LogRecord::NQCheck { .. } => {}
                }
            }
        }

        info!(file, committed = committed.len(), "recovery: forward redo pass");
        {
            let mut it = self.log.forward_iterator(file)?;
            while let Some(entry) = it.next()? {
                if let LogRecord::Insert { tx, ref block, ref image } | LogRecord::Delete { tx, ref block, ref image } =
                    entry.record
                {
                    if committed.contains(&tx) {
                        self.redo(block, image)?;
                    }
                }
            }
        }

        for tx in &needs_commit {
            self.log.commit(*tx, file)?;
        }
        let lsn = self.log.write(LogRecord::NQCheck { active: vec![] }, file);
        self.log.flush(lsn, file)?;

        Ok(())
    }

    fn undo(&self, block: &crate::common::Block, image: &crate::log::record::Image) -> Result<()> {
        let mut page = self.buffer_pool.read(block)?;
        apply_at_offset(&mut page.data, image.offset, &image.before);
        self.buffer_pool.write(block, page)
    }

    fn redo(&self, block: &crate::common::Block, image: &crate::log::record::Image) -> Result<()> {
        let mut page = self.buffer_pool.read(block)?;
        apply_at_offset(&mut page.data, image.offset, &image.after);
        self.buffer_pool.write(block, page)
    }
}

fn apply_at_offset(data: &mut Vec<u8>, offset: u32, bytes: &[u8]) {
    let offset = offset as usize;
    if data.len() < offset + bytes.len() {
        data.resize(offset + bytes.len(), 0);
    }
    data[offset..offset + bytes.len()].copy_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{InMemoryBufferPool, Page};
    use crate::common::Block;
    use crate::log::record::Image;

    struct AlwaysCommit;
    #[async_trait]
    impl XaResolver for AlwaysCommit {
        async fn ask_xa(&self, _host: &str, _tx: TransactionId) -> Result<bool> {
            Ok(true)
        }
        async fn phase2_commit(&self, _tx: TransactionId, _p: &[String]) -> Result<()> {
            Ok(())
        }
        async fn phase2_abort(&self, _tx: TransactionId, _p: &[String]) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn redoes_committed_inserts() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(LogManager::new(dir.path().to_path_buf(), 1 << 20).unwrap());
        let pool = Arc::new(InMemoryBufferPool::new());
        let block = Block::new("/t/0", 0);

        log.write(LogRecord::Start { tx: 1 }, "active");
        let lsn = log.write(
            LogRecord::Insert { tx: 1, block: block.clone(), image: Image { offset: 0, before: vec![], after: vec![9, 9] } },
            "active",
        );
        log.flush(lsn, "active").unwrap();
        log.commit(1, "active").unwrap();

        pool.advance_flushed_lsn(u64::MAX);

        let engine = RecoveryEngine::new(log, pool.clone(), Arc::new(AlwaysCommit));
        engine.run("active").await.unwrap();

        let page = pool.read(&block).unwrap();
        assert_eq!(&page.data[0..2], &[9, 9]);
    }

    #[tokio::test]
    async fn undoes_uncommitted_inserts() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(LogManager::new(dir.path().to_path_buf(), 1 << 20).unwrap());
        let pool = Arc::new(InMemoryBufferPool::new());
        let block = Block::new("/t/0", 0);
        pool.advance_flushed_lsn(u64::MAX);
        pool.write(&block, Page { data: vec![1, 2], lsn: 0 }).unwrap();

        log.write(LogRecord::Start { tx: 2 }, "active");
        let lsn = log.write(
            LogRecord::Insert { tx: 2, block: block.clone(), image: Image { offset: 0, before: vec![1, 2], after: vec![9, 9] } },
            "active",
        );
        log.flush(lsn, "active").unwrap();
        // no commit: transaction left in-flight by a crash

        let engine = RecoveryEngine::new(log, pool.clone(), Arc::new(AlwaysCommit));
        engine.run("active").await.unwrap();

        let page = pool.read(&block).unwrap();
        assert_eq!(&page.data[0..2], &[1, 2]);
    }
}
