//! Narrow contracts standing in for out-of-scope subsystems: the buffer pool, the secondary-index
//! engine, and the metadata catalog. Each trait carries exactly the methods C7/C8/recovery need;
//! each ships one in-memory reference implementation sufficient to drive and test the core.

use crate::common::{Block, DeviceId, NodeId, Rid, Value};
use crate::error::{DbError, Result};
use crate::lsn::Lsn;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// A page of raw bytes tagged with the LSN of the last update applied to it.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub data: Vec<u8>,
    pub lsn: Lsn,
}

/// Standing in for the real buffer pool: page read/write plus prefetch requests. Implementations
/// must refuse to persist a page whose LSN has not yet reached the log (the WAL rule).
pub trait BufferPool: Send + Sync {
    fn flushed_lsn(&self) -> Lsn;
    fn read(&self, block: &Block) -> Result<Page>;
    fn write(&self, block: &Block, page: Page) -> Result<()>;
    fn request_page(&self, block: &Block) -> Result<()>;
    fn request_pages(&self, blocks: &[Block]) -> Result<()>;
    fn advance_flushed_lsn(&self, lsn: Lsn);
}

/// `parking_lot::Mutex<HashMap<Block, Page>>`-backed reference buffer pool.
pub struct InMemoryBufferPool {
    pages: Mutex<HashMap<Block, Page>>,
    flushed_lsn: std::sync::atomic::AtomicU64,
}

impl InMemoryBufferPool {
    pub fn new() -> Self {
        Self { pages: Mutex::new(HashMap::new()), flushed_lsn: std::sync::atomic::AtomicU64::new(0) }
    }
}

impl Default for InMemoryBufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool for InMemoryBufferPool {
    fn flushed_lsn(&self) -> Lsn {
        self.flushed_lsn.load(std::sync::atomic::Ordering::Acquire)
    }

    fn read(&self, block: &Block) -> Result<Page> {
        Ok(self.pages.lock().get(block).cloned().unwrap_or_default())
    }

    fn write(&self, block: &Block, page: Page) -> Result<()> {
        if page.lsn > self.flushed_lsn() {
            return Err(DbError::Internal(format!(
                "refusing to persist {block}: page lsn {} exceeds flushed lsn {}",
                page.lsn,
                self.flushed_lsn()
            )));
        }
        self.pages.lock().insert(block.clone(), page);
        Ok(())
    }

    fn request_page(&self, _block: &Block) -> Result<()> {
        Ok(())
    }

    fn request_pages(&self, _blocks: &[Block]) -> Result<()> {
        Ok(())
    }

    fn advance_flushed_lsn(&self, lsn: Lsn) {
        self.flushed_lsn.fetch_max(lsn, std::sync::atomic::Ordering::AcqRel);
    }
}

/// Standing in for a real B-tree secondary index.
#[async_trait]
pub trait SecondaryIndex: Send + Sync {
    async fn open(&self) -> Result<()>;
    async fn insert(&self, key: Vec<u8>, rid: Rid) -> Result<()>;
    async fn delete(&self, key: Vec<u8>, rid: Rid) -> Result<()>;
    async fn update(&self, key: Vec<u8>, old_rid: Rid, new_rid: Rid) -> Result<()>;
    async fn mass_delete(&self) -> Result<()>;
}

/// `BTreeMap<Vec<u8>, Vec<Rid>>`-backed reference secondary index.
pub struct BTreeSecondaryIndex {
    name: String,
    entries: Mutex<BTreeMap<Vec<u8>, Vec<Rid>>>,
}

impl BTreeSecondaryIndex {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), entries: Mutex::new(BTreeMap::new()) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.entries.lock().values().map(|v| v.len()).sum()
    }
}

#[async_trait]
impl SecondaryIndex for BTreeSecondaryIndex {
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn insert(&self, key: Vec<u8>, rid: Rid) -> Result<()> {
        self.entries.lock().entry(key).or_default().push(rid);
        Ok(())
    }

    async fn delete(&self, key: Vec<u8>, rid: Rid) -> Result<()> {
        if let Some(rids) = self.entries.lock().get_mut(&key) {
            rids.retain(|r| *r != rid);
        }
        Ok(())
    }

    async fn update(&self, key: Vec<u8>, old_rid: Rid, new_rid: Rid) -> Result<()> {
        self.delete(key.clone(), old_rid).await?;
        self.insert(key, new_rid).await
    }

    async fn mass_delete(&self) -> Result<()> {
        self.entries.lock().clear();
        Ok(())
    }
}

/// Describes one secondary index's key shape for the DML executor's index-maintenance decisions.
#[derive(Debug, Clone)]
pub struct IndexDef {
    pub name: String,
    pub key_columns: Vec<usize>,
    pub ascending: bool,
}

impl IndexDef {
    pub fn key_of(&self, row: &[Value]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for &col in &self.key_columns {
            bytes.extend(row[col].key_bytes());
        }
        bytes
    }
}

/// Standing in for the metadata catalog: cluster roster, device routing, index catalog. Fixed at
/// construction, matching the static-membership non-goal.
pub trait Metadata: Send + Sync {
    fn host_for_node(&self, node: u32) -> Result<NodeId>;
    fn device_path(&self, device: DeviceId) -> Result<PathBuf>;
    fn determine_device(&self, row: &[Value], device_count: u32) -> DeviceId;
    fn indexes_for_table(&self, table: &str) -> Vec<IndexDef>;
}

pub struct StaticMetadata {
    hosts: HashMap<u32, NodeId>,
    devices: HashMap<DeviceId, PathBuf>,
    indexes: HashMap<String, Vec<IndexDef>>,
}

impl StaticMetadata {
    pub fn new(
        hosts: HashMap<u32, NodeId>,
        devices: HashMap<DeviceId, PathBuf>,
        indexes: HashMap<String, Vec<IndexDef>>,
    ) -> Self {
        Self { hosts, devices, indexes }
    }
}

impl Metadata for StaticMetadata {
    fn host_for_node(&self, node: u32) -> Result<NodeId> {
        self.hosts.get(&node).cloned().ok_or_else(|| DbError::NotFound(format!("node {node}")))
    }

    fn device_path(&self, device: DeviceId) -> Result<PathBuf> {
        self.devices.get(&device).cloned().ok_or_else(|| DbError::NotFound(format!("device {device}")))
    }

    fn determine_device(&self, row: &[Value], device_count: u32) -> DeviceId {
        if device_count == 0 {
            return 0;
        }
        let mut hasher = crc32fast::Hasher::new();
        for v in row {
            hasher.update(&v.key_bytes());
        }
        hasher.finalize() % device_count
    }

    fn indexes_for_table(&self, table: &str) -> Vec<IndexDef> {
        self.indexes.get(table).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn btree_index_update_moves_rid() {
        let idx = BTreeSecondaryIndex::new("idx_a");
        let rid = Rid::new(0, 0, 1, 1);
        idx.insert(b"k1".to_vec(), rid).await.unwrap();
        idx.update(b"k1".to_vec(), rid, Rid::new(0, 0, 1, 2)).await.unwrap();
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn buffer_pool_rejects_unflushed_lsn() {
        let pool = InMemoryBufferPool::new();
        let block = Block::new("/t", 0);
        let err = pool.write(&block, Page { data: vec![1], lsn: 5 }).unwrap_err();
        assert!(matches!(err, DbError::Internal(_)));
        pool.advance_flushed_lsn(5);
        pool.write(&block, Page { data: vec![1], lsn: 5 }).unwrap();
    }
}
