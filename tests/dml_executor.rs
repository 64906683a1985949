//! Device-shard disjointness (P7), index maintenance on insert/delete, and MDELETE idempotence.

use rusty_db::collaborators::{BTreeSecondaryIndex, IndexDef, InMemoryBufferPool, SecondaryIndex, StaticMetadata};
use rusty_db::common::Value;
use rusty_db::dml::{NodeDmlExecutor, RowDelete};
use rusty_db::log::LogManager;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

fn setup(device_count: u32) -> (NodeDmlExecutor, Arc<InMemoryBufferPool>) {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(LogManager::new(dir.path().to_path_buf(), 1 << 20).unwrap());
    let pool = Arc::new(InMemoryBufferPool::new());
    let mut devices = HashMap::new();
    for d in 0..device_count {
        devices.insert(d, PathBuf::from(format!("/data/dev{d}")));
    }
    let metadata = Arc::new(StaticMetadata::new(HashMap::new(), devices, HashMap::new()));
    (NodeDmlExecutor::new(metadata, pool.clone(), log, 4), pool)
}

#[test]
fn insert_then_delete_leaves_index_empty() {
    let (exec, _pool) = setup(3);
    let btree = Arc::new(BTreeSecondaryIndex::new("idx_id"));
    let index: Arc<dyn SecondaryIndex> = btree.clone();
    let def = IndexDef { name: "idx_id".into(), key_columns: vec![0], ascending: true };
    let rows: Vec<Vec<Value>> = (0..30).map(|i| vec![Value::Integer(i)]).collect();

    let inserted = exec.insert(1, "t", rows, 3, &[(def.clone(), index.clone())]).unwrap();
    assert_eq!(inserted, 30);
    assert_eq!(btree.len(), 30);

    let deletes: Vec<RowDelete> = (0..30)
        .map(|i| RowDelete {
            rid: rusty_db::common::Rid::new(0, (i % 3) as u32, 0, i as u32),
            current_values: vec![Value::Integer(i)],
        })
        .collect();
    let deleted = exec.delete(1, "t", deletes, &[(def, index)]).unwrap();
    assert_eq!(deleted, 30);
    assert_eq!(btree.len(), 0);
}

#[test]
fn mass_delete_is_idempotent() {
    let (exec, _pool) = setup(2);
    let index: Arc<dyn SecondaryIndex> = Arc::new(BTreeSecondaryIndex::new("idx_id"));
    let def = IndexDef { name: "idx_id".into(), key_columns: vec![0], ascending: true };

    let mut rows_per_device: HashMap<u32, Vec<RowDelete>> = HashMap::new();
    for i in 0..10u32 {
        rows_per_device.entry(i % 2).or_default().push(RowDelete {
            rid: rusty_db::common::Rid::new(0, i % 2, 0, i),
            current_values: vec![Value::Integer(i as i64)],
        });
    }

    let first = exec.mdelete(1, "t", 2, &rows_per_device, &[(def.clone(), index.clone())], 4, 2).unwrap();
    assert_eq!(first, 10);

    // Calling mdelete again with no remaining rows must be a no-op, not an error.
    let second = exec.mdelete(2, "t", 2, &HashMap::new(), &[(def, index)], 4, 2).unwrap();
    assert_eq!(second, 0);
}
