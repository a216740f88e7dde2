//! Durable state across restarts: the flush boundary contract.

use dkv_causal::vv::VersionVector;
use dkv_causal::NodeId;
use dkv_engine::{Backend, EngineConfig, NoopStats, Ring, Vnode, WriteOp};
use dkv_engine::config::EngineConfigBuilder;
use dkv_storage::{FileStateStore, MemoryStateStore, MemoryStore, StateStore};
use std::path::Path;
use std::sync::Arc;

fn five_ring() -> Ring {
    Ring::new([1, 2, 3, 4, 5], 3)
}

fn file_backed_vnode(id: NodeId, state_dir: &Path, update_limit: u64) -> Vnode {
    let config = EngineConfigBuilder::new().update_limit(update_limit).build();
    Vnode::open(
        id,
        five_ring(),
        Box::new(MemoryStore::new()),
        Box::new(FileStateStore::open(state_dir).unwrap()),
        config,
        Arc::new(NoopStats),
    )
}

#[test]
fn test_crash_loses_only_the_tail_after_the_flush_boundary() {
    let dir = tempfile::tempdir().unwrap();

    {
        let mut vnode = file_backed_vnode(1, dir.path(), 100);
        // 101 distinct-key writes; the 100th crosses the flush boundary
        for i in 0..101u32 {
            let key = format!("k{}", i).into_bytes();
            vnode
                .write(WriteOp::Put(b"v".to_vec()), &key, &VersionVector::new())
                .unwrap();
        }
        assert_eq!(vnode.clock().base_of(1), 101);
        // dropped here without shutdown: a crash
    }

    let restored = file_backed_vnode(1, dir.path(), 100);
    // the state at the 100th write came back; the 101st is gone
    assert_eq!(restored.clock().base_of(1), 100);
    assert_eq!(restored.keylog().len(), 100);
    assert_eq!(restored.keylog().key_for(100), Some(&b"k99".to_vec()));
    assert_eq!(restored.keylog().key_for(101), None);

    // the acknowledgment ledger survived with every peer registered
    let peers: Vec<NodeId> = restored.replicated().ids().collect();
    assert_eq!(peers, vec![2, 3, 4, 5]);
    assert_eq!(restored.replicated().min(), Some(0));
}

#[test]
fn test_shutdown_flushes_below_the_update_limit() {
    let dir = tempfile::tempdir().unwrap();

    {
        let mut vnode = file_backed_vnode(1, dir.path(), 100);
        for i in 0..5u32 {
            let key = format!("k{}", i).into_bytes();
            vnode
                .write(WriteOp::Put(b"v".to_vec()), &key, &VersionVector::new())
                .unwrap();
        }
        vnode.shutdown().unwrap();
    }

    let restored = file_backed_vnode(1, dir.path(), 100);
    assert_eq!(restored.clock().base_of(1), 5);
    assert_eq!(restored.keylog().len(), 5);
}

#[test]
fn test_unreadable_state_record_starts_fresh() {
    let dir = tempfile::tempdir().unwrap();

    {
        let mut store = FileStateStore::open(dir.path()).unwrap();
        store.save(1, b"definitely not a state record").unwrap();
    }

    let vnode = file_backed_vnode(1, dir.path(), 100);
    assert_eq!(vnode.clock().base_of(1), 0);
    assert!(vnode.keylog().is_empty());
    // fresh state still registers every peer at zero
    assert_eq!(vnode.replicated().min(), Some(0));
}

#[test]
fn test_log_backend_objects_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfigBuilder::new()
        .backend(Backend::Log)
        .data_dir(dir.path())
        .update_limit(10)
        .build();

    {
        let mut vnode = Vnode::bootstrap(1, five_ring(), config.clone(), Arc::new(NoopStats)).unwrap();
        for (key, value) in [(&b"a"[..], &b"1"[..]), (b"b", b"2")] {
            vnode
                .write(WriteOp::Put(value.to_vec()), key, &VersionVector::new())
                .unwrap();
        }
        vnode.shutdown().unwrap();
    }

    let vnode = Vnode::bootstrap(1, five_ring(), config, Arc::new(NoopStats)).unwrap();
    assert_eq!(vnode.clock().base_of(1), 2);
    assert_eq!(vnode.object_count(), 2);
    let read = vnode.read(b"b").unwrap();
    assert_eq!(read.dcc.values(), vec![&b"2".to_vec()]);
}

#[test]
fn test_memory_backend_state_still_flushes() {
    // the default backend keeps objects in memory but the durable tuple
    // still goes through the state store it was opened with
    let mut vnode = Vnode::open(
        1,
        five_ring(),
        Box::new(MemoryStore::new()),
        Box::new(MemoryStateStore::new()),
        EngineConfig::default(),
        Arc::new(NoopStats),
    );
    vnode
        .write(WriteOp::Put(b"v".to_vec()), b"k", &VersionVector::new())
        .unwrap();
    vnode.flush().unwrap();
    vnode.shutdown().unwrap();
}
