//! Anti-entropy protocol behavior, driven through the engine's sync
//! handlers directly.

use dkv_causal::bvv::ClockEntry;
use dkv_causal::dcc::{Dcc, Dot};
use dkv_causal::vv::VersionVector;
use dkv_causal::{Key, NodeId};
use dkv_engine::{EngineConfig, NoopStats, Ring, Vnode, WriteOp};
use dkv_storage::{MemoryStateStore, MemoryStore};
use std::sync::Arc;

fn five_ring() -> Ring {
    Ring::new([1, 2, 3, 4, 5], 3)
}

fn memory_vnode(id: NodeId) -> Vnode {
    Vnode::open(
        id,
        five_ring(),
        Box::new(MemoryStore::new()),
        Box::new(MemoryStateStore::new()),
        EngineConfig::default(),
        Arc::new(NoopStats),
    )
}

/// Distinct keys replicated on both given vnodes.
fn shared_keys(ring: &Ring, a: NodeId, b: NodeId, count: usize) -> Vec<Key> {
    let mut keys = Vec::new();
    for i in 0..100_000u32 {
        let key = format!("key-{}", i).into_bytes();
        let set = ring.replica_set(&key);
        if set.contains(&a) && set.contains(&b) {
            keys.push(key);
            if keys.len() == count {
                return keys;
            }
        }
    }
    panic!("not enough keys replicated on both {} and {}", a, b);
}

/// One full exchange: `initiator` pulls what it is missing from `responder`.
fn run_sync(initiator: &mut Vnode, responder: &mut Vnode) -> usize {
    let (local_id, entry) = initiator.sync_start(responder.id());
    let pull = responder.sync_request(local_id, &entry).unwrap();
    let shipped = pull.objects.len();
    initiator
        .sync_response(pull.from, &pull.clock_base, pull.objects)
        .unwrap();
    shipped
}

#[test]
fn test_sync_ships_exactly_the_missing_dots() {
    let ring = five_ring();
    let mut v1 = memory_vnode(1);
    let mut v2 = memory_vnode(2);

    // five coordinated writes; v2 hears about the first three
    let keys = shared_keys(&ring, 1, 2, 5);
    for (i, key) in keys.iter().enumerate() {
        let dcc = v1
            .write(
                WriteOp::Put(format!("v{}", i).into_bytes()),
                key,
                &VersionVector::new(),
            )
            .unwrap();
        if i < 3 {
            v2.replicate(key, dcc).unwrap();
        }
    }
    assert_eq!(v2.clock().base_of(1), 3);

    // v2 initiates: its view of v1 is (3, contiguous)
    let (initiator_id, entry) = v2.sync_start(1);
    assert_eq!(initiator_id, 2);
    assert_eq!(entry.base(), 3);
    assert!(entry.is_contiguous());

    let pull = v1.sync_request(initiator_id, &entry).unwrap();
    // dots 4 and 5 were missing, so exactly their two keys ship
    assert_eq!(pull.objects.len(), 2);
    assert_eq!(pull.clock_base.get(1), 5);

    v2.sync_response(pull.from, &pull.clock_base, pull.objects)
        .unwrap();

    // v2 absorbed v1's authoritative self-view wholesale
    assert_eq!(v2.clock().base_of(1), 5);
    assert!(v2.clock().entry(1).is_contiguous());

    // and holds every written value
    for (i, key) in keys.iter().enumerate() {
        let read = v2.read(key).unwrap();
        assert_eq!(
            read.dcc.values(),
            vec![&format!("v{}", i).into_bytes()],
            "key {} out of sync",
            i
        );
    }
}

#[test]
fn test_sync_skips_keys_the_peer_does_not_replicate() {
    let ring = five_ring();
    let mut v1 = memory_vnode(1);
    let mut v2 = memory_vnode(2);

    // a key v2 replicates and one it does not
    let shared = shared_keys(&ring, 1, 2, 1).remove(0);
    let foreign = (0..100_000u32)
        .map(|i| format!("other-{}", i).into_bytes())
        .find(|k| {
            let set = ring.replica_set(k);
            set.contains(&1) && !set.contains(&2)
        })
        .expect("a key on vnode 1 but not vnode 2");

    v1.write(WriteOp::Put(b"s".to_vec()), &shared, &VersionVector::new())
        .unwrap();
    v1.write(WriteOp::Put(b"f".to_vec()), &foreign, &VersionVector::new())
        .unwrap();

    let (id, entry) = v2.sync_start(1);
    let pull = v1.sync_request(id, &entry).unwrap();

    let shipped: Vec<&Key> = pull.objects.iter().map(|(k, _)| k).collect();
    assert_eq!(shipped, vec![&shared]);
}

#[test]
fn test_keylog_truncates_at_the_minimum_acknowledged_base() {
    let mut v1 = memory_vnode(1);

    let keys: Vec<Key> = (1..=10).map(|i| format!("k{}", i).into_bytes()).collect();
    for key in &keys {
        v1.write(WriteOp::Put(b"v".to_vec()), key, &VersionVector::new())
            .unwrap();
    }
    assert_eq!(v1.keylog().len(), 10);
    assert_eq!(v1.keylog().base(), 0);

    // peers acknowledge different prefixes of v1's dots
    for (peer, base) in [(3u64, 7u64), (4, 6), (5, 5), (2, 4)] {
        v1.sync_request(peer, &ClockEntry::from_base(base)).unwrap();
    }
    assert_eq!(v1.replicated().get(2), 4);
    assert_eq!(v1.replicated().get(3), 7);
    assert_eq!(v1.replicated().get(4), 6);
    assert_eq!(v1.replicated().get(5), 5);
    // minimum is 4, so dots 1..=4 are gone
    assert_eq!(v1.keylog().base(), 4);
    assert_eq!(v1.keylog().len(), 6);

    // v2 catches up to 6; the minimum moves to 5
    v1.sync_request(2, &ClockEntry::from_base(6)).unwrap();
    assert_eq!(v1.replicated().get(2), 6);
    assert_eq!(v1.keylog().base(), 5);
    assert_eq!(v1.keylog().len(), 5);
    assert_eq!(v1.keylog().key_for(6), Some(&keys[5]));
}

#[test]
fn test_truncation_restrips_stored_containers() {
    let mut v1 = memory_vnode(1);

    // a replicated container with an out-of-order remote dot leaves a
    // context entry the clock cannot cover yet
    let mut incoming = Dcc::new();
    incoming.add(Dot::new(2, 2), b"remote".to_vec());
    v1.replicate(b"m", incoming).unwrap();

    v1.write(WriteOp::Put(b"local".to_vec()), b"m", &VersionVector::new())
        .unwrap();
    let stored = v1.stored(b"m").unwrap().unwrap();
    assert_eq!(stored.context().get(2), 2);

    // vnode 2 reports its own contiguous base, covering dot (2,2)
    v1.sync_response(2, &VersionVector::from_entries([(2, 2)]), Vec::new())
        .unwrap();
    // the stored container still carries the stale entry
    assert_eq!(v1.stored(b"m").unwrap().unwrap().context().get(2), 2);

    // once every peer acknowledges dot 1, truncation re-strips the key
    for peer in [2u64, 3, 4, 5] {
        v1.sync_request(peer, &ClockEntry::from_base(1)).unwrap();
    }
    assert_eq!(v1.keylog().base(), 1);
    let restripped = v1.stored(b"m").unwrap().unwrap();
    assert!(restripped.context().is_empty());
    assert_eq!(restripped.len(), 2);
}

#[test]
fn test_sync_request_for_truncated_dots_ships_nothing() {
    let mut v1 = memory_vnode(1);
    v1.write(WriteOp::Put(b"v".to_vec()), b"k", &VersionVector::new())
        .unwrap();

    for peer in [2u64, 3, 4, 5] {
        v1.sync_request(peer, &ClockEntry::from_base(1)).unwrap();
    }
    assert_eq!(v1.keylog().base(), 1);

    // a peer whose ledger rolled back asks for dot 1 again; the slot is
    // gone, so the request is answered without it
    let pull = v1.sync_request(3, &ClockEntry::from_base(0)).unwrap();
    assert!(pull.objects.is_empty());
    // the acknowledgment ledger never regresses
    assert_eq!(v1.replicated().get(3), 1);
}

#[test]
fn test_sync_ships_deletions() {
    let ring = five_ring();
    let mut v1 = memory_vnode(1);
    let mut v2 = memory_vnode(2);

    let key = shared_keys(&ring, 1, 2, 1).remove(0);

    // v2 holds the first write
    let dcc = v1
        .write(WriteOp::Put(b"v".to_vec()), &key, &VersionVector::new())
        .unwrap();
    v2.replicate(&key, dcc.clone()).unwrap();
    assert_eq!(v2.read(&key).unwrap().dcc.len(), 1);

    // v1 deletes with the write's context; v2 never hears about it
    v1.write(WriteOp::Delete, &key, dcc.context()).unwrap();
    assert!(v1.stored(&key).unwrap().is_none());

    let shipped = run_sync(&mut v2, &mut v1);
    assert_eq!(shipped, 1);

    // the emptied container erased v2's stale sibling
    let read = v2.read(&key).unwrap();
    assert_eq!(read.dcc.len(), 0);
    assert!(v2.stored(&key).unwrap().is_none());
}
