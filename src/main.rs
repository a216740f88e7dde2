//! DottedKV cluster demo.
//!
//! Spins up a ring of vnode actors on one process, runs a lossy write
//! workload through per-key coordinators, then lets pairwise anti-entropy
//! close the gaps and reports when every replica answers alike.
//!
//! Usage: `cargo run [vnodes] [keys] [writes]`

use dkv_causal::{Key, NodeId};
use dkv_engine::{
    spawn_vnode, AntiEntropyDriver, CountingStats, EngineConfig, Ring, Vnode, VnodeHandle, WriteOp,
};
use dkv_storage::{MemoryStateStore, MemoryStore};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::Duration;

const MAX_SYNC_ROUNDS: usize = 500;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    // at least one full replica set's worth of vnodes
    let vnodes: u64 = parse_arg(&args, 1).unwrap_or(8).max(3);
    let keys: u32 = parse_arg(&args, 2).unwrap_or(50);
    let writes: u32 = parse_arg(&args, 3).unwrap_or(500);

    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");
    if let Err(e) = rt.block_on(run(vnodes, keys, writes)) {
        eprintln!("demo failed: {}", e);
        std::process::exit(1);
    }
}

fn parse_arg<T: std::str::FromStr>(args: &[String], index: usize) -> Option<T> {
    args.get(index).and_then(|s| s.parse().ok())
}

async fn run(vnode_count: u64, key_count: u32, write_count: u32) -> Result<(), Box<dyn std::error::Error>> {
    println!("── DottedKV demo ───────────────────────────────────────────");
    println!("vnodes: {}   keys: {}   writes: {}", vnode_count, key_count, write_count);

    // spread vnode positions evenly over the hash space
    let step = u64::MAX / vnode_count;
    let ring = Ring::new((0..vnode_count).map(|i| i * step), 3);
    let stats = CountingStats::new();

    let mut handles: HashMap<NodeId, VnodeHandle> = HashMap::new();
    for &id in ring.positions() {
        let vnode = Vnode::open(
            id,
            ring.clone(),
            Box::new(MemoryStore::new()),
            Box::new(MemoryStateStore::new()),
            EngineConfig::default(),
            stats.clone(),
        );
        let (handle, _join) = spawn_vnode(vnode);
        handles.insert(id, handle);
    }

    let mut drivers: Vec<AntiEntropyDriver> = Vec::new();
    for &id in ring.positions() {
        let mut driver = AntiEntropyDriver::new(handles[&id].clone(), Duration::from_secs(2));
        for peer in ring.peers(id) {
            driver.register_peer(handles[&peer].clone());
        }
        drivers.push(driver);
    }

    // read-modify-write at each key's coordinator, fanning out to the
    // rest of the replica set with simulated replication loss
    let mut rng = rand::thread_rng();
    let mut dropped: u64 = 0;
    for i in 0..write_count {
        let key = demo_key(rng.gen_range(0..key_count));
        let set = ring.replica_set(&key);
        let coordinator = &handles[&set[0]];

        let observed = coordinator.read(key.clone()).await?.dcc.context().clone();
        let value = format!("value-{}", i).into_bytes();
        let dcc = coordinator
            .write(WriteOp::Put(value), key.clone(), observed)
            .await?;

        for &replica in &set[1..] {
            if rng.gen_bool(0.25) {
                dropped += 1;
                continue;
            }
            handles[&replica].replicate(key.clone(), dcc.clone()).await?;
        }
    }
    println!("workload done: {} replicate messages dropped", dropped);

    // pairwise anti-entropy until every replica answers alike
    let mut rounds = 0;
    let converged = loop {
        if rounds >= MAX_SYNC_ROUNDS {
            break false;
        }
        for driver in &drivers {
            driver.run_round().await?;
        }
        rounds += 1;
        if all_replicas_agree(&ring, &handles, key_count).await? {
            break true;
        }
    };

    println!("anti-entropy: {} rounds", rounds);
    println!(
        "engine totals: {} reads, {} writes, {} replicates, {} objects shipped, {} keys truncated, {} flushes",
        stats.reads.load(Ordering::Relaxed),
        stats.writes.load(Ordering::Relaxed),
        stats.replicates.load(Ordering::Relaxed),
        stats.sync_shipped.load(Ordering::Relaxed),
        stats.keys_truncated.load(Ordering::Relaxed),
        stats.flushes.load(Ordering::Relaxed),
    );

    for handle in handles.values() {
        handle.shutdown().await?;
    }

    if converged {
        println!("✓ all replica sets converged");
        Ok(())
    } else {
        Err("replicas failed to converge".into())
    }
}

fn demo_key(index: u32) -> Key {
    format!("user:{:04}", index).into_bytes()
}

async fn all_replicas_agree(
    ring: &Ring,
    handles: &HashMap<NodeId, VnodeHandle>,
    key_count: u32,
) -> Result<bool, Box<dyn std::error::Error>> {
    for k in 0..key_count {
        let key = demo_key(k);
        let mut first: Option<Vec<Vec<u8>>> = None;
        for replica in ring.replica_set(&key) {
            let reply = handles[&replica].read(key.clone()).await?;
            let mut values: Vec<Vec<u8>> = reply.dcc.values().into_iter().cloned().collect();
            values.sort();
            match &first {
                None => first = Some(values),
                Some(expected) if *expected != values => return Ok(false),
                Some(_) => {}
            }
        }
    }
    Ok(true)
}
