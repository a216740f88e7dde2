//! The per-partition replica engine.
//!
//! A vnode owns one partition of the ring: it coordinates client writes
//! (generating a dot per write), applies replicated and repaired
//! containers from its peers, answers reads, and exchanges anti-entropy
//! messages that ship exactly the dots a peer is missing. As peers
//! acknowledge its dots, the vnode truncates its keylog and strips the
//! causal context out of stored containers; the node clock's contiguous
//! base carries that knowledge from then on.
//!
//! Every handler runs to completion on the owning task; there is no
//! shared state and no locking. Mutating handlers take `&mut self`,
//! read-only ones `&self`.

use crate::config::{Backend, EngineConfig};
use crate::error::{EngineError, Result};
use crate::keylog::Keylog;
use crate::ring::Ring;
use crate::stats::{StatEvent, StatsSink};
use dkv_causal::bvv::{ClockEntry, NodeClock};
use dkv_causal::dcc::{Dcc, Dot};
use dkv_causal::vv::VersionVector;
use dkv_causal::{Key, NodeId, Value};
use dkv_storage::{
    FileStateStore, LogStore, MemoryStateStore, MemoryStore, ObjectStore, StateStore,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

const STATE_RECORD_VERSION: u8 = 1;

/// The durable tuple a vnode persists and restores.
#[derive(Serialize, Deserialize)]
struct PersistedState {
    version: u8,
    clock: NodeClock,
    keylog: Keylog,
    replicated: VersionVector,
}

/// A client write operation.
#[derive(Clone, Debug)]
pub enum WriteOp {
    Put(Value),
    Delete,
}

/// Which replica answered, for coordinator bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaRef {
    pub index: NodeId,
    pub node: String,
}

/// Reply to a read.
#[derive(Clone, Debug)]
pub struct ReadReply {
    pub from: ReplicaRef,
    pub dcc: Dcc,
}

/// Reply to a sync pull: the responder's identity, its contiguous clock
/// frontier, and the objects the asking peer is missing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncPullReply {
    pub from: NodeId,
    pub clock_base: VersionVector,
    pub objects: Vec<(Key, Dcc)>,
}

/// One partition's replica engine.
pub struct Vnode {
    id: NodeId,
    ring: Ring,
    clock: NodeClock,
    replicated: VersionVector,
    keylog: Keylog,
    storage: Box<dyn ObjectStore>,
    state: Box<dyn StateStore>,
    config: EngineConfig,
    stats: Arc<dyn StatsSink>,
    updates_since_flush: u64,
}

impl Vnode {
    /// Open a vnode over explicit stores, restoring the durable tuple
    /// when one exists.
    ///
    /// An unreadable record is logged and answered with a fresh state:
    /// anti-entropy re-converges the data, which beats refusing to start.
    pub fn open(
        id: NodeId,
        ring: Ring,
        storage: Box<dyn ObjectStore>,
        state: Box<dyn StateStore>,
        config: EngineConfig,
        stats: Arc<dyn StatsSink>,
    ) -> Self {
        let restored = match state.load(id) {
            Ok(Some(bytes)) => match bincode::deserialize::<PersistedState>(&bytes) {
                Ok(record) if record.version == STATE_RECORD_VERSION => Some(record),
                Ok(record) => {
                    warn!(
                        vnode = id,
                        version = record.version,
                        "unknown state record version, starting fresh"
                    );
                    None
                }
                Err(e) => {
                    warn!(vnode = id, error = %e, "undecodable state record, starting fresh");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(vnode = id, error = %e, "state restore failed, starting fresh");
                None
            }
        };

        let (clock, keylog, replicated) = match restored {
            Some(record) => {
                debug!(vnode = id, "restored durable state");
                (record.clock, record.keylog, record.replicated)
            }
            None => {
                // every peer starts acknowledged at 0 so the minimum over
                // the ledger is defined from the first sync on
                let mut replicated = VersionVector::new();
                for peer in ring.peers(id) {
                    replicated.add(peer, 0);
                }
                (NodeClock::new(), Keylog::new(), replicated)
            }
        };

        Vnode {
            id,
            ring,
            clock,
            replicated,
            keylog,
            storage,
            state,
            config,
            stats,
            updates_since_flush: 0,
        }
    }

    /// Open a vnode with stores chosen by the configuration.
    pub fn bootstrap(
        id: NodeId,
        ring: Ring,
        config: EngineConfig,
        stats: Arc<dyn StatsSink>,
    ) -> Result<Self> {
        let storage: Box<dyn ObjectStore> = match config.backend {
            Backend::Memory => Box::new(MemoryStore::new()),
            Backend::Log => Box::new(LogStore::open(config.object_path(id))?),
        };
        let state: Box<dyn StateStore> = match config.backend {
            Backend::Memory => Box::new(MemoryStateStore::new()),
            Backend::Log => Box::new(FileStateStore::open(config.state_dir())?),
        };
        Ok(Self::open(id, ring, storage, state, config, stats))
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    pub fn clock(&self) -> &NodeClock {
        &self.clock
    }

    pub fn keylog(&self) -> &Keylog {
        &self.keylog
    }

    pub fn replicated(&self) -> &VersionVector {
        &self.replicated
    }

    pub fn replica_ref(&self) -> ReplicaRef {
        ReplicaRef {
            index: self.id,
            node: self.config.node_name.clone(),
        }
    }

    /// The container exactly as stored, for inspection.
    pub fn stored(&self, key: &[u8]) -> Result<Option<Dcc>> {
        Ok(self.storage.get(key)?)
    }

    pub fn object_count(&self) -> usize {
        self.storage.len()
    }

    /// Serve a read: the stored container (or an empty one) saturated
    /// with this node's causal knowledge, so the coordinator can tell
    /// "never seen" apart from "deleted after what you read".
    pub fn read(&self, key: &[u8]) -> Result<ReadReply> {
        let mut dcc = self.storage.get(key)?.unwrap_or_default();
        dcc.fill(&self.clock.base());
        self.stats.record(StatEvent::Read);
        Ok(ReadReply {
            from: self.replica_ref(),
            dcc,
        })
    }

    /// Coordinate a client write.
    ///
    /// Returns the unstripped container: replicas need the full causal
    /// context, only the local store gets the stripped form.
    pub fn write(&mut self, op: WriteOp, key: &[u8], client_ctx: &VersionVector) -> Result<Dcc> {
        let mut dcc = self.filled_or_empty(key);
        // drop the siblings the client has observed; for a delete this is
        // the whole point, for a put it defines what gets superseded
        dcc.discard(client_ctx);

        let counter = self.clock.event(self.id);
        if let WriteOp::Put(value) = op {
            dcc.add(Dot::new(self.id, counter), value);
        }

        self.store_stripped(key, &dcc)?;
        self.keylog.push(key.to_vec());

        self.stats.record(StatEvent::Write);
        self.note_update()?;
        Ok(dcc)
    }

    /// Apply a container replicated from the coordinating vnode.
    pub fn replicate(&mut self, key: &[u8], incoming: Dcc) -> Result<()> {
        self.merge_incoming(key, incoming)?;
        self.stats.record(StatEvent::Replicate);
        Ok(())
    }

    /// Apply a read-repair container. Repairs are not coordinated writes:
    /// no dot is generated and the keylog is untouched.
    pub fn repair(&mut self, key: &[u8], incoming: Dcc) -> Result<()> {
        self.merge_incoming(key, incoming)?;
        self.stats.record(StatEvent::Repair);
        Ok(())
    }

    /// Anti-entropy step one, at the initiator: report this node's view
    /// of the peer's own clock entry.
    pub fn sync_start(&self, peer: NodeId) -> (NodeId, ClockEntry) {
        (self.id, self.clock.entry(peer))
    }

    /// Anti-entropy step two, at the asked peer: ship the objects behind
    /// every dot the initiator is missing, record its acknowledgment, and
    /// garbage-collect the keylog.
    pub fn sync_request(&mut self, remote: NodeId, remote_entry: &ClockEntry) -> Result<SyncPullReply> {
        let local_entry = self.clock.entry(self.id);

        let acked_base = if remote_entry.base() > local_entry.base() {
            // the initiator claims dots this vnode never generated; that
            // can follow a state rollback on our side, so serve what we
            // can but never acknowledge past our own clock
            warn!(
                vnode = self.id,
                remote,
                claimed = remote_entry.base(),
                own = local_entry.base(),
                "peer claims dots beyond our clock"
            );
            local_entry.base()
        } else {
            remote_entry.base()
        };

        // dots the initiator has not seen, in ascending order
        let mut keys: BTreeSet<Key> = BTreeSet::new();
        for counter in local_entry.values() {
            if remote_entry.contains(counter) {
                continue;
            }
            match self.keylog.key_for(counter) {
                Some(key) => {
                    keys.insert(key.clone());
                }
                None => {
                    // below the keylog base means every peer acknowledged
                    // this dot already; the ledgers disagree
                    warn!(
                        vnode = self.id,
                        remote, counter, "missing dot has no keylog slot, skipping"
                    );
                }
            }
        }

        let frontier = self.clock.base();
        let mut objects = Vec::new();
        for key in keys {
            // only ship keys the initiator actually replicates
            if !self.ring.replica_set(&key).contains(&remote) {
                continue;
            }
            let dcc = self.guarded_get(&key);
            // an empty container still ships: it tells the initiator the
            // key is gone as far as this vnode knows
            objects.push((key, dcc.strip(&frontier)));
        }

        // the initiator has now seen our dots 1..=acked_base contiguously
        if self.replicated.ids().any(|p| p == remote) {
            self.replicated.add(remote, acked_base);
            self.truncate_keylog();
        }

        self.stats.record(StatEvent::SyncShipped(objects.len()));
        Ok(SyncPullReply {
            from: self.id,
            clock_base: frontier,
            objects,
        })
    }

    /// Anti-entropy step three, back at the initiator: absorb the peer's
    /// authoritative self-view and merge the shipped objects.
    pub fn sync_response(
        &mut self,
        remote: NodeId,
        remote_base: &VersionVector,
        objects: Vec<(Key, Dcc)>,
    ) -> Result<()> {
        let claimed = remote_base.get(remote);
        let current_base = self.clock.base_of(remote);
        if claimed < current_base {
            // clocks only grow; a shrinking self-report is a malformed
            // message and must not clobber what we know
            return Err(EngineError::Protocol {
                node: remote,
                reason: format!(
                    "self-reported base {} regresses below known base {}",
                    claimed, current_base
                ),
            });
        }
        // local containers are filled with the frontier from before the
        // peer's view lands in the clock; the shipped dots must not be
        // pre-dominated by the very knowledge that announced them
        let local_frontier = self.clock.base();

        // the peer is the sole generator of its dots: replace, not union
        self.clock.store_entry(remote, ClockEntry::from_base(claimed));

        let mut applied = 0;
        for (key, mut incoming) in objects {
            incoming.fill(remote_base);
            let mut local = self.guarded_get(&key);
            local.fill(&local_frontier);
            let merged = incoming.sync(&local);
            if merged != local {
                self.store_stripped(&key, &merged)?;
                applied += 1;
            }
        }

        self.stats.record(StatEvent::SyncApplied(applied));
        debug!(vnode = self.id, remote, applied, "applied sync response");
        Ok(())
    }

    /// Fold over every stored object, for partition handoff.
    pub fn handoff_fold<A>(&self, acc: A, mut f: impl FnMut(A, &[u8], &Dcc) -> A) -> Result<A> {
        let mut slot = Some(acc);
        self.storage.fold(&mut |key, dcc| {
            let current = slot.take().expect("accumulator always present");
            slot = Some(f(current, key, dcc));
        })?;
        Ok(slot.expect("accumulator always present"))
    }

    /// Every stored object as an encoded handoff item.
    pub fn handoff_items(&self) -> Result<Vec<Vec<u8>>> {
        let pairs = self.handoff_fold(Vec::new(), |mut acc, key, dcc| {
            acc.push((key.to_vec(), dcc.clone()));
            acc
        })?;
        pairs
            .into_iter()
            .map(|pair| bincode::serialize(&pair).map_err(EngineError::from))
            .collect()
    }

    /// Apply one handoff item on the receiving vnode.
    pub fn handoff_receive(&mut self, item: &[u8]) -> Result<()> {
        let (key, incoming): (Key, Dcc) = bincode::deserialize(item)?;
        let local = self.filled_or_empty(&key);
        let merged = incoming.sync(&local);
        self.store_stripped(&key, &merged)?;
        // handoff streams can be long; let them hit the flush boundary
        // like coordinated writes do
        self.note_update()?;
        Ok(())
    }

    /// Persist the durable tuple and sync both stores.
    pub fn flush(&mut self) -> Result<()> {
        let record = PersistedState {
            version: STATE_RECORD_VERSION,
            clock: self.clock.clone(),
            keylog: self.keylog.clone(),
            replicated: self.replicated.clone(),
        };
        let bytes = bincode::serialize(&record)?;
        self.state.save(self.id, &bytes)?;
        self.state.sync()?;
        self.storage.sync()?;
        self.updates_since_flush = 0;
        self.stats.record(StatEvent::Flush);
        debug!(vnode = self.id, "flushed durable state");
        Ok(())
    }

    /// Flush and release both stores.
    pub fn shutdown(&mut self) -> Result<()> {
        self.flush()?;
        self.storage.close()?;
        self.state.close()?;
        Ok(())
    }

    /// Shared tail of replicate and repair: absorb the container's events
    /// into the clock, merge with the filled local container, store the
    /// stripped result.
    ///
    /// The local container is filled with the frontier as it was BEFORE
    /// absorbing the incoming events; filling with the updated clock
    /// would make the local context dominate the very dots being
    /// delivered and the merge would drop them.
    fn merge_incoming(&mut self, key: &[u8], incoming: Dcc) -> Result<()> {
        let mut local = self.guarded_get(key);
        local.fill(&self.clock.base());
        self.clock.add_dcc(&incoming);
        let merged = incoming.sync(&local);
        self.store_stripped(key, &merged)
    }

    /// Fetch a key's container saturated with the local clock; a read
    /// failure is logged and treated as absent so writes never stall.
    fn filled_or_empty(&self, key: &[u8]) -> Dcc {
        let mut dcc = self.guarded_get(key);
        dcc.fill(&self.clock.base());
        dcc
    }

    fn guarded_get(&self, key: &[u8]) -> Dcc {
        match self.storage.get(key) {
            Ok(Some(dcc)) => dcc,
            Ok(None) => Dcc::new(),
            Err(e) => {
                warn!(vnode = self.id, error = %e, "storage read failed, treating as absent");
                Dcc::new()
            }
        }
    }

    /// Store a container stripped against the local clock, or delete the
    /// key when nothing remains: a fully covered container carries no
    /// information the clock does not.
    fn store_stripped(&mut self, key: &[u8], dcc: &Dcc) -> Result<()> {
        let stripped = dcc.strip(&self.clock.base());
        if stripped.is_empty() {
            self.storage.delete(key)?;
        } else {
            self.storage.put(key.to_vec(), stripped)?;
        }
        Ok(())
    }

    /// Drop the keylog prefix every peer has acknowledged and give the
    /// dropped keys a final strip against the (by now larger) clock.
    fn truncate_keylog(&mut self) {
        let Some(min_acked) = self.replicated.min() else {
            return;
        };
        if min_acked <= self.keylog.base() {
            return;
        }

        let removed = self.keylog.truncate_upto(min_acked);
        if removed.is_empty() {
            return;
        }

        let frontier = self.clock.base();
        let unique: BTreeSet<Key> = removed.iter().cloned().collect();
        for key in unique {
            match self.storage.get(&key) {
                Ok(Some(dcc)) => {
                    let stripped = dcc.strip(&frontier);
                    if stripped.is_empty() {
                        if let Err(e) = self.storage.delete(&key) {
                            warn!(vnode = self.id, error = %e, "post-truncation delete failed");
                        }
                    } else if stripped != dcc {
                        if let Err(e) = self.storage.put(key.clone(), stripped) {
                            warn!(vnode = self.id, error = %e, "post-truncation strip failed");
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(vnode = self.id, error = %e, "post-truncation read failed");
                }
            }
        }

        self.stats.record(StatEvent::KeylogTruncated(removed.len()));
        debug!(
            vnode = self.id,
            upto = min_acked,
            keys = removed.len(),
            "truncated keylog"
        );
    }

    /// Count a coordinated update toward the periodic flush.
    fn note_update(&mut self) -> Result<()> {
        self.updates_since_flush += 1;
        if self.updates_since_flush >= self.config.update_limit {
            self.flush()?;
        }
        Ok(())
    }
}
