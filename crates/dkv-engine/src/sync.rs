//! Anti-entropy driver.
//!
//! The engine is strictly reactive; this driver owns the three-step
//! exchange. A session walks `Idle → WaitingStart → WaitingResponse →
//! Done`, with a deadline on every step. A timed-out session is simply
//! discarded: the engine is never told, partial application is still a
//! valid merge, and the next round retries from scratch.

use crate::actor::VnodeHandle;
use crate::error::EngineError;
use dkv_causal::NodeId;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::debug;

/// Where a sync session currently stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// Waiting for the local vnode to report its view of the peer.
    WaitingStart,
    /// Waiting for the peer to ship missing objects.
    WaitingResponse,
    Done,
    Failed,
}

struct SyncSession {
    peer: NodeId,
    state: SessionState,
}

impl SyncSession {
    fn new(peer: NodeId) -> Self {
        SyncSession {
            peer,
            state: SessionState::Idle,
        }
    }

    fn advance(&mut self, next: SessionState) {
        debug!(peer = self.peer, from = ?self.state, to = ?next, "sync session");
        self.state = next;
    }
}

/// Errors of the driver itself, as opposed to a discarded session.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("no peers registered")]
    NoPeers,

    #[error("unknown peer {0}")]
    UnknownPeer(NodeId),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// What became of one sync session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The full exchange ran; `shipped` objects came back.
    Completed { peer: NodeId, shipped: usize },
    /// A step missed its deadline and the session was discarded.
    TimedOut { peer: NodeId, at: SessionState },
}

/// Drives pairwise anti-entropy for one local vnode.
pub struct AntiEntropyDriver {
    local: VnodeHandle,
    peers: HashMap<NodeId, VnodeHandle>,
    step_timeout: Duration,
}

impl AntiEntropyDriver {
    pub fn new(local: VnodeHandle, step_timeout: Duration) -> Self {
        AntiEntropyDriver {
            local,
            peers: HashMap::new(),
            step_timeout,
        }
    }

    /// Register a peer vnode to exchange with.
    pub fn register_peer(&mut self, handle: VnodeHandle) {
        self.peers.insert(handle.id(), handle);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Run one session against a randomly chosen peer.
    pub async fn run_round(&self) -> Result<SyncOutcome, SyncError> {
        let ids: Vec<NodeId> = self.peers.keys().copied().collect();
        let peer = *ids
            .choose(&mut rand::thread_rng())
            .ok_or(SyncError::NoPeers)?;
        self.sync_with(peer).await
    }

    /// Run one session against a specific peer.
    pub async fn sync_with(&self, peer: NodeId) -> Result<SyncOutcome, SyncError> {
        let peer_handle = self.peers.get(&peer).ok_or(SyncError::UnknownPeer(peer))?;
        let mut session = SyncSession::new(peer);

        session.advance(SessionState::WaitingStart);
        let (local_id, entry) = match timeout(self.step_timeout, self.local.sync_start(peer)).await
        {
            Ok(result) => result?,
            Err(_) => {
                session.advance(SessionState::Failed);
                return Ok(SyncOutcome::TimedOut {
                    peer,
                    at: SessionState::WaitingStart,
                });
            }
        };

        session.advance(SessionState::WaitingResponse);
        let pull = match timeout(
            self.step_timeout,
            peer_handle.sync_request(local_id, entry),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                session.advance(SessionState::Failed);
                return Ok(SyncOutcome::TimedOut {
                    peer,
                    at: SessionState::WaitingResponse,
                });
            }
        };

        let shipped = pull.objects.len();
        match timeout(
            self.step_timeout,
            self.local
                .sync_response(pull.from, pull.clock_base, pull.objects),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                // the apply step stalled; whatever landed is a valid
                // partial merge, the next round ships the rest again
                session.advance(SessionState::Failed);
                return Ok(SyncOutcome::TimedOut {
                    peer,
                    at: SessionState::WaitingResponse,
                });
            }
        }

        session.advance(SessionState::Done);
        Ok(SyncOutcome::Completed { peer, shipped })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::spawn_vnode;
    use crate::config::EngineConfig;
    use crate::ring::Ring;
    use crate::stats::NoopStats;
    use crate::vnode::{Vnode, WriteOp};
    use dkv_causal::vv::VersionVector;
    use dkv_causal::Key;
    use dkv_storage::{MemoryStateStore, MemoryStore};
    use std::sync::Arc;

    fn five_ring() -> Ring {
        Ring::new([1, 2, 3, 4, 5], 3)
    }

    fn spawn(id: NodeId) -> VnodeHandle {
        let vnode = Vnode::open(
            id,
            five_ring(),
            Box::new(MemoryStore::new()),
            Box::new(MemoryStateStore::new()),
            EngineConfig::default(),
            Arc::new(NoopStats),
        );
        spawn_vnode(vnode).0
    }

    /// A key replicated on both given vnodes.
    fn shared_key(ring: &Ring, a: NodeId, b: NodeId) -> Key {
        for i in 0..10_000u32 {
            let key = format!("key-{}", i).into_bytes();
            let set = ring.replica_set(&key);
            if set.contains(&a) && set.contains(&b) {
                return key;
            }
        }
        panic!("no key replicated on both {} and {}", a, b);
    }

    #[tokio::test]
    async fn test_sync_ships_missing_objects() {
        let ring = five_ring();
        let coordinator = spawn(1);
        let follower = spawn(2);

        let key = shared_key(&ring, 1, 2);
        // a read-modify-write chain the follower never hears about
        let mut observed = VersionVector::new();
        for value in [&b"a"[..], b"b", b"c"] {
            let reply = coordinator
                .write(WriteOp::Put(value.to_vec()), key.clone(), observed)
                .await
                .unwrap();
            observed = reply.context().clone();
        }

        let mut driver = AntiEntropyDriver::new(follower.clone(), Duration::from_secs(2));
        driver.register_peer(coordinator.clone());

        let outcome = driver.sync_with(1).await.unwrap();
        assert!(matches!(
            outcome,
            SyncOutcome::Completed { peer: 1, shipped: 1 }
        ));

        // the follower now holds the coordinator's latest sibling set
        let read = follower.read(key).await.unwrap();
        assert_eq!(read.dcc.values(), vec![&b"c".to_vec()]);
        assert_eq!(read.dcc.context().get(1), 3);
    }

    #[tokio::test]
    async fn test_sync_round_with_nothing_missing() {
        let follower = spawn(2);
        let coordinator = spawn(1);

        let mut driver = AntiEntropyDriver::new(follower, Duration::from_secs(2));
        driver.register_peer(coordinator);

        let outcome = driver.run_round().await.unwrap();
        assert!(matches!(
            outcome,
            SyncOutcome::Completed { peer: 1, shipped: 0 }
        ));
    }

    #[tokio::test]
    async fn test_sync_without_peers() {
        let local = spawn(1);
        let driver = AntiEntropyDriver::new(local, Duration::from_secs(1));
        assert!(matches!(driver.run_round().await, Err(SyncError::NoPeers)));
    }

    #[tokio::test]
    async fn test_sync_with_dead_peer_is_an_error() {
        let local = spawn(1);
        let dead = spawn(2);
        dead.shutdown().await.unwrap();

        let mut driver = AntiEntropyDriver::new(local, Duration::from_secs(1));
        driver.register_peer(dead);

        assert!(matches!(
            driver.sync_with(2).await,
            Err(SyncError::Engine(EngineError::Terminated))
        ));
    }
}
