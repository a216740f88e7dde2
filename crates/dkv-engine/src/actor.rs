//! One task per vnode.
//!
//! A spawned vnode owns its state exclusively and drains a mailbox of
//! commands, each processed to completion before the next; the reply
//! channel of a command is its correlation id. Handles are cheap clones
//! sharing the mailbox sender.

use crate::error::{EngineError, Result};
use crate::vnode::{ReadReply, SyncPullReply, Vnode, WriteOp};
use dkv_causal::bvv::ClockEntry;
use dkv_causal::dcc::Dcc;
use dkv_causal::vv::VersionVector;
use dkv_causal::{Key, NodeId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

/// The closed set of commands a vnode serves.
pub enum Command {
    Read {
        key: Key,
        reply: oneshot::Sender<Result<ReadReply>>,
    },
    /// Fire-and-forget: read repair carries no reply.
    Repair { key: Key, dcc: Dcc },
    Write {
        op: WriteOp,
        key: Key,
        client_ctx: VersionVector,
        reply: oneshot::Sender<Result<Dcc>>,
    },
    Replicate {
        key: Key,
        dcc: Dcc,
        reply: oneshot::Sender<Result<()>>,
    },
    SyncStart {
        peer: NodeId,
        reply: oneshot::Sender<(NodeId, ClockEntry)>,
    },
    SyncRequest {
        remote: NodeId,
        entry: ClockEntry,
        reply: oneshot::Sender<Result<SyncPullReply>>,
    },
    SyncResponse {
        remote: NodeId,
        clock_base: VersionVector,
        objects: Vec<(Key, Dcc)>,
        reply: oneshot::Sender<Result<()>>,
    },
    HandoffItems {
        reply: oneshot::Sender<Result<Vec<Vec<u8>>>>,
    },
    HandoffReceive {
        item: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Client handle to a spawned vnode.
#[derive(Clone)]
pub struct VnodeHandle {
    id: NodeId,
    tx: mpsc::UnboundedSender<Command>,
}

/// Spawn a vnode onto its own task and return a handle to it.
pub fn spawn_vnode(mut vnode: Vnode) -> (VnodeHandle, JoinHandle<()>) {
    let id = vnode.id();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let join = tokio::spawn(async move {
        let mut shut_down = false;
        while let Some(command) = rx.recv().await {
            match command {
                Command::Read { key, reply } => {
                    let _ = reply.send(vnode.read(&key));
                }
                Command::Repair { key, dcc } => {
                    if let Err(e) = vnode.repair(&key, dcc) {
                        warn!(vnode = vnode.id(), error = %e, "repair failed");
                    }
                }
                Command::Write {
                    op,
                    key,
                    client_ctx,
                    reply,
                } => {
                    let _ = reply.send(vnode.write(op, &key, &client_ctx));
                }
                Command::Replicate { key, dcc, reply } => {
                    let _ = reply.send(vnode.replicate(&key, dcc));
                }
                Command::SyncStart { peer, reply } => {
                    let _ = reply.send(vnode.sync_start(peer));
                }
                Command::SyncRequest {
                    remote,
                    entry,
                    reply,
                } => {
                    let _ = reply.send(vnode.sync_request(remote, &entry));
                }
                Command::SyncResponse {
                    remote,
                    clock_base,
                    objects,
                    reply,
                } => {
                    let _ = reply.send(vnode.sync_response(remote, &clock_base, objects));
                }
                Command::HandoffItems { reply } => {
                    let _ = reply.send(vnode.handoff_items());
                }
                Command::HandoffReceive { item, reply } => {
                    let _ = reply.send(vnode.handoff_receive(&item));
                }
                Command::Shutdown { reply } => {
                    let _ = reply.send(vnode.shutdown());
                    shut_down = true;
                    break;
                }
            }
        }

        if !shut_down {
            // every handle dropped without an explicit shutdown
            if let Err(e) = vnode.shutdown() {
                warn!(vnode = vnode.id(), error = %e, "shutdown on mailbox close failed");
            }
        }
    });

    (VnodeHandle { id, tx }, join)
}

impl VnodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub async fn read(&self, key: impl Into<Key>) -> Result<ReadReply> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Read {
            key: key.into(),
            reply,
        })?;
        Self::recv(rx).await?
    }

    /// Enqueue a read repair; there is no reply to wait for.
    pub fn repair(&self, key: impl Into<Key>, dcc: Dcc) -> Result<()> {
        self.send(Command::Repair {
            key: key.into(),
            dcc,
        })
    }

    pub async fn write(
        &self,
        op: WriteOp,
        key: impl Into<Key>,
        client_ctx: VersionVector,
    ) -> Result<Dcc> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Write {
            op,
            key: key.into(),
            client_ctx,
            reply,
        })?;
        Self::recv(rx).await?
    }

    pub async fn replicate(&self, key: impl Into<Key>, dcc: Dcc) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Replicate {
            key: key.into(),
            dcc,
            reply,
        })?;
        Self::recv(rx).await?
    }

    pub async fn sync_start(&self, peer: NodeId) -> Result<(NodeId, ClockEntry)> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SyncStart { peer, reply })?;
        Self::recv(rx).await
    }

    pub async fn sync_request(&self, remote: NodeId, entry: ClockEntry) -> Result<SyncPullReply> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SyncRequest {
            remote,
            entry,
            reply,
        })?;
        Self::recv(rx).await?
    }

    pub async fn sync_response(
        &self,
        remote: NodeId,
        clock_base: VersionVector,
        objects: Vec<(Key, Dcc)>,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SyncResponse {
            remote,
            clock_base,
            objects,
            reply,
        })?;
        Self::recv(rx).await?
    }

    pub async fn handoff_items(&self) -> Result<Vec<Vec<u8>>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::HandoffItems { reply })?;
        Self::recv(rx).await?
    }

    pub async fn handoff_receive(&self, item: Vec<u8>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::HandoffReceive { item, reply })?;
        Self::recv(rx).await?
    }

    /// Flush durable state and stop the vnode task.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply })?;
        Self::recv(rx).await?
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| EngineError::Terminated)
    }

    async fn recv<T>(rx: oneshot::Receiver<T>) -> Result<T> {
        rx.await.map_err(|_| EngineError::Terminated)
    }
}
