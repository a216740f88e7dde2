//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Which object-storage backend a vnode uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    /// In-memory ordered map, the default. Objects do not survive a
    /// restart; anti-entropy repopulates them.
    Memory,
    /// On-disk append-only log with replay-on-open.
    Log,
}

/// Configuration for a vnode engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Object-storage backend.
    pub backend: Backend,
    /// Root data directory; objects live under `objects/`, vnode state
    /// under `vnode_state/`.
    pub data_dir: PathBuf,
    /// Flush the durable state tuple every this many coordinated updates.
    pub update_limit: u64,
    /// Number of replicas per key.
    pub replication_factor: usize,
    /// Per-step deadline for an anti-entropy session.
    pub sync_timeout: Duration,
    /// Name of the physical node hosting this vnode, echoed in replies.
    pub node_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            backend: Backend::Memory,
            data_dir: PathBuf::from("data"),
            update_limit: 100,
            replication_factor: 3,
            sync_timeout: Duration::from_secs(2),
            node_name: "local".to_string(),
        }
    }
}

impl EngineConfig {
    /// Path of the object log for a vnode.
    pub fn object_path(&self, index: u64) -> PathBuf {
        self.data_dir.join("objects").join(index.to_string())
    }

    /// Directory of the durable vnode-state records.
    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("vnode_state")
    }

    /// How many peers a vnode exchanges anti-entropy with.
    pub fn peer_count(&self) -> usize {
        2 * (self.replication_factor - 1)
    }
}

/// Builder for [`EngineConfig`].
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.config.backend = backend;
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    pub fn update_limit(mut self, limit: u64) -> Self {
        self.config.update_limit = limit;
        self
    }

    pub fn replication_factor(mut self, rf: usize) -> Self {
        self.config.replication_factor = rf;
        self
    }

    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.config.sync_timeout = timeout;
        self
    }

    pub fn node_name(mut self, name: impl Into<String>) -> Self {
        self.config.node_name = name.into();
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
