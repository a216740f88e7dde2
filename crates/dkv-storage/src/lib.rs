pub mod backend;
pub mod log;
pub mod memory;
pub mod state;

pub use backend::{ObjectStore, StorageError};
pub use log::LogStore;
pub use memory::MemoryStore;
pub use state::{FileStateStore, MemoryStateStore, StateStore};
