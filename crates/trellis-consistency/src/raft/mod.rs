// Raft consensus module for Trellis partitions
// Provides the replicated log every partition state machine is driven by

pub mod config;
pub mod file_store;
pub mod log_store;
pub mod message;
pub mod node;
pub mod types;

// Re-export commonly used types
pub use config::RaftConfig;
pub use file_store::FileLogStore;
pub use log_store::{LogStore, MemoryLogStore};
pub use message::{Envelope, Message};
pub use node::{MembershipChange, RaftCore, ReadState};
pub use types::{
    EntryPayload, HardState, LeaderState, LogEntry, Membership, RaftStatus, Role, Snapshot,
    SnapshotMeta,
};
