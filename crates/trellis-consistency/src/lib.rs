//! Trellis Consistency - replicated state machines for coordination primitives
//!
//! This crate provides:
//! - Per-partition Raft replication over a pluggable log store
//! - Client sessions with exactly-once commands and deterministic expiry
//! - Command and query dispatch with linearizable, sequential and causal reads
//! - A registry of primitive services (map, counter, lock, leader election, work queue)
//! - Mode-aware log compaction
//! - Partition routing, an in-process cluster runtime and the client surface

#![allow(clippy::result_large_err)]

pub mod client;
pub mod cluster;
pub mod compaction;
pub mod dispatch;
pub mod raft;
pub mod router;
pub mod service;
pub mod session;

// Re-export the client surface
pub use client::{
    AtomicCounter, ClientConfig, ClientSession, DistributedLock, DistributedMap, LeaderElection,
    TrellisClient, WorkQueue,
};

// Re-export the cluster runtime
pub use cluster::{ClusterConfig, GroupConfig, LocalCluster, LocalTransport, StorageMode, Transport};

// Re-export core building blocks
pub use compaction::{CompactionConfig, CompactionController};
pub use dispatch::{Operation, PartitionHandle, PartitionServer, PartitionStateMachine};
pub use raft::{LogEntry, LogStore, RaftConfig, RaftCore, RaftStatus};
pub use router::{PartitionGroup, Route, Router};
pub use service::{ApplyContext, ServiceRegistry, StateMachineService};
pub use session::SessionConfig;
