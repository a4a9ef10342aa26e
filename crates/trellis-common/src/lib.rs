//! Trellis Common - Shared types and error taxonomy
//!
//! This crate provides the foundational types used across all Trellis components:
//! - Node, partition, log index, term and session identifiers
//! - Read consistency levels and log compaction modes
//! - Protocol and domain error types

pub mod error;
pub mod types;

// Re-exports for convenience
pub use error::{DomainError, Result, TrellisError};
pub use types::{CompactionMode, Consistency, Index, NodeId, PartitionId, SessionId, Term};

/// Name of the partition group used when a primitive does not name one
pub const DEFAULT_GROUP: &str = "default";
