//! Command and query dispatch
//!
//! Mutations always travel through the leader's log and are applied in
//! commit order; reads are served from the local state machine once the
//! requested consistency condition holds:
//!
//! - LINEARIZABLE: on the leader, after a read-index round confirms
//!   leadership and the state machine has applied the read index
//! - SEQUENTIAL / CAUSAL: on any replica whose applied index has reached the
//!   caller's last observed index

pub mod command;
pub mod server;
pub mod state_machine;

pub use command::{LogCommand, Operation, Request, Response};
pub use server::{PartitionCall, PartitionHandle, PartitionServer, ServerContext};
pub use state_machine::{ApplyOutcome, ApplyResponse, PartitionStateMachine};
