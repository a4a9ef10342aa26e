// Partition requests and log commands
// What clients ask a partition replica for, and what the leader writes into
// the log on their behalf

use serde::{Deserialize, Serialize};

use trellis_common::{CompactionMode, Consistency, Index, NodeId, Result, SessionId};

use crate::raft::RaftStatus;
use crate::service::OperationResult;

/// Operation addressed to one named primitive instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Primitive instance name, e.g. "orders"
    pub primitive: String,
    /// Registered service type, e.g. "map"
    pub service_type: String,
    /// Service specific encoded operation
    pub payload: Vec<u8>,
}

impl Operation {
    pub fn new(
        primitive: impl Into<String>,
        service_type: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            primitive: primitive.into(),
            service_type: service_type.into(),
            payload,
        }
    }
}

/// Payload of a `Command` log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogCommand {
    OpenSession {
        client: String,
        timeout_ms: u64,
    },
    KeepAlive {
        session: SessionId,
        /// Highest sequence number whose result the client received
        command_ack: u64,
    },
    CloseSession {
        session: SessionId,
    },
    /// Proposed by the leader for a session that missed its deadline
    ExpireSession {
        session: SessionId,
    },
    Command {
        session: SessionId,
        seq: u64,
        ack: u64,
        operation: Operation,
    },
}

impl LogCommand {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LogCommand::OpenSession { .. } => "open_session",
            LogCommand::KeepAlive { .. } => "keep_alive",
            LogCommand::CloseSession { .. } => "close_session",
            LogCommand::ExpireSession { .. } => "expire_session",
            LogCommand::Command { .. } => "command",
        }
    }
}

/// Request served by a partition replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    OpenSession {
        client: String,
        timeout_ms: u64,
    },
    KeepAlive {
        session: SessionId,
        command_ack: u64,
    },
    CloseSession {
        session: SessionId,
    },
    /// Mutation; always goes through the leader's log
    Execute {
        session: SessionId,
        seq: u64,
        ack: u64,
        operation: Operation,
        /// Client side retention hint; the service may raise it
        compaction: CompactionMode,
    },
    /// Read evaluated against the local state machine
    Query {
        session: SessionId,
        operation: Operation,
        consistency: Consistency,
        /// Highest index the session has observed so far
        observed_index: Index,
    },
    AddReplica {
        node: NodeId,
    },
    RemoveReplica {
        node: NodeId,
    },
    Status,
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::OpenSession { .. } => "open_session",
            Request::KeepAlive { .. } => "keep_alive",
            Request::CloseSession { .. } => "close_session",
            Request::Execute { .. } => "execute",
            Request::Query { .. } => "query",
            Request::AddReplica { .. } => "add_replica",
            Request::RemoveReplica { .. } => "remove_replica",
            Request::Status => "status",
        }
    }
}

/// Successful answer to a `Request`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    SessionOpened { session: SessionId, index: Index },
    Ack { index: Index },
    /// Operation output together with the index it reflects
    Output { index: Index, result: OperationResult },
    Status(RaftStatus),
}
