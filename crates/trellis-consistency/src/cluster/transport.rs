// Peer transport
// Carries consensus messages between replicas of the same partition

use std::collections::HashSet;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::trace;

use trellis_common::{NodeId, PartitionId};

use crate::raft::Envelope;

/// Fire-and-forget delivery of consensus messages
///
/// Delivery may silently fail; the consensus core retries everything it
/// needs on its own timers.
pub trait Transport: Send + Sync {
    fn send(&self, envelope: Envelope);
}

/// In-process transport with fault injection
#[derive(Default)]
pub struct LocalTransport {
    mailboxes: DashMap<(NodeId, PartitionId), mpsc::UnboundedSender<Envelope>>,
    isolated: RwLock<HashSet<NodeId>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the inbox of `node`'s replica of `partition`
    pub fn register(
        &self,
        node: NodeId,
        partition: PartitionId,
    ) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.mailboxes.insert((node, partition), tx);
        rx
    }

    pub fn unregister(&self, node: NodeId, partition: PartitionId) {
        self.mailboxes.remove(&(node, partition));
    }

    /// Drop all traffic to and from `node`
    pub fn isolate(&self, node: NodeId) {
        self.isolated.write().insert(node);
    }

    pub fn heal(&self, node: NodeId) {
        self.isolated.write().remove(&node);
    }

    pub fn is_isolated(&self, node: NodeId) -> bool {
        self.isolated.read().contains(&node)
    }
}

impl Transport for LocalTransport {
    fn send(&self, envelope: Envelope) {
        {
            let isolated = self.isolated.read();
            if isolated.contains(&envelope.from) || isolated.contains(&envelope.to) {
                trace!(
                    "Dropping {} from {} to {}: node isolated",
                    envelope.message.msg_type(),
                    envelope.from,
                    envelope.to
                );
                return;
            }
        }
        if let Some(mailbox) = self.mailboxes.get(&(envelope.to, envelope.partition)) {
            let _ = mailbox.send(envelope);
        }
    }
}
