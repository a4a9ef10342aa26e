// Cluster node
// Hosts one partition server per partition the node replicates

use std::collections::BTreeMap;

use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use trellis_common::{NodeId, PartitionId, Result};

use super::config::StorageMode;
use super::transport::LocalTransport;
use crate::dispatch::{PartitionHandle, PartitionServer, ServerContext};
use crate::raft::{FileLogStore, LogStore, Membership, MemoryLogStore, RaftConfig};

/// Open the log of `node`'s replica of `partition`
pub fn open_log(
    storage: StorageMode,
    raft: &RaftConfig,
    sync_writes: bool,
    node: NodeId,
    partition: PartitionId,
) -> Result<Box<dyn LogStore>> {
    Ok(match storage {
        StorageMode::Memory => Box::new(MemoryLogStore::new()),
        StorageMode::File => Box::new(FileLogStore::open(
            raft.partition_dir(node, partition),
            sync_writes,
        )?),
    })
}

/// One replica process
pub struct Node {
    id: NodeId,
    handles: BTreeMap<PartitionId, PartitionHandle>,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Start a server for each `(partition, membership, log)`
    pub fn start(
        id: NodeId,
        partitions: Vec<(PartitionId, Membership, Box<dyn LogStore>)>,
        ctx: &ServerContext,
        transport: &LocalTransport,
    ) -> Result<Self> {
        let (shutdown, _) = broadcast::channel(1);
        let mut handles = BTreeMap::new();
        let mut tasks = Vec::new();
        for (partition, membership, log) in partitions {
            let inbox = transport.register(id, partition);
            let (server, handle) =
                PartitionServer::new(id, partition, membership, log, ctx, inbox)?;
            tasks.push(tokio::spawn(server.run(shutdown.subscribe())));
            handles.insert(partition, handle);
        }
        info!("Node {} started with {} partitions", id, handles.len());
        Ok(Self {
            id,
            handles,
            shutdown,
            tasks,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn handle(&self, partition: PartitionId) -> Option<&PartitionHandle> {
        self.handles.get(&partition)
    }

    pub fn handles(&self) -> impl Iterator<Item = &PartitionHandle> {
        self.handles.values()
    }

    /// Stop every partition server and wait for them to exit
    pub async fn stop(self, transport: &LocalTransport) {
        let _ = self.shutdown.send(());
        for partition in self.handles.keys() {
            transport.unregister(self.id, *partition);
        }
        join_all(self.tasks).await;
        info!("Node {} stopped", self.id);
    }
}
