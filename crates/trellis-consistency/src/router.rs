//! Partition routing
//!
//! Maps primitive names onto partitions of a partition group and remembers
//! which replica currently leads each partition.

use std::collections::BTreeMap;

use dashmap::DashMap;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use tracing::debug;

use trellis_common::{NodeId, PartitionId, Result, TrellisError};

/// Named set of partitions primitives are spread across
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionGroup {
    pub name: String,
    pub partitions: Vec<PartitionId>,
}

impl PartitionGroup {
    pub fn new(name: impl Into<String>, partitions: Vec<PartitionId>) -> Self {
        Self {
            name: name.into(),
            partitions,
        }
    }
}

/// Where to send operations on a primitive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub group: String,
    pub partition: PartitionId,
    pub leader_hint: Option<NodeId>,
}

/// Stable slot of `name` among `count` partitions
///
/// Uses the first 8 bytes of the MD5 digest so that every client and every
/// process version agrees on the placement.
pub fn hash_slot(name: &str, count: usize) -> usize {
    if count == 0 {
        return 0;
    }
    let digest = Md5::digest(name.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % count as u64) as usize
}

/// Name to partition resolution plus leader hints
#[derive(Debug)]
pub struct Router {
    groups: BTreeMap<String, PartitionGroup>,
    default_group: String,
    leaders: DashMap<PartitionId, NodeId>,
    replicas: DashMap<PartitionId, Vec<NodeId>>,
}

impl Router {
    /// Build a router; the first group is the default one
    pub fn new(groups: Vec<PartitionGroup>) -> Result<Self> {
        let default_group = groups
            .first()
            .map(|g| g.name.clone())
            .ok_or_else(|| TrellisError::illegal_argument("at least one partition group is required"))?;
        let mut by_name = BTreeMap::new();
        for group in groups {
            if group.partitions.is_empty() {
                return Err(TrellisError::illegal_argument(format!(
                    "partition group '{}' has no partitions",
                    group.name
                )));
            }
            by_name.insert(group.name.clone(), group);
        }
        Ok(Self {
            groups: by_name,
            default_group,
            leaders: DashMap::new(),
            replicas: DashMap::new(),
        })
    }

    pub fn default_group(&self) -> &str {
        &self.default_group
    }

    pub fn groups(&self) -> impl Iterator<Item = &PartitionGroup> {
        self.groups.values()
    }

    /// Every partition of every group
    pub fn partitions(&self) -> Vec<PartitionId> {
        let mut partitions: Vec<PartitionId> = self
            .groups
            .values()
            .flat_map(|g| g.partitions.iter().copied())
            .collect();
        partitions.sort_unstable();
        partitions.dedup();
        partitions
    }

    pub fn group(&self, name: &str) -> Result<&PartitionGroup> {
        self.groups
            .get(name)
            .ok_or_else(|| TrellisError::illegal_argument(format!("unknown partition group '{}'", name)))
    }

    /// Route a primitive of the default group
    pub fn resolve(&self, primitive: &str) -> Result<Route> {
        self.resolve_in(&self.default_group, primitive)
    }

    /// Route a primitive by hashing its name across the group's partitions
    pub fn resolve_in(&self, group: &str, primitive: &str) -> Result<Route> {
        let group = self.group(group)?;
        let partition = group.partitions[hash_slot(primitive, group.partitions.len())];
        Ok(self.route(group, partition))
    }

    /// Route to an explicitly chosen partition
    pub fn route_to(&self, partition: PartitionId) -> Result<Route> {
        let group = self
            .groups
            .values()
            .find(|g| g.partitions.contains(&partition))
            .ok_or(TrellisError::UnknownPartition { partition })?;
        Ok(self.route(group, partition))
    }

    fn route(&self, group: &PartitionGroup, partition: PartitionId) -> Route {
        Route {
            group: group.name.clone(),
            partition,
            leader_hint: self.leader(partition),
        }
    }

    pub fn leader(&self, partition: PartitionId) -> Option<NodeId> {
        self.leaders.get(&partition).map(|l| *l)
    }

    pub fn update_leader(&self, partition: PartitionId, leader: Option<NodeId>) {
        match leader {
            Some(leader) => {
                if self.leaders.insert(partition, leader) != Some(leader) {
                    debug!("Partition {} leader is now {}", partition, leader);
                }
            }
            None => {
                self.leaders.remove(&partition);
            }
        }
    }

    /// Refresh the leader hint from a failed request
    pub fn observe_error(&self, partition: PartitionId, error: &TrellisError) {
        if let TrellisError::NotLeader { leader_hint } = error {
            self.update_leader(partition, *leader_hint);
        }
    }

    pub fn set_replicas(&self, partition: PartitionId, replicas: Vec<NodeId>) {
        self.replicas.insert(partition, replicas);
    }

    pub fn replicas(&self, partition: PartitionId) -> Vec<NodeId> {
        self.replicas
            .get(&partition)
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> Router {
        Router::new(vec![
            PartitionGroup::new("raft", vec![1, 2, 3]),
            PartitionGroup::new("data", vec![4, 5]),
        ])
        .unwrap()
    }

    #[test]
    fn test_resolution_is_stable() {
        let router = router();
        let first = router.resolve("orders").unwrap();
        let second = router.resolve("orders").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.group, "raft");
        assert!([1, 2, 3].contains(&first.partition));
    }

    #[test]
    fn test_group_resolution_and_override() {
        let router = router();
        let route = router.resolve_in("data", "orders").unwrap();
        assert!([4, 5].contains(&route.partition));

        let explicit = router.route_to(5).unwrap();
        assert_eq!(explicit.group, "data");
        assert!(matches!(
            router.route_to(42),
            Err(TrellisError::UnknownPartition { partition: 42 })
        ));
        assert!(router.resolve_in("missing", "orders").is_err());
    }

    #[test]
    fn test_leader_hints() {
        let router = router();
        router.update_leader(1, Some(3));
        assert_eq!(router.route_to(1).unwrap().leader_hint, Some(3));

        router.observe_error(1, &TrellisError::NotLeader { leader_hint: Some(2) });
        assert_eq!(router.leader(1), Some(2));

        router.observe_error(1, &TrellisError::NotLeader { leader_hint: None });
        assert_eq!(router.leader(1), None);
    }

    #[test]
    fn test_invalid_groups() {
        assert!(Router::new(vec![]).is_err());
        assert!(Router::new(vec![PartitionGroup::new("empty", vec![])]).is_err());
    }

    mod prop {
        use super::super::hash_slot;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn slot_is_in_range_and_deterministic(name in ".{0,32}", count in 1usize..64) {
                let slot = hash_slot(&name, count);
                prop_assert!(slot < count);
                prop_assert_eq!(slot, hash_slot(&name, count));
            }
        }
    }
}
