//! 节点 ID -> 投递主题分区
//!
//! 投递方与目标节点的分发器使用同一个环，因此双方对分区的计算结果一致。

use std::collections::HashMap;

use super::{KetamaBalancer, NodeSelector};
use crate::error::{Result, RouteError};

pub struct PartitionSelector {
    ring: KetamaBalancer,
    partitions: u32,
}

impl PartitionSelector {
    pub fn new(partitions: u32) -> Result<Self> {
        if partitions == 0 {
            return Err(RouteError::BalancerEmptyNodes);
        }
        let labels: HashMap<String, u32> = (0..partitions).map(|p| (p.to_string(), 1)).collect();
        Ok(Self {
            ring: KetamaBalancer::new(labels)?,
            partitions,
        })
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    /// 节点所属分区
    pub fn partition_for(&self, node_id: &str) -> Result<i32> {
        let label = self.ring.select_node(node_id)?;
        label
            .parse::<i32>()
            .map_err(|_| RouteError::BalancerNodeNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_in_range_and_stable() {
        let selector = PartitionSelector::new(16).unwrap();
        for i in 0..200 {
            let node = format!("gw-{i}");
            let p = selector.partition_for(&node).unwrap();
            assert!((0..16).contains(&p));
            assert_eq!(selector.partition_for(&node).unwrap(), p);
        }
    }

    #[test]
    fn test_single_partition() {
        let selector = PartitionSelector::new(1).unwrap();
        assert_eq!(selector.partition_for("gw-1").unwrap(), 0);
    }

    #[test]
    fn test_zero_partitions_rejected() {
        assert!(PartitionSelector::new(0).is_err());
    }
}
