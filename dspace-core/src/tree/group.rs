//! Hierarchical communication groups.

use crate::error::Result;
use crate::geom::Region;
use crate::{NodeId, Pid};

use super::PartitionTree;

/// Group of processes owning the leaves under one internal node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupHandle {
    /// Depth of the internal node
    pub depth: usize,
    pub node: NodeId,
    /// Region of the internal node
    pub region: Region,
    /// Owners of the node's leaves in tree order
    pub members: Vec<Pid>,
}

impl GroupHandle {
    /// The first member coordinates the group.
    pub fn master(&self) -> Pid {
        self.members[0]
    }

    pub fn is_master(&self, pid: Pid) -> bool {
        self.master() == pid
    }

    /// Position of the process within the member list.
    pub fn index_of(&self, pid: Pid) -> Option<usize> {
        self.members.iter().position(|m| *m == pid)
    }
}

impl PartitionTree {
    /// Groups the process belongs to, one for every strict ancestor of its
    /// leaf, ordered from the root down.
    pub fn groups_for(&self, pid: Pid) -> Result<Vec<GroupHandle>> {
        let leaf = self.leaf_node(pid)?.id;
        let mut groups: Vec<GroupHandle> = self
            .ancestors(leaf)
            .into_iter()
            .map(|id| {
                let node = &self.nodes[id];
                GroupHandle {
                    depth: node.depth,
                    node: id,
                    region: node.region.clone(),
                    members: self.leaves_under(id),
                }
            })
            .collect();
        groups.reverse();
        Ok(groups)
    }
}
