//! Recursive spatial decomposition of the domain.
//!
//! The tree is kept as an arena of nodes indexed by small integers. Each
//! node is either a leaf, owned by exactly one process, or an internal node
//! holding the indices of its `2^D` children. Internal nodes take the owner
//! of their first child, which makes the first leaf in tree order the
//! representative of every subtree.

mod action;
mod group;

pub use action::BalanceAction;
pub use group::GroupHandle;

use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use fnv::FnvHasher;

use crate::error::{Error, Result};
use crate::geom::{toroidal_shifts, Region};
use crate::{Coord, NodeId, Pid};

/// How the initial tree is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitScheme {
    /// Split every leaf at its center, `levels` times.
    Uniform { levels: usize },
    /// Split the leaf containing each point at that point, in order.
    Points(Vec<Vec<Coord>>),
}

impl Default for SplitScheme {
    fn default() -> Self {
        SplitScheme::Uniform { levels: 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Leaf,
    Internal(Vec<NodeId>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub depth: usize,
    pub region: Region,
    /// Owning process, first-child convention for internal nodes
    pub owner: Pid,
    pub kind: NodeKind,
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        match self.kind {
            NodeKind::Leaf => true,
            _ => false,
        }
    }

    pub fn children(&self) -> &[NodeId] {
        match &self.kind {
            NodeKind::Leaf => &[],
            NodeKind::Internal(c) => c,
        }
    }
}

/// Partitioning of the global domain into leaf regions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionTree {
    domain: Region,
    nodes: Vec<Node>,
    /// Leaf node ids in tree order, indexed by owning process
    leaves: Vec<NodeId>,
}

impl PartitionTree {
    /// Creates a single-leaf tree covering the whole domain.
    pub fn new(domain: Region) -> Result<Self> {
        if domain.is_empty() {
            return Err(Error::InfeasibleBuild(format!("empty domain {}", domain)));
        }
        let root = Node {
            id: 0,
            parent: None,
            depth: 0,
            region: domain.clone(),
            owner: 0,
            kind: NodeKind::Leaf,
        };
        Ok(PartitionTree {
            domain,
            nodes: vec![root],
            leaves: vec![0],
        })
    }

    /// Builds a tree using the given scheme for exactly `procs` processes.
    pub fn build(domain: Region, scheme: &SplitScheme, procs: usize) -> Result<Self> {
        match scheme {
            SplitScheme::Uniform { levels } => Self::uniform(domain, *levels, procs),
            SplitScheme::Points(points) => Self::from_split_points(domain, points, procs),
        }
    }

    /// Splits every leaf at its center `levels` times. The process count must
    /// be `(2^D)^levels`.
    pub fn uniform(domain: Region, levels: usize, procs: usize) -> Result<Self> {
        let fanout = 1usize << domain.dims();
        let expected = fanout
            .checked_pow(levels as u32)
            .ok_or_else(|| Error::InfeasibleBuild(format!("{} levels is too deep", levels)))?;
        if procs != expected {
            return Err(Error::InfeasibleBuild(format!(
                "uniform splitting with {} levels in {} dimensions needs {} processes, got {}",
                levels,
                domain.dims(),
                expected,
                procs
            )));
        }
        let mut tree = Self::new(domain)?;
        for _ in 0..levels {
            let leaves: Vec<NodeId> = tree.leaf_nodes_in_order();
            for leaf in leaves {
                let center = tree.nodes[leaf].region.center();
                tree.split(leaf, &center)?;
            }
        }
        tree.map_leaves_to_processes();
        Ok(tree)
    }

    /// Splits the leaf containing each point at that point. The process count
    /// must match the resulting number of leaves, `1 + k(2^D - 1)`.
    pub fn from_split_points(domain: Region, points: &[Vec<Coord>], procs: usize) -> Result<Self> {
        let fanout = 1usize << domain.dims();
        let expected = 1 + points.len() * (fanout - 1);
        if procs != expected {
            return Err(Error::InfeasibleBuild(format!(
                "{} split points in {} dimensions produce {} leaves, got {} processes",
                points.len(),
                domain.dims(),
                expected,
                procs
            )));
        }
        let mut tree = Self::new(domain)?;
        for point in points {
            let leaf = tree.leaf_node_at(point)?;
            tree.split(leaf, point)?;
        }
        tree.map_leaves_to_processes();
        Ok(tree)
    }

    /// Turns a leaf into an internal node with `2^D` children meeting at `at`.
    fn split(&mut self, leaf: NodeId, at: &[Coord]) -> Result<()> {
        let region = self.nodes[leaf].region.clone();
        let dims = region.dims();
        if at.len() != dims || (0..dims).any(|d| at[d] <= region.min[d] || at[d] >= region.max[d])
        {
            return Err(Error::InfeasibleBuild(format!(
                "split point {:?} is not strictly inside {}",
                at, region
            )));
        }
        let depth = self.nodes[leaf].depth + 1;
        let mut children = Vec::with_capacity(1 << dims);
        for c in 0..(1usize << dims) {
            let mut min = region.min.clone();
            let mut max = region.max.clone();
            for d in 0..dims {
                if (c >> (dims - d - 1)) & 1 == 1 {
                    min[d] = at[d];
                } else {
                    max[d] = at[d];
                }
            }
            let id = self.nodes.len();
            self.nodes.push(Node {
                id,
                parent: Some(leaf),
                depth,
                region: Region { min, max },
                owner: 0,
                kind: NodeKind::Leaf,
            });
            children.push(id);
        }
        self.nodes[leaf].kind = NodeKind::Internal(children);
        Ok(())
    }

    /// Assigns leaf `i` (in tree order) to process `i` and propagates
    /// ownership upwards using the first child.
    pub fn map_leaves_to_processes(&mut self) {
        self.leaves = self.leaf_nodes_in_order();
        for (pid, leaf) in self.leaves.clone().into_iter().enumerate() {
            self.nodes[leaf].owner = pid;
        }
        for id in self.post_order() {
            if let NodeKind::Internal(children) = &self.nodes[id].kind {
                let first = children[0];
                self.nodes[id].owner = self.nodes[first].owner;
            }
        }
    }

    fn leaf_nodes_in_order(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![0];
        while let Some(id) = stack.pop() {
            match &self.nodes[id].kind {
                NodeKind::Leaf => out.push(id),
                NodeKind::Internal(children) => stack.extend(children.iter().rev()),
            }
        }
        out
    }

    /// Node ids with every child listed before its parent.
    fn post_order(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![(0, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded || self.nodes[id].is_leaf() {
                out.push(id);
            } else {
                stack.push((id, true));
                for c in self.nodes[id].children().iter().rev() {
                    stack.push((*c, false));
                }
            }
        }
        out
    }

    pub fn domain(&self) -> &Region {
        &self.domain
    }

    pub fn dims(&self) -> usize {
        self.domain.dims()
    }

    pub fn root(&self) -> &Node {
        &self.nodes[0]
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Number of leaves, which is also the number of processes.
    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    pub fn leaf_node(&self, pid: Pid) -> Result<&Node> {
        self.leaves
            .get(pid)
            .map(|id| &self.nodes[*id])
            .ok_or(Error::NoSuchProcess(pid))
    }

    pub fn leaf_region(&self, pid: Pid) -> Result<&Region> {
        Ok(&self.leaf_node(pid)?.region)
    }

    /// Depth of the deepest leaf.
    pub fn depth(&self) -> usize {
        self.leaves
            .iter()
            .map(|id| self.nodes[*id].depth)
            .max()
            .unwrap_or(0)
    }

    fn leaf_node_at(&self, point: &[Coord]) -> Result<NodeId> {
        if !self.domain.contains(point) {
            return Err(Error::OutOfBounds(format!(
                "{:?} is outside of {}",
                point, self.domain
            )));
        }
        let mut id = 0;
        while let NodeKind::Internal(children) = &self.nodes[id].kind {
            id = *children
                .iter()
                .find(|c| self.nodes[**c].region.contains(point))
                .ok_or_else(|| {
                    Error::TopologyMismatch(format!("no child of node {} holds {:?}", id, point))
                })?;
        }
        Ok(id)
    }

    /// Process owning the cell at `point`.
    pub fn owner_at(&self, point: &[Coord]) -> Result<Pid> {
        Ok(self.nodes[self.leaf_node_at(point)?].owner)
    }

    /// Process owning the continuous location.
    pub fn owner_at_location(&self, location: &[f64]) -> Result<Pid> {
        let cell: Vec<Coord> = location.iter().map(|v| v.floor() as Coord).collect();
        self.owner_at(&cell)
    }

    /// Processes owning the leaves under the given node, in tree order.
    pub fn leaves_under(&self, node: NodeId) -> Vec<Pid> {
        let mut out = Vec::new();
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            match &self.nodes[id].kind {
                NodeKind::Leaf => out.push(self.nodes[id].owner),
                NodeKind::Internal(children) => stack.extend(children.iter().rev()),
            }
        }
        out
    }

    /// Strict ancestors of the node, from its parent up to the root.
    pub fn ancestors(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut curr = self.nodes[node].parent;
        while let Some(id) = curr {
            out.push(id);
            curr = self.nodes[id].parent;
        }
        out
    }

    /// Depth of the lowest common ancestor of the given processes' leaves.
    pub fn lca_depth(&self, pids: &[Pid]) -> Result<usize> {
        let mut common: Option<Vec<NodeId>> = None;
        for pid in pids {
            let leaf = self.leaf_node(*pid)?.id;
            let mut path = self.ancestors(leaf);
            path.reverse();
            path.push(leaf);
            common = Some(match common {
                None => path,
                Some(c) => c
                    .into_iter()
                    .zip(path)
                    .take_while(|(a, b)| a == b)
                    .map(|(a, _)| a)
                    .collect(),
            });
        }
        Ok(common
            .and_then(|c| c.last().map(|id| self.nodes[*id].depth))
            .unwrap_or(0))
    }

    /// Neighbor set of a leaf: every other leaf intersecting its region
    /// expanded by `aoi`, including wrap-around neighbors when `toroidal`.
    /// Sorted by process id.
    pub fn neighbors(&self, pid: Pid, aoi: Coord, toroidal: bool) -> Result<Vec<Pid>> {
        let halo = self.leaf_region(pid)?.expand(aoi);
        let shifts = if toroidal {
            toroidal_shifts(&self.domain.extents())
        } else {
            vec![vec![0; self.dims()]]
        };
        let mut found = BTreeSet::new();
        for shift in shifts {
            let back: Vec<Coord> = shift.iter().map(|s| -s).collect();
            let probe = halo.shift(&back);
            let mut stack = vec![0];
            while let Some(id) = stack.pop() {
                let node = &self.nodes[id];
                if !node.region.intersects(&probe) {
                    continue;
                }
                match &node.kind {
                    NodeKind::Leaf => {
                        if node.owner != pid {
                            found.insert(node.owner);
                        }
                    }
                    NodeKind::Internal(children) => stack.extend(children.iter()),
                }
            }
        }
        Ok(found.into_iter().collect())
    }

    /// Neighbor sets of every leaf, indexed by process id.
    pub fn all_neighbors(&self, aoi: Coord, toroidal: bool) -> Result<Vec<Vec<Pid>>> {
        (0..self.leaf_count())
            .map(|pid| self.neighbors(pid, aoi, toroidal))
            .collect()
    }

    /// Stable digest of the tree geometry and ownership.
    pub fn digest(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        self.domain.hash(&mut hasher);
        self.nodes.hash(&mut hasher);
        self.leaves.hash(&mut hasher);
        hasher.finish()
    }

    /// Recomputes internal node regions as the bounds of their children.
    fn refresh_internal_regions(&mut self) {
        for id in self.post_order() {
            if let NodeKind::Internal(children) = self.nodes[id].kind.clone() {
                let mut bounds = self.nodes[children[0]].region.clone();
                for c in &children[1..] {
                    bounds = bounds.union_bounds(&self.nodes[*c].region);
                }
                self.nodes[id].region = bounds;
            }
        }
    }

    /// Verifies that the leaves tile the domain exactly and that every
    /// internal node is tiled by its children.
    pub fn check_invariants(&self) -> Result<()> {
        if self.root().region != self.domain {
            return Err(Error::InvalidPartition(format!(
                "root covers {}, domain is {}",
                self.root().region,
                self.domain
            )));
        }
        for node in &self.nodes {
            let children = node.children();
            if children.is_empty() {
                if node.region.is_empty() {
                    return Err(Error::InvalidPartition(format!(
                        "leaf {} is empty: {}",
                        node.owner, node.region
                    )));
                }
                continue;
            }
            let mut volume = 0u64;
            for (i, a) in children.iter().enumerate() {
                let ra = &self.nodes[*a].region;
                if !node.region.contains_region(ra) {
                    return Err(Error::InvalidPartition(format!(
                        "node {} leaves its parent {}",
                        a, node.id
                    )));
                }
                volume += ra.volume();
                for b in &children[i + 1..] {
                    if ra.intersects(&self.nodes[*b].region) {
                        return Err(Error::InvalidPartition(format!(
                            "nodes {} and {} overlap",
                            a, b
                        )));
                    }
                }
            }
            if volume != node.region.volume() {
                return Err(Error::InvalidPartition(format!(
                    "children of node {} don't tile {}",
                    node.id, node.region
                )));
            }
        }
        let total: u64 = self
            .leaves
            .iter()
            .map(|id| self.nodes[*id].region.volume())
            .sum();
        if total != self.domain.volume() {
            return Err(Error::InvalidPartition(format!(
                "leaves cover {} cells of {}",
                total,
                self.domain.volume()
            )));
        }
        Ok(())
    }

    fn fmt_node(&self, f: &mut fmt::Formatter<'_>, id: NodeId, prefix: &str, tail: bool) -> fmt::Result {
        let node = &self.nodes[id];
        writeln!(
            f,
            "{}{}node {} pid {} L{} {}",
            prefix,
            if tail { "└── " } else { "├── " },
            node.id,
            node.owner,
            node.depth,
            node.region
        )?;
        let children = node.children();
        let next = format!("{}{}", prefix, if tail { "    " } else { "│   " });
        for (i, c) in children.iter().enumerate() {
            self.fmt_node(f, *c, &next, i + 1 == children.len())?;
        }
        Ok(())
    }
}

impl fmt::Display for PartitionTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "partition tree")?;
        self.fmt_node(f, 0, "", true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(side: Coord) -> Region {
        Region::with_extent(&[side, side]).unwrap()
    }

    #[test]
    fn uniform_build_tiles_domain() {
        let tree = PartitionTree::uniform(square(100), 2, 16).unwrap();
        assert_eq!(tree.leaf_count(), 16);
        assert_eq!(tree.depth(), 2);
        tree.check_invariants().unwrap();
        assert_eq!(tree.leaf_region(0).unwrap(), &Region::with_extent(&[25, 25]).unwrap());
    }

    #[test]
    fn uniform_build_rejects_wrong_process_count() {
        match PartitionTree::uniform(square(100), 1, 3) {
            Err(Error::InfeasibleBuild(_)) => (),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn split_points_build() {
        let points = vec![vec![50, 50], vec![25, 25], vec![75, 75]];
        let tree = PartitionTree::from_split_points(square(100), &points, 10).unwrap();
        tree.check_invariants().unwrap();
        assert_eq!(tree.depth(), 2);
        assert!(PartitionTree::from_split_points(square(100), &points, 7).is_err());
        let bad = vec![vec![0, 50]];
        assert!(PartitionTree::from_split_points(square(100), &bad, 4).is_err());
    }

    #[test]
    fn internal_nodes_take_first_child_owner() {
        let points = vec![vec![50, 50], vec![75, 25]];
        let tree = PartitionTree::from_split_points(square(100), &points, 7).unwrap();
        for node in tree.nodes() {
            if let NodeKind::Internal(children) = &node.kind {
                assert_eq!(node.owner, tree.node(children[0]).unwrap().owner);
            }
        }
        assert_eq!(tree.root().owner, 0);
    }

    #[test]
    fn point_lookup() {
        let tree = PartitionTree::uniform(square(100), 1, 4).unwrap();
        for pid in 0..4 {
            let center = tree.leaf_region(pid).unwrap().center();
            assert_eq!(tree.owner_at(&center).unwrap(), pid);
        }
        assert!(tree.owner_at(&[100, 0]).is_err());
        assert_eq!(tree.owner_at_location(&[49.9, 50.0]).unwrap(), 1);
    }

    #[test]
    fn neighbors_include_diagonals() {
        let tree = PartitionTree::uniform(square(90), 1, 4).unwrap();
        for pid in 0..4 {
            let n = tree.neighbors(pid, 1, false).unwrap();
            assert_eq!(n.len(), 3);
            assert!(!n.contains(&pid));
        }
    }

    #[test]
    fn toroidal_neighbors_wrap() {
        let tree = PartitionTree::uniform(square(100), 2, 16).unwrap();
        let corner = tree.owner_at(&[0, 0]).unwrap();
        let far = tree.owner_at(&[99, 99]).unwrap();
        assert!(!tree.neighbors(corner, 1, false).unwrap().contains(&far));
        assert!(tree.neighbors(corner, 1, true).unwrap().contains(&far));
        assert_eq!(tree.neighbors(corner, 1, true).unwrap().len(), 8);
    }

    #[test]
    fn neighbor_relation_is_symmetric() {
        let points = vec![vec![50, 50], vec![25, 25], vec![75, 75], vec![60, 90]];
        let tree = PartitionTree::from_split_points(square(100), &points, 13).unwrap();
        for toroidal in &[false, true] {
            let all = tree.all_neighbors(3, *toroidal).unwrap();
            for (p, ns) in all.iter().enumerate() {
                for n in ns {
                    assert!(all[*n].contains(&p), "{} -> {} not mirrored", p, n);
                }
            }
        }
    }

    #[test]
    fn lca_depth_of_leaves() {
        let tree = PartitionTree::uniform(square(100), 2, 16).unwrap();
        assert_eq!(tree.lca_depth(&[0, 1]).unwrap(), 1);
        assert_eq!(tree.lca_depth(&[0, 15]).unwrap(), 0);
        assert_eq!(tree.lca_depth(&[5]).unwrap(), 2);
    }
}
