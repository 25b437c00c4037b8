//! Process-local view of the partitioning and the commit protocol.

use std::collections::BTreeSet;

use crate::comm::{all_gather_value, ensure_agreement, Communicator};
use crate::error::{Error, Result};
use crate::geom::Region;
use crate::tree::{BalanceAction, GroupHandle, PartitionTree};
use crate::{Coord, NodeId, Pid};

/// Observer notified around every applied commit.
///
/// Hooks are passed to [`Partition::commit`] as an ordered slice and are
/// invoked in that order on every process. `before_commit` sees the old
/// layout, `after_commit` the new one. `level` is the depth of the
/// shallowest group affected by the commit.
///
/// [`Partition::commit`]: struct.Partition.html#method.commit
pub trait CommitHook {
    fn before_commit(
        &mut self,
        level: usize,
        partition: &Partition,
        comm: &mut dyn Communicator,
    ) -> Result<()>;
    fn after_commit(
        &mut self,
        level: usize,
        partition: &Partition,
        comm: &mut dyn Communicator,
    ) -> Result<()>;
}

/// Result of a single commit round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Every proposed action was idle.
    Idle,
    /// Actions were applied and hooks ran at the given level.
    Applied { actions: usize, level: usize },
    /// Validation failed, the tree is unchanged.
    Aborted { reason: String },
}

impl CommitOutcome {
    pub fn applied(&self) -> usize {
        match self {
            CommitOutcome::Applied { actions, .. } => *actions,
            _ => 0,
        }
    }
}

/// Partitioning as seen by one participating process.
///
/// Holds the full tree, which is replicated on every process, along with
/// the neighbor set and group handles derived from it for the local leaf.
#[derive(Debug, Clone)]
pub struct Partition {
    tree: PartitionTree,
    pid: Pid,
    /// Arena id of the local leaf, stable across commits
    leaf: NodeId,
    aoi: Coord,
    toroidal: bool,
    min_extent: Coord,
    neighbors: Vec<Pid>,
    groups: Vec<GroupHandle>,
    /// Number of commits applied so far
    epoch: u64,
}

impl Partition {
    /// Collective. Every process must pass an identical tree.
    pub fn new(
        tree: PartitionTree,
        aoi: Coord,
        toroidal: bool,
        comm: &mut dyn Communicator,
    ) -> Result<Self> {
        if tree.leaf_count() != comm.size() {
            return Err(Error::TopologyMismatch(format!(
                "tree has {} leaves for {} processes",
                tree.leaf_count(),
                comm.size()
            )));
        }
        if aoi < 0 {
            return Err(Error::InvalidRegion(format!("negative aoi {}", aoi)));
        }
        tree.check_invariants()?;
        let leaf = tree.leaf_node(comm.rank())?.id;
        let mut partition = Partition {
            tree,
            pid: comm.rank(),
            leaf,
            aoi,
            toroidal,
            min_extent: 1,
            neighbors: Vec::new(),
            groups: Vec::new(),
            epoch: 0,
        };
        partition.rebuild(comm)?;
        debug!(
            "process {} owns {} with neighbors {:?}",
            partition.pid,
            partition.local_region(),
            partition.neighbors
        );
        Ok(partition)
    }

    /// Sets the smallest width a leaf may be shrunk to by a commit.
    pub fn set_min_extent(&mut self, min_extent: Coord) {
        self.min_extent = min_extent.max(1);
    }

    pub fn tree(&self) -> &PartitionTree {
        &self.tree
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn aoi(&self) -> Coord {
        self.aoi
    }

    pub fn toroidal(&self) -> bool {
        self.toroidal
    }

    pub fn min_extent(&self) -> Coord {
        self.min_extent
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn domain(&self) -> &Region {
        self.tree.domain()
    }

    /// Region owned by this process.
    pub fn local_region(&self) -> &Region {
        &self.tree.nodes()[self.leaf].region
    }

    /// Owned region padded with the area of interest.
    pub fn halo_region(&self) -> Region {
        self.local_region().expand(self.aoi)
    }

    /// Sorted ids of the neighboring processes.
    pub fn neighbors(&self) -> &[Pid] {
        &self.neighbors
    }

    /// Groups this process belongs to, from the root down.
    pub fn groups(&self) -> &[GroupHandle] {
        &self.groups
    }

    /// Group at the given tree depth, if the local leaf is deeper.
    pub fn group_at(&self, depth: usize) -> Option<&GroupHandle> {
        self.groups.iter().find(|g| g.depth == depth)
    }

    pub fn owner_at(&self, point: &[Coord]) -> Result<Pid> {
        self.tree.owner_at(point)
    }

    pub fn owner_at_location(&self, location: &[f64]) -> Result<Pid> {
        self.tree.owner_at_location(location)
    }

    /// Re-derives neighbors and groups from the current tree and verifies
    /// that every process agrees on the result.
    fn rebuild(&mut self, comm: &mut dyn Communicator) -> Result<()> {
        self.neighbors = self.tree.neighbors(self.pid, self.aoi, self.toroidal)?;
        self.groups = self.tree.groups_for(self.pid)?;
        for members in self.barrier_order() {
            comm.barrier_among(&members)?;
        }
        self.verify_topology(comm)
    }

    /// Members of every group of this process, deepest level first.
    fn barrier_order(&self) -> Vec<Vec<Pid>> {
        let mut groups: Vec<&GroupHandle> = self.groups.iter().collect();
        groups.sort_by(|a, b| b.depth.cmp(&a.depth));
        groups.into_iter().map(|g| g.members.clone()).collect()
    }

    fn verify_topology(&self, comm: &mut dyn Communicator) -> Result<()> {
        ensure_agreement(comm, &self.tree.digest(), "partition tree digest")?;
        let all = all_gather_value(comm, &self.neighbors)?;
        let pointing_at_me: BTreeSet<Pid> = all
            .iter()
            .enumerate()
            .filter(|(_, ns)| ns.contains(&self.pid))
            .map(|(p, _)| p)
            .collect();
        let mine: BTreeSet<Pid> = self.neighbors.iter().cloned().collect();
        if mine != pointing_at_me {
            return Err(Error::TopologyMismatch(format!(
                "process {} lists neighbors {:?} but is listed by {:?}",
                self.pid, mine, pointing_at_me
            )));
        }
        Ok(())
    }

    /// Collective. Applies the gathered actions atomically.
    ///
    /// Every process must pass the same action list. Either all non-idle
    /// actions are applied or none is; an invalid combination aborts the
    /// round without touching the tree.
    pub fn commit(
        &mut self,
        actions: &[BalanceAction],
        hooks: &mut [&mut dyn CommitHook],
        comm: &mut dyn Communicator,
    ) -> Result<CommitOutcome> {
        let applied: Vec<&BalanceAction> = actions.iter().filter(|a| !a.is_idle()).collect();
        if applied.is_empty() {
            return Ok(CommitOutcome::Idle);
        }
        let shadow = match self.tree.apply_actions(actions, self.min_extent) {
            Ok(shadow) => shadow,
            Err(e) if e.is_round_local() => {
                warn!("commit aborted on process {}: {}", self.pid, e);
                return Ok(CommitOutcome::Aborted {
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        };
        let mut level = usize::MAX;
        for action in &applied {
            level = level.min(self.tree.lca_depth(&action.participants())?);
        }

        for hook in hooks.iter_mut() {
            hook.before_commit(level, self, comm)?;
        }
        self.tree = shadow;
        self.epoch += 1;
        self.rebuild(comm)?;
        for hook in hooks.iter_mut() {
            hook.after_commit(level, self, comm)?;
        }
        debug!(
            "process {} committed {} actions at level {}, now owns {}",
            self.pid,
            applied.len(),
            level,
            self.local_region()
        );
        Ok(CommitOutcome::Applied {
            actions: applied.len(),
            level,
        })
    }
}
