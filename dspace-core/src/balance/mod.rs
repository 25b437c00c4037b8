//! Load balancing by moving partition boundaries.
//!
//! A balancing round runs on every process at the same step:
//!
//! 1. loads averaged by each process's [`LoadMeter`] are all-gathered,
//! 2. processes holding the active color of the [`Schedule`] propose a
//!    single [`BalanceAction`], everyone else proposes the idle action,
//! 3. proposals are all-gathered and committed through
//!    [`Partition::commit`], which either applies all of them or none.
//!
//! [`LoadMeter`]: struct.LoadMeter.html
//! [`Schedule`]: struct.Schedule.html
//! [`BalanceAction`]: ../tree/struct.BalanceAction.html
//! [`Partition::commit`]: ../partition/struct.Partition.html#method.commit

mod load;
mod schedule;

use std::collections::BTreeSet;

pub use load::LoadMeter;
pub use schedule::Schedule;

use crate::comm::{all_gather_value, Communicator};
use crate::config::BalanceConfig;
use crate::error::Result;
use crate::geom::Region;
use crate::partition::{CommitHook, CommitOutcome, Partition};
use crate::tree::{BalanceAction, PartitionTree};
use crate::{Coord, Pid};

/// Drives balancing rounds for one process.
#[derive(Debug, Clone)]
pub struct Rebalancer {
    config: BalanceConfig,
    meter: LoadMeter,
    schedule: Schedule,
    /// Number of balancing rounds run so far
    slot: u64,
}

impl Rebalancer {
    pub fn new(config: BalanceConfig, partition: &Partition) -> Result<Self> {
        Ok(Rebalancer {
            meter: LoadMeter::new(config.window),
            config,
            schedule: schedule_for(partition)?,
            slot: 0,
        })
    }

    pub fn config(&self) -> &BalanceConfig {
        &self.config
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn slot(&self) -> u64 {
        self.slot
    }

    /// Records the workload of the last step, e.g. its duration.
    pub fn record_load(&mut self, load: f64) {
        self.meter.record(load);
    }

    pub fn load(&self) -> f64 {
        self.meter.average()
    }

    /// Whether a balancing round is due at the given step.
    pub fn should_balance(&self, step: u64) -> bool {
        self.config.enabled && step > 0 && step % self.config.interval.max(1) == 0
    }

    /// Collective. Exchanges the averaged loads of every process.
    pub fn gather_loads(&self, comm: &mut dyn Communicator) -> Result<Vec<f64>> {
        all_gather_value(comm, &self.load())
    }

    /// Proposal of the calling process for the current slot.
    pub fn propose(&self, partition: &Partition, loads: &[f64]) -> Result<BalanceAction> {
        if !self.schedule.is_active(partition.pid(), self.slot) {
            return Ok(BalanceAction::idle());
        }
        propose(
            partition.tree(),
            partition.pid(),
            loads,
            &self.config,
            self.schedule.count(),
        )
    }

    /// Collective. Runs one full balancing round.
    pub fn balance(
        &mut self,
        partition: &mut Partition,
        hooks: &mut [&mut dyn CommitHook],
        comm: &mut dyn Communicator,
    ) -> Result<CommitOutcome> {
        partition.set_min_extent(self.config.min_extent);
        let loads = self.gather_loads(comm)?;
        let action = self.propose(partition, &loads)?;
        if !action.is_idle() {
            debug!(
                "process {} proposes moving {} cells: {:?}",
                partition.pid(),
                action.offset,
                action
            );
        }
        let actions = dedup_actions(all_gather_value(comm, &action)?);
        let outcome = partition.commit(&actions, hooks, comm)?;
        if let CommitOutcome::Applied { .. } = outcome {
            self.schedule = schedule_for(partition)?;
            self.meter.clear();
        }
        self.slot += 1;
        Ok(outcome)
    }
}

/// Face of `pid` along `dim` on the `dir` side, with the aligned leaf sets
/// on both sides of it.
struct FaceSets {
    sources: Vec<Pid>,
    dests: Vec<Pid>,
}

fn spans_overlap(a: &[(Coord, Coord)], b: &[(Coord, Coord)]) -> bool {
    a.iter()
        .zip(b)
        .all(|((alo, ahi), (blo, bhi))| alo < bhi && blo < ahi)
}

fn bounding_span(tree: &PartitionTree, pids: &[Pid], dim: usize) -> Result<Vec<(Coord, Coord)>> {
    let mut bounds: Option<Region> = None;
    for pid in pids {
        let r = tree.leaf_region(*pid)?;
        bounds = Some(match bounds {
            Some(b) => b.union_bounds(r),
            None => r.clone(),
        });
    }
    Ok(bounds.map(|b| b.span_without(dim)).unwrap_or_default())
}

/// Grows the source and destination sets around the face until both cover
/// the same span. Returns `None` if the spans never line up.
fn aligned_sets(tree: &PartitionTree, pid: Pid, dim: usize, dir: i8) -> Result<Option<FaceSets>> {
    let own = tree.leaf_region(pid)?;
    let face = if dir > 0 { own.max[dim] } else { own.min[dim] };
    let domain = tree.domain();
    if face == domain.min[dim] || face == domain.max[dim] {
        return Ok(None);
    }
    // leaves touching the face from the given side, overlapping the span
    let touching = |span: &[(Coord, Coord)], near: bool| -> Result<Vec<Pid>> {
        let mut out = Vec::new();
        for other in 0..tree.leaf_count() {
            let r = tree.leaf_region(other)?;
            let at = if (dir > 0) == near { r.max[dim] } else { r.min[dim] };
            if at == face && spans_overlap(&r.span_without(dim), span) {
                out.push(other);
            }
        }
        Ok(out)
    };
    let mut sources = vec![pid];
    loop {
        let src_span = bounding_span(tree, &sources, dim)?;
        let dests = touching(&src_span, false)?;
        if dests.is_empty() {
            return Ok(None);
        }
        let dst_span = bounding_span(tree, &dests, dim)?;
        let next = touching(&dst_span, true)?;
        if next == sources {
            if src_span != dst_span {
                return Ok(None);
            }
            return Ok(Some(FaceSets { sources, dests }));
        }
        sources = next;
    }
}

/// Every leaf an action proposed by `pid` could touch, `pid` included.
fn reach(tree: &PartitionTree, pid: Pid) -> Result<BTreeSet<Pid>> {
    let mut out = BTreeSet::new();
    out.insert(pid);
    for dim in 0..tree.dims() {
        for dir in &[1i8, -1] {
            if let Some(sets) = aligned_sets(tree, pid, dim, *dir)? {
                out.extend(sets.sources);
                out.extend(sets.dests);
            }
        }
    }
    Ok(out)
}

/// Per process, the processes it may not act together with: its neighbors
/// and every process whose possible actions share a leaf with its own.
pub fn conflict_graph(tree: &PartitionTree, aoi: Coord, toroidal: bool) -> Result<Vec<Vec<Pid>>> {
    let neighbors = tree.all_neighbors(aoi, toroidal)?;
    let reaches = (0..tree.leaf_count())
        .map(|pid| reach(tree, pid))
        .collect::<Result<Vec<_>>>()?;
    let mut graph = vec![Vec::new(); reaches.len()];
    for a in 0..reaches.len() {
        for b in (a + 1)..reaches.len() {
            if neighbors[a].contains(&b) || !reaches[a].is_disjoint(&reaches[b]) {
                graph[a].push(b);
                graph[b].push(a);
            }
        }
    }
    Ok(graph)
}

fn schedule_for(partition: &Partition) -> Result<Schedule> {
    let graph = conflict_graph(partition.tree(), partition.aoi(), partition.toroidal())?;
    Ok(Schedule::new(&graph))
}

/// Drops repeated copies of the same non-idle action, keeping the order.
fn dedup_actions(actions: Vec<BalanceAction>) -> Vec<BalanceAction> {
    let mut out: Vec<BalanceAction> = Vec::with_capacity(actions.len());
    for action in actions {
        if action.is_idle() || !out.contains(&action) {
            out.push(action);
        }
    }
    out
}

fn mean_load(loads: &[f64], pids: &[Pid]) -> f64 {
    pids.iter().map(|p| loads.get(*p).cloned().unwrap_or(0.)).sum::<f64>() / pids.len() as f64
}

/// Picks the face of `pid` with the largest load gradient and turns it into
/// an action moving work from the heavier side to the lighter one.
pub fn propose(
    tree: &PartitionTree,
    pid: Pid,
    loads: &[f64],
    config: &BalanceConfig,
    colors: usize,
) -> Result<BalanceAction> {
    let own = tree.leaf_region(pid)?.clone();
    let mut best: Option<(f64, usize, i8, FaceSets)> = None;
    for dim in 0..tree.dims() {
        for dir in &[1i8, -1] {
            let sets = match aligned_sets(tree, pid, dim, *dir)? {
                Some(sets) => sets,
                None => continue,
            };
            let delta = (mean_load(loads, &sets.sources) - mean_load(loads, &sets.dests))
                * config.step_size
                / own.extent(dim) as f64;
            let better = match &best {
                Some((d, ..)) => delta.abs() > d.abs(),
                None => true,
            };
            if better {
                best = Some((delta, dim, *dir, sets));
            }
        }
    }
    let (delta, dim, dir, sets) = match best {
        Some(b) => b,
        None => return Ok(BalanceAction::idle()),
    };
    let gain = delta.abs() * config.interval as f64 * colors as f64;
    if gain <= config.overhead_threshold {
        trace!("process {}: gain {} below threshold", pid, gain);
        return Ok(BalanceAction::idle());
    }
    let (source_ids, dest_ids, direction) = if delta >= 0. {
        (sets.sources, sets.dests, dir)
    } else {
        (sets.dests, sets.sources, -dir)
    };
    let mut offset = delta.abs().floor() as Coord;
    for src in &source_ids {
        let room = tree.leaf_region(*src)?.extent(dim) - config.min_extent.max(1);
        offset = offset.min(room);
    }
    if offset <= 0 {
        return Ok(BalanceAction::idle());
    }
    Ok(BalanceAction {
        source_ids,
        dest_ids,
        dimension: dim,
        direction,
        offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad() -> PartitionTree {
        PartitionTree::uniform(Region::with_extent(&[100, 100]).unwrap(), 1, 4).unwrap()
    }

    #[test]
    fn equal_loads_stay_idle() {
        let tree = quad();
        let config = BalanceConfig::default();
        for pid in 0..4 {
            let action = propose(&tree, pid, &[100.; 4], &config, 4).unwrap();
            assert!(action.is_idle());
        }
    }

    #[test]
    fn heavy_leaf_gives_away_cells() {
        let tree = quad();
        let config = BalanceConfig::default();
        let action = propose(&tree, 0, &[1100., 100., 100., 100.], &config, 4).unwrap();
        assert_eq!(
            action,
            BalanceAction {
                source_ids: vec![0],
                dest_ids: vec![2],
                dimension: 0,
                direction: 1,
                offset: 20,
            }
        );
        tree.validate_action(&action, config.min_extent).unwrap();
    }

    #[test]
    fn light_leaf_pulls_cells() {
        let tree = quad();
        let config = BalanceConfig::default();
        let action = propose(&tree, 2, &[1100., 100., 100., 100.], &config, 4).unwrap();
        assert_eq!(action.source_ids, vec![0]);
        assert_eq!(action.dest_ids, vec![2]);
        assert_eq!(action.direction, 1);
        tree.validate_action(&action, config.min_extent).unwrap();
    }

    #[test]
    fn offset_keeps_min_extent() {
        let tree = quad();
        let config = BalanceConfig {
            min_extent: 45,
            ..BalanceConfig::default()
        };
        let action = propose(&tree, 0, &[1100., 100., 100., 100.], &config, 4).unwrap();
        assert_eq!(action.offset, 5);
    }

    #[test]
    fn sets_grow_to_cover_the_face() {
        let points = vec![vec![50, 50], vec![25, 25]];
        let tree =
            PartitionTree::from_split_points(Region::with_extent(&[100, 100]).unwrap(), &points, 7)
                .unwrap();
        // leaf 0 is a quarter of the lower-left quadrant, across x = 25 it
        // faces leaf 2, both inside the quadrant
        let sets = aligned_sets(&tree, 0, 0, 1).unwrap().unwrap();
        assert_eq!(sets.sources, vec![0]);
        assert_eq!(sets.dests, vec![2]);
        // across x = 50 the lower-right quadrant is a single leaf covering
        // the span of two leaves on this side
        let sets = aligned_sets(&tree, 2, 0, 1).unwrap().unwrap();
        assert_eq!(sets.sources, vec![2, 3]);
        assert_eq!(sets.dests, vec![5]);
        assert!(aligned_sets(&tree, 0, 0, -1).unwrap().is_none());
    }

    fn nested_tree() -> PartitionTree {
        let points = vec![vec![50, 50], vec![25, 25], vec![37, 12], vec![37, 37]];
        PartitionTree::from_split_points(Region::with_extent(&[100, 100]).unwrap(), &points, 13)
            .unwrap()
    }

    #[test]
    fn same_color_proposers_touch_disjoint_leaves() {
        let tree = nested_tree();
        let schedule = Schedule::new(&conflict_graph(&tree, 1, false).unwrap());
        for a in 0..tree.leaf_count() {
            for b in (a + 1)..tree.leaf_count() {
                if schedule.color_of(a) == schedule.color_of(b) {
                    let (ra, rb) = (reach(&tree, a).unwrap(), reach(&tree, b).unwrap());
                    assert!(ra.is_disjoint(&rb), "{} and {} share a leaf", a, b);
                }
            }
        }
    }

    #[test]
    fn uneven_nested_loads_never_abort() {
        let mut tree = nested_tree();
        let config = BalanceConfig::default();
        let mut loads = vec![100.; 13];
        for heavy in &[4, 5, 8, 9] {
            loads[*heavy] = 5000.;
        }
        let mut schedule = Schedule::new(&conflict_graph(&tree, 1, false).unwrap());
        let mut applied = 0;
        for slot in 0..12 {
            let actions: Vec<BalanceAction> = (0..tree.leaf_count())
                .filter(|pid| schedule.is_active(*pid, slot))
                .map(|pid| propose(&tree, pid, &loads, &config, schedule.count()).unwrap())
                .filter(|a| !a.is_idle())
                .collect();
            if actions.is_empty() {
                continue;
            }
            tree = tree
                .apply_actions(&actions, config.min_extent)
                .unwrap_or_else(|e| panic!("slot {} aborted: {} {:?}", slot, e, actions));
            tree.check_invariants().unwrap();
            schedule = Schedule::new(&conflict_graph(&tree, 1, false).unwrap());
            applied += actions.len();
        }
        assert!(applied > 0);
    }

    #[test]
    fn repeated_actions_are_merged() {
        let action = BalanceAction {
            source_ids: vec![0],
            dest_ids: vec![2],
            dimension: 0,
            direction: 1,
            offset: 5,
        };
        let actions = vec![
            action.clone(),
            BalanceAction::idle(),
            action.clone(),
            BalanceAction::idle(),
        ];
        assert_eq!(
            dedup_actions(actions),
            vec![action, BalanceAction::idle(), BalanceAction::idle()]
        );
    }

    #[test]
    fn balancing_is_due_every_interval() {
        let config = BalanceConfig {
            interval: 10,
            ..BalanceConfig::default()
        };
        let rebalancer = Rebalancer {
            meter: LoadMeter::new(config.window),
            schedule: Schedule::new(&[vec![]]),
            config,
            slot: 0,
        };
        assert!(!rebalancer.should_balance(0));
        assert!(!rebalancer.should_balance(5));
        assert!(rebalancer.should_balance(10));
        assert!(rebalancer.should_balance(30));
    }
}
