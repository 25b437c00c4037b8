//! Boundary moves between adjacent leaves.

use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::geom::Region;
use crate::{Coord, Pid};

use super::PartitionTree;

/// Proposed move of the face shared by a set of source leaves and a set of
/// destination leaves.
///
/// The face lies on the `direction` side of every source along `dimension`
/// (`+1` means the sources' upper bound, `-1` their lower bound). Applying
/// the action moves the face `offset` cells towards the sources, so sources
/// shrink and destinations grow by the same amount.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BalanceAction {
    pub source_ids: Vec<Pid>,
    pub dest_ids: Vec<Pid>,
    pub dimension: usize,
    pub direction: i8,
    pub offset: Coord,
}

impl BalanceAction {
    /// Action that doesn't change anything.
    pub fn idle() -> Self {
        BalanceAction::default()
    }

    pub fn is_idle(&self) -> bool {
        self.source_ids.is_empty() && self.dest_ids.is_empty() && self.offset == 0
    }

    /// Every process touched by the action.
    pub fn participants(&self) -> Vec<Pid> {
        let mut out = self.source_ids.clone();
        out.extend_from_slice(&self.dest_ids);
        out
    }

    fn source_face(&self, region: &Region) -> Coord {
        if self.direction > 0 {
            region.max[self.dimension]
        } else {
            region.min[self.dimension]
        }
    }

    fn dest_face(&self, region: &Region) -> Coord {
        if self.direction > 0 {
            region.min[self.dimension]
        } else {
            region.max[self.dimension]
        }
    }
}

fn invalid<T>(msg: String) -> Result<T> {
    Err(Error::InvalidPartition(msg))
}

/// Bounds of the given regions projected onto every dimension except `dim`,
/// together with the summed projected areas.
fn face_span(regions: &[&Region], dim: usize) -> (Vec<(Coord, Coord)>, u64) {
    let mut bounds = regions[0].clone();
    let mut area = 0u64;
    for r in regions {
        bounds = bounds.union_bounds(r);
        area += r
            .span_without(dim)
            .iter()
            .map(|(lo, hi)| (hi - lo) as u64)
            .product::<u64>();
    }
    (bounds.span_without(dim), area)
}

fn span_area(span: &[(Coord, Coord)]) -> u64 {
    span.iter().map(|(lo, hi)| (hi - lo) as u64).product()
}

impl PartitionTree {
    /// Checks an action against the current geometry and returns the
    /// coordinate of the face it moves.
    pub fn validate_action(&self, action: &BalanceAction, min_extent: Coord) -> Result<Coord> {
        let min_extent = min_extent.max(1);
        if action.source_ids.is_empty() || action.dest_ids.is_empty() {
            return invalid(format!("action without sources or dests: {:?}", action));
        }
        if action.dimension >= self.dims() {
            return invalid(format!("dimension {} out of range", action.dimension));
        }
        if action.direction != 1 && action.direction != -1 {
            return invalid(format!("bad direction {}", action.direction));
        }
        if action.offset <= 0 {
            return invalid(format!("non-positive offset {}", action.offset));
        }
        let ids = action.participants();
        let unique: BTreeSet<&Pid> = ids.iter().collect();
        if unique.len() != ids.len() {
            return invalid(format!("leaf listed twice in {:?}", action));
        }
        let region_of = |pid: &Pid| -> Result<&Region> {
            self.leaves
                .get(*pid)
                .map(|id| &self.nodes[*id].region)
                .ok_or_else(|| Error::InvalidPartition(format!("no leaf for process {}", pid)))
        };
        let sources = action
            .source_ids
            .iter()
            .map(region_of)
            .collect::<Result<Vec<_>>>()?;
        let dests = action
            .dest_ids
            .iter()
            .map(region_of)
            .collect::<Result<Vec<_>>>()?;

        let face = action.source_face(sources[0]);
        if sources.iter().any(|r| action.source_face(r) != face)
            || dests.iter().any(|r| action.dest_face(r) != face)
        {
            return invalid(format!("leaves don't share the face at {}: {:?}", face, action));
        }

        let dim = action.dimension;
        let (src_span, src_area) = face_span(&sources, dim);
        let (dst_span, dst_area) = face_span(&dests, dim);
        if src_span != dst_span {
            return invalid(format!(
                "face spans differ: {:?} vs {:?}",
                src_span, dst_span
            ));
        }
        if src_area != span_area(&src_span) || dst_area != span_area(&dst_span) {
            return invalid(format!("leaves don't cover the shared face: {:?}", action));
        }

        let new_face = face - action.direction as Coord * action.offset;
        for (pid, r) in action.source_ids.iter().zip(&sources) {
            let remaining = if action.direction > 0 {
                new_face - r.min[dim]
            } else {
                r.max[dim] - new_face
            };
            if remaining < min_extent {
                return invalid(format!(
                    "leaf {} would shrink to {} cells along dimension {}",
                    pid, remaining, dim
                ));
            }
        }
        Ok(face)
    }

    /// Applies every non-idle action to a copy of the tree and validates the
    /// result. The tree itself is never modified.
    pub fn apply_actions(
        &self,
        actions: &[BalanceAction],
        min_extent: Coord,
    ) -> Result<PartitionTree> {
        let mut shadow = self.clone();
        let mut touched = BTreeSet::new();
        // (leaf, dimension, side) of every face moved this round
        let mut moved_faces = BTreeSet::new();
        for action in actions.iter().filter(|a| !a.is_idle()) {
            let face = self.validate_action(action, min_extent)?;
            let new_face = face - action.direction as Coord * action.offset;
            let dim = action.dimension;
            let sides = action
                .source_ids
                .iter()
                .map(|pid| (*pid, dim, action.direction))
                .chain(action.dest_ids.iter().map(|pid| (*pid, dim, -action.direction)));
            for side in sides {
                if !moved_faces.insert(side) {
                    return invalid(format!(
                        "face {:?} of leaf {} is moved by more than one action",
                        (side.1, side.2),
                        side.0
                    ));
                }
            }
            for pid in &action.source_ids {
                let region = &mut shadow.nodes[self.leaves[*pid]].region;
                if action.direction > 0 {
                    region.max[dim] = new_face;
                } else {
                    region.min[dim] = new_face;
                }
            }
            for pid in &action.dest_ids {
                let region = &mut shadow.nodes[self.leaves[*pid]].region;
                if action.direction > 0 {
                    region.min[dim] = new_face;
                } else {
                    region.max[dim] = new_face;
                }
            }
            touched.extend(action.participants());
        }
        shadow.refresh_internal_regions();
        shadow.check_invariants()?;
        for pid in touched {
            let region = shadow.leaf_region(pid)?;
            if let Some(d) = (0..region.dims()).find(|d| region.extent(*d) < min_extent.max(1)) {
                return invalid(format!(
                    "leaf {} is {} cells wide along dimension {}",
                    pid,
                    region.extent(d),
                    d
                ));
            }
        }
        Ok(shadow)
    }
}
