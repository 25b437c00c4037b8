//! Next-hop routing over face-adjacent leaves.

use crate::error::Result;
use crate::geom::{wrap_point, Region};
use crate::tree::PartitionTree;
use crate::{Coord, Pid};

/// Distance from `c` to the interval `[lo, hi)`.
fn gap(c: Coord, lo: Coord, hi: Coord) -> Coord {
    if c < lo {
        lo - c
    } else if c >= hi {
        c - hi + 1
    } else {
        0
    }
}

/// Cell of the destination region closest to the center of `from`. On a
/// toroidal domain the nearest periodic copy of the destination is used,
/// so the returned point may lie outside the domain.
pub(crate) fn target_point(from: &Region, to: &Region, domain: &Region, toroidal: bool) -> Vec<Coord> {
    let center = from.center();
    (0..from.dims())
        .map(|d| {
            let mut shift = 0;
            if toroidal {
                let ext = domain.extent(d);
                shift = *[-ext, 0, ext]
                    .iter()
                    .min_by_key(|s| gap(center[d], to.min[d] + **s, to.max[d] + **s))
                    .unwrap_or(&0);
            }
            center[d].max(to.min[d] + shift).min(to.max[d] + shift - 1)
        })
        .collect()
}

/// Owner of the leaf one step from `pid` towards `dest`.
///
/// The step crosses the face of the local leaf along the first dimension in
/// which the destination is not reached yet. Returns `pid` itself when the
/// destination is already reached.
pub fn next_hop(tree: &PartitionTree, pid: Pid, dest: Pid, toroidal: bool) -> Result<Pid> {
    if pid == dest {
        return Ok(pid);
    }
    let own = tree.leaf_region(pid)?;
    let target = target_point(own, tree.leaf_region(dest)?, tree.domain(), toroidal);
    let dim = match (0..own.dims()).find(|d| !(own.min[*d]..own.max[*d]).contains(&target[*d])) {
        Some(d) => d,
        None => return Ok(dest),
    };
    let step: Vec<Coord> = (0..own.dims())
        .map(|d| {
            if d != dim {
                target[d].max(own.min[d]).min(own.max[d] - 1)
            } else if target[d] >= own.max[d] {
                own.max[d]
            } else {
                own.min[d] - 1
            }
        })
        .collect();
    let step = if toroidal {
        wrap_point(&step, tree.domain())
    } else {
        step
    };
    tree.owner_at(&step)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad() -> PartitionTree {
        PartitionTree::uniform(Region::with_extent(&[100, 100]).unwrap(), 1, 4).unwrap()
    }

    #[test]
    fn diagonal_takes_two_hops() {
        let tree = quad();
        // leaf 3 is the upper corner, leaf 0 the lower one
        let first = next_hop(&tree, 3, 0, false).unwrap();
        assert_eq!(first, 1);
        assert_eq!(next_hop(&tree, first, 0, false).unwrap(), 0);
        assert_eq!(next_hop(&tree, 0, 0, false).unwrap(), 0);
    }

    #[test]
    fn wrapping_takes_the_short_way() {
        let tree =
            PartitionTree::uniform(Region::with_extent(&[100, 100]).unwrap(), 2, 16).unwrap();
        let corner = tree.owner_at(&[0, 0]).unwrap();
        let far = tree.owner_at(&[99, 10]).unwrap();
        assert_eq!(next_hop(&tree, corner, far, true).unwrap(), far);
        assert_ne!(next_hop(&tree, corner, far, false).unwrap(), far);
    }

    #[test]
    fn target_is_clamped_into_destination() {
        let domain = Region::with_extent(&[10]).unwrap();
        let from = Region::new(vec![0], vec![2]).unwrap();
        let to = Region::new(vec![8], vec![10]).unwrap();
        assert_eq!(target_point(&from, &to, &domain, false), vec![8]);
        assert_eq!(target_point(&from, &to, &domain, true), vec![-1]);
    }
}
