//! Integer hyper-rectangle geometry.

use std::fmt;

use crate::error::{Error, Result};
use crate::Coord;

/// Axis-aligned, half-open integer hyper-rectangle `[min, max)`.
///
/// Cells are addressed by integer points. Iteration over cells is row-major
/// with the last dimension varying fastest, which is also the memory layout
/// used by grid storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    pub min: Vec<Coord>,
    pub max: Vec<Coord>,
}

impl Region {
    /// Creates a new region, failing if the corner dimensions disagree or
    /// if `max < min` along any dimension. Empty regions are allowed.
    pub fn new(min: Vec<Coord>, max: Vec<Coord>) -> Result<Self> {
        if min.len() != max.len() || min.is_empty() {
            return Err(Error::InvalidRegion(format!(
                "corner dimensions don't match: {:?} {:?}",
                min, max
            )));
        }
        if min.iter().zip(&max).any(|(lo, hi)| hi < lo) {
            return Err(Error::InvalidRegion(format!(
                "max below min: {:?} {:?}",
                min, max
            )));
        }
        Ok(Region { min, max })
    }

    /// Region starting at the origin with the given extents.
    pub fn with_extent(extent: &[Coord]) -> Result<Self> {
        Self::new(vec![0; extent.len()], extent.to_vec())
    }

    pub fn dims(&self) -> usize {
        self.min.len()
    }

    pub fn extent(&self, dim: usize) -> Coord {
        self.max[dim] - self.min[dim]
    }

    pub fn extents(&self) -> Vec<Coord> {
        (0..self.dims()).map(|d| self.extent(d)).collect()
    }

    pub fn volume(&self) -> u64 {
        self.extents().iter().map(|e| (*e).max(0) as u64).product()
    }

    pub fn is_empty(&self) -> bool {
        self.min.iter().zip(&self.max).any(|(lo, hi)| hi <= lo)
    }

    pub fn contains(&self, point: &[Coord]) -> bool {
        point.len() == self.dims()
            && point
                .iter()
                .enumerate()
                .all(|(d, p)| *p >= self.min[d] && *p < self.max[d])
    }

    /// Like `contains` but for continuous locations.
    pub fn contains_f(&self, point: &[f64]) -> bool {
        point.len() == self.dims()
            && point
                .iter()
                .enumerate()
                .all(|(d, p)| *p >= self.min[d] as f64 && *p < self.max[d] as f64)
    }

    pub fn contains_region(&self, other: &Region) -> bool {
        (0..self.dims()).all(|d| other.min[d] >= self.min[d] && other.max[d] <= self.max[d])
    }

    pub fn intersects(&self, other: &Region) -> bool {
        (0..self.dims()).all(|d| self.min[d] < other.max[d] && other.min[d] < self.max[d])
    }

    /// Intersection of two regions, `None` if they don't overlap.
    pub fn intersection(&self, other: &Region) -> Option<Region> {
        if !self.intersects(other) {
            return None;
        }
        let min = (0..self.dims())
            .map(|d| self.min[d].max(other.min[d]))
            .collect();
        let max = (0..self.dims())
            .map(|d| self.max[d].min(other.max[d]))
            .collect();
        Some(Region { min, max })
    }

    /// Smallest region covering both.
    pub fn union_bounds(&self, other: &Region) -> Region {
        Region {
            min: (0..self.dims())
                .map(|d| self.min[d].min(other.min[d]))
                .collect(),
            max: (0..self.dims())
                .map(|d| self.max[d].max(other.max[d]))
                .collect(),
        }
    }

    /// Grows the region by `by` cells on every side.
    pub fn expand(&self, by: Coord) -> Region {
        Region {
            min: self.min.iter().map(|v| v - by).collect(),
            max: self.max.iter().map(|v| v + by).collect(),
        }
    }

    pub fn shift(&self, offset: &[Coord]) -> Region {
        Region {
            min: self.min.iter().zip(offset).map(|(v, o)| v + o).collect(),
            max: self.max.iter().zip(offset).map(|(v, o)| v + o).collect(),
        }
    }

    /// Floor of the geometric center.
    pub fn center(&self) -> Vec<Coord> {
        (0..self.dims())
            .map(|d| self.min[d] + self.extent(d) / 2)
            .collect()
    }

    /// Projection onto every dimension except `dim`, as (min, max) pairs.
    pub fn span_without(&self, dim: usize) -> Vec<(Coord, Coord)> {
        (0..self.dims())
            .filter(|d| *d != dim)
            .map(|d| (self.min[d], self.max[d]))
            .collect()
    }

    /// Row-major linear index of `point` relative to this region.
    pub fn linear_index(&self, point: &[Coord]) -> Option<usize> {
        if !self.contains(point) {
            return None;
        }
        let mut idx = 0usize;
        for d in 0..self.dims() {
            idx = idx * self.extent(d) as usize + (point[d] - self.min[d]) as usize;
        }
        Some(idx)
    }

    /// Calls `f` for every cell of the region in row-major order.
    pub fn for_each_point<F: FnMut(&[Coord])>(&self, mut f: F) {
        if self.is_empty() {
            return;
        }
        let dims = self.dims();
        let mut point = self.min.clone();
        loop {
            f(&point);
            let mut d = dims;
            loop {
                if d == 0 {
                    return;
                }
                d -= 1;
                point[d] += 1;
                if point[d] < self.max[d] {
                    break;
                }
                point[d] = self.min[d];
            }
        }
    }

    /// Collects every cell of the region in row-major order.
    pub fn points(&self) -> Vec<Vec<Coord>> {
        let mut out = Vec::with_capacity(self.volume() as usize);
        self.for_each_point(|p| out.push(p.to_vec()));
        out
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for d in 0..self.dims() {
            if d > 0 {
                write!(f, " x ")?;
            }
            write!(f, "{}..{}", self.min[d], self.max[d])?;
        }
        write!(f, ")")
    }
}

/// All toroidal shift vectors for a domain of the given extents, in
/// canonical order (lexicographic over `{-1, 0, 1}^D`, zero shift included).
///
/// Both sides of a halo exchange iterate shifts in this order, which is what
/// keeps their overlap lists aligned.
pub fn toroidal_shifts(extents: &[Coord]) -> Vec<Vec<Coord>> {
    let dims = extents.len();
    let count = 3usize.pow(dims as u32);
    let mut shifts = Vec::with_capacity(count);
    for n in 0..count {
        let mut rem = n;
        let mut shift = vec![0; dims];
        for d in (0..dims).rev() {
            shift[d] = (rem % 3) as Coord - 1;
            rem /= 3;
        }
        shifts.push(
            shift
                .iter()
                .zip(extents)
                .map(|(s, e)| s * e)
                .collect::<Vec<_>>(),
        );
    }
    shifts
}

/// Wraps a point into the domain when the domain is toroidal.
pub fn wrap_point(point: &[Coord], domain: &Region) -> Vec<Coord> {
    point
        .iter()
        .enumerate()
        .map(|(d, p)| {
            let ext = domain.extent(d);
            domain.min[d] + (p - domain.min[d]).rem_euclid(ext)
        })
        .collect()
}

/// Wraps a continuous location into the domain when the domain is toroidal.
pub fn wrap_location(location: &[f64], domain: &Region) -> Vec<f64> {
    location
        .iter()
        .enumerate()
        .map(|(d, p)| {
            let ext = domain.extent(d) as f64;
            let v = domain.min[d] as f64 + (p - domain.min[d] as f64).rem_euclid(ext);
            // rounding can land a tiny negative offset exactly on the upper bound
            if v >= domain.max[d] as f64 {
                domain.min[d] as f64
            } else {
                v
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(min: &[Coord], max: &[Coord]) -> Region {
        Region::new(min.to_vec(), max.to_vec()).unwrap()
    }

    #[test]
    fn intersection_and_containment() {
        let a = rect(&[0, 0], &[10, 10]);
        let b = rect(&[5, 8], &[20, 12]);
        assert_eq!(a.intersection(&b), Some(rect(&[5, 8], &[10, 10])));
        assert!(a.contains(&[9, 9]));
        assert!(!a.contains(&[10, 0]));
        assert!(a.intersection(&rect(&[10, 0], &[11, 10])).is_none());
    }

    #[test]
    fn row_major_iteration() {
        let r = rect(&[1, 2], &[3, 4]);
        assert_eq!(
            r.points(),
            vec![vec![1, 2], vec![1, 3], vec![2, 2], vec![2, 3]]
        );
        assert_eq!(r.linear_index(&[2, 3]), Some(3));
        assert_eq!(r.volume(), 4);
    }

    #[test]
    fn shifts_are_canonical() {
        let shifts = toroidal_shifts(&[10, 20]);
        assert_eq!(shifts.len(), 9);
        assert_eq!(shifts[0], vec![-10, -20]);
        assert_eq!(shifts[4], vec![0, 0]);
        assert_eq!(shifts[8], vec![10, 20]);
    }

    #[test]
    fn wrapping() {
        let domain = rect(&[0, 0], &[10, 10]);
        assert_eq!(wrap_point(&[-1, 10], &domain), vec![9, 0]);
        assert_eq!(wrap_location(&[-0.5, 10.25], &domain), vec![9.5, 0.25]);
    }
}
