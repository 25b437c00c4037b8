//! Object storage over continuous space.

use std::fmt;

use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::geom::Region;
use crate::Coord;

use super::storage::{ElementKind, FieldStorage};

/// Object together with its location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry<T> {
    pub location: Vec<f64>,
    pub value: T,
}

/// Entry as sent over the wire, located relative to the packed region.
#[derive(Serialize, Deserialize)]
struct PackedEntry<T> {
    offset: Vec<f64>,
    value: T,
}

/// Cell containing the given location.
pub fn cell_of(location: &[f64]) -> Vec<Coord> {
    location.iter().map(|l| l.floor() as Coord).collect()
}

/// Objects at continuous locations, bucketed by the unit cell they fall
/// into.
///
/// Packing a region encodes every object in its cells with `bincode`,
/// locations taken relative to the region's lower corner. Unpacking places
/// them relative to the target region, so blocks can move between shifted
/// copies of a toroidal domain.
#[derive(Clone, PartialEq)]
pub struct ContinuousStorage<T> {
    bounds: Region,
    cells: Vec<Vec<Entry<T>>>,
}

impl<T> fmt::Debug for ContinuousStorage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinuousStorage")
            .field("bounds", &self.bounds)
            .field("len", &self.cells.iter().map(|c| c.len()).sum::<usize>())
            .finish()
    }
}

impl<T: Clone + serde::Serialize + DeserializeOwned> ContinuousStorage<T> {
    pub fn new(bounds: Region) -> Self {
        let cells = vec![Vec::new(); bounds.volume() as usize];
        ContinuousStorage { bounds, cells }
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.cells.iter().map(|c| c.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.iter().all(|c| c.is_empty())
    }

    pub fn insert(&mut self, location: Vec<f64>, value: T) -> Result<()> {
        let idx = self.index(&cell_of(&location))?;
        self.cells[idx].push(Entry { location, value });
        Ok(())
    }

    /// Objects in the cell containing `point`.
    pub fn cell(&self, point: &[Coord]) -> &[Entry<T>] {
        match self.bounds.linear_index(point) {
            Some(i) => &self.cells[i],
            None => &[],
        }
    }

    /// Removes and returns every object in the cell containing `point`.
    pub fn take_cell(&mut self, point: &[Coord]) -> Vec<Entry<T>> {
        match self.bounds.linear_index(point) {
            Some(i) => std::mem::replace(&mut self.cells[i], Vec::new()),
            None => Vec::new(),
        }
    }

    /// Objects located in the given region, in row-major cell order.
    pub fn within(&self, region: &Region) -> Vec<&Entry<T>> {
        let mut out = Vec::new();
        if let Some(common) = self.bounds.intersection(region) {
            for point in common.points() {
                if let Some(i) = self.bounds.linear_index(&point) {
                    out.extend(self.cells[i].iter());
                }
            }
        }
        out
    }

    fn index(&self, point: &[Coord]) -> Result<usize> {
        self.bounds.linear_index(point).ok_or_else(|| {
            Error::OutOfBounds(format!("{:?} is outside of {}", point, self.bounds))
        })
    }

    fn check_within(&self, region: &Region) -> Result<()> {
        if region.dims() != self.bounds.dims() || !self.bounds.contains_region(region) {
            return Err(Error::OutOfBounds(format!(
                "{} is outside of {}",
                region, self.bounds
            )));
        }
        Ok(())
    }
}

impl<T: Clone + serde::Serialize + DeserializeOwned> FieldStorage for ContinuousStorage<T> {
    fn with_bounds(bounds: Region) -> Self {
        ContinuousStorage::new(bounds)
    }

    fn kind(&self) -> ElementKind {
        ElementKind::Object
    }

    fn bounds(&self) -> &Region {
        &self.bounds
    }

    fn pack(&self, region: &Region) -> Result<Vec<u8>> {
        self.check_within(region)?;
        let mut entries = Vec::new();
        region.for_each_point(|p| {
            if let Some(i) = self.bounds.linear_index(p) {
                for entry in &self.cells[i] {
                    entries.push(PackedEntry {
                        offset: entry
                            .location
                            .iter()
                            .zip(&region.min)
                            .map(|(l, m)| l - *m as f64)
                            .collect(),
                        value: entry.value.clone(),
                    });
                }
            }
        });
        Ok(bincode::serialize(&entries)?)
    }

    fn unpack(&mut self, region: &Region, bytes: &[u8]) -> Result<()> {
        self.check_within(region)?;
        let entries: Vec<PackedEntry<T>> = bincode::deserialize(bytes)?;
        let bounds = &self.bounds;
        let cells = &mut self.cells;
        region.for_each_point(|p| {
            if let Some(i) = bounds.linear_index(p) {
                cells[i].clear();
            }
        });
        for entry in entries {
            let location: Vec<f64> = entry
                .offset
                .iter()
                .zip(&region.min)
                .map(|(o, m)| o + *m as f64)
                .collect();
            let cell = cell_of(&location);
            if !region.contains(&cell) {
                return Err(Error::SerializationError(format!(
                    "object at {:?} unpacked outside of {}",
                    location, region
                )));
            }
            let idx = self.index(&cell)?;
            self.cells[idx].push(Entry {
                location,
                value: entry.value,
            });
        }
        Ok(())
    }

    fn reshape(&mut self, bounds: Region) {
        if bounds == self.bounds {
            return;
        }
        let mut next = ContinuousStorage::<T>::new(bounds);
        if let Some(common) = self.bounds.intersection(&next.bounds) {
            common.for_each_point(|p| {
                if let (Some(from), Some(to)) =
                    (self.bounds.linear_index(p), next.bounds.linear_index(p))
                {
                    next.cells[to] = std::mem::replace(&mut self.cells[from], Vec::new());
                }
            });
        }
        *self = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(min: &[Coord], max: &[Coord]) -> Region {
        Region::new(min.to_vec(), max.to_vec()).unwrap()
    }

    #[test]
    fn objects_are_bucketed_by_cell() {
        let mut store = ContinuousStorage::<String>::new(rect(&[0, 0], &[4, 4]));
        store.insert(vec![1.5, 2.25], "a".to_string()).unwrap();
        store.insert(vec![1.0, 2.99], "b".to_string()).unwrap();
        store.insert(vec![3.5, 0.5], "c".to_string()).unwrap();
        assert!(store.insert(vec![4.0, 0.5], "d".to_string()).is_err());
        assert_eq!(store.len(), 3);
        assert_eq!(store.cell(&[1, 2]).len(), 2);
        assert_eq!(store.within(&rect(&[2, 0], &[4, 2]))[0].value, "c");
        assert_eq!(store.take_cell(&[1, 2]).len(), 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn blocks_move_between_shifted_regions() {
        let mut a = ContinuousStorage::<u32>::new(rect(&[0, 0], &[4, 4]));
        a.insert(vec![0.25, 3.5], 7).unwrap();
        a.insert(vec![2.5, 2.5], 8).unwrap();
        let bytes = a.pack(&rect(&[0, 3], &[1, 4])).unwrap();

        let mut b = ContinuousStorage::<u32>::new(rect(&[-1, -1], &[3, 3]));
        b.insert(vec![-0.5, -0.5], 1).unwrap();
        b.unpack(&rect(&[-1, -1], &[0, 0]), &bytes).unwrap();
        let cell = b.cell(&[-1, -1]);
        assert_eq!(cell.len(), 1);
        assert_eq!(cell[0].value, 7);
        assert_eq!(cell[0].location, vec![-0.75, -0.5]);
    }

    #[test]
    fn reshape_keeps_objects_in_the_overlap() {
        let mut store = ContinuousStorage::<u8>::new(rect(&[0], &[4]));
        store.insert(vec![0.5], 1).unwrap();
        store.insert(vec![3.5], 2).unwrap();
        store.reshape(rect(&[2], &[6]));
        assert_eq!(store.len(), 1);
        assert_eq!(store.cell(&[3])[0].value, 2);
    }
}
