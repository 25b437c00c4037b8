//! Field storage backing halo fields.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::geom::Region;
use crate::Coord;

/// Element type tag carried in every exchanged payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ElementKind {
    F64 = 1,
    F32 = 2,
    I64 = 3,
    I32 = 4,
    U8 = 5,
    /// Serialized objects, variable length
    Object = 6,
}

impl ElementKind {
    pub fn from_u8(code: u8) -> Option<ElementKind> {
        match code {
            1 => Some(ElementKind::F64),
            2 => Some(ElementKind::F32),
            3 => Some(ElementKind::I64),
            4 => Some(ElementKind::I32),
            5 => Some(ElementKind::U8),
            6 => Some(ElementKind::Object),
            _ => None,
        }
    }

    /// Encoded size of a single element in bytes, zero if it varies.
    pub fn size(&self) -> u32 {
        match self {
            ElementKind::F64 | ElementKind::I64 => 8,
            ElementKind::F32 | ElementKind::I32 => 4,
            ElementKind::U8 => 1,
            ElementKind::Object => 0,
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ElementKind::F64 => "f64",
            ElementKind::F32 => "f32",
            ElementKind::I64 => "i64",
            ElementKind::I32 => "i32",
            ElementKind::U8 => "u8",
            ElementKind::Object => "object",
        };
        write!(f, "{}", s)
    }
}

/// Value that can be stored in a grid and encoded on the wire.
pub trait Element: Copy + Default + PartialEq + fmt::Debug {
    const KIND: ElementKind;
    /// Little-endian encoding, `KIND.size()` bytes long.
    fn write_le(&self, out: &mut [u8]);
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($t:ty, $kind:expr, $write:ident, $read:ident) => {
        impl Element for $t {
            const KIND: ElementKind = $kind;
            fn write_le(&self, out: &mut [u8]) {
                LittleEndian::$write(out, *self)
            }
            fn read_le(bytes: &[u8]) -> Self {
                LittleEndian::$read(bytes)
            }
        }
    };
}

impl_element!(f64, ElementKind::F64, write_f64, read_f64);
impl_element!(f32, ElementKind::F32, write_f32, read_f32);
impl_element!(i64, ElementKind::I64, write_i64, read_i64);
impl_element!(i32, ElementKind::I32, write_i32, read_i32);

impl Element for u8 {
    const KIND: ElementKind = ElementKind::U8;
    fn write_le(&self, out: &mut [u8]) {
        out[0] = *self;
    }
    fn read_le(bytes: &[u8]) -> Self {
        bytes[0]
    }
}

/// Storage collaborator used by halo fields.
///
/// Storage covers a rectangular set of cells given by its bounds. Regions
/// passed to `pack` and `unpack` must lie within the bounds. The encoding
/// of a region only depends on the region's shape, so a block packed from
/// one region can be unpacked into any region of the same extents.
pub trait FieldStorage {
    /// Creates zeroed storage covering the given bounds.
    fn with_bounds(bounds: Region) -> Self
    where
        Self: Sized;

    fn kind(&self) -> ElementKind;
    fn element_size(&self) -> u32 {
        self.kind().size()
    }
    fn bounds(&self) -> &Region;

    /// Encodes every cell of `region`.
    fn pack(&self, region: &Region) -> Result<Vec<u8>>;
    /// Replaces the contents of every cell of `region` with the encoded ones.
    fn unpack(&mut self, region: &Region, bytes: &[u8]) -> Result<()>;

    /// Changes the bounds, keeping the cells in the overlap of the old and
    /// new bounds and clearing the rest.
    fn reshape(&mut self, bounds: Region);
}

/// Dense row-major grid of elements.
#[derive(Debug, Clone, PartialEq)]
pub struct GridStorage<T: Element> {
    bounds: Region,
    data: Vec<T>,
}

impl<T: Element> GridStorage<T> {
    pub fn new(bounds: Region) -> Self {
        let data = vec![T::default(); bounds.volume() as usize];
        GridStorage { bounds, data }
    }

    pub fn get(&self, point: &[Coord]) -> Option<T> {
        self.bounds.linear_index(point).map(|i| self.data[i])
    }

    pub fn set(&mut self, point: &[Coord], value: T) -> Result<()> {
        let idx = self.index(point)?;
        self.data[idx] = value;
        Ok(())
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Sets every cell of `region` to the result of calling `f` on it.
    pub fn fill_with<F: FnMut(&[Coord]) -> T>(&mut self, region: &Region, mut f: F) -> Result<()> {
        self.check_within(region)?;
        let bounds = &self.bounds;
        let data = &mut self.data;
        region.for_each_point(|p| {
            if let Some(i) = bounds.linear_index(p) {
                data[i] = f(p);
            }
        });
        Ok(())
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

impl<T: Element> FieldStorage for GridStorage<T> {
    fn with_bounds(bounds: Region) -> Self {
        GridStorage::new(bounds)
    }

    fn kind(&self) -> ElementKind {
        T::KIND
    }

    fn bounds(&self) -> &Region {
        &self.bounds
    }

    fn pack(&self, region: &Region) -> Result<Vec<u8>> {
        self.check_within(region)?;
        let size = T::KIND.size() as usize;
        let mut out = vec![0u8; region.volume() as usize * size];
        let mut offset = 0;
        region.for_each_point(|p| {
            if let Some(i) = self.bounds.linear_index(p) {
                self.data[i].write_le(&mut out[offset..offset + size]);
            }
            offset += size;
        });
        Ok(out)
    }

    fn unpack(&mut self, region: &Region, bytes: &[u8]) -> Result<()> {
        self.check_within(region)?;
        let size = T::KIND.size() as usize;
        let expected = region.volume() as usize * size;
        if bytes.len() != expected {
            return Err(Error::SerializationError(format!(
                "{} bytes for region {}, expected {}",
                bytes.len(),
                region,
                expected
            )));
        }
        let bounds = &self.bounds;
        let data = &mut self.data;
        let mut offset = 0;
        region.for_each_point(|p| {
            if let Some(i) = bounds.linear_index(p) {
                data[i] = T::read_le(&bytes[offset..offset + size]);
            }
            offset += size;
        });
        Ok(())
    }

    fn reshape(&mut self, bounds: Region) {
        if bounds == self.bounds {
            return;
        }
        let mut next = GridStorage::<T>::new(bounds);
        if let Some(common) = self.bounds.intersection(&next.bounds) {
            common.for_each_point(|p| {
                if let (Some(from), Some(to)) =
                    (self.bounds.linear_index(p), next.bounds.linear_index(p))
                {
                    next.data[to] = self.data[from];
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
    fn pack_is_row_major_little_endian() {
        let mut grid = GridStorage::<i32>::new(rect(&[0, 0], &[2, 3]));
        grid.fill_with(&rect(&[0, 0], &[2, 3]), |p| (p[0] * 10 + p[1]) as i32)
            .unwrap();
        let bytes = grid.pack(&rect(&[1, 1], &[2, 3])).unwrap();
        assert_eq!(bytes, vec![11, 0, 0, 0, 12, 0, 0, 0]);
    }

    #[test]
    fn unpack_checks_length() {
        let mut grid = GridStorage::<f64>::new(rect(&[0], &[4]));
        match grid.unpack(&rect(&[0], &[2]), &[0u8; 15]) {
            Err(Error::SerializationError(_)) => (),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(grid.pack(&rect(&[2], &[5])).is_err());
    }

    #[test]
    fn copy_between_grids() {
        let mut a = GridStorage::<f32>::new(rect(&[0, 0], &[4, 4]));
        a.set(&[2, 3], 1.5).unwrap();
        let mut b = GridStorage::<f32>::new(rect(&[2, 2], &[6, 6]));
        let region = rect(&[2, 2], &[4, 4]);
        b.unpack(&region, &a.pack(&region).unwrap()).unwrap();
        assert_eq!(b.get(&[2, 3]), Some(1.5));
        assert_eq!(b.get(&[0, 0]), None);
    }

    #[test]
    fn reshape_keeps_overlap() {
        let mut grid = GridStorage::<u8>::new(rect(&[0, 0], &[4, 4]));
        grid.fill_with(&rect(&[0, 0], &[4, 4]), |_| 7).unwrap();
        grid.reshape(rect(&[2, 2], &[6, 6]));
        assert_eq!(grid.get(&[3, 3]), Some(7));
        assert_eq!(grid.get(&[4, 4]), Some(0));
        assert_eq!(grid.data().len(), 16);
    }
}
