//! Halo fields: per-process storage padded with ghost cells.
//!
//! A [`HaloField`] covers the local leaf region expanded by the area of
//! interest. Cells outside the local region mirror data owned by
//! neighboring processes and are refreshed by [`HaloField::sync`].
//!
//! # Overlaps
//!
//! For each neighbor the cells to send (local region intersected with the
//! neighbor's halo) and to receive (local halo intersected with the
//! neighbor's region) are computed once per layout. When the domain is
//! toroidal the intersection is repeated for every shift of the domain
//! extent, always in the same canonical order, so the block lists built on
//! both sides of a link line up one to one.
//!
//! # Wire format
//!
//! The payload sent to a neighbor starts with the element kind and size,
//! followed by one block per overlap, each prefixed with its length as a
//! little-endian `u64`. Blocks of fixed-size elements are checked against
//! the overlap volume on receipt.
//!
//! [`HaloField`]: struct.HaloField.html
//! [`HaloField::sync`]: struct.HaloField.html#method.sync

mod continuous;
mod storage;

pub use continuous::{cell_of, ContinuousStorage, Entry};
pub use storage::{Element, ElementKind, FieldStorage, GridStorage};

use byteorder::{ByteOrder, LittleEndian};

use crate::comm::Communicator;
use crate::error::{Error, Result};
use crate::geom::{toroidal_shifts, Region};
use crate::partition::{CommitHook, Partition};
use crate::query::FieldImage;
use crate::{Coord, Pid};

/// Element kind and element size prefix of every exchanged payload.
const HEADER_LEN: usize = 5;

fn header(kind: ElementKind) -> Vec<u8> {
    let mut out = vec![0u8; HEADER_LEN];
    out[0] = kind as u8;
    LittleEndian::write_u32(&mut out[1..], kind.size());
    out
}

/// Checks the payload header against the local element type and returns
/// the remaining body.
fn check_header(local: ElementKind, bytes: &[u8]) -> Result<&[u8]> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::SerializationError(format!(
            "payload of {} bytes is too short for a header",
            bytes.len()
        )));
    }
    let found_size = LittleEndian::read_u32(&bytes[1..HEADER_LEN]);
    let found = ElementKind::from_u8(bytes[0]).ok_or_else(|| {
        Error::SerializationError(format!("unknown element kind code {}", bytes[0]))
    })?;
    if found != local || found_size != local.size() {
        return Err(Error::TypeMismatch {
            expected: local,
            expected_size: local.size(),
            found,
            found_size,
        });
    }
    Ok(&bytes[HEADER_LEN..])
}

fn push_block(buf: &mut Vec<u8>, block: &[u8]) {
    let mut len = [0u8; 8];
    LittleEndian::write_u64(&mut len, block.len() as u64);
    buf.extend_from_slice(&len);
    buf.extend_from_slice(block);
}

/// Splits a payload body into `count` length-prefixed blocks.
fn split_blocks(body: &[u8], count: usize) -> Result<Vec<&[u8]>> {
    let mut out = Vec::with_capacity(count);
    let mut rest = body;
    for _ in 0..count {
        if rest.len() < 8 {
            return Err(Error::SerializationError(format!(
                "payload ends after {} of {} blocks",
                out.len(),
                count
            )));
        }
        let len = LittleEndian::read_u64(&rest[..8]) as usize;
        if rest.len() - 8 < len {
            return Err(Error::SerializationError(format!(
                "block of {} bytes exceeds the {} remaining",
                len,
                rest.len() - 8
            )));
        }
        out.push(&rest[8..8 + len]);
        rest = &rest[8 + len..];
    }
    if !rest.is_empty() {
        return Err(Error::SerializationError(format!(
            "{} trailing bytes after {} blocks",
            rest.len(),
            count
        )));
    }
    Ok(out)
}

/// Blocks exchanged with one neighbor, in canonical shift order.
#[derive(Debug, Clone, PartialEq)]
struct Link {
    pid: Pid,
    send: Vec<Region>,
    recv: Vec<Region>,
}

/// Computes the overlaps between the local process and `other`. With
/// `other == local` only the wrap-around overlaps are returned.
fn overlaps(partition: &Partition, other: Pid) -> Result<Link> {
    let tree = partition.tree();
    let local = partition.local_region();
    let halo = partition.halo_region();
    let other_local = tree.leaf_region(other)?;
    let other_halo = other_local.expand(partition.aoi());
    let shifts = if partition.toroidal() {
        toroidal_shifts(&tree.domain().extents())
    } else {
        vec![vec![0; tree.dims()]]
    };
    let mut link = Link {
        pid: other,
        send: Vec::new(),
        recv: Vec::new(),
    };
    for shift in shifts {
        if other == partition.pid() && shift.iter().all(|s| *s == 0) {
            continue;
        }
        let back: Vec<Coord> = shift.iter().map(|s| -s).collect();
        if let Some(send) = local.intersection(&other_halo.shift(&shift)) {
            link.send.push(send);
        }
        if let Some(recv) = halo.intersection(&other_local.shift(&back)) {
            link.recv.push(recv);
        }
    }
    Ok(link)
}

/// Field distributed over the partitioning, backed by any
/// [`FieldStorage`](trait.FieldStorage.html).
pub struct HaloField<S: FieldStorage = GridStorage<f64>> {
    name: String,
    storage: S,
    layout: Partition,
    links: Vec<Link>,
    /// Wrap-around overlaps of the local leaf with itself
    self_link: Option<Link>,
    /// Group data collected before a commit, held by the group master
    snapshot: Option<S>,
}

impl<S: FieldStorage> HaloField<S> {
    /// Creates a zeroed field over the local halo region.
    pub fn new(name: &str, partition: &Partition) -> Result<Self> {
        let mut field = HaloField {
            name: name.to_string(),
            storage: S::with_bounds(partition.halo_region()),
            layout: partition.clone(),
            links: Vec::new(),
            self_link: None,
            snapshot: None,
        };
        field.reload(partition)?;
        Ok(field)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn local_region(&self) -> &Region {
        self.layout.local_region()
    }

    pub fn halo_region(&self) -> &Region {
        self.storage.bounds()
    }

    pub fn in_local(&self, point: &[Coord]) -> bool {
        self.local_region().contains(point)
    }

    pub fn in_halo(&self, point: &[Coord]) -> bool {
        self.halo_region().contains(point)
    }

    /// Re-derives bounds and neighbor links from the given layout. Cells
    /// still covered by the new bounds keep their values.
    pub fn reload(&mut self, partition: &Partition) -> Result<()> {
        self.layout = partition.clone();
        self.storage.reshape(partition.halo_region());
        self.links = partition
            .neighbors()
            .iter()
            .map(|n| overlaps(partition, *n))
            .collect::<Result<Vec<_>>>()?;
        let self_link = overlaps(partition, partition.pid())?;
        self.self_link = if self_link.send.is_empty() {
            None
        } else {
            Some(self_link)
        };
        trace!(
            "field {} on process {}: halo {}, {} links",
            self.name,
            partition.pid(),
            self.halo_region(),
            self.links.len()
        );
        Ok(())
    }

    /// Collective. Refreshes every ghost cell from its owner.
    pub fn sync(&mut self, comm: &mut dyn Communicator) -> Result<()> {
        if let Some(link) = &self.self_link {
            for (from, to) in link.send.iter().zip(&link.recv) {
                let bytes = self.storage.pack(from)?;
                self.storage.unpack(to, &bytes)?;
            }
        }
        let kind = self.storage.kind();
        let mut outgoing = Vec::with_capacity(self.links.len());
        for link in &self.links {
            let mut buf = header(kind);
            for region in &link.send {
                push_block(&mut buf, &self.storage.pack(region)?);
            }
            outgoing.push(buf);
        }
        let neighbors: Vec<Pid> = self.links.iter().map(|l| l.pid).collect();
        let incoming = comm.neighbor_exchange(&neighbors, outgoing)?;
        let size = self.storage.element_size() as usize;
        for (link, bytes) in self.links.iter().zip(incoming) {
            let body = check_header(kind, &bytes)?;
            let blocks = split_blocks(body, link.recv.len())?;
            for (region, block) in link.recv.iter().zip(blocks) {
                if size > 0 && block.len() != region.volume() as usize * size {
                    return Err(Error::SerializationError(format!(
                        "field {}: {} bytes from process {} for {}, expected {}",
                        self.name,
                        block.len(),
                        link.pid,
                        region,
                        region.volume() as usize * size
                    )));
                }
                self.storage.unpack(region, block)?;
            }
        }
        Ok(())
    }

    fn pack_local(&self) -> Result<Vec<u8>> {
        let mut buf = header(self.storage.kind());
        buf.extend(self.storage.pack(self.local_region())?);
        Ok(buf)
    }

    fn unpack_local(&mut self, bytes: &[u8]) -> Result<()> {
        let body = check_header(self.storage.kind(), bytes)?;
        let local = self.local_region().clone();
        self.storage.unpack(&local, body)
    }

    /// Gathers the local regions of `members` into storage covering
    /// `region` at `root`.
    fn collect_among(
        &self,
        members: &[Pid],
        root: Pid,
        region: Region,
        comm: &mut dyn Communicator,
    ) -> Result<Option<S>> {
        let gathered = comm.gather_among(members, root, self.pack_local()?)?;
        let parts = match gathered {
            Some(parts) => parts,
            None => return Ok(None),
        };
        let mut out = S::with_bounds(region);
        for (member, bytes) in members.iter().zip(parts) {
            let body = check_header(out.kind(), &bytes)?;
            out.unpack(self.layout.tree().leaf_region(*member)?, body)?;
        }
        Ok(Some(out))
    }

    /// Scatters the local regions of `members` out of `data` held by `root`.
    fn distribute_among(
        &mut self,
        members: &[Pid],
        root: Pid,
        data: Option<&S>,
        comm: &mut dyn Communicator,
    ) -> Result<()> {
        let parts = match data {
            Some(data) if comm.rank() == root => {
                let mut parts = Vec::with_capacity(members.len());
                for member in members {
                    let mut buf = header(data.kind());
                    buf.extend(data.pack(self.layout.tree().leaf_region(*member)?)?);
                    parts.push(buf);
                }
                Some(parts)
            }
            _ => None,
        };
        let mine = comm.scatter_among(members, root, parts)?;
        self.unpack_local(&mine)
    }

    /// Collective. Assembles the whole field, without ghost cells, at
    /// `root`. Returns `None` everywhere else.
    pub fn collect(&self, root: Pid, comm: &mut dyn Communicator) -> Result<Option<S>> {
        let all = comm.everyone();
        let domain = self.layout.domain().clone();
        self.collect_among(&all, root, domain, comm)
    }

    /// Collective. Inverse of `collect`: `root` passes the whole field,
    /// every process takes its own region and the halos are synced.
    pub fn distribute(
        &mut self,
        root: Pid,
        full: Option<&S>,
        comm: &mut dyn Communicator,
    ) -> Result<()> {
        let all = comm.everyone();
        self.distribute_among(&all, root, full, comm)?;
        self.sync(comm)
    }

    /// Members, master and region of the group at `level`. A process whose
    /// leaf isn't deeper than `level` forms a group of its own.
    fn group_scope(&self, level: usize) -> (Vec<Pid>, Pid, Region) {
        match self.layout.group_at(level) {
            Some(group) => (group.members.clone(), group.master(), group.region.clone()),
            None => (
                vec![self.layout.pid()],
                self.layout.pid(),
                self.local_region().clone(),
            ),
        }
    }

    /// Collective over every process. Assembles the region of each group
    /// at `level` at that group's master.
    pub fn collect_group(&self, level: usize, comm: &mut dyn Communicator) -> Result<Option<S>> {
        let (members, master, region) = self.group_scope(level);
        self.collect_among(&members, master, region, comm)
    }

    /// Collective over every process. Inverse of `collect_group`, followed
    /// by a halo sync.
    pub fn distribute_group(
        &mut self,
        level: usize,
        data: Option<&S>,
        comm: &mut dyn Communicator,
    ) -> Result<()> {
        let (members, master, _) = self.group_scope(level);
        self.distribute_among(&members, master, data, comm)?;
        self.sync(comm)
    }

    /// Copy of the local region for inspection.
    pub fn image(&self) -> Result<FieldImage> {
        Ok(FieldImage {
            name: self.name.clone(),
            kind: self.storage.kind(),
            region: self.local_region().clone(),
            bytes: self.storage.pack(self.local_region())?,
        })
    }
}

impl<T: Element> HaloField<GridStorage<T>> {
    /// Value at a point of the local halo region.
    pub fn get(&self, point: &[Coord]) -> Option<T> {
        self.storage.get(point)
    }

    /// Sets a value anywhere in the halo region. Ghost cells are
    /// overwritten by the next sync.
    pub fn set(&mut self, point: &[Coord], value: T) -> Result<()> {
        self.storage.set(point, value)
    }

    /// Sets every local cell to the result of `f`.
    pub fn fill_local<F: FnMut(&[Coord]) -> T>(&mut self, f: F) -> Result<()> {
        let local = self.local_region().clone();
        self.storage.fill_with(&local, f)
    }
}

impl<S: FieldStorage> CommitHook for HaloField<S> {
    fn before_commit(
        &mut self,
        level: usize,
        _: &Partition,
        comm: &mut dyn Communicator,
    ) -> Result<()> {
        self.snapshot = self.collect_group(level, comm)?;
        Ok(())
    }

    fn after_commit(
        &mut self,
        level: usize,
        partition: &Partition,
        comm: &mut dyn Communicator,
    ) -> Result<()> {
        self.reload(partition)?;
        let snapshot = self.snapshot.take();
        self.distribute_group(level, snapshot.as_ref(), comm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::local::LocalCluster;
    use crate::tree::PartitionTree;

    fn partition(comm: &mut dyn Communicator, toroidal: bool) -> Result<Partition> {
        let domain = Region::with_extent(&[8, 8])?;
        let tree = PartitionTree::uniform(domain, 1, 4)?;
        Partition::new(tree, 1, toroidal, comm)
    }

    fn value_at(p: &[Coord]) -> f64 {
        (p[0] * 100 + p[1]) as f64
    }

    #[test]
    fn ghost_cells_match_owners() {
        for toroidal in &[false, true] {
            let toroidal = *toroidal;
            let results = LocalCluster::run(4, move |mut comm| {
                let p = partition(&mut comm, toroidal)?;
                let mut field: HaloField = HaloField::new("heat", &p)?;
                field.fill_local(value_at)?;
                field.sync(&mut comm)?;
                let domain = p.domain().clone();
                let mut checked = 0;
                for point in field.halo_region().points() {
                    if field.in_local(&point) {
                        continue;
                    }
                    let wrapped = crate::geom::wrap_point(&point, &domain);
                    if domain.contains(&point) || toroidal {
                        assert_eq!(field.get(&point), Some(value_at(&wrapped)));
                        checked += 1;
                    } else {
                        assert_eq!(field.get(&point), Some(0.));
                    }
                }
                Ok(checked)
            });
            for r in results {
                let checked = r.unwrap();
                // 6x6 halo around a 4x4 leaf
                assert_eq!(checked, if toroidal { 20 } else { 9 });
            }
        }
    }

    #[test]
    fn self_wrap_is_copied_locally() {
        let results = LocalCluster::run(1, |mut comm| {
            let tree = PartitionTree::new(Region::with_extent(&[5])?)?;
            let p = Partition::new(tree, 2, true, &mut comm)?;
            let mut field: HaloField<GridStorage<i32>> = HaloField::new("ring", &p)?;
            field.fill_local(|p| p[0] as i32 + 1)?;
            field.sync(&mut comm)?;
            Ok((field.get(&[-2]), field.get(&[-1]), field.get(&[5]), field.get(&[6])))
        });
        assert_eq!(
            results.into_iter().next().unwrap().unwrap(),
            (Some(4), Some(5), Some(1), Some(2))
        );
    }

    #[test]
    fn collect_distribute_round_trip() {
        let results = LocalCluster::run(4, |mut comm| {
            let p = partition(&mut comm, false)?;
            let mut field: HaloField = HaloField::new("heat", &p)?;
            field.fill_local(value_at)?;
            let full = field.collect(2, &mut comm)?;
            if let Some(full) = &full {
                for point in p.domain().points() {
                    assert_eq!(full.get(&point), Some(value_at(&point)));
                }
            }
            let had_full = full.is_some();
            let mut copy: HaloField = HaloField::new("copy", &p)?;
            copy.distribute(2, full.as_ref(), &mut comm)?;
            field.sync(&mut comm)?;
            assert_eq!(copy.storage().data(), field.storage().data());
            Ok(had_full)
        });
        let roots: Vec<bool> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(roots, vec![false, false, true, false]);
    }

    #[test]
    fn objects_are_mirrored_into_ghost_cells() {
        for toroidal in &[false, true] {
            let toroidal = *toroidal;
            let results = LocalCluster::run(4, move |mut comm| {
                let p = partition(&mut comm, toroidal)?;
                let mut field: HaloField<ContinuousStorage<Vec<Coord>>> =
                    HaloField::new("agents", &p)?;
                for point in p.local_region().points() {
                    let location = point.iter().map(|c| *c as f64 + 0.5).collect();
                    field.storage_mut().insert(location, point.clone())?;
                }
                field.sync(&mut comm)?;
                // a second sync replaces ghost objects instead of piling them up
                field.sync(&mut comm)?;
                let domain = p.domain().clone();
                for point in field.halo_region().points() {
                    let cell = field.storage().cell(&point);
                    if domain.contains(&point) || toroidal {
                        assert_eq!(cell.len(), 1, "at {:?}", point);
                        let expected: Vec<f64> = point.iter().map(|c| *c as f64 + 0.5).collect();
                        assert_eq!(cell[0].location, expected);
                        assert_eq!(cell[0].value, crate::geom::wrap_point(&point, &domain));
                    } else {
                        assert!(cell.is_empty());
                    }
                }
                Ok(field.storage().len())
            });
            for r in results {
                assert_eq!(r.unwrap(), if toroidal { 36 } else { 25 });
            }
        }
    }

    #[test]
    fn truncated_payload_is_rejected() {
        assert!(split_blocks(&[2, 0, 0, 0, 0, 0, 0, 0, 9], 1).is_err());
        assert!(split_blocks(&[1, 0, 0, 0, 0, 0, 0, 0, 9, 9], 1).is_err());
        assert_eq!(
            split_blocks(&[1, 0, 0, 0, 0, 0, 0, 0, 9], 1).unwrap(),
            vec![&[9u8][..]]
        );
    }

    #[test]
    fn element_type_mismatch_is_detected() {
        let results = LocalCluster::run(4, |mut comm| {
            let p = partition(&mut comm, false)?;
            if comm.rank() == 0 {
                let mut field: HaloField<GridStorage<f32>> = HaloField::new("x", &p)?;
                field.sync(&mut comm)
            } else {
                let mut field: HaloField<GridStorage<f64>> = HaloField::new("x", &p)?;
                field.sync(&mut comm)
            }
        });
        for r in results {
            match r {
                Err(Error::TypeMismatch { .. }) => (),
                other => panic!("unexpected: {:?}", other),
            }
        }
    }
}
