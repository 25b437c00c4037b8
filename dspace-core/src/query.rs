//! Read-only inspection surface.
//!
//! The [`Inspector`] keeps the most recently published partition tree and
//! per-leaf field images. Readers bracket their queries with
//! `lock_snapshot` and `unlock_snapshot`; while the snapshot is locked
//! publishing blocks, so every read in between observes the same state.
//!
//! [`Inspector`]: struct.Inspector.html

use std::sync::{Condvar, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use fnv::FnvHashMap;

use crate::comm::Communicator;
use crate::error::{Error, Result};
use crate::geom::Region;
use crate::halo::ElementKind;
use crate::partition::Partition;
use crate::tree::PartitionTree;
use crate::{Coord, Pid};

/// Local region of a single field, packed row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldImage {
    pub name: String,
    pub kind: ElementKind,
    pub region: Region,
    #[serde(with = "serde_bytes")]
    pub bytes: Vec<u8>,
}

/// Description of the snapshot held by a reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Number of publishes so far
    pub version: u64,
    pub published: Option<DateTime<Utc>>,
    pub domain: Option<Region>,
    pub leaves: usize,
}

/// Queries served to remote debugging and visualization tools.
pub trait RemoteQuery {
    fn lock_snapshot(&self) -> Result<SnapshotInfo>;
    fn unlock_snapshot(&self) -> Result<()>;
    /// Process owning the cell at `coord`.
    fn point_to_owner(&self, coord: &[Coord]) -> Result<Pid>;
    /// Every field image of the given leaf.
    fn fetch_leaf_storage(&self, leaf: Pid) -> Result<Vec<FieldImage>>;
}

#[derive(Debug, Default)]
struct State {
    locked: bool,
    version: u64,
    published: Option<DateTime<Utc>>,
    tree: Option<PartitionTree>,
    leaves: FnvHashMap<Pid, Vec<FieldImage>>,
}

/// In-memory implementation of `RemoteQuery`, shared between the
/// publishing simulation and query servers.
#[derive(Debug, Default)]
pub struct Inspector {
    state: Mutex<State>,
    unlocked: Condvar,
}

impl Inspector {
    pub fn new() -> Self {
        Inspector::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|e| Error::Other(format!("inspector state poisoned: {}", e)))
    }

    /// Replaces the published state, waiting for any reader holding the
    /// snapshot lock to release it first.
    pub fn publish(
        &self,
        tree: &PartitionTree,
        leaves: FnvHashMap<Pid, Vec<FieldImage>>,
    ) -> Result<()> {
        let mut state = self.state()?;
        while state.locked {
            state = self
                .unlocked
                .wait(state)
                .map_err(|e| Error::Other(format!("inspector state poisoned: {}", e)))?;
        }
        state.tree = Some(tree.clone());
        state.leaves = leaves;
        state.version += 1;
        state.published = Some(Utc::now());
        Ok(())
    }

    /// Current publish count.
    pub fn version(&self) -> Result<u64> {
        Ok(self.state()?.version)
    }
}

impl RemoteQuery for Inspector {
    fn lock_snapshot(&self) -> Result<SnapshotInfo> {
        let mut state = self.state()?;
        if state.locked {
            return Err(Error::Other("snapshot is already locked".to_string()));
        }
        state.locked = true;
        Ok(SnapshotInfo {
            version: state.version,
            published: state.published,
            domain: state.tree.as_ref().map(|t| t.domain().clone()),
            leaves: state.tree.as_ref().map(|t| t.leaf_count()).unwrap_or(0),
        })
    }

    fn unlock_snapshot(&self) -> Result<()> {
        let mut state = self.state()?;
        state.locked = false;
        self.unlocked.notify_all();
        Ok(())
    }

    fn point_to_owner(&self, coord: &[Coord]) -> Result<Pid> {
        let state = self.state()?;
        match &state.tree {
            Some(tree) => tree.owner_at(coord),
            None => Err(Error::Other("nothing published yet".to_string())),
        }
    }

    fn fetch_leaf_storage(&self, leaf: Pid) -> Result<Vec<FieldImage>> {
        let state = self.state()?;
        if let Some(tree) = &state.tree {
            if leaf >= tree.leaf_count() {
                return Err(Error::NoSuchProcess(leaf));
            }
        }
        Ok(state.leaves.get(&leaf).cloned().unwrap_or_default())
    }
}

/// Collective. Gathers the field images of every process at `root`, which
/// publishes them together with its tree. Only the root needs an
/// inspector.
pub fn publish_collective(
    inspector: Option<&Inspector>,
    root: Pid,
    partition: &Partition,
    images: &[FieldImage],
    comm: &mut dyn Communicator,
) -> Result<()> {
    let all = comm.everyone();
    let gathered = comm.gather_among(&all, root, bincode::serialize(images)?)?;
    if let (Some(parts), Some(inspector)) = (gathered, inspector) {
        let mut leaves = FnvHashMap::default();
        for (pid, bytes) in parts.into_iter().enumerate() {
            let images: Vec<FieldImage> = bincode::deserialize(&bytes)?;
            leaves.insert(pid, images);
        }
        inspector.publish(partition.tree(), leaves)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn tree() -> PartitionTree {
        PartitionTree::uniform(Region::with_extent(&[10, 10]).unwrap(), 1, 4).unwrap()
    }

    #[test]
    fn queries_before_and_after_publish() {
        let inspector = Inspector::new();
        assert!(inspector.point_to_owner(&[1, 1]).is_err());
        let mut leaves = FnvHashMap::default();
        leaves.insert(
            3,
            vec![FieldImage {
                name: "heat".to_string(),
                kind: ElementKind::U8,
                region: Region::new(vec![5, 5], vec![10, 10]).unwrap(),
                bytes: vec![1; 25],
            }],
        );
        inspector.publish(&tree(), leaves).unwrap();
        assert_eq!(inspector.point_to_owner(&[9, 9]).unwrap(), 3);
        assert_eq!(inspector.fetch_leaf_storage(3).unwrap()[0].bytes.len(), 25);
        assert!(inspector.fetch_leaf_storage(0).unwrap().is_empty());
        assert!(inspector.fetch_leaf_storage(4).is_err());
    }

    #[test]
    fn lock_blocks_publish() {
        let inspector = Arc::new(Inspector::new());
        let info = inspector.lock_snapshot().unwrap();
        assert_eq!(info.version, 0);
        assert!(inspector.lock_snapshot().is_err());

        let publisher = {
            let inspector = inspector.clone();
            thread::spawn(move || inspector.publish(&tree(), FnvHashMap::default()))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(inspector.version().unwrap(), 0);

        inspector.unlock_snapshot().unwrap();
        publisher.join().unwrap().unwrap();
        assert_eq!(inspector.version().unwrap(), 1);
        let info = inspector.lock_snapshot().unwrap();
        assert_eq!(info.leaves, 4);
        assert!(info.published.is_some());
    }
}
