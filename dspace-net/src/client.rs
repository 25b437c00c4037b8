//! Blocking client for the query protocol.

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use dspace_core::query::{FieldImage, SnapshotInfo};
use dspace_core::{Coord, Pid, RemoteQuery};

use crate::error::{Error, Result};
use crate::msg::{
    request, FetchLeafStorageRequest, FetchLeafStorageResponse, LockSnapshotRequest,
    LockSnapshotResponse, PointToOwnerRequest, PointToOwnerResponse, UnlockSnapshotRequest,
    UnlockSnapshotResponse,
};

/// Connection to a `QueryServer`.
///
/// Implements `RemoteQuery` itself, so tools can be written against the
/// trait and work the same way in-process and over the network.
pub struct QueryClient {
    stream: Mutex<TcpStream>,
    /// Ask for compressed leaf storage
    pub compress: bool,
}

impl QueryClient {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(QueryClient {
            stream: Mutex::new(stream),
            compress: cfg!(feature = "lz4"),
        })
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        let stream = self.stream()?;
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;
        Ok(())
    }

    fn stream(&self) -> Result<MutexGuard<'_, TcpStream>> {
        self.stream
            .lock()
            .map_err(|e| Error::Other(format!("client stream poisoned: {}", e)))
    }

    pub fn lock(&self) -> Result<SnapshotInfo> {
        let resp: LockSnapshotResponse = request(&mut *self.stream()?, &LockSnapshotRequest {})?;
        Ok(resp.info)
    }

    pub fn unlock(&self) -> Result<()> {
        let _: UnlockSnapshotResponse =
            request(&mut *self.stream()?, &UnlockSnapshotRequest {})?;
        Ok(())
    }

    pub fn owner(&self, coord: &[Coord]) -> Result<Pid> {
        let resp: PointToOwnerResponse = request(
            &mut *self.stream()?,
            &PointToOwnerRequest {
                coord: coord.to_vec(),
            },
        )?;
        Ok(resp.owner)
    }

    pub fn leaf_storage(&self, leaf: Pid) -> Result<Vec<FieldImage>> {
        let resp: FetchLeafStorageResponse = request(
            &mut *self.stream()?,
            &FetchLeafStorageRequest {
                leaf,
                compress: self.compress,
            },
        )?;
        if resp.leaf != leaf {
            return Err(Error::Other(format!(
                "asked for leaf {}, got {}",
                leaf, resp.leaf
            )));
        }
        Ok(resp.images)
    }
}

impl RemoteQuery for QueryClient {
    fn lock_snapshot(&self) -> dspace_core::Result<SnapshotInfo> {
        Ok(self.lock()?)
    }

    fn unlock_snapshot(&self) -> dspace_core::Result<()> {
        Ok(self.unlock()?)
    }

    fn point_to_owner(&self, coord: &[Coord]) -> dspace_core::Result<Pid> {
        Ok(self.owner(coord)?)
    }

    fn fetch_leaf_storage(&self, leaf: Pid) -> dspace_core::Result<Vec<FieldImage>> {
        Ok(self.leaf_storage(leaf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::QueryServer;
    use dspace_core::halo::ElementKind;
    use dspace_core::{Inspector, PartitionTree, Region};
    use fnv::FnvHashMap;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn published() -> Arc<Inspector> {
        let inspector = Arc::new(Inspector::new());
        let tree = PartitionTree::uniform(Region::with_extent(&[8, 8]).unwrap(), 1, 4).unwrap();
        let mut leaves = FnvHashMap::default();
        for pid in 0..4 {
            let region = tree.leaf_region(pid).unwrap().clone();
            leaves.insert(
                pid,
                vec![FieldImage {
                    name: "heat".to_string(),
                    kind: ElementKind::U8,
                    bytes: vec![pid as u8; region.volume() as usize],
                    region,
                }],
            );
        }
        inspector.publish(&tree, leaves).unwrap();
        inspector
    }

    #[test]
    fn queries_round_trip() {
        let inspector = published();
        let server = QueryServer::bind("127.0.0.1:0", inspector.clone()).unwrap();
        let addr = server.local_addr().unwrap();
        let running = server.running();
        let handle = server.spawn();

        let client = QueryClient::connect(addr).unwrap();
        let info = client.lock_snapshot().unwrap();
        assert_eq!(info.version, 1);
        assert_eq!(info.leaves, 4);
        assert_eq!(client.point_to_owner(&[7, 0]).unwrap(), 2);

        let images = client.fetch_leaf_storage(3).unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].bytes, vec![3u8; 16]);

        // errors from the target travel back as remote errors
        assert!(client.point_to_owner(&[8, 8]).is_err());
        assert!(client.fetch_leaf_storage(9).is_err());
        client.unlock_snapshot().unwrap();

        running.store(false, Ordering::SeqCst);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn only_the_holder_can_unlock() {
        let inspector = published();
        let server = QueryServer::bind("127.0.0.1:0", inspector.clone()).unwrap();
        let addr = server.local_addr().unwrap();
        let running = server.running();
        let handle = server.spawn();

        let holder = QueryClient::connect(addr).unwrap();
        let other = QueryClient::connect(addr).unwrap();
        holder.lock().unwrap();
        assert!(other.lock().is_err());
        match other.unlock() {
            Err(Error::Remote(_)) => (),
            r => panic!("unexpected: {:?}", r),
        }
        // the holder's lock is still in place
        assert!(inspector.lock_snapshot().is_err());
        holder.unlock().unwrap();
        inspector.lock_snapshot().unwrap();
        inspector.unlock_snapshot().unwrap();

        running.store(false, Ordering::SeqCst);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn disconnect_releases_lock() {
        let inspector = published();
        let server = QueryServer::bind("127.0.0.1:0", inspector.clone()).unwrap();
        let addr = server.local_addr().unwrap();
        let running = server.running();
        let handle = server.spawn();

        {
            let client = QueryClient::connect(addr).unwrap();
            client.lock().unwrap();
        }
        // publish blocks until the dropped client's lock is released
        inspector
            .publish(
                &PartitionTree::uniform(Region::with_extent(&[8, 8]).unwrap(), 1, 4).unwrap(),
                FnvHashMap::default(),
            )
            .unwrap();
        assert_eq!(inspector.version().unwrap(), 2);

        running.store(false, Ordering::SeqCst);
        handle.join().unwrap().unwrap();
    }
}
