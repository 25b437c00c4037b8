//! Server exposing a `RemoteQuery` implementation over TCP.

use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use dspace_core::RemoteQuery;

use crate::error::{Error, Result};
use crate::msg::{
    read_message, write_message, ErrorResponse, FetchLeafStorageRequest,
    FetchLeafStorageResponse, LockSnapshotResponse, Message, MessageType, PointToOwnerRequest,
    PointToOwnerResponse, UnlockSnapshotResponse,
};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Serves queries against a shared query target, one thread per client.
///
/// Only the client holding the snapshot lock may release it. A client that
/// disconnects while holding the lock has it released on its behalf.
pub struct QueryServer<Q: RemoteQuery + Send + Sync + 'static> {
    listener: TcpListener,
    target: Arc<Q>,
    running: Arc<AtomicBool>,
}

impl<Q: RemoteQuery + Send + Sync + 'static> QueryServer<Q> {
    pub fn bind<A: ToSocketAddrs>(addr: A, target: Arc<Q>) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(QueryServer {
            listener,
            target,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Flag which stops the accept loop once set to `false`.
    pub fn running(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Accepts clients until the running flag is cleared.
    pub fn serve(self) -> Result<()> {
        info!("query server listening on {}", self.local_addr()?);
        while self.running.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    debug!("query client connected: {}", addr);
                    stream.set_nonblocking(false)?;
                    let target = self.target.clone();
                    thread::spawn(move || {
                        if let Err(e) = handle_client(stream, target.as_ref()) {
                            warn!("query client {}: {}", addr, e);
                        }
                        debug!("query client disconnected: {}", addr);
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL)
                }
                Err(e) => return Err(e.into()),
            }
        }
        info!("query server shutting down");
        Ok(())
    }

    /// Runs `serve` on a background thread.
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        thread::spawn(move || self.serve())
    }
}

fn handle_client<Q: RemoteQuery>(mut stream: TcpStream, target: &Q) -> Result<()> {
    let mut holding_lock = false;
    let result = loop {
        let msg = match read_message(&mut stream) {
            Ok(m) => m,
            Err(Error::Disconnect(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break Ok(())
            }
            Err(e) => break Err(e),
        };
        let response = match respond(&msg, target, &mut holding_lock) {
            Ok(r) => r,
            Err(Error::CoreError(e)) => Message::from_payload(
                &ErrorResponse {
                    error: e.to_string(),
                },
                false,
            )?,
            Err(e) => break Err(e),
        };
        if let Err(e) = write_message(&mut stream, &response) {
            break Err(e);
        }
    };
    if holding_lock {
        target.unlock_snapshot()?;
    }
    result
}

fn respond<Q: RemoteQuery>(msg: &Message, target: &Q, holding_lock: &mut bool) -> Result<Message> {
    match msg.kind {
        MessageType::LockSnapshotRequest => {
            let info = target.lock_snapshot()?;
            *holding_lock = true;
            Message::from_payload(&LockSnapshotResponse { info }, false)
        }
        MessageType::UnlockSnapshotRequest => {
            if !*holding_lock {
                return Err(dspace_core::Error::Other(
                    "snapshot lock is not held by this client".to_string(),
                )
                .into());
            }
            target.unlock_snapshot()?;
            *holding_lock = false;
            Message::from_payload(&UnlockSnapshotResponse {}, false)
        }
        MessageType::PointToOwnerRequest => {
            let req: PointToOwnerRequest = msg.unpack_payload()?;
            let owner = target.point_to_owner(&req.coord)?;
            Message::from_payload(&PointToOwnerResponse { owner }, false)
        }
        MessageType::FetchLeafStorageRequest => {
            let req: FetchLeafStorageRequest = msg.unpack_payload()?;
            let images = target.fetch_leaf_storage(req.leaf)?;
            Message::from_payload(
                &FetchLeafStorageResponse {
                    leaf: req.leaf,
                    images,
                },
                req.compress,
            )
        }
        kind => Err(Error::UnexpectedMessage(kind)),
    }
}
