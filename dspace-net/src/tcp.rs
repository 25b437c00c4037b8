//! `Communicator` implementation over a full mesh of TCP connections.
//!
//! Every participant listens on its own address. During setup a participant
//! connects to all lower ranks and accepts connections from all higher
//! ranks, announcing its rank as the first four bytes on every new
//! connection. Each incoming stream gets a reader thread pushing complete
//! frames into a channel, so `send` never waits on the receiver.
//!
//! Frame layout:
//!
//! ```text
//! | tag: u8 | length: u32 LE | bytes |
//! ```

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use dspace_core::{Communicator, Pid, Tag};

use crate::error::{Error, Result};

const FRAME_HEADER_SIZE: usize = 5;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(60);

type Frame = (u8, Vec<u8>);

/// Settings for establishing and using the mesh.
#[derive(Debug, Clone)]
pub struct TcpCommConfig {
    /// How long to keep retrying connections to peers that aren't up yet
    pub connect_timeout: Duration,
    /// How long a single `recv` may wait before failing
    pub recv_timeout: Duration,
}

impl Default for TcpCommConfig {
    fn default() -> Self {
        TcpCommConfig {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
        }
    }
}

struct Peer {
    stream: TcpStream,
    inbox: Receiver<Frame>,
    reader: Option<JoinHandle<()>>,
}

/// Participant of a TCP mesh.
pub struct TcpComm {
    rank: Pid,
    size: usize,
    /// Indexed by rank, `None` at our own position
    peers: Vec<Option<Peer>>,
    loopback: (Sender<Frame>, Receiver<Frame>),
    config: TcpCommConfig,
}

impl TcpComm {
    /// Binds to `addrs[rank]` and connects to every other address.
    pub fn connect(rank: Pid, addrs: &[SocketAddr], config: TcpCommConfig) -> Result<Self> {
        let addr = addrs
            .get(rank)
            .ok_or_else(|| Error::Other(format!("no address for rank {}", rank)))?;
        let listener = TcpListener::bind(addr)?;
        Self::with_listener(rank, listener, addrs, config)
    }

    /// Same as `connect` but uses an already bound listener. The entry at
    /// `addrs[rank]` is ignored.
    pub fn with_listener(
        rank: Pid,
        listener: TcpListener,
        addrs: &[SocketAddr],
        config: TcpCommConfig,
    ) -> Result<Self> {
        let size = addrs.len();
        if rank >= size {
            return Err(Error::Other(format!(
                "rank {} out of range for {} participants",
                rank, size
            )));
        }
        let mut streams: Vec<Option<TcpStream>> = (0..size).map(|_| None).collect();

        for (peer, addr) in addrs.iter().enumerate().take(rank) {
            let mut stream = connect_with_retry(addr, config.connect_timeout)?;
            let mut hello = [0u8; 4];
            LittleEndian::write_u32(&mut hello, rank as u32);
            stream.write_all(&hello)?;
            debug!("rank {}: connected to rank {} at {}", rank, peer, addr);
            streams[peer] = Some(stream);
        }

        for _ in rank + 1..size {
            let (mut stream, from) = listener.accept()?;
            stream.set_read_timeout(Some(config.connect_timeout))?;
            let mut hello = [0u8; 4];
            stream.read_exact(&mut hello)?;
            stream.set_read_timeout(None)?;
            let peer = LittleEndian::read_u32(&hello) as usize;
            if peer <= rank || peer >= size || streams[peer].is_some() {
                return Err(Error::HandshakeFailed(format!(
                    "unexpected rank {} from {}",
                    peer, from
                )));
            }
            debug!("rank {}: accepted rank {} from {}", rank, peer, from);
            streams[peer] = Some(stream);
        }

        let mut peers = Vec::with_capacity(size);
        for (peer, stream) in streams.into_iter().enumerate() {
            let stream = match stream {
                Some(s) => s,
                None => {
                    peers.push(None);
                    continue;
                }
            };
            stream.set_nodelay(true)?;
            let (sender, inbox) = unbounded();
            let read_stream = stream.try_clone()?;
            let reader = thread::Builder::new()
                .name(format!("dspace-tcp-{}-{}", rank, peer))
                .spawn(move || read_frames(read_stream, sender, peer))?;
            peers.push(Some(Peer {
                stream,
                inbox,
                reader: Some(reader),
            }));
        }
        info!("rank {}: mesh of {} participants established", rank, size);

        Ok(TcpComm {
            rank,
            size,
            peers,
            loopback: unbounded(),
            config,
        })
    }

    fn peer(&mut self, pid: Pid) -> Result<&mut Peer> {
        self.peers
            .get_mut(pid)
            .and_then(|p| p.as_mut())
            .ok_or_else(|| Error::Other(format!("no connection to {}", pid)))
    }
}

impl Communicator for TcpComm {
    fn rank(&self) -> Pid {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send(&mut self, to: Pid, tag: Tag, bytes: Vec<u8>) -> dspace_core::Result<()> {
        if to >= self.size {
            return Err(dspace_core::Error::NoSuchProcess(to));
        }
        if to == self.rank {
            return self
                .loopback
                .0
                .send((tag as u8, bytes))
                .map_err(|e| dspace_core::Error::CommError(e.to_string()));
        }
        let peer = self.peer(to)?;
        let mut header = [0u8; FRAME_HEADER_SIZE];
        header[0] = tag as u8;
        LittleEndian::write_u32(&mut header[1..], bytes.len() as u32);
        peer.stream
            .write_all(&header)
            .and_then(|_| peer.stream.write_all(&bytes))
            .map_err(|e| Error::from(e))?;
        Ok(())
    }

    fn recv(&mut self, from: Pid, tag: Tag) -> dspace_core::Result<Vec<u8>> {
        if from >= self.size {
            return Err(dspace_core::Error::NoSuchProcess(from));
        }
        let timeout = self.config.recv_timeout;
        let rank = self.rank;
        let received = if from == rank {
            self.loopback.1.recv_timeout(timeout)
        } else {
            self.peer(from)?.inbox.recv_timeout(timeout)
        };
        let (code, bytes) = match received {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => return Err(Error::TimedOut.into()),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(Error::PeerDisconnected(from).into())
            }
        };
        if code != tag as u8 {
            return Err(dspace_core::Error::TopologyMismatch(format!(
                "rank {} expected {:?} from {}, got {:?}",
                rank,
                tag,
                from,
                Tag::from_u8(code)
            )));
        }
        Ok(bytes)
    }
}

impl Drop for TcpComm {
    fn drop(&mut self) {
        for peer in self.peers.iter_mut().filter_map(|p| p.as_mut()) {
            let _ = peer.stream.shutdown(Shutdown::Both);
            if let Some(reader) = peer.reader.take() {
                let _ = reader.join();
            }
        }
    }
}

fn connect_with_retry(addr: &SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let deadline = Instant::now() + timeout;
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                if Instant::now() >= deadline {
                    return Err(Error::HostUnreachable(format!("{}: {}", addr, e)));
                }
                trace!("connection to {} failed ({}), retrying", addr, e);
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

/// Reads frames until the stream is closed. Dropping the sender on exit
/// marks the peer as disconnected for the receiving side.
fn read_frames(mut stream: TcpStream, sender: Sender<Frame>, peer: Pid) {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    loop {
        if let Err(e) = stream.read_exact(&mut header) {
            trace!("reader for peer {} exiting: {}", peer, e);
            return;
        }
        let len = LittleEndian::read_u32(&header[1..]) as usize;
        let mut bytes = vec![0u8; len];
        if let Err(e) = stream.read_exact(&mut bytes) {
            warn!("peer {} closed mid-frame: {}", peer, e);
            return;
        }
        if sender.send((header[0], bytes)).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dspace_core::comm::all_gather_value;

    /// Runs `f` on `size` threads, each with its own mesh participant.
    fn run_mesh<T, F>(size: usize, f: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Fn(TcpComm) -> T + Send + Sync + Clone + 'static,
    {
        let listeners: Vec<TcpListener> = (0..size)
            .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        let addrs: Vec<SocketAddr> = listeners.iter().map(|l| l.local_addr().unwrap()).collect();
        let handles: Vec<_> = listeners
            .into_iter()
            .enumerate()
            .map(|(rank, listener)| {
                let addrs = addrs.clone();
                let f = f.clone();
                thread::spawn(move || {
                    let comm =
                        TcpComm::with_listener(rank, listener, &addrs, TcpCommConfig::default())
                            .unwrap();
                    f(comm)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn all_gather_over_mesh() {
        let results = run_mesh(3, |mut comm| {
            let rank = comm.rank();
            let all = all_gather_value(&mut comm, &(rank * 10)).unwrap();
            comm.barrier().unwrap();
            all
        });
        for all in results {
            assert_eq!(all, vec![0, 10, 20]);
        }
    }

    #[test]
    fn neighbor_exchange_over_mesh() {
        let results = run_mesh(3, |mut comm| {
            let rank = comm.rank();
            let neighbors: Vec<Pid> = (0..3).filter(|p| *p != rank).collect();
            let outgoing = neighbors
                .iter()
                .map(|n| vec![rank as u8; *n + 1])
                .collect();
            comm.neighbor_exchange(&neighbors, outgoing).unwrap()
        });
        assert_eq!(results[0], vec![vec![1u8], vec![2u8]]);
        assert_eq!(results[1], vec![vec![0u8, 0], vec![2u8, 2]]);
        assert_eq!(results[2], vec![vec![0u8, 0, 0], vec![1u8, 1, 1]]);
    }

    #[test]
    fn mismatched_tag_is_reported() {
        let results = run_mesh(2, |mut comm| {
            if comm.rank() == 0 {
                comm.send(1, Tag::Gather, vec![1]).unwrap();
                None
            } else {
                Some(comm.recv(0, Tag::Scatter))
            }
        });
        match &results[1] {
            Some(Err(dspace_core::Error::TopologyMismatch(_))) => (),
            other => panic!("expected topology mismatch, got {:?}", other),
        }
    }

    #[test]
    fn loopback_send() {
        let results = run_mesh(1, |mut comm| {
            comm.send(0, Tag::Broadcast, vec![7, 7]).unwrap();
            comm.recv(0, Tag::Broadcast).unwrap()
        });
        assert_eq!(results[0], vec![7, 7]);
    }
}
