//! In-process communicator running every participant on its own thread.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::comm::{Communicator, Tag};
use crate::error::{Error, Result};
use crate::Pid;

/// Default time a participant waits for a single message before giving up.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(60);

struct Envelope {
    tag: Tag,
    bytes: Vec<u8>,
}

/// Participant handle backed by in-memory channels.
///
/// There is one channel per ordered pair of participants, which gives the
/// per-pair ordering guarantee required by `Communicator`.
pub struct LocalComm {
    rank: Pid,
    /// `outbox[to]` delivers to participant `to`
    outbox: Vec<Sender<Envelope>>,
    /// `inbox[from]` holds messages sent by participant `from`
    inbox: Vec<Receiver<Envelope>>,
    timeout: Duration,
}

impl LocalComm {
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> Pid {
        self.rank
    }

    fn size(&self) -> usize {
        self.outbox.len()
    }

    fn send(&mut self, to: Pid, tag: Tag, bytes: Vec<u8>) -> Result<()> {
        let sender = self.outbox.get(to).ok_or(Error::NoSuchProcess(to))?;
        sender
            .send(Envelope { tag, bytes })
            .map_err(|_| Error::CommError(format!("process {} is gone", to)))
    }

    fn recv(&mut self, from: Pid, tag: Tag) -> Result<Vec<u8>> {
        let receiver = self.inbox.get(from).ok_or(Error::NoSuchProcess(from))?;
        match receiver.recv_timeout(self.timeout) {
            Ok(env) => {
                if env.tag != tag {
                    return Err(Error::TopologyMismatch(format!(
                        "process {} expected {:?} from {}, got {:?}",
                        self.rank, tag, from, env.tag
                    )));
                }
                Ok(env.bytes)
            }
            Err(RecvTimeoutError::Timeout) => Err(Error::CommError(format!(
                "process {} timed out waiting for {:?} from {}",
                self.rank, tag, from
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(Error::CommError(format!(
                "process {} disconnected while {} waited for {:?}",
                from, self.rank, tag
            ))),
        }
    }
}

/// Cluster of in-process participants.
pub struct LocalCluster;

impl LocalCluster {
    /// Creates connected communicators for `size` participants.
    pub fn comms(size: usize) -> Vec<LocalComm> {
        let mut senders: Vec<Vec<Sender<Envelope>>> = (0..size).map(|_| Vec::new()).collect();
        let mut receivers: Vec<Vec<Receiver<Envelope>>> =
            (0..size).map(|_| Vec::new()).collect();
        for from in 0..size {
            for to in 0..size {
                let (s, r) = unbounded();
                senders[from].push(s);
                receivers[to].push(r);
            }
        }
        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (outbox, inbox))| LocalComm {
                rank,
                outbox,
                inbox,
                timeout: DEFAULT_RECV_TIMEOUT,
            })
            .collect()
    }

    /// Runs `f` on `size` threads, one per participant, and returns each
    /// participant's result in rank order.
    pub fn run<T, F>(size: usize, f: F) -> Vec<Result<T>>
    where
        T: Send + 'static,
        F: Fn(LocalComm) -> Result<T> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let handles = Self::comms(size)
            .into_iter()
            .map(|comm| {
                let f = f.clone();
                let rank = comm.rank;
                thread::Builder::new()
                    .name(format!("dspace-{}", rank))
                    .spawn(move || f(comm))
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| match handle {
                Ok(h) => h.join().unwrap_or_else(|_| {
                    Err(Error::CommError(format!("process {} panicked", rank)))
                }),
                Err(e) => Err(Error::IoError(e.to_string())),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{all_gather_value, ensure_agreement};

    #[test]
    fn all_gather_in_rank_order() {
        let results = LocalCluster::run(4, |mut comm| {
            let rank = comm.rank();
            all_gather_value(&mut comm, &(rank * 10))
        });
        for r in results {
            assert_eq!(r.unwrap(), vec![0, 10, 20, 30]);
        }
    }

    #[test]
    fn neighbor_exchange_ring() {
        let results = LocalCluster::run(3, |mut comm| {
            let me = comm.rank();
            let left = (me + 2) % 3;
            let right = (me + 1) % 3;
            let mut neighbors = vec![left, right];
            neighbors.sort();
            let out = neighbors.iter().map(|n| vec![me as u8; *n + 1]).collect();
            let incoming = comm.neighbor_exchange(&neighbors, out)?;
            Ok((neighbors, incoming))
        });
        for (me, r) in results.into_iter().enumerate() {
            let (neighbors, incoming) = r.unwrap();
            for (n, buf) in neighbors.iter().zip(incoming) {
                assert_eq!(buf, vec![*n as u8; me + 1]);
            }
        }
    }

    #[test]
    fn group_gather_and_scatter() {
        let results = LocalCluster::run(4, |mut comm| {
            let members = vec![1, 2, 3];
            if !members.contains(&comm.rank()) {
                return Ok(Vec::new());
            }
            let gathered = comm.gather_among(&members, 1, vec![comm.rank() as u8])?;
            let parts = gathered.map(|g| g.into_iter().rev().collect());
            comm.scatter_among(&members, 1, parts)
        });
        let got: Vec<Vec<u8>> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(got, vec![vec![], vec![3], vec![2], vec![1]]);
    }

    #[test]
    fn diverging_tags_are_detected() {
        let results = LocalCluster::run(2, |mut comm| {
            if comm.rank() == 0 {
                comm.send(1, Tag::Scatter, vec![1])?;
                Ok(())
            } else {
                comm.recv(0, Tag::Gather).map(|_| ())
            }
        });
        assert!(results[0].is_ok());
        match &results[1] {
            Err(Error::TopologyMismatch(_)) => (),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn disagreement_is_reported() {
        let results = LocalCluster::run(2, |mut comm| {
            let value = comm.rank() as u32;
            ensure_agreement(&mut comm, &value, "value")
        });
        assert!(results.iter().all(|r| r.is_err()));
    }
}
