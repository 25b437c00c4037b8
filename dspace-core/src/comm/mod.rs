//! Collective communication between participating processes.
//!
//! Definitions are kept generic so that different transports can be used.
//! Implementors only provide ordered point-to-point messaging; every
//! collective used by the rest of the crate is a provided method built on
//! top of it.
//!
//! Every message carries a [`Tag`] naming the phase it belongs to. A
//! participant receiving a message with an unexpected tag has diverged from
//! its peers, which is reported as a fatal topology mismatch.

pub mod local;

use byteorder::{ByteOrder, LittleEndian};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::Pid;

/// Phase tag attached to every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Tag {
    Barrier = 1,
    Gather = 2,
    Scatter = 3,
    Broadcast = 4,
    NeighborCounts = 5,
    NeighborPayload = 6,
}

impl Tag {
    pub fn from_u8(code: u8) -> Option<Tag> {
        match code {
            1 => Some(Tag::Barrier),
            2 => Some(Tag::Gather),
            3 => Some(Tag::Scatter),
            4 => Some(Tag::Broadcast),
            5 => Some(Tag::NeighborCounts),
            6 => Some(Tag::NeighborPayload),
            _ => None,
        }
    }
}

/// Trait representing a participant's ability to exchange messages with
/// the rest of the group.
///
/// Messages between any ordered pair of participants must be delivered in
/// the order they were sent. `send` must not block waiting for the receiver.
pub trait Communicator {
    /// Id of the calling participant.
    fn rank(&self) -> Pid;
    /// Number of participants.
    fn size(&self) -> usize;

    /// Send bytes to a single participant.
    fn send(&mut self, to: Pid, tag: Tag, bytes: Vec<u8>) -> Result<()>;
    /// Block until the next message from `from` arrives. Fails with a
    /// topology mismatch if the message carries a different tag.
    fn recv(&mut self, from: Pid, tag: Tag) -> Result<Vec<u8>>;

    /// Ids of all the participants.
    fn everyone(&self) -> Vec<Pid> {
        (0..self.size()).collect()
    }

    /// Wait until every participant reaches the barrier.
    fn barrier(&mut self) -> Result<()> {
        let all = self.everyone();
        self.barrier_among(&all)
    }

    /// Barrier restricted to `members`, the first of which coordinates.
    fn barrier_among(&mut self, members: &[Pid]) -> Result<()> {
        let me = self.rank();
        ensure_member(me, members)?;
        let root = members[0];
        if me == root {
            for m in members.iter().filter(|m| **m != me) {
                self.recv(*m, Tag::Barrier)?;
            }
            for m in members.iter().filter(|m| **m != me) {
                self.send(*m, Tag::Barrier, Vec::new())?;
            }
        } else {
            self.send(root, Tag::Barrier, Vec::new())?;
            self.recv(root, Tag::Barrier)?;
        }
        Ok(())
    }

    /// Gather one buffer from every member at `root`. Returns buffers in
    /// member order at the root, `None` elsewhere.
    fn gather_among(
        &mut self,
        members: &[Pid],
        root: Pid,
        bytes: Vec<u8>,
    ) -> Result<Option<Vec<Vec<u8>>>> {
        let me = self.rank();
        ensure_member(me, members)?;
        ensure_member(root, members)?;
        if me != root {
            self.send(root, Tag::Gather, bytes)?;
            return Ok(None);
        }
        let mut own = Some(bytes);
        let mut out = Vec::with_capacity(members.len());
        for m in members {
            if *m == me {
                out.push(own.take().unwrap_or_default());
            } else {
                out.push(self.recv(*m, Tag::Gather)?);
            }
        }
        Ok(Some(out))
    }

    /// Scatter one buffer per member from `root`. `parts` must be `Some` at
    /// the root, in member order.
    fn scatter_among(
        &mut self,
        members: &[Pid],
        root: Pid,
        parts: Option<Vec<Vec<u8>>>,
    ) -> Result<Vec<u8>> {
        let me = self.rank();
        ensure_member(me, members)?;
        ensure_member(root, members)?;
        if me != root {
            return self.recv(root, Tag::Scatter);
        }
        let parts = parts.ok_or_else(|| {
            Error::Other("scatter root called without data to scatter".to_string())
        })?;
        if parts.len() != members.len() {
            return Err(Error::TopologyMismatch(format!(
                "scatter got {} parts for {} members",
                parts.len(),
                members.len()
            )));
        }
        let mut mine = Vec::new();
        for (m, part) in members.iter().zip(parts) {
            if *m == me {
                mine = part;
            } else {
                self.send(*m, Tag::Scatter, part)?;
            }
        }
        Ok(mine)
    }

    /// Send the root's buffer to every member.
    fn broadcast_among(
        &mut self,
        members: &[Pid],
        root: Pid,
        bytes: Option<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        let me = self.rank();
        ensure_member(me, members)?;
        if me != root {
            return self.recv(root, Tag::Broadcast);
        }
        let bytes = bytes.ok_or_else(|| {
            Error::Other("broadcast root called without data".to_string())
        })?;
        for m in members.iter().filter(|m| **m != me) {
            self.send(*m, Tag::Broadcast, bytes.clone())?;
        }
        Ok(bytes)
    }

    /// Every participant ends up with every participant's buffer, in rank
    /// order.
    fn all_gather(&mut self, bytes: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        let all = self.everyone();
        let gathered = self.gather_among(&all, 0, bytes)?;
        let packed = match gathered {
            Some(parts) => Some(bincode::serialize(&parts)?),
            None => None,
        };
        let packed = self.broadcast_among(&all, 0, packed)?;
        Ok(bincode::deserialize(&packed)?)
    }

    /// Neighbor all-to-all: send `outgoing[i]` to `neighbors[i]` and receive
    /// one buffer from each neighbor, in the same order.
    ///
    /// Runs as two rounds, first exchanging byte counts and then payloads.
    /// A payload whose length disagrees with its announced count is a
    /// serialization error.
    fn neighbor_exchange(
        &mut self,
        neighbors: &[Pid],
        outgoing: Vec<Vec<u8>>,
    ) -> Result<Vec<Vec<u8>>> {
        if outgoing.len() != neighbors.len() {
            return Err(Error::TopologyMismatch(format!(
                "{} outgoing buffers for {} neighbors",
                outgoing.len(),
                neighbors.len()
            )));
        }
        for (n, buf) in neighbors.iter().zip(&outgoing) {
            let mut count = vec![0u8; 8];
            LittleEndian::write_u64(&mut count, buf.len() as u64);
            self.send(*n, Tag::NeighborCounts, count)?;
        }
        let mut counts = Vec::with_capacity(neighbors.len());
        for n in neighbors {
            let count = self.recv(*n, Tag::NeighborCounts)?;
            if count.len() != 8 {
                return Err(Error::SerializationError(format!(
                    "malformed count header from {}",
                    n
                )));
            }
            counts.push(LittleEndian::read_u64(&count) as usize);
        }
        for (n, buf) in neighbors.iter().zip(outgoing) {
            self.send(*n, Tag::NeighborPayload, buf)?;
        }
        let mut incoming = Vec::with_capacity(neighbors.len());
        for (n, count) in neighbors.iter().zip(counts) {
            let payload = self.recv(*n, Tag::NeighborPayload)?;
            if payload.len() != count {
                return Err(Error::SerializationError(format!(
                    "payload from {} has {} bytes, announced {}",
                    n,
                    payload.len(),
                    count
                )));
            }
            incoming.push(payload);
        }
        Ok(incoming)
    }
}

fn ensure_member(pid: Pid, members: &[Pid]) -> Result<()> {
    if members.contains(&pid) {
        Ok(())
    } else {
        Err(Error::TopologyMismatch(format!(
            "process {} is not a member of group {:?}",
            pid, members
        )))
    }
}

/// All-gathers a serializable value.
pub fn all_gather_value<C, T>(comm: &mut C, value: &T) -> Result<Vec<T>>
where
    C: Communicator + ?Sized,
    T: Serialize + DeserializeOwned,
{
    let parts = comm.all_gather(bincode::serialize(value)?)?;
    parts
        .iter()
        .map(|p| bincode::deserialize(p).map_err(Error::from))
        .collect()
}

/// Checks that every participant holds the same value.
pub fn ensure_agreement<C, T>(comm: &mut C, value: &T, what: &str) -> Result<()>
where
    C: Communicator + ?Sized,
    T: Serialize + DeserializeOwned + PartialEq + std::fmt::Debug,
{
    let all = all_gather_value(comm, value)?;
    if let Some((pid, other)) = all.iter().enumerate().find(|(_, v)| *v != value) {
        return Err(Error::TopologyMismatch(format!(
            "{}: process {} has {:?}, process {} has {:?}",
            what,
            comm.rank(),
            value,
            pid,
            other
        )));
    }
    Ok(())
}
