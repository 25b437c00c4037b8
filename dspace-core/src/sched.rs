//! Delivery side of entity migration.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::Result;
use crate::migrate::MigratingEntity;

/// Collaborator receiving migrated entities on their owning process.
pub trait Scheduler {
    /// Current simulation time.
    fn time(&self) -> f64;
    /// Number of steps taken so far.
    fn steps(&self) -> u64;
    /// Takes ownership of an entity delivered to this process.
    fn enqueue(&mut self, entity: MigratingEntity) -> Result<()>;
}

#[derive(Debug)]
struct Scheduled {
    seq: u64,
    entity: MigratingEntity,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // earliest time first, then lowest ordering, then insertion order
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .entity
            .scheduled_time
            .partial_cmp(&self.entity.scheduled_time)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.entity.ordering.cmp(&self.entity.ordering))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Simple time-ordered queue of delivered entities.
#[derive(Debug, Default)]
pub struct EventQueue {
    time: f64,
    steps: u64,
    seq: u64,
    heap: BinaryHeap<Scheduled>,
}

impl EventQueue {
    pub fn new() -> Self {
        EventQueue::default()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Time of the earliest queued entity.
    pub fn peek_time(&self) -> Option<f64> {
        self.heap.peek().map(|s| s.entity.scheduled_time)
    }

    /// Advances the clock to `time` and returns every entity scheduled up to
    /// and including it, in order.
    pub fn advance(&mut self, time: f64) -> Vec<MigratingEntity> {
        if time > self.time {
            self.time = time;
        }
        self.steps += 1;
        let mut out = Vec::new();
        while let Some(next) = self.heap.peek() {
            if next.entity.scheduled_time > self.time {
                break;
            }
            if let Some(next) = self.heap.pop() {
                out.push(next.entity);
            }
        }
        out
    }

    /// Removes every queued entity regardless of time.
    pub fn drain(&mut self) -> Vec<MigratingEntity> {
        let mut out = Vec::with_capacity(self.heap.len());
        while let Some(next) = self.heap.pop() {
            out.push(next.entity);
        }
        out
    }
}

impl Scheduler for EventQueue {
    fn time(&self) -> f64 {
        self.time
    }

    fn steps(&self) -> u64 {
        self.steps
    }

    fn enqueue(&mut self, entity: MigratingEntity) -> Result<()> {
        self.seq += 1;
        self.heap.push(Scheduled {
            seq: self.seq,
            entity,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(time: f64, ordering: i64, tag: u8) -> MigratingEntity {
        MigratingEntity {
            destination_id: 0,
            ordering,
            scheduled_time: time,
            payload: vec![tag],
            location: None,
            field_index: None,
        }
    }

    #[test]
    fn pops_in_time_then_ordering() {
        let mut queue = EventQueue::new();
        queue.enqueue(at(2., 0, 1)).unwrap();
        queue.enqueue(at(1., 5, 2)).unwrap();
        queue.enqueue(at(1., 1, 3)).unwrap();
        queue.enqueue(at(1., 1, 4)).unwrap();
        queue.enqueue(at(3., 0, 5)).unwrap();
        assert_eq!(queue.peek_time(), Some(1.));
        let due: Vec<u8> = queue.advance(2.).iter().map(|e| e.payload[0]).collect();
        assert_eq!(due, vec![3, 4, 2, 1]);
        assert_eq!(queue.time(), 2.);
        assert_eq!(queue.steps(), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.drain().len(), 1);
        assert!(queue.is_empty());
    }
}
