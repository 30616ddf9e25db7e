//! # Shortest-Seek-First Elevator
//!
//! Requests ordered by distance from the anchor, the block most recently
//! retired (0 before the first retirement). The front of the queue is the
//! ready request.
//!
//! Re-sorting is a stable insertion sort, so requests at equal distance keep
//! their arrival order.

use super::{IoScheduler, SchedError};
use crate::block::Request;

/// Requests the default seek queue holds
pub const SEEK_CAPACITY: usize = 128;

/// Array-backed seek-ordered queue.
pub struct SeekQueue<const CAP: usize = SEEK_CAPACITY> {
    queue: [Option<Request>; CAP],
    len: usize,
    /// Last serviced block address
    anchor: u32,
}

impl<const CAP: usize> SeekQueue<CAP> {
    pub const fn new() -> Self {
        Self {
            queue: [None; CAP],
            len: 0,
            anchor: 0,
        }
    }

    fn distance(&self, i: usize) -> u32 {
        self.queue[i].map_or(u32::MAX, |req| req.distance(self.anchor))
    }

    fn sort(&mut self) {
        for i in 1..self.len {
            let mut j = i;
            while j > 0 && self.distance(j - 1) > self.distance(j) {
                self.queue.swap(j - 1, j);
                j -= 1;
            }
        }
    }

    /// Appends a request and restores seek order.
    pub fn enqueue(&mut self, request: Request) -> Result<(), SchedError> {
        if self.len == CAP {
            return Err(SchedError::QueueFull);
        }
        self.queue[self.len] = Some(request);
        self.len += 1;
        self.sort();
        Ok(())
    }

    /// Removes the front request; its block becomes the new anchor.
    pub fn dequeue(&mut self) -> Option<Request> {
        if self.len == 0 {
            return None;
        }
        let front = self.queue[0];
        self.queue.copy_within(1..self.len, 0);
        self.len -= 1;
        self.queue[self.len] = None;

        if let Some(req) = front {
            self.anchor = req.blockno;
        }
        self.sort();
        front
    }

    pub fn front(&self) -> Option<Request> {
        if self.len == 0 {
            None
        } else {
            self.queue[0]
        }
    }

    pub fn anchor(&self) -> u32 {
        self.anchor
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[cfg(test)]
    fn is_seek_ordered(&self) -> bool {
        (1..self.len).all(|i| self.distance(i - 1) <= self.distance(i))
    }
}

impl<const CAP: usize> Default for SeekQueue<CAP> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CAP: usize> IoScheduler for SeekQueue<CAP> {
    fn name(&self) -> &'static str {
        "sstf"
    }

    fn add_request(&mut self, request: Request, _now: u64) -> Result<(), SchedError> {
        self.enqueue(request)
    }

    fn ready(&self) -> Option<Request> {
        self.front()
    }

    fn retire(&mut self) -> Option<Request> {
        self.dequeue()
    }

    fn pending_count(&self) -> usize {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::tests::read;

    #[test]
    fn test_nearest_first_from_anchor_zero() {
        let mut sstf = SeekQueue::<SEEK_CAPACITY>::new();
        for blockno in [20, 5, 40] {
            sstf.enqueue(read(blockno)).unwrap();
        }
        assert_eq!(sstf.front().unwrap().blockno, 5);

        assert_eq!(sstf.dequeue().unwrap().blockno, 5);
        assert_eq!(sstf.anchor(), 5);
        assert_eq!(sstf.front().unwrap().blockno, 20);
    }

    #[test]
    fn test_anchor_follows_retired_block() {
        let mut sstf = SeekQueue::<SEEK_CAPACITY>::new();
        for blockno in [100, 90, 10] {
            sstf.enqueue(read(blockno)).unwrap();
        }
        // From 0: 10, then from 10: 90, then from 90: 100
        let order: Vec<u32> = core::iter::from_fn(|| sstf.dequeue())
            .map(|req| req.blockno)
            .collect();
        assert_eq!(order, [10, 90, 100]);
        assert_eq!(sstf.anchor(), 100);

        sstf.enqueue(read(60)).unwrap();
        sstf.enqueue(read(130)).unwrap();
        assert_eq!(sstf.front().unwrap().blockno, 130);
    }

    #[test]
    fn test_equal_distance_keeps_arrival_order() {
        let mut sstf = SeekQueue::<SEEK_CAPACITY>::new();
        sstf.enqueue(read(10)).unwrap();
        assert_eq!(sstf.dequeue().unwrap().blockno, 10);

        sstf.enqueue(read(15)).unwrap();
        sstf.enqueue(read(5)).unwrap();
        assert_eq!(sstf.dequeue().unwrap().blockno, 15);
    }

    #[test]
    fn test_capacity_and_drain() {
        let mut sstf = SeekQueue::<4>::new();
        for blockno in [9, 3, 7, 1] {
            sstf.enqueue(read(blockno)).unwrap();
            assert!(sstf.is_seek_ordered());
        }
        assert_eq!(sstf.enqueue(read(2)), Err(SchedError::QueueFull));

        for _ in 0..4 {
            assert!(sstf.retire().is_some());
            assert!(sstf.is_seek_ordered());
        }
        assert!(sstf.is_empty());
        assert!(sstf.retire().is_none());
    }
}
