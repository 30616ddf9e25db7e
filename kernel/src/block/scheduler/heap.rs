//! # Priority-Heap Elevator
//!
//! Outstanding requests kept in a binary min-heap keyed by block address, so
//! the lowest address is always the one handed to the disk. Exposed to users
//! under the name `cfq`.
//!
//! The heap is 1-based. Slot 0 is a sentinel whose key (0) is never greater
//! than a real block address, which bounds the sift-up loop without an index
//! check.

use super::{IoScheduler, SchedError};
use crate::block::Request;

/// Slots in the default heap, sentinel included
pub const HEAP_SLOTS: usize = 128;

/// Array-backed min-heap of requests.
pub struct MinHeap<const SLOTS: usize = HEAP_SLOTS> {
    slots: [Option<Request>; SLOTS],
    /// Elements in slots[1..=size]
    size: usize,
}

impl<const SLOTS: usize> MinHeap<SLOTS> {
    /// Requests the heap can hold
    pub const CAPACITY: usize = SLOTS - 1;

    pub const fn new() -> Self {
        Self {
            slots: [None; SLOTS],
            size: 0,
        }
    }

    /// Sort key of a slot; the sentinel reads as 0.
    fn key(&self, i: usize) -> u32 {
        self.slots[i].map_or(0, |req| req.blockno)
    }

    /// Inserts a request, sifting it up past every strictly greater parent.
    pub fn insert(&mut self, request: Request) -> Result<(), SchedError> {
        if self.size == Self::CAPACITY {
            return Err(SchedError::QueueFull);
        }

        self.size += 1;
        let mut p = self.size;
        while self.key(p / 2) > request.blockno {
            self.slots[p] = self.slots[p / 2];
            p /= 2;
        }
        self.slots[p] = Some(request);
        Ok(())
    }

    /// Removes and returns the minimum.
    pub fn pop_min(&mut self) -> Option<Request> {
        if self.size == 0 {
            return None;
        }

        let top = self.slots[1];
        let last = self.slots[self.size];
        let last_key = self.key(self.size);
        self.slots[self.size] = None;
        self.size -= 1;
        if self.size == 0 {
            return top;
        }

        let mut parent = 1;
        while parent * 2 <= self.size {
            let mut child = parent * 2;
            // Pick the smaller child
            if child != self.size && self.key(child) > self.key(child + 1) {
                child += 1;
            }
            if self.key(child) > last_key {
                break;
            }
            self.slots[parent] = self.slots[child];
            parent = child;
        }
        self.slots[parent] = last;
        top
    }

    /// The minimum, without removing it
    pub fn peek(&self) -> Option<Request> {
        if self.size == 0 {
            None
        } else {
            self.slots[1]
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Checks that every node's key is at least its parent's.
    #[cfg(test)]
    fn holds_heap_property(&self) -> bool {
        (2..=self.size).all(|i| self.key(i) >= self.key(i / 2))
            && (1..=self.size).all(|i| self.slots[i].is_some())
    }
}

impl<const SLOTS: usize> Default for MinHeap<SLOTS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const SLOTS: usize> IoScheduler for MinHeap<SLOTS> {
    fn name(&self) -> &'static str {
        "cfq"
    }

    fn add_request(&mut self, request: Request, _now: u64) -> Result<(), SchedError> {
        self.insert(request)
    }

    fn ready(&self) -> Option<Request> {
        self.peek()
    }

    fn retire(&mut self) -> Option<Request> {
        self.pop_min()
    }

    fn pending_count(&self) -> usize {
        self.size
    }
}
