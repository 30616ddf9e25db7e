//! Arrival ring: requests of one class in submission order, each stamped
//! with the tick it arrived.
//!
//! A circular doubly linked list over a section arena. Section 0 is the head
//! sentinel: its `next` is the oldest entry and its `prev` the newest.

use super::FreeSlots;
use crate::block::Request;
use crate::block::scheduler::SchedError;

/// Head sentinel index
pub const HEAD: usize = 0;

#[derive(Debug, Clone, Copy)]
struct Section {
    /// Arrival tick
    time: u64,
    request: Option<Request>,
    prev: usize,
    next: usize,
    /// Paired tree node
    node: usize,
}

impl Section {
    const EMPTY: Section = Section {
        time: 0,
        request: None,
        prev: HEAD,
        next: HEAD,
        node: 0,
    };
}

pub struct ArrivalRing<const SLOTS: usize> {
    sections: [Section; SLOTS],
    free: FreeSlots<SLOTS>,
    size: usize,
}

impl<const SLOTS: usize> ArrivalRing<SLOTS> {
    pub const fn new() -> Self {
        Self {
            sections: [Section::EMPTY; SLOTS],
            free: FreeSlots::new(),
            size: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Appends a request as the newest entry.
    pub fn append(&mut self, request: Request, now: u64) -> Result<usize, SchedError> {
        let s = self.free.take().ok_or(SchedError::QueueFull)?;
        let newest = self.sections[HEAD].prev;
        self.sections[s] = Section {
            time: now,
            request: Some(request),
            prev: newest,
            next: HEAD,
            node: 0,
        };
        self.sections[newest].next = s;
        self.sections[HEAD].prev = s;
        self.size += 1;
        Ok(s)
    }

    /// Index of the entry that has waited longest.
    pub fn oldest(&self) -> Option<usize> {
        match self.sections[HEAD].next {
            HEAD => None,
            s => Some(s),
        }
    }

    pub fn arrival(&self, s: usize) -> u64 {
        self.sections[s].time
    }

    pub fn node(&self, s: usize) -> usize {
        self.sections[s].node
    }

    pub fn set_node(&mut self, s: usize, node: usize) {
        self.sections[s].node = node;
    }

    /// Removes an entry from anywhere in the ring and frees its slot.
    pub fn unlink(&mut self, s: usize) -> Option<Request> {
        if s == HEAD || s >= SLOTS {
            return None;
        }
        let Section {
            request, prev, next, ..
        } = self.sections[s];
        if request.is_none() {
            return None;
        }

        self.sections[prev].next = next;
        self.sections[next].prev = prev;
        self.sections[s] = Section::EMPTY;
        self.free.put(s);
        self.size -= 1;
        request
    }

    /// Arrival ticks from oldest to newest.
    #[cfg(test)]
    pub(crate) fn arrivals(&self) -> Vec<u64> {
        let mut out = Vec::new();
        let mut s = self.sections[HEAD].next;
        while s != HEAD {
            out.push(self.sections[s].time);
            s = self.sections[s].next;
        }
        out
    }
}
