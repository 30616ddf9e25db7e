//! # Deadline Elevator
//!
//! Per class (read, write): a red-black tree ordering requests by block
//! address and an arrival ring ordering them by submission tick. Every tree
//! node is cross-linked with its ring entry, and both are removed together.
//!
//! ## Ready Selection
//!
//! After each insert the oldest read, then the oldest write, is checked
//! against the time limit. The first one that has waited strictly longer is
//! evicted from tree and ring and becomes ready. Otherwise the ready request
//! is the lowest address in the read tree, or in the write tree when there
//! are no reads.
//!
//! ## Retirement
//!
//! Evicted requests have already left their tree, so they are parked on an
//! expired list and retired from there first. After that the minimum of the
//! read tree (or the write tree when no reads are queued) is removed.

pub mod fifo;
pub mod rbtree;

use self::fifo::ArrivalRing;
use self::rbtree::RbTree;
use super::{IoScheduler, SchedError};
use crate::block::{Direction, Request};

/// Default time limit before a request jumps the queue (ticks)
pub const DEFAULT_TIME_LIMIT: u64 = 22;

/// Arena slots per class, sentinel included
pub const DEADLINE_SLOTS: usize = 128;

/// Stack of free arena indices. Index 0 is reserved for the sentinel and
/// never handed out.
pub(crate) struct FreeSlots<const SLOTS: usize> {
    stack: [usize; SLOTS],
    top: usize,
    /// Next never-used index
    fresh: usize,
}

impl<const SLOTS: usize> FreeSlots<SLOTS> {
    pub(crate) const fn new() -> Self {
        Self {
            stack: [0; SLOTS],
            top: 0,
            fresh: 1,
        }
    }

    pub(crate) fn take(&mut self) -> Option<usize> {
        if self.top > 0 {
            self.top -= 1;
            Some(self.stack[self.top])
        } else if self.fresh < SLOTS {
            self.fresh += 1;
            Some(self.fresh - 1)
        } else {
            None
        }
    }

    pub(crate) fn put(&mut self, i: usize) {
        self.stack[self.top] = i;
        self.top += 1;
    }
}

/// Requests evicted by the time limit, oldest first.
struct ExpiredList<const CAP: usize> {
    entries: [Option<Request>; CAP],
    head: usize,
    len: usize,
}

impl<const CAP: usize> ExpiredList<CAP> {
    const fn new() -> Self {
        Self {
            entries: [None; CAP],
            head: 0,
            len: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.len == CAP
    }

    fn push(&mut self, request: Request) {
        self.entries[(self.head + self.len) % CAP] = Some(request);
        self.len += 1;
    }

    fn pop(&mut self) -> Option<Request> {
        if self.len == 0 {
            return None;
        }
        let request = self.entries[self.head].take();
        self.head = (self.head + 1) % CAP;
        self.len -= 1;
        request
    }

    fn front(&self) -> Option<Request> {
        if self.len == 0 {
            None
        } else {
            self.entries[self.head]
        }
    }
}

/// Deadline elevator state for both classes.
pub struct DeadlineQueues<const SLOTS: usize = DEADLINE_SLOTS> {
    /// Indexed by [`Direction::class`]
    trees: [RbTree<SLOTS>; 2],
    rings: [ArrivalRing<SLOTS>; 2],
    expired: ExpiredList<SLOTS>,
    ready: Option<Request>,
    time_limit: u64,
    /// Requests evicted by the time limit so far
    expirations: u64,
}

impl<const SLOTS: usize> DeadlineQueues<SLOTS> {
    pub const fn new(time_limit: u64) -> Self {
        Self {
            trees: [RbTree::new(), RbTree::new()],
            rings: [ArrivalRing::new(), ArrivalRing::new()],
            expired: ExpiredList::new(),
            ready: None,
            time_limit,
            expirations: 0,
        }
    }

    pub fn time_limit(&self) -> u64 {
        self.time_limit
    }

    pub fn set_time_limit(&mut self, ticks: u64) {
        self.time_limit = ticks;
    }

    pub fn expirations(&self) -> u64 {
        self.expirations
    }

    /// Requests of one class still in tree and ring
    pub fn queued(&self, dir: Direction) -> usize {
        self.trees[dir.class()].len()
    }

    /// Inserts into the class's tree and ring, then recomputes the ready
    /// request.
    pub fn insert(&mut self, request: Request, now: u64) -> Result<(), SchedError> {
        let class = request.dir.class();
        let section = self.rings[class].append(request, now)?;
        let node = match self.trees[class].insert(request) {
            Ok(node) => node,
            Err(err) => {
                self.rings[class].unlink(section);
                return Err(err);
            }
        };
        self.rings[class].set_node(section, node);
        self.trees[class].set_section(node, section);

        self.renew(now);
        Ok(())
    }

    fn renew(&mut self, now: u64) {
        if !self.expired.is_full() {
            for dir in Direction::ALL {
                let class = dir.class();
                let Some(oldest) = self.rings[class].oldest() else {
                    continue;
                };
                let waited = now.saturating_sub(self.rings[class].arrival(oldest));
                if waited > self.time_limit {
                    let node = self.rings[class].node(oldest);
                    self.rings[class].unlink(oldest);
                    if let Some(request) = self.trees[class].delete(node) {
                        log::debug!(
                            "[IOSCHED] {:?} block {} expired after {} ticks",
                            dir,
                            request.blockno,
                            waited
                        );
                        self.expired.push(request);
                        self.expirations += 1;
                        self.ready = Some(request);
                        return;
                    }
                }
            }
        }
        self.ready = self.lowest();
    }

    /// Class retirement favors: reads unless there are none.
    fn favored(&self) -> Option<usize> {
        Direction::ALL
            .iter()
            .map(|dir| dir.class())
            .find(|&class| !self.trees[class].is_empty())
    }

    fn lowest(&self) -> Option<Request> {
        let class = self.favored()?;
        let node = self.trees[class].min()?;
        self.trees[class].request(node)
    }

    /// Retires one request: an expired one if any, else the favored tree's
    /// minimum together with its ring entry.
    pub fn prim(&mut self) -> Option<Request> {
        let retired = match self.expired.pop() {
            Some(request) => Some(request),
            None => {
                let class = self.favored()?;
                let node = self.trees[class].min()?;
                let section = self.trees[class].section(node);
                self.rings[class].unlink(section);
                self.trees[class].delete(node)
            }
        };
        self.ready = self.expired.front().or_else(|| self.lowest());
        retired
    }

    #[cfg(test)]
    fn check(&self) {
        for class in 0..2 {
            self.trees[class].check();
            assert_eq!(self.trees[class].len(), self.rings[class].len());
            assert!(
                self.rings[class].arrivals().windows(2).all(|w| w[0] <= w[1]),
                "ring out of arrival order"
            );
        }
    }
}

impl<const SLOTS: usize> Default for DeadlineQueues<SLOTS> {
    fn default() -> Self {
        Self::new(DEFAULT_TIME_LIMIT)
    }
}

impl<const SLOTS: usize> IoScheduler for DeadlineQueues<SLOTS> {
    fn name(&self) -> &'static str {
        "ddl"
    }

    fn add_request(&mut self, request: Request, now: u64) -> Result<(), SchedError> {
        self.insert(request, now)
    }

    fn ready(&self) -> Option<Request> {
        self.ready
    }

    fn retire(&mut self) -> Option<Request> {
        self.prim()
    }

    fn pending_count(&self) -> usize {
        self.trees[0].len() + self.trees[1].len() + self.expired.len
    }
}
