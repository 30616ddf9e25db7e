//! # Block I/O Scheduler
//!
//! Elevator policies for the virtio disk. The dispatcher inserts every
//! submission into the active policy and issues whatever that policy
//! currently designates as ready; the completion handler retires one entry
//! per finished transfer.
//!
//! ## Schedulers
//!
//! | Mode | Name   | Structure                                   |
//! |------|--------|---------------------------------------------|
//! | 0    | `noop` | none, the submitted request is issued as-is |
//! | 1    | `cfq`  | min-heap by block address                   |
//! | 2    | `sstf` | queue sorted by distance from the last seek |
//! | 3    | `ddl`  | per-class red-black tree + arrival ring     |
//!
//! ## Design
//!
//! All structures are fixed arrays addressed by index, constructible in
//! `const` context, so the whole [`Elevator`] lives inside the block layer's
//! static state.

pub mod deadline;
pub mod heap;
pub mod sstf;

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use self::deadline::{DeadlineQueues, DEFAULT_TIME_LIMIT};
use self::heap::MinHeap;
use self::sstf::SeekQueue;
use super::Request;

/// Scheduler errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// Mode number or name not recognized
    InvalidMode,
    /// Policy structure is at capacity
    QueueFull,
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::InvalidMode => write!(f, "invalid I/O scheduling mode"),
            SchedError::QueueFull => write!(f, "queue out of capacity"),
        }
    }
}

/// Active elevator policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IoMode {
    /// Issue exactly the submitted request
    Passthrough = 0,
    /// Lowest block address first
    PriorityHeap = 1,
    /// Shortest seek from the last serviced block
    ShortestSeek = 2,
    /// Address order with a starvation time limit
    Deadline = 3,
}

impl IoMode {
    pub const ALL: [IoMode; 4] = [
        IoMode::Passthrough,
        IoMode::PriorityHeap,
        IoMode::ShortestSeek,
        IoMode::Deadline,
    ];

    /// Decodes a mode number as passed to the mode-switch system call.
    pub const fn from_u8(mode: u8) -> Result<Self, SchedError> {
        match mode {
            0 => Ok(IoMode::Passthrough),
            1 => Ok(IoMode::PriorityHeap),
            2 => Ok(IoMode::ShortestSeek),
            3 => Ok(IoMode::Deadline),
            _ => Err(SchedError::InvalidMode),
        }
    }

    /// Decodes a policy name as typed at the `IO_schedule` tool.
    pub fn from_name(name: &str) -> Result<Self, SchedError> {
        match name {
            "noop" => Ok(IoMode::Passthrough),
            "cfq" => Ok(IoMode::PriorityHeap),
            "sstf" => Ok(IoMode::ShortestSeek),
            "ddl" | "deadline" => Ok(IoMode::Deadline),
            _ => Err(SchedError::InvalidMode),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            IoMode::Passthrough => "noop",
            IoMode::PriorityHeap => "cfq",
            IoMode::ShortestSeek => "sstf",
            IoMode::Deadline => "ddl",
        }
    }

    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for IoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Block layer configuration
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Policy active at boot
    pub mode: IoMode,
    /// Ticks a Deadline request may wait before it jumps the queue
    pub deadline_ticks: u64,
}

impl SchedulerConfig {
    pub const fn new() -> Self {
        Self {
            mode: IoMode::Passthrough,
            deadline_ticks: DEFAULT_TIME_LIMIT,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Block layer counters
pub struct SchedulerStats {
    /// Calls to `submit`
    pub submitted: AtomicU64,
    /// Ready picks issued on behalf of a policy
    pub dispatched: AtomicU64,
    /// Transfers the completion handler drained
    pub completed: AtomicU64,
    /// Policy entries retired on completion
    pub retired: AtomicU64,
    /// Deadline requests evicted by the time limit
    pub expired: AtomicU64,
    /// Retires that found the active policy empty
    pub spurious_retires: AtomicU64,
}

impl SchedulerStats {
    pub const fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            retired: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            spurious_retires: AtomicU64::new(0),
        }
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for SchedulerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// I/O scheduler policy
pub trait IoScheduler: Send + Sync {
    /// Scheduler name
    fn name(&self) -> &'static str;

    /// Adds a request and recomputes the ready request
    fn add_request(&mut self, request: Request, now: u64) -> Result<(), SchedError>;

    /// Request the dispatcher should issue next
    fn ready(&self) -> Option<Request>;

    /// Removes the entry a completed transfer accounts for
    fn retire(&mut self) -> Option<Request>;

    /// Returns the number of pending requests
    fn pending_count(&self) -> usize;

    /// Checks if the scheduler has pending requests
    fn has_pending(&self) -> bool {
        self.pending_count() != 0
    }
}

// ============================================================================
// Elevator State
// ============================================================================

/// Every policy structure, of which the active mode uses one.
///
/// Structures of inactive modes keep their contents across a mode switch;
/// completions always retire from the structure of the mode active when
/// they are handled.
pub struct Elevator {
    heap: MinHeap,
    seek: SeekQueue,
    deadline: DeadlineQueues,
}

impl Elevator {
    pub const fn new(deadline_ticks: u64) -> Self {
        Self {
            heap: MinHeap::new(),
            seek: SeekQueue::new(),
            deadline: DeadlineQueues::new(deadline_ticks),
        }
    }

    /// The structure backing `mode`; passthrough has none.
    pub fn policy(&self, mode: IoMode) -> Option<&dyn IoScheduler> {
        match mode {
            IoMode::Passthrough => None,
            IoMode::PriorityHeap => Some(&self.heap),
            IoMode::ShortestSeek => Some(&self.seek),
            IoMode::Deadline => Some(&self.deadline),
        }
    }

    pub fn policy_mut(&mut self, mode: IoMode) -> Option<&mut dyn IoScheduler> {
        match mode {
            IoMode::Passthrough => None,
            IoMode::PriorityHeap => Some(&mut self.heap),
            IoMode::ShortestSeek => Some(&mut self.seek),
            IoMode::Deadline => Some(&mut self.deadline),
        }
    }

    /// Inserts into the policy for `mode` and returns its ready request.
    ///
    /// The ready request is not necessarily `request`.
    pub fn admit(&mut self, mode: IoMode, request: Request, now: u64) -> Result<Request, SchedError> {
        let Some(policy) = self.policy_mut(mode) else {
            return Ok(request);
        };
        policy.add_request(request, now)?;
        Ok(policy.ready().unwrap_or(request))
    }

    /// Retires one entry from the policy for `mode`.
    pub fn retire(&mut self, mode: IoMode) -> Option<Request> {
        self.policy_mut(mode)?.retire()
    }

    pub fn ready(&self, mode: IoMode) -> Option<Request> {
        self.policy(mode)?.ready()
    }

    pub fn pending(&self, mode: IoMode) -> usize {
        self.policy(mode).map_or(0, |policy| policy.pending_count())
    }

    pub fn deadline(&self) -> &DeadlineQueues {
        &self.deadline
    }

    pub fn set_deadline_ticks(&mut self, ticks: u64) {
        self.deadline.set_time_limit(ticks);
    }
}
