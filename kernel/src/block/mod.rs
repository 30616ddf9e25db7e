//! # Block Layer
//!
//! Splax OS block I/O dispatch for the single virtio disk.
//!
//! ## Design
//!
//! The block layer provides:
//! - The buffer handle shared with the buffer cache ([`Buf`])
//! - The request record every elevator stores ([`Request`])
//! - The legacy virtio-mmio transport (`virtio_blk`)
//! - I/O scheduling (NOOP, CFQ, SSTF, Deadline)
//! - The dispatcher and completion bottom half (`dispatch`)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              Buffer cache               │
//! ├─────────────────────────────────────────┤
//! │              Block Layer                │
//! │  - Dispatcher (submit / interrupt)      │
//! │  - Elevator (heap, sstf, rbtree+fifo)   │
//! │  - VirtIO-blk transport                 │
//! ├─────────────────────────────────────────┤
//! │         virtio-mmio device              │
//! └─────────────────────────────────────────┘
//! ```

pub mod dispatch;
pub mod mmio;
pub mod scheduler;
pub mod virtio_blk;

use core::cell::UnsafeCell;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::sched::WaitChannel;

/// Block size used by the buffer cache (bytes)
pub const BSIZE: usize = 1024;

/// Standard sector size (512 bytes)
pub const SECTOR_SIZE: usize = 512;

/// Sectors covered by one block
pub const SECTORS_PER_BLOCK: u64 = (BSIZE / SECTOR_SIZE) as u64;

/// Block layer errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// No virtio block device answers at the MMIO window
    NotFound,
    /// Device has no usable request queue
    NotReady,
    /// Device queue is smaller than the descriptor pool
    InvalidSize,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockError::NotFound => write!(f, "could not find virtio disk"),
            BlockError::NotReady => write!(f, "virtio disk has no queue 0"),
            BlockError::InvalidSize => write!(f, "virtio disk max queue too short"),
        }
    }
}

/// Transfer direction, doubling as the Deadline class index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    /// Device to memory (class 0)
    Read = 0,
    /// Memory to device (class 1)
    Write = 1,
}

impl Direction {
    /// Both classes, in the order the Deadline elevator checks them.
    pub const ALL: [Direction; 2] = [Direction::Read, Direction::Write];

    /// Maps the buffer cache's `write` flag to a direction.
    pub const fn from_write(write: bool) -> Self {
        if write {
            Direction::Write
        } else {
            Direction::Read
        }
    }

    /// Class index (read = 0, write = 1)
    pub const fn class(self) -> usize {
        self as usize
    }

    pub const fn is_write(self) -> bool {
        matches!(self, Direction::Write)
    }
}

/// One buffer-cache block as seen by the disk driver.
///
/// The buffer cache owns the slot and its contents; this layer only flips
/// the "owned by disk" flag and hands the data address to the device.
#[repr(C, align(8))]
pub struct Buf {
    data: UnsafeCell<[u8; BSIZE]>,
    /// Set while the device owns the buffer
    disk: AtomicBool,
}

// The data is only touched by the thread holding the buffer's sleep lock in
// the buffer cache, or by the device while `disk` is set.
unsafe impl Sync for Buf {}

impl Buf {
    /// Creates a zeroed buffer not owned by the disk.
    pub const fn new() -> Self {
        Self {
            data: UnsafeCell::new([0; BSIZE]),
            disk: AtomicBool::new(false),
        }
    }

    /// Returns true while a transfer on this buffer is in flight.
    pub fn owned_by_disk(&self) -> bool {
        self.disk.load(Ordering::Acquire)
    }

    pub(crate) fn give_to_disk(&self) {
        self.disk.store(true, Ordering::Release);
    }

    pub(crate) fn take_from_disk(&self) {
        self.disk.store(false, Ordering::Release);
    }

    /// Address handed to the device as the data descriptor.
    pub fn data_ptr(&self) -> *mut u8 {
        self.data.get() as *mut u8
    }

    /// Borrows the block contents.
    ///
    /// # Safety
    ///
    /// The caller must hold the buffer exclusively (its buffer-cache sleep
    /// lock) and no transfer may be in flight.
    pub unsafe fn data(&self) -> &[u8; BSIZE] {
        // SAFETY: exclusivity is guaranteed by the caller.
        unsafe { &*self.data.get() }
    }

    /// Mutably borrows the block contents.
    ///
    /// # Safety
    ///
    /// Same contract as [`Buf::data`], and no other borrow may be live.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self) -> &mut [u8; BSIZE] {
        // SAFETY: exclusivity is guaranteed by the caller.
        unsafe { &mut *self.data.get() }
    }

    /// Channel a submitter sleeps on until this buffer's transfer completes.
    pub fn channel(&self) -> WaitChannel {
        WaitChannel::of(self)
    }
}

impl Default for Buf {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Buf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buf")
            .field("addr", &self.data_ptr())
            .field("disk", &self.owned_by_disk())
            .finish()
    }
}

/// A pending block transfer.
///
/// Produced by the buffer cache on every `submit`, held by exactly one
/// elevator structure until it is retired.
#[derive(Debug, Clone, Copy)]
pub struct Request {
    /// Device number
    pub dev: u32,
    /// Block address (the ordering key of every elevator)
    pub blockno: u32,
    /// Transfer direction
    pub dir: Direction,
    /// Buffer-cache slot carrying the data
    pub buf: &'static Buf,
}

impl Request {
    /// Creates a request
    pub const fn new(dev: u32, blockno: u32, dir: Direction, buf: &'static Buf) -> Self {
        Self {
            dev,
            blockno,
            dir,
            buf,
        }
    }

    /// First sector covered by the block
    pub fn sector(&self) -> u64 {
        self.blockno as u64 * SECTORS_PER_BLOCK
    }

    /// Seek distance to another block address
    pub fn distance(&self, blockno: u32) -> u32 {
        self.blockno.abs_diff(blockno)
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.dev == other.dev
            && self.blockno == other.blockno
            && self.dir == other.dir
            && core::ptr::eq(self.buf, other.buf)
    }
}

impl Eq for Request {}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Leaks a buffer so it can back a `Request` in tests.
    pub(crate) fn leak_buf() -> &'static Buf {
        Box::leak(Box::new(Buf::new()))
    }

    pub(crate) fn read(blockno: u32) -> Request {
        Request::new(1, blockno, Direction::Read, leak_buf())
    }

    pub(crate) fn write(blockno: u32) -> Request {
        Request::new(1, blockno, Direction::Write, leak_buf())
    }

    #[test]
    fn test_sector_mapping() {
        let req = read(7);
        assert_eq!(req.sector(), 14);
        assert_eq!(req.distance(3), 4);
        assert_eq!(req.distance(11), 4);
    }

    #[test]
    fn test_direction_classes() {
        assert_eq!(Direction::from_write(false), Direction::Read);
        assert_eq!(Direction::from_write(true), Direction::Write);
        assert_eq!(Direction::Read.class(), 0);
        assert_eq!(Direction::Write.class(), 1);
        assert!(Direction::Write.is_write());
    }

    #[test]
    fn test_request_equality_tracks_buffer() {
        let buf = leak_buf();
        let a = Request::new(1, 5, Direction::Read, buf);
        let b = Request::new(1, 5, Direction::Read, buf);
        let c = Request::new(1, 5, Direction::Read, leak_buf());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_buf_disk_flag() {
        let buf = leak_buf();
        assert!(!buf.owned_by_disk());
        buf.give_to_disk();
        assert!(buf.owned_by_disk());
        buf.take_from_disk();
        assert!(!buf.owned_by_disk());
        assert_eq!(buf.data_ptr() as usize % 8, 0);
    }
}
