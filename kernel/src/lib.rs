//! # S-BLKIO: Block I/O Dispatch for Splax OS
//!
//! The block I/O dispatch layer sits between the buffer cache and the single
//! virtio block device. It is responsible for exactly three things:
//!
//! 1. **Transport** (`block::virtio_blk`): legacy virtio-mmio descriptor
//!    chains, device notification and completion interrupts
//! 2. **Elevators** (`block::scheduler`): NOOP, CFQ (min-heap), SSTF and
//!    Deadline request ordering over fixed-capacity arenas
//! 3. **Dispatch** (`block::dispatch`): the submission entry point and the
//!    interrupt bottom half that ties the two together
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Buffer cache / write-ahead log   │
//! ├─────────────────────────────────────────┤
//! │   BlockLayer::submit   handle_interrupt │
//! ├─────────────────────────────────────────┤
//! │   Elevator: NOOP | CFQ | SSTF | DDL     │
//! ├─────────────────────────────────────────┤
//! │   VirtioBlk transport (3-desc chains)   │
//! ├─────────────────────────────────────────┤
//! │   virtio-mmio registers (legacy v1)     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Nothing here allocates. Every structure is a fixed array addressed by
//! index, so a `BlockLayer` can live in a `static` for the kernel lifetime.
//! Suspension, wakeup, the tick counter and interrupt masking come from the
//! rest of the kernel through the traits in [`sched`].

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod block;
pub mod sched;

pub use block::dispatch::BlockLayer;
pub use block::scheduler::{IoMode, SchedError, SchedulerConfig};
pub use block::{BlockError, Buf, Direction, Request, BSIZE};
pub use sched::{IrqControl, NullIrq};
