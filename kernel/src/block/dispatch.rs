//! # Block Dispatch
//!
//! The buffer cache's single entry point to the disk, and the interrupt
//! bottom half that retires finished requests from the active elevator.
//!
//! ## Submission
//!
//! In passthrough mode the submitted request goes straight to the
//! transport. Otherwise it is inserted into the active policy under the
//! scheduler lock, and the policy's ready request is issued once the lock is
//! dropped. The ready request may have been submitted by another thread.
//!
//! ## Locks
//!
//! Device lock, then scheduler lock. `submit` never holds both; the
//! completion handler takes the scheduler lock while holding the device
//! lock.
//!
//! Both are taken from thread context and from the completion interrupt, so
//! both are [`IrqMutex`]es locked through the layer's [`IrqControl`]:
//! interrupts are masked on the local hart before either lock is taken and
//! restored once it is released. The interrupt handler is entered with
//! interrupts already masked and leaves them so. A thread waiting for its
//! transfer gives up the device lock only inside [`Sleeper::sleep`].

use core::sync::atomic::{AtomicU8, Ordering};

use super::mmio::VirtioMmio;
use super::scheduler::{Elevator, IoMode, SchedError, SchedulerConfig, SchedulerStats};
use super::virtio_blk::{VirtioBlk, DEFAULT_QUEUE_SIZE};
use super::{BlockError, Buf, Direction, Request};
use crate::sched::lock::IrqMutex;
use crate::sched::{Clock, IrqControl, NullIrq, Sleeper};

/// The block layer: transport, elevator state and active mode.
///
/// Created once at boot and never torn down. The transport's queue memory is
/// embedded, so the layer must not move after [`BlockLayer::init`].
pub struct BlockLayer<M, S, C, I = NullIrq, const N: usize = DEFAULT_QUEUE_SIZE> {
    transport: VirtioBlk<M, S, I, N>,
    elevator: IrqMutex<Elevator>,
    /// Active [`IoMode`], read without the scheduler lock
    mode: AtomicU8,
    clock: C,
    stats: SchedulerStats,
}

impl<M, S, C, I, const N: usize> BlockLayer<M, S, C, I, N>
where
    M: VirtioMmio,
    S: Sleeper,
    C: Clock,
    I: IrqControl,
{
    pub const fn new(mmio: M, sleeper: S, clock: C, irq: I, config: SchedulerConfig) -> Self {
        Self {
            transport: VirtioBlk::new(mmio, sleeper, irq),
            elevator: IrqMutex::new(Elevator::new(config.deadline_ticks)),
            mode: AtomicU8::new(config.mode.as_u8()),
            clock,
            stats: SchedulerStats::new(),
        }
    }

    /// Brings up the disk.
    pub fn init(&self) -> Result<(), BlockError> {
        self.transport.init()?;
        log::info!("[IOSCHED] Block layer ready, policy {}", self.policy());
        Ok(())
    }

    /// Reads or writes one block; returns once the layer has issued and
    /// completed a transfer for this call.
    pub fn submit(&self, dev: u32, blockno: u32, dir: Direction, buf: &'static Buf) {
        let request = Request::new(dev, blockno, dir, buf);
        SchedulerStats::bump(&self.stats.submitted);

        let mode = self.policy();
        if mode == IoMode::Passthrough {
            self.transport.rw(&request);
            return;
        }

        let ready = {
            let mut elevator = self.elevator.lock(self.transport.irq());
            let expired = elevator.deadline().expirations();
            let ready = match elevator.admit(mode, request, self.clock.now()) {
                Ok(ready) => ready,
                Err(err) => panic!(
                    "[IOSCHED] {}: {} with {} pending",
                    mode,
                    err,
                    elevator.pending(mode)
                ),
            };
            if elevator.deadline().expirations() != expired {
                SchedulerStats::bump(&self.stats.expired);
            }
            ready
        };

        if ready != request {
            log::trace!(
                "[IOSCHED] {}: block {} submitted, block {} issued",
                mode,
                blockno,
                ready.blockno
            );
        }
        SchedulerStats::bump(&self.stats.dispatched);
        self.transport.rw(&ready);
    }

    /// Completion interrupt. Returns the number of transfers drained.
    pub fn handle_interrupt(&self) -> usize {
        self.transport.handle_interrupt(|_| {
            SchedulerStats::bump(&self.stats.completed);
            let mode = self.policy();
            if mode == IoMode::Passthrough {
                return;
            }
            match self.elevator.lock(self.transport.irq()).retire(mode) {
                Some(retired) => {
                    SchedulerStats::bump(&self.stats.retired);
                    log::trace!("[IOSCHED] {}: retired block {}", mode, retired.blockno);
                }
                None => {
                    SchedulerStats::bump(&self.stats.spurious_retires);
                    log::warn!("[IOSCHED] {}: completion with nothing to retire", mode);
                }
            }
        })
    }

    /// Switches policy; takes effect for the next submission.
    pub fn set_policy(&self, mode: u8) -> Result<(), SchedError> {
        let mode = IoMode::from_u8(mode)?;
        let previous = self.mode.swap(mode.as_u8(), Ordering::Relaxed);
        log::info!(
            "[IOSCHED] Policy {} -> {}",
            IoMode::from_u8(previous).map_or("?", IoMode::name),
            mode
        );
        Ok(())
    }

    pub fn set_policy_by_name(&self, name: &str) -> Result<(), SchedError> {
        self.set_policy(IoMode::from_name(name)?.as_u8())
    }

    /// `IO_schedule(mode)` system call: 0 on success, -1 on a bad mode.
    pub fn sys_io_schedule(&self, mode: i64) -> i64 {
        let result = u8::try_from(mode)
            .map_err(|_| SchedError::InvalidMode)
            .and_then(|mode| self.set_policy(mode));
        match result {
            Ok(()) => 0,
            Err(err) => {
                log::warn!("[IOSCHED] IO_schedule({}): {}", mode, err);
                -1
            }
        }
    }

    pub fn policy(&self) -> IoMode {
        IoMode::from_u8(self.mode.load(Ordering::Relaxed)).unwrap_or(IoMode::Passthrough)
    }

    /// Requests held by the active policy
    pub fn pending(&self) -> usize {
        self.elevator.lock(self.transport.irq()).pending(self.policy())
    }

    /// Requests held by the policy for `mode`
    pub fn pending_in(&self, mode: IoMode) -> usize {
        self.elevator.lock(self.transport.irq()).pending(mode)
    }

    /// Changes the Deadline starvation limit.
    pub fn set_deadline_ticks(&self, ticks: u64) {
        self.elevator.lock(self.transport.irq()).set_deadline_ticks(ticks);
        log::info!("[IOSCHED] Deadline time limit {} ticks", ticks);
    }

    pub fn transport(&self) -> &VirtioBlk<M, S, I, N> {
        &self.transport
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }
}
