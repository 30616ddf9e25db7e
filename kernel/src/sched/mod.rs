//! # Scheduler Hooks
//!
//! The block layer never schedules threads itself. The kernel lends it three
//! primitives:
//!
//! - [`Sleeper`]: suspend the calling thread on a [`WaitChannel`], and resume
//!   every thread suspended on a channel
//! - [`Clock`]: the timer tick, used to age Deadline requests
//! - [`IrqControl`]: mask and restore interrupts on the local hart
//!
//! [`SpinSleeper`], [`TickCounter`] and [`NullIrq`] are the implementations
//! used before the process scheduler is up.

pub mod lock;

use core::sync::atomic::{AtomicU64, Ordering};

use lock::IrqMutexGuard;

/// Key a thread sleeps on.
///
/// Channels are plain addresses: a buffer's address for "transfer done", the
/// descriptor pool's address for "a chain was freed".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WaitChannel(usize);

impl WaitChannel {
    /// Creates a channel from a raw key.
    pub const fn new(key: usize) -> Self {
        Self(key)
    }

    /// The channel identified by an object's address.
    pub fn of<T>(object: &T) -> Self {
        Self(object as *const T as usize)
    }

    /// Raw key value
    pub const fn key(&self) -> usize {
        self.0
    }
}

/// Suspension and wakeup, provided by the process scheduler.
pub trait Sleeper: Send + Sync {
    /// Releases `guard` and suspends the calling thread on `chan`, as one
    /// step, then re-takes the lock before returning.
    ///
    /// A `wakeup(chan)` issued by anyone who takes the lock after this call
    /// begins must resume the thread, so an implementation has to register
    /// the thread as sleeping before it releases the lock. Returning does not
    /// mean the awaited condition holds: callers re-check it and sleep again,
    /// so spurious returns are allowed.
    fn sleep<'a, T, I: IrqControl>(
        &self,
        chan: WaitChannel,
        guard: IrqMutexGuard<'a, T, I>,
    ) -> IrqMutexGuard<'a, T, I>;

    /// Resumes every thread sleeping on `chan`.
    fn wakeup(&self, chan: WaitChannel);
}

impl<S: Sleeper + ?Sized> Sleeper for &S {
    fn sleep<'a, T, I: IrqControl>(
        &self,
        chan: WaitChannel,
        guard: IrqMutexGuard<'a, T, I>,
    ) -> IrqMutexGuard<'a, T, I> {
        (**self).sleep(chan, guard)
    }

    fn wakeup(&self, chan: WaitChannel) {
        (**self).wakeup(chan)
    }
}

/// Busy-waiting sleeper.
///
/// `sleep` releases the lock, spins briefly with interrupts restored, and
/// takes the lock again, so the caller simply re-polls its condition. It
/// never suspends, so it cannot miss a wakeup; it assumes completions are
/// delivered concurrently (by an interrupt on this or another hart) while it
/// spins.
#[derive(Debug)]
pub struct SpinSleeper {
    spins: u32,
}

impl SpinSleeper {
    /// Creates a sleeper that spins 64 iterations per `sleep`.
    pub const fn new() -> Self {
        Self { spins: 64 }
    }

    /// Creates a sleeper with a custom spin count.
    pub const fn with_spins(spins: u32) -> Self {
        Self { spins }
    }
}

impl Default for SpinSleeper {
    fn default() -> Self {
        Self::new()
    }
}

impl Sleeper for SpinSleeper {
    fn sleep<'a, T, I: IrqControl>(
        &self,
        _chan: WaitChannel,
        guard: IrqMutexGuard<'a, T, I>,
    ) -> IrqMutexGuard<'a, T, I> {
        let (lock, irq) = (guard.mutex(), guard.irq());
        drop(guard);
        for _ in 0..self.spins {
            core::hint::spin_loop();
        }
        lock.lock(irq)
    }

    fn wakeup(&self, _chan: WaitChannel) {}
}

/// Local interrupt masking, provided by the architecture layer.
pub trait IrqControl: Send + Sync {
    /// Masks interrupts on this hart. Returns whether they were enabled.
    fn disable(&self) -> bool;

    /// Re-enables interrupts if `was_enabled`, otherwise leaves them masked.
    fn restore(&self, was_enabled: bool);
}

impl<I: IrqControl + ?Sized> IrqControl for &I {
    fn disable(&self) -> bool {
        (**self).disable()
    }

    fn restore(&self, was_enabled: bool) {
        (**self).restore(was_enabled)
    }
}

/// Interrupt control for contexts with no interrupts to mask: early boot
/// before the PLIC is programmed, and hosted builds.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullIrq;

impl IrqControl for NullIrq {
    fn disable(&self) -> bool {
        false
    }

    fn restore(&self, _was_enabled: bool) {}
}

/// Monotonic tick source.
pub trait Clock: Send + Sync {
    /// Current tick count
    fn now(&self) -> u64;
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> u64 {
        (**self).now()
    }
}

/// Tick counter advanced by the timer interrupt.
#[derive(Debug, Default)]
pub struct TickCounter {
    ticks: AtomicU64,
}

impl TickCounter {
    /// Creates a counter at tick 0.
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
        }
    }

    /// Advances the counter by one tick and returns the new value.
    pub fn tick(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Advances the counter by `n` ticks.
    pub fn advance(&self, n: u64) {
        self.ticks.fetch_add(n, Ordering::AcqRel);
    }
}

impl Clock for TickCounter {
    fn now(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }
}
