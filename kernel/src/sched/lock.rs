//! # Interrupt-Safe Spinlock
//!
//! A `spin::Mutex` that masks interrupts on the local hart while it is held.
//! Any lock the disk interrupt handler takes must be one of these: if the
//! interrupt landed on a hart already holding the lock, the handler would
//! spin on it forever.
//!
//! Interrupts are masked before the lock is taken and restored after it is
//! released. Nested guards restore only at the outermost release.

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

use super::IrqControl;

/// Spinlock whose critical sections run with interrupts masked.
pub struct IrqMutex<T> {
    inner: Mutex<T>,
}

impl<T> IrqMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Masks interrupts through `irq`, then takes the lock.
    pub fn lock<'a, I: IrqControl>(&'a self, irq: &'a I) -> IrqMutexGuard<'a, T, I> {
        let was_enabled = irq.disable();
        IrqMutexGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
            lock: self,
            irq,
            was_enabled,
        }
    }
}

/// Held lock plus the interrupt state to restore on release.
pub struct IrqMutexGuard<'a, T, I: IrqControl> {
    guard: ManuallyDrop<MutexGuard<'a, T>>,
    lock: &'a IrqMutex<T>,
    irq: &'a I,
    was_enabled: bool,
}

impl<'a, T, I: IrqControl> IrqMutexGuard<'a, T, I> {
    /// The lock this guard holds, for re-acquiring after a release.
    pub fn mutex(&self) -> &'a IrqMutex<T> {
        self.lock
    }

    /// The interrupt control the lock was taken with.
    pub fn irq(&self) -> &'a I {
        self.irq
    }
}

impl<T, I: IrqControl> Deref for IrqMutexGuard<'_, T, I> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T, I: IrqControl> DerefMut for IrqMutexGuard<'_, T, I> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T, I: IrqControl> Drop for IrqMutexGuard<'_, T, I> {
    fn drop(&mut self) {
        // SAFETY: the guard is dropped exactly once, here, and never used
        // after.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        self.irq.restore(self.was_enabled);
    }
}
