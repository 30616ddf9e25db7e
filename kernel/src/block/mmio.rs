//! # virtio-mmio Register Window
//!
//! Legacy (version 1) virtio over memory-mapped I/O, as presented by QEMU's
//! `virt` machine.
//!
//! ## Memory Map (QEMU virt)
//!
//! ```text
//! 0x10001000 - virtio-mmio slot 0 (the disk, PLIC source 1)
//! ```

use core::ptr::{read_volatile, write_volatile};

/// MMIO base of the first virtio slot (QEMU virt machine)
pub const VIRTIO0: usize = 0x1000_1000;

/// Legacy virtio-mmio register offsets
pub mod regs {
    /// 0x74726976 ("virt")
    pub const MAGIC_VALUE: usize = 0x000;
    /// 1 for legacy
    pub const VERSION: usize = 0x004;
    /// 1 is net, 2 is disk
    pub const DEVICE_ID: usize = 0x008;
    /// 0x554d4551 ("QEMU")
    pub const VENDOR_ID: usize = 0x00c;
    pub const DEVICE_FEATURES: usize = 0x010;
    pub const DRIVER_FEATURES: usize = 0x020;
    /// Page size for PFN, write-only
    pub const GUEST_PAGE_SIZE: usize = 0x028;
    /// Select queue, write-only
    pub const QUEUE_SEL: usize = 0x030;
    /// Max size of current queue, read-only
    pub const QUEUE_NUM_MAX: usize = 0x034;
    /// Size of current queue, write-only
    pub const QUEUE_NUM: usize = 0x038;
    /// Used ring alignment, write-only
    pub const QUEUE_ALIGN: usize = 0x03c;
    /// Physical page number for queue, read/write
    pub const QUEUE_PFN: usize = 0x040;
    /// Ready bit
    pub const QUEUE_READY: usize = 0x044;
    /// Write-only
    pub const QUEUE_NOTIFY: usize = 0x050;
    /// Read-only
    pub const INTERRUPT_STATUS: usize = 0x060;
    /// Write-only
    pub const INTERRUPT_ACK: usize = 0x064;
    /// Read/write
    pub const STATUS: usize = 0x070;
}

/// Expected register identification values
pub mod ident {
    pub const MAGIC: u32 = 0x7472_6976;
    pub const VERSION_LEGACY: u32 = 1;
    pub const DEVICE_BLOCK: u32 = 2;
    pub const VENDOR_QEMU: u32 = 0x554d_4551;
}

/// Access to a virtio-mmio register window.
///
/// Registers are 32 bits wide and addressed by byte offset from the window
/// base (see [`regs`]).
pub trait VirtioMmio: Send + Sync {
    /// Reads a register
    fn read(&self, offset: usize) -> u32;

    /// Writes a register
    fn write(&self, offset: usize, value: u32);
}

impl<M: VirtioMmio + ?Sized> VirtioMmio for &M {
    fn read(&self, offset: usize) -> u32 {
        (**self).read(offset)
    }

    fn write(&self, offset: usize, value: u32) {
        (**self).write(offset, value)
    }
}

/// A real register window at a fixed physical address.
#[derive(Debug)]
pub struct MmioRegion {
    base: usize,
}

impl MmioRegion {
    /// Creates a window at `base`.
    ///
    /// # Safety
    ///
    /// `base` must map a virtio-mmio register window for the lifetime of the
    /// returned value, and nothing else may drive that device.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    /// The disk at [`VIRTIO0`].
    ///
    /// # Safety
    ///
    /// Same contract as [`MmioRegion::new`].
    pub const unsafe fn virtio0() -> Self {
        // SAFETY: forwarded to the caller.
        unsafe { Self::new(VIRTIO0) }
    }

    /// Window base address
    pub fn base(&self) -> usize {
        self.base
    }
}

impl VirtioMmio for MmioRegion {
    fn read(&self, offset: usize) -> u32 {
        // SAFETY: `new` guarantees the window is mapped device memory.
        unsafe { read_volatile((self.base + offset) as *const u32) }
    }

    fn write(&self, offset: usize, value: u32) {
        // SAFETY: `new` guarantees the window is mapped device memory.
        unsafe { write_volatile((self.base + offset) as *mut u32, value) }
    }
}
