//! # VirtIO Block Device Driver
//!
//! Legacy virtio-mmio block transport for QEMU's `virtio-blk-device`.
//!
//! ## Protocol
//!
//! Every transfer is a chain of three descriptors:
//! 1. Request header (type, reserved, sector), read by the device
//! 2. The block's data buffer (written by the device on reads)
//! 3. A 1-byte status the device sets to 0 on success
//!
//! The driver publishes the chain head in the avail ring, notifies the
//! device, and sleeps until the completion interrupt walks the used ring.
//!
//! ## Locking
//!
//! One lock guards the descriptor pool and the device registers. It is held
//! across the whole issue sequence and released only by [`Sleeper::sleep`],
//! which suspends the issuer in the same step, either for a free chain or for
//! its transfer to finish. The completion interrupt takes the same lock, so
//! it is an [`IrqMutex`]: interrupts stay masked on the local hart while it
//! is held.
//!
//! ## References
//!
//! - VirtIO Spec 1.1, Section 2.6 (legacy split virtqueues)
//! - VirtIO Spec 1.1, Section 5.2 (Block Device)

use core::cell::UnsafeCell;
use core::mem::size_of;
use core::ptr::{addr_of, addr_of_mut, read_volatile, write_bytes, write_volatile};
use core::sync::atomic::{fence, AtomicU64, Ordering};

use bitflags::bitflags;

use super::mmio::{ident, regs, VirtioMmio};
use super::{BlockError, Buf, Request, BSIZE};
use crate::sched::lock::IrqMutex;
use crate::sched::{IrqControl, NullIrq, Sleeper, WaitChannel};

/// Default descriptor pool size (QEMU accepts up to 1024)
pub const DEFAULT_QUEUE_SIZE: usize = 8;

/// Descriptors per transfer: header, data, status
pub const CHAIN_LEN: usize = 3;

/// Page size for the legacy queue PFN
const PAGE_SIZE: usize = 4096;
const PAGE_SHIFT: usize = 12;

/// VirtIO block request types
pub mod request_type {
    pub const VIRTIO_BLK_T_IN: u32 = 0; // Read
    pub const VIRTIO_BLK_T_OUT: u32 = 1; // Write
}

/// Status byte value before the device answers
const STATUS_PENDING: u8 = 0xff;

bitflags! {
    /// VirtIO device status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceStatus: u32 {
        const ACKNOWLEDGE = 1;
        const DRIVER = 2;
        const DRIVER_OK = 4;
        const FEATURES_OK = 8;
    }
}

bitflags! {
    /// Device feature bits this driver knows about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u32 {
        /// Disk is read-only
        const BLK_RO = 1 << 5;
        /// Supports scsi command passthru
        const BLK_SCSI = 1 << 7;
        /// Writeback mode available in config
        const BLK_CONFIG_WCE = 1 << 11;
        /// Support more than one vq
        const BLK_MQ = 1 << 12;
        const ANY_LAYOUT = 1 << 27;
        const RING_INDIRECT_DESC = 1 << 28;
        const RING_EVENT_IDX = 1 << 29;

        /// Everything this driver refuses during negotiation
        const UNSUPPORTED = Self::BLK_RO.bits()
            | Self::BLK_SCSI.bits()
            | Self::BLK_CONFIG_WCE.bits()
            | Self::BLK_MQ.bits()
            | Self::ANY_LAYOUT.bits()
            | Self::RING_INDIRECT_DESC.bits()
            | Self::RING_EVENT_IDX.bits();
    }
}

bitflags! {
    /// Descriptor flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescFlags: u16 {
        /// Chained with another descriptor
        const NEXT = 1;
        /// Device writes (vs read)
        const WRITE = 2;
    }
}

/// VirtIO block request header
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtioBlkReqHeader {
    pub request_type: u32,
    pub reserved: u32,
    pub sector: u64,
}

/// VirtIO ring descriptor
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl VirtqDesc {
    const EMPTY: VirtqDesc = VirtqDesc {
        addr: 0,
        len: 0,
        flags: 0,
        next: 0,
    };
}

/// Available ring
#[repr(C)]
pub struct VirtqAvail<const N: usize> {
    pub flags: u16,
    /// Driver writes ring[idx % N] next
    pub idx: u16,
    /// Chain head descriptor numbers
    pub ring: [u16; N],
    pub unused: u16,
}

/// Used ring element
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtqUsedElem {
    /// Index of start of completed descriptor chain
    pub id: u32,
    pub len: u32,
}

/// Used ring
#[repr(C)]
pub struct VirtqUsed<const N: usize> {
    pub flags: u16,
    /// Device increments when it adds a ring[] entry
    pub idx: u16,
    pub ring: [VirtqUsedElem; N],
}

/// Used ring, starting on its own page as the legacy layout requires.
#[repr(C, align(4096))]
pub struct UsedPage<const N: usize>(pub VirtqUsed<N>);

/// Legacy virtqueue memory: descriptors, then the avail ring, then the used
/// ring at the next page boundary.
#[repr(C, align(4096))]
pub struct VirtqPages<const N: usize> {
    pub desc: [VirtqDesc; N],
    pub avail: VirtqAvail<N>,
    pub used: UsedPage<N>,
}

impl<const N: usize> VirtqPages<N> {
    /// Queue sizes must be a power of two (ring indices wrap at 2^16), hold
    /// at least one chain, and leave desc + avail inside the first page.
    const LAYOUT_OK: () = assert!(
        N.is_power_of_two()
            && N > CHAIN_LEN
            && size_of::<[VirtqDesc; N]>() + size_of::<VirtqAvail<N>>() <= PAGE_SIZE,
        "virtqueue size must be a power of two between 4 and 128"
    );

    const EMPTY: Self = Self {
        desc: [VirtqDesc::EMPTY; N],
        avail: VirtqAvail {
            flags: 0,
            idx: 0,
            ring: [0; N],
            unused: 0,
        },
        used: UsedPage(VirtqUsed {
            flags: 0,
            idx: 0,
            ring: [VirtqUsedElem { id: 0, len: 0 }; N],
        }),
    };
}

/// Memory shared with the device.
#[repr(C)]
struct DmaArea<const N: usize> {
    ring: VirtqPages<N>,
    /// Request headers, one-for-one with descriptors
    ops: [VirtioBlkReqHeader; N],
    /// Status bytes, indexed by chain head
    status: [u8; N],
}

impl<const N: usize> DmaArea<N> {
    const EMPTY: Self = Self {
        ring: VirtqPages::EMPTY,
        ops: [VirtioBlkReqHeader {
            request_type: 0,
            reserved: 0,
            sector: 0,
        }; N],
        status: [0; N],
    };
}

/// Physical addresses of the queue regions, for diagnostics and device models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLayout {
    pub desc: usize,
    pub avail: usize,
    pub used: usize,
    pub size: usize,
}

/// A chain handed to the device, tracked by its head index.
#[derive(Debug, Clone, Copy)]
struct InFlight {
    buf: &'static Buf,
    done: bool,
}

/// Descriptor pool bookkeeping, guarded by the device lock.
struct DiskState<const N: usize> {
    /// Is a descriptor free?
    free: [bool; N],
    /// We've looked this far in used.ring
    used_idx: u16,
    /// In-flight operations, indexed by chain head
    info: [Option<InFlight>; N],
}

impl<const N: usize> DiskState<N> {
    const fn new() -> Self {
        Self {
            free: [false; N],
            used_idx: 0,
            info: [None; N],
        }
    }

    fn reset(&mut self) {
        self.free = [true; N];
        self.used_idx = 0;
        self.info = [None; N];
    }

    /// Finds a free descriptor and marks it used.
    fn alloc(&mut self) -> Option<usize> {
        let i = self.free.iter().position(|&free| free)?;
        self.free[i] = false;
        Some(i)
    }

    /// Allocates three descriptors, or none.
    fn alloc_chain(&mut self) -> Option<[usize; CHAIN_LEN]> {
        let mut idx = [0; CHAIN_LEN];
        for i in 0..CHAIN_LEN {
            match self.alloc() {
                Some(d) => idx[i] = d,
                None => {
                    for &d in &idx[..i] {
                        self.release(d);
                    }
                    return None;
                }
            }
        }
        Some(idx)
    }

    /// Marks a descriptor free.
    fn release(&mut self, i: usize) {
        if i >= N {
            panic!("free_desc: descriptor {} out of range", i);
        }
        if self.free[i] {
            panic!("free_desc: descriptor {} already free", i);
        }
        self.free[i] = true;
    }

    fn free_count(&self) -> usize {
        self.free.iter().filter(|&&free| free).count()
    }

    fn in_flight(&self) -> usize {
        self.info.iter().filter(|info| info.is_some()).count()
    }
}

/// Transport counters.
pub struct TransportStats {
    /// Chains published to the device
    pub issued: AtomicU64,
    /// Chains retired from the used ring
    pub completed: AtomicU64,
    /// Times an issuer found the pool exhausted and slept
    pub descriptor_waits: AtomicU64,
}

impl TransportStats {
    pub const fn new() -> Self {
        Self {
            issued: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            descriptor_waits: AtomicU64::new(0),
        }
    }
}

impl Default for TransportStats {
    fn default() -> Self {
        Self::new()
    }
}

/// VirtIO block transport with an `N`-descriptor pool.
pub struct VirtioBlk<M, S, I = NullIrq, const N: usize = DEFAULT_QUEUE_SIZE> {
    mmio: M,
    sleeper: S,
    irq: I,
    state: IrqMutex<DiskState<N>>,
    /// Only touched with `state` locked, or by the device
    dma: UnsafeCell<DmaArea<N>>,
    stats: TransportStats,
}

// The DMA area is only written while the device lock is held; the device
// itself writes the used ring and status bytes, which are read volatile.
unsafe impl<M: Sync, S: Sync, I: Sync, const N: usize> Sync for VirtioBlk<M, S, I, N> {}

impl<M: VirtioMmio, S: Sleeper, I: IrqControl, const N: usize> VirtioBlk<M, S, I, N> {
    /// Creates an uninitialized transport.
    ///
    /// The device learns the queue address in [`VirtioBlk::init`], so the
    /// transport must not move afterwards; keep it in a `static` or leak it.
    pub const fn new(mmio: M, sleeper: S, irq: I) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = VirtqPages::<N>::LAYOUT_OK;
        Self {
            mmio,
            sleeper,
            irq,
            state: IrqMutex::new(DiskState::new()),
            dma: UnsafeCell::new(DmaArea::EMPTY),
            stats: TransportStats::new(),
        }
    }

    /// Brings the device up and hands it queue 0.
    pub fn init(&self) -> Result<(), BlockError> {
        let magic = self.mmio.read(regs::MAGIC_VALUE);
        let version = self.mmio.read(regs::VERSION);
        let device_id = self.mmio.read(regs::DEVICE_ID);
        let vendor_id = self.mmio.read(regs::VENDOR_ID);
        if magic != ident::MAGIC
            || version != ident::VERSION_LEGACY
            || device_id != ident::DEVICE_BLOCK
            || vendor_id != ident::VENDOR_QEMU
        {
            log::error!(
                "[VIRTIO-BLK] No disk: magic=0x{:08x} version={} device={} vendor=0x{:08x}",
                magic,
                version,
                device_id,
                vendor_id
            );
            return Err(BlockError::NotFound);
        }

        let mut status = DeviceStatus::ACKNOWLEDGE;
        self.write_status(status);

        status |= DeviceStatus::DRIVER;
        self.write_status(status);

        // Negotiate features
        let offered = Features::from_bits_retain(self.mmio.read(regs::DEVICE_FEATURES));
        let accepted = offered.difference(Features::UNSUPPORTED);
        self.mmio.write(regs::DRIVER_FEATURES, accepted.bits());
        log::debug!(
            "[VIRTIO-BLK] Features offered 0x{:08x}, accepted 0x{:08x}",
            offered.bits(),
            accepted.bits()
        );

        // Tell device that feature negotiation is complete.
        status |= DeviceStatus::FEATURES_OK;
        self.write_status(status);

        // Tell device we're completely ready.
        status |= DeviceStatus::DRIVER_OK;
        self.write_status(status);

        self.mmio.write(regs::GUEST_PAGE_SIZE, PAGE_SIZE as u32);

        // Initialize queue 0.
        self.mmio.write(regs::QUEUE_SEL, 0);
        let max = self.mmio.read(regs::QUEUE_NUM_MAX) as usize;
        if max == 0 {
            log::error!("[VIRTIO-BLK] Queue 0 not available");
            return Err(BlockError::NotReady);
        }
        if max < N {
            log::error!("[VIRTIO-BLK] Queue 0 holds {} descriptors, need {}", max, N);
            return Err(BlockError::InvalidSize);
        }
        self.mmio.write(regs::QUEUE_NUM, N as u32);

        let mut state = self.state.lock(&self.irq);
        // SAFETY: the device lock is held and the device has no queue yet.
        unsafe { write_bytes(self.dma.get(), 0, 1) };
        let layout = self.queue_layout();
        self.mmio
            .write(regs::QUEUE_PFN, (layout.desc >> PAGE_SHIFT) as u32);

        // All N descriptors start out unused.
        state.reset();
        drop(state);

        log::info!(
            "[VIRTIO-BLK] Queue of {} descriptors at 0x{:x}",
            N,
            layout.desc
        );
        Ok(())
    }

    /// Reads or writes one block and returns once the device is done.
    pub fn rw(&self, req: &Request) {
        let buf = req.buf;
        let mut state = self.state.lock(&self.irq);

        // Legacy block operations use three descriptors: one for
        // type/reserved/sector, one for the data, one for a 1-byte status.
        let mut waited = false;
        let idx = loop {
            if let Some(idx) = state.alloc_chain() {
                break idx;
            }
            if !waited {
                log::warn!(
                    "[VIRTIO-BLK] Descriptor pool exhausted, block {} waits",
                    req.blockno
                );
                waited = true;
            }
            self.stats.descriptor_waits.fetch_add(1, Ordering::Relaxed);
            state = self.sleeper.sleep(self.free_channel(), state);
        };

        let dma = self.dma.get();
        // SAFETY: the three descriptors, the header slot and the status slot
        // of this chain belong to us until `free_chain`; the lock is held.
        unsafe {
            let header = addr_of_mut!((*dma).ops[idx[0]]);
            write_volatile(
                header,
                VirtioBlkReqHeader {
                    request_type: if req.dir.is_write() {
                        request_type::VIRTIO_BLK_T_OUT
                    } else {
                        request_type::VIRTIO_BLK_T_IN
                    },
                    reserved: 0,
                    sector: req.sector(),
                },
            );
            self.write_desc(
                idx[0],
                VirtqDesc {
                    addr: header as u64,
                    len: size_of::<VirtioBlkReqHeader>() as u32,
                    flags: DescFlags::NEXT.bits(),
                    next: idx[1] as u16,
                },
            );

            let data_flags = if req.dir.is_write() {
                DescFlags::NEXT // device reads b->data
            } else {
                DescFlags::NEXT | DescFlags::WRITE // device writes b->data
            };
            self.write_desc(
                idx[1],
                VirtqDesc {
                    addr: buf.data_ptr() as u64,
                    len: BSIZE as u32,
                    flags: data_flags.bits(),
                    next: idx[2] as u16,
                },
            );

            // Device writes 0 on success
            let status = addr_of_mut!((*dma).status[idx[0]]);
            write_volatile(status, STATUS_PENDING);
            self.write_desc(
                idx[2],
                VirtqDesc {
                    addr: status as u64,
                    len: 1,
                    flags: DescFlags::WRITE.bits(),
                    next: 0,
                },
            );
        }

        // Record the buffer for the completion interrupt.
        buf.give_to_disk();
        state.info[idx[0]] = Some(InFlight { buf, done: false });

        // Tell the device the first index in our chain, then that another
        // avail ring entry is available.
        // SAFETY: the avail ring is only written under the device lock.
        unsafe {
            let avail = addr_of_mut!((*dma).ring.avail);
            let avail_idx = read_volatile(addr_of!((*avail).idx));
            write_volatile(
                addr_of_mut!((*avail).ring[avail_idx as usize % N]),
                idx[0] as u16,
            );
            fence(Ordering::SeqCst);
            write_volatile(addr_of_mut!((*avail).idx), avail_idx.wrapping_add(1));
            fence(Ordering::SeqCst);
        }

        self.mmio.write(regs::QUEUE_NOTIFY, 0); // value is queue number
        self.stats.issued.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "[VIRTIO-BLK] {:?} block {} (sector {}) on chain {}",
            req.dir,
            req.blockno,
            req.sector(),
            idx[0]
        );

        // Wait for handle_interrupt() to say the chain has finished. Two
        // chains may carry the same buffer, so the chain's own completion
        // decides, not the buffer flag alone.
        while !state.info[idx[0]].map_or(true, |info| info.done) {
            state = self.sleeper.sleep(buf.channel(), state);
        }

        state.info[idx[0]] = None;
        self.free_chain(&mut state, idx[0]);
    }

    /// Completion interrupt: acknowledges the device and drains the used ring.
    ///
    /// `on_complete` runs once per drained chain, after its buffer has been
    /// handed back and its issuer woken, with the device lock still held.
    /// Returns the number of chains drained.
    pub fn handle_interrupt<F>(&self, mut on_complete: F) -> usize
    where
        F: FnMut(&'static Buf),
    {
        let mut state = self.state.lock(&self.irq);

        // The device won't raise another interrupt until we tell it we've
        // seen this one. This may race with the device writing new entries
        // to the used ring, in which case we process them now and have
        // nothing to do in the next interrupt, which is harmless.
        let pending = self.mmio.read(regs::INTERRUPT_STATUS) & 0x3;
        self.mmio.write(regs::INTERRUPT_ACK, pending);
        fence(Ordering::SeqCst);

        let dma = self.dma.get();
        let mut drained = 0;
        loop {
            // SAFETY: the used ring is device-written; read it volatile.
            let used_idx = unsafe { read_volatile(addr_of!((*dma).ring.used.0.idx)) };
            if state.used_idx == used_idx {
                break;
            }
            fence(Ordering::SeqCst);

            let slot = state.used_idx as usize % N;
            // SAFETY: as above.
            let id = unsafe { read_volatile(addr_of!((*dma).ring.used.0.ring[slot].id)) } as usize;
            if id >= N {
                panic!("virtio_disk_intr: used id {} out of range", id);
            }
            // SAFETY: the device has finished with this chain's status byte.
            let status = unsafe { read_volatile(addr_of!((*dma).status[id])) };
            if status != 0 {
                panic!("virtio_disk_intr status {} on chain {}", status, id);
            }

            let info = match state.info[id].as_mut() {
                Some(info) => info,
                None => panic!("virtio_disk_intr: no request on chain {}", id),
            };
            info.done = true;
            let buf = info.buf;

            // Disk is done with buf
            buf.take_from_disk();
            self.sleeper.wakeup(buf.channel());

            state.used_idx = state.used_idx.wrapping_add(1);
            drained += 1;
            self.stats.completed.fetch_add(1, Ordering::Relaxed);
            on_complete(buf);
        }

        drained
    }

    /// Addresses of the descriptor table and rings.
    pub fn queue_layout(&self) -> QueueLayout {
        let dma = self.dma.get();
        // Identity-mapped kernel: virtual == physical.
        // SAFETY: `dma` points at our own DMA area; `addr_of!` only computes
        // field addresses and reads nothing.
        let (desc, avail, used) = unsafe {
            (
                addr_of!((*dma).ring.desc) as usize,
                addr_of!((*dma).ring.avail) as usize,
                addr_of!((*dma).ring.used) as usize,
            )
        };
        QueueLayout {
            desc,
            avail,
            used,
            size: N,
        }
    }

    /// Chains currently handed to the device
    pub fn in_flight(&self) -> usize {
        self.state.lock(&self.irq).in_flight()
    }

    /// Descriptors currently free
    pub fn free_descriptors(&self) -> usize {
        self.state.lock(&self.irq).free_count()
    }

    /// Channel issuers sleep on while the pool is exhausted.
    pub fn free_channel(&self) -> WaitChannel {
        WaitChannel::of(&self.state)
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    pub fn sleeper(&self) -> &S {
        &self.sleeper
    }

    pub fn irq(&self) -> &I {
        &self.irq
    }

    fn write_status(&self, status: DeviceStatus) {
        self.mmio.write(regs::STATUS, status.bits());
    }

    /// # Safety
    ///
    /// The device lock must be held and descriptor `i` owned by the caller.
    unsafe fn write_desc(&self, i: usize, desc: VirtqDesc) {
        let dma = self.dma.get();
        // SAFETY: forwarded to the caller.
        unsafe { write_volatile(addr_of_mut!((*dma).ring.desc[i]), desc) };
    }

    /// Marks a descriptor free and wakes anyone waiting for the pool.
    fn free_desc(&self, state: &mut DiskState<N>, i: usize) {
        state.release(i);
        // SAFETY: the lock is held (we have `state`) and `i` was ours.
        unsafe { self.write_desc(i, VirtqDesc::EMPTY) };
        self.sleeper.wakeup(self.free_channel());
    }

    /// Frees a chain of descriptors.
    fn free_chain(&self, state: &mut DiskState<N>, mut i: usize) {
        let dma = self.dma.get();
        loop {
            // SAFETY: the lock is held and the chain is ours until freed.
            let desc = unsafe { read_volatile(addr_of!((*dma).ring.desc[i])) };
            self.free_desc(state, i);
            if DescFlags::from_bits_truncate(desc.flags).contains(DescFlags::NEXT) {
                i = desc.next as usize;
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::lock::tests::Hart;
    use crate::sched::SpinSleeper;
    use spin::Mutex;

    /// Register file that answers like QEMU's legacy virtio-blk.
    struct FakeRegs {
        regs: Mutex<[u32; 0x80 / 4]>,
    }

    impl FakeRegs {
        fn disk(queue_max: u32) -> Self {
            let mut regs = [0u32; 0x80 / 4];
            regs[regs::MAGIC_VALUE / 4] = ident::MAGIC;
            regs[regs::VERSION / 4] = ident::VERSION_LEGACY;
            regs[regs::DEVICE_ID / 4] = ident::DEVICE_BLOCK;
            regs[regs::VENDOR_ID / 4] = ident::VENDOR_QEMU;
            regs[regs::DEVICE_FEATURES / 4] = (Features::BLK_RO | Features::BLK_MQ).bits() | 1 << 9;
            regs[regs::QUEUE_NUM_MAX / 4] = queue_max;
            Self {
                regs: Mutex::new(regs),
            }
        }

        fn get(&self, offset: usize) -> u32 {
            self.regs.lock()[offset / 4]
        }
    }

    impl VirtioMmio for FakeRegs {
        fn read(&self, offset: usize) -> u32 {
            self.regs.lock()[offset / 4]
        }

        fn write(&self, offset: usize, value: u32) {
            self.regs.lock()[offset / 4] = value;
        }
    }

    #[test]
    fn test_queue_layout_is_legacy() {
        assert_eq!(size_of::<VirtqDesc>(), 16);
        assert_eq!(size_of::<VirtioBlkReqHeader>(), 16);
        assert_eq!(core::mem::align_of::<VirtqPages<8>>(), PAGE_SIZE);

        let blk: Box<VirtioBlk<FakeRegs, SpinSleeper>> =
            Box::new(VirtioBlk::new(FakeRegs::disk(8), SpinSleeper::new(), NullIrq));
        let layout = blk.queue_layout();
        assert_eq!(layout.desc % PAGE_SIZE, 0);
        assert_eq!(layout.avail, layout.desc + 8 * 16);
        assert_eq!(layout.used, layout.desc + PAGE_SIZE);
        assert_eq!(layout.size, 8);
    }

    #[test]
    fn test_init_negotiates_and_publishes_queue() {
        let blk: Box<VirtioBlk<FakeRegs, SpinSleeper>> =
            Box::new(VirtioBlk::new(FakeRegs::disk(1024), SpinSleeper::new(), NullIrq));
        blk.init().unwrap();

        let regs = &blk.mmio;
        assert_eq!(regs.get(regs::STATUS), 0xf);
        assert_eq!(regs.get(regs::DRIVER_FEATURES), 1 << 9);
        assert_eq!(regs.get(regs::GUEST_PAGE_SIZE), 4096);
        assert_eq!(regs.get(regs::QUEUE_NUM), 8);
        assert_eq!(
            regs.get(regs::QUEUE_PFN),
            (blk.queue_layout().desc >> PAGE_SHIFT) as u32
        );
        assert_eq!(blk.free_descriptors(), 8);
        assert_eq!(blk.in_flight(), 0);
    }

    #[test]
    fn test_init_rejects_missing_device() {
        let regs = FakeRegs::disk(8);
        regs.write(regs::MAGIC_VALUE, 0);
        let blk: Box<VirtioBlk<FakeRegs, SpinSleeper>> =
            Box::new(VirtioBlk::new(regs, SpinSleeper::new(), NullIrq));
        assert_eq!(blk.init(), Err(BlockError::NotFound));

        let regs = FakeRegs::disk(8);
        regs.write(regs::DEVICE_ID, 1);
        let blk: Box<VirtioBlk<FakeRegs, SpinSleeper>> =
            Box::new(VirtioBlk::new(regs, SpinSleeper::new(), NullIrq));
        assert_eq!(blk.init(), Err(BlockError::NotFound));
    }

    #[test]
    fn test_init_rejects_short_queue() {
        let blk: Box<VirtioBlk<FakeRegs, SpinSleeper>> =
            Box::new(VirtioBlk::new(FakeRegs::disk(0), SpinSleeper::new(), NullIrq));
        assert_eq!(blk.init(), Err(BlockError::NotReady));

        let blk: Box<VirtioBlk<FakeRegs, SpinSleeper>> =
            Box::new(VirtioBlk::new(FakeRegs::disk(4), SpinSleeper::new(), NullIrq));
        assert_eq!(blk.init(), Err(BlockError::InvalidSize));
    }

    #[test]
    fn test_device_lock_masks_interrupts() {
        let blk: Box<VirtioBlk<FakeRegs, SpinSleeper, Hart>> = Box::new(VirtioBlk::new(
            FakeRegs::disk(8),
            SpinSleeper::new(),
            Hart::new(),
        ));
        blk.init().unwrap();
        let hart = blk.irq();
        let disables = hart.disables.load(Ordering::SeqCst);
        assert!(disables >= 1);
        assert!(hart.enabled());

        assert_eq!(blk.in_flight(), 0);
        assert_eq!(hart.disables.load(Ordering::SeqCst), disables + 1);
        assert_eq!(
            hart.disables.load(Ordering::SeqCst),
            hart.restores.load(Ordering::SeqCst)
        );

        // The handler runs masked from trap entry and leaves the hart masked.
        let trap = hart.disable();
        assert_eq!(blk.handle_interrupt(|_| {}), 0);
        assert!(!hart.enabled());
        hart.restore(trap);
        assert!(hart.enabled());
    }

    #[test]
    fn test_chain_allocation_is_all_or_nothing() {
        let mut state = DiskState::<4>::new();
        state.reset();

        let chain = state.alloc_chain().unwrap();
        assert_eq!(chain, [0, 1, 2]);
        assert_eq!(state.free_count(), 1);

        // One descriptor left: the second chain fails and leaves it free.
        assert!(state.alloc_chain().is_none());
        assert_eq!(state.free_count(), 1);

        for d in chain {
            state.release(d);
        }
        assert_eq!(state.free_count(), 4);
        assert!(state.alloc_chain().is_some());
    }

    #[test]
    #[should_panic(expected = "already free")]
    fn test_double_free_is_fatal() {
        let mut state = DiskState::<4>::new();
        state.reset();
        let d = state.alloc().unwrap();
        state.release(d);
        state.release(d);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_free_out_of_range_is_fatal() {
        let mut state = DiskState::<4>::new();
        state.reset();
        state.release(4);
    }

    #[test]
    fn test_interrupt_with_empty_used_ring() {
        let blk: Box<VirtioBlk<FakeRegs, SpinSleeper>> =
            Box::new(VirtioBlk::new(FakeRegs::disk(8), SpinSleeper::new(), NullIrq));
        blk.init().unwrap();
        blk.mmio.write(regs::INTERRUPT_STATUS, 0x1);

        let mut seen = 0;
        assert_eq!(blk.handle_interrupt(|_| seen += 1), 0);
        assert_eq!(seen, 0);
        assert_eq!(blk.mmio.get(regs::INTERRUPT_ACK), 0x1);
    }
}
