//! Simulated legacy virtio-blk device for driving the block layer from host
//! threads.
//!
//! The device answers the identification registers like QEMU, reads chains
//! from the avail ring the driver publishes, moves data to and from an
//! in-memory disk, and posts completions to the used ring. Completion is
//! explicit (`complete_one`), so a test decides exactly when each transfer
//! finishes.

#![allow(dead_code)]

use std::cell::Cell;
use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{fence, AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use splax_blkio::block::mmio::{ident, regs, VirtioMmio};
use splax_blkio::block::virtio_blk::{request_type, QueueLayout, VirtioBlkReqHeader, VirtqDesc};
use splax_blkio::block::{Buf, BSIZE, SECTOR_SIZE};
use splax_blkio::sched::lock::IrqMutexGuard;
use splax_blkio::sched::{IrqControl, Sleeper, TickCounter, WaitChannel};
use splax_blkio::{BlockLayer, SchedulerConfig};

/// Blocks on the simulated disk
pub const DISK_BLOCKS: usize = 256;

/// A transfer the device has carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub blockno: u32,
    pub write: bool,
}

struct Queue {
    layout: QueueLayout,
    /// Next avail entry the device will consume
    last_avail: u16,
}

pub struct SimDisk {
    regs: Mutex<[u32; 0x80 / 4]>,
    queue: Mutex<Option<Queue>>,
    data: Mutex<Vec<u8>>,
    log: Mutex<Vec<Transfer>>,
    notifies: AtomicUsize,
}

impl SimDisk {
    pub fn new(queue_num_max: u32) -> Self {
        let mut regs = [0u32; 0x80 / 4];
        regs[regs::MAGIC_VALUE / 4] = ident::MAGIC;
        regs[regs::VERSION / 4] = ident::VERSION_LEGACY;
        regs[regs::DEVICE_ID / 4] = ident::DEVICE_BLOCK;
        regs[regs::VENDOR_ID / 4] = ident::VENDOR_QEMU;
        // RO | EVENT_IDX | a flag the driver keeps
        regs[regs::DEVICE_FEATURES / 4] = 1 << 5 | 1 << 29 | 1 << 9;
        regs[regs::QUEUE_NUM_MAX / 4] = queue_num_max;
        Self {
            regs: Mutex::new(regs),
            queue: Mutex::new(None),
            data: Mutex::new(vec![0; DISK_BLOCKS * BSIZE]),
            log: Mutex::new(Vec::new()),
            notifies: AtomicUsize::new(0),
        }
    }

    /// Points the device at the driver's queue memory.
    pub fn attach(&self, layout: QueueLayout) {
        *self.queue.lock().unwrap() = Some(Queue {
            layout,
            last_avail: 0,
        });
    }

    pub fn reg(&self, offset: usize) -> u32 {
        self.regs.lock().unwrap()[offset / 4]
    }

    /// Chains published but not yet completed.
    pub fn pending(&self) -> usize {
        let queue = self.queue.lock().unwrap();
        match queue.as_ref() {
            Some(q) => avail_idx(&q.layout).wrapping_sub(q.last_avail) as usize,
            None => 0,
        }
    }

    pub fn notifies(&self) -> usize {
        self.notifies.load(Ordering::SeqCst)
    }

    pub fn transfers(&self) -> Vec<Transfer> {
        self.log.lock().unwrap().clone()
    }

    /// Fills a block on the disk with `byte`.
    pub fn fill_block(&self, blockno: u32, byte: u8) {
        let start = blockno as usize * BSIZE;
        self.data.lock().unwrap()[start..start + BSIZE].fill(byte);
    }

    pub fn block(&self, blockno: u32) -> Vec<u8> {
        let start = blockno as usize * BSIZE;
        self.data.lock().unwrap()[start..start + BSIZE].to_vec()
    }

    /// Carries out the oldest published chain and posts it to the used ring.
    pub fn complete_one(&self) -> Option<Transfer> {
        let mut guard = self.queue.lock().unwrap();
        let q = guard.as_mut()?;
        let layout = q.layout;
        if avail_idx(&layout) == q.last_avail {
            return None;
        }
        fence(Ordering::SeqCst);

        let size = layout.size;
        let slot = q.last_avail as usize % size;
        // SAFETY: the driver published this entry and keeps the queue memory
        // alive for the life of the layer.
        let head = unsafe { ptr::read_volatile((layout.avail + 4 + 2 * slot) as *const u16) };

        let d0 = desc(&layout, head as usize);
        let d1 = desc(&layout, d0.next as usize);
        let d2 = desc(&layout, d1.next as usize);
        assert_eq!(d0.len as usize, std::mem::size_of::<VirtioBlkReqHeader>());
        assert_eq!(d1.len as usize, BSIZE);
        assert_eq!(d2.len, 1);

        // SAFETY: descriptor addresses point into the driver's header array
        // and the submitted buffer.
        let header = unsafe { ptr::read_volatile(d0.addr as *const VirtioBlkReqHeader) };
        let write = header.request_type == request_type::VIRTIO_BLK_T_OUT;
        assert_eq!(d1.flags & 2 == 0, write, "data descriptor WRITE flag");

        let offset = header.sector as usize * SECTOR_SIZE;
        {
            let mut disk = self.data.lock().unwrap();
            let block = &mut disk[offset..offset + BSIZE];
            unsafe {
                if write {
                    ptr::copy_nonoverlapping(d1.addr as *const u8, block.as_mut_ptr(), BSIZE);
                } else {
                    ptr::copy_nonoverlapping(block.as_ptr(), d1.addr as *mut u8, BSIZE);
                }
                ptr::write_volatile(d2.addr as *mut u8, 0);
            }
        }

        // Post to the used ring.
        let used_idx = atomic_u16(layout.used + 2);
        let u = used_idx.load(Ordering::SeqCst);
        let elem = layout.used + 4 + 8 * (u as usize % size);
        unsafe {
            ptr::write_volatile(elem as *mut u32, head as u32);
            ptr::write_volatile((elem + 4) as *mut u32, BSIZE as u32);
        }
        fence(Ordering::SeqCst);
        used_idx.store(u.wrapping_add(1), Ordering::SeqCst);
        q.last_avail = q.last_avail.wrapping_add(1);
        drop(guard);

        self.regs.lock().unwrap()[regs::INTERRUPT_STATUS / 4] |= 1;

        let transfer = Transfer {
            blockno: (header.sector / (BSIZE / SECTOR_SIZE) as u64) as u32,
            write,
        };
        self.log.lock().unwrap().push(transfer);
        Some(transfer)
    }
}

impl VirtioMmio for SimDisk {
    fn read(&self, offset: usize) -> u32 {
        self.regs.lock().unwrap()[offset / 4]
    }

    fn write(&self, offset: usize, value: u32) {
        if offset == regs::QUEUE_NOTIFY || offset == regs::INTERRUPT_ACK {
            // Both are only written under the device lock.
            assert!(
                irq_masked(),
                "register 0x{:x} written with interrupts enabled",
                offset
            );
        }
        let mut regs = self.regs.lock().unwrap();
        match offset {
            regs::QUEUE_NOTIFY => {
                self.notifies.fetch_add(1, Ordering::SeqCst);
            }
            regs::INTERRUPT_ACK => {
                regs[regs::INTERRUPT_STATUS / 4] &= !value;
            }
            _ => regs[offset / 4] = value,
        }
    }
}

fn atomic_u16(addr: usize) -> &'static AtomicU16 {
    // SAFETY: ring index fields are 2-byte aligned and live as long as the
    // leaked block layer.
    unsafe { &*(addr as *const AtomicU16) }
}

fn avail_idx(layout: &QueueLayout) -> u16 {
    atomic_u16(layout.avail + 2).load(Ordering::SeqCst)
}

fn desc(layout: &QueueLayout, i: usize) -> VirtqDesc {
    assert!(i < layout.size, "descriptor {} out of range", i);
    // SAFETY: the descriptor table holds `size` entries.
    unsafe { ptr::read_volatile((layout.desc + 16 * i) as *const VirtqDesc) }
}

/// Condition-variable sleeper that records who slept where.
///
/// `sleep` takes the sleeper's own lock before releasing the caller's, so a
/// wakeup can only be issued once the thread is waiting on the condvar.
/// There is no timeout: a lost wakeup hangs the test.
pub struct TestSleeper {
    generation: Mutex<u64>,
    cond: Condvar,
    sleeps: Mutex<HashMap<WaitChannel, usize>>,
    /// Pause between releasing the caller's lock and waiting, as if the
    /// thread were preempted there
    preempt: Duration,
}

impl TestSleeper {
    pub fn new() -> Self {
        Self::with_preemption(Duration::ZERO)
    }

    pub fn with_preemption(preempt: Duration) -> Self {
        Self {
            generation: Mutex::new(0),
            cond: Condvar::new(),
            sleeps: Mutex::new(HashMap::new()),
            preempt,
        }
    }

    /// Times a thread went to sleep on `chan`.
    pub fn sleeps_on(&self, chan: WaitChannel) -> usize {
        self.sleeps.lock().unwrap().get(&chan).copied().unwrap_or(0)
    }
}

impl Sleeper for TestSleeper {
    fn sleep<'a, T, I: IrqControl>(
        &self,
        chan: WaitChannel,
        guard: IrqMutexGuard<'a, T, I>,
    ) -> IrqMutexGuard<'a, T, I> {
        let generation = self.generation.lock().unwrap();
        let seen = *generation;
        *self.sleeps.lock().unwrap().entry(chan).or_insert(0) += 1;

        let (lock, irq) = (guard.mutex(), guard.irq());
        drop(guard);
        if !self.preempt.is_zero() {
            thread::sleep(self.preempt);
        }
        let generation = self.cond.wait_while(generation, |g| *g == seen).unwrap();
        drop(generation);

        lock.lock(irq)
    }

    fn wakeup(&self, _chan: WaitChannel) {
        *self.generation.lock().unwrap() += 1;
        self.cond.notify_all();
    }
}

thread_local! {
    /// Interrupt-enable state of the hart this thread stands in for
    static MASKED: Cell<bool> = Cell::new(false);
}

/// Whether interrupts are masked on the calling thread's hart.
pub fn irq_masked() -> bool {
    MASKED.with(Cell::get)
}

/// Interrupt control where every thread is its own hart.
pub struct TestIrq {
    disables: AtomicUsize,
}

impl TestIrq {
    pub fn new() -> Self {
        Self {
            disables: AtomicUsize::new(0),
        }
    }

    pub fn disables(&self) -> usize {
        self.disables.load(Ordering::SeqCst)
    }
}

impl IrqControl for TestIrq {
    fn disable(&self) -> bool {
        self.disables.fetch_add(1, Ordering::SeqCst);
        !MASKED.with(|masked| masked.replace(true))
    }

    fn restore(&self, was_enabled: bool) {
        if was_enabled {
            MASKED.with(|masked| masked.set(false));
        }
    }
}

/// Spins until `cond` holds, failing the test after five seconds.
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "timed out waiting for {}",
            what
        );
        thread::sleep(Duration::from_millis(1));
    }
}

/// A buffer that lives for the rest of the test binary.
pub fn leak_buf() -> &'static Buf {
    Box::leak(Box::new(Buf::new()))
}

/// A buffer whose block contents are all `byte`.
pub fn filled_buf(byte: u8) -> &'static Buf {
    let buf = leak_buf();
    // SAFETY: freshly leaked, no transfer in flight.
    unsafe { buf.data_mut().fill(byte) };
    buf
}

pub fn contents(buf: &Buf) -> Vec<u8> {
    // SAFETY: only called once the buffer's transfer has completed.
    unsafe { buf.data().to_vec() }
}

/// Block layer wired to a simulated disk.
pub type Layer<const N: usize> = BlockLayer<
    &'static SimDisk,
    &'static TestSleeper,
    &'static TickCounter,
    &'static TestIrq,
    N,
>;

#[derive(Clone, Copy)]
pub struct Rig<const N: usize> {
    pub disk: &'static SimDisk,
    pub sleeper: &'static TestSleeper,
    pub clock: &'static TickCounter,
    pub irq: &'static TestIrq,
    pub layer: &'static Layer<N>,
}

impl<const N: usize> Rig<N> {
    /// Delivers the disk interrupt on the calling thread: masked on entry,
    /// restored on return.
    pub fn interrupt(&self) -> usize {
        let was_enabled = self.irq.disable();
        let drained = self.layer.handle_interrupt();
        self.irq.restore(was_enabled);
        drained
    }
}

/// Boots a block layer with an `N`-descriptor pool against a fresh disk.
pub fn boot<const N: usize>(config: SchedulerConfig) -> Rig<N> {
    boot_with(config, TestSleeper::new())
}

pub fn boot_with<const N: usize>(config: SchedulerConfig, sleeper: TestSleeper) -> Rig<N> {
    let _ = env_logger::builder().is_test(true).try_init();
    let disk: &'static SimDisk = Box::leak(Box::new(SimDisk::new(N as u32)));
    let sleeper: &'static TestSleeper = Box::leak(Box::new(sleeper));
    let clock: &'static TickCounter = Box::leak(Box::new(TickCounter::new()));
    let irq: &'static TestIrq = Box::leak(Box::new(TestIrq::new()));
    let layer: &'static Layer<N> =
        Box::leak(Box::new(BlockLayer::new(disk, sleeper, clock, irq, config)));
    layer.init().expect("block layer init");
    disk.attach(layer.transport().queue_layout());
    Rig {
        disk,
        sleeper,
        clock,
        irq,
        layer,
    }
}

/// Runs the device: completes every published chain and raises the
/// interrupt, until `stop` is set and the queue is empty.
pub fn spawn_device<const N: usize>(rig: Rig<N>, stop: Arc<AtomicBool>) -> JoinHandle<usize> {
    thread::spawn(move || {
        let mut completed = 0;
        loop {
            if rig.disk.complete_one().is_some() {
                completed += rig.interrupt();
            } else if stop.load(Ordering::SeqCst) {
                break completed;
            } else {
                thread::yield_now();
            }
        }
    })
}
