#![doc = include_str!("./lib.md")]
#![deny(unsafe_op_in_unsafe_fn)]
use slab::Slab;
use spin::Mutex as SpinMutex;
use std::{
    ptr::NonNull,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
        mpsc, Arc,
    },
    thread,
    time::Duration,
};
use vrdc::{
    regs::{self, IntrStatus},
    BusAddr, Clock, CoherentMemory, DmaRegion, Options, RegisterAccessError, RegisterBank,
    VrDisplay, NUM_DISPLAYS,
};

/// Used by `vrdc_sim`
#[doc(hidden)]
pub extern crate env_logger;

/// Initialize the global logger from `RUST_LOG`. Does nothing if a logger is
/// already installed.
pub fn init_logger() {
    let _ = env_logger::try_init();
}

/// The size of the simulated register bank in bytes.
const BANK_SIZE: u32 = regs::VR_DIRECT_MODE + 4;

/// A simulated register bank.
///
/// Registers are plain storage except [`regs::INTR_CLEAR`], which clears the
/// written bits in [`regs::INTR_STATUS`] and always reads as zero. Every
/// write attempt is recorded in a log.
pub struct SimRegisterBank {
    words: [AtomicU32; (BANK_SIZE / 4) as usize],
    log: SpinMutex<Vec<(u32, u32)>>,
    fail_clear: AtomicBool,
}

impl SimRegisterBank {
    pub fn new() -> Self {
        Self {
            words: [(); (BANK_SIZE / 4) as usize].map(|()| AtomicU32::new(0)),
            log: SpinMutex::new(Vec::new()),
            fail_clear: AtomicBool::new(false),
        }
    }

    fn word(&self, offset: u32) -> Option<&AtomicU32> {
        if offset % 4 != 0 {
            return None;
        }
        self.words.get((offset / 4) as usize)
    }

    /// Set interrupt status bits as the hardware would.
    pub fn raise(&self, bits: IntrStatus) {
        log::trace!("raise({bits:?})");
        self.words[(regs::INTR_STATUS / 4) as usize].fetch_or(bits.bits(), Ordering::AcqRel);
    }

    /// Signal a vsync of display `display`.
    pub fn raise_vsync(&self, display: usize) {
        assert!(display < NUM_DISPLAYS);
        self.raise(IntrStatus::vsync(display));
    }

    /// Signal a commit-done event of display `display`.
    pub fn raise_commit(&self, display: usize) {
        assert!(display < NUM_DISPLAYS);
        self.raise(IntrStatus::commit(display));
    }

    /// Make writes to [`regs::INTR_CLEAR`] fail (without clearing anything).
    pub fn set_fail_clear(&self, fail: bool) {
        self.fail_clear.store(fail, Ordering::Relaxed);
    }

    /// Get the recorded writes as `(offset, value)` pairs in order.
    pub fn writes(&self) -> Vec<(u32, u32)> {
        self.log.lock().clone()
    }

    /// Get the number of writes to the register at `offset`.
    pub fn write_count(&self, offset: u32) -> usize {
        self.log.lock().iter().filter(|&&(o, _)| o == offset).count()
    }

    /// Get the last value written to the register at `offset`.
    pub fn last_write(&self, offset: u32) -> Option<u32> {
        self.log
            .lock()
            .iter()
            .rev()
            .find(|&&(o, _)| o == offset)
            .map(|&(_, value)| value)
    }

    pub fn clear_write_log(&self) {
        self.log.lock().clear();
    }
}

impl Default for SimRegisterBank {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterBank for SimRegisterBank {
    fn read32(&self, offset: u32) -> u32 {
        match self.word(offset) {
            Some(word) => word.load(Ordering::Acquire),
            None => {
                log::warn!("read from an unmapped offset {offset:#06x}");
                0
            }
        }
    }

    fn write32(&self, offset: u32, value: u32) -> Result<(), RegisterAccessError> {
        self.log.lock().push((offset, value));

        if offset == regs::INTR_CLEAR {
            if self.fail_clear.load(Ordering::Relaxed) {
                return Err(RegisterAccessError::Io);
            }
            self.words[(regs::INTR_STATUS / 4) as usize].fetch_and(!value, Ordering::AcqRel);
            return Ok(());
        }

        let word = self.word(offset).ok_or(RegisterAccessError::Io)?;
        word.store(value, Ordering::Release);
        Ok(())
    }
}

impl std::fmt::Debug for SimRegisterBank {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SimRegisterBank")
            .field("intr_status", &self.read32(regs::INTR_STATUS))
            .field("writes", &self.log.lock().len())
            .finish_non_exhaustive()
    }
}

/// The granularity of the synthetic bus addresses handed out by
/// [`HeapMemory`].
const PAGE_SIZE: u32 = 0x1000;
const BUS_BASE: BusAddr = 0x1000_0000;

struct Allocation {
    bus_addr: BusAddr,
    storage: Box<[u8]>,
}

/// A [`CoherentMemory`] backed by the heap.
///
/// Each allocation receives a fresh page-aligned bus address that is never
/// reused.
pub struct HeapMemory {
    allocations: SpinMutex<Slab<Allocation>>,
    next_bus_addr: SpinMutex<BusAddr>,
    num_allocs: AtomicUsize,
    num_frees: AtomicUsize,
    fail: AtomicBool,
}

impl HeapMemory {
    pub fn new() -> Self {
        Self {
            allocations: SpinMutex::new(Slab::new()),
            next_bus_addr: SpinMutex::new(BUS_BASE),
            num_allocs: AtomicUsize::new(0),
            num_frees: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    /// Make subsequent allocations fail.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    /// Get the number of successful allocations so far.
    pub fn num_allocs(&self) -> usize {
        self.num_allocs.load(Ordering::Relaxed)
    }

    pub fn num_frees(&self) -> usize {
        self.num_frees.load(Ordering::Relaxed)
    }

    /// Get the number of allocations not freed yet.
    pub fn num_live(&self) -> usize {
        self.allocations.lock().len()
    }

    /// Get a copy of the contents of the live allocation at `bus_addr`.
    pub fn contents(&self, bus_addr: BusAddr) -> Option<Vec<u8>> {
        self.allocations
            .lock()
            .iter()
            .find(|(_, a)| a.bus_addr == bus_addr)
            .map(|(_, a)| a.storage.to_vec())
    }

    /// Get a flag indicating whether `bus_addr` refers to a live allocation.
    pub fn is_live(&self, bus_addr: BusAddr) -> bool {
        self.allocations
            .lock()
            .iter()
            .any(|(_, a)| a.bus_addr == bus_addr)
    }

    fn reserve_bus_range(&self, size: usize) -> Option<BusAddr> {
        let pages = u32::try_from(size).ok()?.checked_add(PAGE_SIZE - 1)? / PAGE_SIZE;
        let mut next = self.next_bus_addr.lock();
        let bus_addr = *next;
        *next = next.checked_add(pages.max(1).checked_mul(PAGE_SIZE)?)?;
        Some(bus_addr)
    }
}

impl Default for HeapMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl CoherentMemory for HeapMemory {
    fn alloc(&self, size: usize) -> Option<DmaRegion> {
        if self.fail.load(Ordering::Relaxed) {
            log::debug!("alloc({size}): failing as requested");
            return None;
        }

        let bus_addr = self.reserve_bus_range(size)?;
        let mut storage = vec![0u8; size].into_boxed_slice();
        let cpu_ptr = NonNull::new(storage.as_mut_ptr())?;

        // Moving the `Box` doesn't move the heap allocation it points to
        self.allocations.lock().insert(Allocation { bus_addr, storage });
        self.num_allocs.fetch_add(1, Ordering::Relaxed);
        log::trace!("alloc({size}) = {bus_addr:#010x}");

        // Safety: The storage lives in `allocations` until `free`
        Some(unsafe { DmaRegion::new(cpu_ptr, bus_addr, size) })
    }

    unsafe fn free(&self, region: DmaRegion) {
        let mut allocations = self.allocations.lock();
        let key = allocations
            .iter()
            .find(|(_, a)| a.bus_addr == region.bus_addr())
            .map(|(key, _)| key);
        match key {
            Some(key) => {
                allocations.remove(key);
                self.num_frees.fetch_add(1, Ordering::Relaxed);
                log::trace!("free({:#010x})", region.bus_addr());
            }
            None => log::warn!("free of an unknown region {:#010x}", region.bus_addr()),
        }
    }
}

impl std::fmt::Debug for HeapMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("HeapMemory")
            .field("num_allocs", &self.num_allocs())
            .field("num_frees", &self.num_frees())
            .field("num_live", &self.num_live())
            .finish()
    }
}

/// A [`Clock`] that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_us: AtomicU64,
}

impl ManualClock {
    pub const fn new(now_us: u64) -> Self {
        Self {
            now_us: AtomicU64::new(now_us),
        }
    }

    pub fn set(&self, now_us: u64) {
        self.now_us.store(now_us, Ordering::Release);
    }

    /// Move the clock forward by `us` microseconds.
    pub fn advance(&self, us: u64) {
        self.now_us.fetch_add(us, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::Acquire)
    }
}

/// Raises vsync interrupts for every display at a fixed rate on a background
/// thread. Stops when dropped.
#[derive(Debug)]
pub struct VsyncSource {
    stop_send: Option<mpsc::Sender<()>>,
    join_handle: Option<thread::JoinHandle<()>>,
}

impl VsyncSource {
    /// Start raising vsync interrupts every `period`. If `with_commit` is
    /// set, each vsync is accompanied by a commit-done event.
    pub fn start(regs: Arc<SimRegisterBank>, period: Duration, with_commit: bool) -> Self {
        let (stop_send, stop_recv) = mpsc::channel::<()>();

        log::trace!("starting the vsync source");
        let join_handle = thread::Builder::new()
            .name("vrdc-vsync-source".into())
            .spawn(move || loop {
                match stop_recv.recv_timeout(period) {
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }

                let mut bits = IntrStatus::empty();
                for i in 0..NUM_DISPLAYS {
                    bits |= IntrStatus::vsync(i);
                    if with_commit {
                        bits |= IntrStatus::commit(i);
                    }
                }
                regs.raise(bits);
            });

        let join_handle = match join_handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::warn!("failed to spawn the vsync source: {e}");
                None
            }
        };

        Self {
            stop_send: Some(stop_send),
            join_handle,
        }
    }
}

impl Drop for VsyncSource {
    fn drop(&mut self) {
        log::trace!("stopping the vsync source");
        // Disconnecting the channel stops the thread
        drop(self.stop_send.take());
        if let Some(join_handle) = self.join_handle.take() {
            if join_handle.join().is_err() {
                log::warn!("the vsync source panicked");
            }
        }
    }
}

/// Construct a [`VrDisplay`] attached to a fresh [`SimRegisterBank`] and
/// [`HeapMemory`].
pub fn sim_display(
    options: Options,
    clock: Arc<dyn Clock>,
) -> (VrDisplay, Arc<SimRegisterBank>, Arc<HeapMemory>) {
    let regs = Arc::new(SimRegisterBank::new());
    let mem = Arc::new(HeapMemory::new());
    let display = VrDisplay::new(regs.clone(), mem.clone(), clock, options);
    (display, regs, mem)
}
