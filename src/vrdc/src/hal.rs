//! Host-provided capabilities: register access, coherent memory, and time.
use core::ptr::NonNull;
use std::{sync::OnceLock, time::Instant};

use crate::RegisterAccessError;

/// A bus address as seen by the display controller's DMA engine.
///
/// The coefficient registers are 32 bits wide, so coherent allocations must be
/// placed below 4 GiB.
pub type BusAddr = u32;

/// A bank of memory-mapped 32-bit registers.
///
/// The engine knows nothing about the meaning of individual bits. All bit
/// packing is done by the caller (see [`crate::regs`]).
pub trait RegisterBank: Send + Sync {
    /// Read the register at byte offset `offset`.
    fn read32(&self, offset: u32) -> u32;

    /// Write `value` to the register at byte offset `offset`.
    fn write32(&self, offset: u32, value: u32) -> Result<(), RegisterAccessError>;
}

/// A region of coherent memory, usable by both the CPU and the display
/// controller without explicit cache maintenance.
///
/// `DmaRegion` is a plain descriptor and does not free the memory when
/// dropped. Ownership is tracked by [`crate::CorrectionBuffer`].
#[derive(Debug)]
pub struct DmaRegion {
    cpu_ptr: NonNull<u8>,
    bus_addr: BusAddr,
    size: usize,
}

// Safety: The memory behind `cpu_ptr` is exclusively owned by whoever owns
// the `DmaRegion`, and it's not tied to a particular thread.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
    /// Construct a `DmaRegion`.
    ///
    /// # Safety
    ///
    /// `cpu_ptr` must be valid for reads and writes of `size` bytes for as long
    /// as the region is alive, and no other `DmaRegion` may describe the same
    /// memory.
    pub unsafe fn new(cpu_ptr: NonNull<u8>, bus_addr: BusAddr, size: usize) -> Self {
        Self {
            cpu_ptr,
            bus_addr,
            size,
        }
    }

    #[inline]
    pub fn cpu_ptr(&self) -> NonNull<u8> {
        self.cpu_ptr
    }

    #[inline]
    pub fn bus_addr(&self) -> BusAddr {
        self.bus_addr
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // Safety: Guaranteed by `DmaRegion::new`'s contract
        unsafe { std::slice::from_raw_parts(self.cpu_ptr.as_ptr(), self.size) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: Guaranteed by `DmaRegion::new`'s contract
        unsafe { std::slice::from_raw_parts_mut(self.cpu_ptr.as_ptr(), self.size) }
    }
}

/// Coherent DMA memory allocator.
pub trait CoherentMemory: Send + Sync {
    /// Allocate `size` bytes. Returns `None` if the allocation fails.
    ///
    /// `size` is never zero.
    fn alloc(&self, size: usize) -> Option<DmaRegion>;

    /// Release a region.
    ///
    /// # Safety
    ///
    /// `region` must have been returned by `self.alloc` and must not be in use
    /// by the CPU anymore.
    unsafe fn free(&self, region: DmaRegion);
}

/// A monotonic clock with microsecond resolution.
pub trait Clock: Send + Sync {
    fn now_us(&self) -> u64;
}

/// [`Clock`] backed by [`std::time::Instant`].
///
/// The origin is established on the first call to `now_us` by any
/// `SystemClock`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_us(&self) -> u64 {
        static ORIGIN: OnceLock<Instant> = OnceLock::new();
        let origin = ORIGIN.get_or_init(Instant::now);
        origin.elapsed().as_micros() as u64
    }
}
