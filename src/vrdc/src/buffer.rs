//! Correction buffers
//!
//! Each slot holds at most one [`CorrectionBuffer`]. Replacing a buffer is
//! ordered as follows:
//!
//!  1. The new buffer is allocated and filled. On failure, the slot is left
//!     untouched.
//!  2. The caller publishes the new buffer's bus address to the hardware (if
//!     the current mode consumes the buffer).
//!  3. The old buffer is freed.
//!
//! The hardware never acknowledges that it has switched to the new address,
//! so a scanout that started before step 2 may still be reading the old
//! buffer at step 3.
use core::fmt;
use std::sync::Arc;

use crate::{hal::DmaRegion, BusAddr, CoherentMemory, SetMapError, NUM_DISPLAYS};

/// Identifies a correction buffer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// The lens distortion map of a display.
    Distortion(usize),
    /// The chromatic aberration map of a display.
    Chromatic(usize),
    /// The device-wide motion vector buffer.
    MotionVectors,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Distortion(i) => write!(f, "distortion map {i}"),
            Self::Chromatic(i) => write!(f, "chromatic map {i}"),
            Self::MotionVectors => f.write_str("motion vectors"),
        }
    }
}

/// An exclusively-owned coherent buffer. The memory is released when this is
/// dropped.
pub struct CorrectionBuffer {
    region: Option<DmaRegion>,
    mem: Arc<dyn CoherentMemory>,
}

impl CorrectionBuffer {
    /// Allocate a buffer and fill it with `data`.
    fn new(mem: &Arc<dyn CoherentMemory>, data: &[u8]) -> Option<Self> {
        debug_assert!(!data.is_empty());
        let mut region = mem.alloc(data.len())?;
        debug_assert!(region.size() >= data.len());
        region.as_mut_slice()[..data.len()].copy_from_slice(data);
        Some(Self {
            region: Some(region),
            mem: Arc::clone(mem),
        })
    }

    fn region(&self) -> &DmaRegion {
        // `region` is `None` only during `drop`
        self.region.as_ref().unwrap_or_else(|| unreachable!())
    }

    #[inline]
    pub fn bus_addr(&self) -> BusAddr {
        self.region().bus_addr()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.region().size()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        self.region().as_slice()
    }
}

impl Drop for CorrectionBuffer {
    fn drop(&mut self) {
        if let Some(region) = self.region.take() {
            log::trace!("freeing coherent buffer at {:#010x}", region.bus_addr());
            // Safety: `region` came from `self.mem.alloc` and we are its sole
            // owner
            unsafe { self.mem.free(region) };
        }
    }
}

impl fmt::Debug for CorrectionBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CorrectionBuffer")
            .field("bus_addr", &format_args!("{:#010x}", self.bus_addr()))
            .field("size", &self.size())
            .finish()
    }
}

/// The resource manager. Owns every correction buffer of the device.
pub struct CorrectionBuffers {
    mem: Arc<dyn CoherentMemory>,
    distortion: [Option<CorrectionBuffer>; NUM_DISPLAYS],
    chromatic: [Option<CorrectionBuffer>; NUM_DISPLAYS],
    motion_vectors: Option<CorrectionBuffer>,
}

impl CorrectionBuffers {
    pub fn new(mem: Arc<dyn CoherentMemory>) -> Self {
        Self {
            mem,
            distortion: Default::default(),
            chromatic: Default::default(),
            motion_vectors: None,
        }
    }

    fn slot_mut(&mut self, slot: Slot) -> Option<&mut Option<CorrectionBuffer>> {
        match slot {
            Slot::Distortion(i) => self.distortion.get_mut(i),
            Slot::Chromatic(i) => self.chromatic.get_mut(i),
            Slot::MotionVectors => Some(&mut self.motion_vectors),
        }
    }

    /// Get the buffer installed in `slot`.
    pub fn get(&self, slot: Slot) -> Option<&CorrectionBuffer> {
        match slot {
            Slot::Distortion(i) => self.distortion.get(i)?.as_ref(),
            Slot::Chromatic(i) => self.chromatic.get(i)?.as_ref(),
            Slot::MotionVectors => self.motion_vectors.as_ref(),
        }
    }

    /// Replace the buffer in `slot` with a new buffer containing `data`.
    ///
    /// `publish` is called with the new buffer after it's filled and before
    /// the old buffer is freed.
    pub fn install(
        &mut self,
        slot: Slot,
        data: &[u8],
        publish: impl FnOnce(&CorrectionBuffer),
    ) -> Result<(), SetMapError> {
        if data.is_empty() || self.slot_mut(slot).is_none() {
            return Err(SetMapError::InvalidArgument);
        }

        let new = CorrectionBuffer::new(&self.mem, data).ok_or_else(|| {
            log::warn!("{slot}: failed to allocate {} bytes", data.len());
            SetMapError::OutOfMemory
        })?;
        log::debug!("{slot}: installing {new:?}");

        publish(&new);

        let old = self
            .slot_mut(slot)
            .ok_or(SetMapError::InvalidArgument)?
            .replace(new);
        drop(old);

        Ok(())
    }

    /// Free all buffers. Returns the number of freed buffers.
    pub fn release_all(&mut self) -> usize {
        let mut count = 0;
        let slots = self
            .distortion
            .iter_mut()
            .chain(self.chromatic.iter_mut())
            .chain(std::iter::once(&mut self.motion_vectors));
        for slot in slots {
            if slot.take().is_some() {
                count += 1;
            }
        }
        count
    }
}

impl fmt::Debug for CorrectionBuffers {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CorrectionBuffers")
            .field("distortion", &self.distortion)
            .field("chromatic", &self.chromatic)
            .field("motion_vectors", &self.motion_vectors)
            .finish_non_exhaustive()
    }
}
