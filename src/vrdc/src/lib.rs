#![doc = include_str!("./lib.md")]
#![deny(unsafe_op_in_unsafe_fn)]

mod attr;
mod buffer;
mod config;
mod device;
mod engine;
mod error;
mod hal;
pub mod regs;
mod wait;

pub use self::{
    attr::Attr,
    buffer::{CorrectionBuffer, Slot},
    config::{
        clamp_duty, ChromaticMode, DisplayConfig, DisplayMode, DistortionMode, MotionCompMode,
        Options, SyncMode, MAX_LOW_PERSISTENCE_DUTY,
    },
    device::VrDisplay,
    engine::{ema, DisplayStats, WorkerState, DEFAULT_WAIT_TIMEOUT, VSYNC_STALE_US},
    error::*,
    hal::{BusAddr, Clock, CoherentMemory, DmaRegion, RegisterBank, SystemClock},
    wait::{WaitQueue, WaitTimeout},
};

/// The number of display panels driven by one controller.
pub const NUM_DISPLAYS: usize = 2;
