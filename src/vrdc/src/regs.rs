//! Register map of the VR extension block of the display controller
//!
//! The offsets are byte offsets into the register bank. This module also
//! computes the register values that reflect a [`DisplayConfig`]; the
//! [`RegisterBank`](crate::RegisterBank) implementation only moves words.
use crate::{config::DisplayConfig, DisplayMode, NUM_DISPLAYS};

pub const SYS_CTRL: u32 = 0x0000;
pub const INTR_STATUS: u32 = 0x0010;
/// Write-one-to-clear counterpart of [`INTR_STATUS`].
pub const INTR_CLEAR: u32 = 0x0014;

pub const VR_SYNC_CTRL: u32 = 0x0100;
pub const VR_LOW_PERSIST: u32 = 0x0104;
pub const VR_LATENCY_CTRL: u32 = 0x0108;
pub const VR_DISTORTION_CTRL: u32 = 0x010c;
/// Banked per display; see [`distortion_coef`].
pub const VR_DISTORTION_COEF: u32 = 0x0110;
pub const VR_CHROMATIC_CTRL: u32 = 0x0120;
/// Banked per display; see [`chromatic_coef`].
pub const VR_CHROMATIC_COEF: u32 = 0x0124;
pub const VR_MOTION_COMP: u32 = 0x0130;
pub const VR_MOTION_VECTOR: u32 = 0x0134;
pub const VR_ASYNC_COMMIT: u32 = 0x0138;
pub const VR_DIRECT_MODE: u32 = 0x013c;

/// The stride between two displays' banked coefficient registers.
pub const COEF_STRIDE: u32 = 4;

/// All registers that [`crate::VrDisplay`] writes, for the use of register
/// bank implementations that need to size their backing storage.
pub const ALL_REGISTERS: &[u32] = &[
    SYS_CTRL,
    INTR_STATUS,
    INTR_CLEAR,
    VR_SYNC_CTRL,
    VR_LOW_PERSIST,
    VR_LATENCY_CTRL,
    VR_DISTORTION_CTRL,
    VR_DISTORTION_COEF,
    VR_DISTORTION_COEF + COEF_STRIDE,
    VR_CHROMATIC_CTRL,
    VR_CHROMATIC_COEF,
    VR_CHROMATIC_COEF + COEF_STRIDE,
    VR_MOTION_COMP,
    VR_MOTION_VECTOR,
    VR_ASYNC_COMMIT,
    VR_DIRECT_MODE,
];

/// The offset of display `display`'s distortion coefficient register.
#[inline]
pub const fn distortion_coef(display: usize) -> u32 {
    assert!(display < NUM_DISPLAYS);
    VR_DISTORTION_COEF + COEF_STRIDE * display as u32
}

/// The offset of display `display`'s chromatic coefficient register.
#[inline]
pub const fn chromatic_coef(display: usize) -> u32 {
    assert!(display < NUM_DISPLAYS);
    VR_CHROMATIC_COEF + COEF_STRIDE * display as u32
}

bitflags::bitflags! {
    /// [`SYS_CTRL`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SysCtrl: u32 {
        const ENABLE = 1 << 0;
        const CORE_EN = 1 << 1;
        const CLK_EN = 1 << 2;
        const MMU_EN = 1 << 3;
    }
}

impl SysCtrl {
    /// The value written by `enable`.
    pub const RUNNING: Self = Self::ENABLE
        .union(Self::CORE_EN)
        .union(Self::CLK_EN)
        .union(Self::MMU_EN);
}

bitflags::bitflags! {
    /// [`INTR_STATUS`] and [`INTR_CLEAR`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IntrStatus: u32 {
        const VSYNC0 = 1 << 0;
        const VSYNC1 = 1 << 1;
        const COMMIT0 = 1 << 8;
        const COMMIT1 = 1 << 9;
    }
}

impl IntrStatus {
    /// The vsync bit of display `display`.
    #[inline]
    pub const fn vsync(display: usize) -> Self {
        Self::from_bits_retain(1 << display)
    }

    /// The commit-done bit of display `display`.
    #[inline]
    pub const fn commit(display: usize) -> Self {
        Self::from_bits_retain(1 << (display + 8))
    }
}

bitflags::bitflags! {
    /// [`VR_LATENCY_CTRL`], excluding the latency budget field
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LatencyCtrl: u32 {
        const BYPASS_BLEND = 1 << 0;
        const BYPASS_SCALE = 1 << 1;
        const BYPASS_GAMMA = 1 << 2;
        const BYPASS_DITHER = 1 << 3;
        const FAST_PATH = 1 << 4;
    }
}

bitflags::bitflags! {
    /// [`VR_DIRECT_MODE`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DirectMode: u32 {
        const ENABLE = 1 << 0;
        const FAST_PATH = 1 << 1;
    }
}

bitflags::bitflags! {
    /// [`VR_ASYNC_COMMIT`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AsyncCommit: u32 {
        const ENABLE = 1 << 0;
    }
}

/// The enable bit shared by the `*_CTRL` registers of the correction stages
/// and [`VR_LOW_PERSIST`].
pub const CTRL_ENABLE: u32 = 1 << 0;
/// The position of the mode field in the correction stages' `*_CTRL`
/// registers.
pub const CTRL_MODE_SHIFT: u32 = 4;

const LATENCY_BUDGET_SHIFT: u32 = 16;
/// The unit of the latency budget field of [`VR_LATENCY_CTRL`].
const LATENCY_BUDGET_UNIT_US: u32 = 100;

const SYNC_VREFRESH_SHIFT: u32 = 8;
const LOW_PERSIST_DUTY_SHIFT: u32 = 8;

/// [`VR_DIRECT_MODE`] for `config`.
pub fn direct_mode(config: &DisplayConfig) -> u32 {
    if config.mode == DisplayMode::Direct {
        let mut bits = DirectMode::ENABLE;
        bits.set(DirectMode::FAST_PATH, config.fast_path);
        bits.bits()
    } else {
        0
    }
}

/// [`VR_ASYNC_COMMIT`] for `config`.
pub fn async_commit(config: &DisplayConfig) -> u32 {
    if config.mode == DisplayMode::Async {
        AsyncCommit::ENABLE.bits()
    } else {
        0
    }
}

/// [`VR_SYNC_CTRL`] for `config`.
pub fn sync_ctrl(config: &DisplayConfig) -> u32 {
    config.sync_mode.to_raw() | (config.target_vrefresh.min(0xff) << SYNC_VREFRESH_SHIFT)
}

/// [`VR_LOW_PERSIST`] for `config`.
pub fn low_persist(config: &DisplayConfig) -> u32 {
    let enable = config.low_persistence || config.mode == DisplayMode::LowPersistence;
    (if enable { CTRL_ENABLE } else { 0 })
        | ((config.low_persistence_duty as u32) << LOW_PERSIST_DUTY_SHIFT)
}

/// [`VR_LATENCY_CTRL`] for `config`.
pub fn latency_ctrl(config: &DisplayConfig) -> u32 {
    let mut bits = LatencyCtrl::empty();
    bits.set(LatencyCtrl::BYPASS_BLEND, config.bypass_blend);
    bits.set(LatencyCtrl::BYPASS_SCALE, config.bypass_scale);
    bits.set(LatencyCtrl::BYPASS_GAMMA, config.bypass_gamma);
    bits.set(LatencyCtrl::BYPASS_DITHER, config.bypass_dither);
    bits.set(LatencyCtrl::FAST_PATH, config.fast_path);

    let budget = (config.max_latency_us / LATENCY_BUDGET_UNIT_US).min(0xffff);
    bits.bits() | (budget << LATENCY_BUDGET_SHIFT)
}

/// A correction stage's `*_CTRL` value for the mode with raw value `raw_mode`.
/// Mode 0 (none) disables the stage.
#[inline]
pub fn correction_ctrl(raw_mode: u32) -> u32 {
    if raw_mode == 0 {
        0
    } else {
        CTRL_ENABLE | (raw_mode << CTRL_MODE_SHIFT)
    }
}

/// [`VR_DISTORTION_CTRL`] for `config`.
pub fn distortion_ctrl(config: &DisplayConfig) -> u32 {
    correction_ctrl(config.distortion_mode.to_raw())
}

/// [`VR_CHROMATIC_CTRL`] for `config`.
pub fn chromatic_ctrl(config: &DisplayConfig) -> u32 {
    correction_ctrl(config.chromatic_mode.to_raw())
}

/// [`VR_MOTION_COMP`] for `config`.
pub fn motion_comp(config: &DisplayConfig) -> u32 {
    correction_ctrl(config.motion_comp_mode.to_raw())
}
