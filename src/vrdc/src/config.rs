//! Display configuration
use core::{fmt, str::FromStr, time::Duration};

use crate::SetConfigError;

/// Define a configuration enum whose values are reported to the hardware and
/// to the attribute interface as small integers.
macro_rules! define_mode {
    (
        $( #[$meta:meta] )*
        pub enum $name:ident {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident = ($vd:expr, $vstr:expr)
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum $name {
            $(
                $( #[$vmeta] )*
                $vname = $vd
            ),*
        }

        impl $name {
            /// All values in the ascending order of their raw values.
            pub const ALL: &'static [Self] = &[$(Self::$vname),*];

            /// Get the raw value.
            #[inline]
            pub const fn to_raw(self) -> u32 {
                self as u32
            }

            /// Convert a raw value. Returns `None` if it's out of range.
            pub const fn from_raw(raw: u32) -> Option<Self> {
                $(
                    if raw == $vd {
                        return Some(Self::$vname);
                    }
                )*
                None
            }

            /// Get the name used by the attribute interface.
            pub const fn as_str(self) -> &'static str {
                match self {
                    $( Self::$vname => $vstr, )*
                }
            }
        }

        impl TryFrom<u32> for $name {
            type Error = SetConfigError;

            #[inline]
            fn try_from(raw: u32) -> Result<Self, Self::Error> {
                Self::from_raw(raw).ok_or(SetConfigError::InvalidArgument)
            }
        }

        impl FromStr for $name {
            type Err = SetConfigError;

            /// Accepts a name (case-insensitive) or a raw value.
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.trim();
                if let Ok(raw) = s.parse::<u32>() {
                    return Self::try_from(raw);
                }
                Self::ALL
                    .iter()
                    .copied()
                    .find(|x| x.as_str().eq_ignore_ascii_case(s))
                    .ok_or(SetConfigError::InvalidArgument)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

define_mode! {
    /// The display pipeline mode.
    pub enum DisplayMode {
        Normal = (0, "normal"),
        LowPersistence = (1, "low_persistence"),
        /// Bypass the buffering stages and scan out directly.
        Direct = (2, "direct"),
        /// Commit asynchronously to vsync.
        Async = (3, "async"),
    }
}

define_mode! {
    /// How the two panels' vsyncs are related.
    pub enum SyncMode {
        Independent = (0, "independent"),
        Master = (1, "master"),
        Slave = (2, "slave"),
        External = (3, "external"),
    }
}

define_mode! {
    /// Lens distortion correction.
    pub enum DistortionMode {
        None = (0, "none"),
        Barrel = (1, "barrel"),
        Pincushion = (2, "pincushion"),
        /// Per-pixel warp mesh supplied by [`crate::VrDisplay::set_distortion_map`].
        Mesh = (3, "mesh"),
        /// Custom coefficients supplied by [`crate::VrDisplay::set_distortion_map`].
        Custom = (4, "custom"),
    }
}

define_mode! {
    /// Chromatic aberration correction.
    pub enum ChromaticMode {
        None = (0, "none"),
        Rgb = (1, "rgb"),
        /// Custom map supplied by [`crate::VrDisplay::set_chromatic_map`].
        Custom = (2, "custom"),
    }
}

define_mode! {
    /// Motion compensation. Every mode other than `None` consumes the vectors
    /// supplied by [`crate::VrDisplay::set_motion_vectors`].
    pub enum MotionCompMode {
        None = (0, "none"),
        Predict = (1, "predict"),
        Extrapolate = (2, "extrapolate"),
    }
}

impl DistortionMode {
    /// Get a flag indicating whether this mode reads the distortion map.
    #[inline]
    pub const fn uses_map(self) -> bool {
        matches!(self, Self::Mesh | Self::Custom)
    }
}

impl ChromaticMode {
    /// Get a flag indicating whether this mode reads the chromatic map.
    #[inline]
    pub const fn uses_map(self) -> bool {
        matches!(self, Self::Custom)
    }
}

impl MotionCompMode {
    /// Get a flag indicating whether this mode reads the motion vectors.
    #[inline]
    pub const fn uses_vectors(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// The maximum value of [`DisplayConfig::low_persistence_duty`].
pub const MAX_LOW_PERSISTENCE_DUTY: u8 = 100;

/// The configuration of the display controller.
///
/// Every value of this type that's held by a [`crate::VrDisplay`] has passed
/// validation. The setters of `VrDisplay` replace fields only after
/// validation succeeds, so a reader never observes a partial update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DisplayConfig {
    pub mode: DisplayMode,
    pub sync_mode: SyncMode,
    pub distortion_mode: DistortionMode,
    pub chromatic_mode: ChromaticMode,
    pub motion_comp_mode: MotionCompMode,
    pub low_persistence: bool,
    /// The illuminated portion of a frame in percent. `0..=100`.
    pub low_persistence_duty: u8,
    pub fast_path: bool,
    pub bypass_blend: bool,
    pub bypass_scale: bool,
    pub bypass_gamma: bool,
    pub bypass_dither: bool,
    /// The nominal refresh rate in hertz. Never zero.
    pub target_vrefresh: u32,
    pub max_latency_us: u32,
}

impl DisplayConfig {
    /// The nominal frame period in microseconds.
    #[inline]
    pub const fn nominal_period_us(&self) -> u32 {
        1_000_000 / self.target_vrefresh
    }
}

/// Clamp a low persistence duty cycle to `0..=100`.
#[inline]
pub const fn clamp_duty(duty: u32) -> u8 {
    if duty > MAX_LOW_PERSISTENCE_DUTY as u32 {
        MAX_LOW_PERSISTENCE_DUTY
    } else {
        duty as u8
    }
}

/// Construction-time options for [`crate::VrDisplay`].
///
/// # Examples
///
/// ```
/// use vrdc::{DisplayMode, Options};
/// let options = Options::new()
///     .mode(DisplayMode::LowPersistence)
///     .low_persistence(true, 30)
///     .target_vrefresh(120);
/// assert_eq!(options.config().low_persistence_duty, 30);
/// assert_eq!(options.config().nominal_period_us(), 8333);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "`Options` is a builder; pass it to `VrDisplay::new`"]
pub struct Options {
    config: DisplayConfig,
    poll_interval: Duration,
}

impl Options {
    pub const DEFAULT_TARGET_VREFRESH: u32 = 90;
    pub const DEFAULT_MAX_LATENCY_US: u32 = 20_000;
    pub const DEFAULT_LOW_PERSISTENCE_DUTY: u8 = 50;
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

    pub const fn new() -> Self {
        Self {
            config: DisplayConfig {
                mode: DisplayMode::Normal,
                sync_mode: SyncMode::Independent,
                distortion_mode: DistortionMode::None,
                chromatic_mode: ChromaticMode::None,
                motion_comp_mode: MotionCompMode::None,
                low_persistence: false,
                low_persistence_duty: Self::DEFAULT_LOW_PERSISTENCE_DUTY,
                fast_path: false,
                bypass_blend: false,
                bypass_scale: false,
                bypass_gamma: false,
                bypass_dither: false,
                target_vrefresh: Self::DEFAULT_TARGET_VREFRESH,
                max_latency_us: Self::DEFAULT_MAX_LATENCY_US,
            },
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }

    pub const fn mode(mut self, mode: DisplayMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub const fn sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.config.sync_mode = sync_mode;
        self
    }

    pub const fn distortion_mode(mut self, mode: DistortionMode) -> Self {
        self.config.distortion_mode = mode;
        self
    }

    pub const fn chromatic_mode(mut self, mode: ChromaticMode) -> Self {
        self.config.chromatic_mode = mode;
        self
    }

    pub const fn motion_comp_mode(mut self, mode: MotionCompMode) -> Self {
        self.config.motion_comp_mode = mode;
        self
    }

    /// Set the initial low persistence state. `duty` is clamped to `0..=100`.
    pub const fn low_persistence(mut self, enable: bool, duty: u32) -> Self {
        self.config.low_persistence = enable;
        self.config.low_persistence_duty = clamp_duty(duty);
        self
    }

    pub const fn fast_path(mut self, enable: bool) -> Self {
        self.config.fast_path = enable;
        self
    }

    pub const fn bypass(mut self, blend: bool, scale: bool, gamma: bool, dither: bool) -> Self {
        self.config.bypass_blend = blend;
        self.config.bypass_scale = scale;
        self.config.bypass_gamma = gamma;
        self.config.bypass_dither = dither;
        self
    }

    /// Set the nominal refresh rate. Zero is treated as 1 Hz.
    pub const fn target_vrefresh(mut self, hz: u32) -> Self {
        self.config.target_vrefresh = if hz == 0 { 1 } else { hz };
        self
    }

    pub const fn max_latency_us(mut self, us: u32) -> Self {
        self.config.max_latency_us = us;
        self
    }

    /// Set how long the worker sleeps between two polls of the interrupt
    /// status register. The sleep is bounded to `1..=2` milliseconds.
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = if interval.as_micros() < 1_000 {
            Duration::from_millis(1)
        } else if interval.as_micros() > 2_000 {
            Duration::from_millis(2)
        } else {
            interval
        };
        self
    }

    #[inline]
    pub const fn config(&self) -> &DisplayConfig {
        &self.config
    }

    #[inline]
    pub const fn get_poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}
