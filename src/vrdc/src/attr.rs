//! The text attribute interface
//!
//! Every attribute is a short line of text. Configuration attributes accept
//! what [`VrDisplay::show`] prints as well as raw values. Per-display
//! attributes print one value per display, separated by spaces.
use core::{fmt, str::FromStr};
use std::fmt::Write;

use crate::{
    ChromaticMode, DisplayMode, DistortionMode, MotionCompMode, QueryError,
    StoreAttrError, SyncMode, VrDisplay, NUM_DISPLAYS,
};

macro_rules! define_attrs {
    ($( $( #[$meta:meta] )* $vname:ident = ($vstr:expr, $writable:expr) ),* $(,)*) => {
        /// An attribute of [`VrDisplay`].
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Attr {
            $( $( #[$meta] )* $vname, )*
        }

        impl Attr {
            pub const ALL: &'static [Self] = &[$(Self::$vname),*];

            pub const fn name(self) -> &'static str {
                match self {
                    $( Self::$vname => $vstr, )*
                }
            }

            /// Get a flag indicating whether [`VrDisplay::store`] accepts this
            /// attribute.
            pub const fn is_writable(self) -> bool {
                match self {
                    $( Self::$vname => $writable, )*
                }
            }
        }
    };
}

define_attrs! {
    Mode = ("mode", true),
    SyncMode = ("sync_mode", true),
    DistortionMode = ("distortion_mode", true),
    ChromaticMode = ("chromatic_mode", true),
    MotionCompMode = ("motion_comp_mode", true),
    /// `<0|1> <duty>`
    LowPersistence = ("low_persistence", true),
    FastPath = ("fast_path", true),
    /// `<blend> <scale> <gamma> <dither>`
    Bypass = ("bypass", true),
    VsyncPeriod = ("vsync_period", false),
    CommitLatency = ("commit_latency", false),
    FrameCount = ("frame_count", false),
}

impl FromStr for Attr {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|attr| attr.name() == s)
            .ok_or(QueryError::InvalidArgument)
    }
}

impl fmt::Display for Attr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parse a boolean the way sysfs does.
fn parse_bool(s: &str) -> Result<bool, StoreAttrError> {
    match s {
        "1" | "y" | "Y" | "on" | "true" => Ok(true),
        "0" | "n" | "N" | "off" | "false" => Ok(false),
        _ => Err(StoreAttrError::InvalidArgument),
    }
}

fn bool_digit(x: bool) -> u8 {
    x as u8
}

/// Split `text` into exactly `N` whitespace-separated fields.
fn fields<const N: usize>(text: &str) -> Result<[&str; N], StoreAttrError> {
    let mut out = [""; N];
    let mut it = text.split_whitespace();
    for field in out.iter_mut() {
        *field = it.next().ok_or(StoreAttrError::InvalidArgument)?;
    }
    if it.next().is_some() {
        return Err(StoreAttrError::InvalidArgument);
    }
    Ok(out)
}

impl VrDisplay {
    /// Print the attribute named `name`.
    pub fn show(&self, name: &str) -> Result<String, QueryError> {
        let attr: Attr = name.parse()?;
        log::trace!("show({attr})");
        let config = self.config();
        let mut out = String::new();

        // `fmt::Write` for `String` never fails
        let _ = match attr {
            Attr::Mode => write!(out, "{}", config.mode),
            Attr::SyncMode => write!(out, "{}", config.sync_mode),
            Attr::DistortionMode => write!(out, "{}", config.distortion_mode),
            Attr::ChromaticMode => write!(out, "{}", config.chromatic_mode),
            Attr::MotionCompMode => write!(out, "{}", config.motion_comp_mode),
            Attr::LowPersistence => write!(
                out,
                "{} {}",
                bool_digit(config.low_persistence),
                config.low_persistence_duty
            ),
            Attr::FastPath => write!(out, "{}", bool_digit(config.fast_path)),
            Attr::Bypass => write!(
                out,
                "{} {} {} {}",
                bool_digit(config.bypass_blend),
                bool_digit(config.bypass_scale),
                bool_digit(config.bypass_gamma),
                bool_digit(config.bypass_dither)
            ),
            Attr::VsyncPeriod | Attr::CommitLatency | Attr::FrameCount => {
                for i in 0..NUM_DISPLAYS {
                    if i > 0 {
                        out.push(' ');
                    }
                    let stats = self.stats(i)?;
                    let _ = match attr {
                        Attr::VsyncPeriod => write!(out, "{}", stats.vsync_period_us),
                        Attr::CommitLatency => write!(out, "{}", stats.commit_latency_us),
                        _ => write!(out, "{}", stats.frame_counter),
                    };
                }
                Ok(())
            }
        };

        Ok(out)
    }

    /// Parse `text` and apply it to the attribute named `name`.
    ///
    /// Nothing is changed if this returns an error.
    pub fn store(&self, name: &str, text: &str) -> Result<(), StoreAttrError> {
        let attr: Attr = name.parse()?;
        log::trace!("store({attr}, {text:?})");
        if !attr.is_writable() {
            return Err(StoreAttrError::InvalidArgument);
        }

        let text = text.trim();
        match attr {
            Attr::Mode => self.set_mode(text.parse::<DisplayMode>()?)?,
            Attr::SyncMode => self.set_sync_mode(text.parse::<SyncMode>()?)?,
            Attr::DistortionMode => {
                self.set_distortion_mode(text.parse::<DistortionMode>()?)?
            }
            Attr::ChromaticMode => self.set_chromatic_mode(text.parse::<ChromaticMode>()?)?,
            Attr::MotionCompMode => {
                self.set_motion_comp_mode(text.parse::<MotionCompMode>()?)?
            }
            Attr::LowPersistence => {
                let [enable, duty] = fields(text)?;
                let enable = parse_bool(enable)?;
                let duty: u32 = duty.parse().map_err(|_| StoreAttrError::InvalidArgument)?;
                self.set_low_persistence(enable, duty)?;
            }
            Attr::FastPath => self.set_fast_path(parse_bool(text)?)?,
            Attr::Bypass => {
                let [blend, scale, gamma, dither] = fields(text)?;
                self.set_bypass_options(
                    parse_bool(blend)?,
                    parse_bool(scale)?,
                    parse_bool(gamma)?,
                    parse_bool(dither)?,
                )?;
            }
            Attr::VsyncPeriod | Attr::CommitLatency | Attr::FrameCount => {
                return Err(StoreAttrError::InvalidArgument)
            }
        }

        Ok(())
    }
}
