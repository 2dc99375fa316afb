use core::fmt;

/// The failure codes the controller interface can report.
///
/// The discriminants are the negated Linux `errno` values reported by the
/// display controller's firmware interface, so a `ResultCode` can be handed
/// across that boundary as a plain integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i32)]
pub enum ResultCode {
    /// A coherent buffer or a worker thread could not be allocated.
    OutOfMemory = -12,
    /// The device is not in a state that permits the operation, e.g., it
    /// hasn't been initialized yet.
    BadObjectState = -16,
    /// A display index, mode value, or payload is invalid.
    InvalidArgument = -22,
    /// A register access was rejected by the bus.
    Io = -5,
    /// The operation timed out.
    Timeout = -110,
}

impl ResultCode {
    /// The negated `errno` value.
    ///
    /// ```
    /// use vrdc::ResultCode;
    /// assert_eq!(ResultCode::Timeout.errno(), -110);
    /// ```
    #[inline]
    pub const fn errno(self) -> i32 {
        self as i32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OutOfMemory => "OutOfMemory",
            Self::BadObjectState => "BadObjectState",
            Self::InvalidArgument => "InvalidArgument",
            Self::Io => "Io",
            Self::Timeout => "Timeout",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Define a per-operation error type whose variants are a subset of
/// [`ResultCode`]'s.
///
/// `enum E: A, B { .. }` also makes `A` and `B` convert into `E`, which
/// requires every variant of `A` and `B` to exist in `E`.
macro_rules! define_error {
    (
        mod $mod_name:ident {}
        $( #[$meta:meta] )*
        $vis:vis enum $name:ident $(: $($subty:ident),* $(,)*)? {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i32)]
        $vis enum $name {
            $(
                $( #[$vmeta] )*
                $vname = ResultCode::$vname as i32
            ),*
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                match x {
                    $( $name::$vname => Self::$vname, )*
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(ResultCode::from(*self).as_str())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                fmt::Display::fmt(&ResultCode::from(*self), f)
            }
        }

        impl std::error::Error for $name {}

        #[cfg(test)]
        mod $mod_name {
            use super::*;

            #[test]
            fn shares_errno_with_result_code() {
                $(
                    assert_eq!(
                        $name::$vname as i32,
                        ResultCode::from($name::$vname).errno(),
                    );
                )*
            }
        }

        $($(
            $subty!(impl From<_> for $name);
        )*)?

        #[allow(unused_macros)]
        macro_rules! $name {
            (impl From<_> for $dest_ty:ty) => {
                impl From<$name> for $dest_ty {
                    #[inline]
                    fn from(x: $name) -> Self {
                        match x {
                            $( $name::$vname => Self::$vname, )*
                        }
                    }
                }
            };
        }
    };
}

define_error! {
    mod register_access_error {}
    /// Error type for [`RegisterBank::write32`].
    ///
    /// [`RegisterBank::write32`]: crate::RegisterBank::write32
    pub enum RegisterAccessError {
        /// The bus rejected the access.
        Io,
    }
}

define_error! {
    mod set_config_error {}
    /// Error type for the configuration setters of [`VrDisplay`] and for the
    /// conversion of raw values into mode enums.
    ///
    /// [`VrDisplay`]: crate::VrDisplay
    pub enum SetConfigError {
        /// The value is out of range.
        InvalidArgument,
    }
}

define_error! {
    mod query_error {}
    /// Error type for per-display statistics queries such as
    /// [`VrDisplay::get_vsync_period`].
    ///
    /// [`VrDisplay::get_vsync_period`]: crate::VrDisplay::get_vsync_period
    pub enum QueryError {
        /// The display index is out of range.
        InvalidArgument,
    }
}

define_error! {
    mod set_map_error {}
    /// Error type for [`VrDisplay::set_distortion_map`],
    /// [`VrDisplay::set_chromatic_map`], and
    /// [`VrDisplay::set_motion_vectors`].
    ///
    /// [`VrDisplay::set_distortion_map`]: crate::VrDisplay::set_distortion_map
    /// [`VrDisplay::set_chromatic_map`]: crate::VrDisplay::set_chromatic_map
    /// [`VrDisplay::set_motion_vectors`]: crate::VrDisplay::set_motion_vectors
    pub enum SetMapError: QueryError {
        /// The display index is out of range, or the payload is empty.
        InvalidArgument,
        /// The coherent buffer could not be allocated. The previously
        /// installed buffer (if any) is left intact.
        OutOfMemory,
    }
}

define_error! {
    mod wait_error {}
    /// Error type for [`VrDisplay::wait_for_vsync`] and
    /// [`VrDisplay::wait_for_commit`].
    ///
    /// [`VrDisplay::wait_for_vsync`]: crate::VrDisplay::wait_for_vsync
    /// [`VrDisplay::wait_for_commit`]: crate::VrDisplay::wait_for_commit
    pub enum WaitError: QueryError {
        /// The display index is out of range.
        InvalidArgument,
        /// No event arrived before the deadline.
        Timeout,
    }
}

define_error! {
    mod init_error {}
    /// Error type for [`VrDisplay::init`].
    ///
    /// [`VrDisplay::init`]: crate::VrDisplay::init
    pub enum InitError {
        /// The device is initialized or still being finalized.
        BadObjectState,
        /// The worker thread could not be created.
        OutOfMemory,
    }
}

define_error! {
    mod enable_error {}
    /// Error type for [`VrDisplay::enable`] and [`VrDisplay::resume`].
    ///
    /// [`VrDisplay::enable`]: crate::VrDisplay::enable
    /// [`VrDisplay::resume`]: crate::VrDisplay::resume
    pub enum EnableError {
        /// The device is not initialized.
        BadObjectState,
    }
}

define_error! {
    mod store_attr_error {}
    /// Error type for [`VrDisplay::store`].
    ///
    /// [`VrDisplay::store`]: crate::VrDisplay::store
    pub enum StoreAttrError: SetConfigError, QueryError, SetMapError {
        /// The attribute is unknown or read-only, or the text is malformed.
        InvalidArgument,
        /// A coherent buffer could not be allocated.
        OutOfMemory,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_errors_keep_their_code() {
        assert_eq!(
            SetMapError::from(QueryError::InvalidArgument),
            SetMapError::InvalidArgument
        );
        assert_eq!(
            StoreAttrError::from(SetMapError::OutOfMemory),
            StoreAttrError::OutOfMemory
        );
        assert_eq!(WaitError::Timeout.to_string(), "Timeout");
        assert_eq!(format!("{:?}", InitError::BadObjectState), "BadObjectState");
    }
}
