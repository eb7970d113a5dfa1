// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Error codes returned by the kernel synchronization and memory core.
//!
//! Every fallible operation returns [`KResult`]. Errors are plain values:
//! nothing here unwinds, and constructing an error through [`k_err!`] also
//! emits a `warn!` record so failures show up in kernel logs.

#![cfg_attr(not(test), no_std)]

use core::fmt;

use strum::EnumCount;

/// The kind of a [`KError`].
///
/// Similar to [`std::io::ErrorKind`].
///
/// [`std::io::ErrorKind`]: https://doc.rust-lang.org/std/io/enum.ErrorKind.html
#[repr(i32)]
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, EnumCount)]
pub enum KErrorKind {
    /// A pool tag or heap header did not carry the expected signature, or an
    /// integrity walk found inconsistent metadata.
    Corruption = 1,
    /// The object was torn down, either before the call or while the caller
    /// was blocked on it.
    Destroyed,
    /// Invalid handle, zero-sized or misaligned request, or a pointer that
    /// does not belong to the object it was returned to.
    InvalidInput,
    /// A pool or heap has no memory left for a non-blocking request.
    NoMemory,
    /// A mutex was released by a task that does not hold it.
    NotOwner,
    /// A non-recursive mutex was locked again by its own owner.
    NotReentrant,
    /// A counter would exceed its declared maximum.
    Overflow,
    /// The object is in use and cannot be reconfigured right now.
    ResourceBusy,
    /// A bounded wait expired before the object became available.
    TimedOut,
    /// A zero-timeout request found the object unavailable.
    WouldBlock,
}

impl KErrorKind {
    /// Returns the error description.
    pub fn as_str(&self) -> &'static str {
        use KErrorKind::*;
        match *self {
            Corruption => "Memory corruption detected",
            Destroyed => "Object destroyed",
            InvalidInput => "Invalid input parameter",
            NoMemory => "Out of memory",
            NotOwner => "Not the owner",
            NotReentrant => "Lock is not reentrant",
            Overflow => "Value overflow",
            ResourceBusy => "Resource busy",
            TimedOut => "Timed out",
            WouldBlock => "Operation would block",
        }
    }

    /// Returns the error code value in `i32`.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Returns the negative errno-style status used by C-facing shims.
    pub const fn errno(self) -> i32 {
        use KErrorKind::*;
        -match self {
            Corruption => 14,   // EFAULT
            Destroyed => 43,    // EIDRM
            InvalidInput => 22, // EINVAL
            NoMemory => 12,     // ENOMEM
            NotOwner => 1,      // EPERM
            NotReentrant => 35, // EDEADLK
            Overflow => 75,     // EOVERFLOW
            ResourceBusy => 16, // EBUSY
            TimedOut => 110,    // ETIMEDOUT
            WouldBlock => 11,   // EAGAIN
        }
    }
}

impl TryFrom<i32> for KErrorKind {
    type Error = i32;

    #[inline]
    fn try_from(value: i32) -> Result<Self, Self::Error> {
        if value > 0 && value <= KErrorKind::COUNT as i32 {
            Ok(unsafe { core::mem::transmute::<i32, KErrorKind>(value) })
        } else {
            Err(value)
        }
    }
}

impl fmt::Display for KErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The error type of the kernel core.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct KError(i32);

impl KError {
    const fn new(kind: KErrorKind) -> Self {
        KError(kind.code())
    }

    /// Returns the kind of this error.
    pub fn kind(self) -> KErrorKind {
        // Every `KError` is built from a valid kind.
        unsafe { core::mem::transmute::<i32, KErrorKind>(self.0) }
    }

    /// Returns the error code value in `i32`.
    pub const fn code(self) -> i32 {
        self.0
    }

    /// Returns the negative errno-style status of this error.
    pub fn errno(self) -> i32 {
        self.kind().errno()
    }

    /// Rebuilds an error from a code produced by [`KError::code`].
    pub fn try_from_i32(value: i32) -> Result<Self, i32> {
        KErrorKind::try_from(value).map(KError::new)
    }
}

impl From<KErrorKind> for KError {
    fn from(kind: KErrorKind) -> Self {
        KError::new(kind)
    }
}

impl From<KError> for KErrorKind {
    fn from(e: KError) -> Self {
        e.kind()
    }
}

impl fmt::Debug for KError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KErrorKind::{:?}", self.kind())
    }
}

impl fmt::Display for KError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind())
    }
}

macro_rules! kerror_consts {
    ($($name:ident),*) => {
        #[allow(non_upper_case_globals)]
        impl KError {
            $(
                #[doc = concat!("A [`KError`] with kind [`KErrorKind::", stringify!($name), "`].")]
                pub const $name: Self = Self::new(KErrorKind::$name);
            )*
        }
    };
}

kerror_consts!(
    Corruption,
    Destroyed,
    InvalidInput,
    NoMemory,
    NotOwner,
    NotReentrant,
    Overflow,
    ResourceBusy,
    TimedOut,
    WouldBlock
);

/// A specialized [`Result`] type with [`KError`] as the error type.
pub type KResult<T = ()> = Result<T, KError>;

/// Builds a [`KError`] and prints a warning message.
///
/// # Examples
///
/// ```
/// # use kerrno::{k_err_type, KError};
/// // Also prints "[KErrorKind::WouldBlock]".
/// assert_eq!(k_err_type!(WouldBlock), KError::WouldBlock);
///
/// // Also prints "[KErrorKind::NoMemory] pool exhausted".
/// assert_eq!(k_err_type!(NoMemory, "pool exhausted"), KError::NoMemory);
/// ```
#[macro_export]
macro_rules! k_err_type {
    ($err:ident) => {{
        use $crate::KErrorKind::*;
        let err = $crate::KError::from($err);
        $crate::__priv::warn!("[{:?}]", err);
        err
    }};
    ($err:ident, $msg:expr) => {{
        use $crate::KErrorKind::*;
        let err = $crate::KError::from($err);
        $crate::__priv::warn!("[{:?}] {}", err, $msg);
        err
    }};
}

/// Returns early with the given value if a condition does not hold.
///
/// ## Examples
///
/// ```rust
/// # use kerrno::{ensure, k_err, KResult};
/// fn block_count(count: usize) -> KResult<usize> {
///     ensure!(count > 0, k_err!(InvalidInput));
///     Ok(count)
/// }
/// assert!(block_count(0).is_err());
/// ```
#[macro_export]
macro_rules! ensure {
    ($predicate:expr, $context_selector:expr $(,)?) => {
        if !$predicate {
            return $context_selector;
        }
    };
}

/// Builds an [`Err(KError)`] and prints a warning message.
///
/// # Examples
///
/// ```
/// # use kerrno::{k_err, KResult, KError};
/// assert_eq!(k_err!(TimedOut), KResult::<()>::Err(KError::TimedOut));
/// assert_eq!(
///     k_err!(NotOwner, "unlock by a foreign task"),
///     KResult::<()>::Err(KError::NotOwner),
/// );
/// ```
/// [`Err(KError)`]: Err
#[macro_export]
macro_rules! k_err {
    ($err:ident) => {
        Err($crate::k_err_type!($err))
    };
    ($err:ident, $msg:expr) => {
        Err($crate::k_err_type!($err, $msg))
    };
}

/// Returns an [`Err(KError)`] of the given kind, optionally with a message.
///
/// [`Err(KError)`]: Err
#[macro_export]
macro_rules! k_bail {
    ($($t:tt)*) => {
        return $crate::k_err!($($t)*);
    };
}

#[doc(hidden)]
pub mod __priv {
    pub use log::warn;
}
