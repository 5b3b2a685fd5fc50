//! Low-level building blocks for the greyfork execution core.
//!
//! This crate holds everything that talks to the operating system directly:
//! process forking, pipe pairs, signal bookkeeping, shared memory maps and
//! the scratch file used to feed target stdin. The higher-level crates
//! (`greyfork`, `greyfork_targets`) build the fork-server protocol and the
//! trace recorder on top of these primitives.

#[cfg(unix)]
pub mod fs;
#[cfg(unix)]
pub mod os;
#[cfg(unix)]
pub mod shmem;

use core::{
    array::TryFromSliceError,
    fmt::{self, Display},
    num::{ParseIntError, TryFromIntError},
};
use std::{env::VarError, io};

/// Main error struct for greyfork
#[derive(Debug)]
pub enum Error {
    /// File related error
    File(io::Error),
    /// Wrapped OS error with additional context
    OsError(io::Error, String),
    /// Key not found (usually a missing environment variable)
    KeyNotFound(String),
    /// No elements in the current item
    Empty(String),
    /// You're holding it wrong
    IllegalState(String),
    /// The argument passed to this method or function is not valid
    IllegalArgument(String),
    /// The performed action is not supported on the current platform
    Unsupported(String),
    /// Something else happened
    Unknown(String),
}

impl Error {
    /// File related error
    #[must_use]
    pub fn file(arg: io::Error) -> Self {
        Error::File(arg)
    }

    /// OS error with additional context
    #[must_use]
    pub fn os_error<S>(err: io::Error, msg: S) -> Self
    where
        S: Into<String>,
    {
        Error::OsError(err, msg.into())
    }

    /// OS error from [`io::Error::last_os_error`] with additional context
    #[must_use]
    pub fn last_os_error<S>(msg: S) -> Self
    where
        S: Into<String>,
    {
        Error::OsError(io::Error::last_os_error(), msg.into())
    }

    /// Key not found
    #[must_use]
    pub fn key_not_found<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::KeyNotFound(arg.into())
    }

    /// No elements in the current item
    #[must_use]
    pub fn empty<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Empty(arg.into())
    }

    /// You're holding it wrong
    #[must_use]
    pub fn illegal_state<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalState(arg.into())
    }

    /// The argument passed to this method or function is not valid
    #[must_use]
    pub fn illegal_argument<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalArgument(arg.into())
    }

    /// This operation is not supported on the current architecture or platform
    #[must_use]
    pub fn unsupported<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Unsupported(arg.into())
    }

    /// Something else happened
    #[must_use]
    pub fn unknown<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Unknown(arg.into())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::File(err) => write!(f, "File IO failed: {err:?}"),
            Self::OsError(err, s) => write!(f, "OS error: {s}: {err:?}"),
            Self::KeyNotFound(s) => write!(f, "Key `{s}` not found"),
            Self::Empty(s) => write!(f, "No items in {s}"),
            Self::IllegalState(s) => write!(f, "Illegal state: {s}"),
            Self::IllegalArgument(s) => write!(f, "Illegal argument: {s}"),
            Self::Unsupported(s) => {
                write!(f, "The operation is not supported on the current platform: {s}")
            }
            Self::Unknown(s) => write!(f, "Unknown error: {s}"),
        }
    }
}

impl std::error::Error for Error {}

/// Create an `Error` from an io Error
impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::file(err)
    }
}

#[cfg(unix)]
impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Self::unknown(format!("Unix error: {err:?}"))
    }
}

impl From<VarError> for Error {
    fn from(err: VarError) -> Self {
        Self::empty(format!("Could not get env var: {err:?}"))
    }
}

impl From<ParseIntError> for Error {
    fn from(err: ParseIntError) -> Self {
        Self::unknown(format!("Failed to parse Int: {err:?}"))
    }
}

impl From<TryFromIntError> for Error {
    fn from(err: TryFromIntError) -> Self {
        Self::illegal_state(format!("Expected conversion failed: {err:?}"))
    }
}

impl From<TryFromSliceError> for Error {
    fn from(err: TryFromSliceError) -> Self {
        Self::illegal_argument(format!("Could not convert slice: {err:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn error_display_carries_context() {
        let err = Error::illegal_state("forkserver wedged");
        assert_eq!(format!("{err}"), "Illegal state: forkserver wedged");

        let err = Error::key_not_found("GF_COVERAGE_LOG");
        assert!(format!("{err}").contains("GF_COVERAGE_LOG"));
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::from(std::io::ErrorKind::NotFound);
        let err: Error = io_err.into();
        assert!(matches!(err, Error::File(_)));
    }
}
