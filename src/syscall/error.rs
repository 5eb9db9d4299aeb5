//! System Call Error Codes
//!
//! Failures cross the syscall boundary as small negative integers.

use core::fmt;

use crate::mm::MappingError;

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, Error>;

/// System call error codes
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Environment does not exist, is stale, or is not ours to touch
    BadEnv = -2,
    /// Invalid argument (address, alignment, permission, status)
    Inval = -3,
    /// Out of frames for a page or a page table
    NoMem = -4,
    /// Environment directory exhausted
    NoFreeEnv = -5,
    /// Bad user buffer
    Fault = -6,
    /// IPC target is not blocked in receive
    IpcNotRecv = -7,
}

impl Error {
    /// Negative code returned at the syscall boundary.
    #[inline]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Map a negative syscall return back to an error.
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            -2 => Some(Self::BadEnv),
            -3 => Some(Self::Inval),
            -4 => Some(Self::NoMem),
            -5 => Some(Self::NoFreeEnv),
            -6 => Some(Self::Fault),
            -7 => Some(Self::IpcNotRecv),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadEnv => write!(f, "bad environment"),
            Self::Inval => write!(f, "invalid parameter"),
            Self::NoMem => write!(f, "out of memory"),
            Self::NoFreeEnv => write!(f, "out of environments"),
            Self::Fault => write!(f, "segmentation fault"),
            Self::IpcNotRecv => write!(f, "env is not recving"),
        }
    }
}

impl From<MappingError> for Error {
    fn from(e: MappingError) -> Self {
        match e {
            MappingError::OutOfMemory => Self::NoMem,
            MappingError::BadAddress => Self::Inval,
        }
    }
}
