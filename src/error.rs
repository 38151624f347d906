use alloc_counter::no_alloc;
use std::ffi::c_int;

use crate::launch::Stage;

/// Result type for our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// An error from a single operating-system call, tracking cause (reason the error happened) and
/// context (what we were doing when the error happened) without allocating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error {
    pub errno: c_int,
    pub cause: Option<&'static str>,
    pub context: Option<&'static str>,
}

impl Error {
    /// Create an empty error.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn new() -> Error {
        Error {
            errno: 0,
            cause: None,
            context: None,
        }
    }

    /// Create an error carrying a specific errno.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn from_errno(errno: c_int) -> Error {
        Error {
            errno,
            cause: None,
            context: None,
        }
    }

    /// Create an error from the last OS error.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn last_os_error() -> Error {
        Error {
            errno: unsafe { *libc::__errno_location() },
            cause: None,
            context: None,
        }
    }

    /// Replace the cause of an error.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn cause(self, msg: &'static str) -> Error {
        Error {
            errno: self.errno,
            cause: Some(msg),
            context: self.context,
        }
    }

    /// Replace the context of an error.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn context(self, msg: &'static str) -> Error {
        Error {
            errno: self.errno,
            cause: self.cause,
            context: Some(msg),
        }
    }
}

impl Default for Error {
    fn default() -> Self {
        Self::new()
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error {
            errno: e.raw_os_error().unwrap_or(0),
            cause: None,
            context: None,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        // Get the error message from errno.
        let error_msg = unsafe { libc::strerror(self.errno) };
        let error_msg_len = unsafe { libc::strlen(error_msg) };
        let error_msg_str: &str = unsafe {
            std::str::from_utf8_unchecked(std::slice::from_raw_parts(
                error_msg as *const u8,
                error_msg_len,
            ))
        };

        match (self.context, self.cause) {
            (Some(context), None) => {
                write!(f, "{}: {} (errno {})", context, error_msg_str, self.errno)
            }
            (None, Some(cause)) => write!(f, "{}: {} (errno {})", cause, error_msg_str, self.errno),
            (Some(context), Some(cause)) => write!(
                f,
                "{}: {}: {} (errno {})",
                context, cause, error_msg_str, self.errno
            ),
            (None, None) => write!(f, "{} (errno {})", error_msg_str, self.errno),
        }
    }
}

impl std::error::Error for Error {}

// Define a macro, bail!, which returns an error with no errno and a custom message.
macro_rules! bail {
    ($msg:expr) => {
        return Err(Error {
            errno: 0,
            cause: Some($msg),
            context: None,
        })
    };
}
pub(crate) use bail;

// Define a macro, bail_errno!, which returns an error with the last OS error:
//
// - `bail_errno!()` returns an error with the last OS error.
// - `bail_errno!(msg)` returns an error with the last OS error and a context message.
macro_rules! bail_errno {
    () => {
        return Err(Error::last_os_error());
    };
    ($msg:expr) => {
        return Err(Error::last_os_error().cause($msg));
    };
}
pub(crate) use bail_errno;

/// Which identity axis a drop applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Group,
    User,
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Axis::Group => f.write_str("gid"),
            Axis::User => f.write_str("uid"),
        }
    }
}

/// A fatal launcher condition. Every variant terminates the process with its own exit status,
/// see [`LaunchError::exit_code`].
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("poll() failed: {0}")]
    Poll(Error),

    #[error("open(\"/dev/null\") failed: {0}")]
    OpenNull(Error),

    #[error("open() is broken: {got} vs. {want}")]
    DescriptorMismatch { got: c_int, want: c_int },

    #[error("close({fd}) failed: {err}")]
    Close { fd: c_int, err: Error },

    #[error("setuid flags forbidden on setuid binaries")]
    IdentityOverride,

    #[error("access({path:?}) failed: {err}")]
    AccessCheck { path: String, err: Error },

    #[error("chdir({path:?}) failed: {err}")]
    Chdir { path: String, err: Error },

    #[error("chroot({path:?}) failed: {err}")]
    Chroot { path: String, err: Error },

    #[error("command not found: {program}: {err}")]
    NotFound { program: String, err: Error },

    #[error("set{axis}({id}) failed: {err}")]
    DropToReal { axis: Axis, id: u32, err: Error },

    #[error("set{axis}() broken: wanted {want}, kernel reports {real}/{effective}/{saved}")]
    RealDropBroken {
        axis: Axis,
        want: u32,
        real: u32,
        effective: u32,
        saved: u32,
    },

    #[error("set{axis}({id}) failed: {err}")]
    AdoptRequested { axis: Axis, id: u32, err: Error },

    #[error("set{axis}() broken: wanted {want}, kernel reports {real}/{effective}/{saved}")]
    RequestedDropBroken {
        axis: Axis,
        want: u32,
        real: u32,
        effective: u32,
        saved: u32,
    },

    #[error("pledge({promises:?}) failed: {err}")]
    Pledge { promises: String, err: Error },

    #[error("setrlimit(RLIMIT_CPU) failed: {0}")]
    CpuLimit(Error),

    #[error("setrlimit(RLIMIT_FSIZE) failed: {0}")]
    FileSizeLimit(Error),

    #[error("setrlimit(RLIMIT_AS) failed: {0}")]
    MemoryLimit(Error),

    #[error("setrlimit(RLIMIT_NPROC) failed: {0}")]
    ProcessLimit(Error),

    #[error("failed to lower scheduling priority: {0}")]
    Nice(Error),

    #[error("launch step {to:?} cannot follow {from:?}")]
    OutOfOrder { from: Stage, to: Stage },

    #[error("{path}: execve failed: {err}")]
    Exec { path: String, err: Error },
}

impl LaunchError {
    /// The process exit status reported for this condition.
    pub fn exit_code(&self) -> i32 {
        match self {
            LaunchError::Poll(_) => 1,
            LaunchError::OpenNull(_) => 2,
            LaunchError::DescriptorMismatch { .. } => 3,
            LaunchError::Close { .. } => 4,
            LaunchError::IdentityOverride => 6,
            LaunchError::AccessCheck { .. } => 7,
            LaunchError::Chdir { .. } => 8,
            LaunchError::Chroot { .. } => 9,
            LaunchError::NotFound { .. } => 10,
            LaunchError::DropToReal {
                axis: Axis::Group, ..
            } => 11,
            LaunchError::RealDropBroken {
                axis: Axis::Group, ..
            } => 12,
            LaunchError::AdoptRequested {
                axis: Axis::Group, ..
            } => 13,
            LaunchError::RequestedDropBroken {
                axis: Axis::Group, ..
            } => 14,
            LaunchError::DropToReal {
                axis: Axis::User, ..
            } => 15,
            LaunchError::RealDropBroken {
                axis: Axis::User, ..
            } => 16,
            LaunchError::AdoptRequested {
                axis: Axis::User, ..
            } => 17,
            LaunchError::RequestedDropBroken {
                axis: Axis::User, ..
            } => 18,
            LaunchError::Pledge { .. } => 19,
            LaunchError::CpuLimit(_) => 20,
            LaunchError::FileSizeLimit(_) => 21,
            LaunchError::MemoryLimit(_) => 22,
            LaunchError::Nice(_) => 23,
            LaunchError::ProcessLimit(_) => 24,
            LaunchError::OutOfOrder { .. } => 70,
            LaunchError::Exec { .. } => 127,
        }
    }
}
