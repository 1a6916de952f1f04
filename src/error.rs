use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Resource exhausted: {0}")]
    Exhausted(String),

    #[error("Resource temporarily unavailable: {0}")]
    TryAgain(String),

    #[error("Out of memory")]
    OutOfMemory,

    #[error("No such device: {0}")]
    NoDevice(String),

    #[error("Bad address")]
    Fault,

    #[error("Operation not permitted: {0}")]
    PermissionDenied(String),

    #[error("Unsupported control code 0x{0:08x}")]
    NotSupported(u32),

    #[error("Bad file descriptor: {0}")]
    BadFd(i32),

    #[error("Configuration Error: {0}")]
    Config(String),
}

impl HostError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// The positive errno value this error is reported as.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::InvalidArgument(_) | Self::Config(_) => libc::EINVAL,
            Self::Exhausted(_) => libc::EBUSY,
            Self::TryAgain(_) => libc::EAGAIN,
            Self::OutOfMemory => libc::ENOMEM,
            Self::NoDevice(_) => libc::ENODEV,
            Self::Fault => libc::EFAULT,
            Self::PermissionDenied(_) => libc::EPERM,
            Self::NotSupported(_) => libc::ENOTTY,
            Self::BadFd(_) => libc::EBADF,
        }
    }

    /// Negative status code returned from the control-call entry point.
    #[must_use]
    pub fn status(&self) -> i64 {
        -i64::from(self.errno())
    }
}

impl From<std::collections::TryReserveError> for HostError {
    fn from(_: std::collections::TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

// A convenient alias
pub type HostResult<T> = Result<T, HostError>;
