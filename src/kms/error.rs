use std::io;

use super::ObjectId;

/// Why a KMS operation did not go through.
#[derive(Debug, thiserror::Error)]
pub enum KmsError {
    /// The kernel refused the configuration; resubmitting it unchanged will fail again.
    #[error("configuration rejected by the kernel")]
    Rejected(#[source] io::Error),
    /// The device stayed busy through every attempt. Zero attempts means the request was refused
    /// locally because a previous commit is still in flight.
    #[error("device busy after {attempts} attempt(s)")]
    Busy { attempts: u32 },
    /// The object (or the whole device) is gone.
    #[error("object no longer exists")]
    Removed,
    /// The request was inconsistent before it ever reached the kernel.
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("{object:?} has no {name} property")]
    MissingProperty { object: ObjectId, name: String },
    #[error("output is not active")]
    Inactive,
    #[error("not supported: {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    Io(io::Error),
}

impl KmsError {
    /// Classifies a failed ioctl by its errno.
    pub fn from_io(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EBUSY | libc::EAGAIN | libc::EINTR) => Self::Busy { attempts: 1 },
            Some(libc::ENODEV | libc::ENOENT | libc::ENXIO) => Self::Removed,
            Some(libc::EINVAL | libc::ERANGE | libc::ENOSPC | libc::EPERM | libc::EACCES) => {
                Self::Rejected(err)
            }
            _ => Self::Io(err),
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }

    pub fn is_removed(&self) -> bool {
        matches!(self, Self::Removed)
    }
}

impl From<io::Error> for KmsError {
    fn from(err: io::Error) -> Self {
        Self::from_io(err)
    }
}
