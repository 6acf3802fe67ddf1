use std::io;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error surfaced by every public operation of this crate.
///
/// `Internal` reports a broken invariant (deleting a subscription that was
/// never added, a corrupt segment header). It is returned to the caller
/// instead of aborting the process, but correct usage never produces it and
/// it is not worth retrying. `LockTimeout` and transient `Io` failures on
/// segment growth are the only kinds a caller is expected to retry.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A lock or acknowledgment wait ran past its deadline.
    #[error("timed out waiting for {0}")]
    LockTimeout(&'static str),

    /// An allocation or mapping ran out of memory.
    #[error("out of memory")]
    OutOfMemory,

    /// A file or mapping operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An internal invariant does not hold.
    #[error("internal inconsistency: {0}")]
    Internal(String),

    /// Effective permissions deny access to a module's persisted data.
    #[error("permission check for module \"{module}\" failed (write: {write})")]
    PermissionDenied { module: String, write: bool },

    /// A lookup found nothing.
    #[error("{0} not found")]
    NotFound(String),
}

impl Error {
    /// Stable wire code, written into a segment header when a subscriber
    /// callback fails so the publisher can rebuild the error kind.
    pub fn code(&self) -> u32 {
        match self {
            Error::LockTimeout(_) => 1,
            Error::OutOfMemory => 2,
            Error::Io(_) => 3,
            Error::Internal(_) => 4,
            Error::PermissionDenied { .. } => 5,
            Error::NotFound(_) => 6,
        }
    }

    /// Rebuild an error from a wire code read out of a segment header.
    /// Zero means success and yields `None`; unknown codes collapse to
    /// `Internal` rather than being trusted.
    pub fn from_code(code: u32) -> Option<Error> {
        match code {
            0 => None,
            1 => Some(Error::LockTimeout("subscriber-side lock")),
            2 => Some(Error::OutOfMemory),
            3 => Some(Error::Io(io::Error::other("subscriber-side I/O failure"))),
            5 => Some(Error::PermissionDenied {
                module: String::from("(reported by subscriber)"),
                write: false,
            }),
            6 => Some(Error::NotFound(String::from("(reported by subscriber)"))),
            _ => Some(Error::Internal(format!("subscriber reported error code {code}"))),
        }
    }
}
