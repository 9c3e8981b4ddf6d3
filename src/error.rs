use thiserror::Error;

/// Error type shared by the page allocator, slab cache, event loopers and
/// workqueues. Mirrors the negative-errno convention of the C core: callers
/// get a typed reason instead of a bare `null`/`-1`.
#[derive(Error, Debug, Clone)]
pub enum RtError {
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("already pending: {0}")]
    Busy(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("os error: {0}")]
    Os(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl RtError {
    pub fn from_errno(context: &str) -> Self {
        RtError::Os(format!("{context}: {}", std::io::Error::last_os_error()))
    }
}

impl From<std::io::Error> for RtError {
    fn from(e: std::io::Error) -> Self {
        RtError::Os(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RtError>;
