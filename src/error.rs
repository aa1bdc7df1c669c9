use std::fmt::Display;

/// Plfsdir errors.
///
/// The first error produced by a table builder is sticky: once a write
/// pipeline observes a non-ok status, every later operation on it returns
/// that same status.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// A requested key or file does not exist.
    NotFound,
    /// Invalid on-disk data: bad checksum, truncated read, or a malformed
    /// block, handle, or footer.
    Corruption(String),
    /// An I/O error from the underlying sink or source.
    IoError(String),
    /// Invalid options or an invalid argument to a public operation.
    InvalidArgument(String),
    /// A precondition or build-time cap was violated: out-of-order keys,
    /// duplicate keys under unique-key mode, too many tables or epochs,
    /// or an operation on a finished builder.
    AssertionFailed(String),
    /// Backpressure signal under non-blocking mode. The caller should
    /// retry once an in-flight compaction drains.
    BufferFull,
    /// A create-if-missing collision.
    AlreadyExists(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotFound => write!(f, "not found"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::IoError(msg) => write!(f, "io error: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::AssertionFailed(msg) => write!(f, "assertion failed: {msg}"),
            Error::BufferFull => write!(f, "buffer full, retry later"),
            Error::AlreadyExists(msg) => write!(f, "already exists: {msg}"),
        }
    }
}

/// A plfsdir Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IoError(err.to_string())
    }
}

impl Error {
    /// Constructs a Corruption error from anything printable.
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Whether this is the non-blocking backpressure signal.
    pub fn is_buffer_full(&self) -> bool {
        matches!(self, Error::BufferFull)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            Error::Corruption("bad footer magic".into()).to_string(),
            "corruption: bad footer magic"
        );
        assert_eq!(Error::BufferFull.to_string(), "buffer full, retry later");
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::IoError(_)));
    }
}
