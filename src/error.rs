use thiserror::Error;

/// Errors surfaced by the index core.
///
/// Open paths (segment/field reader preparation) convert these into an
/// empty result and log the reason; write paths propagate them so the
/// caller can abandon the segment.
#[derive(Error, Debug)]
pub enum Error {
    /// Directory-level I/O failure, checksum mismatch, short read or
    /// seek out of range.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Well-formed I/O but semantically invalid content: duplicate
    /// column names, unsorted terms, unknown format ids.
    #[error("index error: {0}")]
    Index(String),

    /// Unsupported codec version or unknown feature flag.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Could not acquire or verify a directory lock.
    #[error("lock error: {0}")]
    Lock(String),
}

impl Error {
    pub(crate) fn io(msg: impl Into<String>) -> Self {
        Error::Io(std::io::Error::new(std::io::ErrorKind::Other, msg.into()))
    }

    pub(crate) fn eof(msg: impl Into<String>) -> Self {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            msg.into(),
        ))
    }

    pub(crate) fn index(msg: impl Into<String>) -> Self {
        Error::Index(msg.into())
    }
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::index("terms out of order");
        assert_eq!(err.to_string(), "index error: terms out of order");

        let err = Error::NotSupported("format version 9".to_string());
        assert_eq!(err.to_string(), "not supported: format version 9");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
