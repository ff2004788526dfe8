use thiserror::Error;

/// The error taxonomy surfaced by every fallible operation in the crate.
///
/// Read-path errors are returned to the caller and do not affect the
/// database state. A write-path error that leaves the WAL in an ambiguous
/// state is saved as the background error and poisons all later writes.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested entry or file does not exist.
    #[error("not found")]
    NotFound,

    /// A checksum or structural check failed.
    #[error("corruption: {0}")]
    Corruption(String),

    /// The underlying storage reported an error.
    #[error("i/o error: {0}")]
    IO(#[from] std::io::Error),

    /// The caller supplied an unusable argument (e.g. a comparator whose
    /// name differs from the one persisted in the manifest).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    /// The database handle has been closed and accepts no further work.
    #[error("db closed")]
    DBClosed,
}

// A saved error (iterator status, the poisoning background error) is
// reported to any number of callers, so errors must be duplicable.
// `io::Error` is not `Clone`; its kind and message survive the copy.
impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::NotFound => Error::NotFound,
            Error::Corruption(s) => Error::Corruption(s.clone()),
            Error::IO(e) => Error::IO(std::io::Error::new(e.kind(), e.to_string())),
            Error::InvalidArgument(s) => Error::InvalidArgument(s.clone()),
            Error::NotSupported(s) => Error::NotSupported(s.clone()),
            Error::DBClosed => Error::DBClosed,
        }
    }
}

impl Error {
    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }

    #[inline]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }
}

pub type IResult<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_clone_keeps_kind() {
        let e = Error::IO(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "torn write",
        ));
        match e.clone() {
            Error::IO(io) => {
                assert_eq!(io.kind(), std::io::ErrorKind::UnexpectedEof);
                assert!(io.to_string().contains("torn write"));
            }
            other => panic!("unexpected clone: {:?}", other),
        }
    }
}
