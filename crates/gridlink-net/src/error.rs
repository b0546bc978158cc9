use std::io;

use thiserror::Error;

/// Transport-level errors.
///
/// `SocketTimeout` means a blocking call hit its deadline; `InterruptedIo`
/// means the calling thread's interrupt flag was raised while blocked. The
/// two are deliberately close cousins, see [`Error::is_interrupted_io`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    IllegalArgument(String),

    #[error("{0}")]
    IllegalState(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    /// Peer closed the stream.
    #[error("connection reset by peer")]
    Eof,

    /// Cooperative interrupt observed while blocked. Carries the number of
    /// octets moved before the interrupt was seen.
    #[error("{reason}; {bytes} bytes transferred")]
    InterruptedIo { reason: &'static str, bytes: usize },

    /// Per-call deadline reached before the operation completed.
    #[error("{reason}")]
    SocketTimeout { reason: &'static str },

    #[error("could not resolve host \"{0}\"")]
    UnknownHost(String),
}

impl Error {
    pub fn illegal_argument(msg: impl Into<String>) -> Self {
        Self::IllegalArgument(msg.into())
    }

    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    /// True for both interrupt- and deadline-triggered early returns.
    pub fn is_interrupted_io(&self) -> bool {
        matches!(self, Self::InterruptedIo { .. } | Self::SocketTimeout { .. })
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Eof)
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            Self::IllegalArgument(_) => io::ErrorKind::InvalidInput,
            Self::IllegalState(_) => io::ErrorKind::NotConnected,
            Self::Io(err) => err.kind(),
            Self::Eof => io::ErrorKind::UnexpectedEof,
            // TimedOut for both: std helpers retry Interrupted, which would
            // defeat the cooperative interrupt.
            Self::InterruptedIo { .. } | Self::SocketTimeout { .. } => io::ErrorKind::TimedOut,
            Self::UnknownHost(_) => io::ErrorKind::NotFound,
        }
    }

    /// Recover a typed error that travelled through an `io::Error`, e.g.
    /// across the `io::Read`/`io::Write` stream adapters.
    pub fn from_io(err: io::Error) -> Self {
        match err.downcast::<Self>() {
            Ok(typed) => typed,
            Err(err) => Self::Io(err),
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(io) => io,
            other => Self::new(other.io_kind(), other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_error_survives_io_round_trip() {
        let err = Error::InterruptedIo { reason: "socket read interrupt", bytes: 17 };
        let io: io::Error = err.into();
        assert_eq!(io.kind(), io::ErrorKind::TimedOut);
        match Error::from_io(io) {
            Error::InterruptedIo { bytes, .. } => assert_eq!(bytes, 17),
            other => panic!("expected interrupted io, got {other:?}"),
        }
    }

    #[test]
    fn plain_io_error_stays_io() {
        let io = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        assert!(matches!(Error::from_io(io), Error::Io(_)));
    }
}
