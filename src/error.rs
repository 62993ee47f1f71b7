//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;
use std::io;

use crate::frame::Reason;

/// Result type often returned from methods that can have weft `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur handling HTTP/2 sessions and streams.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// Nothing available right now, retry later.
    Again,
    /// Orderly end of a stream or connection.
    Eof,
    /// A timer expired before anything happened.
    Timeup,
    /// The session or multiplexer was aborted, locally or by the peer.
    ConnAborted,
    /// The codec rejected a frame.
    BadFrame(Reason),
    /// A fatal protocol violation; carries the GOAWAY reason.
    Protocol(Reason),
    /// An invariant of the engine was violated.
    Internal,
    /// An `io::Error` occurred on the underlying transport.
    Io,
    /// Error raised by the host pipeline.
    User(User),
}

#[derive(Debug)]
pub(crate) enum User {
    /// The host produced an unparseable HTTP/1.1 response head.
    ResponseHead,
}

impl Error {
    /// Returns true if the operation should simply be retried later.
    pub fn is_again(&self) -> bool {
        matches!(self.inner.kind, Kind::Again)
    }

    /// Returns true if this is the orderly end of a stream or connection.
    pub fn is_eof(&self) -> bool {
        matches!(self.inner.kind, Kind::Eof)
    }

    /// Returns true if a wait timed out.
    pub fn is_timeup(&self) -> bool {
        matches!(self.inner.kind, Kind::Timeup)
    }

    /// Returns true if the session was aborted.
    pub fn is_conn_aborted(&self) -> bool {
        matches!(self.inner.kind, Kind::ConnAborted)
    }

    /// Returns true if this was a protocol violation.
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol(_) | Kind::BadFrame(_))
    }

    /// Returns true if this was an I/O error on the transport.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// Returns true if this error was caused by the host pipeline.
    pub fn is_user(&self) -> bool {
        matches!(self.inner.kind, Kind::User(_))
    }

    /// The HTTP/2 error code to put on a GOAWAY or RST_STREAM for this
    /// error, if any applies.
    pub fn reason(&self) -> Option<Reason> {
        match self.inner.kind {
            Kind::BadFrame(reason) | Kind::Protocol(reason) => Some(reason),
            Kind::Internal => Some(Reason::INTERNAL_ERROR),
            _ => None,
        }
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.inner.cause
    }

    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn kind(&self) -> &Kind {
        &self.inner.kind
    }

    pub(crate) fn new_again() -> Error {
        Error::new(Kind::Again)
    }

    pub(crate) fn new_eof() -> Error {
        Error::new(Kind::Eof)
    }

    pub(crate) fn new_timeup() -> Error {
        Error::new(Kind::Timeup)
    }

    pub(crate) fn new_conn_aborted() -> Error {
        Error::new(Kind::ConnAborted)
    }

    pub(crate) fn new_bad_frame(reason: Reason) -> Error {
        Error::new(Kind::BadFrame(reason))
    }

    pub(crate) fn new_protocol(reason: Reason) -> Error {
        Error::new(Kind::Protocol(reason))
    }

    pub(crate) fn new_internal() -> Error {
        Error::new(Kind::Internal)
    }

    pub(crate) fn new_io(cause: io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_user(user: User) -> Error {
        Error::new(Kind::User(user))
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Again => "operation would block",
            Kind::Eof => "end of stream",
            Kind::Timeup => "timed out",
            Kind::ConnAborted => "connection aborted",
            Kind::BadFrame(_) => "malformed frame",
            Kind::Protocol(_) => "protocol error",
            Kind::Internal => "internal error",
            Kind::Io => "connection error",
            Kind::User(User::ResponseHead) => "host produced an invalid response head",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("weft::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.kind {
            Kind::BadFrame(reason) | Kind::Protocol(reason) => {
                write!(f, "{}: {}", self.description(), reason)
            }
            _ => {
                if let Some(ref cause) = self.inner.cause {
                    write!(f, "{}: {}", self.description(), cause)
                } else {
                    f.write_str(self.description())
                }
            }
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::WouldBlock => Error::new_again(),
            io::ErrorKind::TimedOut => Error::new_timeup(),
            io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset => {
                Error::new_conn_aborted()
            }
            io::ErrorKind::UnexpectedEof => Error::new_eof(),
            _ => Error::new_io(err),
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        let kind = match err.kind() {
            Kind::Again => io::ErrorKind::WouldBlock,
            Kind::Timeup => io::ErrorKind::TimedOut,
            Kind::ConnAborted => io::ErrorKind::ConnectionAborted,
            Kind::Eof => io::ErrorKind::UnexpectedEof,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
