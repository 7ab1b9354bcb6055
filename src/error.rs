//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Result type often returned from methods that can have weir `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur handling HTTP connections.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// Wire-level protocol violations. Most request errors are answered
    /// in-band with a status; these surface only through the client API.
    #[allow(unused)]
    Parse(Parse),
    #[allow(unused)]
    Limit(Limit),
    /// Authentication was required or failed.
    #[allow(unused)]
    Auth,
    /// A message reached EOF, but is not complete.
    IncompleteMessage,
    /// The connection exceeded its inactivity or request timeout.
    Timeout,
    /// An `io::Error` while reading or writing a network stream.
    Io,
    /// Error occurred while connecting.
    Connect,
    /// Error creating the listener.
    Listen,
    /// Error accepting a connection.
    #[allow(unused)]
    Accept,
    /// The peer reported an error status that cannot be retried.
    Status(u16),
    User(User),
}

#[derive(Debug)]
pub(crate) enum Parse {
    Method,
    Version,
    Uri,
    UriTooLong,
    Header,
    ContentLength,
    Chunk,
    Range,
    Status,
    TooLarge,
}

#[derive(Debug)]
pub(crate) enum Limit {
    Headers,
    Body,
    Upload,
    Clients,
    Requests,
}

#[derive(Debug)]
pub(crate) enum User {
    /// Output was written after the transmitter was finalized.
    WriteAfterFinalize,
    /// A client request needed an absolute URI.
    AbsoluteUriRequired,
    /// The redirect/authentication retry budget was exhausted.
    TooManyRetries,
    /// A route definition could not be compiled.
    BadRoute,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    /// Returns true if this was an HTTP parse error.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if this error was caused by an exceeded limit.
    pub fn is_limit(&self) -> bool {
        matches!(self.inner.kind, Kind::Limit(_))
    }

    /// Returns true if this error represents a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::Timeout)
    }

    /// Returns true if the connection closed before a message could complete.
    pub fn is_incomplete_message(&self) -> bool {
        matches!(self.inner.kind, Kind::IncompleteMessage)
    }

    /// Returns true if this was an authentication error.
    pub fn is_auth(&self) -> bool {
        matches!(self.inner.kind, Kind::Auth)
    }

    /// Returns true if this error was caused by user code.
    pub fn is_user(&self) -> bool {
        matches!(self.inner.kind, Kind::User(_))
    }

    /// Returns the HTTP status most closely describing this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self.inner.kind {
            Kind::Parse(Parse::UriTooLong) => Some(414),
            Kind::Parse(Parse::TooLarge) => Some(413),
            Kind::Parse(Parse::Range) => Some(416),
            Kind::Parse(_) => Some(400),
            Kind::Limit(Limit::Headers) | Kind::Limit(Limit::Body) | Kind::Limit(Limit::Upload) => {
                Some(413)
            }
            Kind::Limit(Limit::Clients) | Kind::Limit(Limit::Requests) => Some(503),
            Kind::Auth => Some(401),
            Kind::Timeout => Some(408),
            Kind::Status(status) => Some(status),
            _ => None,
        }
    }

    pub(crate) fn new_incomplete() -> Error {
        Error::new(Kind::IncompleteMessage)
    }

    pub(crate) fn new_timeout() -> Error {
        Error::new(Kind::Timeout)
    }

    pub(crate) fn new_io(cause: io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_connect(cause: io::Error) -> Error {
        Error::new(Kind::Connect).with(cause)
    }

    pub(crate) fn new_listen(cause: io::Error) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    pub(crate) fn new_status(status: u16, msg: &str) -> Error {
        Error::new(Kind::Status(status)).with(msg.to_string())
    }

    #[allow(unused)]
    pub(crate) fn new_parse(parse: Parse) -> Error {
        Error::new(Kind::Parse(parse))
    }

    pub(crate) fn new_user(user: User) -> Error {
        Error::new(Kind::User(user))
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::Method) => "invalid HTTP method parsed",
            Kind::Parse(Parse::Version) => "invalid HTTP version parsed",
            Kind::Parse(Parse::Uri) => "invalid URI",
            Kind::Parse(Parse::UriTooLong) => "URI too long",
            Kind::Parse(Parse::Header) => "invalid HTTP header parsed",
            Kind::Parse(Parse::ContentLength) => "invalid content-length parsed",
            Kind::Parse(Parse::Chunk) => "invalid chunk framing",
            Kind::Parse(Parse::Range) => "invalid byte range",
            Kind::Parse(Parse::Status) => "invalid HTTP status-line parsed",
            Kind::Parse(Parse::TooLarge) => "message head is too large",
            Kind::Limit(Limit::Headers) => "too many headers",
            Kind::Limit(Limit::Body) => "body exceeds configured maximum",
            Kind::Limit(Limit::Upload) => "upload exceeds configured maximum",
            Kind::Limit(Limit::Clients) => "too many concurrent clients",
            Kind::Limit(Limit::Requests) => "too many concurrent requests",
            Kind::Auth => "authentication required",
            Kind::IncompleteMessage => "connection closed before message completed",
            Kind::Timeout => "connection timed out",
            Kind::Io => "connection error",
            Kind::Connect => "error trying to connect",
            Kind::Listen => "error creating listener",
            Kind::Accept => "error accepting connection",
            Kind::Status(_) => "request failed with error status",
            Kind::User(User::WriteAfterFinalize) => "output written after finalize",
            Kind::User(User::AbsoluteUriRequired) => "client requires absolute-form URIs",
            Kind::User(User::TooManyRetries) => "too many redirects or auth retries",
            Kind::User(User::BadRoute) => "invalid route definition",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("weir::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
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
        Error::new_io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_size_not_too_big() {
        assert!(std::mem::size_of::<Error>() <= std::mem::size_of::<usize>());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(Error::new_parse(Parse::UriTooLong).status(), Some(414));
        assert_eq!(Error::new_parse(Parse::Header).status(), Some(400));
        assert_eq!(Error::new(Kind::Limit(Limit::Body)).status(), Some(413));
        assert_eq!(Error::new_timeout().status(), Some(408));
        assert_eq!(Error::new_io(io::Error::from(io::ErrorKind::Other)).status(), None);
    }
}
