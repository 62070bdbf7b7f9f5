use std::fmt;
use std::io;

/// Possible errors from this crate.
#[derive(Debug)]
pub enum Error {
    /// Host or TLS configuration problem. Surfaces at startup and prevents serving.
    Config(String),
    /// A response operation was called in a state that doesn't allow it. Always
    /// a programmer bug in the application handler.
    Lifecycle(String),
    /// A body shape the writer dispatch cannot serialize under the negotiated framing.
    InvalidBody(String),
    /// The peer closed or reset the connection mid exchange.
    ClientGone,
    /// A codec filter failed while processing headers or body data.
    Filter(String),
    /// A wrapped std::io::Error from the underlying transport (socket).
    Io(io::Error),
    /// HTTP/1.1 parse errors from the `httparse` crate.
    Http11Parser(httparse::Error),
    /// Http errors from the `http` crate.
    Http(http::Error),
}

impl Error {
    pub(crate) fn lifecycle(msg: impl Into<String>) -> Self {
        Error::Lifecycle(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// True if the error means the peer is not coming back.
    pub fn is_client_gone(&self) -> bool {
        match self {
            Error::ClientGone => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Config(v) => write!(f, "config: {}", v),
            Error::Lifecycle(v) => write!(f, "response lifecycle: {}", v),
            Error::InvalidBody(v) => write!(f, "invalid body: {}", v),
            Error::ClientGone => write!(f, "client gone"),
            Error::Filter(v) => write!(f, "filter: {}", v),
            Error::Io(v) => fmt::Display::fmt(v, f),
            Error::Http11Parser(v) => write!(f, "http11 parser: {}", v),
            Error::Http(v) => write!(f, "http api: {}", v),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<httparse::Error> for Error {
    fn from(e: httparse::Error) -> Self {
        Error::Http11Parser(e)
    }
}

impl From<http::Error> for Error {
    fn from(e: http::Error) -> Self {
        Error::Http(e)
    }
}
