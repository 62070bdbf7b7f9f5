#[macro_use]
extern crate log;

mod body;
mod chunked;
mod codec;
mod error;
mod fast_buf;
mod headers;
mod host;
mod http11;
mod limit;
mod mpsc;
mod response;
mod share;
mod tls;
mod try_write;
mod writer;

pub(crate) use futures_io::{AsyncRead, AsyncSeek, AsyncWrite};

pub mod server;

pub use body::{Body, ByteRange, ByteSource, ChunkStream, RangeSource};
pub use error::Error;
pub use headers::{Cookie, CookieFlag, HeaderTable};
pub use host::{Application, Host, HostAddress, HostRegistry};
pub use response::{Response, ResponseState};
pub use share::RecvStream;
pub use tls::{CryptoMethod, TlsContext, TlsOptions, TlsVersion};
