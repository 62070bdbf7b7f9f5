use crate::{AsyncRead, AsyncSeek};
use futures_util::stream::Stream;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fmt;
use std::io;

/// A seekable byte source for range responses.
pub trait RangeSource: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T> RangeSource for T where T: AsyncRead + AsyncSeek + Send + Unpin {}

/// An opaque readable byte source with unknown length.
pub type ByteSource = Box<dyn AsyncRead + Send + Unpin>;

/// A lazy, finite, non-restartable sequence of body chunks.
pub type ChunkStream = Box<dyn Stream<Item = io::Result<Vec<u8>>> + Send + Unpin>;

/// Half-open byte window into a seekable source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

/// The response body shapes the writer dispatch understands.
///
/// Anything outside these shapes simply can't be constructed; shape and
/// framing can still mismatch, which the dispatch rejects.
pub enum Body {
    /// No body bytes at all.
    Empty,
    /// A finite byte buffer, length known up front.
    Buffer(Vec<u8>),
    /// An opaque readable source, length unknown.
    Stream(ByteSource),
    /// One window out of a seekable source.
    ByteRange {
        source: Box<dyn RangeSource>,
        range: ByteRange,
    },
    /// Several windows out of a seekable source, serialized as
    /// `multipart/byteranges`.
    MultiPartByteRange {
        source: Box<dyn RangeSource>,
        ranges: Vec<ByteRange>,
        /// Size of the complete entity, for `Content-Range: bytes a-b/size`.
        complete_len: u64,
        /// Per-part `Content-Type`.
        content_type: String,
        boundary: String,
    },
    /// A lazy chunk sequence.
    Iterator(ChunkStream),
}

/// The value domain of the `:aerys-entity-length` pseudo-header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntityLength {
    /// `"@"` — no body follows the headers.
    NoBody,
    /// `"*"` — body of unknown length follows.
    Streaming,
    /// Decimal — identity framing with this many bytes.
    Known(u64),
}

impl EntityLength {
    pub fn header_value(&self) -> String {
        match self {
            EntityLength::NoBody => "@".to_string(),
            EntityLength::Streaming => "*".to_string(),
            EntityLength::Known(n) => n.to_string(),
        }
    }

    pub fn parse(v: &str) -> Option<EntityLength> {
        match v {
            "@" => Some(EntityLength::NoBody),
            "*" => Some(EntityLength::Streaming),
            _ => v.parse().ok().map(EntityLength::Known),
        }
    }
}

impl Body {
    pub fn stream(source: impl AsyncRead + Send + Unpin + 'static) -> Body {
        Body::Stream(Box::new(source))
    }

    pub fn byte_range(source: impl RangeSource + 'static, offset: u64, length: u64) -> Body {
        Body::ByteRange {
            source: Box::new(source),
            range: ByteRange { offset, length },
        }
    }

    /// Multipart range body with a freshly generated boundary token.
    pub fn multipart_byte_range(
        source: impl RangeSource + 'static,
        ranges: impl IntoIterator<Item = (u64, u64)>,
        complete_len: u64,
        content_type: impl Into<String>,
    ) -> Body {
        Self::multipart_with_boundary(source, ranges, complete_len, content_type, gen_boundary())
    }

    /// Multipart range body with a caller-provided boundary token.
    pub fn multipart_with_boundary(
        source: impl RangeSource + 'static,
        ranges: impl IntoIterator<Item = (u64, u64)>,
        complete_len: u64,
        content_type: impl Into<String>,
        boundary: impl Into<String>,
    ) -> Body {
        Body::MultiPartByteRange {
            source: Box::new(source),
            ranges: ranges
                .into_iter()
                .map(|(offset, length)| ByteRange { offset, length })
                .collect(),
            complete_len,
            content_type: content_type.into(),
            boundary: boundary.into(),
        }
    }

    pub fn iterator(
        stream: impl Stream<Item = io::Result<Vec<u8>>> + Send + Unpin + 'static,
    ) -> Body {
        Body::Iterator(Box::new(stream))
    }

    /// The entity length announced to the codec for this shape.
    pub(crate) fn entity_length(&self) -> EntityLength {
        match self {
            Body::Empty => EntityLength::NoBody,
            Body::Buffer(b) => EntityLength::Known(b.len() as u64),
            Body::Stream(_) => EntityLength::Streaming,
            Body::ByteRange { range, .. } => EntityLength::Known(range.length),
            Body::MultiPartByteRange {
                ranges,
                complete_len,
                content_type,
                boundary,
                ..
            } => EntityLength::Known(multipart_len(ranges, *complete_len, content_type, boundary)),
            Body::Iterator(_) => EntityLength::Streaming,
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        if v.is_empty() {
            Body::Empty
        } else {
            Body::Buffer(v)
        }
    }
}

impl From<&[u8]> for Body {
    fn from(v: &[u8]) -> Self {
        v.to_vec().into()
    }
}

impl From<String> for Body {
    fn from(v: String) -> Self {
        v.into_bytes().into()
    }
}

impl From<&str> for Body {
    fn from(v: &str) -> Self {
        v.as_bytes().into()
    }
}

impl From<()> for Body {
    fn from(_: ()) -> Self {
        Body::Empty
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Body::Empty => write!(f, "Empty"),
            Body::Buffer(b) => write!(f, "Buffer({})", b.len()),
            Body::Stream(_) => write!(f, "Stream"),
            Body::ByteRange { range, .. } => {
                write!(f, "ByteRange({}+{})", range.offset, range.length)
            }
            Body::MultiPartByteRange { ranges, .. } => {
                write!(f, "MultiPartByteRange({} parts)", ranges.len())
            }
            Body::Iterator(_) => write!(f, "Iterator"),
        }
    }
}

fn gen_boundary() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}

/// The per-part delimiter + headers block preceding each range's bytes.
pub(crate) fn multipart_part_head(
    boundary: &str,
    content_type: &str,
    range: &ByteRange,
    complete_len: u64,
) -> String {
    format!(
        "--{}\r\nContent-Type: {}\r\nContent-Range: bytes {}-{}/{}\r\n\r\n",
        boundary,
        content_type,
        range.offset,
        range.offset + range.length.saturating_sub(1),
        complete_len,
    )
}

/// The closing delimiter after the final range.
pub(crate) fn multipart_close(boundary: &str) -> String {
    format!("--{}--\r\n", boundary)
}

/// Exact serialized length of a multipart range body, for `content-length`.
pub(crate) fn multipart_len(
    ranges: &[ByteRange],
    complete_len: u64,
    content_type: &str,
    boundary: &str,
) -> u64 {
    let mut total = 0;
    for r in ranges {
        total += multipart_part_head(boundary, content_type, r, complete_len).len() as u64;
        total += r.length;
        total += 2; // CRLF after the part bytes
    }
    total + multipart_close(boundary).len() as u64
}
