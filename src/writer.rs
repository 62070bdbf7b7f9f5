use crate::body::{
    multipart_close, multipart_part_head, Body, ByteRange, ByteSource, ChunkStream, RangeSource,
};
use crate::chunked::ChunkedEncoder;
use crate::try_write::OutBuf;
use crate::Error;
use crate::{AsyncRead, AsyncSeek};
use futures_util::ready;
use futures_util::stream::Stream;
use std::collections::VecDeque;
use std::io;
use std::io::SeekFrom;
use std::pin::Pin;
use std::task::{Context, Poll};

/// How body bytes are delimited on the wire.
///
/// Decided by the codec when it consumes the entity length; the writers
/// only execute the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FramingMode {
    /// `content-length` stamped, bytes go out verbatim.
    Identity,
    /// `transfer-encoding: chunked`.
    Chunked,
    /// No length, no chunking. The connection closes to mark the end.
    Close,
}

/// Result of one production step.
pub(crate) enum Produced {
    /// Bytes were appended (or a step made progress), call again.
    Emitted,
    /// Body complete, including any trailing framing.
    End,
}

/// Read buffer for pulling from body sources.
const SOURCE_READ_SIZE: usize = 8_192;

/// Serializer state machine for one response body.
///
/// Emits framed bytes into the connection's outgoing queue. The caller
/// decides how much to buffer before draining; every source read and
/// every append is one `poll_produce` step.
pub(crate) enum BodyWriter {
    /// Finite buffer (or nothing): one append and done.
    Inline(Option<Vec<u8>>),
    /// Opaque source, framing as stamped.
    Stream { source: ByteSource, mode: FramingMode },
    /// Window of a seekable source.
    ByteRange {
        source: Box<dyn RangeSource>,
        state: RangeState,
    },
    /// Several windows, multipart/byteranges serialization.
    MultiPart {
        source: Box<dyn RangeSource>,
        ranges: VecDeque<ByteRange>,
        complete_len: u64,
        content_type: String,
        boundary: String,
        state: RangeState,
    },
    /// Lazy chunk sequence under chunked framing (HTTP/1.1).
    ChunkedIter { stream: ChunkStream },
    /// Lazy chunk sequence, close-delimited (HTTP/1.0).
    Iter { stream: ChunkStream },
}

#[derive(Debug)]
pub(crate) enum RangeState {
    Seek(ByteRange),
    Reading { remain: u64 },
    /// Between multipart parts: the part's closing CRLF was written.
    NextPart,
}

impl BodyWriter {
    /// Shape × framing compatibility, checkable before anything is
    /// pushed downstream. `dispatch` re-applies the same rules.
    pub fn validate(body: &Body, version: http::Version, mode: FramingMode) -> Result<(), Error> {
        match body {
            Body::Buffer(_) if mode != FramingMode::Identity => Err(Error::InvalidBody(
                "buffer body requires identity framing".into(),
            )),
            Body::ByteRange { .. } | Body::MultiPartByteRange { .. }
                if mode == FramingMode::Chunked =>
            {
                Err(Error::InvalidBody("range body cannot be chunked".into()))
            }
            Body::Iterator(_) => {
                if version >= http::Version::HTTP_11 {
                    if mode != FramingMode::Chunked {
                        return Err(Error::InvalidBody(
                            "iterator body requires chunked framing on 1.1".into(),
                        ));
                    }
                } else if mode != FramingMode::Close {
                    return Err(Error::InvalidBody(
                        "iterator body requires close delimiting on 1.0".into(),
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Total dispatch on body shape × negotiated framing.
    pub fn dispatch(body: Body, version: http::Version, mode: FramingMode) -> Result<BodyWriter, Error> {
        let w = match body {
            Body::Empty => BodyWriter::Inline(None),

            Body::Buffer(b) => {
                if mode != FramingMode::Identity {
                    return Err(Error::InvalidBody(
                        "buffer body requires identity framing".into(),
                    ));
                }
                BodyWriter::Inline(Some(b))
            }

            Body::Stream(source) => BodyWriter::Stream { source, mode },

            Body::ByteRange { source, range } => {
                if mode == FramingMode::Chunked {
                    return Err(Error::InvalidBody(
                        "byte range body cannot be chunked".into(),
                    ));
                }
                BodyWriter::ByteRange {
                    source,
                    state: RangeState::Seek(range),
                }
            }

            Body::MultiPartByteRange {
                source,
                ranges,
                complete_len,
                content_type,
                boundary,
            } => {
                if mode == FramingMode::Chunked {
                    return Err(Error::InvalidBody(
                        "multipart range body cannot be chunked".into(),
                    ));
                }
                BodyWriter::MultiPart {
                    source,
                    ranges: ranges.into(),
                    complete_len,
                    content_type,
                    boundary,
                    state: RangeState::NextPart,
                }
            }

            Body::Iterator(stream) => {
                if version >= http::Version::HTTP_11 {
                    if mode != FramingMode::Chunked {
                        return Err(Error::InvalidBody(
                            "iterator body requires chunked framing on 1.1".into(),
                        ));
                    }
                    BodyWriter::ChunkedIter { stream }
                } else {
                    if mode != FramingMode::Close {
                        return Err(Error::InvalidBody(
                            "iterator body requires close delimiting on 1.0".into(),
                        ));
                    }
                    BodyWriter::Iter { stream }
                }
            }
        };

        Ok(w)
    }

    /// Make one step of progress serializing the body into `out`.
    pub fn poll_produce(
        &mut self,
        cx: &mut Context<'_>,
        out: &mut OutBuf,
    ) -> Poll<Result<Produced, Error>> {
        match self {
            BodyWriter::Inline(data) => {
                if let Some(data) = data.take() {
                    out.append_vec(data);
                }
                Ok(Produced::End).into()
            }

            BodyWriter::Stream { source, mode } => {
                let mut tmp = [0_u8; SOURCE_READ_SIZE];

                let amount = ready!(Pin::new(&mut **source).poll_read(cx, &mut tmp[..]))
                    .map_err(Error::Io)?;

                if amount == 0 {
                    if *mode == FramingMode::Chunked {
                        let mut fin = vec![];
                        ChunkedEncoder::write_finish(&mut fin);
                        out.append_vec(fin);
                    }
                    return Ok(Produced::End).into();
                }

                trace!("stream body read: {}", amount);

                match mode {
                    FramingMode::Chunked => {
                        let mut framed = vec![];
                        ChunkedEncoder::write_chunk(&tmp[0..amount], &mut framed);
                        out.append_vec(framed);
                    }
                    _ => out.append(&tmp[0..amount]),
                }

                Ok(Produced::Emitted).into()
            }

            BodyWriter::ByteRange { source, state } => match state {
                RangeState::Seek(range) => {
                    let range = *range;
                    ready!(Pin::new(&mut **source).poll_seek(cx, SeekFrom::Start(range.offset)))
                        .map_err(Error::Io)?;

                    trace!("byte range seek: {}", range.offset);

                    *state = RangeState::Reading {
                        remain: range.length,
                    };
                    Ok(Produced::Emitted).into()
                }
                RangeState::Reading { remain } => {
                    if *remain == 0 {
                        return Ok(Produced::End).into();
                    }
                    let amount = ready!(poll_read_limited(cx, source.as_mut(), out, *remain))?;
                    *remain -= amount;
                    Ok(Produced::Emitted).into()
                }
                RangeState::NextPart => unreachable!("single range has no parts"),
            },

            BodyWriter::MultiPart {
                source,
                ranges,
                complete_len,
                content_type,
                boundary,
                state,
            } => match state {
                RangeState::NextPart => match ranges.pop_front() {
                    Some(range) => {
                        out.append(
                            multipart_part_head(boundary, content_type, &range, *complete_len)
                                .as_bytes(),
                        );
                        *state = RangeState::Seek(range);
                        Ok(Produced::Emitted).into()
                    }
                    None => {
                        out.append(multipart_close(boundary).as_bytes());
                        Ok(Produced::End).into()
                    }
                },
                RangeState::Seek(range) => {
                    let range = *range;
                    ready!(Pin::new(&mut **source).poll_seek(cx, SeekFrom::Start(range.offset)))
                        .map_err(Error::Io)?;

                    *state = RangeState::Reading {
                        remain: range.length,
                    };
                    Ok(Produced::Emitted).into()
                }
                RangeState::Reading { remain } => {
                    if *remain == 0 {
                        out.append(b"\r\n");
                        *state = RangeState::NextPart;
                        return Ok(Produced::Emitted).into();
                    }
                    let amount = ready!(poll_read_limited(cx, source.as_mut(), out, *remain))?;
                    *remain -= amount;
                    Ok(Produced::Emitted).into()
                }
            },

            BodyWriter::ChunkedIter { stream } => loop {
                match ready!(Pin::new(&mut **stream).poll_next(cx)) {
                    Some(Ok(chunk)) => {
                        if chunk.is_empty() {
                            // a zero length frame would read as the terminator
                            continue;
                        }
                        let mut framed = vec![];
                        ChunkedEncoder::write_chunk(&chunk, &mut framed);
                        out.append_vec(framed);
                        return Ok(Produced::Emitted).into();
                    }
                    Some(Err(e)) => return Err(Error::Io(e)).into(),
                    None => {
                        let mut fin = vec![];
                        ChunkedEncoder::write_finish(&mut fin);
                        out.append_vec(fin);
                        return Ok(Produced::End).into();
                    }
                }
            },

            BodyWriter::Iter { stream } => match ready!(Pin::new(&mut **stream).poll_next(cx)) {
                Some(Ok(chunk)) => {
                    out.append_vec(chunk);
                    Ok(Produced::Emitted).into()
                }
                Some(Err(e)) => Err(Error::Io(e)).into(),
                None => Ok(Produced::End).into(),
            },
        }
    }
}

/// Read at most `remain` bytes from the source straight into `out`.
fn poll_read_limited<S: AsyncRead + Unpin + ?Sized>(
    cx: &mut Context<'_>,
    source: &mut S,
    out: &mut OutBuf,
    remain: u64,
) -> Poll<Result<u64, Error>> {
    let mut tmp = [0_u8; SOURCE_READ_SIZE];
    let max = (remain.min(SOURCE_READ_SIZE as u64)) as usize;

    let amount = ready!(Pin::new(&mut *source).poll_read(cx, &mut tmp[0..max])).map_err(Error::Io)?;

    if amount == 0 {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "Source ended before range was complete",
        )))
        .into();
    }

    out.append(&tmp[0..amount]);
    Ok(amount as u64).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::io::Cursor;
    use futures_util::stream;
    use futures_util::task::noop_waker;

    fn drive(mut w: BodyWriter) -> Vec<u8> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut out = OutBuf::new();

        loop {
            match w.poll_produce(&mut cx, &mut out) {
                Poll::Pending => panic!("pending on in-memory source"),
                Poll::Ready(Ok(Produced::Emitted)) => continue,
                Poll::Ready(Ok(Produced::End)) => return out.pending().to_vec(),
                Poll::Ready(Err(e)) => panic!("writer failed: {}", e),
            }
        }
    }

    fn chunks(parts: &[&[u8]]) -> ChunkStream {
        let items: Vec<io::Result<Vec<u8>>> = parts.iter().map(|p| Ok(p.to_vec())).collect();
        Box::new(stream::iter(items))
    }

    #[test]
    fn inline_writes_buffer_verbatim() {
        let w = BodyWriter::dispatch(
            Body::from("hi"),
            http::Version::HTTP_11,
            FramingMode::Identity,
        )
        .unwrap();
        assert_eq!(drive(w), b"hi");
    }

    #[test]
    fn inline_empty_writes_nothing() {
        let w = BodyWriter::dispatch(Body::Empty, http::Version::HTTP_11, FramingMode::Identity)
            .unwrap();
        assert_eq!(drive(w), b"");
    }

    #[test]
    fn byte_range_writes_exact_window() {
        let mut src = vec![0_u8; 200];
        for (i, b) in src.iter_mut().enumerate() {
            *b = i as u8;
        }
        let expect = src[100..150].to_vec();

        let w = BodyWriter::dispatch(
            Body::byte_range(Cursor::new(src), 100, 50),
            http::Version::HTTP_11,
            FramingMode::Identity,
        )
        .unwrap();

        assert_eq!(drive(w), expect);
    }

    #[test]
    fn byte_range_short_source_errors() {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut out = OutBuf::new();

        let mut w = BodyWriter::dispatch(
            Body::byte_range(Cursor::new(vec![0_u8; 10]), 0, 50),
            http::Version::HTTP_11,
            FramingMode::Identity,
        )
        .unwrap();

        loop {
            match w.poll_produce(&mut cx, &mut out) {
                Poll::Ready(Ok(Produced::Emitted)) => continue,
                Poll::Ready(Err(Error::Io(e))) => {
                    assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof);
                    return;
                }
                r => panic!("expected eof error, got {:?}", r.is_ready()),
            }
        }
    }

    #[test]
    fn multipart_delimits_every_range() {
        let src: Vec<u8> = (0..100).collect();

        let w = BodyWriter::dispatch(
            Body::multipart_with_boundary(
                Cursor::new(src.clone()),
                [(0, 10), (50, 5)],
                100,
                "application/octet-stream",
                "B",
            ),
            http::Version::HTTP_11,
            FramingMode::Identity,
        )
        .unwrap();

        let mut expect = vec![];
        expect.extend_from_slice(
            b"--B\r\nContent-Type: application/octet-stream\r\nContent-Range: bytes 0-9/100\r\n\r\n",
        );
        expect.extend_from_slice(&src[0..10]);
        expect.extend_from_slice(b"\r\n");
        expect.extend_from_slice(
            b"--B\r\nContent-Type: application/octet-stream\r\nContent-Range: bytes 50-54/100\r\n\r\n",
        );
        expect.extend_from_slice(&src[50..55]);
        expect.extend_from_slice(b"\r\n--B--\r\n");

        assert_eq!(drive(w), expect);
    }

    #[test]
    fn multipart_length_stamp_matches_output() {
        let src: Vec<u8> = (0..100).collect();
        let body = Body::multipart_with_boundary(
            Cursor::new(src),
            [(0, 10), (50, 5)],
            100,
            "text/plain",
            "xYz",
        );
        let announced = match body.entity_length() {
            crate::body::EntityLength::Known(n) => n,
            other => panic!("unexpected entity length {:?}", other),
        };

        let w =
            BodyWriter::dispatch(body, http::Version::HTTP_11, FramingMode::Identity).unwrap();
        assert_eq!(drive(w).len() as u64, announced);
    }

    #[test]
    fn chunked_iterator_frames_and_terminates() {
        let w = BodyWriter::dispatch(
            Body::Iterator(chunks(&[&b"ab"[..], &b""[..], &b"cd"[..]])),
            http::Version::HTTP_11,
            FramingMode::Chunked,
        )
        .unwrap();

        // the empty chunk is elided, not emitted as a terminator
        assert_eq!(drive(w), b"2\r\nab\r\n2\r\ncd\r\n0\r\n\r\n");
    }

    #[test]
    fn iterator_on_10_is_raw() {
        let w = BodyWriter::dispatch(
            Body::Iterator(chunks(&[&b"ab"[..], &b"cd"[..]])),
            http::Version::HTTP_10,
            FramingMode::Close,
        )
        .unwrap();

        assert_eq!(drive(w), b"abcd");
    }

    #[test]
    fn stream_body_chunked_framing() {
        let w = BodyWriter::dispatch(
            Body::stream(Cursor::new(b"hello".to_vec())),
            http::Version::HTTP_11,
            FramingMode::Chunked,
        )
        .unwrap();

        assert_eq!(drive(w), b"5\r\nhello\r\n0\r\n\r\n");
    }

    #[test]
    fn mismatched_shapes_are_invalid() {
        let r = BodyWriter::dispatch(
            Body::from("x"),
            http::Version::HTTP_11,
            FramingMode::Chunked,
        );
        assert!(matches!(r, Err(Error::InvalidBody(_))));

        let r = BodyWriter::dispatch(
            Body::Iterator(chunks(&[&b"x"[..]])),
            http::Version::HTTP_11,
            FramingMode::Identity,
        );
        assert!(matches!(r, Err(Error::InvalidBody(_))));
    }
}
