use crate::AsyncRead;
use futures_util::ready;
use std::io;
use std::io::Write;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Encoder for `transfer-encoding: chunked`.
///
/// Frames are `<lower-hex len>\r\n<data>\r\n` with the terminator
/// `0\r\n\r\n`. Empty chunks are elided since a zero length frame would
/// be read as the terminator.
pub(crate) struct ChunkedEncoder;

impl ChunkedEncoder {
    pub fn write_chunk(data: &[u8], out: &mut Vec<u8>) {
        if data.is_empty() {
            return;
        }

        write!(out, "{:x}\r\n", data.len()).expect("write to vec");
        out.extend_from_slice(data);
        out.extend_from_slice(b"\r\n");
    }

    pub fn write_finish(out: &mut Vec<u8>) {
        out.extend_from_slice(b"0\r\n\r\n");
    }
}

/// Incremental decoder for chunked request bodies.
///
/// Size lines and CRLF separators are consumed byte by byte, chunk data
/// is read straight into the caller's buffer. Trailer fields are not
/// supported, the zero chunk must be followed directly by CRLF.
pub(crate) struct ChunkedDecoder {
    state: State,
}

enum State {
    /// Reading the hex size line, possibly with a `;ext` suffix to skip.
    Size {
        acc: u64,
        seen_digit: bool,
        in_ext: bool,
        cr: bool,
    },
    /// Reading chunk data.
    Data { remain: u64 },
    /// Reading the CRLF that terminates a data chunk.
    DataCrlf { cr: bool },
    /// Got the zero chunk, reading the final CRLF.
    FinalCrlf { cr: bool },
    Done,
}

impl State {
    fn size() -> Self {
        State::Size {
            acc: 0,
            seen_digit: false,
            in_ext: false,
            cr: false,
        }
    }
}

fn bad(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        ChunkedDecoder {
            state: State::size(),
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self.state, State::Done)
    }

    fn poll_one_byte<R: AsyncRead + Unpin>(
        cx: &mut Context,
        recv: &mut R,
        when_eof: &str,
    ) -> Poll<io::Result<u8>> {
        let mut one = [0_u8; 1];

        let amount = ready!(Pin::new(&mut *recv).poll_read(cx, &mut one[..]))?;
        if amount == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                when_eof.to_string(),
            ))
            .into();
        }

        Ok(one[0]).into()
    }

    pub fn poll_read<R: AsyncRead + Unpin>(
        &mut self,
        cx: &mut Context,
        recv: &mut R,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        assert!(!buf.is_empty(), "poll_read with len 0 buf");

        loop {
            match &mut self.state {
                State::Done => {
                    return Ok(0).into();
                }

                State::Size {
                    acc,
                    seen_digit,
                    in_ext,
                    cr,
                } => {
                    let c = ready!(Self::poll_one_byte(cx, recv, "EOF in chunk size"))?;

                    if *cr {
                        if c != b'\n' {
                            return Err(bad("Chunk size not terminated by CRLF")).into();
                        }
                        if !*seen_digit {
                            return Err(bad("Chunk size missing")).into();
                        }

                        trace!("chunk size: {}", acc);

                        self.state = if *acc == 0 {
                            State::FinalCrlf { cr: false }
                        } else {
                            State::Data { remain: *acc }
                        };
                        continue;
                    }

                    match c {
                        b'\r' => *cr = true,
                        _ if *in_ext => {
                            // skip chunk extension until CR
                        }
                        b';' => *in_ext = true,
                        _ => {
                            let digit = match c {
                                b'0'..=b'9' => (c - b'0') as u64,
                                b'a'..=b'f' => (c - b'a' + 10) as u64,
                                b'A'..=b'F' => (c - b'A' + 10) as u64,
                                _ => return Err(bad("Bad char in chunk size")).into(),
                            };
                            if *acc > u64::MAX / 16 {
                                return Err(bad("Chunk size overflow")).into();
                            }
                            *acc = *acc * 16 + digit;
                            *seen_digit = true;
                        }
                    }
                }

                State::Data { remain } => {
                    let max = buf.len().min((*remain).min(usize::MAX as u64) as usize);

                    let amount = ready!(Pin::new(&mut *recv).poll_read(cx, &mut buf[0..max]))?;
                    if amount == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "EOF in chunk data",
                        ))
                        .into();
                    }

                    *remain -= amount as u64;
                    if *remain == 0 {
                        self.state = State::DataCrlf { cr: false };
                    }

                    return Ok(amount).into();
                }

                State::DataCrlf { cr } => {
                    let c = ready!(Self::poll_one_byte(cx, recv, "EOF after chunk data"))?;

                    if !*cr {
                        if c != b'\r' {
                            return Err(bad("Chunk data not terminated by CRLF")).into();
                        }
                        *cr = true;
                    } else {
                        if c != b'\n' {
                            return Err(bad("Chunk data not terminated by CRLF")).into();
                        }
                        self.state = State::size();
                    }
                }

                State::FinalCrlf { cr } => {
                    let c = ready!(Self::poll_one_byte(cx, recv, "EOF in chunk terminator"))?;

                    if !*cr {
                        if c != b'\r' {
                            return Err(bad("Chunk terminator not CRLF")).into();
                        }
                        *cr = true;
                    } else {
                        if c != b'\n' {
                            return Err(bad("Chunk terminator not CRLF")).into();
                        }
                        self.state = State::Done;
                        return Ok(0).into();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::io::Cursor;
    use futures_util::task::noop_waker;

    fn drive_decode(wire: &[u8]) -> io::Result<Vec<u8>> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut recv = Cursor::new(wire.to_vec());
        let mut dec = ChunkedDecoder::new();
        let mut out = vec![];
        let mut buf = [0_u8; 7]; // deliberately small and odd

        loop {
            match dec.poll_read(&mut cx, &mut recv, &mut buf) {
                Poll::Pending => panic!("pending on in-memory cursor"),
                Poll::Ready(Ok(0)) => return Ok(out),
                Poll::Ready(Ok(n)) => out.extend_from_slice(&buf[0..n]),
                Poll::Ready(Err(e)) => return Err(e),
            }
        }
    }

    #[test]
    fn encode_chunks_and_finish() {
        let mut out = vec![];
        ChunkedEncoder::write_chunk(b"ab", &mut out);
        ChunkedEncoder::write_chunk(b"", &mut out); // elided
        ChunkedEncoder::write_chunk(b"cd", &mut out);
        ChunkedEncoder::write_finish(&mut out);

        assert_eq!(&out, b"2\r\nab\r\n2\r\ncd\r\n0\r\n\r\n");
    }

    #[test]
    fn encode_hex_lengths() {
        let mut out = vec![];
        ChunkedEncoder::write_chunk(&[b'x'; 26], &mut out);

        assert!(out.starts_with(b"1a\r\n"));
    }

    #[test]
    fn decode_roundtrip() {
        let body = drive_decode(b"3\r\nOK\n\r\n1a\r\nabcdefghijklmnopqrstuvwxyz\r\n0\r\n\r\n")
            .unwrap();
        assert_eq!(&body, b"OK\nabcdefghijklmnopqrstuvwxyz");
    }

    #[test]
    fn decode_skips_extension() {
        let body = drive_decode(b"2;name=val\r\nhi\r\n0\r\n\r\n").unwrap();
        assert_eq!(&body, b"hi");
    }

    #[test]
    fn decode_rejects_garbage_size() {
        assert!(drive_decode(b"zz\r\nhi\r\n0\r\n\r\n").is_err());
    }

    #[test]
    fn decode_is_end() {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut recv = Cursor::new(b"0\r\n\r\n".to_vec());
        let mut dec = ChunkedDecoder::new();
        let mut buf = [0_u8; 8];

        assert!(!dec.is_end());
        match dec.poll_read(&mut cx, &mut recv, &mut buf) {
            Poll::Ready(Ok(0)) => {}
            r => panic!("unexpected: {:?}", r.map(|x| x.map(|_| ()))),
        }
        assert!(dec.is_end());
    }
}
