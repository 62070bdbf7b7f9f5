use crate::headers::HeaderTable;
use crate::AsyncRead;
use crate::Error;
use futures_util::ready;
use std::io;
use std::io::Write;
use std::pin::Pin;
use std::task::{Context, Poll};

// Request headers today vary in size from ~200 bytes to over 2KB.
// As applications use more cookies and user agents expand features,
// typical header sizes of 700-800 bytes is common.
// http://dev.chromium.org/spdy/spdy-whitepaper

/// Render a response head from the pseudo-header-stripped table.
///
/// The pseudo-headers must already have been consumed by the codec;
/// whatever still starts with `:` is skipped here.
#[allow(clippy::write_with_newline)]
pub(crate) fn render_head(
    version: http::Version,
    status: u16,
    reason: Option<&str>,
    headers: &HeaderTable,
) -> Result<Vec<u8>, Error> {
    let mut w = Vec::with_capacity(256);

    let ver = match version {
        http::Version::HTTP_10 => "1.0",
        http::Version::HTTP_11 => "1.1",
        _ => {
            return Err(Error::Http11Parser(httparse::Error::Version));
        }
    };

    let reason = match reason {
        Some(r) => r,
        None => http::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Unknown"),
    };

    write!(w, "HTTP/{} {} {}\r\n", ver, status, reason)?;

    for (name, value) in headers.iter() {
        if name.starts_with(':') {
            continue;
        }
        write!(w, "{}: {}\r\n", name, value)?;
    }
    write!(w, "\r\n")?;

    debug!("render_head: {:?}", String::from_utf8_lossy(&w));

    Ok(w)
}

/// Attempt to parse an http/1.x request.
pub(crate) fn try_parse_req(buf: &[u8]) -> Result<Option<(http::Request<()>, usize)>, io::Error> {
    trace!("try_parse_req: {:?}", String::from_utf8_lossy(buf));

    let mut headers = [httparse::EMPTY_HEADER; 128];
    let mut parser = httparse::Request::new(&mut headers);

    let status = parser
        .parse(buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    if status.is_partial() {
        return Ok(None);
    }

    let mut uri = http::Uri::builder();

    if let Some(path) = parser.path {
        uri = uri.path_and_query(path);
    }

    let mut bld = http::Request::builder().version(if parser.version == Some(1) {
        http::Version::HTTP_11
    } else {
        http::Version::HTTP_10
    });

    let uri = uri
        .build()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    bld = bld.uri(uri);

    if let Some(method) = parser.method {
        bld = bld.method(method);
    }

    for head in parser.headers.iter() {
        let name = http::header::HeaderName::from_bytes(head.name.as_bytes());
        let value = http::header::HeaderValue::from_bytes(head.value);
        match (name, value) {
            (Ok(name), Ok(value)) => bld = bld.header(name, value),
            (Err(e), _) => {
                debug!("Dropping bad header name: {}", e);
            }
            (Ok(name), Err(e)) => {
                debug!("Dropping bad header value ({}): {}", name, e);
            }
        }
    }

    let built = bld
        .body(())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let len = status.unwrap();

    debug!("try_parse_req success: {:?}", built);

    Ok(Some((built, len)))
}

/// Helper to poll for a complete request head.
///
/// It looks out for \r\n\r\n, which indicates the end of the headers and body begins.
pub(crate) fn poll_for_crlfcrlf<S>(
    cx: &mut Context<'_>,
    buf: &mut Vec<u8>,
    io: &mut S,
) -> Poll<io::Result<()>>
where
    S: AsyncRead + Unpin,
{
    const END_OF_HEADER: &[u8] = &[b'\r', b'\n', b'\r', b'\n'];
    let mut end_index = 0;
    let mut buf_index = 0;
    let mut one = [0_u8; 1];

    // fix so end_index is where it needs to be
    loop {
        if buf_index == buf.len() {
            break;
        }
        if buf[buf_index] == END_OF_HEADER[end_index] {
            end_index += 1;
        } else if end_index > 0 {
            end_index = 0;
        }
        buf_index += 1;
    }

    loop {
        if buf_index == buf.len() {
            // read one more char
            let amount = ready!(Pin::new(&mut *io).poll_read(cx, &mut one[..]))?;
            if amount == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF before complete http11 header",
                ))
                .into();
            }
            buf.push(one[0]);
        }

        if buf[buf_index] == END_OF_HEADER[end_index] {
            end_index += 1;
        } else if end_index > 0 {
            end_index = 0;
        }

        if end_index == END_OF_HEADER.len() {
            // we found the end of header sequence
            break;
        }
        buf_index += 1;
    }

    Ok(()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_minimal_head() {
        let mut t = HeaderTable::new();
        t.set("content-length", "2");
        t.set(":status", "200"); // pseudo, must not serialize

        let head = render_head(http::Version::HTTP_11, 200, None, &t).unwrap();

        assert_eq!(
            String::from_utf8(head).unwrap(),
            "HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\n"
        );
    }

    #[test]
    fn render_custom_reason() {
        let t = HeaderTable::new();
        let head = render_head(http::Version::HTTP_10, 299, Some("Because"), &t).unwrap();

        assert_eq!(
            String::from_utf8(head).unwrap(),
            "HTTP/1.0 299 Because\r\n\r\n"
        );
    }

    #[test]
    fn parse_simple_request() {
        let (req, used) =
            try_parse_req(b"GET /path?q=1 HTTP/1.1\r\nhost: x\r\n\r\n")
                .unwrap()
                .unwrap();

        assert_eq!(used, 35);
        assert_eq!(req.method(), http::Method::GET);
        assert_eq!(req.uri().path(), "/path");
        assert_eq!(req.version(), http::Version::HTTP_11);
        assert_eq!(req.headers().get("host").unwrap(), "x");
    }
}
