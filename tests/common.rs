#![allow(dead_code)]

use async_std::net::{TcpListener, TcpStream};
use futures_io::AsyncRead;
use futures_util::io::AsyncReadExt;
use hsrv_h1::server::{self, ResponseHandle};
use hsrv_h1::Error;
use std::future::Future;
use std::io;
use std::sync::Once;

pub fn setup_logger() {
    static START: Once = Once::new();
    START.call_once(|| {
        let test_log = std::env::var("TEST_LOG")
            .map(|x| x != "0" && x.to_lowercase() != "false")
            .unwrap_or(false);
        let level = if test_log {
            log::LevelFilter::Trace
        } else {
            log::LevelFilter::Info
        };
        pretty_env_logger::formatted_builder()
            .filter_level(log::LevelFilter::Warn)
            .filter_module("hsrv_h1", level)
            .target(env_logger::Target::Stdout)
            .init();
    });
}

/// Client side of a test server.
pub struct Connector(pub String);

impl Connector {
    pub async fn connect(&self) -> Result<TcpStream, Error> {
        Ok(TcpStream::connect(&self.0).await?)
    }
}

/// Run a server handling each request with `f`.
///
/// `f` gets the request head, the fully read body, the response handle
/// and the request index on its connection. Returning Ok(true) keeps
/// the connection loop accepting.
pub async fn run_server<F, R>(f: F) -> Result<Connector, Error>
where
    F: Fn(http::request::Parts, Option<Vec<u8>>, ResponseHandle, usize) -> R
        + Send
        + Sync
        + 'static,
    R: Future<Output = Result<bool, Error>> + Send + 'static,
{
    setup_logger();

    let l = TcpListener::bind("127.0.0.1:0").await?;
    let port = l.local_addr()?.port();

    async_std::task::spawn(async move {
        loop {
            let (tcp, _) = match l.accept().await {
                Ok(v) => v,
                Err(_) => break,
            };

            let mut conn = server::handshake(tcp);

            let mut index = 0;
            while let Some(req) = conn.accept().await {
                let (req, respond) = match req {
                    Ok(v) => v,
                    Err(_) => break,
                };

                let (parts, mut body) = req.into_parts();

                let mut v = vec![];
                body.read_to_end(&mut v).await.expect("read request body");

                let cont = f(parts, Some(v), respond, index).await;
                index += 1;

                match cont {
                    Ok(true) => continue,
                    _ => break,
                }
            }
        }
    });

    Ok(Connector(format!("127.0.0.1:{}", port)))
}

/// Read a response head off the socket, byte by byte.
pub async fn read_header<S: AsyncRead + Unpin>(io: &mut S) -> Result<String, Error> {
    let mut buf = vec![];
    let mut one = [0_u8; 1];

    loop {
        let amount = io.read(&mut one[..]).await?;
        if amount == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF before complete header",
            )
            .into());
        }
        buf.push(one[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
    }

    Ok(String::from_utf8(buf).unwrap())
}

/// Read and de-frame a chunked body up to and including the terminator.
pub async fn read_chunked<S: AsyncRead + Unpin>(io: &mut S) -> Result<Vec<u8>, Error> {
    let mut out = vec![];

    loop {
        let line = read_line(io).await?;
        let len = usize::from_str_radix(line.trim(), 16)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad chunk size"))?;

        if len == 0 {
            // final CRLF
            let end = read_line(io).await?;
            assert_eq!(end, "");
            return Ok(out);
        }

        let mut chunk = vec![0_u8; len];
        io.read_exact(&mut chunk).await?;
        out.extend_from_slice(&chunk);

        let sep = read_line(io).await?;
        assert_eq!(sep, "");
    }
}

async fn read_line<S: AsyncRead + Unpin>(io: &mut S) -> Result<String, Error> {
    let mut buf = vec![];
    let mut one = [0_u8; 1];

    loop {
        let amount = io.read(&mut one[..]).await?;
        if amount == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "EOF in line").into());
        }
        buf.push(one[0]);
        if buf.ends_with(b"\r\n") {
            buf.truncate(buf.len() - 2);
            return Ok(String::from_utf8(buf).unwrap());
        }
    }
}
