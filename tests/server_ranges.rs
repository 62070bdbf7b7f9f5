use futures_util::io::{AsyncReadExt, AsyncWriteExt, Cursor};
use futures_util::stream;
use hsrv_h1::{Body, Error};
use std::io;

mod common;

#[async_std::test]
async fn server_byte_range_body() -> Result<(), Error> {
    let conn = common::run_server(|_parts, _body, respond, _| async move {
        let mut src = vec![0_u8; 200];
        for (i, b) in src.iter_mut().enumerate() {
            *b = i as u8;
        }

        let mut res = respond.response();
        res.send(Body::byte_range(Cursor::new(src), 100, 50))
            .await
            .unwrap();

        Ok(true)
    })
    .await?;

    let mut tcp = conn.connect().await?;

    tcp.write_all(b"GET /blob HTTP/1.1\r\n\r\n").await?;

    let head = common::read_header(&mut tcp).await?;
    assert_eq!(head, "HTTP/1.1 200 OK\r\ncontent-length: 50\r\n\r\n");

    let mut buf = [0_u8; 50];
    tcp.read_exact(&mut buf).await?;

    let expect: Vec<u8> = (100..150).map(|i| i as u8).collect();
    assert_eq!(&buf[..], &expect[..]);

    Ok(())
}

#[async_std::test]
async fn server_multipart_byte_range_body() -> Result<(), Error> {
    let conn = common::run_server(|_parts, _body, respond, _| async move {
        let src: Vec<u8> = (0..100).collect();

        let mut res = respond.response();
        res.send(Body::multipart_with_boundary(
            Cursor::new(src),
            [(0, 10), (50, 5)],
            100,
            "application/octet-stream",
            "B",
        ))
        .await
        .unwrap();

        Ok(true)
    })
    .await?;

    let mut tcp = conn.connect().await?;

    tcp.write_all(b"GET /blob HTTP/1.1\r\n\r\n").await?;

    let src: Vec<u8> = (0..100).collect();
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

    let head = common::read_header(&mut tcp).await?;
    assert_eq!(
        head,
        format!(
            "HTTP/1.1 200 OK\r\ncontent-type: multipart/byteranges; boundary=B\r\ncontent-length: {}\r\n\r\n",
            expect.len()
        )
    );

    let mut buf = vec![0_u8; expect.len()];
    tcp.read_exact(&mut buf).await?;
    assert_eq!(buf, expect);

    Ok(())
}

#[async_std::test]
async fn server_iterator_body_chunked_on_11() -> Result<(), Error> {
    let conn = common::run_server(|_parts, _body, respond, _| async move {
        let parts: Vec<io::Result<Vec<u8>>> = vec![
            Ok(b"ab".to_vec()),
            Ok(vec![]), // elided on the wire
            Ok(b"cd".to_vec()),
        ];

        let mut res = respond.response();
        res.send(Body::iterator(stream::iter(parts))).await.unwrap();

        Ok(true)
    })
    .await?;

    let mut tcp = conn.connect().await?;

    tcp.write_all(b"GET / HTTP/1.1\r\n\r\n").await?;

    let head = common::read_header(&mut tcp).await?;
    assert_eq!(head, "HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n");

    let mut buf = [0_u8; 19];
    tcp.read_exact(&mut buf).await?;
    assert_eq!(&buf[..], b"2\r\nab\r\n2\r\ncd\r\n0\r\n\r\n");

    Ok(())
}

#[async_std::test]
async fn server_iterator_body_raw_on_10() -> Result<(), Error> {
    let conn = common::run_server(|_parts, _body, respond, _| async move {
        let parts: Vec<io::Result<Vec<u8>>> =
            vec![Ok(b"ab".to_vec()), Ok(b"cd".to_vec())];

        let mut res = respond.response();
        res.send(Body::iterator(stream::iter(parts))).await.unwrap();

        Ok(true)
    })
    .await?;

    let mut tcp = conn.connect().await?;

    tcp.write_all(b"GET / HTTP/1.0\r\n\r\n").await?;

    let head = common::read_header(&mut tcp).await?;
    assert_eq!(head, "HTTP/1.0 200 OK\r\nconnection: close\r\n\r\n");

    let mut body = vec![];
    tcp.read_to_end(&mut body).await?;
    assert_eq!(&body, b"abcd");

    Ok(())
}

#[async_std::test]
async fn server_stream_body_handoff() -> Result<(), Error> {
    let conn = common::run_server(|_parts, _body, respond, _| async move {
        let mut res = respond.response();
        res.send(Body::stream(Cursor::new(b"streamed bytes".to_vec())))
            .await
            .unwrap();

        Ok(true)
    })
    .await?;

    let mut tcp = conn.connect().await?;

    tcp.write_all(b"GET / HTTP/1.1\r\n\r\n").await?;

    let head = common::read_header(&mut tcp).await?;
    assert_eq!(head, "HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n");

    let body = common::read_chunked(&mut tcp).await?;
    assert_eq!(&body, b"streamed bytes");

    Ok(())
}
