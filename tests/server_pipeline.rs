use async_std::net::TcpListener;
use futures_util::io::{AsyncReadExt, AsyncWriteExt};
use hsrv_h1::server;
use hsrv_h1::Error;

mod common;

#[async_std::test]
async fn pipelined_responses_keep_parse_order() -> Result<(), Error> {
    common::setup_logger();

    let l = TcpListener::bind("127.0.0.1:0").await?;
    let addr = format!("127.0.0.1:{}", l.local_addr()?.port());

    async_std::task::spawn(async move {
        let (tcp, _) = l.accept().await.expect("Accept incoming");

        let mut conn = server::handshake(tcp);

        let (_req1, respond1) = conn.accept().await.unwrap().unwrap();
        assert_eq!(conn.pending_request_count(), 1);

        let (_req2, respond2) = conn.accept().await.unwrap().unwrap();
        assert_eq!(conn.pending_request_count(), 2);

        // answer out of order; the connection must still write responses
        // in parse order
        let mut res2 = respond2.response();
        res2.send("second").await.unwrap();

        let mut res1 = respond1.response();
        res1.send("first!").await.unwrap();

        // keep driving until the peer goes away
        while let Some(r) = conn.accept().await {
            if r.is_err() {
                break;
            }
        }
    });

    let conn = common::Connector(addr);
    let mut tcp = conn.connect().await?;

    // both requests in one segment
    tcp.write_all(b"GET /one HTTP/1.1\r\n\r\nGET /two HTTP/1.1\r\n\r\n")
        .await?;

    let head = common::read_header(&mut tcp).await?;
    assert_eq!(head, "HTTP/1.1 200 OK\r\ncontent-length: 6\r\n\r\n");

    let mut buf = [0_u8; 6];
    tcp.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"first!");

    let head = common::read_header(&mut tcp).await?;
    assert_eq!(head, "HTTP/1.1 200 OK\r\ncontent-length: 6\r\n\r\n");

    tcp.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"second");

    Ok(())
}

#[async_std::test]
async fn pending_count_drops_as_responses_finish() -> Result<(), Error> {
    common::setup_logger();

    let l = TcpListener::bind("127.0.0.1:0").await?;
    let addr = format!("127.0.0.1:{}", l.local_addr()?.port());

    let server = async_std::task::spawn(async move {
        let (tcp, _) = l.accept().await.expect("Accept incoming");

        let mut conn = server::handshake(tcp);

        let (_req, respond) = conn.accept().await.unwrap().unwrap();
        assert_eq!(conn.pending_request_count(), 1);

        let mut res = respond.response();
        res.send("done").await.unwrap();

        // the response is fully written once the peer received it; by
        // the time accept sees EOF the slot must be gone
        while let Some(r) = conn.accept().await {
            if r.is_err() {
                break;
            }
        }

        assert_eq!(conn.pending_request_count(), 0);
    });

    let conn = common::Connector(addr);
    let mut tcp = conn.connect().await?;

    tcp.write_all(b"GET / HTTP/1.1\r\n\r\n").await?;

    let head = common::read_header(&mut tcp).await?;
    assert_eq!(head, "HTTP/1.1 200 OK\r\ncontent-length: 4\r\n\r\n");

    let mut buf = [0_u8; 4];
    tcp.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"done");

    drop(tcp);
    server.await;

    Ok(())
}

#[async_std::test]
async fn queue_bound_applies_backpressure() -> Result<(), Error> {
    common::setup_logger();

    let l = TcpListener::bind("127.0.0.1:0").await?;
    let addr = format!("127.0.0.1:{}", l.local_addr()?.port());

    async_std::task::spawn(async move {
        let (tcp, _) = l.accept().await.expect("Accept incoming");

        let cfg = server::ServerConfig {
            max_pending: 2,
            ..Default::default()
        };
        let mut conn = server::handshake_with(tcp, cfg);

        let mut handles = vec![];

        // two parse ahead, the third stays unread until a slot frees up
        let (_r1, h1) = conn.accept().await.unwrap().unwrap();
        let (_r2, h2) = conn.accept().await.unwrap().unwrap();
        handles.push(h1);
        handles.push(h2);

        assert_eq!(conn.pending_request_count(), 2);

        for (i, h) in handles.drain(..).enumerate() {
            let mut res = h.response();
            res.send(format!("res {}", i)).await.unwrap();
        }

        // now the third head gets parsed
        let (_r3, h3) = conn.accept().await.unwrap().unwrap();
        let mut res = h3.response();
        res.send("res 2").await.unwrap();

        while let Some(r) = conn.accept().await {
            if r.is_err() {
                break;
            }
        }
    });

    let conn = common::Connector(addr);
    let mut tcp = conn.connect().await?;

    tcp.write_all(
        b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\nGET /c HTTP/1.1\r\n\r\n",
    )
    .await?;

    for i in 0..3 {
        let head = common::read_header(&mut tcp).await?;
        assert_eq!(head, "HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\n");

        let mut buf = [0_u8; 5];
        tcp.read_exact(&mut buf).await?;
        assert_eq!(buf, format!("res {}", i).as_bytes());
    }

    Ok(())
}
