use async_std::net::{TcpListener, TcpStream};
use hsrv_h1::server::Connection;
use hsrv_h1::Error;

#[async_std::main]
async fn main() -> Result<(), Error> {
    let listener = TcpListener::bind("127.0.0.1:3000").await?;

    println!("Listening to {:?}", listener.local_addr().unwrap());
    listen(&listener).await;

    Ok(())
}

async fn listen(listener: &TcpListener) {
    loop {
        let (tcp, _) = listener.accept().await.expect("Accept incoming");

        let conn = hsrv_h1::server::handshake(tcp);

        let task = async move {
            handle_conn(conn).await.ok();
        };

        async_std::task::spawn(task);
    }
}

async fn handle_conn(mut conn: Connection<TcpStream>) -> Result<(), Error> {
    while let Some(x) = conn.accept().await {
        let (_, respond) = x?;

        let mut res = respond.response();

        res.set_header("content-type", "text/plain")?;
        res.send("Hello world!\n").await?;
    }

    Ok(())
}
