//! Server implementation of the HTTP/1.x protocol.
//!
//! # Example
//!
//! ```rust, no_run
//! use hsrv_h1::server;
//! use std::error::Error;
//! use async_std::net::TcpListener;
//!
//! #[async_std::main]
//! async fn main() -> Result<(), Box<dyn Error>> {
//!     let listener = TcpListener::bind("127.0.0.1:3000").await?;
//!
//!     // Accept all incoming TCP connections.
//!     loop {
//!         if let Ok((socket, _peer_addr)) = listener.accept().await {
//!
//!             // Spawn a new task to process each connection individually
//!             async_std::task::spawn(async move {
//!                 let mut conn = server::handshake(socket);
//!
//!                 // Handle incoming requests from this socket, one by one.
//!                 while let Some(request) = conn.accept().await {
//!                     let (req, respond) = request.unwrap();
//!
//!                     println!("Received request: {:?}", req);
//!
//!                     let mut res = respond.response();
//!
//!                     res.set_header("content-type", "text/plain").unwrap();
//!                     res.send("Hello world!\n").await.unwrap();
//!                 }
//!             });
//!         }
//!     }
//! }
//! ```

use crate::codec::{Pipeline, PipelineConfig, WriteOp};
use crate::fast_buf::FastBuf;
use crate::headers::HeaderTable;
use crate::http11::{poll_for_crlfcrlf, render_head, try_parse_req};
use crate::limit::{allow_reuse, get_str, LimitRead};
use crate::mpsc;
use crate::response::Response;
use crate::share::RecvStream;
use crate::try_write::OutBuf;
use crate::writer::{BodyWriter, FramingMode, Produced};
use crate::Error;
use crate::{AsyncRead, AsyncWrite};
use futures_channel::oneshot;
use futures_util::future::poll_fn;
use futures_util::ready;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

/// Size of buffer reading request body into.
const READ_BUF_INIT_SIZE: usize = 16_384;

/// How many framed body bytes to queue before waiting for the socket
/// to drain. Body writers stop producing above this.
const WRITE_BUF_TARGET: usize = 16_384;

/// Bound of the codec tail channel, per response.
const OP_CHANNEL_BOUND: usize = 4;

/// Tuning knobs for one connection.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum parsed-but-unanswered requests queued up by pipelining.
    /// The parser stops reading further heads once this is reached.
    pub max_pending: usize,
    /// Smallest known entity length worth gzip compressing.
    pub compress_min_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            max_pending: 5,
            compress_min_len: 1024,
        }
    }
}

/// "handshake" to create a connection with default config.
///
/// See [module level doc](index.html) for an example.
pub fn handshake<S>(io: S) -> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    handshake_with(io, ServerConfig::default())
}

/// "handshake" to create a connection.
pub fn handshake_with<S>(io: S, cfg: ServerConfig) -> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    Connection(Arc::new(Mutex::new(Codec::new(io, cfg))), PhantomData)
}

/// Server connection for accepting incoming requests.
///
/// See [module level doc](index.html) for an example.
//
// NB: The PhantomData here is to keep Connection generic over <S>, which
// gives us a future option to make a better impl that doesn't hide the IO
// behind a Box<dyn trait>.
pub struct Connection<S>(Arc<Mutex<Codec>>, PhantomData<S>);

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_accept(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<(http::Request<RecvStream>, ResponseHandle), Error>>> {
        let this = self.get_mut();

        let inner = this.0.clone();

        let mut lock = this.0.lock().unwrap();

        lock.poll_drive(cx, true, inner)
    }

    /// Accept a new incoming request to handle. One must accept new requests continuously
    /// to "drive" the connection forward, also for the already accepted requests.
    pub async fn accept(
        &mut self,
    ) -> Option<Result<(http::Request<RecvStream>, ResponseHandle), Error>> {
        poll_fn(|cx| Pin::new(&mut *self).poll_accept(cx)).await
    }

    /// Parsed requests whose responses have not finished yet.
    pub fn pending_request_count(&self) -> usize {
        let lock = self.0.lock().unwrap();
        lock.pending_request_count()
    }

    /// Wait until the connection has sent/flushed all data and is ok to drop.
    pub async fn close(mut self) {
        poll_fn(|cx| Pin::new(&mut self).poll_close(cx)).await;
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let inner = self.0.clone();

        let mut codec = self.0.lock().unwrap();

        // It doesn't matter what the return value is, we just need it to not be pending.
        ready!(codec.poll_drive(cx, true, inner.clone()));

        ().into()
    }
}

/// Handle to build and send the response for a single request.
pub struct ResponseHandle {
    cfg: PipelineConfig,
    tx: mpsc::Sender<WriteOp>,
    drive: Arc<dyn DriveExternal + Send + Sync>,
}

impl ResponseHandle {
    /// The response bound to this request's slot on the connection.
    ///
    /// Dropping the handle (or the response) without ending it makes the
    /// connection substitute a 500 for this slot.
    pub fn response(self) -> Response {
        let pipeline = Pipeline::new(self.cfg, self.tx, Some(self.drive));
        Response::new(pipeline)
    }
}

impl fmt::Debug for ResponseHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ResponseHandle")
    }
}

/// Makes progress on the connection from tasks other than the one
/// polling `accept` (response pushes, request body reads).
pub(crate) trait DriveExternal {
    fn poll_drive_external(&self, cx: &mut Context<'_>) -> Result<(), io::Error>;
}

pub(crate) struct DriveHandle(Arc<Mutex<Codec>>);

impl DriveExternal for DriveHandle {
    fn poll_drive_external(&self, cx: &mut Context<'_>) -> Result<(), io::Error> {
        let inner = self.0.clone();

        let mut lock = self.0.lock().unwrap();

        match lock.poll_drive(cx, false, inner) {
            Poll::Pending => {
                // this is ok, we have made max progress.
                Ok(())
            }

            Poll::Ready(Some(Err(e))) => Err(into_io(e)),

            Poll::Ready(Some(Ok(_))) => {
                // invariant: we must not receive the next request here.
                unreachable!("Got next request in poll_drive_external")
            }

            Poll::Ready(None) => Ok(()),
        }
    }
}

fn into_io(e: Error) -> io::Error {
    match e {
        Error::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

pub(crate) struct Codec {
    io: Box<dyn Io>,
    cfg: ServerConfig,
    state: State,
    // bytes framed for the wire, drained opportunistically
    out: OutBuf,
    // buffer to receive the next request head into
    read_buf: Vec<u8>,
    // scratch for request body reads, sized without zeroing
    body_buf: FastBuf,
    // responses in parse order; only the front one is being written
    queue: VecDeque<Slot>,
    // flush acks to fire once `out` has fully reached the socket
    flush_acks: Vec<oneshot::Sender<()>>,
    // no further requests are read (connection: close, close-delimited
    // framing, or read EOF); queued responses still get written
    closing: bool,
    // a fatal io error tore the connection down
    dead: bool,
}

enum State {
    /// Waiting for the next request head.
    Waiting,
    /// A complete head is in read_buf.
    RecvReq,
    /// Deliver the request body into the body channel.
    RecvBody {
        limit: LimitRead,
        tx_body: Option<mpsc::Sender<io::Result<Vec<u8>>>>,
        /// Chunk read but not yet accepted by the channel.
        pending_chunk: Option<Vec<u8>>,
    },
    /// No more requests on this connection.
    Closed,
}

/// One parsed request's response slot.
struct Slot {
    rx: mpsc::Receiver<WriteOp>,
    state: SlotState,
    version: http::Version,
    reusable: bool,
}

enum SlotState {
    /// Waiting for the handler to produce the header block.
    AwaitHead,
    /// Receiving data/flush ops under the stamped framing.
    Streaming { mode: FramingMode },
    /// Driving a dispatched body writer.
    Body { writer: BodyWriter },
    Done,
}

enum ReadProgress {
    /// A parsed request to hand out of the poll loop.
    Package(Box<(http::Request<RecvStream>, ResponseHandle)>),
    Progress,
    NoProgress,
}

impl Codec {
    fn new<S: AsyncRead + AsyncWrite + Unpin + Send + 'static>(io: S, cfg: ServerConfig) -> Self {
        Codec {
            io: Box::new(IoAdapt(io)),
            cfg,
            state: State::Waiting,
            out: OutBuf::new(),
            read_buf: Vec::with_capacity(1024),
            body_buf: FastBuf::with_capacity(READ_BUF_INIT_SIZE),
            queue: VecDeque::new(),
            flush_acks: Vec::new(),
            closing: false,
            dead: false,
        }
    }

    fn pending_request_count(&self) -> usize {
        self.queue.len()
    }

    /// Tear everything down after a fatal error. Dropping the slot
    /// receivers is what surfaces ClientGone to handler tasks.
    fn fail(&mut self) {
        trace!("Connection failed, dropping {} pending", self.queue.len());
        self.dead = true;
        self.closing = true;
        self.state = State::Closed;
        self.queue.clear();
        self.flush_acks.clear();
    }

    pub(crate) fn poll_drive(
        &mut self,
        cx: &mut Context<'_>,
        want_next_req: bool,
        inner: Arc<Mutex<Codec>>,
    ) -> Poll<Option<Result<(http::Request<RecvStream>, ResponseHandle), Error>>> {
        if self.dead {
            return Poll::Ready(None);
        }

        loop {
            // try write any bytes ready to be sent.
            loop {
                match self.out.try_write(cx, &mut self.io) {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => {
                        self.fail();
                        return Poll::Ready(Some(Err(e.into())));
                    }
                }
            }

            if self.out.is_empty() {
                for ack in self.flush_acks.drain(..) {
                    ack.send(()).ok();
                }
            }

            let wrote = match self.drive_write(cx) {
                Ok(p) => p,
                Err(e) => {
                    self.fail();
                    return Poll::Ready(Some(Err(e)));
                }
            };

            match self.drive_read(cx, want_next_req, &inner) {
                Ok(ReadProgress::Package(p)) => {
                    return Poll::Ready(Some(Ok(*p)));
                }

                Ok(ReadProgress::Progress) => continue,

                Ok(ReadProgress::NoProgress) => {
                    if wrote {
                        continue;
                    }

                    let all_done = matches!(self.state, State::Closed)
                        && self.queue.is_empty()
                        && self.out.is_empty();
                    if all_done {
                        return Poll::Ready(None);
                    }

                    return Poll::Pending;
                }

                Err(e) => {
                    self.fail();
                    return Poll::Ready(Some(Err(e)));
                }
            }
        }
    }

    /// Progress the front response slot: consume wire ops, drive body
    /// writers, finish slots. Never touches a later slot before the
    /// front one has ended.
    fn drive_write(&mut self, cx: &mut Context<'_>) -> Result<bool, Error> {
        let mut progress = false;

        loop {
            let is_done = match self.queue.front() {
                Some(s) => matches!(s.state, SlotState::Done),
                None => break,
            };

            if is_done {
                let slot = self.queue.pop_front().expect("front slot");

                trace!("Response done, reusable: {}", slot.reusable);

                if !slot.reusable {
                    self.closing = true;
                }
                if self.closing {
                    // requests pipelined after a close never get answered
                    self.queue.clear();
                }
                self.out.flush_after();
                progress = true;
                continue;
            }

            let slot = self.queue.front_mut().expect("front slot");

            match &mut slot.state {
                SlotState::AwaitHead => match slot.rx.poll_recv(cx) {
                    Poll::Pending => break,

                    Poll::Ready(Some(WriteOp::Head { block, mode })) => {
                        trace!("head block, framing: {:?}", mode);
                        self.out.append_vec(block);
                        if mode == FramingMode::Close {
                            self.closing = true;
                        }
                        slot.state = SlotState::Streaming { mode };
                        progress = true;
                    }

                    Poll::Ready(Some(_)) => {
                        return Err(Error::Filter("Body op before header block".into()));
                    }

                    Poll::Ready(None) => {
                        // Response dropped before any output. That's a fault,
                        // but we can save the connection! :)
                        warn!("Response dropped without sending a response");
                        self.out.append_vec(synthetic_500(slot.version));
                        slot.state = SlotState::Done;
                        progress = true;
                    }
                },

                SlotState::Streaming { mode } => match slot.rx.poll_recv(cx) {
                    Poll::Pending => break,

                    Poll::Ready(Some(WriteOp::Data(d))) => {
                        self.out.append_vec(d);
                        progress = true;
                    }

                    Poll::Ready(Some(WriteOp::Flush(ack))) => {
                        self.out.flush_after();
                        if self.out.is_empty() {
                            ack.send(()).ok();
                        } else {
                            self.flush_acks.push(ack);
                        }
                        progress = true;
                    }

                    Poll::Ready(Some(WriteOp::Body(body))) => {
                        let writer = BodyWriter::dispatch(body, slot.version, *mode)?;
                        slot.state = SlotState::Body { writer };
                        progress = true;
                    }

                    Poll::Ready(Some(WriteOp::End)) => {
                        slot.state = SlotState::Done;
                        progress = true;
                    }

                    Poll::Ready(Some(WriteOp::Head { .. })) => {
                        return Err(Error::Filter("Second header block".into()));
                    }

                    Poll::Ready(None) => {
                        // Head is on the wire, nothing can be substituted.
                        warn!("Response dropped mid body");
                        return Err(Error::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "Response abandoned mid body",
                        )));
                    }
                },

                SlotState::Body { writer } => {
                    if self.out.len() >= WRITE_BUF_TARGET {
                        // wait for the socket to drain
                        break;
                    }

                    match writer.poll_produce(cx, &mut self.out) {
                        Poll::Pending => break,
                        Poll::Ready(Ok(Produced::Emitted)) => {
                            progress = true;
                        }
                        Poll::Ready(Ok(Produced::End)) => {
                            // back to the op stream for the final End; the
                            // writer wrote all framing, nothing else may
                            // produce data
                            slot.state = SlotState::Streaming {
                                mode: FramingMode::Identity,
                            };
                            progress = true;
                        }
                        Poll::Ready(Err(e)) => return Err(e),
                    }
                }

                SlotState::Done => unreachable!("done slots are popped above"),
            }
        }

        Ok(progress)
    }

    fn drive_read(
        &mut self,
        cx: &mut Context<'_>,
        want_next_req: bool,
        inner: &Arc<Mutex<Codec>>,
    ) -> Result<ReadProgress, Error> {
        match &mut self.state {
            State::Closed => Ok(ReadProgress::NoProgress),

            State::Waiting => {
                if self.closing {
                    trace!("closing, no more requests");
                    self.state = State::Closed;
                    return Ok(ReadProgress::Progress);
                }

                if !want_next_req {
                    return Ok(ReadProgress::NoProgress);
                }

                if self.queue.len() >= self.cfg.max_pending {
                    // pipeline queue full, back off the parser until the
                    // front responses finish
                    trace!("pipeline queue full: {}", self.queue.len());
                    return Ok(ReadProgress::NoProgress);
                }

                match poll_for_crlfcrlf(cx, &mut self.read_buf, &mut self.io) {
                    Poll::Pending => Ok(ReadProgress::NoProgress),
                    Poll::Ready(Err(e)) => {
                        if e.kind() == io::ErrorKind::UnexpectedEof {
                            trace!("Connection closed");
                        } else {
                            trace!("Other error when reading next: {:?}", e);
                        }
                        // finish writing what is queued, then be done
                        self.state = State::Closed;
                        Ok(ReadProgress::Progress)
                    }
                    Poll::Ready(Ok(())) => {
                        // we got a full request head in read_buf
                        self.state = State::RecvReq;
                        Ok(ReadProgress::Progress)
                    }
                }
            }

            State::RecvReq => {
                // invariant: poll_for_crlfcrlf must have read a full request.
                let (req, size) = try_parse_req(&self.read_buf)?.expect("Didn't read full request");

                // invariant: entire buffer should have been used up.
                assert_eq!(self.read_buf.len(), size);

                // reset for reuse when reading the request body.
                self.read_buf.truncate(0);

                // Limiter to read the correct body amount from the socket.
                let limit = LimitRead::from_headers(req.headers());

                let reusable = allow_reuse(req.headers(), req.version());

                // https://tools.ietf.org/html/rfc7230#page-31
                // Any response to a HEAD request ... cannot contain a
                // message body.
                let is_head = req.method() == http::Method::HEAD;

                let is_no_body = limit.is_no_body();

                let accept_gzip = get_str(req.headers(), "accept-encoding")
                    .map(|v| v.to_ascii_lowercase().contains("gzip"))
                    .unwrap_or(false);

                // bound channels to get backpressure
                let (tx_body, rx_body) = mpsc::Receiver::new(2);
                let (tx_ops, rx_ops) = mpsc::Receiver::new(OP_CHANNEL_BOUND);

                let drive: Arc<dyn DriveExternal + Send + Sync> =
                    Arc::new(DriveHandle(inner.clone()));

                // Prepare the new "package" to be delivered out of the poll loop.
                let package = {
                    let recv = RecvStream::new(rx_body, Some(drive.clone()), is_no_body);

                    let (parts, _) = req.into_parts();
                    let req = http::Request::from_parts(parts, recv);

                    let handle = ResponseHandle {
                        cfg: PipelineConfig {
                            version: req.version(),
                            accept_gzip,
                            head_request: is_head,
                            compress_min_len: self.cfg.compress_min_len,
                        },
                        tx: tx_ops,
                        drive,
                    };

                    (req, handle)
                };

                self.queue.push_back(Slot {
                    rx: rx_ops,
                    state: SlotState::AwaitHead,
                    version: package.0.version(),
                    reusable,
                });

                self.state = if is_no_body {
                    // tx_body drops here, the RecvStream sees EOF right away
                    State::Waiting
                } else {
                    State::RecvBody {
                        limit,
                        tx_body: Some(tx_body),
                        pending_chunk: None,
                    }
                };

                // Exit drive with the package.
                Ok(ReadProgress::Package(Box::new(package)))
            }

            State::RecvBody {
                limit,
                tx_body,
                pending_chunk,
            } => {
                // hand over a chunk we already read, if the channel lets us
                if pending_chunk.is_some() {
                    if let Some(tx) = tx_body.as_ref() {
                        match tx.poll_ready(cx) {
                            Poll::Pending => return Ok(ReadProgress::NoProgress),
                            Poll::Ready(true) => {
                                let chunk = pending_chunk.take().expect("pending chunk");
                                tx.send(Ok(chunk));
                                return Ok(ReadProgress::Progress);
                            }
                            Poll::Ready(false) => {
                                // The RecvStream is dropped, that's ok. We still
                                // exhaust the body so the connection can be
                                // reused for the next request.
                                trace!("RecvStream dropped, draining request body");
                                pending_chunk.take();
                                tx_body.take();
                                return Ok(ReadProgress::Progress);
                            }
                        }
                    } else {
                        pending_chunk.take();
                        return Ok(ReadProgress::Progress);
                    }
                }

                if limit.is_complete() {
                    trace!("request body complete");
                    tx_body.take();
                    self.state = State::Waiting;
                    return Ok(ReadProgress::Progress);
                }

                let amount = {
                    let mut bref = self.body_buf.borrow();

                    match limit.poll_read(cx, &mut self.io, &mut bref[..]) {
                        Poll::Pending => {
                            return Ok(ReadProgress::NoProgress);
                        }
                        Poll::Ready(Err(e)) => {
                            return Err(e.into());
                        }
                        Poll::Ready(Ok(amount)) => {
                            bref.add_len(amount);
                            amount
                        }
                    }
                };

                trace!("read req body: {}", amount);

                let chunk = if amount > 0 && tx_body.is_some() {
                    Some(self.body_buf[0..amount].to_vec())
                } else {
                    None
                };
                self.body_buf.empty();

                if amount == 0 {
                    // end of body
                    tx_body.take();
                    self.state = State::Waiting;
                } else {
                    *pending_chunk = chunk;
                }

                Ok(ReadProgress::Progress)
            }
        }
    }
}

/// Minimal substituted response for a dropped handler.
fn synthetic_500(version: http::Version) -> Vec<u8> {
    let mut table = HeaderTable::new();
    table.set("content-length", "0");

    render_head(version, 500, None, &table).expect("render synthetic 500")
}

// ***************** Boiler plate to hide IO behind a Box<dyn trait> ***************

trait Io: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

struct IoAdapt<S>(S);

impl<S> Io for IoAdapt<S> where S: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<S> AsyncRead for IoAdapt<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        Pin::new(&mut this.0).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for IoAdapt<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        Pin::new(&mut this.0).poll_write(cx, buf)
    }
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.0).poll_flush(cx)
    }
    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.0).poll_close(cx)
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Waiting => write!(f, "Waiting")?,
            State::RecvReq => write!(f, "RecvReq")?,
            State::RecvBody { pending_chunk, .. } => write!(
                f,
                "RecvBody pending_chunk: {}",
                pending_chunk.is_some()
            )?,
            State::Closed => write!(f, "Closed")?,
        }
        Ok(())
    }
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Connection")
    }
}
