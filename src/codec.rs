use crate::body::{Body, EntityLength};
use crate::chunked::ChunkedEncoder;
use crate::headers::{Cookie, HeaderTable, PSEUDO_ENTITY_LENGTH, PSEUDO_REASON, PSEUDO_STATUS};
use crate::http11::render_head;
use crate::mpsc;
use crate::server::DriveExternal;
use crate::writer::FramingMode;
use crate::Error;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures_channel::oneshot;
use futures_util::future::poll_fn;
use std::io::Write;
use std::sync::Arc;
use std::task::Poll;

/// Header snapshot travelling through the filter chain.
///
/// Status, reason and entity length ride along as pseudo-headers in the
/// table; the framing decision is typed out separately once taken.
pub(crate) struct Head {
    pub table: HeaderTable,
    pub cookies: Vec<Cookie>,
    pub mode: Option<FramingMode>,
    /// The body follows as a tagged handoff, not as chunk events.
    pub body_handoff: bool,
}

/// What the response pushes into the pipeline, in strict order: one
/// `Headers`, then chunks/flushes or one `Body` handoff, then `End`.
pub(crate) enum Frame {
    Headers(Head),
    Chunk(Vec<u8>),
    Flush(oneshot::Sender<()>),
    Body(Body),
    End,
}

/// What comes out the downstream end, consumed by the connection.
pub(crate) enum WriteOp {
    /// Pre-serialized header block plus the framing the body bytes use.
    Head { block: Vec<u8>, mode: FramingMode },
    /// Wire-ready (already framed) body bytes.
    Data(Vec<u8>),
    /// Resolve the ack once everything queued so far reached the socket.
    Flush(oneshot::Sender<()>),
    /// Tagged body for the writer dispatch.
    Body(Body),
    End,
}

/// One stage of the codec. Stages own their buffered state and compose
/// sequentially; chunk output of stage N is chunk input of stage N+1.
pub(crate) trait Filter: Send + Sync {
    fn on_headers(&mut self, head: &mut Head) -> Result<(), Error> {
        let _ = head;
        Ok(())
    }

    fn on_chunk(&mut self, chunk: Vec<u8>, out: &mut Vec<Vec<u8>>) -> Result<(), Error> {
        out.push(chunk);
        Ok(())
    }

    fn on_end(&mut self, out: &mut Vec<Vec<u8>>) -> Result<(), Error> {
        let _ = out;
        Ok(())
    }
}

/// Renders the cookie table into `set-cookie` headers.
pub(crate) struct CookieFilter;

impl Filter for CookieFilter {
    fn on_headers(&mut self, head: &mut Head) -> Result<(), Error> {
        for cookie in head.cookies.drain(..) {
            head.table.add("set-cookie", cookie.render());
        }
        Ok(())
    }
}

/// Negotiated gzip compression.
///
/// Compresses chunked/streamed entities when the client advertised gzip,
/// the content type is compressible and the entity is streaming or big
/// enough to be worth it. Known lengths are dropped in favor of
/// streaming since the compressed size isn't known up front. Tagged body
/// handoffs (ranges, files) are never routed through here.
pub(crate) struct GzipFilter {
    accept_gzip: bool,
    min_len: usize,
    enc: Option<GzEncoder<Vec<u8>>>,
}

impl GzipFilter {
    pub fn new(accept_gzip: bool, min_len: usize) -> Self {
        GzipFilter {
            accept_gzip,
            min_len,
            enc: None,
        }
    }

    fn is_compressible(content_type: &str) -> bool {
        let ct = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();

        ct.starts_with("text/")
            || ct.ends_with("/json")
            || ct.ends_with("+json")
            || ct.ends_with("/javascript")
            || ct.ends_with("/xml")
            || ct.ends_with("+xml")
            || ct.ends_with("/svg")
    }

    fn gz_err(e: std::io::Error) -> Error {
        Error::Filter(format!("gzip: {}", e))
    }
}

impl Filter for GzipFilter {
    fn on_headers(&mut self, head: &mut Head) -> Result<(), Error> {
        if !self.accept_gzip {
            return Ok(());
        }
        if head.body_handoff {
            // handed-off bytes never pass through this stage
            return Ok(());
        }
        if head.table.contains("content-encoding") {
            return Ok(());
        }

        let compressible = head
            .table
            .get("content-type")
            .map(Self::is_compressible)
            .unwrap_or(false);
        if !compressible {
            return Ok(());
        }

        let entity = head
            .table
            .get(PSEUDO_ENTITY_LENGTH)
            .and_then(EntityLength::parse)
            .unwrap_or(EntityLength::Streaming);

        match entity {
            EntityLength::Streaming => {}
            EntityLength::Known(n) if n as usize >= self.min_len => {}
            _ => return Ok(()),
        }

        trace!("gzip negotiated");

        head.table.set("content-encoding", "gzip");
        head.table.add("vary", "accept-encoding");
        // compressed size is unknown, length framing no longer applies
        head.table.remove("content-length");
        head.table.set(PSEUDO_ENTITY_LENGTH, "*");

        self.enc = Some(GzEncoder::new(vec![], Compression::default()));

        Ok(())
    }

    fn on_chunk(&mut self, chunk: Vec<u8>, out: &mut Vec<Vec<u8>>) -> Result<(), Error> {
        match &mut self.enc {
            None => out.push(chunk),
            Some(enc) => {
                enc.write_all(&chunk).map_err(Self::gz_err)?;
                // sync flush so every pushed chunk is decodable as it arrives
                enc.flush().map_err(Self::gz_err)?;

                let buf = std::mem::take(enc.get_mut());
                if !buf.is_empty() {
                    out.push(buf);
                }
            }
        }
        Ok(())
    }

    fn on_end(&mut self, out: &mut Vec<Vec<u8>>) -> Result<(), Error> {
        if let Some(enc) = self.enc.take() {
            let buf = enc.finish().map_err(Self::gz_err)?;
            if !buf.is_empty() {
                out.push(buf);
            }
        }
        Ok(())
    }
}

/// Consumes the entity length pseudo-header and decides the framing.
pub(crate) struct FramingFilter {
    version: http::Version,
}

impl FramingFilter {
    pub fn new(version: http::Version) -> Self {
        FramingFilter { version }
    }
}

/// Statuses that must not carry a body at all.
fn status_forbids_body(status: u16) -> bool {
    (100..200).contains(&status) || status == 204 || status == 304
}

impl Filter for FramingFilter {
    fn on_headers(&mut self, head: &mut Head) -> Result<(), Error> {
        let status: u16 = head
            .table
            .get(PSEUDO_STATUS)
            .and_then(|s| s.parse().ok())
            .unwrap_or(200);

        let entity = head
            .table
            .remove(PSEUDO_ENTITY_LENGTH)
            .and_then(|vs| vs.into_iter().next())
            .and_then(|v| EntityLength::parse(&v))
            .unwrap_or(EntityLength::Streaming);

        let mode = match entity {
            EntityLength::Known(n) => {
                head.table.set("content-length", n.to_string());
                FramingMode::Identity
            }
            EntityLength::NoBody => {
                if !status_forbids_body(status) {
                    head.table.set("content-length", "0");
                }
                FramingMode::Identity
            }
            EntityLength::Streaming => {
                if self.version >= http::Version::HTTP_11 {
                    head.table.set("transfer-encoding", "chunked");
                    FramingMode::Chunked
                } else {
                    // nothing delimits the body, closing does
                    head.table.set("connection", "close");
                    FramingMode::Close
                }
            }
        };

        trace!("framing decided: {:?}", mode);

        head.mode = Some(mode);
        Ok(())
    }
}

/// Downstream end: renders the header block, applies chunked framing to
/// streamed chunks and emits `WriteOp`s for the connection.
struct Terminal {
    version: http::Version,
    head_request: bool,
    mode: Option<FramingMode>,
    identity_remaining: u64,
    handoff: bool,
}

impl Terminal {
    fn on_headers(&mut self, head: Head) -> Result<Vec<WriteOp>, Error> {
        let status: u16 = head
            .table
            .get(PSEUDO_STATUS)
            .and_then(|s| s.parse().ok())
            .unwrap_or(200);
        let reason = head.table.get(PSEUDO_REASON).map(str::to_string);

        let mode = head.mode.unwrap_or(FramingMode::Identity);

        if mode == FramingMode::Identity {
            self.identity_remaining = head
                .table
                .get("content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
        }

        let block = render_head(self.version, status, reason.as_deref(), &head.table)?;

        self.mode = Some(mode);

        Ok(vec![WriteOp::Head { block, mode }])
    }

    fn on_chunks(&mut self, chunks: Vec<Vec<u8>>) -> Result<Vec<WriteOp>, Error> {
        if self.head_request {
            return Ok(vec![]);
        }

        let mode = self.mode.unwrap_or(FramingMode::Identity);
        let mut ops = vec![];

        for chunk in chunks {
            if chunk.is_empty() {
                continue;
            }
            match mode {
                FramingMode::Chunked => {
                    let mut framed = vec![];
                    ChunkedEncoder::write_chunk(&chunk, &mut framed);
                    ops.push(WriteOp::Data(framed));
                }
                FramingMode::Identity => {
                    let len = chunk.len() as u64;
                    if len > self.identity_remaining {
                        return Err(Error::Filter(format!(
                            "Body data longer than content-length header: {} > {}",
                            len, self.identity_remaining
                        )));
                    }
                    self.identity_remaining -= len;
                    ops.push(WriteOp::Data(chunk));
                }
                FramingMode::Close => {
                    ops.push(WriteOp::Data(chunk));
                }
            }
        }

        Ok(ops)
    }

    fn on_body(&mut self, body: Body) -> Result<Vec<WriteOp>, Error> {
        if self.head_request {
            return Ok(vec![]);
        }
        self.handoff = true;
        Ok(vec![WriteOp::Body(body)])
    }

    fn on_end(&mut self) -> Result<Vec<WriteOp>, Error> {
        let mut ops = vec![];

        // a handed-off body writes its own terminator
        if self.mode == Some(FramingMode::Chunked) && !self.handoff && !self.head_request {
            let mut fin = vec![];
            ChunkedEncoder::write_finish(&mut fin);
            ops.push(WriteOp::Data(fin));
        }

        ops.push(WriteOp::End);
        Ok(ops)
    }
}

/// Settings snapshotted from the request when the pipeline is built.
#[derive(Debug, Clone)]
pub(crate) struct PipelineConfig {
    pub version: http::Version,
    pub accept_gzip: bool,
    pub head_request: bool,
    pub compress_min_len: usize,
}

/// The ordered filter chain plus the bounded tail channel into the
/// connection. Single producer (the handler task), single consumer (the
/// connection state machine).
pub(crate) struct Pipeline {
    filters: Vec<Box<dyn Filter>>,
    terminal: Terminal,
    tx: mpsc::Sender<WriteOp>,
    drive: Option<Arc<dyn DriveExternal + Send + Sync>>,
}

impl Pipeline {
    pub fn new(
        cfg: PipelineConfig,
        tx: mpsc::Sender<WriteOp>,
        drive: Option<Arc<dyn DriveExternal + Send + Sync>>,
    ) -> Self {
        let filters: Vec<Box<dyn Filter>> = vec![
            Box::new(CookieFilter),
            Box::new(GzipFilter::new(cfg.accept_gzip, cfg.compress_min_len)),
            Box::new(FramingFilter::new(cfg.version)),
        ];

        Pipeline {
            filters,
            terminal: Terminal {
                version: cfg.version,
                head_request: cfg.head_request,
                mode: None,
                identity_remaining: 0,
                handoff: false,
            },
            tx,
            drive,
        }
    }

    pub fn version(&self) -> http::Version {
        self.terminal.version
    }

    /// Run one frame through the filters and hand the resulting wire
    /// operations to the connection, suspending on a full tail channel.
    pub async fn send(&mut self, frame: Frame) -> Result<(), Error> {
        let ops = self.process(frame)?;

        for op in ops {
            self.push(op).await?;
        }

        Ok(())
    }

    fn process(&mut self, frame: Frame) -> Result<Vec<WriteOp>, Error> {
        match frame {
            Frame::Headers(mut head) => {
                for f in &mut self.filters {
                    f.on_headers(&mut head)?;
                }
                self.terminal.on_headers(head)
            }

            Frame::Chunk(chunk) => {
                let mut chunks = vec![chunk];
                for f in &mut self.filters {
                    let mut next = vec![];
                    for c in chunks {
                        f.on_chunk(c, &mut next)?;
                    }
                    chunks = next;
                }
                self.terminal.on_chunks(chunks)
            }

            Frame::Flush(ack) => Ok(vec![WriteOp::Flush(ack)]),

            Frame::Body(body) => self.terminal.on_body(body),

            Frame::End => {
                // each stage's end output still passes the stages after it
                let mut chunks: Vec<Vec<u8>> = vec![];
                for f in &mut self.filters {
                    let mut next = vec![];
                    for c in chunks {
                        f.on_chunk(c, &mut next)?;
                    }
                    f.on_end(&mut next)?;
                    chunks = next;
                }

                let mut ops = self.terminal.on_chunks(chunks)?;
                ops.extend(self.terminal.on_end()?);
                Ok(ops)
            }
        }
    }

    /// Wait for a flush ack from the connection, driving it meanwhile.
    pub(crate) async fn await_flush(
        &self,
        mut rx: oneshot::Receiver<()>,
    ) -> Result<(), Error> {
        use std::future::Future;

        poll_fn(|cx| {
            if let Some(drive) = &self.drive {
                drive.poll_drive_external(cx)?;
            }

            match std::pin::Pin::new(&mut rx).poll(cx) {
                Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
                Poll::Ready(Err(_)) => Poll::Ready(Err(Error::ClientGone)),
                Poll::Pending => Poll::Pending,
            }
        })
        .await
    }

    async fn push(&mut self, op: WriteOp) -> Result<(), Error> {
        let mut op = Some(op);

        poll_fn(|cx| {
            match self.tx.poll_ready(cx) {
                Poll::Ready(true) => {
                    self.tx.send(op.take().expect("op pushed twice"));

                    // the connection may have nothing else polling it
                    if let Some(drive) = &self.drive {
                        drive.poll_drive_external(cx)?;
                    }

                    Poll::Ready(Ok(()))
                }
                Poll::Ready(false) => Poll::Ready(Err(Error::ClientGone)),
                Poll::Pending => {
                    if let Some(drive) = &self.drive {
                        drive.poll_drive_external(cx)?;
                    }
                    Poll::Pending
                }
            }
        })
        .await
    }
}
