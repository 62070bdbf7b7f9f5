use crate::body::{Body, EntityLength};
use crate::codec::{Frame, Head, Pipeline};
use crate::writer::{BodyWriter, FramingMode};
use crate::headers::{Cookie, CookieFlag, HeaderTable, PSEUDO_ENTITY_LENGTH, PSEUDO_REASON, PSEUDO_STATUS};
use crate::Error;
use enumflags2::{bitflags, BitFlags};
use futures_channel::oneshot;

/// Response lifecycle bits.
///
/// `Started` freezes status/reason/headers/cookies. `Streaming` without
/// `Ended` means more chunks are expected. `Ended` implies `Started`.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    Started = 0b001,
    Streaming = 0b010,
    Ended = 0b100,
}

/// The response under construction for one request.
///
/// Created by the driver before the handler is invoked, mutated only by
/// the handler's task, torn down once the writer has finalized. All
/// push-type operations (`send`, `stream`, `flush`, `end`) go through
/// the codec pipeline and may suspend on downstream backpressure.
pub struct Response {
    status: u16,
    reason: Option<String>,
    headers: HeaderTable,
    cookies: Vec<Cookie>,
    state: BitFlags<ResponseState>,
    head_pushed: bool,
    pipeline: Pipeline,
}

impl Response {
    pub(crate) fn new(pipeline: Pipeline) -> Response {
        Response {
            status: 200,
            reason: None,
            headers: HeaderTable::new(),
            cookies: vec![],
            state: BitFlags::empty(),
            head_pushed: false,
            pipeline,
        }
    }

    fn check_not_started(&self, what: &str) -> Result<(), Error> {
        if self.state.contains(ResponseState::Started) {
            return Err(Error::lifecycle(format!(
                "Cannot {} after response output started",
                what
            )));
        }
        Ok(())
    }

    /// The current lifecycle bit set.
    pub fn state(&self) -> BitFlags<ResponseState> {
        self.state
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// First value of a header previously set on this response.
    pub fn header(&self, field: &str) -> Option<&str> {
        self.headers.get(field)
    }

    /// All values of a header previously set on this response.
    pub fn header_all(&self, field: &str) -> &[String] {
        self.headers.get_all(field)
    }

    pub fn set_status(&mut self, code: u16) -> Result<&mut Self, Error> {
        self.check_not_started("set status")?;
        if !(100..=599).contains(&code) {
            return Err(Error::lifecycle(format!(
                "Status code out of range: {}",
                code
            )));
        }
        self.status = code;
        Ok(self)
    }

    pub fn set_reason(&mut self, phrase: impl Into<String>) -> Result<&mut Self, Error> {
        self.check_not_started("set reason")?;
        self.reason = Some(phrase.into());
        Ok(self)
    }

    /// Append a value to the (lowercased) field's list.
    pub fn add_header(
        &mut self,
        field: &str,
        value: impl Into<String>,
    ) -> Result<&mut Self, Error> {
        self.check_not_started("add header")?;
        self.headers.add(field, value);
        Ok(self)
    }

    /// Replace the (lowercased) field's list with one value.
    pub fn set_header(
        &mut self,
        field: &str,
        value: impl Into<String>,
    ) -> Result<&mut Self, Error> {
        self.check_not_started("set header")?;
        self.headers.set(field, value);
        Ok(self)
    }

    pub fn set_cookie(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
        flags: Vec<CookieFlag>,
    ) -> Result<&mut Self, Error> {
        self.check_not_started("set cookie")?;

        let name = name.into();
        // one cookie per name, later settings win
        self.cookies.retain(|c| c.name != name);
        self.cookies.push(Cookie::new(name, value.into(), flags));
        Ok(self)
    }

    /// Push the header snapshot into the codec. Cookies freeze here.
    async fn start(&mut self, entity: EntityLength, body_handoff: bool) -> Result<(), Error> {
        let mut table = self.headers.clone();
        table.set(PSEUDO_STATUS, self.status.to_string());
        if let Some(reason) = &self.reason {
            table.set(PSEUDO_REASON, reason.clone());
        }
        table.set(PSEUDO_ENTITY_LENGTH, entity.header_value());

        let head = Head {
            table,
            cookies: self.cookies.clone(),
            mode: None,
            body_handoff,
        };

        self.pipeline.send(Frame::Headers(head)).await?;
        self.head_pushed = true;

        Ok(())
    }

    /// Send a complete body and end the response. Equivalent to `end`
    /// with that body.
    pub async fn send(&mut self, body: impl Into<Body>) -> Result<(), Error> {
        if self.state.contains(ResponseState::Ended) {
            return Err(Error::lifecycle("Cannot send: response already ended"));
        }
        if self.state.contains(ResponseState::Streaming) {
            return Err(Error::lifecycle("Cannot send: response is streaming"));
        }

        match body.into() {
            Body::Empty => self.end(None).await,
            Body::Buffer(b) => self.end(Some(b)).await,
            body => {
                if let Body::MultiPartByteRange { boundary, .. } = &body {
                    self.headers.set(
                        "content-type",
                        format!("multipart/byteranges; boundary={}", boundary),
                    );
                }

                let version = self.pipeline.version();
                let entity = body.entity_length();

                // the framing this entity length will resolve to; shape
                // mismatches fail before anything reaches the codec
                let mode = match entity {
                    EntityLength::Streaming => {
                        if version >= http::Version::HTTP_11 {
                            FramingMode::Chunked
                        } else {
                            FramingMode::Close
                        }
                    }
                    _ => FramingMode::Identity,
                };
                BodyWriter::validate(&body, version, mode)?;

                self.start(entity, true).await?;
                self.pipeline.send(Frame::Body(body)).await?;
                self.pipeline.send(Frame::End).await?;

                self.state |= ResponseState::Started | ResponseState::Ended;
                Ok(())
            }
        }
    }

    /// Push one body chunk, streaming the response. The first call
    /// freezes the headers with an unknown entity length.
    pub async fn stream(&mut self, chunk: impl Into<Vec<u8>>) -> Result<&mut Self, Error> {
        if self.state.contains(ResponseState::Ended) {
            return Err(Error::lifecycle("Cannot stream: response already ended"));
        }

        if !self.head_pushed {
            self.start(EntityLength::Streaming, false).await?;
        }

        self.pipeline.send(Frame::Chunk(chunk.into())).await?;

        self.state |= ResponseState::Started | ResponseState::Streaming;
        Ok(self)
    }

    /// Resolves once everything pushed so far has been handed to the
    /// socket.
    pub async fn flush(&mut self) -> Result<&mut Self, Error> {
        if !self.state.contains(ResponseState::Started) {
            return Err(Error::lifecycle("Cannot flush before output started"));
        }
        if self.state.contains(ResponseState::Ended) {
            return Err(Error::lifecycle("Cannot flush after response ended"));
        }

        let (tx, rx) = oneshot::channel();
        self.pipeline.send(Frame::Flush(tx)).await?;

        self.pipeline.await_flush(rx).await?;
        Ok(self)
    }

    /// End the response, optionally with a final chunk. If nothing was
    /// streamed, the headers go out with the chunk's length, or the
    /// no-body sentinel when there is no chunk.
    pub async fn end(&mut self, chunk: Option<Vec<u8>>) -> Result<(), Error> {
        if self.state.contains(ResponseState::Ended) {
            return Err(Error::lifecycle("Cannot end: response already ended"));
        }

        if !self.head_pushed {
            let entity = match &chunk {
                Some(c) => EntityLength::Known(c.len() as u64),
                None => EntityLength::NoBody,
            };
            self.start(entity, false).await?;
        }

        if let Some(c) = chunk {
            if !c.is_empty() {
                self.pipeline.send(Frame::Chunk(c)).await?;
            }
        }

        self.pipeline.send(Frame::End).await?;

        self.state |= ResponseState::Started | ResponseState::Ended;
        Ok(())
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Response {{ status: {}, state: {:?} }}",
            self.status, self.state
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{PipelineConfig, WriteOp};
    use crate::mpsc;
    use async_std::task::block_on;
    use std::task::{Context, Poll};

    fn response() -> (Response, mpsc::Receiver<WriteOp>) {
        let cfg = PipelineConfig {
            version: http::Version::HTTP_11,
            accept_gzip: false,
            head_request: false,
            compress_min_len: 1024,
        };
        let (tx, rx) = mpsc::Receiver::new(64);
        (Response::new(Pipeline::new(cfg, tx, None)), rx)
    }

    fn wire(rx: &mut mpsc::Receiver<WriteOp>) -> Vec<u8> {
        let waker = futures_util::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut out = vec![];
        while let Poll::Ready(Some(op)) = rx.poll_recv(&mut cx) {
            match op {
                WriteOp::Head { block, .. } => out.extend_from_slice(&block),
                WriteOp::Data(d) => out.extend_from_slice(&d),
                _ => {}
            }
        }
        out
    }

    #[test]
    fn status_range_is_enforced() {
        let (mut res, _rx) = response();

        assert!(matches!(res.set_status(99), Err(Error::Lifecycle(_))));
        assert!(matches!(res.set_status(600), Err(Error::Lifecycle(_))));
        assert!(res.set_status(100).is_ok());
        assert!(res.set_status(599).is_ok());
    }

    #[test]
    fn fluent_setters() {
        let (mut res, _rx) = response();

        res.set_status(201)
            .unwrap()
            .set_reason("Made")
            .unwrap()
            .set_header("X-A", "1")
            .unwrap()
            .add_header("x-a", "2")
            .unwrap();

        assert_eq!(res.header_all("X-A"), &["1".to_string(), "2".to_string()]);
    }

    #[test]
    fn setters_fail_after_start_without_mutating() {
        let (mut res, _rx) = response();

        res.set_header("x-a", "1").unwrap();
        block_on(res.send("hi")).unwrap();

        assert_eq!(
            res.state(),
            ResponseState::Started | ResponseState::Ended
        );

        assert!(matches!(res.set_status(500), Err(Error::Lifecycle(_))));
        assert!(matches!(
            res.set_header("x-a", "changed"),
            Err(Error::Lifecycle(_))
        ));
        assert!(matches!(
            res.set_cookie("a", "b", vec![]),
            Err(Error::Lifecycle(_))
        ));

        // nothing mutated by the failed calls
        assert_eq!(res.status(), 200);
        assert_eq!(res.header("x-a"), Some("1"));
    }

    #[test]
    fn send_string_body() {
        let (mut res, mut rx) = response();

        res.set_status(201).unwrap().set_header("X-A", "1").unwrap();
        block_on(res.send("hi")).unwrap();

        let wire = wire(&mut rx);
        let s = String::from_utf8(wire).unwrap();
        assert!(s.starts_with("HTTP/1.1 201 Created\r\n"));
        assert!(s.contains("x-a: 1\r\n"));
        assert!(s.contains("content-length: 2\r\n"));
        assert!(s.ends_with("\r\n\r\nhi"));
    }

    #[test]
    fn stream_then_end_is_chunked() {
        let (mut res, mut rx) = response();

        block_on(async {
            res.stream("ab").await.unwrap();
            assert_eq!(
                res.state(),
                ResponseState::Started | ResponseState::Streaming
            );
            res.stream("cd").await.unwrap();
            res.end(None).await.unwrap();
        });

        assert!(res.state().contains(ResponseState::Ended));

        let wire = wire(&mut rx);
        let s = String::from_utf8(wire).unwrap();
        assert!(s.contains("transfer-encoding: chunked\r\n"));
        assert!(s.ends_with("\r\n\r\n2\r\nab\r\n2\r\ncd\r\n0\r\n\r\n"));
    }

    #[test]
    fn end_without_chunk_has_no_body() {
        let (mut res, mut rx) = response();

        block_on(res.end(None)).unwrap();

        let wire = wire(&mut rx);
        let s = String::from_utf8(wire).unwrap();
        assert!(s.contains("content-length: 0\r\n"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn flush_before_start_is_lifecycle() {
        let (mut res, _rx) = response();
        let r = block_on(res.flush());
        assert!(matches!(r, Err(Error::Lifecycle(_))));
    }

    #[test]
    fn flush_after_end_is_lifecycle() {
        let (mut res, _rx) = response();
        block_on(res.send("x")).unwrap();

        let r = block_on(res.flush());
        assert!(matches!(r, Err(Error::Lifecycle(_))));
    }

    #[test]
    fn send_after_stream_is_lifecycle() {
        let (mut res, _rx) = response();

        block_on(async {
            res.stream("a").await.unwrap();
            let r = res.send("b").await;
            assert!(matches!(r, Err(Error::Lifecycle(_))));
        });
    }

    #[test]
    fn double_end_is_lifecycle() {
        let (mut res, _rx) = response();

        block_on(async {
            res.end(None).await.unwrap();
            let r = res.end(None).await;
            assert!(matches!(r, Err(Error::Lifecycle(_))));
        });
    }

    #[test]
    fn client_gone_surfaces_on_push() {
        let (mut res, rx) = response();
        drop(rx);

        // setters before the first push are unaffected
        res.set_status(201).unwrap();

        let r = block_on(res.send("hi"));
        assert!(matches!(r, Err(Error::ClientGone)));
    }

    #[test]
    fn cookies_freeze_on_first_push() {
        let (mut res, mut rx) = response();

        res.set_cookie(
            "sid",
            "x1",
            vec![CookieFlag::bare("HttpOnly"), CookieFlag::keyed("path", "/p")],
        )
        .unwrap();

        block_on(res.send("ok")).unwrap();

        let wire = wire(&mut rx);
        let s = String::from_utf8(wire).unwrap();
        assert!(s.contains("set-cookie: sid=x1; HttpOnly; path=/p\r\n"));
    }
}
