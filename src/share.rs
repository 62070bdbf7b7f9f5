use crate::mpsc;
use crate::server::DriveExternal;
use crate::AsyncRead;
use crate::Error;
use futures_util::future::poll_fn;
use futures_util::ready;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Receives a request body from the remote peer.
///
/// Obtained as the body of the `http::Request` delivered by
/// [`server::Connection::accept`]. Reading from it also drives the
/// connection, so a handler can consume the body without anything
/// polling `accept` concurrently.
///
/// [`server::Connection::accept`]: crate::server::Connection::accept
pub struct RecvStream {
    rx_body: mpsc::Receiver<io::Result<Vec<u8>>>,
    drive: Option<Arc<dyn DriveExternal + Send + Sync>>,
    ready: Option<Vec<u8>>,
    index: usize,
    no_body: bool,
    ended: bool,
}

impl RecvStream {
    pub(crate) fn new(
        rx_body: mpsc::Receiver<io::Result<Vec<u8>>>,
        drive: Option<Arc<dyn DriveExternal + Send + Sync>>,
        no_body: bool,
    ) -> Self {
        RecvStream {
            rx_body,
            drive,
            ready: None,
            index: 0,
            no_body,
            ended: no_body,
        }
    }

    /// Read some body data in an async way.
    pub fn poll_body_read(&mut self, cx: &mut Context, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        if self.no_body {
            return Ok(0).into();
        }

        // The connection might not be driven by anything else right now.
        if let Some(drive) = &self.drive {
            drive.poll_drive_external(cx)?;
        }

        loop {
            // First ship out ready data already received.
            if let Some(ready) = &self.ready {
                let i = self.index;

                let max = buf.len().min(ready.len() - i);

                buf[0..max].copy_from_slice(&ready[i..(i + max)]);
                self.index += max;

                if self.index == ready.len() {
                    // all used up
                    self.ready.take();
                }

                return Ok(max).into();
            }

            // invariant: Should be no ready bytes if we're here.
            assert!(self.ready.is_none());

            match ready!(self.rx_body.poll_recv(cx)) {
                None => {
                    // Channel is closed which indicates end of body.
                    self.ended = true;
                    return Ok(0).into();
                }
                Some(v) => {
                    // nested io::Error
                    let v = v?;

                    self.ready = Some(v);
                    self.index = 0;
                }
            }
        }
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        Ok(poll_fn(move |cx| Pin::new(&mut *self).poll_read(cx, buf)).await?)
    }

    /// True once the entire body has been delivered.
    pub fn is_end(&self) -> bool {
        self.ended && self.ready.is_none()
    }
}

impl AsyncRead for RecvStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().poll_body_read(cx, buf)
    }
}

impl std::fmt::Debug for RecvStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RecvStream")
    }
}
