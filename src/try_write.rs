use crate::fast_buf::ConsumeBuf;
use crate::AsyncWrite;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Outgoing byte queue for one connection.
///
/// Everything headed for the socket (header blocks, framed body bytes)
/// is appended here and drained opportunistically by `try_write`. A
/// short write retains the tail; a full kernel buffer is simply no
/// progress until the socket becomes writable again.
pub(crate) struct OutBuf {
    queue: ConsumeBuf,
    flush_after: bool,
}

impl OutBuf {
    pub fn new() -> Self {
        OutBuf {
            queue: ConsumeBuf::default(),
            flush_after: false,
        }
    }

    pub fn append(&mut self, data: &[u8]) {
        if !data.is_empty() {
            self.queue.push_back(data);
        }
    }

    pub fn append_vec(&mut self, data: Vec<u8>) {
        if !data.is_empty() {
            self.queue.append_vec(data);
        }
    }

    pub fn flush_after(&mut self) {
        self.flush_after = true;
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Bytes queued but not yet written.
    pub fn pending(&self) -> &[u8] {
        &self.queue
    }

    /// Attempt to make write progress against the socket.
    ///
    /// Returns Ok(true) if any bytes moved (call again), Ok(false) if no
    /// further progress is possible right now.
    pub fn try_write<S: AsyncWrite + Unpin>(
        &mut self,
        cx: &mut Context<'_>,
        io: &mut S,
    ) -> io::Result<bool> {
        if self.queue.is_empty() {
            if self.flush_after {
                trace!("try_write attempt flush");

                match Pin::new(io).poll_flush(cx) {
                    Poll::Pending => {
                        return Ok(false);
                    }
                    Poll::Ready(Ok(_)) => {
                        trace!("try_write flushed");
                        // flush done
                        self.flush_after = false;
                    }
                    Poll::Ready(Err(e)) => {
                        trace!("try_write error: {:?}", e);
                        return Err(e);
                    }
                }
            }

            return Ok(false);
        }

        trace!("try_write left: {}", self.queue.len());

        let poll = Pin::new(io).poll_write(cx, &self.queue);

        match poll {
            Poll::Pending => {
                // Pending is fine. It means the socket is full upstream, we can
                // still progress the downstream state machine.
                trace!("try_write: Poll::Pending");
                Ok(false)
            }

            // We managed to write some.
            Poll::Ready(Ok(amount)) => {
                trace!("try_write did write: {}", amount);
                self.queue.consume(amount);
                Ok(true)
            }

            Poll::Ready(Err(e)) => {
                trace!("try_write error: {:?}", e);
                Err(e)
            }
        }
    }
}
