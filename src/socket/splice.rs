//! Bidirectional stream splice
//!
//! Copies data both ways between an accepted client connection and the
//! dialed backend until each direction reaches EOF, half-closing the write
//! side as its reader finishes. Used by the TCP forwarding loop.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const SPLICE_BUFFER_SIZE: usize = 16 * 1024;

/// Byte counts for a completed splice
#[derive(Debug, Clone, Copy, Default)]
pub struct SpliceSummary {
    /// Bytes moved client → backend
    pub from_client: u64,
    /// Bytes moved backend → client
    pub from_backend: u64,
}

/// One direction of the splice: buffered read-then-write with shutdown
/// propagation once the reader hits EOF.
struct Direction {
    buf: Box<[u8]>,
    start: usize,
    end: usize,
    saw_eof: bool,
    shutdown_done: bool,
    transferred: u64,
}

impl Direction {
    fn new() -> Self {
        Self {
            buf: vec![0u8; SPLICE_BUFFER_SIZE].into_boxed_slice(),
            start: 0,
            end: 0,
            saw_eof: false,
            shutdown_done: false,
            transferred: 0,
        }
    }

    fn poll_step<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<io::Result<u64>>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            if self.start < self.end {
                let n = match writer.as_mut().poll_write(cx, &self.buf[self.start..self.end]) {
                    Poll::Ready(Ok(0)) => {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "write zero bytes",
                        )))
                    }
                    Poll::Ready(Ok(n)) => n,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                };
                self.start += n;
                self.transferred += n as u64;
                if self.start == self.end {
                    self.start = 0;
                    self.end = 0;
                }
            } else if self.saw_eof {
                if !self.shutdown_done {
                    match writer.as_mut().poll_flush(cx) {
                        Poll::Ready(Ok(())) => {}
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                    match writer.as_mut().poll_shutdown(cx) {
                        Poll::Ready(Ok(())) => self.shutdown_done = true,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                return Poll::Ready(Ok(self.transferred));
            } else {
                let mut read_buf = ReadBuf::new(&mut self.buf);
                match reader.as_mut().poll_read(cx, &mut read_buf) {
                    Poll::Ready(Ok(())) => {
                        let n = read_buf.filled().len();
                        if n == 0 {
                            self.saw_eof = true;
                        } else {
                            self.end = n;
                        }
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }
        }
    }
}

struct Splice<'a, C, B> {
    client: &'a mut C,
    backend: &'a mut B,
    outbound: Direction,
    inbound: Direction,
}

impl<C, B> std::future::Future for Splice<'_, C, B>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    type Output = io::Result<SpliceSummary>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        // An error in one direction ends that direction only; the peer may
        // still be mid-response on the other one.
        let outbound_done = match this.outbound.poll_step(
            cx,
            Pin::new(&mut this.client),
            Pin::new(&mut this.backend),
        ) {
            Poll::Ready(Ok(_)) | Poll::Ready(Err(_)) => true,
            Poll::Pending => false,
        };
        let inbound_done = match this.inbound.poll_step(
            cx,
            Pin::new(&mut this.backend),
            Pin::new(&mut this.client),
        ) {
            Poll::Ready(Ok(_)) | Poll::Ready(Err(_)) => true,
            Poll::Pending => false,
        };

        if outbound_done && inbound_done {
            Poll::Ready(Ok(SpliceSummary {
                from_client: this.outbound.transferred,
                from_backend: this.inbound.transferred,
            }))
        } else {
            Poll::Pending
        }
    }
}

/// Splice `client` and `backend` together until both directions finish.
///
/// # Errors
///
/// Only setup-class failures surface; per-direction transfer errors are
/// treated as that side's EOF.
pub async fn splice_streams<C, B>(client: &mut C, backend: &mut B) -> io::Result<SpliceSummary>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    Splice {
        client,
        backend,
        outbound: Direction::new(),
        inbound: Direction::new(),
    }
    .await
}
