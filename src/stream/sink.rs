//! Receiving end of a stream.
//!
//! Chunk, Flush and Eof commands for an exported sink are enqueued on the
//! reader task without blocking, so the order in which the peer sent them is
//! the order in which the [`PipeReader`] observes them.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

use crate::error::{ChannelError, Result};

#[derive(Debug)]
pub(crate) enum SinkOp {
    Data(Bytes),
    Flush,
    Close,
}

/// Writing side of a sink queue.
#[derive(Debug, Clone)]
pub(crate) struct SinkHandle {
    pub(super) tx: mpsc::UnboundedSender<SinkOp>,
}

impl SinkHandle {
    pub(crate) fn write(&self, data: Bytes) -> Result<()> {
        self.push(SinkOp::Data(data))
    }

    pub(crate) fn flush(&self) -> Result<()> {
        self.push(SinkOp::Flush)
    }

    pub(crate) fn close(&self) -> Result<()> {
        self.push(SinkOp::Close)
    }

    fn push(&self, op: SinkOp) -> Result<()> {
        self.tx.send(op).map_err(|_| ChannelError::StreamClosed)
    }
}

/// Create a connected sink/reader pair.
pub(crate) fn sink_pair() -> (SinkHandle, PipeReader) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        SinkHandle { tx },
        PipeReader {
            rx,
            pending: Bytes::new(),
            state: ReaderState::Open,
        },
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    Open,
    Finished,
    Broken,
}

/// Local end of a pipe whose writer is elsewhere.
///
/// Yields chunks exactly as written. End of stream is reported once the
/// writer closes; if the writer disappears without closing (for example the
/// channel terminated) the next read fails with [`io::ErrorKind::BrokenPipe`].
///
/// Also implements [`AsyncRead`], so it can be used with
/// `tokio::io::AsyncReadExt` and `tokio::io::copy`.
#[derive(Debug)]
pub struct PipeReader {
    rx: mpsc::UnboundedReceiver<SinkOp>,
    pending: Bytes,
    state: ReaderState,
}

impl PipeReader {
    /// Receive the next chunk.
    ///
    /// Returns `None` at end of stream.
    pub async fn recv(&mut self) -> Option<io::Result<Bytes>> {
        std::future::poll_fn(|cx| self.poll_recv(cx)).await
    }

    /// Read everything until end of stream.
    pub async fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.recv().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    /// Poll for the next chunk.
    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<io::Result<Bytes>>> {
        if self.state != ReaderState::Open {
            return Poll::Ready(None);
        }
        loop {
            match ready!(self.rx.poll_recv(cx)) {
                Some(SinkOp::Data(data)) => return Poll::Ready(Some(Ok(data))),
                Some(SinkOp::Flush) => continue,
                Some(SinkOp::Close) => {
                    self.state = ReaderState::Finished;
                    self.rx.close();
                    return Poll::Ready(None);
                }
                None => {
                    self.state = ReaderState::Broken;
                    return Poll::Ready(Some(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "stream writer went away without closing",
                    ))));
                }
            }
        }
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match ready!(this.poll_recv(cx)) {
                Some(Ok(chunk)) => this.pending = chunk,
                Some(Err(e)) => return Poll::Ready(Err(e)),
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}
