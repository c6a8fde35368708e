//! Outbound side of a channel.
//!
//! Callers, request workers and proxy streams all produce commands for the
//! same link. They hand encoded frames to a single writer task, which owns
//! the write half, so frames never interleave on the wire.
//!
//! ```text
//! call_async      ─┐
//! request worker  ─┼─► WriterHandle ─► queue ─► writer task ─► write half
//! proxy stream    ─┘
//! ```
//!
//! Whatever is queued when the task wakes up goes out in one vectored write.
//! The number of frames queued but not yet written is bounded: a sender that
//! finds the limit reached waits for the writer to drain, up to a timeout.
//! [`WriterHandle::shutdown`] lets the task finish what is queued and then
//! shuts the stream down, which the peer reads as end of stream.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::error::{ChannelError, Result};
use crate::protocol::{Header, HEADER_SIZE};

/// Default limit of frames queued but not yet written.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default capacity of the queue feeding the writer task.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default time a sender waits for the queue to drain.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Most frames gathered into one vectored write.
const MAX_BATCH_SIZE: usize = 64;

/// An encoded command waiting to be written.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Encoded header.
    pub header: [u8; HEADER_SIZE],
    /// Payload bytes (empty for Flush and Eof).
    pub payload: Bytes,
}

impl OutboundFrame {
    /// Pair an encoded `header` with its payload.
    pub fn new(header: &Header, payload: Bytes) -> Self {
        Self {
            header: header.encode(),
            payload,
        }
    }

    /// Bytes this frame occupies on the wire.
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    fn parts(&self) -> [&[u8]; 2] {
        [&self.header[..], &self.payload[..]]
    }
}

/// Writer task limits, set through [`ChannelBuilder`](crate::ChannelBuilder).
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Frames queued but not yet written before senders have to wait.
    pub max_pending_frames: usize,
    /// Capacity of the queue feeding the writer task.
    pub channel_capacity: usize,
    /// How long a sender waits for the queue to drain.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// State shared by every handle and the writer task.
struct Shared {
    /// Frames accepted by a handle and not yet written.
    queued: AtomicUsize,
    /// Signalled whenever written frames leave the count.
    drained: Notify,
    /// Asks the task to drain and close the stream.
    shutdown: Notify,
    limit: usize,
    wait: Duration,
}

impl Shared {
    fn at_limit(&self) -> bool {
        self.queued.load(Ordering::Acquire) >= self.limit
    }

    fn release(&self, frames: usize) {
        self.queued.fetch_sub(frames, Ordering::AcqRel);
        self.drained.notify_waiters();
    }
}

/// Sending side of the writer task. Clones share the same queue.
#[derive(Clone)]
pub struct WriterHandle {
    queue: mpsc::Sender<OutboundFrame>,
    shared: Arc<Shared>,
}

impl WriterHandle {
    /// Queue a frame, waiting while the pending limit is reached.
    ///
    /// # Errors
    ///
    /// [`ChannelError::BackpressureTimeout`] if the queue does not drain in
    /// time, [`ChannelError::ConnectionClosed`] once the writer has stopped.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.wait_for_room().await?;
        self.shared.queued.fetch_add(1, Ordering::AcqRel);
        self.queue.send(frame).await.map_err(|_| {
            self.shared.release(1);
            ChannelError::ConnectionClosed
        })
    }

    /// Queue a frame without waiting.
    ///
    /// Used where awaiting is impossible, such as closing a stream on drop.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<()> {
        if self.shared.at_limit() {
            return Err(ChannelError::BackpressureTimeout);
        }
        self.shared.queued.fetch_add(1, Ordering::AcqRel);
        self.queue.try_send(frame).map_err(|e| {
            self.shared.release(1);
            match e {
                mpsc::error::TrySendError::Full(_) => ChannelError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => ChannelError::ConnectionClosed,
            }
        })
    }

    async fn wait_for_room(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.shared.wait;
        loop {
            let drained = self.shared.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if !self.shared.at_limit() {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                return Err(ChannelError::BackpressureTimeout);
            }
        }
    }

    /// Whether senders currently have to wait.
    pub fn is_backpressure_active(&self) -> bool {
        self.shared.at_limit()
    }

    /// Frames queued but not yet written.
    pub fn pending_count(&self) -> usize {
        self.shared.queued.load(Ordering::Acquire)
    }

    /// Whether the writer task has stopped accepting frames.
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Write what is already queued, then shut the stream down. Frames sent
    /// afterwards fail with `ConnectionClosed`.
    pub fn shutdown(&self) {
        self.shared.shutdown.notify_one();
    }
}

/// Start the writer task on `writer`.
///
/// The task ends when every handle is dropped, after a
/// [`shutdown`](WriterHandle::shutdown), or on the first write error, which
/// the returned `JoinHandle` yields.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (queue, rx) = mpsc::channel(config.channel_capacity);
    let shared = Arc::new(Shared {
        queued: AtomicUsize::new(0),
        drained: Notify::new(),
        shutdown: Notify::new(),
        limit: config.max_pending_frames,
        wait: config.backpressure_timeout,
    });
    let task = tokio::spawn(writer_loop(rx, writer, shared.clone()));
    (WriterHandle { queue, shared }, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    shared: Arc<Shared>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut closing = false;
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);

    loop {
        let next = if closing {
            rx.recv().await
        } else {
            tokio::select! {
                frame = rx.recv() => frame,
                _ = shared.shutdown.notified() => {
                    // Closing the queue lets recv drain what is left, then end.
                    rx.close();
                    closing = true;
                    continue;
                }
            }
        };
        let Some(first) = next else {
            break;
        };

        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        write_batch(&mut writer, &batch).await?;
        shared.release(batch.len());
        batch.clear();
    }

    writer.shutdown().await?;
    Ok(())
}

/// Write every frame of `batch`, resuming after partial vectored writes.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut written = 0;

    while written < total {
        let slices = unwritten_slices(batch, written);
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "stream accepted no bytes",
            )));
        }
        written += n;
    }

    writer.flush().await?;
    Ok(())
}

/// Slices covering `batch` minus its first `skip` bytes.
fn unwritten_slices(batch: &[OutboundFrame], mut skip: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    for part in batch.iter().flat_map(OutboundFrame::parts) {
        if skip >= part.len() {
            skip -= part.len();
            continue;
        }
        slices.push(IoSlice::new(&part[skip..]));
        skip = 0;
    }
    slices
}
