//! Channel builder and runtime loop.
//!
//! A [`Channel`] is one side of a bidirectional link. Either side may call
//! the other; each side executes the callables it registered. Building a
//! channel spawns:
//! 1. A writer task owning the write half
//! 2. A reader task that decodes commands and executes them
//!
//! Requests run on their own tasks, bounded by a semaphore, so a slow or
//! blocked unit of work never stalls the reader. Stream commands are applied
//! inline on the reader task, which keeps the bytes of one stream in order.
//!
//! When the link ends (end of stream, I/O error, protocol violation, or a
//! local [`Channel::close`]) the channel terminates exactly once: pending
//! calls are aborted, exported objects are invalidated, and [`Channel::join`]
//! returns.
//!
//! # Example
//!
//! ```ignore
//! use remoting::{Callable, Channel};
//!
//! let (stream_a, stream_b) = tokio::io::duplex(64 * 1024);
//! let (read_a, write_a) = tokio::io::split(stream_a);
//! let (read_b, write_b) = tokio::io::split(stream_b);
//!
//! let master = Channel::builder("master").build(read_a, write_a);
//! let agent = Channel::builder("agent")
//!     .register::<Add>()
//!     .build(read_b, write_b);
//!
//! assert_eq!(master.call(Add(2, 3)).await?, 5);
//! ```

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{watch, Semaphore};

use crate::codec::scope;
use crate::command::Command;
use crate::error::{CallError, ChannelError, Result};
use crate::export::{ExportTable, Exported, ObjectId};
use crate::handler::{Callable, CallableRegistry};
use crate::protocol::{CommandKind, Frame, FrameBuffer, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::request::{
    join_failure, typed_completer, Completer, Completion, Fault, Outcome, PendingCalls, RequestId,
    ResponseFuture,
};
use crate::stream::{SinkHandle, Target};
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

/// Default maximum number of requests executed concurrently.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 256;

/// Read buffer size of the reader task.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Anything work can be submitted to: a remote [`Channel`] or an in-process
/// [`LocalChannel`](crate::LocalChannel).
///
/// Code written against this trait behaves the same whether the work runs on
/// the other side of a link or in the current process.
pub trait VirtualChannel: Send + Sync {
    /// Run `work` and wait for its result.
    fn call<C: Callable>(
        &self,
        work: C,
    ) -> impl Future<Output = std::result::Result<C::Output, CallError<C::Error>>> + Send;

    /// Submit `work` and return a handle to its eventual result.
    fn call_async<C: Callable>(
        &self,
        work: C,
    ) -> impl Future<Output = Result<ResponseFuture<C::Output, C::Error>>> + Send;
}

/// Builder for configuring and creating a [`Channel`].
pub struct ChannelBuilder {
    name: String,
    registry: CallableRegistry,
    writer_config: WriterConfig,
    max_concurrent_requests: usize,
    max_payload_size: u32,
}

impl ChannelBuilder {
    /// Create a builder for a channel called `name` (used in logs).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            registry: CallableRegistry::new(),
            writer_config: WriterConfig::default(),
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    /// Allow the peer to run `C` on this side.
    pub fn register<C: Callable>(mut self) -> Self {
        self.registry.register::<C>();
        self
    }

    /// Use a prepared registry, replacing anything registered so far.
    pub fn registry(mut self, registry: CallableRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Set the maximum number of requests executed concurrently.
    ///
    /// Further requests wait for a free slot.
    /// Default: 256
    pub fn max_concurrent_requests(mut self, limit: usize) -> Self {
        self.max_concurrent_requests = limit;
        self
    }

    /// Set the maximum accepted payload size of an incoming frame.
    ///
    /// Default: 64 MB
    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.max_payload_size = size;
        self
    }

    /// Set the maximum pending frames for backpressure.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.writer_config.max_pending_frames = limit;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.writer_config.channel_capacity = capacity;
        self
    }

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.writer_config.backpressure_timeout = timeout;
        self
    }

    /// Start the channel over the given stream halves.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build<R, W>(self, reader: R, writer: W) -> Channel
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer, writer_task) = spawn_writer_task(writer, self.writer_config);
        let (terminated, _) = watch::channel(None);

        let channel = Channel {
            inner: Arc::new(Inner {
                name: self.name,
                writer,
                registry: self.registry,
                pending: Mutex::new(PendingCalls::new()),
                exports: Mutex::new(ExportTable::new()),
                next_request_id: AtomicU32::new(1),
                workers: Arc::new(Semaphore::new(self.max_concurrent_requests)),
                terminated,
            }),
        };
        tracing::debug!("channel {} started", channel.name());

        let weak: Weak<Inner> = Arc::downgrade(&channel.inner);
        tokio::spawn(async move {
            let reason = match writer_task.await {
                Ok(Ok(())) => "writer closed".to_string(),
                Ok(Err(e)) => format!("write failed: {e}"),
                Err(e) => format!("writer task failed: {e}"),
            };
            if let Some(inner) = weak.upgrade() {
                Channel { inner }.terminate(&reason);
            }
        });

        let reading = channel.clone();
        let max_payload_size = self.max_payload_size;
        tokio::spawn(async move {
            let reason = match reading.read_loop(reader, max_payload_size).await {
                Ok(()) => "end of stream".to_string(),
                Err(e) => {
                    tracing::error!("read loop error on channel {}: {}", reading.name(), e);
                    e.to_string()
                }
            };
            reading.terminate(&reason);
        });

        channel
    }
}

struct Inner {
    name: String,
    writer: WriterHandle,
    registry: CallableRegistry,
    pending: Mutex<PendingCalls>,
    exports: Mutex<ExportTable>,
    next_request_id: AtomicU32,
    workers: Arc<Semaphore>,
    /// `Some(reason)` once terminated.
    terminated: watch::Sender<Option<String>>,
}

/// One side of a remoting link.
///
/// Cheap to clone; all clones refer to the same link.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl Channel {
    /// Create a channel builder.
    pub fn builder(name: impl Into<String>) -> ChannelBuilder {
        ChannelBuilder::new(name)
    }

    /// Name given at build time.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Run `work` on the peer and wait for its result.
    pub async fn call<C: Callable>(
        &self,
        work: C,
    ) -> std::result::Result<C::Output, CallError<C::Error>> {
        self.call_async(work).await?.get().await
    }

    /// Submit `work` to the peer without waiting for its result.
    ///
    /// # Errors
    ///
    /// Fails if the work cannot be encoded, the channel has terminated, or
    /// the request cannot be written.
    pub async fn call_async<C: Callable>(
        &self,
        work: C,
    ) -> Result<ResponseFuture<C::Output, C::Error>> {
        let (encoded, exported) = scope::encode_for(self, &work)?;
        drop(work);

        let id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let completion = Completion::new();
        let completer =
            self.withdraw_on_fault(exported.clone(), typed_completer(completion.clone()));
        let registered = self.pending().register(id, completer);
        if let Err(e) = registered {
            self.withdraw(&exported, &e.to_string());
            return Err(e);
        }

        let request = Command::Request {
            id,
            callable: C::NAME.to_string(),
            work: Bytes::from(encoded),
        };
        if let Err(e) = self.send(request).await {
            self.pending().take(id);
            self.withdraw(&exported, &e.to_string());
            return Err(e);
        }
        Ok(ResponseFuture::new(completion))
    }

    /// Terminate the channel locally.
    ///
    /// Queued outbound commands are still written before the write half is
    /// shut down. Idempotent.
    pub fn close(&self) {
        self.terminate("channel closed");
    }

    /// Wait until the channel has terminated and return the reason.
    pub async fn join(&self) -> String {
        let mut terminated = self.inner.terminated.subscribe();
        loop {
            let reason = terminated.borrow_and_update().clone();
            if let Some(reason) = reason {
                return reason;
            }
            if terminated.changed().await.is_err() {
                return "channel dropped".to_string();
            }
        }
    }

    /// Whether the channel has terminated.
    pub fn is_closed(&self) -> bool {
        self.pending().is_closed()
    }

    /// Number of calls awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.pending().len()
    }

    /// Number of objects currently exported to the peer.
    pub fn exported_objects(&self) -> usize {
        self.exports().len()
    }

    /// Whether outbound writes are currently throttled.
    pub fn is_backpressure_active(&self) -> bool {
        self.inner.writer.is_backpressure_active()
    }

    /// Abort everything in flight and shut the link down.
    pub(crate) fn terminate(&self, reason: &str) {
        let Some(aborted) = self.pending().close(reason) else {
            return;
        };
        let invalidated = self.exports().clear();
        for object in invalidated {
            object.withdraw(reason);
        }
        self.inner.writer.shutdown();

        for completer in aborted {
            completer(Outcome::Fault(Fault::Aborted(reason.to_string())));
        }
        self.inner.terminated.send_replace(Some(reason.to_string()));
        tracing::info!("channel {} terminated: {}", self.name(), reason);
    }

    pub(crate) fn writer(&self) -> &WriterHandle {
        &self.inner.writer
    }

    pub(crate) async fn send(&self, command: Command) -> Result<()> {
        self.inner.writer.send(command.into_frame()?).await
    }

    pub(crate) fn export(&self, object: Exported) -> Result<ObjectId> {
        self.exports().export(object)
    }

    /// Withdraw objects the peer will never attach to. IDs that are no
    /// longer exported are skipped.
    pub(crate) fn withdraw(&self, oids: &[ObjectId], reason: &str) {
        if oids.is_empty() {
            return;
        }
        let removed: Vec<Exported> = {
            let mut exports = self.exports();
            oids.iter().filter_map(|oid| exports.remove(*oid)).collect()
        };
        for object in removed {
            tracing::debug!("withdrawing an exported {} on {}", object.kind(), self.name());
            object.withdraw(reason);
        }
    }

    /// Wrap `completer` so that a faulted call withdraws the objects its
    /// work exported: the peer never ran the work, or stopped running it.
    fn withdraw_on_fault(&self, exported: Vec<ObjectId>, completer: Completer) -> Completer {
        if exported.is_empty() {
            return completer;
        }
        let weak = Arc::downgrade(&self.inner);
        Box::new(move |outcome: Outcome| {
            if let (Outcome::Fault(fault), Some(inner)) = (&outcome, weak.upgrade()) {
                let reason = ChannelError::from(fault.clone()).to_string();
                Channel { inner }.withdraw(&exported, &reason);
            }
            completer(outcome);
        })
    }

    pub(crate) fn lookup_sink(&self, oid: ObjectId) -> Result<SinkHandle> {
        self.exports().sink(oid)
    }

    pub(crate) fn take_sink(&self, oid: ObjectId) -> Result<SinkHandle> {
        self.exports().take_sink(oid)
    }

    fn pending(&self) -> MutexGuard<'_, PendingCalls> {
        self.inner.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn exports(&self) -> MutexGuard<'_, ExportTable> {
        self.inner.exports.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Main read loop - reads frames and executes the commands they carry.
    async fn read_loop<R: AsyncRead + Unpin>(
        &self,
        mut reader: R,
        max_payload_size: u32,
    ) -> Result<()> {
        let mut frame_buffer = FrameBuffer::with_max_payload(max_payload_size);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut terminated = self.inner.terminated.subscribe();
        if terminated.borrow().is_some() {
            return Ok(());
        }

        loop {
            let n = tokio::select! {
                read = reader.read(&mut buf) => match read {
                    Ok(0) => return Ok(()),
                    Ok(n) => n,
                    Err(e) => return Err(e.into()),
                },
                _ = terminated.changed() => return Ok(()),
            };

            for frame in frame_buffer.push(&buf[..n])? {
                self.dispatch_frame(frame);
            }
        }
    }

    fn dispatch_frame(&self, frame: Frame) {
        let kind = frame.kind();
        let id = frame.id();
        match Command::from_frame(frame) {
            Ok(command) => command.execute(self),
            Err(e) if kind == Some(CommandKind::Request) => {
                tracing::warn!("rejecting malformed request {} on {}: {}", id, self.name(), e);
                self.spawn_reply(id, Outcome::Fault(Fault::Malformed(e.to_string())));
            }
            Err(e) => {
                tracing::warn!("dropping malformed {:?} command on {}: {}", kind, self.name(), e);
            }
        }
    }

    /// Execute an incoming request on its own task and reply.
    pub(crate) fn spawn_request(&self, id: RequestId, callable: String, work: Bytes) {
        let channel = self.clone();
        let workers = self.inner.workers.clone();
        tokio::spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                return;
            };
            tracing::trace!("executing {} (request {}) on {}", callable, id, channel.name());

            let task = channel.inner.registry.dispatch(&callable, &work, &channel);
            let outcome = match tokio::spawn(task).await {
                Ok(outcome) => outcome,
                Err(e) => Outcome::Fault(join_failure(e)),
            };
            if let Err(e) = channel.send(Command::Response { id, outcome }).await {
                tracing::error!(
                    "failed to send back a reply for request {} ({}) on {}: {}",
                    id,
                    callable,
                    channel.name(),
                    e
                );
            }
        });
    }

    fn spawn_reply(&self, id: RequestId, outcome: Outcome) {
        let channel = self.clone();
        tokio::spawn(async move {
            if let Err(e) = channel.send(Command::Response { id, outcome }).await {
                tracing::error!("failed to send back a reply for request {}: {}", id, e);
            }
        });
    }

    /// Deliver a response to its waiting caller.
    pub(crate) fn complete_request(&self, id: RequestId, outcome: Outcome) {
        let completer = self.pending().take(id);
        match completer {
            Some(complete) => complete(outcome),
            None => tracing::warn!("response for unknown request {} on {}", id, self.name()),
        }
    }

    /// Connect an exported proxy stream to the peer's sink.
    pub(crate) fn spawn_connect(&self, proxy: ObjectId, sink: ObjectId) {
        let shared = match self.exports().take_proxy(proxy) {
            Ok(shared) => shared,
            Err(e) => {
                tracing::warn!("unable to connect {} on {}: {}", proxy, self.name(), e);
                return;
            }
        };
        let target = Target::remote(self, sink);
        let name = self.inner.name.clone();
        tokio::spawn(async move {
            if let Err(e) = shared.connect(target).await {
                tracing::warn!("unable to connect {} on {}: {}", proxy, name, e);
            }
        });
    }
}

impl VirtualChannel for Channel {
    fn call<C: Callable>(
        &self,
        work: C,
    ) -> impl Future<Output = std::result::Result<C::Output, CallError<C::Error>>> + Send {
        Channel::call(self, work)
    }

    fn call_async<C: Callable>(
        &self,
        work: C,
    ) -> impl Future<Output = Result<ResponseFuture<C::Output, C::Error>>> + Send {
        Channel::call_async(self, work)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .field("registry", &self.inner.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Ping;

    impl Callable for Ping {
        const NAME: &'static str = "ping";
        type Output = String;
        type Error = ();

        async fn call(self) -> std::result::Result<String, ()> {
            Ok("pong".to_string())
        }
    }

    fn pair() -> (Channel, Channel) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ra, wa) = tokio::io::split(a);
        let (rb, wb) = tokio::io::split(b);
        (
            Channel::builder("left").register::<Ping>().build(ra, wa),
            Channel::builder("right").register::<Ping>().build(rb, wb),
        )
    }

    #[test]
    fn test_builder_configuration() {
        let builder = Channel::builder("agent")
            .register::<Ping>()
            .max_concurrent_requests(8)
            .max_payload_size(1024)
            .max_pending_frames(2048)
            .channel_capacity(512)
            .backpressure_timeout(Duration::from_secs(10));

        assert_eq!(builder.name, "agent");
        assert!(builder.registry.contains("ping"));
        assert_eq!(builder.max_concurrent_requests, 8);
        assert_eq!(builder.max_payload_size, 1024);
        assert_eq!(builder.writer_config.max_pending_frames, 2048);
        assert_eq!(builder.writer_config.channel_capacity, 512);
        assert_eq!(
            builder.writer_config.backpressure_timeout,
            Duration::from_secs(10)
        );
    }

    #[tokio::test]
    async fn test_calls_in_both_directions() {
        let (left, right) = pair();
        assert_eq!(left.call(Ping).await.unwrap(), "pong");
        assert_eq!(right.call(Ping).await.unwrap(), "pong");
        assert_eq!(left.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_close_terminates_both_sides() {
        let (left, right) = pair();
        left.close();
        left.close();

        assert_eq!(left.join().await, "channel closed");
        assert_eq!(right.join().await, "end of stream");
        assert!(left.is_closed());
        assert!(right.is_closed());

        let err = left.call(Ping).await.unwrap_err();
        assert!(err.is_aborted());
    }
}
