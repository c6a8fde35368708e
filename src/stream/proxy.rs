//! Forwarding output stream.
//!
//! A [`ProxyOutputStream`] forwards bytes to a sink that lives on the other
//! side of a channel, or to a local sink when both ends share a process.
//! Until it is connected, writes are buffered and closing is remembered;
//! connecting flushes the buffer as one chunk and replays the close.

use std::sync::{Arc, OnceLock};

use bytes::{Bytes, BytesMut};
use tokio::sync::Mutex;

use super::sink::SinkHandle;
use crate::channel::Channel;
use crate::command::Command;
use crate::error::{ChannelError, Result};
use crate::export::ObjectId;
use crate::writer::WriterHandle;

/// Where forwarded bytes go.
pub(crate) enum Target {
    /// An exported sink on the peer.
    Remote { writer: WriterHandle, oid: ObjectId },
    /// A sink in this process.
    Local(SinkHandle),
}

impl Target {
    pub(crate) fn remote(channel: &Channel, oid: ObjectId) -> Self {
        Target::Remote {
            writer: channel.writer().clone(),
            oid,
        }
    }

    async fn chunk(&self, data: Bytes) -> Result<()> {
        match self {
            Target::Remote { writer, oid } => {
                writer.send(Command::Chunk { oid: *oid, data }.into_frame()?).await
            }
            Target::Local(sink) => sink.write(data),
        }
    }

    async fn flush(&self) -> Result<()> {
        match self {
            Target::Remote { writer, oid } => {
                writer.send(Command::Flush { oid: *oid }.into_frame()?).await
            }
            Target::Local(sink) => sink.flush(),
        }
    }

    async fn eof(&self) -> Result<()> {
        match self {
            Target::Remote { writer, oid } => {
                writer.send(Command::Eof { oid: *oid }.into_frame()?).await
            }
            Target::Local(sink) => sink.close(),
        }
    }

    fn try_eof(&self) -> Result<()> {
        match self {
            Target::Remote { writer, oid } => {
                writer.try_send(Command::Eof { oid: *oid }.into_frame()?)
            }
            Target::Local(sink) => sink.close(),
        }
    }
}

struct ProxyState {
    target: Option<Target>,
    buffer: BytesMut,
    closed: bool,
    eof_sent: bool,
}

/// State shared between the user's handle and the export table.
///
/// All operations are serialized by one async mutex, which keeps the bytes
/// of concurrent writers in call order.
pub(crate) struct ProxyShared {
    state: Mutex<ProxyState>,
    /// Set when the peer can no longer attach; every later operation fails.
    withdrawn: OnceLock<String>,
}

impl ProxyShared {
    pub(crate) fn new() -> Self {
        Self::with_target(None)
    }

    pub(crate) fn connected(target: Target) -> Self {
        Self::with_target(Some(target))
    }

    fn with_target(target: Option<Target>) -> Self {
        Self {
            state: Mutex::new(ProxyState {
                target,
                buffer: BytesMut::new(),
                closed: false,
                eof_sent: false,
            }),
            withdrawn: OnceLock::new(),
        }
    }

    /// Fail all further writes with `reason`. Buffered bytes are discarded.
    pub(crate) fn withdraw(&self, reason: &str) {
        if self.withdrawn.set(reason.to_string()).is_ok() {
            if let Ok(mut state) = self.state.try_lock() {
                state.buffer.clear();
            }
        }
    }

    fn check_withdrawn(&self) -> Result<()> {
        match self.withdrawn.get() {
            Some(reason) => Err(ChannelError::Unreceived(reason.clone())),
            None => Ok(()),
        }
    }

    /// Attach the stream to its destination.
    pub(crate) async fn connect(&self, target: Target) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.target.is_some() {
            return Err(ChannelError::AlreadyConnected);
        }
        if !state.buffer.is_empty() {
            let buffered = state.buffer.split().freeze();
            target.chunk(buffered).await?;
        }
        if state.closed && !state.eof_sent {
            state.eof_sent = true;
            target.eof().await?;
        }
        state.target = Some(target);
        Ok(())
    }

    async fn write(&self, data: Bytes) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(ChannelError::StreamClosed);
        }
        self.check_withdrawn()?;
        if let Some(target) = &state.target {
            return target.chunk(data).await;
        }
        state.buffer.extend_from_slice(&data);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let state = self.state.lock().await;
        self.check_withdrawn()?;
        match &state.target {
            Some(target) if !state.closed => target.flush().await,
            _ => Ok(()),
        }
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.closed = true;
        if state.eof_sent {
            return Ok(());
        }
        self.check_withdrawn()?;
        if let Some(target) = &state.target {
            let result = target.eof().await;
            state.eof_sent = true;
            return result;
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.state.lock().await.target.is_some()
    }

    /// Best-effort close without awaiting, for use outside a runtime.
    fn close_now(&self) {
        let Ok(mut state) = self.state.try_lock() else {
            return;
        };
        state.closed = true;
        if state.eof_sent {
            return;
        }
        if let Some(target) = &state.target {
            if let Err(e) = target.try_eof() {
                tracing::debug!("could not send end of stream on drop: {}", e);
            }
            state.eof_sent = true;
        }
    }

    fn is_closed_now(&self) -> bool {
        self.state.try_lock().map(|s| s.closed).unwrap_or(false)
    }
}

/// Output stream that forwards everything written to it.
///
/// Obtained from [`Pipe::local_to_remote`](super::Pipe::local_to_remote),
/// from [`Pipe::into_writer`](super::Pipe::into_writer), or by connecting a
/// fresh stream to an object ID the peer exported. Dropping an unclosed
/// stream closes it.
pub struct ProxyOutputStream {
    shared: Arc<ProxyShared>,
}

impl ProxyOutputStream {
    /// Create an unconnected stream. Writes are buffered until
    /// [`connect`](Self::connect).
    pub fn new() -> Self {
        Self::from_shared(Arc::new(ProxyShared::new()))
    }

    /// Create a stream already forwarding to the peer's object `oid`.
    pub fn connected(channel: &Channel, oid: ObjectId) -> Self {
        Self::from_shared(Arc::new(ProxyShared::connected(Target::remote(channel, oid))))
    }

    pub(crate) fn from_shared(shared: Arc<ProxyShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<ProxyShared> {
        &self.shared
    }

    /// Attach to the peer's object `oid`, flushing anything buffered.
    ///
    /// # Errors
    ///
    /// [`ChannelError::AlreadyConnected`] on a second connect.
    pub async fn connect(&self, channel: &Channel, oid: ObjectId) -> Result<()> {
        self.shared.connect(Target::remote(channel, oid)).await
    }

    /// Write bytes. Each write on a connected stream becomes one chunk.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.write_bytes(Bytes::copy_from_slice(data)).await
    }

    /// Write an owned buffer without copying.
    pub async fn write_bytes(&self, data: Bytes) -> Result<()> {
        self.shared.write(data).await
    }

    /// Forward a flush. A no-op while unconnected.
    pub async fn flush(&self) -> Result<()> {
        self.shared.flush().await
    }

    /// Close the stream. End of stream is sent exactly once, now if
    /// connected or at connect time otherwise.
    pub async fn close(&self) -> Result<()> {
        self.shared.close().await
    }

    /// Whether the stream has a destination yet.
    pub async fn is_connected(&self) -> bool {
        self.shared.is_connected().await
    }
}

impl Default for ProxyOutputStream {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProxyOutputStream {
    fn drop(&mut self) {
        if self.shared.is_closed_now() {
            return;
        }
        let shared = self.shared.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = shared.close().await {
                        tracing::debug!("close on drop failed: {}", e);
                    }
                });
            }
            Err(_) => shared.close_now(),
        }
    }
}

impl std::fmt::Debug for ProxyOutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyOutputStream").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::sink::{sink_pair, SinkOp};

    fn local_stream() -> (ProxyOutputStream, crate::stream::PipeReader) {
        let (sink, reader) = sink_pair();
        let stream =
            ProxyOutputStream::from_shared(Arc::new(ProxyShared::connected(Target::Local(sink))));
        (stream, reader)
    }

    #[tokio::test]
    async fn test_connected_writes_are_chunks() {
        let (stream, mut reader) = local_stream();
        stream.write(b"one").await.unwrap();
        stream.write(b"two").await.unwrap();
        stream.close().await.unwrap();

        assert_eq!(reader.recv().await.unwrap().unwrap(), "one");
        assert_eq!(reader.recv().await.unwrap().unwrap(), "two");
        assert!(reader.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_buffered_until_connect() {
        let stream = ProxyOutputStream::new();
        stream.write(b"ab").await.unwrap();
        stream.write(b"cd").await.unwrap();
        stream.flush().await.unwrap();
        assert!(!stream.is_connected().await);

        let (sink, mut reader) = sink_pair();
        stream.shared().connect(Target::Local(sink)).await.unwrap();
        stream.write(b"ef").await.unwrap();
        stream.close().await.unwrap();

        assert_eq!(reader.recv().await.unwrap().unwrap(), "abcd");
        assert_eq!(reader.recv().await.unwrap().unwrap(), "ef");
        assert!(reader.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_before_connect_replayed() {
        let stream = ProxyOutputStream::new();
        stream.write(b"early").await.unwrap();
        stream.close().await.unwrap();

        let (sink, mut reader) = sink_pair();
        stream.shared().connect(Target::Local(sink)).await.unwrap();

        assert_eq!(reader.recv().await.unwrap().unwrap(), "early");
        assert!(reader.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (stream, _reader) = local_stream();
        stream.close().await.unwrap();
        assert!(matches!(
            stream.write(b"x").await,
            Err(ChannelError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn test_double_close_single_eof() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let stream = ProxyOutputStream::from_shared(Arc::new(ProxyShared::connected(
            Target::Local(SinkHandle { tx }),
        )));
        stream.close().await.unwrap();
        stream.close().await.unwrap();
        drop(stream);

        let mut closes = 0;
        while let Some(op) = rx.recv().await {
            if matches!(op, SinkOp::Close) {
                closes += 1;
            }
        }
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn test_withdrawn_stream_fails_writes() {
        let stream = ProxyOutputStream::new();
        stream.write(b"lost").await.unwrap();
        stream.shared().withdraw("call rejected");

        assert!(matches!(
            stream.write(b"more").await,
            Err(ChannelError::Unreceived(reason)) if reason == "call rejected"
        ));
        assert!(matches!(
            stream.flush().await,
            Err(ChannelError::Unreceived(_))
        ));
        assert!(matches!(
            stream.close().await,
            Err(ChannelError::Unreceived(_))
        ));
    }

    #[tokio::test]
    async fn test_second_connect_rejected() {
        let (stream, _reader) = local_stream();
        let (other, _other_reader) = sink_pair();
        assert!(matches!(
            stream.shared().connect(Target::Local(other)).await,
            Err(ChannelError::AlreadyConnected)
        ));
    }

    #[tokio::test]
    async fn test_drop_closes() {
        let (stream, mut reader) = local_stream();
        stream.write(b"bye").await.unwrap();
        drop(stream);

        assert_eq!(reader.recv().await.unwrap().unwrap(), "bye");
        assert!(reader.recv().await.is_none());
    }
}
