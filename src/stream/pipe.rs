//! Unidirectional byte pipe that can travel inside a unit of work.
//!
//! A [`Pipe`] is created on one side with one end kept locally and the other
//! end represented by the `Pipe` value itself. Sending the value as part of a
//! call materializes the far end on the peer:
//!
//! - [`Pipe::remote_to_local`]: the peer writes, this side reads. The local
//!   sink is exported and the peer's half becomes a connected
//!   [`ProxyOutputStream`].
//! - [`Pipe::local_to_remote`]: this side writes, the peer reads. The local
//!   stream is exported unconnected; the peer creates and exports a sink and
//!   sends back a `Connect` naming both IDs, after which buffered and future
//!   writes flow to the peer.
//!
//! A pipe may be sent once. A pipe that is never sent can still be used in
//! process with [`Pipe::into_reader`] / [`Pipe::into_writer`], which is how
//! work behaves identically on a [`LocalChannel`](crate::LocalChannel).

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{de, ser, Deserialize, Deserializer, Serialize, Serializer};

use super::proxy::{ProxyOutputStream, ProxyShared, Target};
use super::sink::{sink_pair, PipeReader, SinkHandle};
use crate::codec::scope::WireScope;
use crate::command::Command;
use crate::error::{ChannelError, Result};
use crate::export::{Exported, ObjectId};

enum PipeState {
    /// Created by `remote_to_local`; holds the local reader's sink.
    RemoteWrites(Option<SinkHandle>),
    /// Created by `local_to_remote`; holds the local writer.
    LocalWrites(Option<Arc<ProxyShared>>),
    /// Reconstructed on the receiving side, read end.
    Reader(Option<PipeReader>),
    /// Reconstructed on the receiving side, write end.
    Writer(Option<ProxyOutputStream>),
}

/// Wire form: which side writes, and the object the receiver must address.
#[derive(Serialize, Deserialize)]
struct PipeWire {
    peer_writes: bool,
    oid: ObjectId,
}

/// A pipe end that can be shipped to the peer.
pub struct Pipe {
    state: Mutex<PipeState>,
}

impl Pipe {
    fn with_state(state: PipeState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pipe whose writer is on the peer. Returns the local read end.
    pub fn remote_to_local() -> (PipeReader, Pipe) {
        let (sink, reader) = sink_pair();
        (reader, Pipe::with_state(PipeState::RemoteWrites(Some(sink))))
    }

    /// Pipe whose reader is on the peer. Returns the local write end.
    ///
    /// Writes made before the peer connects are buffered.
    pub fn local_to_remote() -> (ProxyOutputStream, Pipe) {
        let writer = ProxyOutputStream::new();
        let shared = writer.shared().clone();
        (writer, Pipe::with_state(PipeState::LocalWrites(Some(shared))))
    }

    /// Take the read end.
    ///
    /// On the receiving side of a `local_to_remote` pipe this is the end the
    /// sender writes to. On an unsent `local_to_remote` pipe the local writer
    /// is wired straight to the returned reader.
    pub async fn into_reader(self) -> Result<PipeReader> {
        let state = self.state.into_inner().unwrap_or_else(|e| e.into_inner());
        match state {
            PipeState::Reader(Some(reader)) => Ok(reader),
            PipeState::LocalWrites(Some(proxy)) => {
                let (sink, reader) = sink_pair();
                proxy.connect(Target::Local(sink)).await?;
                Ok(reader)
            }
            PipeState::Reader(None) | PipeState::LocalWrites(None) => {
                Err(ChannelError::PipeAlreadySent)
            }
            PipeState::RemoteWrites(_) | PipeState::Writer(_) => Err(ChannelError::Protocol(
                "pipe has no read end on this side".to_string(),
            )),
        }
    }

    /// Take the write end.
    ///
    /// On the receiving side of a `remote_to_local` pipe this writes to the
    /// sender's reader. On an unsent `remote_to_local` pipe it writes to the
    /// local reader directly.
    pub async fn into_writer(self) -> Result<ProxyOutputStream> {
        let state = self.state.into_inner().unwrap_or_else(|e| e.into_inner());
        match state {
            PipeState::Writer(Some(writer)) => Ok(writer),
            PipeState::RemoteWrites(Some(sink)) => Ok(ProxyOutputStream::from_shared(Arc::new(
                ProxyShared::connected(Target::Local(sink)),
            ))),
            PipeState::Writer(None) | PipeState::RemoteWrites(None) => {
                Err(ChannelError::PipeAlreadySent)
            }
            PipeState::LocalWrites(_) | PipeState::Reader(_) => Err(ChannelError::Protocol(
                "pipe has no write end on this side".to_string(),
            )),
        }
    }

    fn export(&self, scope: &WireScope) -> Result<PipeWire> {
        let mut state = self.lock();
        match &mut *state {
            PipeState::RemoteWrites(sink) => {
                let sink = sink.take().ok_or(ChannelError::PipeAlreadySent)?;
                let oid = scope.export(Exported::Sink(sink))?;
                Ok(PipeWire {
                    peer_writes: true,
                    oid,
                })
            }
            PipeState::LocalWrites(proxy) => {
                let proxy = proxy.take().ok_or(ChannelError::PipeAlreadySent)?;
                let oid = scope.export(Exported::Proxy(proxy))?;
                Ok(PipeWire {
                    peer_writes: false,
                    oid,
                })
            }
            PipeState::Reader(_) | PipeState::Writer(_) => Err(ChannelError::PipeAlreadySent),
        }
    }

    fn attach(scope: &WireScope, wire: PipeWire) -> Result<Pipe> {
        let channel = scope.channel();
        if wire.peer_writes {
            let writer = ProxyOutputStream::connected(channel, wire.oid);
            return Ok(Pipe::with_state(PipeState::Writer(Some(writer))));
        }
        let (sink, reader) = sink_pair();
        let oid = scope.export(Exported::Sink(sink))?;
        scope.defer(Command::Connect {
            proxy: wire.oid,
            sink: oid,
        });
        Ok(Pipe::with_state(PipeState::Reader(Some(reader))))
    }
}

impl Serialize for Pipe {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let wire = WireScope::with_current(|scope| self.export(scope))
            .ok_or_else(|| ser::Error::custom("pipe can only be sent through a channel"))?
            .map_err(ser::Error::custom)?;
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Pipe {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let wire = PipeWire::deserialize(deserializer)?;
        WireScope::with_current(|scope| Pipe::attach(scope, wire))
            .ok_or_else(|| de::Error::custom("pipe can only be received through a channel"))?
            .map_err(de::Error::custom)
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let side = match &*self.lock() {
            PipeState::RemoteWrites(_) => "remote-to-local",
            PipeState::LocalWrites(_) => "local-to-remote",
            PipeState::Reader(_) => "reader",
            PipeState::Writer(_) => "writer",
        };
        f.debug_struct("Pipe").field("side", &side).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::codec::{scope, MsgPackCodec};

    #[tokio::test]
    async fn test_unsent_remote_to_local_wires_locally() {
        let (mut reader, pipe) = Pipe::remote_to_local();
        let writer = pipe.into_writer().await.unwrap();
        writer.write(b"in process").await.unwrap();
        writer.close().await.unwrap();

        assert_eq!(reader.read_all().await.unwrap(), b"in process");
    }

    #[tokio::test]
    async fn test_unsent_local_to_remote_wires_locally() {
        let (writer, pipe) = Pipe::local_to_remote();
        writer.write(b"before").await.unwrap();
        let mut reader = pipe.into_reader().await.unwrap();
        writer.write(b" after").await.unwrap();
        writer.close().await.unwrap();

        assert_eq!(reader.read_all().await.unwrap(), b"before after");
    }

    #[tokio::test]
    async fn test_wrong_end_rejected() {
        let (_reader, pipe) = Pipe::remote_to_local();
        assert!(matches!(
            pipe.into_reader().await,
            Err(ChannelError::Protocol(_))
        ));
    }

    #[test]
    fn test_serialize_outside_channel_fails() {
        let (_reader, pipe) = Pipe::remote_to_local();
        assert!(MsgPackCodec::encode(&pipe).is_err());
    }

    #[tokio::test]
    async fn test_second_send_fails() {
        let (a, _b) = tokio::io::duplex(1024);
        let (r, w) = tokio::io::split(a);
        let channel = Channel::builder("test").build(r, w);
        let (mut reader, pipe) = Pipe::remote_to_local();

        let err = scope::encode_for(&channel, &(&pipe, &pipe)).unwrap_err();
        assert!(err.to_string().contains("already sent"), "{err}");
        assert_eq!(channel.exported_objects(), 0);

        let broken = reader.recv().await.unwrap().unwrap_err();
        assert_eq!(broken.kind(), std::io::ErrorKind::BrokenPipe);
    }
}
