//! Channel-bound (de)serialization.
//!
//! Values that reference channel-local state, such as a [`Pipe`], need to
//! know which channel they are being written to or read from: serializing
//! exports an object into that channel's table, deserializing wires the
//! reconstructed half back to the peer. Encoding and decoding of work items
//! therefore runs inside a task-local [`WireScope`] naming the channel.
//!
//! Commands that deserialization wants to send (the pipe `Connect`) cannot be
//! sent from inside a synchronous serde callback, so they are collected and
//! handed back to the caller, who sends them before running the work.
//!
//! [`Pipe`]: crate::stream::Pipe

use std::cell::RefCell;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::MsgPackCodec;
use crate::channel::Channel;
use crate::command::Command;
use crate::error::Result;
use crate::export::{Exported, ObjectId};

tokio::task_local! {
    static WIRE_SCOPE: WireScope;
}

/// The channel a value is currently being (de)serialized for.
pub(crate) struct WireScope {
    channel: Channel,
    deferred: Rc<RefCell<Vec<Command>>>,
    exported: Rc<RefCell<Vec<ObjectId>>>,
}

impl WireScope {
    fn new(channel: &Channel) -> Self {
        Self {
            channel: channel.clone(),
            deferred: Rc::new(RefCell::new(Vec::new())),
            exported: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub(crate) fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Export `object` on the scope's channel, remembering its ID.
    pub(crate) fn export(&self, object: Exported) -> Result<ObjectId> {
        let oid = self.channel.export(object)?;
        self.exported.borrow_mut().push(oid);
        Ok(oid)
    }

    /// Queue a command to be sent once decoding is done.
    pub(crate) fn defer(&self, command: Command) {
        self.deferred.borrow_mut().push(command);
    }

    /// Run `f` against the active scope, if any.
    pub(crate) fn with_current<R>(f: impl FnOnce(&WireScope) -> R) -> Option<R> {
        WIRE_SCOPE.try_with(f).ok()
    }
}

/// Encode `value` for transmission over `channel`.
///
/// Returns the bytes and the IDs of the objects exported along the way. If
/// encoding fails, those objects are withdrawn again.
pub(crate) fn encode_for<T: Serialize + ?Sized>(
    channel: &Channel,
    value: &T,
) -> Result<(Vec<u8>, Vec<ObjectId>)> {
    let scope = WireScope::new(channel);
    let exported = scope.exported.clone();
    let encoded = WIRE_SCOPE.sync_scope(scope, || MsgPackCodec::encode(value));
    let exported = exported.take();
    match encoded {
        Ok(bytes) => Ok((bytes, exported)),
        Err(e) => {
            channel.withdraw(&exported, &e.to_string());
            Err(e)
        }
    }
}

/// Decode a value received on `channel`.
///
/// Returns the value together with the commands its deserialization queued.
/// If decoding fails, objects exported along the way are withdrawn.
pub(crate) fn decode_from<T: DeserializeOwned>(
    channel: &Channel,
    bytes: &[u8],
) -> Result<(T, Vec<Command>)> {
    let scope = WireScope::new(channel);
    let deferred = scope.deferred.clone();
    let exported = scope.exported.clone();
    match WIRE_SCOPE.sync_scope(scope, || MsgPackCodec::decode(bytes)) {
        Ok(value) => Ok((value, deferred.take())),
        Err(e) => {
            channel.withdraw(&exported.take(), &e.to_string());
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Pipe;

    #[derive(Serialize)]
    struct ForeignPipe {
        peer_writes: bool,
        oid: u32,
    }

    fn channel() -> Channel {
        let (a, _b) = tokio::io::duplex(1024);
        let (r, w) = tokio::io::split(a);
        Channel::builder("scope").build(r, w)
    }

    #[tokio::test]
    async fn test_encode_reports_exports() {
        let channel = channel();
        let (_reader, pipe) = Pipe::remote_to_local();

        let (_bytes, exported) = encode_for(&channel, &pipe).unwrap();
        assert_eq!(exported.len(), 1);
        assert_eq!(channel.exported_objects(), 1);
    }

    #[tokio::test]
    async fn test_failed_decode_withdraws_attached_pipes() {
        let channel = channel();
        let bytes = MsgPackCodec::encode(&(
            ForeignPipe {
                peer_writes: false,
                oid: 7,
            },
            "not a number",
        ))
        .unwrap();

        let result = decode_from::<(Pipe, u32)>(&channel, &bytes);
        assert!(result.is_err());
        assert_eq!(channel.exported_objects(), 0);
    }
}
