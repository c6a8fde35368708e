//! Export table: channel-local objects the peer may address by ID.
//!
//! An [`ObjectId`] is valid from `export` until the matching unexport. Any
//! later use is a stale reference and is reported as
//! [`ChannelError::StaleObject`] rather than treated as a missing value.
//! IDs are never reused within a channel.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ChannelError, Result};
use crate::stream::{ProxyShared, SinkHandle};

/// Opaque identifier of an exported object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub u32);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An object reachable from the peer.
pub(crate) enum Exported {
    /// Receiving end of a stream: target of Chunk, Flush and Eof.
    Sink(SinkHandle),
    /// Unconnected proxy stream waiting for a Connect.
    Proxy(Arc<ProxyShared>),
}

impl Exported {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Exported::Sink(_) => "sink",
            Exported::Proxy(_) => "proxy stream",
        }
    }

    /// Release an object the peer will never address again.
    ///
    /// A sink is dropped, so its reader sees a broken pipe. A proxy stream
    /// fails every later write with `reason`.
    pub(crate) fn withdraw(self, reason: &str) {
        match self {
            Exported::Sink(sink) => drop(sink),
            Exported::Proxy(proxy) => proxy.withdraw(reason),
        }
    }
}

/// Arena of exported objects indexed by [`ObjectId`].
pub(crate) struct ExportTable {
    objects: HashMap<ObjectId, Exported>,
    next_id: u32,
    closed: bool,
}

impl ExportTable {
    pub(crate) fn new() -> Self {
        Self {
            objects: HashMap::new(),
            next_id: 1,
            closed: false,
        }
    }

    /// Insert an object and return its fresh ID.
    pub(crate) fn export(&mut self, object: Exported) -> Result<ObjectId> {
        if self.closed {
            return Err(ChannelError::ConnectionClosed);
        }
        let id = ObjectId(self.next_id);
        self.next_id += 1;
        self.objects.insert(id, object);
        Ok(id)
    }

    /// Look up a sink without removing it.
    pub(crate) fn sink(&self, id: ObjectId) -> Result<SinkHandle> {
        match self.objects.get(&id) {
            Some(Exported::Sink(sink)) => Ok(sink.clone()),
            Some(other) => Err(wrong_kind(id, "sink", other)),
            None => Err(ChannelError::StaleObject(id)),
        }
    }

    /// Remove a sink. Objects of another kind are left in place.
    pub(crate) fn take_sink(&mut self, id: ObjectId) -> Result<SinkHandle> {
        match self.objects.remove(&id) {
            Some(Exported::Sink(sink)) => Ok(sink),
            Some(other) => {
                let err = wrong_kind(id, "sink", &other);
                self.objects.insert(id, other);
                Err(err)
            }
            None => Err(ChannelError::StaleObject(id)),
        }
    }

    /// Remove a proxy stream. Objects of another kind are left in place.
    pub(crate) fn take_proxy(&mut self, id: ObjectId) -> Result<Arc<ProxyShared>> {
        match self.objects.remove(&id) {
            Some(Exported::Proxy(proxy)) => Ok(proxy),
            Some(other) => {
                let err = wrong_kind(id, "proxy stream", &other);
                self.objects.insert(id, other);
                Err(err)
            }
            None => Err(ChannelError::StaleObject(id)),
        }
    }

    /// Remove an object of any kind.
    pub(crate) fn remove(&mut self, id: ObjectId) -> Option<Exported> {
        self.objects.remove(&id)
    }

    /// Invalidate every entry and refuse further exports.
    pub(crate) fn clear(&mut self) -> Vec<Exported> {
        self.closed = true;
        self.objects.drain().map(|(_, object)| object).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.objects.len()
    }
}

fn wrong_kind(id: ObjectId, expected: &str, found: &Exported) -> ChannelError {
    ChannelError::Protocol(format!(
        "object {} is a {}, expected a {}",
        id,
        found.kind(),
        expected
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::sink_pair;

    #[test]
    fn test_ids_are_not_reused() {
        let mut table = ExportTable::new();
        let (sink, _reader) = sink_pair();

        let first = table.export(Exported::Sink(sink.clone())).unwrap();
        table.take_sink(first).unwrap();
        let second = table.export(Exported::Sink(sink)).unwrap();

        assert_ne!(first, second);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_stale_id_fails_loudly() {
        let mut table = ExportTable::new();
        let (sink, _reader) = sink_pair();
        let id = table.export(Exported::Sink(sink)).unwrap();
        table.take_sink(id).unwrap();

        assert!(matches!(table.sink(id), Err(ChannelError::StaleObject(x)) if x == id));
        assert!(matches!(table.take_sink(id), Err(ChannelError::StaleObject(_))));
    }

    #[test]
    fn test_wrong_kind_is_left_in_place() {
        let mut table = ExportTable::new();
        let id = table
            .export(Exported::Proxy(Arc::new(ProxyShared::new())))
            .unwrap();

        assert!(matches!(table.take_sink(id), Err(ChannelError::Protocol(_))));
        assert_eq!(table.len(), 1);
        assert!(table.take_proxy(id).is_ok());
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_withdrawn_sink_breaks_reader() {
        let mut table = ExportTable::new();
        let (sink, mut reader) = sink_pair();
        let id = table.export(Exported::Sink(sink)).unwrap();

        table.remove(id).unwrap().withdraw("rejected");
        assert!(table.remove(id).is_none());
        assert_eq!(table.len(), 0);

        let err = reader.recv().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_clear_refuses_new_exports() {
        let mut table = ExportTable::new();
        let (sink, _reader) = sink_pair();
        table.export(Exported::Sink(sink.clone())).unwrap();

        assert_eq!(table.clear().len(), 1);
        assert_eq!(table.len(), 0);
        assert!(matches!(
            table.export(Exported::Sink(sink)),
            Err(ChannelError::ConnectionClosed)
        ));
    }
}
