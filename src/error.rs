//! Error types for the remoting channel.
//!
//! Two layers are kept apart: [`ChannelError`] describes the link
//! (transport, codec, protocol misuse, aborted calls) and [`CallError`]
//! wraps it together with the error type a unit of work declares, so "the
//! work failed" and "the link failed" are always distinguishable.

use std::time::Duration;

use thiserror::Error;

use crate::export::ObjectId;

/// Main error type for all channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (handshake only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol error (malformed frame, unknown command kind, ...).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer has no callable registered under this name.
    #[error("No callable registered as {0:?}")]
    UnknownCallable(String),

    /// The channel is closed.
    #[error("Channel closed")]
    ConnectionClosed,

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// The channel terminated while the call was in flight.
    #[error("Request aborted: {0}")]
    RequestAborted(String),

    /// The unit of work panicked or its result could not be shipped back.
    #[error("Remote fault: {0}")]
    RemoteFault(String),

    /// `get_timeout` elapsed before a response arrived.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Write on a closed stream.
    #[error("Stream is already closed")]
    StreamClosed,

    /// A proxy stream was connected twice.
    #[error("Stream is already connected")]
    AlreadyConnected,

    /// Lookup of an object ID that is not (or no longer) exported.
    #[error("Object {0} is not exported")]
    StaleObject(ObjectId),

    /// The stream's far end was withdrawn before the peer attached to it.
    #[error("Stream has no receiver: {0}")]
    Unreceived(String),

    /// A pipe was serialized more than once.
    #[error("Pipe was already sent")]
    PipeAlreadySent,

    /// The response was already taken from its handle.
    #[error("Response already consumed")]
    Consumed,

    /// Handshake rejected or malformed.
    #[error("Handshake failed: {0}")]
    Handshake(String),
}

/// Result type alias using ChannelError.
pub type Result<T> = std::result::Result<T, ChannelError>;

/// Outcome of a call that failed.
///
/// `E` is the error type declared by the unit of work.
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// The unit of work itself returned an error.
    #[error("call failed: {0:?}")]
    Failed(E),

    /// The call could not be completed because of the channel.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl<E> CallError<E> {
    /// The work's own error, if that is what failed.
    pub fn failed(self) -> Option<E> {
        match self {
            CallError::Failed(e) => Some(e),
            CallError::Channel(_) => None,
        }
    }

    /// Whether the call was aborted by channel termination.
    pub fn is_aborted(&self) -> bool {
        matches!(self, CallError::Channel(ChannelError::RequestAborted(_)))
    }

    /// Whether the call timed out on the caller side.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CallError::Channel(ChannelError::Timeout(_)))
    }
}
