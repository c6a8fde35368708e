//! Codec module - serialization/deserialization for payloads.
//!
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde`, used for request and
//!   response payloads
//! - channel-bound encoding, used for work items that may carry pipes
//!
//! Chunk payloads are raw bytes and bypass the codec entirely.

mod msgpack;
pub(crate) mod scope;

pub use msgpack::MsgPackCodec;
