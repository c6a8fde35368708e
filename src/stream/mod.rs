//! Streams that cross the channel.
//!
//! - [`ProxyOutputStream`] - output stream forwarding to an exported sink
//! - [`PipeReader`] - local read end fed by Chunk/Flush/Eof commands
//! - [`Pipe`] - serializable pipe that materializes its far end on the peer

mod pipe;
mod proxy;
mod sink;

pub use pipe::Pipe;
pub use proxy::ProxyOutputStream;
pub use sink::PipeReader;

pub(crate) use proxy::{ProxyShared, Target};
pub(crate) use sink::SinkHandle;

#[cfg(test)]
pub(crate) use sink::sink_pair;
