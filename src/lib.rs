//! # remoting
//!
//! Bidirectional remoting channel between a build master and its agents.
//!
//! Either side of a [`Channel`] can submit a serializable unit of work (a
//! [`Callable`]) to the other, which runs it and sends back the value or
//! the error. Work may carry [`Pipe`]s to stream bytes in either direction
//! while it runs. A [`LocalChannel`] offers the same contract in process.
//!
//! ## Architecture
//!
//! - **Control Plane**: one JSON line each way for the agent handshake
//! - **Data Plane**: framed binary commands (request, response, stream
//!   chunk/flush/eof, connect) on the same stream
//!
//! ## Example
//!
//! ```ignore
//! use remoting::{Callable, Channel};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Hostname;
//!
//! impl Callable for Hostname {
//!     const NAME: &'static str = "hostname";
//!     type Output = String;
//!     type Error = String;
//!
//!     async fn call(self) -> Result<String, String> {
//!         std::fs::read_to_string("/etc/hostname").map_err(|e| e.to_string())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (hello, stream) = listener.accept().await?;
//!     let (reader, writer) = stream.into_split();
//!     let channel = Channel::builder(hello.agent).build(reader, writer);
//!
//!     println!("{}", channel.call(Hostname).await?);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod control;
pub mod engine;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod stream;
pub mod transport;
pub mod writer;

mod channel;
mod command;
mod export;
mod local;
mod request;

pub use channel::{Channel, ChannelBuilder, VirtualChannel, DEFAULT_MAX_CONCURRENT_REQUESTS};
pub use command::Command;
pub use error::{CallError, ChannelError};
pub use export::ObjectId;
pub use handler::{Callable, CallableRegistry};
pub use local::LocalChannel;
pub use request::{Fault, Outcome, RequestId, ResponseFuture};
pub use stream::{Pipe, PipeReader, ProxyOutputStream};
pub use writer::{
    OutboundFrame, WriterConfig, DEFAULT_BACKPRESSURE_TIMEOUT, DEFAULT_CHANNEL_CAPACITY,
    DEFAULT_MAX_PENDING_FRAMES,
};
