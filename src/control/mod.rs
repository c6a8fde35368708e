//! Control plane module - connection handshake.
//!
//! The control plane exchanges one JSON line in each direction before the
//! binary channel starts on the same stream.
//!
//! # Workflow
//!
//! 1. Agent connects to the master
//! 2. Agent sends a [`Hello`] line (protocol, version, agent name, secret)
//! 3. Master validates it and answers with a [`HelloReply`] line
//! 4. On acceptance both sides build a [`Channel`](crate::Channel) on the stream
//!
//! # Example
//!
//! ```ignore
//! use remoting::control::{send_hello, Hello};
//!
//! let mut stream = tokio::net::TcpStream::connect("master:50000").await?;
//! send_hello(&mut stream, &Hello::new("agent-1", "s3cr3t")).await?;
//! let (reader, writer) = stream.into_split();
//! let channel = remoting::Channel::builder("agent-1").build(reader, writer);
//! ```

mod handshake;

pub use handshake::{
    accept_hello, read_line, send_hello, write_line, Hello, HelloReply, MAX_LINE_LENGTH,
    PROTOCOL_NAME, PROTOCOL_VERSION,
};
