//! Transport module - byte streams a channel can run on.
//!
//! Provides:
//! - TCP connect with bounded retries (agents) and an agent listener that
//!   performs the handshake (master)
//! - Unix Domain Sockets for agents on the same host

mod tcp;
#[cfg(unix)]
mod unix;

pub use tcp::{connect_with_retry, AgentListener, RetryPolicy};
#[cfg(unix)]
pub use unix::{connect_unix, generate_socket_path, SocketCleanup, UnixAgentListener};
