//! Unix Domain Socket transport for agents on the master's host.
//!
//! # Example
//!
//! ```ignore
//! use remoting::transport::{generate_socket_path, UnixAgentListener};
//!
//! let path = generate_socket_path();
//! let listener = UnixAgentListener::bind(&path, "s3cr3t").await?;
//! let (hello, stream) = listener.accept().await?;
//! ```

use std::path::Path;

use tokio::net::{UnixListener, UnixStream};

use crate::control::{accept_hello, send_hello, Hello};
use crate::error::Result;

/// Generate a unique socket path for this process.
///
/// Format: `/tmp/remoting-{pid}-{random}.sock`
pub fn generate_socket_path() -> String {
    format!("/tmp/remoting-{}-{:x}.sock", std::process::id(), rand_u64())
}

/// Simple random u64 using system time and process ID.
fn rand_u64() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let pid = std::process::id() as u64;
    nanos.wrapping_mul(0x517cc1b727220a95) ^ pid
}

/// Cleanup guard that removes the socket file on drop.
pub struct SocketCleanup {
    path: String,
}

impl Drop for SocketCleanup {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Master-side Unix socket listener that authenticates agents.
pub struct UnixAgentListener {
    listener: UnixListener,
    secret: String,
    cleanup: SocketCleanup,
}

impl UnixAgentListener {
    /// Bind to a Unix socket path.
    ///
    /// Removes any existing socket file at the path before binding; the
    /// file is removed again when the listener is dropped.
    pub async fn bind(path: &str, secret: impl Into<String>) -> Result<Self> {
        if Path::new(path).exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        Ok(Self {
            listener,
            secret: secret.into(),
            cleanup: SocketCleanup {
                path: path.to_string(),
            },
        })
    }

    /// Socket path.
    pub fn path(&self) -> &str {
        &self.cleanup.path
    }

    /// Accept the next connection and run the handshake on it.
    pub async fn accept(&self) -> Result<(Hello, UnixStream)> {
        let (mut stream, _addr) = self.listener.accept().await?;
        let hello = accept_hello(&mut stream, &self.secret).await?;
        Ok((hello, stream))
    }
}

/// Agent side: connect to `path` and introduce ourselves.
pub async fn connect_unix(path: &str, hello: &Hello) -> Result<UnixStream> {
    let mut stream = UnixStream::connect(path).await?;
    send_hello(&mut stream, hello).await?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_socket_path_format() {
        let path = generate_socket_path();
        assert!(path.starts_with("/tmp/remoting-"));
        assert!(path.ends_with(".sock"));
        assert!(path.contains(&std::process::id().to_string()));
    }

    #[tokio::test]
    async fn test_socket_removed_on_drop() {
        let path = generate_socket_path();
        let listener = UnixAgentListener::bind(&path, "key").await.unwrap();
        assert!(Path::new(listener.path()).exists());
        drop(listener);
        assert!(!Path::new(&path).exists());
    }

    #[tokio::test]
    async fn test_connect_and_accept() {
        let path = generate_socket_path();
        let listener = UnixAgentListener::bind(&path, "key").await.unwrap();

        let agent_path = path.clone();
        let agent =
            tokio::spawn(async move { connect_unix(&agent_path, &Hello::new("local", "key")).await });

        let (hello, _stream) = listener.accept().await.unwrap();
        assert_eq!(hello.agent, "local");
        assert!(agent.await.unwrap().is_ok());
    }
}
