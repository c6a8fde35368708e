//! TCP transport.
//!
//! # Example
//!
//! ```ignore
//! use remoting::transport::AgentListener;
//!
//! let listener = AgentListener::bind("0.0.0.0:50000", "s3cr3t").await?;
//! loop {
//!     let (hello, stream) = listener.accept().await?;
//!     let (reader, writer) = stream.into_split();
//!     let channel = remoting::Channel::builder(hello.agent).build(reader, writer);
//! }
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::control::{accept_hello, Hello};
use crate::error::Result;

/// Default number of retries after a failed connect.
pub const DEFAULT_CONNECT_RETRIES: u32 = 10;

/// Default pause between connect attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(10);

/// How persistently to connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt.
    pub retries: u32,
    /// Pause before each retry.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_CONNECT_RETRIES,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Connect to `addr`, retrying per `policy`.
///
/// `on_retry` is called before each retry with the 1-based retry number and
/// the error that caused it. The last error is returned once retries are
/// exhausted.
pub async fn connect_with_retry<A, F>(addr: A, policy: RetryPolicy, mut on_retry: F) -> Result<TcpStream>
where
    A: ToSocketAddrs + Clone,
    F: FnMut(u32, &std::io::Error),
{
    let mut retry = 0;
    loop {
        match TcpStream::connect(addr.clone()).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) if retry < policy.retries => {
                retry += 1;
                tracing::debug!("connect failed ({}), retry {} of {}", e, retry, policy.retries);
                on_retry(retry, &e);
                tokio::time::sleep(policy.delay).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Master-side TCP listener that authenticates agents.
pub struct AgentListener {
    listener: TcpListener,
    secret: String,
    connections: AtomicU64,
}

impl AgentListener {
    /// Bind to `addr`. Use port 0 to choose a free port.
    pub async fn bind<A: ToSocketAddrs>(addr: A, secret: impl Into<String>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("agent listener started on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            secret: secret.into(),
            connections: AtomicU64::new(0),
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept the next connection and run the handshake on it.
    ///
    /// # Errors
    ///
    /// Fails if accepting fails or the agent is rejected; the listener
    /// itself stays usable in both cases.
    pub async fn accept(&self) -> Result<(Hello, TcpStream)> {
        let (mut stream, peer) = self.listener.accept().await?;
        let id = self.connections.fetch_add(1, Ordering::Relaxed);
        tracing::info!("accepted connection #{} from {}", id, peer);

        stream.set_nodelay(true)?;
        let hello = accept_hello(&mut stream, &self.secret).await?;
        Ok((hello, stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::send_hello;
    use crate::error::ChannelError;

    #[tokio::test]
    async fn test_accept_authenticates() {
        let listener = AgentListener::bind("127.0.0.1:0", "key").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let agent = tokio::spawn(async move {
            let mut stream = connect_with_retry(addr, RetryPolicy::default(), |_, _| {})
                .await
                .unwrap();
            send_hello(&mut stream, &Hello::new("a1", "key")).await
        });

        let (hello, _stream) = listener.accept().await.unwrap();
        assert_eq!(hello.agent, "a1");
        agent.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_retries_then_gives_up() {
        // Bind and drop to get a port nobody listens on.
        let addr = {
            let spare = TcpListener::bind("127.0.0.1:0").await.unwrap();
            spare.local_addr().unwrap()
        };
        let policy = RetryPolicy {
            retries: 2,
            delay: Duration::from_millis(1),
        };

        let mut seen = Vec::new();
        let result = connect_with_retry(addr, policy, |n, _| seen.push(n)).await;
        assert!(matches!(result, Err(ChannelError::Io(_))));
        assert_eq!(seen, [1, 2]);
    }
}
