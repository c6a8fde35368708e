//! Agent engine: keeps an agent connected to its master.
//!
//! The engine connects over TCP (retrying while the master is unreachable),
//! introduces itself with the handshake, runs a [`Channel`] until it
//! terminates, then waits and connects again. Progress is reported to an
//! [`EngineListener`].
//!
//! # Example
//!
//! ```ignore
//! use remoting::engine::{Engine, EngineConfig, TracingListener};
//!
//! let config = EngineConfig::new("master.example.com", 50000, "agent-1", "s3cr3t");
//! Engine::new(config, TracingListener)
//!     .configure(|builder| builder.register::<Checkout>().register::<RunBuild>())
//!     .run()
//!     .await?;
//! ```

use std::time::Duration;

use crate::channel::{Channel, ChannelBuilder};
use crate::control::{send_hello, Hello};
use crate::error::{ChannelError, Result};
use crate::transport::{connect_with_retry, RetryPolicy};

/// Default pause before reconnecting after a session ends.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Receives engine progress.
pub trait EngineListener: Send + Sync {
    /// Human readable status change.
    fn status(&self, message: &str);

    /// Fatal error; the engine stops after reporting it.
    fn error(&self, error: &ChannelError);

    /// A session's channel is up.
    fn connected(&self, _channel: &Channel) {}
}

/// Listener that logs through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

impl EngineListener for TracingListener {
    fn status(&self, message: &str) {
        tracing::info!("{}", message);
    }

    fn error(&self, error: &ChannelError) {
        tracing::error!("agent engine stopped: {}", error);
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Master host name or address.
    pub host: String,
    /// Master agent port.
    pub port: u16,
    /// Name this agent announces.
    pub agent_name: String,
    /// Shared secret expected by the master.
    pub secret: String,
    /// Connect retries within one session.
    pub retry: RetryPolicy,
    /// Pause between sessions.
    pub reconnect_delay: Duration,
    /// Stop after this many sessions. `None` runs forever.
    pub max_sessions: Option<u32>,
}

impl EngineConfig {
    /// Configuration with default retry and reconnect behavior.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        agent_name: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            agent_name: agent_name.into(),
            secret: secret.into(),
            retry: RetryPolicy::default(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_sessions: None,
        }
    }
}

type Configure = Box<dyn Fn(ChannelBuilder) -> ChannelBuilder + Send + Sync>;

/// Reconnecting agent.
pub struct Engine<L> {
    config: EngineConfig,
    listener: L,
    configure: Configure,
}

impl<L: EngineListener> Engine<L> {
    /// Create an engine reporting to `listener`.
    pub fn new(config: EngineConfig, listener: L) -> Self {
        Self {
            config,
            listener,
            configure: Box::new(|builder| builder),
        }
    }

    /// Customize the channel built for every session, typically to register
    /// the callables the master may run here.
    pub fn configure<F>(mut self, configure: F) -> Self
    where
        F: Fn(ChannelBuilder) -> ChannelBuilder + Send + Sync + 'static,
    {
        self.configure = Box::new(configure);
        self
    }

    /// Listener given at construction.
    pub fn listener(&self) -> &L {
        &self.listener
    }

    /// Run sessions until `max_sessions` is reached or an error occurs.
    ///
    /// # Errors
    ///
    /// Connect retries exhausted or the handshake rejected. The error is
    /// reported to the listener before it is returned.
    pub async fn run(&self) -> Result<()> {
        let mut sessions = 0u32;
        loop {
            if let Err(e) = self.run_session().await {
                self.listener.error(&e);
                return Err(e);
            }
            sessions += 1;
            if self.config.max_sessions.is_some_and(|max| sessions >= max) {
                return Ok(());
            }
            tokio::time::sleep(self.config.reconnect_delay).await;
        }
    }

    /// Run one session and return the channel's termination reason.
    pub async fn run_session(&self) -> Result<String> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let connecting = format!("Connecting to {}", addr);
        self.listener.status(&connecting);

        let mut stream = connect_with_retry(addr.as_str(), self.config.retry, |retry, _| {
            self.listener
                .status(&format!("{} (retrying:{})", connecting, retry));
        })
        .await?;

        self.listener.status("Handshaking");
        let hello = Hello::new(&self.config.agent_name, &self.config.secret);
        send_hello(&mut stream, &hello).await?;

        let (reader, writer) = stream.into_split();
        let builder = (self.configure)(Channel::builder(self.config.agent_name.clone()));
        let channel = builder.build(reader, writer);
        self.listener.status("Connected");
        self.listener.connected(&channel);

        let reason = channel.join().await;
        self.listener.status("Terminated");
        Ok(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use serde::{Deserialize, Serialize};

    use crate::handler::Callable;
    use crate::transport::AgentListener;

    #[derive(Default)]
    struct Recorder {
        statuses: Mutex<Vec<String>>,
        errors: Mutex<Vec<String>>,
    }

    impl EngineListener for Recorder {
        fn status(&self, message: &str) {
            self.statuses.lock().unwrap().push(message.to_string());
        }

        fn error(&self, error: &ChannelError) {
            self.errors.lock().unwrap().push(error.to_string());
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Whoami;

    impl Callable for Whoami {
        const NAME: &'static str = "whoami";
        type Output = String;
        type Error = ();

        async fn call(self) -> std::result::Result<String, ()> {
            Ok("agent".to_string())
        }
    }

    fn config(port: u16, secret: &str) -> EngineConfig {
        let mut config = EngineConfig::new("127.0.0.1", port, "a1", secret);
        config.max_sessions = Some(1);
        config.retry = RetryPolicy {
            retries: 0,
            delay: Duration::from_millis(1),
        };
        config
    }

    #[tokio::test]
    async fn test_session_reports_progress() {
        let master = AgentListener::bind("127.0.0.1:0", "key").await.unwrap();
        let port = master.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (hello, stream) = master.accept().await.unwrap();
            let (reader, writer) = stream.into_split();
            let channel = Channel::builder("master").build(reader, writer);
            let answer = channel.call(Whoami).await.unwrap();
            channel.close();
            (hello.agent, answer)
        });

        let engine = Engine::new(config(port, "key"), Recorder::default())
            .configure(|builder| builder.register::<Whoami>());
        engine.run().await.unwrap();

        assert_eq!(
            server.await.unwrap(),
            ("a1".to_string(), "agent".to_string())
        );
        let statuses = engine.listener().statuses.lock().unwrap().clone();
        assert_eq!(
            statuses,
            [
                format!("Connecting to 127.0.0.1:{}", port),
                "Handshaking".to_string(),
                "Connected".to_string(),
                "Terminated".to_string(),
            ]
        );
        assert!(engine.listener().errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejection_is_reported() {
        let master = AgentListener::bind("127.0.0.1:0", "key").await.unwrap();
        let port = master.local_addr().unwrap().port();
        let server = tokio::spawn(async move { master.accept().await.is_err() });

        let engine = Engine::new(config(port, "wrong"), Recorder::default());
        let err = engine.run().await.unwrap_err();

        assert!(matches!(err, ChannelError::Handshake(_)));
        assert_eq!(engine.listener().errors.lock().unwrap().len(), 1);
        assert!(server.await.unwrap());
    }
}
