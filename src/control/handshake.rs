//! Handshake lines.
//!
//! Lines are read one byte at a time so nothing past the newline is
//! consumed: the first binary frame may follow the reply immediately.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ChannelError, Result};

/// Protocol name announced by agents.
pub const PROTOCOL_NAME: &str = "remoting";

/// Protocol version string.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Longest accepted handshake line, newline excluded.
pub const MAX_LINE_LENGTH: usize = 4096;

/// First line sent by a connecting agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Always [`PROTOCOL_NAME`].
    pub protocol: String,
    /// Sender's [`PROTOCOL_VERSION`].
    pub version: String,
    /// Name the agent registers under.
    pub agent: String,
    /// Shared secret proving the agent may connect.
    pub secret: String,
}

impl Hello {
    /// Hello for the current protocol.
    pub fn new(agent: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            protocol: PROTOCOL_NAME.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            agent: agent.into(),
            secret: secret.into(),
        }
    }
}

/// Master's answer to a [`Hello`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum HelloReply {
    /// The binary channel starts right after this line.
    Accepted,
    /// The master closes the connection after this line.
    Rejected {
        /// Human readable reason.
        reason: String,
    },
}

/// Write `line` followed by a single `\n` and flush.
pub async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Read one `\n`-terminated line without reading past it.
///
/// # Errors
///
/// Fails on end of stream before the newline, on lines longer than
/// [`MAX_LINE_LENGTH`], and on invalid UTF-8.
pub async fn read_line<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    let mut line = Vec::new();
    loop {
        let byte = reader.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        if line.len() == MAX_LINE_LENGTH {
            return Err(ChannelError::Handshake("handshake line too long".to_string()));
        }
        line.push(byte);
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line)
        .map_err(|_| ChannelError::Handshake("handshake line is not UTF-8".to_string()))
}

/// Agent side: send `hello` and wait for the master's verdict.
pub async fn send_hello<S>(stream: &mut S, hello: &Hello) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_line(stream, &serde_json::to_string(hello)?).await?;
    let reply: HelloReply = serde_json::from_str(&read_line(stream).await?)?;
    match reply {
        HelloReply::Accepted => Ok(()),
        HelloReply::Rejected { reason } => Err(ChannelError::Handshake(reason)),
    }
}

/// Master side: read a hello, check it against `secret`, and answer.
///
/// Returns the accepted hello. A rejected agent has already been told why.
pub async fn accept_hello<S>(stream: &mut S, secret: &str) -> Result<Hello>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = read_line(stream).await?;
    let verdict = match serde_json::from_str::<Hello>(&line) {
        Err(e) => Err(format!("malformed hello: {e}")),
        Ok(hello) if hello.protocol != PROTOCOL_NAME => {
            Err(format!("unrecognized protocol: {}", hello.protocol))
        }
        Ok(hello) if !major_matches(&hello.version) => {
            Err(format!("unsupported protocol version: {}", hello.version))
        }
        Ok(hello) if !secret_matches(&hello.secret, secret) => {
            Err(format!("agent {} presented a wrong secret", hello.agent))
        }
        Ok(hello) => Ok(hello),
    };

    match verdict {
        Ok(hello) => {
            write_line(stream, &serde_json::to_string(&HelloReply::Accepted)?).await?;
            tracing::info!("accepted agent {} (protocol {})", hello.agent, hello.version);
            Ok(hello)
        }
        Err(reason) => {
            let reply = HelloReply::Rejected {
                reason: reason.clone(),
            };
            write_line(stream, &serde_json::to_string(&reply)?).await?;
            tracing::warn!("rejected connection: {}", reason);
            Err(ChannelError::Handshake(reason))
        }
    }
}

fn major_matches(version: &str) -> bool {
    let major = |v: &str| v.split('.').next().map(str::to_owned);
    major(version) == major(PROTOCOL_VERSION)
}

/// Comparison that does not stop at the first differing byte.
fn secret_matches(presented: &str, expected: &str) -> bool {
    let (a, b) = (presented.as_bytes(), expected.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_json_shape() {
        let json = serde_json::to_value(Hello::new("agent-1", "s3cr3t")).unwrap();
        assert_eq!(json["protocol"], "remoting");
        assert_eq!(json["version"], PROTOCOL_VERSION);
        assert_eq!(json["agent"], "agent-1");
        assert_eq!(json["secret"], "s3cr3t");

        let rejected = serde_json::to_string(&HelloReply::Rejected {
            reason: "no".into(),
        })
        .unwrap();
        assert_eq!(rejected, r#"{"status":"rejected","reason":"no"}"#);
    }

    #[tokio::test]
    async fn test_read_line_stops_at_newline() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(b"first\r\nsecond").await.unwrap();

        assert_eq!(read_line(&mut b).await.unwrap(), "first");
        let mut rest = [0u8; 6];
        b.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"second");
    }

    #[tokio::test]
    async fn test_read_line_too_long() {
        let (mut a, mut b) = tokio::io::duplex(16 * 1024);
        a.write_all(&vec![b'x'; MAX_LINE_LENGTH + 1]).await.unwrap();
        assert!(matches!(
            read_line(&mut b).await,
            Err(ChannelError::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn test_accepted() {
        let (mut agent, mut master) = tokio::io::duplex(1024);
        let server = tokio::spawn(async move { accept_hello(&mut master, "key").await });

        send_hello(&mut agent, &Hello::new("builder", "key"))
            .await
            .unwrap();
        assert_eq!(server.await.unwrap().unwrap().agent, "builder");
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected_on_both_sides() {
        let (mut agent, mut master) = tokio::io::duplex(1024);
        let server = tokio::spawn(async move { accept_hello(&mut master, "key").await });

        let err = send_hello(&mut agent, &Hello::new("builder", "guess"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Handshake(ref r) if r.contains("wrong secret")));
        assert!(server.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_unknown_protocol_rejected() {
        let (mut agent, mut master) = tokio::io::duplex(1024);
        let server = tokio::spawn(async move { accept_hello(&mut master, "key").await });

        let mut hello = Hello::new("builder", "key");
        hello.protocol = "JNLP-connect".to_string();
        let err = send_hello(&mut agent, &hello).await.unwrap_err();
        assert!(err.to_string().contains("unrecognized protocol"));
        assert!(server.await.unwrap().is_err());
    }

    #[test]
    fn test_version_and_secret_checks() {
        assert!(major_matches("1.7"));
        assert!(!major_matches("2.0"));
        assert!(secret_matches("abc", "abc"));
        assert!(!secret_matches("abd", "abc"));
        assert!(!secret_matches("ab", "abc"));
    }
}
