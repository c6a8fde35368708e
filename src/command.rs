//! Commands: the unit of transmission between the two sides of a channel.
//!
//! Each command travels as one frame. The header carries the command kind
//! and either a request ID or an exported object ID; the payload depends on
//! the kind:
//!
//! | Kind     | Header id    | Payload                                  |
//! |----------|--------------|------------------------------------------|
//! | Request  | request id   | MsgPack `{callable, work}`               |
//! | Response | request id   | MsgPack [`Outcome`], `IS_ERROR` if not a value |
//! | Chunk    | sink oid     | raw bytes                                |
//! | Flush    | sink oid     | empty                                    |
//! | Eof      | sink oid     | empty                                    |
//! | Connect  | proxy oid    | sink oid, `u32` big endian               |
//!
//! Executing a command on the receiving side never blocks the reader:
//! requests and connects run as their own tasks, stream commands only
//! enqueue onto the target sink.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::channel::Channel;
use crate::codec::MsgPackCodec;
use crate::error::{ChannelError, Result};
use crate::export::ObjectId;
use crate::protocol::{flags, CommandKind, Frame, Header};
use crate::request::{Fault, Outcome, RequestId};
use crate::writer::OutboundFrame;

/// A decoded command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the callable registered as `callable` with the encoded `work`.
    Request {
        id: RequestId,
        callable: String,
        work: Bytes,
    },
    /// Result of the request `id`.
    Response { id: RequestId, outcome: Outcome },
    /// Bytes for an exported sink.
    Chunk { oid: ObjectId, data: Bytes },
    /// Flush an exported sink.
    Flush { oid: ObjectId },
    /// End of stream; unexports the sink.
    Eof { oid: ObjectId },
    /// Connect the exported proxy stream `proxy` to the sender's sink `sink`.
    Connect { proxy: ObjectId, sink: ObjectId },
}

#[derive(Serialize, Deserialize)]
struct RequestBody {
    callable: String,
    work: Bytes,
}

impl Command {
    /// Command kind of this command.
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Request { .. } => CommandKind::Request,
            Command::Response { .. } => CommandKind::Response,
            Command::Chunk { .. } => CommandKind::Chunk,
            Command::Flush { .. } => CommandKind::Flush,
            Command::Eof { .. } => CommandKind::Eof,
            Command::Connect { .. } => CommandKind::Connect,
        }
    }

    /// Encode into a frame ready for the writer task.
    pub fn into_frame(self) -> Result<OutboundFrame> {
        let kind = self.kind();
        let (flags, id, payload) = match self {
            Command::Request { id, callable, work } => {
                let body = MsgPackCodec::encode(&RequestBody { callable, work })?;
                (0, id, Bytes::from(body))
            }
            Command::Response { id, outcome } => {
                let flags = if outcome.is_error() { flags::IS_ERROR } else { 0 };
                (flags, id, Bytes::from(MsgPackCodec::encode(&outcome)?))
            }
            Command::Chunk { oid, data } => (0, oid.0, data),
            Command::Flush { oid } | Command::Eof { oid } => (0, oid.0, Bytes::new()),
            Command::Connect { proxy, sink } => {
                (0, proxy.0, Bytes::copy_from_slice(&sink.0.to_be_bytes()))
            }
        };
        let length = u32::try_from(payload.len()).map_err(|_| {
            ChannelError::Protocol(format!("payload of {} bytes is too large", payload.len()))
        })?;
        Ok(OutboundFrame::new(
            &Header::new(kind, flags, id, length),
            payload,
        ))
    }

    /// Decode a received frame.
    ///
    /// A response whose outcome cannot be decoded is still delivered, as a
    /// [`Fault::Malformed`], so its caller is not left waiting.
    pub fn from_frame(frame: Frame) -> Result<Command> {
        let kind = frame.kind().ok_or_else(|| {
            ChannelError::Protocol(format!("Unknown command kind {}", frame.header.kind))
        })?;
        let id = frame.id();
        let command = match kind {
            CommandKind::Request => {
                let body: RequestBody = MsgPackCodec::decode(&frame.payload)?;
                Command::Request {
                    id,
                    callable: body.callable,
                    work: body.work,
                }
            }
            CommandKind::Response => {
                let outcome = MsgPackCodec::decode(&frame.payload).unwrap_or_else(|e| {
                    Outcome::Fault(Fault::Malformed(format!("undecodable response: {e}")))
                });
                Command::Response { id, outcome }
            }
            CommandKind::Chunk => Command::Chunk {
                oid: ObjectId(id),
                data: frame.payload,
            },
            CommandKind::Flush => Command::Flush { oid: ObjectId(id) },
            CommandKind::Eof => Command::Eof { oid: ObjectId(id) },
            CommandKind::Connect => {
                let raw: [u8; 4] = frame.payload[..].try_into().map_err(|_| {
                    ChannelError::Protocol(format!(
                        "connect payload must be 4 bytes, got {}",
                        frame.payload.len()
                    ))
                })?;
                Command::Connect {
                    proxy: ObjectId(id),
                    sink: ObjectId(u32::from_be_bytes(raw)),
                }
            }
        };
        Ok(command)
    }

    /// Perform this command's effect on the receiving channel.
    pub(crate) fn execute(self, channel: &Channel) {
        match self {
            Command::Request { id, callable, work } => channel.spawn_request(id, callable, work),
            Command::Response { id, outcome } => channel.complete_request(id, outcome),
            Command::Chunk { oid, data } => {
                if let Err(e) = channel.lookup_sink(oid).and_then(|sink| sink.write(data)) {
                    tracing::warn!(channel = %channel.name(), "dropping chunk for {}: {}", oid, e);
                }
            }
            Command::Flush { oid } => {
                if let Err(e) = channel.lookup_sink(oid).and_then(|sink| sink.flush()) {
                    tracing::warn!(channel = %channel.name(), "dropping flush for {}: {}", oid, e);
                }
            }
            Command::Eof { oid } => {
                if let Err(e) = channel.take_sink(oid).and_then(|sink| sink.close()) {
                    tracing::warn!(channel = %channel.name(), "dropping end of stream for {}: {}", oid, e);
                }
            }
            Command::Connect { proxy, sink } => channel.spawn_connect(proxy, sink),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::HEADER_SIZE;

    fn to_frame(command: Command) -> Frame {
        let out = command.into_frame().unwrap();
        let header = Header::decode(&out.header).unwrap();
        Frame::new(header, out.payload)
    }

    #[test]
    fn test_request_header_and_body() {
        let frame = to_frame(Command::Request {
            id: 9,
            callable: "checkout".to_string(),
            work: Bytes::from_static(b"\x90"),
        });
        assert_eq!(frame.kind(), Some(CommandKind::Request));
        assert_eq!(frame.id(), 9);
        assert!(!frame.is_error());

        match Command::from_frame(frame).unwrap() {
            Command::Request { id, callable, work } => {
                assert_eq!(id, 9);
                assert_eq!(callable, "checkout");
                assert_eq!(&work[..], b"\x90");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_error_response_sets_flag() {
        let frame = to_frame(Command::Response {
            id: 3,
            outcome: Outcome::Fault(Fault::Panicked("boom".into())),
        });
        assert!(frame.is_error());

        let ok = to_frame(Command::Response {
            id: 4,
            outcome: Outcome::value(&1u8),
        });
        assert!(!ok.is_error());
    }

    #[test]
    fn test_stream_commands_address_object() {
        let out = Command::Chunk {
            oid: ObjectId(77),
            data: Bytes::from_static(b"raw"),
        }
        .into_frame()
        .unwrap();
        assert_eq!(out.size(), HEADER_SIZE + 3);
        assert_eq!(&out.header[2..6], &77u32.to_be_bytes());
        assert_eq!(&out.payload[..], b"raw");

        let eof = Command::Eof { oid: ObjectId(5) }.into_frame().unwrap();
        assert!(eof.payload.is_empty());
    }

    #[test]
    fn test_connect_carries_both_ids() {
        let frame = to_frame(Command::Connect {
            proxy: ObjectId(1),
            sink: ObjectId(0x0102_0304),
        });
        assert_eq!(frame.payload(), &[1, 2, 3, 4]);
        assert_eq!(
            Command::from_frame(frame).unwrap(),
            Command::Connect {
                proxy: ObjectId(1),
                sink: ObjectId(0x0102_0304),
            }
        );
    }

    #[test]
    fn test_bad_connect_payload() {
        let frame = Frame::new(
            Header::new(CommandKind::Connect, 0, 1, 2),
            Bytes::from_static(&[0, 1]),
        );
        assert!(matches!(
            Command::from_frame(frame),
            Err(ChannelError::Protocol(_))
        ));
    }

    #[test]
    fn test_undecodable_response_becomes_fault() {
        let frame = Frame::new(
            Header::new(CommandKind::Response, 0, 12, 1),
            Bytes::from_static(&[0xc1]),
        );
        match Command::from_frame(frame).unwrap() {
            Command::Response {
                id: 12,
                outcome: Outcome::Fault(Fault::Malformed(_)),
            } => {}
            other => panic!("unexpected {:?}", other),
        }
    }
}
