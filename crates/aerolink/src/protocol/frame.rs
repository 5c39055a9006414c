// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Frame model and fixed-layout codec.

use crate::error::{Error, Result};

/// Join: a receiver registers its proposed session id with every sender on
/// the channel.
pub const TAG_JOIN: u8 = 0x01;
/// More: a receiver grants `n` additional items of demand.
pub const TAG_MORE: u8 = 0x02;
/// Cancel: a receiver leaves the stream.
pub const TAG_CANCEL: u8 = 0x03;
/// HeartbeatRequest: receiver-side liveness probe.
pub const TAG_HEARTBEAT_REQUEST: u8 = 0x10;
/// HeartbeatReply: sender-side liveness answer, echoing the probe timestamp.
pub const TAG_HEARTBEAT_REPLY: u8 = 0x11;
/// Next: one item payload.
pub const TAG_NEXT: u8 = 0x20;
/// Complete: normal end of stream.
pub const TAG_COMPLETE: u8 = 0x21;
/// Error: abnormal end of stream, body is a UTF-8 message.
pub const TAG_ERROR: u8 = 0x22;

/// Bytes of tag + session id preceding every frame body.
pub const FRAME_HEADER_LEN: usize = 1 + 8;

/// Demand value meaning "unbounded" in More frames.
pub const UNBOUNDED: u64 = u64::MAX;

/// A decoded service or data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Join {
        session_id: u64,
    },
    More {
        session_id: u64,
        n: u64,
    },
    Cancel {
        session_id: u64,
    },
    HeartbeatRequest {
        session_id: u64,
        sender_nanos: u64,
    },
    HeartbeatReply {
        session_id: u64,
        echoed_sender_nanos: u64,
    },
    Next {
        session_id: u64,
        payload: Vec<u8>,
    },
    Complete {
        session_id: u64,
    },
    Error {
        session_id: u64,
        message: String,
    },
}

impl Frame {
    /// Wire tag of this frame.
    #[must_use]
    pub fn tag(&self) -> u8 {
        match self {
            Frame::Join { .. } => TAG_JOIN,
            Frame::More { .. } => TAG_MORE,
            Frame::Cancel { .. } => TAG_CANCEL,
            Frame::HeartbeatRequest { .. } => TAG_HEARTBEAT_REQUEST,
            Frame::HeartbeatReply { .. } => TAG_HEARTBEAT_REPLY,
            Frame::Next { .. } => TAG_NEXT,
            Frame::Complete { .. } => TAG_COMPLETE,
            Frame::Error { .. } => TAG_ERROR,
        }
    }

    /// Session id carried in the preamble (0 = broadcast).
    #[must_use]
    pub fn session_id(&self) -> u64 {
        match self {
            Frame::Join { session_id }
            | Frame::More { session_id, .. }
            | Frame::Cancel { session_id }
            | Frame::HeartbeatRequest { session_id, .. }
            | Frame::HeartbeatReply { session_id, .. }
            | Frame::Next { session_id, .. }
            | Frame::Complete { session_id }
            | Frame::Error { session_id, .. } => *session_id,
        }
    }

    /// Encoded length in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN
            + match self {
                Frame::Join { .. } | Frame::Cancel { .. } | Frame::Complete { .. } => 0,
                Frame::More { .. }
                | Frame::HeartbeatRequest { .. }
                | Frame::HeartbeatReply { .. } => 8,
                Frame::Next { payload, .. } => payload.len(),
                Frame::Error { message, .. } => message.len(),
            }
    }

    /// Encode into `buf`, which is cleared first. The sender reuses one
    /// buffer across offers, so this never allocates beyond the high-water
    /// mark.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.clear();
        buf.reserve(self.encoded_len());
        buf.push(self.tag());
        buf.extend_from_slice(&self.session_id().to_le_bytes());
        match self {
            Frame::Join { .. } | Frame::Cancel { .. } | Frame::Complete { .. } => {}
            Frame::More { n, .. } => buf.extend_from_slice(&n.to_le_bytes()),
            Frame::HeartbeatRequest { sender_nanos, .. } => {
                buf.extend_from_slice(&sender_nanos.to_le_bytes());
            }
            Frame::HeartbeatReply {
                echoed_sender_nanos,
                ..
            } => buf.extend_from_slice(&echoed_sender_nanos.to_le_bytes()),
            Frame::Next { payload, .. } => buf.extend_from_slice(payload),
            Frame::Error { message, .. } => buf.extend_from_slice(message.as_bytes()),
        }
    }

    /// Convenience wrapper around [`Frame::encode_into`].
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Decode a frame. Fails with [`Error::MalformedFrame`] on an unknown tag
    /// or a truncated preamble/body.
    pub fn decode(buf: &[u8]) -> Result<Frame> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(Error::MalformedFrame(format!(
                "frame shorter than header: {} bytes",
                buf.len()
            )));
        }
        let tag = buf[0];
        let session_id = u64::from_le_bytes(
            buf[1..9]
                .try_into()
                .map_err(|_| Error::MalformedFrame("bad session preamble".into()))?,
        );
        let body = &buf[FRAME_HEADER_LEN..];

        match tag {
            TAG_JOIN => expect_empty(body, "Join").map(|()| Frame::Join { session_id }),
            TAG_MORE => read_u64(body, "More").map(|n| Frame::More { session_id, n }),
            TAG_CANCEL => expect_empty(body, "Cancel").map(|()| Frame::Cancel { session_id }),
            TAG_HEARTBEAT_REQUEST => {
                read_u64(body, "HeartbeatRequest").map(|sender_nanos| Frame::HeartbeatRequest {
                    session_id,
                    sender_nanos,
                })
            }
            TAG_HEARTBEAT_REPLY => {
                read_u64(body, "HeartbeatReply").map(|echoed| Frame::HeartbeatReply {
                    session_id,
                    echoed_sender_nanos: echoed,
                })
            }
            TAG_NEXT => Ok(Frame::Next {
                session_id,
                payload: body.to_vec(),
            }),
            TAG_COMPLETE => expect_empty(body, "Complete").map(|()| Frame::Complete { session_id }),
            TAG_ERROR => {
                let message = String::from_utf8(body.to_vec())
                    .map_err(|_| Error::MalformedFrame("Error message is not UTF-8".into()))?;
                Ok(Frame::Error {
                    session_id,
                    message,
                })
            }
            other => Err(Error::MalformedFrame(format!("unknown tag {:#04x}", other))),
        }
    }
}

fn expect_empty(body: &[u8], what: &str) -> Result<()> {
    if body.is_empty() {
        Ok(())
    } else {
        Err(Error::MalformedFrame(format!(
            "{} frame carries {} unexpected bytes",
            what,
            body.len()
        )))
    }
}

fn read_u64(body: &[u8], what: &str) -> Result<u64> {
    let bytes: [u8; 8] = body
        .try_into()
        .map_err(|_| Error::MalformedFrame(format!("{} body must be 8 bytes", what)))?;
    Ok(u64::from_le_bytes(bytes))
}
