// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Reply validation: header framing and the per-opcode body audit

use thiserror::Error;

use crate::header::{ReplyHeader, REPLY_HEADER_LEN};
use crate::messages::{ReadIn, WireRecord};
use crate::opcode::{Opcode, ReplyBody};

/// Wire-level protocol violation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("short header: got {got} bytes, need {need}")]
    ShortHeader { got: usize, need: usize },
    #[error("declared length {declared} does not match supplied {supplied} bytes")]
    LengthMismatch { declared: usize, supplied: usize },
    #[error("reply carries error {error} together with a {body_len}-byte body")]
    ErrorWithBody { error: i32, body_len: usize },
    #[error("message of {len} bytes exceeds the {limit}-byte transfer limit")]
    Oversized { len: usize, limit: usize },
    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),
    #[error("body of {got} bytes does not fit {opcode:?} (expected {expected})")]
    BodySize {
        opcode: Option<Opcode>,
        got: usize,
        expected: usize,
    },
    #[error("SSZ decoding failed: {0}")]
    SszDecode(String),
}

impl ProtocolError {
    /// Errno reported to the side that sent the malformed message.
    pub fn errno(&self) -> i32 {
        libc::EINVAL
    }
}

pub type ProtoResult<T> = Result<T, ProtocolError>;

/// Parse and frame-check one complete reply as written by the daemon.
///
/// Returns the header and the body slice. The declared length must cover
/// exactly the supplied bytes, and an error reply must not carry a body.
pub fn parse_reply(bytes: &[u8]) -> ProtoResult<(ReplyHeader, &[u8])> {
    let header = ReplyHeader::decode(bytes)?;
    if header.len as usize != bytes.len() {
        return Err(ProtocolError::LengthMismatch {
            declared: header.len as usize,
            supplied: bytes.len(),
        });
    }
    let body = &bytes[REPLY_HEADER_LEN..];
    if header.error != 0 && !body.is_empty() {
        return Err(ProtocolError::ErrorWithBody {
            error: header.error_code(),
            body_len: body.len(),
        });
    }
    Ok((header, body))
}

/// Check a successful reply body against the table for `opcode`.
///
/// `request_payload` is the payload that was sent, used by opcodes whose
/// reply is bounded by a field of the request.
///
/// # Panics
///
/// Auditing a reply for an opcode that never gets one means a ticket that
/// should never have been registered was matched, which is a bridge bug.
pub fn audit_reply_body(opcode: Opcode, request_payload: &[u8], body_len: usize) -> ProtoResult<()> {
    let fits = match opcode.reply_body() {
        ReplyBody::Exact(n) => body_len == n,
        ReplyBody::AnyOf(sizes) => sizes.contains(&body_len),
        ReplyBody::AtMost(n) => body_len <= n,
        ReplyBody::UpToRequested => {
            let requested = ReadIn::from_prefix(request_payload)
                .map(|r| r.size as usize)
                .unwrap_or(0);
            if body_len > requested {
                return Err(ProtocolError::BodySize {
                    opcode: Some(opcode),
                    got: body_len,
                    expected: requested,
                });
            }
            true
        }
        ReplyBody::Unchecked => true,
        ReplyBody::NoReply => panic!("audited a reply for {opcode}, which never expects one"),
    };
    if fits {
        Ok(())
    } else {
        Err(ProtocolError::BodySize {
            opcode: Some(opcode),
            got: body_len,
            expected: expected_len(opcode.reply_body()),
        })
    }
}

fn expected_len(body: ReplyBody) -> usize {
    match body {
        ReplyBody::Exact(n) | ReplyBody::AtMost(n) => n,
        ReplyBody::AnyOf(sizes) => sizes.first().copied().unwrap_or(0),
        _ => 0,
    }
}
