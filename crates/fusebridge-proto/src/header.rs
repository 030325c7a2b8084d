// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Request and reply headers
//!
//! Both headers are fixed-size SSZ containers, so their encoding is the
//! little-endian concatenation of their fields.

use ssz::{Decode, Encode};
use ssz_derive::{Decode, Encode};

use crate::validation::{ProtoResult, ProtocolError};

/// Encoded size of [`RequestHeader`].
pub const REQUEST_HEADER_LEN: usize = 40;
/// Encoded size of [`ReplyHeader`].
pub const REPLY_HEADER_LEN: usize = 16;

/// Header prefixed to every message the kernel side hands to the daemon.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct RequestHeader {
    /// Total message length, header included.
    pub len: u32,
    pub opcode: u32,
    pub unique: u64,
    pub nodeid: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub padding: u32,
}

impl RequestHeader {
    /// Write the header into the first [`REQUEST_HEADER_LEN`] bytes of `out`.
    pub fn write_to(&self, out: &mut [u8]) {
        assert!(out.len() >= REQUEST_HEADER_LEN, "request header does not fit");
        let bytes = self.as_ssz_bytes();
        out[..REQUEST_HEADER_LEN].copy_from_slice(&bytes);
    }

    /// Decode the header at the start of `bytes`.
    pub fn parse(bytes: &[u8]) -> ProtoResult<Self> {
        if bytes.len() < REQUEST_HEADER_LEN {
            return Err(ProtocolError::ShortHeader {
                got: bytes.len(),
                need: REQUEST_HEADER_LEN,
            });
        }
        Self::from_ssz_bytes(&bytes[..REQUEST_HEADER_LEN])
            .map_err(|e| ProtocolError::SszDecode(format!("{:?}", e)))
    }

    /// Payload length declared by the header.
    pub fn payload_len(&self) -> usize {
        (self.len as usize).saturating_sub(REQUEST_HEADER_LEN)
    }
}

/// Header the daemon prefixes to every reply.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct ReplyHeader {
    /// Total reply length, header included.
    pub len: u32,
    /// Negated errno reinterpreted as `u32`; zero on success.
    pub error: u32,
    pub unique: u64,
}

impl ReplyHeader {
    pub fn success(unique: u64, body_len: usize) -> Self {
        Self {
            len: (REPLY_HEADER_LEN + body_len) as u32,
            error: 0,
            unique,
        }
    }

    /// Build an error reply for a positive errno.
    pub fn failure(unique: u64, errno: i32) -> Self {
        Self {
            len: REPLY_HEADER_LEN as u32,
            error: (-errno) as u32,
            unique,
        }
    }

    /// Signed error field as sent on the wire (zero or a negated errno).
    pub fn error_code(&self) -> i32 {
        self.error as i32
    }

    /// Positive errno carried by the reply, zero on success.
    pub fn errno(&self) -> i32 {
        self.error_code().wrapping_neg()
    }

    pub fn body_len(&self) -> usize {
        (self.len as usize).saturating_sub(REPLY_HEADER_LEN)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.as_ssz_bytes()
    }

    pub fn decode(bytes: &[u8]) -> ProtoResult<Self> {
        if bytes.len() < REPLY_HEADER_LEN {
            return Err(ProtocolError::ShortHeader {
                got: bytes.len(),
                need: REPLY_HEADER_LEN,
            });
        }
        Self::from_ssz_bytes(&bytes[..REPLY_HEADER_LEN])
            .map_err(|e| ProtocolError::SszDecode(format!("{:?}", e)))
    }
}
