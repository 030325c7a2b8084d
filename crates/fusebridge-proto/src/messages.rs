// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fixed payload records the kernel side builds or inspects itself
//!
//! Everything else travels as opaque bytes filled in by the callers of the
//! dispatcher.

use ssz::{Decode, Encode};
use ssz_derive::{Decode, Encode};

use crate::validation::{ProtoResult, ProtocolError};

/// Protocol major version spoken by the kernel side.
pub const KERNEL_VERSION: u32 = 7;
/// Minimum protocol minor version the kernel side accepts from a daemon.
pub const KERNEL_MINOR_VERSION: u32 = 8;
/// Node id of the filesystem root.
pub const ROOT_ID: u64 = 1;

/// A fixed-size record with a known encoded length.
pub trait WireRecord: Encode + Decode + Sized {
    const LEN: usize;

    fn to_bytes(&self) -> Vec<u8> {
        self.as_ssz_bytes()
    }

    /// Decode from the first [`Self::LEN`] bytes of `bytes`.
    fn from_prefix(bytes: &[u8]) -> ProtoResult<Self> {
        if bytes.len() < Self::LEN {
            return Err(ProtocolError::BodySize {
                opcode: None,
                got: bytes.len(),
                expected: Self::LEN,
            });
        }
        Self::from_ssz_bytes(&bytes[..Self::LEN])
            .map_err(|e| ProtocolError::SszDecode(format!("{:?}", e)))
    }
}

/// Handshake request body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct InitIn {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
}

impl WireRecord for InitIn {
    const LEN: usize = 16;
}

/// Handshake reply body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct InitOut {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
    pub max_background: u16,
    pub congestion_threshold: u16,
    pub max_write: u32,
}

impl WireRecord for InitOut {
    const LEN: usize = 24;
}

/// Body of a FORGET notification.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct ForgetIn {
    pub nlookup: u64,
}

impl WireRecord for ForgetIn {
    const LEN: usize = 8;
}

/// Body of an INTERRUPT notification naming the request to abandon.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct InterruptIn {
    pub unique: u64,
}

impl WireRecord for InterruptIn {
    const LEN: usize = 8;
}

/// Body of READ and READDIR requests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct ReadIn {
    pub fh: u64,
    pub offset: u64,
    pub size: u32,
    pub flags: u32,
}

impl WireRecord for ReadIn {
    const LEN: usize = 24;
}
