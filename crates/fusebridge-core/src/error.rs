// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the bridge core

use std::io;

use fusebridge_proto::ProtocolError;

/// Bridge error type
#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error("not connected")]
    NotConnected,
    #[error("daemon did not answer in time")]
    DaemonTimeout,
    #[error("request {unique} interrupted")]
    Interrupted { unique: u64 },
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("out of memory")]
    OutOfMemory,
    #[error("no such device")]
    NoDevice,
    #[error("operation would block")]
    WouldBlock,
    #[error("daemon returned errno {0}")]
    Daemon(i32),
    #[error("already mounted")]
    AlreadyMounted,
    #[error("not mounted")]
    NotMounted,
    #[error("device not open")]
    NotOpen,
    #[error("permission denied")]
    PermissionDenied,
    #[error("daemon protocol {major}.{minor} not supported")]
    ProtocolUnsupported { major: u32, minor: u32 },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl BridgeError {
    /// POSIX errno surfaced for this error.
    pub fn errno(&self) -> i32 {
        match self {
            BridgeError::NotConnected | BridgeError::DaemonTimeout => libc::ENOTCONN,
            BridgeError::Interrupted { .. } => libc::EINTR,
            BridgeError::Protocol(e) => e.errno(),
            BridgeError::OutOfMemory => libc::ENOMEM,
            BridgeError::NoDevice => libc::ENODEV,
            BridgeError::WouldBlock => libc::EAGAIN,
            BridgeError::Daemon(errno) => *errno,
            BridgeError::AlreadyMounted => libc::EALREADY,
            BridgeError::NotMounted => libc::EINVAL,
            BridgeError::NotOpen => libc::ENXIO,
            BridgeError::PermissionDenied => libc::EPERM,
            BridgeError::ProtocolUnsupported { .. } => libc::EPROTONOSUPPORT,
            BridgeError::InvalidConfig(_) => libc::EINVAL,
            BridgeError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Whether the caller may retry after this error on the same connection.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BridgeError::Interrupted { .. } | BridgeError::WouldBlock)
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
