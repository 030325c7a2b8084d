// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Daemon-facing transport
//!
//! A read hands the daemon the next queued request in one piece; a write
//! delivers one complete reply.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fusebridge_proto::{audit_reply_body, parse_reply, ProtocolError};
use tracing::{debug, trace, warn};

use crate::config::BridgeConfig;
use crate::connection::{Connection, DaemonCredentials};
use crate::error::{BridgeError, BridgeResult};
use crate::queue::ReadFailure;
use crate::ticket::Outcome;

/// The daemon's open session on the device. Dropping it closes the device.
pub struct DeviceChannel {
    conn: Arc<Connection>,
    nonblocking: AtomicBool,
}

impl DeviceChannel {
    /// Open a fresh connection on behalf of `daemon`.
    pub fn open(config: BridgeConfig, daemon: DaemonCredentials) -> BridgeResult<Self> {
        Ok(Self::new(Connection::open(config, daemon)?))
    }

    pub fn new(conn: Arc<Connection>) -> Self {
        Self {
            conn,
            nonblocking: AtomicBool::new(false),
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.nonblocking.store(nonblocking, Ordering::Relaxed);
    }

    /// Copy the next request into `buf` and return its length.
    ///
    /// Blocks while the queue is empty unless the channel is nonblocking.
    /// A buffer too small for the next request is a daemon bug and kills the
    /// connection.
    pub fn read(&self, buf: &mut [u8]) -> BridgeResult<usize> {
        let nonblocking = self.nonblocking.load(Ordering::Relaxed);
        let delivered = self.conn.outbound().deliver(
            self.conn.pending(),
            self.conn.admission(),
            buf,
            nonblocking,
        );
        match delivered {
            Ok(delivered) => {
                if self.conn.is_dying() {
                    return Err(BridgeError::NoDevice);
                }
                trace!(
                    target: "fusebridge::device",
                    unique = delivered.unique,
                    opcode = ?delivered.opcode,
                    len = delivered.len,
                    no_reply = delivered.invalid,
                    "request read"
                );
                Ok(delivered.len)
            }
            Err(ReadFailure::Dead) => Err(BridgeError::NoDevice),
            Err(ReadFailure::Empty) => Err(BridgeError::WouldBlock),
            Err(ReadFailure::TooSmall { need }) => {
                warn!(
                    target: "fusebridge::device",
                    need,
                    have = buf.len(),
                    "read buffer too small for next request, marking connection dead"
                );
                self.conn.kill();
                Err(BridgeError::NoDevice)
            }
        }
    }

    /// Deliver one reply and return the number of bytes consumed.
    ///
    /// A reply for an id nobody waits on is silently accepted. A reply that
    /// fails the framing or body checks is rejected; if it matched a pending
    /// request, that request fails with the same protocol error.
    pub fn write(&self, bytes: &[u8]) -> BridgeResult<usize> {
        if self.conn.is_dying() {
            return Err(BridgeError::NotConnected);
        }
        let limit = self.conn.config().userkernel_bufsize;
        if bytes.len() > limit {
            return Err(ProtocolError::Oversized {
                len: bytes.len(),
                limit,
            }
            .into());
        }

        let (header, body) = parse_reply(bytes).map_err(|err| {
            warn!(target: "fusebridge::device", len = bytes.len(), error = %err, "malformed reply");
            err
        })?;

        let Some(ticket) = self.conn.pending().find_and_remove(header.unique) else {
            debug!(
                target: "fusebridge::device",
                unique = header.unique,
                "no request pending for reply, discarded"
            );
            return Ok(bytes.len());
        };

        if header.error != 0 {
            trace!(
                target: "fusebridge::device",
                unique = header.unique,
                errno = header.errno(),
                "error reply"
            );
            ticket.complete(Outcome::Daemon(header.errno()), &[]);
            return Ok(bytes.len());
        }

        let audit = {
            let state = ticket.lock_state();
            match state.opcode {
                Some(opcode) => audit_reply_body(opcode, state.payload(), body.len()),
                None => Ok(()),
            }
        };
        match audit {
            Ok(()) => {
                trace!(
                    target: "fusebridge::device",
                    unique = header.unique,
                    body_len = body.len(),
                    "reply accepted"
                );
                ticket.complete(Outcome::Replied, body);
                Ok(bytes.len())
            }
            Err(err) => {
                warn!(
                    target: "fusebridge::device",
                    unique = header.unique,
                    error = %err,
                    "reply body rejected"
                );
                ticket.complete(Outcome::Protocol(err.clone()), &[]);
                Err(err.into())
            }
        }
    }

    /// Whether a read would return without blocking.
    pub fn poll_readable(&self) -> bool {
        self.conn.is_dying() || !self.conn.outbound().is_empty()
    }

    /// The daemon is known to be gone.
    pub fn mark_daemon_dead(&self) {
        if self.conn.kill() {
            debug!(target: "fusebridge::device", daemon_pid = self.conn.daemon().pid, "daemon marked dead");
        }
    }
}

impl Drop for DeviceChannel {
    fn drop(&mut self) {
        self.conn.close_device();
    }
}

impl std::fmt::Debug for DeviceChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceChannel")
            .field("conn", &self.conn)
            .field("nonblocking", &self.nonblocking.load(Ordering::Relaxed))
            .finish()
    }
}
