// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! INIT handshake
//!
//! The first request on a fresh mount. Until the daemon answers it, every
//! other request is held back at admission.

use std::sync::Arc;
use std::time::Instant;

use fusebridge_proto::{
    InitIn, InitOut, Opcode, ProtocolError, WireRecord, KERNEL_MINOR_VERSION, KERNEL_VERSION,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::connection::Connection;
use crate::dispatcher::RequestContext;
use crate::error::{BridgeError, BridgeResult};

/// Parameters agreed with the daemon.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Negotiated {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
    pub max_background: u16,
    pub congestion_threshold: u16,
    pub max_write: u32,
}

impl From<InitOut> for Negotiated {
    fn from(out: InitOut) -> Self {
        Self {
            major: out.major,
            minor: out.minor,
            max_readahead: out.max_readahead,
            flags: out.flags,
            max_background: out.max_background,
            congestion_threshold: out.congestion_threshold,
            max_write: out.max_write,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum HandshakeFailure {
    Daemon(i32),
    Protocol(ProtocolError),
    Unsupported { major: u32, minor: u32 },
    /// Connection went away before INIT was answered.
    Lost,
}

impl From<BridgeError> for HandshakeFailure {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Daemon(errno) => Self::Daemon(errno),
            BridgeError::Protocol(e) => Self::Protocol(e),
            _ => Self::Lost,
        }
    }
}

impl From<HandshakeFailure> for BridgeError {
    fn from(failure: HandshakeFailure) -> Self {
        match failure {
            HandshakeFailure::Daemon(errno) => BridgeError::Daemon(errno),
            HandshakeFailure::Protocol(e) => BridgeError::Protocol(e),
            HandshakeFailure::Unsupported { major, minor } => {
                BridgeError::ProtocolUnsupported { major, minor }
            }
            HandshakeFailure::Lost => BridgeError::NotConnected,
        }
    }
}

impl Connection {
    /// Queue INIT for the daemon. The answer is processed asynchronously;
    /// use [`Connection::wait_ready`] to block on it.
    pub fn start_handshake(self: &Arc<Self>, ctx: &RequestContext) -> BridgeResult<()> {
        {
            let mut session = self.session();
            if !session.mounted {
                return Err(BridgeError::NotMounted);
            }
            if session.init_sent {
                return Err(BridgeError::AlreadyMounted);
            }
            session.init_sent = true;
        }

        let mut request = self.dispatcher().build(Opcode::Init, 0, InitIn::LEN, ctx);
        request.write_record(&InitIn {
            major: KERNEL_VERSION,
            minor: KERNEL_MINOR_VERSION,
            max_readahead: self.config().handshake.max_readahead,
            flags: 0,
        });

        let conn = Arc::downgrade(self);
        let sent = request.send_with_callback(move |answer| {
            if let Some(conn) = conn.upgrade() {
                conn.finish_handshake(answer);
            }
        });
        if let Err(err) = &sent {
            warn!(target: "fusebridge::session", error = %err, "could not queue INIT");
            self.session().inited = true;
            self.notify_session();
        }
        sent
    }

    /// Block until the handshake has settled, bounded by the daemon timeout.
    pub fn wait_ready(&self) -> BridgeResult<Negotiated> {
        let deadline = self.config().daemon_timeout().map(|t| Instant::now() + t);
        let mut session = self.session();
        while !session.inited && !session.dead {
            session = match deadline {
                None => self.wait_session(session),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        drop(session);
                        if self.kill() {
                            warn!(target: "fusebridge::session", "INIT not answered in time");
                        }
                        return Err(BridgeError::DaemonTimeout);
                    }
                    self.wait_session_timeout(session, deadline - now)
                }
            };
        }
        if let Some(failure) = session.handshake_failure.clone() {
            return Err(failure.into());
        }
        match session.negotiated {
            Some(negotiated) if !session.dead => Ok(negotiated),
            _ => Err(BridgeError::NotConnected),
        }
    }

    /// Parameters agreed by a completed handshake.
    pub fn negotiated(&self) -> Option<Negotiated> {
        self.session().negotiated
    }

    fn finish_handshake(&self, answer: BridgeResult<&[u8]>) {
        let result = answer
            .map_err(HandshakeFailure::from)
            .and_then(|body| self.check_init_reply(body));

        if let Err(failure) = &result {
            warn!(target: "fusebridge::session", failure = ?failure, "handshake failed");
            self.kill();
        }

        {
            let mut session = self.session();
            session.inited = true;
            match result {
                Ok(negotiated) => {
                    info!(
                        target: "fusebridge::session",
                        major = negotiated.major,
                        minor = negotiated.minor,
                        max_write = negotiated.max_write,
                        "handshake complete"
                    );
                    session.negotiated = Some(negotiated);
                }
                Err(failure) => session.handshake_failure = Some(failure),
            }
        }
        self.notify_session();
    }

    fn check_init_reply(&self, body: &[u8]) -> Result<Negotiated, HandshakeFailure> {
        let version = |at: usize| {
            body.get(at..at + 4)
                .and_then(|b| b.try_into().ok())
                .map(u32::from_le_bytes)
        };
        let (Some(major), Some(minor)) = (version(0), version(4)) else {
            return Err(HandshakeFailure::Protocol(ProtocolError::BodySize {
                opcode: Some(Opcode::Init),
                got: body.len(),
                expected: InitOut::LEN,
            }));
        };

        let required = self.config().handshake.required_minor;
        if major < KERNEL_VERSION || (major == KERNEL_VERSION && minor < required) {
            return Err(HandshakeFailure::Unsupported { major, minor });
        }
        if body.len() != InitOut::LEN {
            return Err(HandshakeFailure::Protocol(ProtocolError::BodySize {
                opcode: Some(Opcode::Init),
                got: body.len(),
                expected: InitOut::LEN,
            }));
        }
        InitOut::from_prefix(body)
            .map(Negotiated::from)
            .map_err(HandshakeFailure::Protocol)
    }
}
