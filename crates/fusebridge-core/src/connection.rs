// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! One daemon session and its lifecycle
//!
//! A connection is opened by the daemon's device session, bound by a mount,
//! and handshaken with INIT. The first unrecoverable condition (explicit
//! kill, reply timeout, handshake failure, device close) marks it dead: no
//! more requests are admitted and everything queued or pending is answered
//! with `NotConnected`. Its tickets are freed once both the mount and the
//! device session have let go.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::Instant;

use fusebridge_proto::{Opcode, ROOT_ID};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::dispatcher::{Dispatcher, RequestContext};
use crate::error::{BridgeError, BridgeResult};
use crate::handshake::{HandshakeFailure, Negotiated};
use crate::iov::IovPolicy;
use crate::lock;
use crate::pool::{PoolStats, TicketPool};
use crate::queue::{Admission, OutboundQueue, PendingRegistry};
use crate::ticket::{Outcome, Ticket};

/// Identity of the daemon process that opened the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DaemonCredentials {
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
}

impl DaemonCredentials {
    pub fn current() -> Self {
        let ctx = RequestContext::current();
        Self {
            pid: ctx.pid,
            uid: ctx.uid,
            gid: ctx.gid,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Opened,
    Mounted,
    HandshakePending,
    Ready,
    Dying,
    Terminated,
}

#[derive(Debug, Default)]
pub(crate) struct SessionFlags {
    pub opened: bool,
    pub mounted: bool,
    pub init_sent: bool,
    pub inited: bool,
    pub dead: bool,
    pub terminated: bool,
    pub negotiated: Option<Negotiated>,
    pub handshake_failure: Option<HandshakeFailure>,
}

pub struct Connection {
    config: BridgeConfig,
    daemon: DaemonCredentials,
    pool: TicketPool,
    outbound: OutboundQueue,
    pending: PendingRegistry,
    admission: Admission,
    session: Mutex<SessionFlags>,
    session_changed: Condvar,
    self_ref: Weak<Connection>,
}

impl Connection {
    /// Open a connection for a daemon that just opened the device.
    pub fn open(config: BridgeConfig, daemon: DaemonCredentials) -> BridgeResult<Arc<Self>> {
        config.validate()?;
        let conn = Arc::new_cyclic(|self_ref| Self {
            pool: TicketPool::new(config.pool.clone(), IovPolicy::from(&config.iov)),
            outbound: OutboundQueue::default(),
            pending: PendingRegistry::default(),
            admission: Admission::default(),
            session: Mutex::new(SessionFlags {
                opened: true,
                ..SessionFlags::default()
            }),
            session_changed: Condvar::new(),
            self_ref: self_ref.clone(),
            config,
            daemon,
        });
        info!(
            target: "fusebridge::session",
            daemon_pid = daemon.pid,
            daemon_uid = daemon.uid,
            "device opened"
        );
        Ok(conn)
    }

    pub fn dispatcher(self: &Arc<Self>) -> Dispatcher {
        Dispatcher::new(Arc::clone(self))
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn daemon(&self) -> &DaemonCredentials {
        &self.daemon
    }

    pub fn is_dying(&self) -> bool {
        self.admission.is_dying()
    }

    pub fn state(&self) -> ConnectionState {
        let session = self.session();
        if session.terminated {
            ConnectionState::Terminated
        } else if session.dead {
            ConnectionState::Dying
        } else if session.mounted && session.inited {
            ConnectionState::Ready
        } else if session.mounted && session.init_sent {
            ConnectionState::HandshakePending
        } else if session.mounted {
            ConnectionState::Mounted
        } else {
            ConnectionState::Opened
        }
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Tickets waiting to be read by the daemon.
    pub fn queued_count(&self) -> usize {
        self.outbound.len()
    }

    /// Tickets read by the daemon and awaiting its reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Bind a filesystem mount to this connection.
    pub fn mount(&self) -> BridgeResult<()> {
        let mut session = self.session();
        if session.mounted {
            return Err(BridgeError::AlreadyMounted);
        }
        if !session.opened {
            return Err(BridgeError::NotOpen);
        }
        if session.dead {
            return Err(BridgeError::NotConnected);
        }
        session.mounted = true;
        drop(session);
        info!(
            target: "fusebridge::session",
            daemon_pid = self.daemon.pid,
            timeout_secs = self.config.daemon_timeout_secs,
            "mounted"
        );
        Ok(())
    }

    /// Detach the mount. A live, handshaken connection is told DESTROY first.
    pub fn unmount(self: &Arc<Self>, ctx: &RequestContext) -> BridgeResult<()> {
        let (inited, dead) = {
            let session = self.session();
            if !session.mounted {
                return Err(BridgeError::NotMounted);
            }
            (session.inited, session.dead)
        };

        if inited && !dead {
            let destroy = self.dispatcher().build(Opcode::Destroy, ROOT_ID, 0, ctx);
            match destroy.send_and_wait() {
                Ok(_) => debug!(target: "fusebridge::session", "destroy acknowledged"),
                Err(err) => {
                    debug!(target: "fusebridge::session", error = %err, "destroy not acknowledged")
                }
            }
        }
        self.kill();

        let terminate = {
            let mut session = self.session();
            session.mounted = false;
            !session.opened
        };
        info!(target: "fusebridge::session", daemon_pid = self.daemon.pid, "unmounted");
        if terminate {
            self.terminate();
        }
        Ok(())
    }

    /// Daemon side closed the device.
    pub fn close_device(&self) {
        let terminate = {
            let mut session = self.session();
            if !session.opened {
                return;
            }
            session.opened = false;
            !session.mounted
        };
        self.kill();
        self.reject_answers();
        info!(target: "fusebridge::session", daemon_pid = self.daemon.pid, "device closed");
        if terminate {
            self.terminate();
        }
    }

    /// Mark the connection dead and answer everything outstanding with
    /// `NotConnected`. Returns `true` for the call that made the transition.
    pub fn kill(&self) -> bool {
        if !self.admission.mark_dying() {
            return false;
        }
        self.session().dead = true;
        self.session_changed.notify_all();
        self.outbound.wake_readers();
        info!(target: "fusebridge::session", daemon_pid = self.daemon.pid, "connection marked dead");
        self.reject_answers();
        true
    }

    /// Administrative kill, allowed for root and the daemon's own user.
    pub fn kill_as(&self, caller: &RequestContext) -> BridgeResult<()> {
        if caller.uid != 0 && caller.uid != self.daemon.uid {
            warn!(
                target: "fusebridge::session",
                caller_uid = caller.uid,
                daemon_uid = self.daemon.uid,
                "kill refused"
            );
            return Err(BridgeError::PermissionDenied);
        }
        self.kill();
        Ok(())
    }

    fn reject_answers(&self) -> usize {
        let drained = self.outbound.drain_with(&self.pending);
        let count = drained.len();
        for ticket in drained {
            ticket.complete(Outcome::NotConnected, &[]);
        }
        if count > 0 {
            debug!(target: "fusebridge::session", count, "rejected outstanding requests");
        }
        count
    }

    fn terminate(&self) {
        self.session().terminated = true;
        self.pool.destroy_all();
        info!(target: "fusebridge::session", daemon_pid = self.daemon.pid, "connection terminated");
    }

    /// Block non-INIT traffic while a mounted connection has not finished its
    /// handshake. Expiry of the daemon timeout kills the connection.
    pub(crate) fn await_handshake(&self, opcode: Opcode) -> BridgeResult<()> {
        if opcode == Opcode::Init {
            return Ok(());
        }
        let deadline = self.config.daemon_timeout().map(|t| Instant::now() + t);
        let mut session = self.session();
        while session.mounted && !session.inited && !session.dead {
            session = match deadline {
                None => self.wait_session(session),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        drop(session);
                        if self.kill() {
                            warn!(
                                target: "fusebridge::session",
                                opcode = %opcode,
                                "handshake did not complete in time"
                            );
                        }
                        return Err(BridgeError::NotConnected);
                    }
                    self.wait_session_timeout(session, deadline - now)
                }
            };
        }
        Ok(())
    }

    pub(crate) fn acquire_ticket(&self) -> Arc<Ticket> {
        let acquired = self.pool.acquire(&self.self_ref);
        if acquired.over_limit && self.kill() {
            warn!(
                target: "fusebridge::pool",
                max_tickets = self.config.pool.max_tickets,
                "ticket limit exceeded, marking connection dead"
            );
        }
        acquired.ticket
    }

    pub(crate) fn pool(&self) -> &TicketPool {
        &self.pool
    }

    pub(crate) fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    pub(crate) fn pending(&self) -> &PendingRegistry {
        &self.pending
    }

    pub(crate) fn admission(&self) -> &Admission {
        &self.admission
    }

    pub(crate) fn session(&self) -> MutexGuard<'_, SessionFlags> {
        lock(&self.session)
    }

    pub(crate) fn notify_session(&self) {
        self.session_changed.notify_all();
    }

    pub(crate) fn wait_session<'a>(
        &self,
        guard: MutexGuard<'a, SessionFlags>,
    ) -> MutexGuard<'a, SessionFlags> {
        self.session_changed
            .wait(guard)
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn wait_session_timeout<'a>(
        &self,
        guard: MutexGuard<'a, SessionFlags>,
        timeout: std::time::Duration,
    ) -> MutexGuard<'a, SessionFlags> {
        match self.session_changed.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("daemon", &self.daemon)
            .field("state", &self.state())
            .field("pool", &self.pool_stats())
            .finish()
    }
}
