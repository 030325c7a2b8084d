// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Tickets: one in-flight request/response exchange each

use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::Duration;

use fusebridge_proto::{Opcode, ProtocolError, REQUEST_HEADER_LEN};
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::{BridgeError, BridgeResult};
use crate::iov::{Iov, IovPolicy};
use crate::lock;

/// Which container currently holds the ticket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Membership {
    Free,
    CheckedOut,
    Outbound,
    Pending,
    Completed,
    Destroyed,
}

pub(crate) type Callback = Box<dyn FnOnce(BridgeResult<&[u8]>) + Send>;

/// What happens when the ticket is answered.
pub(crate) enum Completion {
    /// Nobody is told; the answering path recycles the ticket.
    Detached,
    /// A thread sleeps on the ticket's condition variable.
    Waiter,
    /// Run once with the answer, then recycle the ticket.
    Callback(Callback),
}

/// How an exchange ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Body is in the answer buffer.
    Replied,
    Daemon(i32),
    Protocol(ProtocolError),
    NotConnected,
    NoMemory,
}

impl Outcome {
    fn into_answer(self, body: &[u8]) -> BridgeResult<&[u8]> {
        match self {
            Outcome::Replied => Ok(body),
            other => Err(other.into_error()),
        }
    }

    pub(crate) fn into_error(self) -> BridgeError {
        match self {
            Outcome::Replied => unreachable!("a reply is not an error"),
            Outcome::Daemon(errno) => BridgeError::Daemon(errno),
            Outcome::Protocol(e) => BridgeError::Protocol(e),
            Outcome::NotConnected => BridgeError::NotConnected,
            Outcome::NoMemory => BridgeError::OutOfMemory,
        }
    }
}

pub(crate) struct TicketState {
    pub unique: u64,
    pub opcode: Option<Opcode>,
    /// Header plus payload handed to the daemon.
    pub message: Iov,
    /// Trailing caller-owned segment sent after the message.
    pub data: Option<Vec<u8>>,
    /// Reply body.
    pub answer: Iov,
    pub outcome: Option<Outcome>,
    pub answered: bool,
    /// No reply expected.
    pub invalid: bool,
    /// Enqueued once since the last reset.
    pub dirty: bool,
    /// Destroy instead of recycling on release.
    pub killed: bool,
    /// The waiter gave up; whoever answers the ticket recycles it.
    pub abandoned: bool,
    /// Copied out to the daemon.
    pub delivered: bool,
    pub membership: Membership,
    pub completion: Completion,
}

impl TicketState {
    fn new(policy: IovPolicy) -> Self {
        Self {
            unique: 0,
            opcode: None,
            message: Iov::new(policy, REQUEST_HEADER_LEN),
            data: None,
            answer: Iov::new(policy, 0),
            outcome: None,
            answered: false,
            invalid: false,
            dirty: false,
            killed: false,
            abandoned: false,
            delivered: false,
            membership: Membership::CheckedOut,
            completion: Completion::Detached,
        }
    }

    /// Return to a pristine state before reuse.
    pub fn reset(&mut self) {
        self.opcode = None;
        self.message.refresh();
        self.data = None;
        self.answer.refresh();
        self.outcome = None;
        self.answered = false;
        self.invalid = false;
        self.dirty = false;
        self.killed = false;
        self.abandoned = false;
        self.delivered = false;
        self.completion = Completion::Detached;
    }

    /// Payload bytes following the request header.
    pub fn payload(&self) -> &[u8] {
        let message = self.message.as_slice();
        &message[REQUEST_HEADER_LEN.min(message.len())..]
    }

    /// Total bytes the daemon will read for this ticket.
    pub fn wire_len(&self) -> usize {
        self.message.len() + self.data.as_ref().map_or(0, Vec::len)
    }
}

pub(crate) struct Ticket {
    /// Key in the pool's all-tickets map.
    serial: u64,
    conn: Weak<Connection>,
    state: Mutex<TicketState>,
    answered_cv: Condvar,
}

impl Ticket {
    pub fn new(serial: u64, conn: Weak<Connection>, policy: IovPolicy) -> Self {
        Self {
            serial,
            conn,
            state: Mutex::new(TicketState::new(policy)),
            answered_cv: Condvar::new(),
        }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn lock_state(&self) -> MutexGuard<'_, TicketState> {
        lock(&self.state)
    }

    pub fn unique(&self) -> u64 {
        self.lock_state().unique
    }

    pub fn wait<'a>(&self, guard: MutexGuard<'a, TicketState>) -> MutexGuard<'a, TicketState> {
        self.answered_cv
            .wait(guard)
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, TicketState>,
        timeout: Duration,
    ) -> MutexGuard<'a, TicketState> {
        match self.answered_cv.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    /// Wake the waiter so it re-checks its wake conditions.
    pub fn nudge(&self) {
        let _state = self.lock_state();
        self.answered_cv.notify_all();
    }

    /// Hand the ticket back to its connection's pool.
    pub fn release(self: Arc<Self>) {
        match self.conn.upgrade() {
            Some(conn) => conn.pool().release(self),
            None => debug!(
                target: "fusebridge::pool",
                serial = self.serial,
                "connection gone, ticket dropped"
            ),
        }
    }

    /// Answer the ticket.
    ///
    /// Called by whichever path removed the ticket from the outbound queue
    /// or the pending registry, so it runs at most once per exchange.
    pub fn complete(self: Arc<Self>, outcome: Outcome, body: &[u8]) {
        let mut state = self.lock_state();
        if state.answered {
            warn!(
                target: "fusebridge::ipc",
                unique = state.unique,
                "second answer for ticket ignored"
            );
            return;
        }
        state.answered = true;
        state.membership = Membership::Completed;

        match std::mem::replace(&mut state.completion, Completion::Detached) {
            Completion::Waiter => {
                let mut outcome = outcome;
                if outcome == Outcome::Replied {
                    if let Err(err) = state.answer.fill_from(body) {
                        warn!(
                            target: "fusebridge::ipc",
                            unique = state.unique,
                            len = body.len(),
                            error = %err,
                            "failed to pull reply body"
                        );
                        state.killed = true;
                        outcome = Outcome::NoMemory;
                    }
                }
                state.outcome = Some(outcome);
                let abandoned = state.abandoned;
                drop(state);
                self.answered_cv.notify_all();
                if abandoned {
                    self.release();
                }
            }
            Completion::Callback(callback) => {
                drop(state);
                callback(outcome.into_answer(body));
                self.release();
            }
            Completion::Detached => {
                drop(state);
                self.release();
            }
        }
    }
}
