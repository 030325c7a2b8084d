// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Outbound queue and pending-answer registry
//!
//! A ticket moves from the outbound queue into the registry in the same
//! critical section that copies its bytes to the daemon, so it is never in
//! both and it is always registered before the daemon can see its id.
//! Lock order is outbound queue, then registry, then ticket.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use fusebridge_proto::Opcode;
use tracing::{debug, trace};

use crate::error::{BridgeError, BridgeResult};
use crate::lock;
use crate::ticket::{Completion, Membership, Ticket};

/// Flags that close the queue to new work.
#[derive(Debug, Default)]
pub(crate) struct Admission {
    dying: AtomicBool,
    destroyed: AtomicBool,
}

impl Admission {
    pub fn is_dying(&self) -> bool {
        self.dying.load(Ordering::Acquire)
    }

    /// Returns `true` if this call flipped the flag.
    pub fn mark_dying(&self) -> bool {
        !self.dying.swap(true, Ordering::AcqRel)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

/// What a transport read copied out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Delivered {
    pub len: usize,
    pub unique: u64,
    pub opcode: Option<Opcode>,
    /// No reply expected; the ticket was already recycled.
    pub invalid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadFailure {
    Dead,
    Empty,
    /// Caller's buffer cannot hold the next message.
    TooSmall { need: usize },
}

#[derive(Default)]
pub(crate) struct PendingRegistry {
    map: Mutex<HashMap<u64, Arc<Ticket>>>,
}

impl PendingRegistry {
    /// Remove and return the ticket awaiting `unique`, if any.
    pub fn find_and_remove(&self, unique: u64) -> Option<Arc<Ticket>> {
        let ticket = lock(&self.map).remove(&unique)?;
        ticket.lock_state().membership = Membership::Completed;
        Some(ticket)
    }

    pub fn len(&self) -> usize {
        lock(&self.map).len()
    }
}

#[derive(Default)]
pub(crate) struct OutboundQueue {
    queue: Mutex<VecDeque<Arc<Ticket>>>,
    readable: Condvar,
}

impl OutboundQueue {
    /// Append a ticket for the transport and wake one reader.
    ///
    /// Fails with `NotConnected` once the connection is dying or a DESTROY
    /// has been queued; the completion is then dropped without running.
    ///
    /// # Panics
    ///
    /// A ticket enqueued twice without being reset.
    pub fn enqueue(
        &self,
        admission: &Admission,
        ticket: Arc<Ticket>,
        completion: Completion,
        invalid: bool,
    ) -> BridgeResult<()> {
        let mut queue = lock(&self.queue);
        if admission.is_dying() || admission.is_destroyed() {
            return Err(BridgeError::NotConnected);
        }

        let mut state = ticket.lock_state();
        assert!(
            !state.dirty,
            "ticket {} enqueued again without reset",
            state.unique
        );
        state.dirty = true;
        state.invalid = invalid;
        state.completion = completion;
        state.membership = Membership::Outbound;
        if state.opcode == Some(Opcode::Destroy) {
            admission.destroyed.store(true, Ordering::Release);
        }
        trace!(
            target: "fusebridge::ipc",
            unique = state.unique,
            opcode = ?state.opcode,
            len = state.wire_len(),
            "queued"
        );
        drop(state);

        queue.push_back(ticket);
        self.readable.notify_one();
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.queue).is_empty()
    }

    pub fn len(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Pop the next deliverable ticket, register it as pending, and copy its
    /// bytes into `out`.
    ///
    /// Tickets whose waiter already gave up are recycled on the way. Tickets
    /// that expect no reply are recycled right after the copy.
    pub fn deliver(
        &self,
        pending: &PendingRegistry,
        admission: &Admission,
        out: &mut [u8],
        nonblocking: bool,
    ) -> Result<Delivered, ReadFailure> {
        let mut queue = lock(&self.queue);
        loop {
            if admission.is_dying() {
                return Err(ReadFailure::Dead);
            }
            let Some(ticket) = queue.pop_front() else {
                if nonblocking {
                    return Err(ReadFailure::Empty);
                }
                queue = self
                    .readable
                    .wait(queue)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                continue;
            };

            let mut registry = lock(&pending.map);
            let mut state = ticket.lock_state();

            if state.abandoned {
                debug!(
                    target: "fusebridge::ipc",
                    unique = state.unique,
                    "skipping request abandoned before delivery"
                );
                state.answered = true;
                state.membership = Membership::Completed;
                drop(state);
                drop(registry);
                ticket.release();
                continue;
            }

            let need = state.wire_len();
            if out.len() < need {
                drop(state);
                drop(registry);
                queue.push_front(ticket);
                return Err(ReadFailure::TooSmall { need });
            }

            let message_len = state.message.len();
            out[..message_len].copy_from_slice(state.message.as_slice());
            if let Some(data) = &state.data {
                out[message_len..need].copy_from_slice(data);
            }
            state.delivered = true;

            let delivered = Delivered {
                len: need,
                unique: state.unique,
                opcode: state.opcode,
                invalid: state.invalid,
            };
            if state.invalid {
                state.answered = true;
                state.membership = Membership::Completed;
                drop(state);
                drop(registry);
                ticket.release();
            } else {
                state.membership = Membership::Pending;
                drop(state);
                registry.insert(delivered.unique, ticket);
            }
            return Ok(delivered);
        }
    }

    /// Empty both the queue and the registry, returning every ticket that
    /// still needs an answer.
    pub fn drain_with(&self, pending: &PendingRegistry) -> Vec<Arc<Ticket>> {
        let mut queue = lock(&self.queue);
        let mut registry = lock(&pending.map);
        let mut drained: Vec<Arc<Ticket>> = queue.drain(..).collect();
        drained.extend(registry.drain().map(|(_, ticket)| ticket));
        drop(registry);
        drop(queue);
        self.readable.notify_all();
        drained
    }

    /// Wake every blocked reader so it re-checks the connection state.
    pub fn wake_readers(&self) {
        let _queue = lock(&self.queue);
        self.readable.notify_all();
    }
}
