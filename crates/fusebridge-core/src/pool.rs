// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-connection ticket pool

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tracing::{debug, trace};

use crate::config::PoolConfig;
use crate::connection::Connection;
use crate::iov::IovPolicy;
use crate::lock;
use crate::ticket::{Membership, Ticket};

/// Snapshot of pool counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Tickets sitting on the free list.
    pub free: usize,
    /// Tickets owned by the pool, free or in use.
    pub all: usize,
    /// Tickets ever allocated.
    pub allocated: u64,
    /// Tickets ever destroyed.
    pub destroyed: u64,
    /// Free-list high-water mark.
    pub max_free: usize,
}

impl PoolStats {
    /// Tickets checked out, queued, or awaiting an answer.
    pub fn in_use(&self) -> usize {
        self.all - self.free
    }

    /// Counter identities that must hold under the pool lock.
    pub fn is_consistent(&self) -> bool {
        self.free <= self.all && self.all as u64 == self.allocated - self.destroyed
    }
}

struct PoolInner {
    free: VecDeque<Arc<Ticket>>,
    all: HashMap<u64, Arc<Ticket>>,
    next_serial: u64,
    last_unique: u64,
    allocated: u64,
    destroyed: u64,
}

pub(crate) struct TicketPool {
    inner: Mutex<PoolInner>,
    limits: PoolConfig,
    policy: IovPolicy,
}

/// Result of [`TicketPool::acquire`].
pub(crate) struct Acquired {
    pub ticket: Arc<Ticket>,
    /// Live tickets exceed the configured maximum.
    pub over_limit: bool,
}

impl TicketPool {
    pub fn new(limits: PoolConfig, policy: IovPolicy) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                free: VecDeque::new(),
                all: HashMap::new(),
                next_serial: 0,
                last_unique: 0,
                allocated: 0,
                destroyed: 0,
            }),
            limits,
            policy,
        }
    }

    /// Take a ticket off the free list or allocate one, and stamp it with a
    /// fresh unique id.
    ///
    /// A fresh ticket is allocated with the pool lock dropped.
    pub fn acquire(&self, conn: &Weak<Connection>) -> Acquired {
        let reserved = {
            let mut inner = lock(&self.inner);
            match inner.free.pop_front() {
                Some(ticket) => {
                    let (unique, over_limit) = self.issue(&mut inner);
                    Ok((ticket, unique, over_limit))
                }
                None => {
                    inner.next_serial += 1;
                    Err(inner.next_serial)
                }
            }
        };

        let (ticket, unique, over_limit) = match reserved {
            Ok(reused) => reused,
            Err(serial) => {
                let ticket = Arc::new(Ticket::new(serial, conn.clone(), self.policy));
                let mut inner = lock(&self.inner);
                inner.all.insert(serial, Arc::clone(&ticket));
                inner.allocated += 1;
                let (unique, over_limit) = self.issue(&mut inner);
                drop(inner);
                trace!(target: "fusebridge::pool", serial, "allocated ticket");
                (ticket, unique, over_limit)
            }
        };

        let mut state = ticket.lock_state();
        debug_assert!(matches!(
            state.membership,
            Membership::Free | Membership::CheckedOut
        ));
        state.unique = unique;
        state.membership = Membership::CheckedOut;
        drop(state);

        Acquired { ticket, over_limit }
    }

    /// Next unique id, and whether live tickets now exceed the limit.
    fn issue(&self, inner: &mut PoolInner) -> (u64, bool) {
        inner.last_unique += 1;
        let live = inner.allocated - inner.destroyed;
        let over_limit = self.limits.max_tickets != 0 && live > self.limits.max_tickets as u64;
        (inner.last_unique, over_limit)
    }

    /// Issue a new unique id for a ticket being rebuilt in place.
    pub fn next_unique(&self) -> u64 {
        let mut inner = lock(&self.inner);
        inner.last_unique += 1;
        inner.last_unique
    }

    /// Recycle or destroy a ticket the caller owns.
    ///
    /// # Panics
    ///
    /// Releasing a ticket that is already free means two owners believed they
    /// held it.
    pub fn release(&self, ticket: Arc<Ticket>) {
        let killed = {
            let mut state = ticket.lock_state();
            assert!(
                !matches!(state.membership, Membership::Free | Membership::Destroyed),
                "ticket {} released twice",
                state.unique
            );
            let killed = state.killed;
            state.reset();
            state.membership = Membership::Free;
            killed
        };

        let mut inner = lock(&self.inner);
        if !inner.all.contains_key(&ticket.serial()) {
            // Pool already torn down.
            return;
        }
        if killed || inner.free.len() >= self.limits.max_free_tickets {
            inner.all.remove(&ticket.serial());
            inner.destroyed += 1;
            drop(inner);
            ticket.lock_state().membership = Membership::Destroyed;
            trace!(target: "fusebridge::pool", serial = ticket.serial(), killed, "destroyed ticket");
        } else {
            inner.free.push_back(ticket);
        }
    }

    /// Drop every ticket the pool owns. Only used at connection teardown.
    pub fn destroy_all(&self) {
        let mut inner = lock(&self.inner);
        let count = inner.all.len();
        inner.free.clear();
        inner.destroyed += count as u64;
        inner.all.clear();
        debug!(target: "fusebridge::pool", count, "destroyed all tickets");
    }

    pub fn stats(&self) -> PoolStats {
        let inner = lock(&self.inner);
        PoolStats {
            free: inner.free.len(),
            all: inner.all.len(),
            allocated: inner.allocated,
            destroyed: inner.destroyed,
            max_free: self.limits.max_free_tickets,
        }
    }
}
