// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Request construction and the send/wait/forget call patterns

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use fusebridge_proto::{
    InterruptIn, Opcode, ProtocolError, RequestHeader, WireRecord, REQUEST_HEADER_LEN,
};
use tracing::{debug, warn};

use crate::biglock::BigLockGuard;
use crate::connection::Connection;
use crate::error::{BridgeError, BridgeResult};
use crate::lock;
use crate::ticket::{Completion, Membership, Outcome, Ticket, TicketState};

/// Identity of the thread issuing a request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
}

impl RequestContext {
    pub fn new(pid: u32, uid: u32, gid: u32) -> Self {
        Self { pid, uid, gid }
    }

    /// Context of the calling process.
    pub fn current() -> Self {
        Self {
            pid: nix::unistd::getpid().as_raw() as u32,
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }
}

/// Signal-like cancellation for a blocked [`Request::send_and_wait_with`].
#[derive(Clone, Default)]
pub struct Cancellation {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    watched: Mutex<Option<Weak<Ticket>>>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        let watched = lock(&self.inner.watched).as_ref().and_then(Weak::upgrade);
        if let Some(ticket) = watched {
            ticket.nudge();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    fn watch(&self, ticket: &Arc<Ticket>) {
        *lock(&self.inner.watched) = Some(Arc::downgrade(ticket));
    }

    fn unwatch(&self) {
        *lock(&self.inner.watched) = None;
    }
}

/// Extra knobs for a blocking wait.
#[derive(Clone, Copy, Default)]
pub struct WaitOptions<'a> {
    pub cancel: Option<&'a Cancellation>,
    /// Released for the duration of the wait and retaken afterwards.
    pub biglock: Option<&'a BigLockGuard<'a>>,
}

impl<'a> WaitOptions<'a> {
    pub fn cancellable(cancel: &'a Cancellation) -> Self {
        Self {
            cancel: Some(cancel),
            biglock: None,
        }
    }

    pub fn with_biglock(mut self, guard: &'a BigLockGuard<'a>) -> Self {
        self.biglock = Some(guard);
        self
    }
}

/// Builds requests on one connection.
#[derive(Clone)]
pub struct Dispatcher {
    conn: Arc<Connection>,
}

impl Dispatcher {
    pub fn new(conn: Arc<Connection>) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Take a ticket and write the request header for `opcode`.
    ///
    /// The returned request holds `payload_size` zeroed payload bytes for the
    /// caller to fill. Allocation failure aborts. A request larger than the
    /// transfer limit is refused when it is sent.
    pub fn build(
        &self,
        opcode: Opcode,
        nodeid: u64,
        payload_size: usize,
        ctx: &RequestContext,
    ) -> Request {
        let ticket = self.conn.acquire_ticket();
        {
            // Checked out to this caller alone, so sizing under the lock
            // blocks nobody.
            let mut state = ticket.lock_state();
            state.message.adjust(REQUEST_HEADER_LEN + payload_size);
            write_header(&mut state, opcode, nodeid, ctx);
        }
        Request::new(Arc::clone(&self.conn), ticket, opcode)
    }

    /// Like [`Dispatcher::build`], but reports allocation failure and refuses
    /// a payload that cannot fit one transfer.
    pub fn try_build(
        &self,
        opcode: Opcode,
        nodeid: u64,
        payload_size: usize,
        ctx: &RequestContext,
    ) -> BridgeResult<Request> {
        let len = REQUEST_HEADER_LEN
            .checked_add(payload_size)
            .ok_or(BridgeError::OutOfMemory)?;
        let limit = self.conn.config().userkernel_bufsize;
        if len > limit {
            return Err(ProtocolError::Oversized { len, limit }.into());
        }

        let ticket = self.conn.acquire_ticket();
        let sized = {
            let mut state = ticket.lock_state();
            let sized = state.message.try_adjust(len);
            match sized {
                Ok(()) => write_header(&mut state, opcode, nodeid, ctx),
                Err(_) => state.killed = true,
            }
            sized
        };
        if let Err(err) = sized {
            warn!(
                target: "fusebridge::ipc",
                opcode = %opcode,
                payload_size,
                "request buffer allocation failed"
            );
            ticket.release();
            return Err(err);
        }
        Ok(Request::new(Arc::clone(&self.conn), ticket, opcode))
    }
}

fn write_header(state: &mut TicketState, opcode: Opcode, nodeid: u64, ctx: &RequestContext) {
    state.opcode = Some(opcode);
    let header = RequestHeader {
        len: state.message.len() as u32,
        opcode: opcode.as_u32(),
        unique: state.unique,
        nodeid,
        uid: ctx.uid,
        gid: ctx.gid,
        pid: ctx.pid,
        padding: 0,
    };
    header.write_to(state.message.as_mut_slice());
}

/// A built request that has not been sent yet.
///
/// Dropping it unsent returns the ticket to the pool.
pub struct Request {
    conn: Arc<Connection>,
    ticket: Arc<Ticket>,
    opcode: Opcode,
    unique: u64,
    sent: bool,
}

impl Request {
    fn new(conn: Arc<Connection>, ticket: Arc<Ticket>, opcode: Opcode) -> Self {
        let unique = ticket.unique();
        Self {
            conn,
            ticket,
            opcode,
            unique,
            sent: false,
        }
    }

    pub fn unique(&self) -> u64 {
        self.unique
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn payload_len(&self) -> usize {
        self.ticket.lock_state().payload().len()
    }

    /// Bytes the daemon will read for this request.
    pub fn wire_len(&self) -> usize {
        self.ticket.lock_state().wire_len()
    }

    pub fn payload_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut state = self.ticket.lock_state();
        f(&mut state.message.as_mut_slice()[REQUEST_HEADER_LEN..])
    }

    /// Copy `bytes` into the payload at `offset`.
    ///
    /// # Panics
    ///
    /// If the bytes run past the end of the payload.
    pub fn write_payload(&mut self, offset: usize, bytes: &[u8]) {
        self.payload_mut(|payload| payload[offset..offset + bytes.len()].copy_from_slice(bytes));
    }

    /// Encode `record` at the start of the payload.
    ///
    /// # Panics
    ///
    /// If the payload was sized too small for the record.
    pub fn write_record<T: WireRecord>(&mut self, record: &T) {
        let bytes = record.to_bytes();
        self.payload_mut(|payload| {
            assert!(
                payload.len() >= bytes.len(),
                "payload of {} bytes cannot hold a {}-byte record",
                payload.len(),
                bytes.len()
            );
            payload[..bytes.len()].copy_from_slice(&bytes);
        });
    }

    /// Send `data` after the payload in the same transport read.
    ///
    /// Refused when header, payload and data together exceed the transfer
    /// limit; the request is left as it was.
    pub fn attach_data(&mut self, data: Vec<u8>) -> BridgeResult<()> {
        let limit = self.conn.config().transfer_limit();
        let mut state = self.ticket.lock_state();
        let len = state.message.len() + data.len();
        if len > limit {
            return Err(ProtocolError::Oversized { len, limit }.into());
        }
        state.data = Some(data);
        // `len` is the first header field.
        state.message.as_mut_slice()[..4].copy_from_slice(&(len as u32).to_le_bytes());
        Ok(())
    }

    fn check_wire_len(&self) -> BridgeResult<()> {
        let limit = self.conn.config().transfer_limit();
        let len = self.wire_len();
        if len > limit {
            warn!(
                target: "fusebridge::ipc",
                unique = self.unique,
                opcode = %self.opcode,
                len,
                limit,
                "request exceeds transfer limit"
            );
            return Err(ProtocolError::Oversized { len, limit }.into());
        }
        Ok(())
    }

    fn assert_expects_reply(&self) {
        assert!(
            self.opcode.expects_reply(),
            "{} never gets a reply; send it with send_and_forget",
            self.opcode
        );
    }

    fn hand_off(mut self) -> (Arc<Connection>, Arc<Ticket>, Opcode) {
        self.sent = true;
        (
            Arc::clone(&self.conn),
            Arc::clone(&self.ticket),
            self.opcode,
        )
    }

    /// Send and block until the daemon answers, the connection dies, or the
    /// daemon timeout expires.
    pub fn send_and_wait(self) -> BridgeResult<Reply> {
        self.send_and_wait_with(WaitOptions::default())
    }

    pub fn send_and_wait_with(self, options: WaitOptions<'_>) -> BridgeResult<Reply> {
        self.assert_expects_reply();
        self.check_wire_len()?;
        let (conn, ticket, opcode) = self.hand_off();
        let exchange = || transmit_and_wait(&conn, ticket, opcode, options.cancel);
        match options.biglock {
            Some(guard) => guard.unlocked(exchange),
            None => exchange(),
        }
    }

    /// Send without expecting a reply.
    pub fn send_and_forget(self) -> BridgeResult<()> {
        self.check_wire_len()?;
        let (conn, ticket, opcode) = self.hand_off();
        let result = conn.await_handshake(opcode).and_then(|()| {
            conn.outbound()
                .enqueue(conn.admission(), Arc::clone(&ticket), Completion::Detached, true)
        });
        if let Err(err) = result {
            ticket.release();
            return Err(err);
        }
        Ok(())
    }

    /// Send and run `callback` once with the answer.
    ///
    /// The callback also runs with `NotConnected` if the connection dies
    /// before the daemon answers. It does not run when the send itself is
    /// refused.
    pub fn send_with_callback<F>(self, callback: F) -> BridgeResult<()>
    where
        F: FnOnce(BridgeResult<&[u8]>) + Send + 'static,
    {
        self.assert_expects_reply();
        self.check_wire_len()?;
        let (conn, ticket, opcode) = self.hand_off();
        let result = conn.await_handshake(opcode).and_then(|()| {
            conn.outbound().enqueue(
                conn.admission(),
                Arc::clone(&ticket),
                Completion::Callback(Box::new(callback)),
                false,
            )
        });
        if let Err(err) = result {
            ticket.release();
            return Err(err);
        }
        Ok(())
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if !self.sent {
            Arc::clone(&self.ticket).release();
        }
    }
}

enum Waited {
    Answered,
    TimedOut,
    Interrupted { delivered: bool },
}

fn transmit_and_wait(
    conn: &Arc<Connection>,
    ticket: Arc<Ticket>,
    opcode: Opcode,
    cancel: Option<&Cancellation>,
) -> BridgeResult<Reply> {
    let unique = ticket.unique();
    let queued = conn.await_handshake(opcode).and_then(|()| {
        conn.outbound()
            .enqueue(conn.admission(), Arc::clone(&ticket), Completion::Waiter, false)
    });
    if let Err(err) = queued {
        ticket.release();
        return Err(err);
    }

    if let Some(cancel) = cancel {
        cancel.watch(&ticket);
    }
    let waited = wait_answer(conn, &ticket, cancel);
    if let Some(cancel) = cancel {
        cancel.unwatch();
    }

    match waited {
        Waited::Answered => {
            let outcome = ticket.lock_state().outcome.take();
            match outcome {
                Some(Outcome::Replied) => Ok(Reply::new(Arc::clone(conn), ticket, opcode, unique)),
                Some(other) => {
                    ticket.release();
                    Err(other.into_error())
                }
                None => {
                    ticket.release();
                    Err(BridgeError::NotConnected)
                }
            }
        }
        Waited::TimedOut => {
            ticket.release();
            Err(BridgeError::DaemonTimeout)
        }
        Waited::Interrupted { delivered } => {
            // The ticket now belongs to whichever path answers it.
            if delivered {
                send_interrupt(conn, unique);
            }
            Err(BridgeError::Interrupted { unique })
        }
    }
}

fn wait_answer(conn: &Connection, ticket: &Ticket, cancel: Option<&Cancellation>) -> Waited {
    let deadline = conn.config().daemon_timeout().map(|t| Instant::now() + t);
    let mut state = ticket.lock_state();
    loop {
        if state.answered {
            return Waited::Answered;
        }
        if cancel.is_some_and(Cancellation::is_cancelled) {
            state.abandoned = true;
            debug!(
                target: "fusebridge::ipc",
                unique = state.unique,
                delivered = state.delivered,
                "wait interrupted"
            );
            return Waited::Interrupted {
                delivered: state.delivered,
            };
        }
        match deadline {
            None => state = ticket.wait(state),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    let unique = state.unique;
                    drop(state);
                    if conn.kill() {
                        warn!(
                            target: "fusebridge::session",
                            unique,
                            daemon_pid = conn.daemon().pid,
                            timeout_secs = conn.config().daemon_timeout_secs,
                            "daemon did not respond in time, marking connection dead"
                        );
                    }
                    // Death drains every queued and pending ticket, this one included.
                    let mut state = ticket.lock_state();
                    while !state.answered {
                        state = ticket.wait(state);
                    }
                    return Waited::TimedOut;
                }
                state = ticket.wait_timeout(state, deadline - now);
            }
        }
    }
}

fn send_interrupt(conn: &Arc<Connection>, unique: u64) {
    let dispatcher = Dispatcher::new(Arc::clone(conn));
    let mut request = dispatcher.build(
        Opcode::Interrupt,
        0,
        InterruptIn::LEN,
        &RequestContext::current(),
    );
    request.write_record(&InterruptIn { unique });
    match request.send_and_forget() {
        Ok(()) => debug!(target: "fusebridge::ipc", unique, "interrupt sent"),
        Err(err) => debug!(target: "fusebridge::ipc", unique, error = %err, "interrupt not sent"),
    }
}

/// A successful answer. Dropping it returns the ticket to the pool.
pub struct Reply {
    conn: Arc<Connection>,
    ticket: Arc<Ticket>,
    opcode: Opcode,
    unique: u64,
    handed_off: bool,
}

impl Reply {
    fn new(conn: Arc<Connection>, ticket: Arc<Ticket>, opcode: Opcode, unique: u64) -> Self {
        Self {
            conn,
            ticket,
            opcode,
            unique,
            handed_off: false,
        }
    }

    pub fn unique(&self) -> u64 {
        self.unique
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn len(&self) -> usize {
        self.ticket.lock_state().answer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn with_body<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let state = self.ticket.lock_state();
        f(state.answer.as_slice())
    }

    pub fn body(&self) -> Vec<u8> {
        self.with_body(<[u8]>::to_vec)
    }

    pub fn decode<T: WireRecord>(&self) -> BridgeResult<T> {
        self.with_body(|body| T::from_prefix(body)).map_err(BridgeError::from)
    }

    /// Reuse this reply's ticket for a follow-up request.
    pub fn rebuild(
        mut self,
        opcode: Opcode,
        nodeid: u64,
        payload_size: usize,
        ctx: &RequestContext,
    ) -> Request {
        self.handed_off = true;
        let unique = self.conn.pool().next_unique();
        {
            let mut state = self.ticket.lock_state();
            state.reset();
            state.unique = unique;
            state.membership = Membership::CheckedOut;
            state.message.adjust(REQUEST_HEADER_LEN + payload_size);
            write_header(&mut state, opcode, nodeid, ctx);
        }
        Request::new(Arc::clone(&self.conn), Arc::clone(&self.ticket), opcode)
    }

    /// Return the ticket to the pool now.
    pub fn release(self) {}
}

impl Drop for Reply {
    fn drop(&mut self) {
        if !self.handed_off {
            Arc::clone(&self.ticket).release();
        }
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reply")
            .field("unique", &self.unique)
            .field("opcode", &self.opcode)
            .field("len", &self.len())
            .finish()
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("unique", &self.unique)
            .field("opcode", &self.opcode)
            .finish()
    }
}
