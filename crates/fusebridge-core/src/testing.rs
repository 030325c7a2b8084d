// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-process daemon for exercising a connection end to end
//!
//! [`LoopbackDaemon`] reads requests off a [`DeviceChannel`] on its own
//! thread and answers them through a [`Responder`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use fusebridge_proto::{
    InitOut, InterruptIn, Opcode, ReplyBody, ReplyHeader, RequestHeader, WireRecord,
    KERNEL_MINOR_VERSION, KERNEL_VERSION, REQUEST_HEADER_LEN,
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::device::DeviceChannel;
use crate::error::BridgeError;

/// Read buffer used by the loopback daemon.
pub const DEFAULT_READ_BUFFER: usize = 1 << 20;

/// A request as the daemon sees it.
#[derive(Clone, Debug)]
pub struct IncomingRequest {
    pub header: RequestHeader,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl IncomingRequest {
    pub fn unique(&self) -> u64 {
        self.header.unique
    }
}

/// What the daemon does with one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DaemonAction {
    /// Successful reply carrying this body.
    Reply(Vec<u8>),
    /// Error reply with a positive errno.
    Error(i32),
    /// Write these bytes verbatim.
    Raw(Vec<u8>),
    /// Never answer.
    Ignore,
}

#[cfg_attr(test, mockall::automock)]
pub trait Responder: Send + Sync {
    fn respond(&self, request: &IncomingRequest) -> DaemonAction;
}

impl<F> Responder for F
where
    F: Fn(&IncomingRequest) -> DaemonAction + Send + Sync,
{
    fn respond(&self, request: &IncomingRequest) -> DaemonAction {
        self(request)
    }
}

/// Answers every request with a well-formed, zero-filled body.
#[derive(Clone, Copy, Debug, Default)]
pub struct StandardResponder;

impl Responder for StandardResponder {
    fn respond(&self, request: &IncomingRequest) -> DaemonAction {
        standard_reply(request)
    }
}

/// The reply a well-behaved daemon would send for `request`.
pub fn standard_reply(request: &IncomingRequest) -> DaemonAction {
    match request.opcode {
        Opcode::Init => DaemonAction::Reply(
            InitOut {
                major: KERNEL_VERSION,
                minor: KERNEL_MINOR_VERSION,
                max_readahead: 0,
                flags: 0,
                max_background: 0,
                congestion_threshold: 0,
                max_write: 1 << 16,
            }
            .to_bytes(),
        ),
        opcode => match opcode.reply_body() {
            ReplyBody::Exact(n) => DaemonAction::Reply(vec![0; n]),
            ReplyBody::AnyOf(sizes) => DaemonAction::Reply(vec![0; sizes[0]]),
            ReplyBody::AtMost(_) | ReplyBody::UpToRequested | ReplyBody::Unchecked => {
                DaemonAction::Reply(Vec::new())
            }
            ReplyBody::NoReply => DaemonAction::Ignore,
        },
    }
}

/// Encode a successful reply.
pub fn reply_bytes(unique: u64, body: &[u8]) -> Vec<u8> {
    let mut bytes = ReplyHeader::success(unique, body.len()).to_bytes();
    bytes.extend_from_slice(body);
    bytes
}

/// Counters collected by a loopback daemon over its lifetime.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DaemonReport {
    pub requests: u64,
    pub replies: u64,
    pub errors: u64,
    pub ignored: u64,
    pub forgets: u64,
    /// Uniques named by INTERRUPT requests, in arrival order.
    pub interrupts: Vec<u64>,
    pub rejected_writes: u64,
    pub undecodable: u64,
    pub by_opcode: BTreeMap<String, u64>,
}

pub struct LoopbackDaemon {
    handle: Option<JoinHandle<DaemonReport>>,
}

impl LoopbackDaemon {
    pub fn spawn<R>(device: Arc<DeviceChannel>, responder: R) -> Self
    where
        R: Responder + 'static,
    {
        Self::spawn_with_buffer(device, responder, DEFAULT_READ_BUFFER)
    }

    pub fn spawn_with_buffer<R>(device: Arc<DeviceChannel>, responder: R, buffer: usize) -> Self
    where
        R: Responder + 'static,
    {
        // Events from the daemon thread go wherever the spawning thread's go.
        let dispatch = tracing::dispatcher::get_default(Clone::clone);
        let handle = thread::Builder::new()
            .name("fusebridge-loopback".into())
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || serve(&device, &responder, buffer))
            })
            .map_err(|err| warn!(target: "fusebridge::device", error = %err, "could not spawn daemon thread"))
            .ok();
        Self { handle }
    }

    /// Wait for the daemon to see the connection die.
    pub fn join(mut self) -> DaemonReport {
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(report)) => report,
            Some(Err(panic)) => std::panic::resume_unwind(panic),
            None => DaemonReport::default(),
        }
    }
}

fn serve(device: &DeviceChannel, responder: &dyn Responder, buffer: usize) -> DaemonReport {
    let mut report = DaemonReport::default();
    let mut buf = vec![0u8; buffer];
    loop {
        let len = match device.read(&mut buf) {
            Ok(len) => len,
            Err(BridgeError::NoDevice) => break,
            Err(BridgeError::WouldBlock) => {
                thread::yield_now();
                continue;
            }
            Err(err) => {
                warn!(target: "fusebridge::device", error = %err, "daemon read failed");
                break;
            }
        };
        report.requests += 1;

        let message = &buf[..len];
        let request = match RequestHeader::parse(message).and_then(|header| {
            Opcode::try_from(header.opcode).map(|opcode| IncomingRequest {
                header,
                opcode,
                payload: message[REQUEST_HEADER_LEN..].to_vec(),
            })
        }) {
            Ok(request) => request,
            Err(err) => {
                warn!(target: "fusebridge::device", error = %err, "daemon got undecodable request");
                report.undecodable += 1;
                continue;
            }
        };
        *report.by_opcode.entry(request.opcode.name().to_string()).or_default() += 1;

        match request.opcode {
            Opcode::Forget => {
                report.forgets += 1;
                continue;
            }
            Opcode::Interrupt => {
                if let Ok(interrupt) = InterruptIn::from_prefix(&request.payload) {
                    report.interrupts.push(interrupt.unique);
                }
                continue;
            }
            _ => {}
        }

        let reply = match responder.respond(&request) {
            DaemonAction::Reply(body) => reply_bytes(request.unique(), &body),
            DaemonAction::Error(errno) => {
                report.errors += 1;
                ReplyHeader::failure(request.unique(), errno).to_bytes()
            }
            DaemonAction::Raw(bytes) => bytes,
            DaemonAction::Ignore => {
                report.ignored += 1;
                continue;
            }
        };
        match device.write(&reply) {
            Ok(_) => report.replies += 1,
            Err(BridgeError::NotConnected) => break,
            Err(err) => {
                debug!(target: "fusebridge::device", unique = request.unique(), error = %err, "reply rejected");
                report.rejected_writes += 1;
            }
        }
    }
    debug!(target: "fusebridge::device", requests = report.requests, "loopback daemon exiting");
    report
}
