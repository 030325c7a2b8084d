// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Request workload against a loopback daemon

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{anyhow, Result};
use fusebridge_core::testing::{
    standard_reply, DaemonAction, DaemonReport, IncomingRequest, LoopbackDaemon,
};
use fusebridge_core::{
    BridgeConfig, BridgeError, Cancellation, ConnectionState, DaemonCredentials,
    DeviceChannel, Dispatcher, Negotiated, PoolStats, RequestContext, WaitOptions,
};
use fusebridge_proto::{ForgetIn, Opcode, ReadIn, WireRecord};
use serde::Serialize;
use tracing::{info, warn};

const MIX: [Opcode; 7] = [
    Opcode::Lookup,
    Opcode::Getattr,
    Opcode::Open,
    Opcode::Read,
    Opcode::Write,
    Opcode::Statfs,
    Opcode::Forget,
];

const READ_SIZE: u32 = 4096;
const WRITE_SIZE: usize = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkloadOptions {
    pub threads: usize,
    pub requests_per_thread: usize,
    pub interrupt_every: Option<usize>,
    pub kill_after: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub started_at: String,
    pub finished_at: String,
    pub threads: usize,
    pub requests_per_thread: usize,
    pub negotiated: Option<Negotiated>,
    pub issued: BTreeMap<String, u64>,
    pub completed: u64,
    pub interrupted: u64,
    pub not_connected: u64,
    pub errors: BTreeMap<String, u64>,
    pub elapsed_ms: u128,
    pub requests_per_sec: f64,
    pub pool_after_unmount: PoolStats,
    pub final_state: ConnectionState,
    pub daemon: DaemonReport,
    pub status: String,
}

#[derive(Default)]
struct WorkerTally {
    issued: BTreeMap<String, u64>,
    completed: u64,
    interrupted: u64,
    not_connected: u64,
    errors: BTreeMap<String, u64>,
}

impl WorkerTally {
    fn record(&mut self, result: Result<(), BridgeError>) {
        match result {
            Ok(()) => self.completed += 1,
            Err(BridgeError::Interrupted { .. }) => self.interrupted += 1,
            Err(BridgeError::NotConnected) => self.not_connected += 1,
            Err(err) => *self.errors.entry(err.to_string()).or_default() += 1,
        }
    }

    fn merge(&mut self, other: WorkerTally) {
        for (name, count) in other.issued {
            *self.issued.entry(name).or_default() += count;
        }
        for (name, count) in other.errors {
            *self.errors.entry(name).or_default() += count;
        }
        self.completed += other.completed;
        self.interrupted += other.interrupted;
        self.not_connected += other.not_connected;
    }
}

/// Daemon behaviour for the workload: reads return the requested length.
fn respond(request: &IncomingRequest) -> DaemonAction {
    match request.opcode {
        Opcode::Read => match ReadIn::from_prefix(&request.payload) {
            Ok(read) => DaemonAction::Reply(vec![0x5A; read.size as usize]),
            Err(_) => DaemonAction::Error(libc::EINVAL),
        },
        _ => standard_reply(request),
    }
}

pub fn run_workload(config: BridgeConfig, options: WorkloadOptions) -> Result<RunReport> {
    let started_at = chrono::Utc::now();
    let device = Arc::new(DeviceChannel::open(config, DaemonCredentials::current())?);
    let conn = Arc::clone(device.connection());
    let ctx = RequestContext::current();

    conn.mount()?;
    let daemon = LoopbackDaemon::spawn(Arc::clone(&device), respond);
    conn.start_handshake(&ctx)?;
    let negotiated = match conn.wait_ready() {
        Ok(negotiated) => Some(negotiated),
        Err(err) => {
            warn!(error = %err, "handshake failed");
            None
        }
    };
    info!(
        threads = options.threads,
        requests = options.requests_per_thread,
        interrupt_every = ?options.interrupt_every,
        kill_after = ?options.kill_after,
        "starting workload"
    );

    let clock = Instant::now();
    let completed = Arc::new(AtomicUsize::new(0));
    let workers: Vec<_> = (0..options.threads)
        .map(|worker_id| {
            let dispatcher = conn.dispatcher();
            let completed = Arc::clone(&completed);
            thread::Builder::new()
                .name(format!("fs-worker-{worker_id}"))
                .spawn(move || run_worker(worker_id, &dispatcher, options, &completed, ctx))
        })
        .collect::<std::io::Result<_>>()?;

    let mut tally = WorkerTally::default();
    for worker in workers {
        let result = worker
            .join()
            .map_err(|_| anyhow!("workload thread panicked"))?;
        tally.merge(result);
    }
    let elapsed = clock.elapsed();

    conn.unmount(&ctx)?;
    let daemon_report = daemon.join();
    let pool_after_unmount = conn.pool_stats();
    drop(device);
    let final_state = conn.state();

    let total = tally.completed + tally.interrupted + tally.not_connected
        + tally.errors.values().sum::<u64>();
    let status = if pool_after_unmount.in_use() == 0
        && pool_after_unmount.is_consistent()
        && tally.errors.is_empty()
        && (options.kill_after.is_some() || tally.not_connected == 0)
    {
        "PASS"
    } else {
        "FAIL"
    };
    info!(
        completed = tally.completed,
        interrupted = tally.interrupted,
        not_connected = tally.not_connected,
        elapsed_ms = elapsed.as_millis() as u64,
        status,
        "workload finished"
    );

    Ok(RunReport {
        started_at: started_at.to_rfc3339(),
        finished_at: chrono::Utc::now().to_rfc3339(),
        threads: options.threads,
        requests_per_thread: options.requests_per_thread,
        negotiated,
        issued: tally.issued,
        completed: tally.completed,
        interrupted: tally.interrupted,
        not_connected: tally.not_connected,
        errors: tally.errors,
        elapsed_ms: elapsed.as_millis(),
        requests_per_sec: total as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        pool_after_unmount,
        final_state,
        daemon: daemon_report,
        status: status.to_string(),
    })
}

fn run_worker(
    worker_id: usize,
    dispatcher: &Dispatcher,
    options: WorkloadOptions,
    completed: &AtomicUsize,
    ctx: RequestContext,
) -> WorkerTally {
    let mut tally = WorkerTally::default();
    for i in 0..options.requests_per_thread {
        let sequence = worker_id * options.requests_per_thread + i;
        let opcode = MIX[sequence % MIX.len()];
        *tally.issued.entry(opcode.name().to_string()).or_default() += 1;

        let cancel = options
            .interrupt_every
            .filter(|k| sequence % k == k - 1)
            .map(|_| {
                let cancel = Cancellation::new();
                cancel.cancel();
                cancel
            });
        let result = issue(dispatcher, opcode, sequence as u64, cancel.as_ref(), &ctx);
        let succeeded = result.is_ok();
        tally.record(result);

        if succeeded {
            let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
            if options.kill_after == Some(done) {
                info!(done, "killing connection");
                dispatcher.connection().kill();
            }
        }
    }
    tally
}

fn issue(
    dispatcher: &Dispatcher,
    opcode: Opcode,
    sequence: u64,
    cancel: Option<&Cancellation>,
    ctx: &RequestContext,
) -> Result<(), BridgeError> {
    let nodeid = 2 + sequence % 64;
    let options = WaitOptions {
        cancel,
        biglock: None,
    };
    match opcode {
        Opcode::Forget => {
            let mut request = dispatcher.try_build(opcode, nodeid, ForgetIn::LEN, ctx)?;
            request.write_record(&ForgetIn { nlookup: 1 });
            request.send_and_forget()
        }
        Opcode::Lookup => {
            let name = format!("entry-{sequence}\0");
            let mut request = dispatcher.try_build(opcode, 1, name.len(), ctx)?;
            request.write_payload(0, name.as_bytes());
            request.send_and_wait_with(options).map(drop)
        }
        Opcode::Read => {
            let mut request = dispatcher.try_build(opcode, nodeid, ReadIn::LEN, ctx)?;
            request.write_record(&ReadIn {
                fh: sequence,
                offset: 0,
                size: READ_SIZE,
                flags: 0,
            });
            let reply = request.send_and_wait_with(options)?;
            if reply.len() != READ_SIZE as usize {
                warn!(unique = reply.unique(), len = reply.len(), "short read");
            }
            Ok(())
        }
        Opcode::Write => {
            let mut request = dispatcher.try_build(opcode, nodeid, 16, ctx)?;
            request.write_payload(0, &sequence.to_le_bytes());
            request.attach_data(vec![(sequence % 251) as u8; WRITE_SIZE])?;
            request.send_and_wait_with(options).map(drop)
        }
        _ => dispatcher
            .try_build(opcode, nodeid, 0, ctx)?
            .send_and_wait_with(options)
            .map(drop),
    }
}
