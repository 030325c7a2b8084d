// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fusebridge_core::testing::{LoopbackDaemon, Responder};
use fusebridge_core::{BridgeConfig, Connection, DaemonCredentials, DeviceChannel, RequestContext};
use fusebridge_proto::{InitOut, Opcode, RequestHeader, WireRecord};

pub const DAEMON: DaemonCredentials = DaemonCredentials {
    pid: 4242,
    uid: 501,
    gid: 20,
};

pub fn ctx() -> RequestContext {
    RequestContext::new(77, 501, 20)
}

/// Device opened by the daemon, not yet mounted.
pub fn open_device(config: BridgeConfig) -> (Arc<DeviceChannel>, Arc<Connection>) {
    let device = Arc::new(DeviceChannel::open(config, DAEMON).unwrap());
    let conn = Arc::clone(device.connection());
    (device, conn)
}

/// Mounted, handshaken connection served by a loopback daemon.
pub fn ready_connection<R>(
    config: BridgeConfig,
    responder: R,
) -> (Arc<DeviceChannel>, Arc<Connection>, LoopbackDaemon)
where
    R: Responder + 'static,
{
    let (device, conn) = open_device(config);
    conn.mount().unwrap();
    let daemon = LoopbackDaemon::spawn(Arc::clone(&device), responder);
    conn.start_handshake(&ctx()).unwrap();
    conn.wait_ready().unwrap();
    (device, conn, daemon)
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Read one request the way a daemon would.
pub fn read_request(device: &DeviceChannel) -> (RequestHeader, Vec<u8>) {
    let mut buf = vec![0u8; 1 << 16];
    let len = device.read(&mut buf).unwrap();
    let header = RequestHeader::parse(&buf[..len]).unwrap();
    assert_eq!(header.len as usize, len);
    buf.truncate(len);
    (header, buf)
}

pub fn init_reply(minor: u32) -> Vec<u8> {
    InitOut {
        major: fusebridge_proto::KERNEL_VERSION,
        minor,
        max_readahead: 65536,
        flags: 0,
        max_background: 12,
        congestion_threshold: 9,
        max_write: 1 << 17,
    }
    .to_bytes()
}

pub fn opcode_of(header: &RequestHeader) -> Opcode {
    Opcode::try_from(header.opcode).unwrap()
}
