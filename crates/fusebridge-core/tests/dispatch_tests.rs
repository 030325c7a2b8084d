// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use common::*;
use fusebridge_core::testing::{reply_bytes, standard_reply, DaemonAction, IncomingRequest};
use fusebridge_core::{BigLock, BridgeConfig, BridgeError, WaitOptions};
use fusebridge_proto::{
    ForgetIn, Opcode, ProtocolError, ReadIn, ReplyHeader, WireRecord, REQUEST_HEADER_LEN,
};

#[fusebridge_test_utils::logged_test]
fn test_first_request_is_unique_one_and_reads_whole() {
    let (device, conn) = open_device(BridgeConfig::default());
    let dispatcher = conn.dispatcher();

    let waiter = thread::spawn(move || {
        let mut request = dispatcher.build(Opcode::Getattr, 5, 8, &ctx());
        request.write_payload(0, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let reply = request.send_and_wait()?;
        Ok::<_, BridgeError>((reply.unique(), reply.body()))
    });

    let (header, bytes) = read_request(&device);
    logger.log(&format!("read {:?}", header)).unwrap();
    assert_eq!(bytes.len(), 48);
    assert_eq!(header.unique, 1);
    assert_eq!(header.nodeid, 5);
    assert_eq!(opcode_of(&header), Opcode::Getattr);
    assert_eq!((header.uid, header.gid, header.pid), (501, 20, 77));
    assert_eq!(&bytes[REQUEST_HEADER_LEN..], &[1, 2, 3, 4, 5, 6, 7, 8]);

    let written = device.write(&reply_bytes(1, &[7u8; 104])).unwrap();
    assert_eq!(written, 16 + 104);

    let (unique, body) = waiter.join().unwrap().unwrap();
    assert_eq!(unique, 1);
    assert_eq!(body, vec![7u8; 104]);

    let stats = conn.pool_stats();
    assert_eq!(stats.in_use(), 0);
    assert_eq!(stats.free, 1);
    assert!(stats.is_consistent());
}

#[fusebridge_test_utils::logged_test]
fn test_wrong_body_size_fails_request_and_write() {
    let (device, conn) = open_device(BridgeConfig::default());
    let dispatcher = conn.dispatcher();
    let waiter = thread::spawn(move || {
        dispatcher
            .build(Opcode::Getattr, 1, 0, &ctx())
            .send_and_wait()
            .map(|_| ())
    });

    let (header, _) = read_request(&device);
    let err = device.write(&reply_bytes(header.unique, &[0u8; 10])).unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Protocol(ProtocolError::BodySize {
            opcode: Some(Opcode::Getattr),
            got: 10,
            expected: 104
        })
    ));
    assert_eq!(err.errno(), libc::EINVAL);

    let waited = waiter.join().unwrap().unwrap_err();
    assert!(matches!(waited, BridgeError::Protocol(_)));
    assert_eq!(waited.errno(), libc::EINVAL);
    assert_eq!(conn.pool_stats().in_use(), 0);
    assert!(!conn.is_dying(), "a bad reply does not kill the connection");
}

#[fusebridge_test_utils::logged_test]
fn test_daemon_error_reaches_caller() {
    let (device, conn) = open_device(BridgeConfig::default());
    let dispatcher = conn.dispatcher();
    let waiter = thread::spawn(move || {
        dispatcher
            .build(Opcode::Lookup, 1, 6, &ctx())
            .send_and_wait()
            .map(|_| ())
    });

    let (header, _) = read_request(&device);
    device
        .write(&ReplyHeader::failure(header.unique, libc::ENOENT).to_bytes())
        .unwrap();

    let err = waiter.join().unwrap().unwrap_err();
    assert!(matches!(err, BridgeError::Daemon(libc::ENOENT)));
    assert_eq!(err.errno(), libc::ENOENT);
    assert_eq!(conn.pool_stats().in_use(), 0);
}

#[fusebridge_test_utils::logged_test]
fn test_malformed_and_stray_replies() {
    let (device, conn) = open_device(BridgeConfig::default());

    let err = device.write(&[0u8; 15]).unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Protocol(ProtocolError::ShortHeader { got: 15, need: 16 })
    ));

    let mut with_body = ReplyHeader::failure(3, libc::EIO);
    with_body.len += 4;
    let mut bytes = with_body.to_bytes();
    bytes.extend_from_slice(&[0; 4]);
    assert!(matches!(
        device.write(&bytes),
        Err(BridgeError::Protocol(ProtocolError::ErrorWithBody { .. }))
    ));

    // Nobody waits on 99.
    assert_eq!(device.write(&reply_bytes(99, &[1, 2])).unwrap(), 18);
    assert!(!conn.is_dying());
}

#[fusebridge_test_utils::logged_test]
fn test_replies_correlate_under_concurrency() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 40;

    let responder = |request: &IncomingRequest| match request.opcode {
        Opcode::Write => DaemonAction::Reply(request.unique().to_le_bytes().to_vec()),
        _ => standard_reply(request),
    };
    let (device, conn, daemon) = ready_connection(BridgeConfig::default(), responder);

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let dispatcher = conn.dispatcher();
            thread::spawn(move || {
                let mut seen = Vec::with_capacity(PER_THREAD);
                for _ in 0..PER_THREAD {
                    let request = dispatcher.build(Opcode::Write, 2, 16, &ctx());
                    let unique = request.unique();
                    let reply = request.send_and_wait().unwrap();
                    let echoed = u64::from_le_bytes(reply.body().try_into().unwrap());
                    assert_eq!(echoed, unique, "reply routed to the wrong request");
                    seen.push(unique);
                }
                seen
            })
        })
        .collect();

    let mut all = HashSet::new();
    for worker in workers {
        for unique in worker.join().unwrap() {
            assert!(all.insert(unique), "unique {unique} issued twice");
        }
    }
    assert_eq!(all.len(), THREADS * PER_THREAD);

    conn.unmount(&ctx()).unwrap();
    let report = daemon.join();
    logger.log_json("daemon report", &report).unwrap();
    assert_eq!(report.by_opcode.get("write"), Some(&((THREADS * PER_THREAD) as u64)));
    assert_eq!(report.by_opcode.get("destroy"), Some(&1));
    assert_eq!(report.rejected_writes, 0);

    let stats = conn.pool_stats();
    assert_eq!(stats.in_use(), 0);
    assert!(stats.is_consistent());
    drop(device);
}

#[fusebridge_test_utils::logged_test]
fn test_callback_runs_once_for_duplicate_replies() {
    let (device, conn) = open_device(BridgeConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);

    conn.dispatcher()
        .build(Opcode::Open, 3, 8, &ctx())
        .send_with_callback(move |answer| {
            assert_eq!(answer.unwrap().len(), 16);
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    let (header, _) = read_request(&device);
    let reply = reply_bytes(header.unique, &[0u8; 16]);
    device.write(&reply).unwrap();
    device.write(&reply).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(conn.pool_stats().in_use(), 0);
}

#[fusebridge_test_utils::logged_test]
fn test_forget_is_recycled_after_read() {
    let (device, conn) = open_device(BridgeConfig::default());
    let mut forget = conn
        .dispatcher()
        .build(Opcode::Forget, 12, ForgetIn::LEN, &ctx());
    forget.write_record(&ForgetIn { nlookup: 3 });
    forget.send_and_forget().unwrap();
    assert_eq!(conn.pool_stats().in_use(), 1);

    let (header, bytes) = read_request(&device);
    assert_eq!(opcode_of(&header), Opcode::Forget);
    assert_eq!(header.nodeid, 12);
    assert_eq!(
        ForgetIn::from_prefix(&bytes[REQUEST_HEADER_LEN..]).unwrap().nlookup,
        3
    );
    assert_eq!(conn.pool_stats().in_use(), 0);
    assert_eq!(conn.pending_count(), 0);
}

#[fusebridge_test_utils::logged_test]
fn test_attached_data_follows_payload() {
    let (device, conn) = open_device(BridgeConfig::default());
    let dispatcher = conn.dispatcher();
    let waiter = thread::spawn(move || {
        let mut request = dispatcher.build(Opcode::Write, 4, 8, &ctx());
        request.write_payload(0, &7u64.to_le_bytes());
        request.attach_data(vec![0xAB; 100]).unwrap();
        assert_eq!(request.wire_len(), REQUEST_HEADER_LEN + 8 + 100);
        request.send_and_wait().map(|reply| reply.body())
    });

    let (header, bytes) = read_request(&device);
    assert_eq!(header.len, 148);
    assert_eq!(header.payload_len(), 108);
    assert_eq!(&bytes[REQUEST_HEADER_LEN..REQUEST_HEADER_LEN + 8], &7u64.to_le_bytes());
    assert!(bytes[REQUEST_HEADER_LEN + 8..].iter().all(|b| *b == 0xAB));

    device.write(&reply_bytes(header.unique, &100u64.to_le_bytes())).unwrap();
    assert_eq!(waiter.join().unwrap().unwrap(), 100u64.to_le_bytes().to_vec());
}

#[fusebridge_test_utils::logged_test]
fn test_read_reply_bounded_by_requested_size() {
    let (device, conn) = open_device(BridgeConfig::default());
    let dispatcher = conn.dispatcher();
    let waiter = thread::spawn(move || {
        let mut request = dispatcher.build(Opcode::Read, 4, ReadIn::LEN, &ctx());
        request.write_record(&ReadIn {
            fh: 1,
            offset: 0,
            size: 32,
            flags: 0,
        });
        request.send_and_wait().map(|reply| reply.len())
    });

    let (header, _) = read_request(&device);
    let err = device.write(&reply_bytes(header.unique, &[0u8; 33])).unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Protocol(ProtocolError::BodySize { got: 33, expected: 32, .. })
    ));
    assert!(waiter.join().unwrap().is_err());

    // A short read is fine.
    let dispatcher = conn.dispatcher();
    let waiter = thread::spawn(move || {
        let mut request = dispatcher.build(Opcode::Read, 4, ReadIn::LEN, &ctx());
        request.write_record(&ReadIn {
            fh: 1,
            offset: 0,
            size: 32,
            flags: 0,
        });
        request.send_and_wait().map(|reply| reply.len())
    });
    let (header, _) = read_request(&device);
    device.write(&reply_bytes(header.unique, &[5u8; 12])).unwrap();
    assert_eq!(waiter.join().unwrap().unwrap(), 12);
}

#[fusebridge_test_utils::logged_test]
fn test_rebuild_reuses_ticket_with_fresh_unique() {
    let (device, conn) = open_device(BridgeConfig::default());
    let dispatcher = conn.dispatcher();
    let waiter = thread::spawn(move || {
        let reply = dispatcher
            .build(Opcode::Lookup, 1, 4, &ctx())
            .send_and_wait()?;
        let first = reply.unique();
        let follow_up = reply.rebuild(Opcode::Open, 9, 8, &ctx());
        let second = follow_up.unique();
        let reply = follow_up.send_and_wait()?;
        assert_eq!(reply.len(), 16);
        Ok::<_, BridgeError>((first, second))
    });

    let (header, _) = read_request(&device);
    device.write(&reply_bytes(header.unique, &[0u8; 128])).unwrap();
    let (header, _) = read_request(&device);
    assert_eq!(opcode_of(&header), Opcode::Open);
    assert_eq!(header.nodeid, 9);
    device.write(&reply_bytes(header.unique, &[0u8; 16])).unwrap();

    let (first, second) = waiter.join().unwrap().unwrap();
    assert_eq!((first, second), (1, 2));
    let stats = conn.pool_stats();
    assert_eq!(stats.allocated, 1, "rebuild must not allocate");
    assert_eq!(stats.in_use(), 0);
}

#[fusebridge_test_utils::logged_test]
fn test_biglock_is_released_while_waiting() {
    let (device, conn) = open_device(BridgeConfig::default());
    let big = Arc::new(BigLock::new());

    let dispatcher = conn.dispatcher();
    let held = Arc::clone(&big);
    let waiter = thread::spawn(move || {
        let guard = held.lock();
        let reply = dispatcher
            .build(Opcode::Statfs, 1, 0, &ctx())
            .send_and_wait_with(WaitOptions::default().with_biglock(&guard));
        let relocked = held.is_locked();
        drop(guard);
        (reply.map(|r| r.len()), relocked)
    });

    let (header, _) = read_request(&device);
    // The daemon touches the filesystem before answering.
    drop(big.lock());
    device.write(&reply_bytes(header.unique, &[0u8; 80])).unwrap();

    let (reply, relocked) = waiter.join().unwrap();
    assert_eq!(reply.unwrap(), 80);
    assert!(relocked, "lock is held again once the wait returns");
    assert!(!big.is_locked());
}

#[fusebridge_test_utils::logged_test]
fn test_nonblocking_read_and_poll() {
    let (device, conn) = open_device(BridgeConfig::default());
    device.set_nonblocking(true);
    assert!(!device.poll_readable());
    let mut buf = vec![0u8; 256];
    assert!(matches!(device.read(&mut buf), Err(BridgeError::WouldBlock)));

    conn.dispatcher()
        .build(Opcode::Forget, 1, ForgetIn::LEN, &ctx())
        .send_and_forget()
        .unwrap();
    assert!(device.poll_readable());
    assert_eq!(device.read(&mut buf).unwrap(), REQUEST_HEADER_LEN + ForgetIn::LEN);
    assert!(!device.poll_readable());
}

#[fusebridge_test_utils::logged_test]
fn test_short_read_buffer_kills_connection() {
    let (device, conn) = open_device(BridgeConfig::default());
    conn.dispatcher()
        .build(Opcode::Forget, 1, ForgetIn::LEN, &ctx())
        .send_and_forget()
        .unwrap();

    let mut buf = vec![0u8; REQUEST_HEADER_LEN];
    assert!(matches!(device.read(&mut buf), Err(BridgeError::NoDevice)));
    assert!(conn.is_dying());
    assert_eq!(conn.queued_count(), 0);
    assert_eq!(conn.pool_stats().in_use(), 0);
}

#[fusebridge_test_utils::logged_test]
fn test_oversized_write_is_refused() {
    let mut config = BridgeConfig::default();
    config.userkernel_bufsize = 64;
    let (device, _conn) = open_device(config);
    let err = device.write(&reply_bytes(1, &[0u8; 64])).unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Protocol(ProtocolError::Oversized { len: 80, limit: 64 })
    ));
}

#[fusebridge_test_utils::logged_test]
fn test_try_build_reports_allocation_failure() {
    let mut config = BridgeConfig::default();
    config.userkernel_bufsize = usize::MAX;
    let (_device, conn) = open_device(config);
    let dispatcher = conn.dispatcher();

    let overflow = dispatcher
        .try_build(Opcode::Write, 1, usize::MAX, &ctx())
        .unwrap_err();
    assert!(matches!(overflow, BridgeError::OutOfMemory));
    assert_eq!(overflow.errno(), libc::ENOMEM);

    let huge = dispatcher
        .try_build(Opcode::Write, 1, isize::MAX as usize - 64, &ctx())
        .unwrap_err();
    assert!(matches!(huge, BridgeError::OutOfMemory));

    let stats = conn.pool_stats();
    logger.log_json("pool after failed builds", &stats).unwrap();
    assert_eq!(stats.allocated, 1, "length overflow never takes a ticket");
    assert_eq!(stats.destroyed, 1, "a ticket whose buffer could not grow is not recycled");
    assert_eq!(stats.all, 0);
    assert!(stats.is_consistent());
    assert!(!conn.is_dying());

    let request = dispatcher.try_build(Opcode::Getattr, 1, 8, &ctx()).unwrap();
    assert_eq!(request.unique(), 2);
    assert_eq!(request.wire_len(), REQUEST_HEADER_LEN + 8);
}

#[fusebridge_test_utils::logged_test]
fn test_requests_beyond_transfer_limit_are_refused() {
    let mut config = BridgeConfig::default();
    config.userkernel_bufsize = 256;
    let (_device, conn) = open_device(config);
    let dispatcher = conn.dispatcher();

    let err = dispatcher
        .try_build(Opcode::Write, 1, 256, &ctx())
        .unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Protocol(ProtocolError::Oversized { len: 296, limit: 256 })
    ));

    let mut request = dispatcher.build(Opcode::Write, 1, 16, &ctx());
    let err = request.attach_data(vec![0; 250]).unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Protocol(ProtocolError::Oversized { len: 306, limit: 256 })
    ));
    assert_eq!(request.wire_len(), REQUEST_HEADER_LEN + 16, "refused data is not attached");
    drop(request);

    let oversized = dispatcher.build(Opcode::Write, 1, 300, &ctx());
    assert!(matches!(
        oversized.send_and_forget(),
        Err(BridgeError::Protocol(ProtocolError::Oversized { len: 340, limit: 256 }))
    ));
    assert_eq!(conn.queued_count(), 0);
    assert_eq!(conn.pool_stats().in_use(), 0);
    assert!(!conn.is_dying());
}

#[test]
#[should_panic(expected = "never gets a reply")]
fn test_waiting_on_forget_is_a_caller_bug() {
    let (_device, conn) = open_device(BridgeConfig::default());
    let _ = conn
        .dispatcher()
        .build(Opcode::Forget, 1, ForgetIn::LEN, &ctx())
        .send_and_wait();
}

#[test]
#[should_panic(expected = "never gets a reply")]
fn test_callback_on_forget_is_a_caller_bug() {
    let (_device, conn) = open_device(BridgeConfig::default());
    let _ = conn
        .dispatcher()
        .build(Opcode::Forget, 1, ForgetIn::LEN, &ctx())
        .send_with_callback(|_| {});
}
