// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

mod common;

use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use common::*;
use fusebridge_core::testing::reply_bytes;
use fusebridge_core::{BridgeConfig, BridgeError, Cancellation, WaitOptions};
use fusebridge_proto::{InterruptIn, Opcode, ReplyHeader, WireRecord, REQUEST_HEADER_LEN};
use fusebridge_test_utils::EventBuffer;

#[fusebridge_test_utils::logged_test]
fn test_cancel_before_delivery_sends_nothing() {
    let (device, conn) = open_device(BridgeConfig::default());
    let cancel = Cancellation::new();

    let dispatcher = conn.dispatcher();
    let waiter_cancel = cancel.clone();
    let waiter = thread::spawn(move || {
        let request = dispatcher.build(Opcode::Getattr, 1, 0, &ctx());
        let unique = request.unique();
        let result = request.send_and_wait_with(WaitOptions::cancellable(&waiter_cancel));
        (unique, result.map(|_| ()))
    });

    wait_until("request queued", || conn.queued_count() == 1);
    cancel.cancel();
    let (unique, result) = waiter.join().unwrap();
    match result {
        Err(BridgeError::Interrupted { unique: got }) => assert_eq!(got, unique),
        other => panic!("expected Interrupted, got {other:?}"),
    }
    assert!(cancel.is_cancelled());

    // The abandoned request is skipped and recycled by the reader.
    device.set_nonblocking(true);
    let mut buf = vec![0u8; 256];
    assert!(matches!(device.read(&mut buf), Err(BridgeError::WouldBlock)));
    assert_eq!(conn.queued_count(), 0);
    assert_eq!(conn.pool_stats().in_use(), 0);
    assert!(!conn.is_dying());
}

#[fusebridge_test_utils::logged_test]
fn test_cancel_after_delivery_sends_interrupt() {
    let (device, conn) = open_device(BridgeConfig::default());
    let cancel = Cancellation::new();

    let dispatcher = conn.dispatcher();
    let waiter_cancel = cancel.clone();
    let waiter = thread::spawn(move || {
        dispatcher
            .build(Opcode::Read, 3, 24, &ctx())
            .send_and_wait_with(WaitOptions::cancellable(&waiter_cancel))
            .map(|_| ())
    });

    let (original, _) = read_request(&device);
    cancel.cancel();
    let err = waiter.join().unwrap().unwrap_err();
    assert!(matches!(err, BridgeError::Interrupted { unique } if unique == original.unique));
    assert_eq!(err.errno(), libc::EINTR);

    let (header, bytes) = read_request(&device);
    assert_eq!(opcode_of(&header), Opcode::Interrupt);
    assert_ne!(header.unique, original.unique);
    let interrupt = InterruptIn::from_prefix(&bytes[REQUEST_HEADER_LEN..]).unwrap();
    assert_eq!(interrupt.unique, original.unique);
    assert_eq!(conn.pending_count(), 1, "interrupt itself expects no reply");

    // The daemon still answers the original; that recycles its ticket.
    device
        .write(&ReplyHeader::failure(original.unique, libc::EINTR).to_bytes())
        .unwrap();
    assert_eq!(conn.pending_count(), 0);
    assert_eq!(conn.pool_stats().in_use(), 0);
}

#[fusebridge_test_utils::logged_test]
fn test_late_reply_after_interrupt_is_absorbed() {
    let (device, conn) = open_device(BridgeConfig::default());
    let cancel = Cancellation::new();

    let dispatcher = conn.dispatcher();
    let waiter_cancel = cancel.clone();
    let waiter = thread::spawn(move || {
        dispatcher
            .build(Opcode::Open, 3, 8, &ctx())
            .send_and_wait_with(WaitOptions::cancellable(&waiter_cancel))
            .map(|_| ())
    });

    let (original, _) = read_request(&device);
    cancel.cancel();
    assert!(waiter.join().unwrap().is_err());
    read_request(&device);

    // A full success reply after the caller has gone away.
    device
        .write(&reply_bytes(original.unique, &[0u8; 16]))
        .unwrap();
    let stats = conn.pool_stats();
    assert_eq!(stats.in_use(), 0);
    assert!(stats.is_consistent());
}

#[fusebridge_test_utils::logged_test]
fn test_reply_racing_cancellation_completes_once() {
    let (device, conn) = open_device(BridgeConfig::default());
    let (mut replied, mut interrupted) = (0, 0);

    for round in 0..200 {
        let cancel = Cancellation::new();
        let dispatcher = conn.dispatcher();
        let waiter_cancel = cancel.clone();
        let waiter = thread::spawn(move || {
            dispatcher
                .build(Opcode::Getattr, 1, 0, &ctx())
                .send_and_wait_with(WaitOptions::cancellable(&waiter_cancel))
                .map(|reply| reply.len())
        });
        let (header, _) = read_request(&device);

        let barrier = Arc::new(Barrier::new(2));
        let canceller = {
            let barrier = Arc::clone(&barrier);
            let cancel = cancel.clone();
            thread::spawn(move || {
                barrier.wait();
                cancel.cancel();
            })
        };
        barrier.wait();
        device
            .write(&reply_bytes(header.unique, &[0u8; 104]))
            .unwrap();
        canceller.join().unwrap();

        match waiter.join().unwrap() {
            Ok(len) => {
                assert_eq!(len, 104);
                replied += 1;
            }
            Err(BridgeError::Interrupted { unique }) => {
                assert_eq!(unique, header.unique);
                interrupted += 1;
            }
            Err(other) => panic!("round {round}: unexpected {other:?}"),
        }
        // A cancellation that won queued an INTERRUPT for the daemon.
        while conn.queued_count() > 0 {
            let (extra, _) = read_request(&device);
            assert_eq!(opcode_of(&extra), Opcode::Interrupt);
        }

        let stats = conn.pool_stats();
        assert_eq!(stats.in_use(), 0, "round {round}: {stats:?}");
        assert!(stats.is_consistent(), "round {round}: {stats:?}");
        assert_eq!(conn.pending_count(), 0);
    }
    logger
        .log(&format!("replied={replied} interrupted={interrupted}"))
        .unwrap();
    assert_eq!(replied + interrupted, 200);
    assert!(!conn.is_dying());
}

#[fusebridge_test_utils::logged_test]
fn test_uncancelled_wait_is_unaffected() {
    let (device, conn) = open_device(BridgeConfig::default());
    let cancel = Cancellation::new();
    let dispatcher = conn.dispatcher();
    let waiter_cancel = cancel.clone();
    let waiter = thread::spawn(move || {
        dispatcher
            .build(Opcode::Getattr, 1, 0, &ctx())
            .send_and_wait_with(WaitOptions::cancellable(&waiter_cancel))
            .map(|reply| reply.len())
    });

    let (header, _) = read_request(&device);
    device.write(&reply_bytes(header.unique, &[0u8; 104])).unwrap();
    assert_eq!(waiter.join().unwrap().unwrap(), 104);
    // Cancelling after the fact is harmless.
    cancel.cancel();
    assert_eq!(conn.pool_stats().in_use(), 0);
}

#[fusebridge_test_utils::logged_test]
fn test_daemon_timeout_kills_connection() {
    let mut config = BridgeConfig::default();
    config.daemon_timeout_secs = 1;
    let (device, conn) = open_device(config);
    let dispatcher = conn.dispatcher();

    // A callback request already read by the daemon; only the kill answers it.
    let (tx, rx) = mpsc::channel();
    conn.dispatcher()
        .build(Opcode::Statfs, 1, 0, &ctx())
        .send_with_callback(move |answer| {
            let _ = tx.send(answer.map(|body| body.len()));
        })
        .unwrap();
    read_request(&device);

    let (_events_guard, events) = EventBuffer::install();
    let started = Instant::now();
    let err = dispatcher
        .build(Opcode::Getattr, 1, 0, &ctx())
        .send_and_wait()
        .unwrap_err();
    assert!(matches!(err, BridgeError::DaemonTimeout));
    assert_eq!(err.errno(), libc::ENOTCONN);
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(events.contains("daemon did not respond in time"));
    assert!(events.contains("daemon_pid=4242"));

    assert!(conn.is_dying());
    let bystander = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(bystander, Err(BridgeError::NotConnected)));
    assert_eq!(conn.pool_stats().in_use(), 0);
}
