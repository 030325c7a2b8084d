// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Kernel side of a FUSE bridge
//!
//! Filesystem threads build requests through a [`Dispatcher`], the daemon
//! reads them and writes replies through a [`DeviceChannel`], and the
//! [`Connection`] ties both ends to one session and its lifecycle.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod biglock;
pub mod config;
pub mod connection;
pub mod device;
pub mod dispatcher;
pub mod error;
mod handshake;
pub mod iov;
mod pool;
mod queue;
pub mod testing;
mod ticket;

pub use biglock::{BigLock, BigLockGuard};
pub use config::{BridgeConfig, HandshakeConfig, IovConfig, PoolConfig};
pub use connection::{Connection, ConnectionState, DaemonCredentials};
pub use device::DeviceChannel;
pub use dispatcher::{Cancellation, Dispatcher, Reply, Request, RequestContext, WaitOptions};
pub use error::{BridgeError, BridgeResult};
pub use handshake::Negotiated;
pub use iov::{Iov, IovPolicy};
pub use pool::PoolStats;

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
