// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Coarse filesystem-wide lock
//!
//! Filesystem operations run under a single exclusive lock. A thread that
//! sleeps for a daemon reply must give it up first, otherwise a daemon that
//! itself touches the filesystem would deadlock behind the sleeper.

use std::sync::{Condvar, Mutex};

use crate::lock;

#[derive(Debug, Default)]
pub struct BigLock {
    held: Mutex<bool>,
    released: Condvar,
}

impl BigLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> BigLockGuard<'_> {
        self.acquire();
        BigLockGuard { lock: self }
    }

    pub fn is_locked(&self) -> bool {
        *lock(&self.held)
    }

    fn acquire(&self) {
        let mut held = lock(&self.held);
        while *held {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        *held = true;
    }

    fn release(&self) {
        *lock(&self.held) = false;
        self.released.notify_one();
    }
}

/// Exclusive hold on a [`BigLock`].
#[derive(Debug)]
pub struct BigLockGuard<'a> {
    lock: &'a BigLock,
}

impl BigLockGuard<'_> {
    /// Run `f` with the lock released, taking it back before returning.
    pub fn unlocked<R>(&self, f: impl FnOnce() -> R) -> R {
        struct Relock<'b>(&'b BigLock);
        impl Drop for Relock<'_> {
            fn drop(&mut self) {
                self.0.acquire();
            }
        }

        self.lock.release();
        let _relock = Relock(self.lock);
        f()
    }
}

impl Drop for BigLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
