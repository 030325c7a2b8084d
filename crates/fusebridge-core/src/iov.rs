// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Growable message buffers
//!
//! An [`Iov`] keeps its allocation across requests. It grows whenever a
//! request needs more room, but only shrinks after it has been oversized by
//! more than `permanent_bufsize` for `credit` consecutive adjustments, so a
//! ticket that alternates between large and small requests does not
//! reallocate on every cycle.

use crate::config::IovConfig;
use crate::error::{BridgeError, BridgeResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IovPolicy {
    pub credit: i32,
    pub permanent_bufsize: usize,
    pub min_alloc: usize,
}

impl From<&IovConfig> for IovPolicy {
    fn from(config: &IovConfig) -> Self {
        Self {
            credit: config.credit,
            permanent_bufsize: config.permanent_bufsize,
            min_alloc: config.min_alloc.max(1),
        }
    }
}

impl Default for IovPolicy {
    fn default() -> Self {
        Self::from(&IovConfig::default())
    }
}

#[derive(Debug)]
pub struct Iov {
    buf: Vec<u8>,
    len: usize,
    credit: i32,
    policy: IovPolicy,
}

impl Iov {
    pub fn new(policy: IovPolicy, initial: usize) -> Self {
        let mut iov = Self {
            buf: Vec::new(),
            len: 0,
            credit: policy.credit,
            policy,
        };
        iov.adjust(initial);
        iov
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes currently allocated.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }

    fn needs_realloc(&mut self, size: usize) -> bool {
        let allocated = self.buf.len();
        if allocated < size {
            return true;
        }
        if allocated - size > self.policy.permanent_bufsize {
            self.credit -= 1;
            return self.credit < 0;
        }
        false
    }

    fn target(&self, size: usize) -> usize {
        size.max(self.policy.min_alloc)
    }

    /// Set the logical length to `size`, reallocating per the credit policy.
    ///
    /// Contents are not preserved across a reallocation. Allocation failure
    /// aborts the process.
    pub fn adjust(&mut self, size: usize) {
        if self.needs_realloc(size) {
            self.buf = vec![0u8; self.target(size)];
            self.credit = self.policy.credit;
        }
        self.len = size;
    }

    /// Fallible variant of [`Iov::adjust`].
    ///
    /// On failure the buffer is left as it was.
    pub fn try_adjust(&mut self, size: usize) -> BridgeResult<()> {
        if self.needs_realloc(size) {
            let target = self.target(size);
            let mut fresh = Vec::new();
            fresh.try_reserve_exact(target).map_err(|_| BridgeError::OutOfMemory)?;
            fresh.resize(target, 0);
            self.buf = fresh;
            self.credit = self.policy.credit;
        }
        self.len = size;
        Ok(())
    }

    /// Clear the used bytes and return to zero length.
    pub fn refresh(&mut self) {
        let len = self.len;
        self.buf[..len].fill(0);
        self.adjust(0);
    }

    /// Replace the contents with `bytes`.
    pub fn fill_from(&mut self, bytes: &[u8]) -> BridgeResult<()> {
        self.try_adjust(bytes.len())?;
        self.as_mut_slice().copy_from_slice(bytes);
        Ok(())
    }
}
