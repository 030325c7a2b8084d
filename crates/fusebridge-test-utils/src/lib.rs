// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Test support shared by the fusebridge crates
//!
//! Every test wrapped in [`logged_test`] gets its own log file under
//! `target/test-logs/`. `tracing` events emitted on the test thread are
//! appended to the same file, so bridge diagnostics sit next to the test's
//! own notes. Passing tests print one line; failing tests print the log path.

extern crate self as fusebridge_test_utils;

pub mod capture;
pub mod guard;
pub mod logging;

pub use capture::{capture_tracing, CaptureGuard, EventBuffer};
pub use fusebridge_test_utils_macros::logged_test;
pub use guard::TestLoggerGuard;
pub use logging::{create_unique_test_log, TestLogError, TestLogger};
