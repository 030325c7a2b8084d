// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Wire types shared by the kernel side and daemons
//!
//! This crate defines the request/reply headers, the opcode table with its
//! expected reply sizes, the handful of fixed payload records the bridge
//! builds itself, and the validation applied to every daemon reply.

pub mod header;
pub mod messages;
pub mod opcode;
pub mod validation;

pub use header::{ReplyHeader, RequestHeader, REPLY_HEADER_LEN, REQUEST_HEADER_LEN};
pub use messages::{
    ForgetIn, InitIn, InitOut, InterruptIn, ReadIn, WireRecord, KERNEL_MINOR_VERSION,
    KERNEL_VERSION, ROOT_ID,
};
pub use opcode::{Opcode, ReplyBody, READLINK_MAX};
pub use validation::*;
