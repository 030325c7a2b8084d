// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Operation codes and the reply-body size table

use serde::{Deserialize, Serialize};

use crate::validation::ProtocolError;

/// Largest body the daemon may return for a readlink.
pub const READLINK_MAX: usize = 4096;

/// Operation carried by a request header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum Opcode {
    Lookup = 1,
    Forget = 2,
    Getattr = 3,
    Setattr = 4,
    Readlink = 5,
    Symlink = 6,
    Mknod = 8,
    Mkdir = 9,
    Unlink = 10,
    Rmdir = 11,
    Rename = 12,
    Link = 13,
    Open = 14,
    Read = 15,
    Write = 16,
    Statfs = 17,
    Release = 18,
    Fsync = 20,
    Setxattr = 21,
    Getxattr = 22,
    Listxattr = 23,
    Removexattr = 24,
    Flush = 25,
    Init = 26,
    Opendir = 27,
    Readdir = 28,
    Releasedir = 29,
    Fsyncdir = 30,
    Getlk = 31,
    Setlk = 32,
    Setlkw = 33,
    Access = 34,
    Create = 35,
    Interrupt = 36,
    Bmap = 37,
    Destroy = 38,
    Ioctl = 39,
    Setvolname = 61,
    Getxtimes = 62,
    Exchange = 63,
}

/// Shape of the body a daemon is allowed to send back for an opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyBody {
    /// Exactly this many bytes.
    Exact(usize),
    /// Any one of the listed sizes (older daemons send truncated records).
    AnyOf(&'static [usize]),
    /// Anything up to the bound.
    AtMost(usize),
    /// Up to the `size` field of the request's read record.
    UpToRequested,
    /// Size is opcode-defined by the daemon and not audited.
    Unchecked,
    /// The opcode never gets a reply.
    NoReply,
}

const ENTRY_OUT: usize = 128;
const ATTR_OUT: usize = 104;
const OPEN_OUT: usize = 16;
const WRITE_OUT: usize = 8;
const STATFS_OUT: usize = 80;
const INIT_OUT: usize = 24;
const INIT_OUT_COMPAT: usize = 8;
const GETXTIMES_OUT: usize = 24;
const LK_OUT: usize = 24;
const CREATE_OUT: usize = ENTRY_OUT + OPEN_OUT;
const BMAP_OUT: usize = 8;

impl Opcode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Lookup => "lookup",
            Opcode::Forget => "forget",
            Opcode::Getattr => "getattr",
            Opcode::Setattr => "setattr",
            Opcode::Readlink => "readlink",
            Opcode::Symlink => "symlink",
            Opcode::Mknod => "mknod",
            Opcode::Mkdir => "mkdir",
            Opcode::Unlink => "unlink",
            Opcode::Rmdir => "rmdir",
            Opcode::Rename => "rename",
            Opcode::Link => "link",
            Opcode::Open => "open",
            Opcode::Read => "read",
            Opcode::Write => "write",
            Opcode::Statfs => "statfs",
            Opcode::Release => "release",
            Opcode::Fsync => "fsync",
            Opcode::Setxattr => "setxattr",
            Opcode::Getxattr => "getxattr",
            Opcode::Listxattr => "listxattr",
            Opcode::Removexattr => "removexattr",
            Opcode::Flush => "flush",
            Opcode::Init => "init",
            Opcode::Opendir => "opendir",
            Opcode::Readdir => "readdir",
            Opcode::Releasedir => "releasedir",
            Opcode::Fsyncdir => "fsyncdir",
            Opcode::Getlk => "getlk",
            Opcode::Setlk => "setlk",
            Opcode::Setlkw => "setlkw",
            Opcode::Access => "access",
            Opcode::Create => "create",
            Opcode::Interrupt => "interrupt",
            Opcode::Bmap => "bmap",
            Opcode::Destroy => "destroy",
            Opcode::Ioctl => "ioctl",
            Opcode::Setvolname => "setvolname",
            Opcode::Getxtimes => "getxtimes",
            Opcode::Exchange => "exchange",
        }
    }

    /// Expected reply body for this opcode.
    ///
    /// This table is part of the wire contract: the kernel side refuses any
    /// reply whose body does not fit the entry for the request's opcode.
    pub fn reply_body(self) -> ReplyBody {
        use Opcode::*;
        match self {
            Lookup | Symlink | Mknod | Mkdir | Link => ReplyBody::Exact(ENTRY_OUT),
            Getattr | Setattr => ReplyBody::Exact(ATTR_OUT),
            Open | Opendir => ReplyBody::Exact(OPEN_OUT),
            Write => ReplyBody::Exact(WRITE_OUT),
            Statfs => ReplyBody::Exact(STATFS_OUT),
            Init => ReplyBody::AnyOf(&[INIT_OUT, INIT_OUT_COMPAT]),
            Getxtimes => ReplyBody::Exact(GETXTIMES_OUT),
            Getlk => ReplyBody::Exact(LK_OUT),
            Create => ReplyBody::Exact(CREATE_OUT),
            Bmap => ReplyBody::Exact(BMAP_OUT),
            Unlink | Rmdir | Rename | Release | Fsync | Flush | Releasedir | Fsyncdir | Access
            | Destroy | Exchange | Setvolname | Setlk | Setlkw => ReplyBody::Exact(0),
            Readlink => ReplyBody::AtMost(READLINK_MAX),
            Read | Readdir => ReplyBody::UpToRequested,
            Setxattr | Getxattr | Listxattr | Removexattr | Interrupt | Ioctl => {
                ReplyBody::Unchecked
            }
            Forget => ReplyBody::NoReply,
        }
    }

    /// Whether a request with this opcode expects the daemon to answer.
    pub fn expects_reply(self) -> bool {
        !matches!(self, Opcode::Forget)
    }
}

impl TryFrom<u32> for Opcode {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        use Opcode::*;
        let op = match value {
            1 => Lookup,
            2 => Forget,
            3 => Getattr,
            4 => Setattr,
            5 => Readlink,
            6 => Symlink,
            8 => Mknod,
            9 => Mkdir,
            10 => Unlink,
            11 => Rmdir,
            12 => Rename,
            13 => Link,
            14 => Open,
            15 => Read,
            16 => Write,
            17 => Statfs,
            18 => Release,
            20 => Fsync,
            21 => Setxattr,
            22 => Getxattr,
            23 => Listxattr,
            24 => Removexattr,
            25 => Flush,
            26 => Init,
            27 => Opendir,
            28 => Readdir,
            29 => Releasedir,
            30 => Fsyncdir,
            31 => Getlk,
            32 => Setlk,
            33 => Setlkw,
            34 => Access,
            35 => Create,
            36 => Interrupt,
            37 => Bmap,
            38 => Destroy,
            39 => Ioctl,
            61 => Setvolname,
            62 => Getxtimes,
            63 => Exchange,
            other => return Err(ProtocolError::UnknownOpcode(other)),
        };
        Ok(op)
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
