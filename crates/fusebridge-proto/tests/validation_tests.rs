// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use fusebridge_proto::*;

/// Helper assembling a full reply the way a daemon writes it
fn reply_bytes(unique: u64, error: i32, body: &[u8]) -> Vec<u8> {
    let header = if error == 0 {
        ReplyHeader::success(unique, body.len())
    } else {
        let mut h = ReplyHeader::failure(unique, error);
        h.len += body.len() as u32;
        h
    };
    let mut bytes = header.to_bytes();
    bytes.extend_from_slice(body);
    bytes
}

fn read_payload(size: u32) -> Vec<u8> {
    ReadIn {
        fh: 3,
        offset: 0,
        size,
        flags: 0,
    }
    .to_bytes()
}

#[fusebridge_test_utils::logged_test]
fn test_parse_reply_accepts_empty_success() {
    let bytes = reply_bytes(1, 0, &[]);
    let (header, body) = parse_reply(&bytes).unwrap();
    assert_eq!(header.unique, 1);
    assert_eq!(header.len, 16);
    assert!(body.is_empty());
}

#[fusebridge_test_utils::logged_test]
fn test_parse_reply_rejects_short_write() {
    let err = parse_reply(&[0u8; 15]).unwrap_err();
    assert!(matches!(err, ProtocolError::ShortHeader { .. }));
    assert_eq!(err.errno(), libc::EINVAL);
}

#[fusebridge_test_utils::logged_test]
fn test_parse_reply_rejects_length_mismatch() {
    let mut bytes = reply_bytes(4, 0, &[1, 2, 3, 4]);
    bytes.push(5);
    let err = parse_reply(&bytes).unwrap_err();
    assert_eq!(
        err,
        ProtocolError::LengthMismatch {
            declared: 20,
            supplied: 21
        }
    );
}

#[fusebridge_test_utils::logged_test]
fn test_parse_reply_rejects_error_with_body() {
    let bytes = reply_bytes(4, libc::EIO, &[0u8; 8]);
    let err = parse_reply(&bytes).unwrap_err();
    assert!(matches!(err, ProtocolError::ErrorWithBody { body_len: 8, .. }));
}

#[fusebridge_test_utils::logged_test]
fn test_error_reply_passes_errno_through() {
    let bytes = reply_bytes(8, libc::ENOENT, &[]);
    let (header, body) = parse_reply(&bytes).unwrap();
    assert_eq!(header.errno(), libc::ENOENT);
    assert!(body.is_empty());
}

#[fusebridge_test_utils::logged_test]
fn test_audit_read_is_bounded_by_request() {
    let payload = read_payload(4096);
    assert!(audit_reply_body(Opcode::Read, &payload, 0).is_ok());
    assert!(audit_reply_body(Opcode::Read, &payload, 4096).is_ok());
    assert!(audit_reply_body(Opcode::Readdir, &payload, 4097).is_err());
}

#[fusebridge_test_utils::logged_test]
fn test_audit_readlink_bound() {
    assert!(audit_reply_body(Opcode::Readlink, &[], 12).is_ok());
    assert!(audit_reply_body(Opcode::Readlink, &[], READLINK_MAX).is_ok());
    assert!(audit_reply_body(Opcode::Readlink, &[], READLINK_MAX + 1).is_err());
}

#[fusebridge_test_utils::logged_test]
fn test_audit_init_accepts_legacy_size() {
    assert!(audit_reply_body(Opcode::Init, &[], InitOut::LEN).is_ok());
    assert!(audit_reply_body(Opcode::Init, &[], 8).is_ok());
    assert!(audit_reply_body(Opcode::Init, &[], 16).is_err());
}

#[fusebridge_test_utils::logged_test]
fn test_audit_zero_body_opcodes() {
    for op in [
        Opcode::Unlink,
        Opcode::Rmdir,
        Opcode::Rename,
        Opcode::Release,
        Opcode::Fsync,
        Opcode::Flush,
        Opcode::Access,
        Opcode::Destroy,
        Opcode::Setlk,
    ] {
        assert!(audit_reply_body(op, &[], 0).is_ok(), "{op} should accept empty body");
        assert!(audit_reply_body(op, &[], 1).is_err(), "{op} should refuse a body");
    }
}

#[fusebridge_test_utils::logged_test]
fn test_audit_unchecked_opcodes() {
    assert!(audit_reply_body(Opcode::Getxattr, &[], 0).is_ok());
    assert!(audit_reply_body(Opcode::Listxattr, &[], 65536).is_ok());
}

#[fusebridge_test_utils::logged_test]
fn test_request_header_parse_needs_forty_bytes() {
    let err = RequestHeader::parse(&[0u8; 24]).unwrap_err();
    assert_eq!(err, ProtocolError::ShortHeader { got: 24, need: 40 });
}
