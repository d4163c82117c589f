// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! IPC protocol for daemon communication.
//!
//! Wire format: 4-byte length prefix (big-endian), 2-byte destination
//! code, 4-byte request id, 1-byte frame type, then an opaque payload.
//! Payloads are CBOR application messages; the framing layer never
//! inspects them.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod frame;
mod messages;

pub use frame::{
    decode, encode, read_frame, read_frame_unbounded, write_frame, Destination, Frame, FrameType,
    ProtocolError, MAX_FRAME_BYTES,
};
pub use messages::{
    decode_payload, encode_payload, AuthAck, AuthRequest, CliRequest, CliResponse, ComponentInfo,
    ConfigEvent, ConfigRequest, ConfigResponse, CredentialDoc, CredentialsRequest, ErrorBody,
    LifecycleRequest, LifecycleResponse, PayloadError, ValidityStatus,
};
