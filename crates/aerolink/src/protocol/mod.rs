// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service protocol frames and their wire codec.
//!
//! Every frame is `tag(1) + session_id(8, LE) + body`. Data frames (Next,
//! Complete) travel on the data stream, Error frames on the error stream,
//! and everything else on the service stream. Session id 0 is broadcast.

mod frame;

pub use frame::{
    Frame, FRAME_HEADER_LEN, TAG_CANCEL, TAG_COMPLETE, TAG_ERROR, TAG_HEARTBEAT_REPLY,
    TAG_HEARTBEAT_REQUEST, TAG_JOIN, TAG_MORE, TAG_NEXT, UNBOUNDED,
};
