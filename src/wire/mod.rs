//! # Wire Protocol Implementation
//!
//! Low-level framing for the legacy document-database wire protocol.
//!
//! ## Overview
//!
//! Every message is a frame: a 16-byte header of four little-endian i32
//! fields (`messageLength`, `requestID`, `responseTo`, `opCode`) followed by
//! an opcode-specific body. This module provides:
//!
//! - **Opcodes** - The closed set of message kinds and their flag bits
//! - **Messages** - Request bodies and the reply body
//! - **Documents** - Opaque document buffers split by declared length
//! - **Codec** - Async message framing for Tokio
//!
//! ## Submodules
//!
//! - [`opcode`] - Opcodes and flags
//! - [`message`] - Request/reply types
//! - [`document`] - Raw document framing
//! - [`codec`] - Tokio codec for async I/O
//! - [`error`] - Protocol error types
//!
//! ## Note
//!
//! Most users should use the high-level [`crate::driver`] module instead of
//! interacting with frames directly.

pub mod codec;
pub mod document;
pub mod error;
pub mod message;
pub mod opcode;

pub use codec::{ReplyFrame, RequestFrame, WireCodec, DEFAULT_MAX_MESSAGE_SIZE};
pub use error::{WireError, WireResult};
pub use message::{
    DeleteOp, Frame, GetMoreOp, InsertOp, KillCursorsOp, MsgHeader, QueryOp, Reply, ReplyHeader,
    Request, UpdateOp, HEADER_LEN,
};
pub use opcode::{delete_flags, insert_flags, query_flags, reply_flags, update_flags, OpCode};
