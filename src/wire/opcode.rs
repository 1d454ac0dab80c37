//! Opcodes and flag bits.

use super::error::{WireError, WireResult};

/// Message opcode carried in every frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum OpCode {
    /// Reply to a query or getMore
    Reply = 1,
    /// Update documents
    Update = 2001,
    /// Insert documents
    Insert = 2002,
    /// Query a collection (also used for commands)
    Query = 2004,
    /// Fetch the next batch of an open cursor
    GetMore = 2005,
    /// Delete documents
    Delete = 2006,
    /// Close server-side cursors
    KillCursors = 2007,
}

impl OpCode {
    /// Parse a raw opcode.
    pub fn from_i32(value: i32) -> WireResult<Self> {
        match value {
            1 => Ok(Self::Reply),
            2001 => Ok(Self::Update),
            2002 => Ok(Self::Insert),
            2004 => Ok(Self::Query),
            2005 => Ok(Self::GetMore),
            2006 => Ok(Self::Delete),
            2007 => Ok(Self::KillCursors),
            other => Err(WireError::UnknownOpCode(other)),
        }
    }

    /// Raw opcode value.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Opcode name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Reply => "OP_REPLY",
            Self::Update => "OP_UPDATE",
            Self::Insert => "OP_INSERT",
            Self::Query => "OP_QUERY",
            Self::GetMore => "OP_GET_MORE",
            Self::Delete => "OP_DELETE",
            Self::KillCursors => "OP_KILL_CURSORS",
        }
    }

    /// Whether the server answers this opcode with a reply frame.
    pub fn expects_reply(self) -> bool {
        matches!(self, Self::Query | Self::GetMore)
    }
}

/// Query flag bits.
pub mod query_flags {
    pub const TAILABLE: i32 = 1 << 1;
    pub const SLAVE_OK: i32 = 1 << 2;
    pub const NO_CURSOR_TIMEOUT: i32 = 1 << 4;
    pub const AWAIT_DATA: i32 = 1 << 5;
    pub const EXHAUST: i32 = 1 << 6;
    pub const PARTIAL: i32 = 1 << 7;
}

/// Reply flag bits.
pub mod reply_flags {
    pub const CURSOR_NOT_FOUND: i32 = 1;
    pub const QUERY_FAILURE: i32 = 1 << 1;
    pub const AWAIT_CAPABLE: i32 = 1 << 3;
}

/// Update flag bits.
pub mod update_flags {
    pub const UPSERT: i32 = 1;
    pub const MULTI: i32 = 1 << 1;
}

/// Insert flag bits.
pub mod insert_flags {
    pub const CONTINUE_ON_ERROR: i32 = 1;
}

/// Delete flag bits.
pub mod delete_flags {
    pub const SINGLE_REMOVE: i32 = 1;
}
