//! Wire message types.
//!
//! Requests form a closed set of kinds. Each kind knows how to write its
//! body and how to read it back. Replies are a single kind carrying the
//! cursor bookkeeping and the raw documents.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::document::{self, get_cstring, get_i32, get_i64, put_cstring};
use super::error::{WireError, WireResult};
use super::opcode::OpCode;

/// Frame header length in bytes.
pub const HEADER_LEN: usize = 16;

/// Frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    /// Total frame length including the header
    pub message_length: i32,
    /// Sender-assigned id
    pub request_id: i32,
    /// Id of the request this frame answers (0 for requests)
    pub response_to: i32,
    /// Body kind
    pub op_code: OpCode,
}

impl MsgHeader {
    /// Parse a header from exactly 16 bytes.
    pub fn parse(raw: &[u8]) -> WireResult<Self> {
        if raw.len() < HEADER_LEN {
            return Err(WireError::protocol(format!("short header: {} bytes", raw.len())));
        }
        let field = |i: usize| i32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Ok(Self {
            message_length: field(0),
            request_id: field(4),
            response_to: field(8),
            op_code: OpCode::from_i32(field(12))?,
        })
    }

    /// Write the header.
    pub fn write(&self, dst: &mut BytesMut) {
        dst.put_i32_le(self.message_length);
        dst.put_i32_le(self.request_id);
        dst.put_i32_le(self.response_to);
        dst.put_i32_le(self.op_code.as_i32());
    }
}

/// A decoded frame whose body is still raw.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: MsgHeader,
    pub body: Bytes,
}

// ============================================================================
// Requests
// ============================================================================

/// OP_QUERY body.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOp {
    pub flags: i32,
    pub collection: String,
    pub skip: i32,
    pub limit: i32,
    pub query: Bytes,
    pub selector: Option<Bytes>,
}

impl QueryOp {
    /// Create a query with no skip, limit or projection.
    pub fn new(collection: impl Into<String>, query: Bytes) -> Self {
        Self {
            flags: 0,
            collection: collection.into(),
            skip: 0,
            limit: 0,
            query,
            selector: None,
        }
    }
}

/// OP_GET_MORE body.
#[derive(Debug, Clone, PartialEq)]
pub struct GetMoreOp {
    pub collection: String,
    pub limit: i32,
    pub cursor_id: i64,
}

/// OP_INSERT body.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertOp {
    pub flags: i32,
    pub collection: String,
    pub documents: Vec<Bytes>,
}

/// OP_UPDATE body.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOp {
    pub collection: String,
    pub flags: i32,
    pub selector: Bytes,
    pub update: Bytes,
}

/// OP_DELETE body.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteOp {
    pub collection: String,
    pub flags: i32,
    pub selector: Bytes,
}

/// OP_KILL_CURSORS body.
#[derive(Debug, Clone, PartialEq)]
pub struct KillCursorsOp {
    pub cursor_ids: Vec<i64>,
}

/// Outgoing request kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Query(QueryOp),
    GetMore(GetMoreOp),
    Insert(InsertOp),
    Update(UpdateOp),
    Delete(DeleteOp),
    KillCursors(KillCursorsOp),
}

impl Request {
    /// Opcode for this request.
    pub fn op_code(&self) -> OpCode {
        match self {
            Request::Query(_) => OpCode::Query,
            Request::GetMore(_) => OpCode::GetMore,
            Request::Insert(_) => OpCode::Insert,
            Request::Update(_) => OpCode::Update,
            Request::Delete(_) => OpCode::Delete,
            Request::KillCursors(_) => OpCode::KillCursors,
        }
    }

    /// Collection namespace targeted by the request, if any.
    pub fn collection(&self) -> Option<&str> {
        match self {
            Request::Query(op) => Some(&op.collection),
            Request::GetMore(op) => Some(&op.collection),
            Request::Insert(op) => Some(&op.collection),
            Request::Update(op) => Some(&op.collection),
            Request::Delete(op) => Some(&op.collection),
            Request::KillCursors(_) => None,
        }
    }

    /// Write the body (without header).
    pub fn encode_body(&self, dst: &mut BytesMut) -> WireResult<()> {
        match self {
            Request::Query(op) => {
                dst.put_i32_le(op.flags);
                put_cstring(dst, &op.collection)?;
                dst.put_i32_le(op.skip);
                dst.put_i32_le(op.limit);
                dst.put_slice(&op.query);
                if let Some(selector) = &op.selector {
                    dst.put_slice(selector);
                }
            }
            Request::GetMore(op) => {
                dst.put_i32_le(0);
                put_cstring(dst, &op.collection)?;
                dst.put_i32_le(op.limit);
                dst.put_i64_le(op.cursor_id);
            }
            Request::Insert(op) => {
                dst.put_i32_le(op.flags);
                put_cstring(dst, &op.collection)?;
                for doc in &op.documents {
                    dst.put_slice(doc);
                }
            }
            Request::Update(op) => {
                dst.put_i32_le(0);
                put_cstring(dst, &op.collection)?;
                dst.put_i32_le(op.flags);
                dst.put_slice(&op.selector);
                dst.put_slice(&op.update);
            }
            Request::Delete(op) => {
                dst.put_i32_le(0);
                put_cstring(dst, &op.collection)?;
                dst.put_i32_le(op.flags);
                dst.put_slice(&op.selector);
            }
            Request::KillCursors(op) => {
                dst.put_i32_le(0);
                dst.put_i32_le(op.cursor_ids.len() as i32);
                for id in &op.cursor_ids {
                    dst.put_i64_le(*id);
                }
            }
        }
        Ok(())
    }

    /// Read a request body for the given opcode.
    pub fn decode_body(op_code: OpCode, mut body: Bytes) -> WireResult<Self> {
        let request = match op_code {
            OpCode::Query => {
                let flags = get_i32(&mut body)?;
                let collection = get_cstring(&mut body)?;
                let skip = get_i32(&mut body)?;
                let limit = get_i32(&mut body)?;
                let query = document::split_document(&mut body)?;
                let selector = if body.has_remaining() {
                    Some(document::split_document(&mut body)?)
                } else {
                    None
                };
                Request::Query(QueryOp {
                    flags,
                    collection,
                    skip,
                    limit,
                    query,
                    selector,
                })
            }
            OpCode::GetMore => {
                let _zero = get_i32(&mut body)?;
                let collection = get_cstring(&mut body)?;
                let limit = get_i32(&mut body)?;
                let cursor_id = get_i64(&mut body)?;
                Request::GetMore(GetMoreOp {
                    collection,
                    limit,
                    cursor_id,
                })
            }
            OpCode::Insert => {
                let flags = get_i32(&mut body)?;
                let collection = get_cstring(&mut body)?;
                let documents = document::split_all(&mut body)?;
                Request::Insert(InsertOp {
                    flags,
                    collection,
                    documents,
                })
            }
            OpCode::Update => {
                let _zero = get_i32(&mut body)?;
                let collection = get_cstring(&mut body)?;
                let flags = get_i32(&mut body)?;
                let selector = document::split_document(&mut body)?;
                let update = document::split_document(&mut body)?;
                Request::Update(UpdateOp {
                    collection,
                    flags,
                    selector,
                    update,
                })
            }
            OpCode::Delete => {
                let _zero = get_i32(&mut body)?;
                let collection = get_cstring(&mut body)?;
                let flags = get_i32(&mut body)?;
                let selector = document::split_document(&mut body)?;
                Request::Delete(DeleteOp {
                    collection,
                    flags,
                    selector,
                })
            }
            OpCode::KillCursors => {
                let _zero = get_i32(&mut body)?;
                let count = get_i32(&mut body)?;
                if count < 0 {
                    return Err(WireError::protocol(format!("negative cursor count {}", count)));
                }
                let mut cursor_ids = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    cursor_ids.push(get_i64(&mut body)?);
                }
                Request::KillCursors(KillCursorsOp { cursor_ids })
            }
            OpCode::Reply => {
                return Err(WireError::protocol("reply opcode used as request"));
            }
        };
        if body.has_remaining() {
            return Err(WireError::protocol(format!(
                "{} body has {} trailing bytes",
                op_code.name(),
                body.remaining()
            )));
        }
        Ok(request)
    }
}

// ============================================================================
// Reply
// ============================================================================

/// OP_REPLY body.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reply {
    pub flags: i32,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub number_returned: i32,
    pub documents: Vec<Bytes>,
}

/// Reply fields without the documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplyHeader {
    pub flags: i32,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub number_returned: i32,
}

impl Reply {
    /// Reply carrying documents and no open cursor.
    pub fn with_documents(documents: Vec<Bytes>) -> Self {
        Self {
            number_returned: documents.len() as i32,
            documents,
            ..Default::default()
        }
    }

    /// Cursor bookkeeping fields.
    pub fn header(&self) -> ReplyHeader {
        ReplyHeader {
            flags: self.flags,
            cursor_id: self.cursor_id,
            starting_from: self.starting_from,
            number_returned: self.number_returned,
        }
    }

    /// Write the body (without header).
    pub fn encode_body(&self, dst: &mut BytesMut) {
        dst.put_i32_le(self.flags);
        dst.put_i64_le(self.cursor_id);
        dst.put_i32_le(self.starting_from);
        dst.put_i32_le(self.number_returned);
        for doc in &self.documents {
            dst.put_slice(doc);
        }
    }

    /// Read a reply body.
    pub fn decode_body(mut body: Bytes) -> WireResult<Self> {
        let flags = get_i32(&mut body)?;
        let cursor_id = get_i64(&mut body)?;
        let starting_from = get_i32(&mut body)?;
        let number_returned = get_i32(&mut body)?;
        if number_returned < 0 {
            return Err(WireError::protocol(format!(
                "negative document count {}",
                number_returned
            )));
        }
        let documents = document::split_all(&mut body)?;
        if documents.len() != number_returned as usize {
            return Err(WireError::protocol(format!(
                "reply declares {} documents, carries {}",
                number_returned,
                documents.len()
            )));
        }
        Ok(Self {
            flags,
            cursor_id,
            starting_from,
            number_returned,
            documents,
        })
    }
}
