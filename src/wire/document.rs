//! Raw document framing.
//!
//! Documents travel as opaque byte buffers. The only thing this layer reads
//! from them is the leading little-endian i32 total length.

use bson::Document;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::{WireError, WireResult};

/// Smallest valid document: length prefix plus terminating NUL.
pub const MIN_DOCUMENT_SIZE: usize = 5;

/// Encode a document into its raw form.
pub fn encode(doc: &Document) -> WireResult<Bytes> {
    let mut buf = Vec::with_capacity(64);
    doc.to_writer(&mut buf)?;
    Ok(Bytes::from(buf))
}

/// Decode a raw document.
pub fn decode(raw: &[u8]) -> WireResult<Document> {
    Document::from_reader(raw).map_err(|e| WireError::MalformedDocument(e.to_string()))
}

/// Declared length of the document at the front of `buf`, validated against
/// the bytes available.
pub fn declared_len(buf: &[u8]) -> WireResult<usize> {
    if buf.len() < 4 {
        return Err(WireError::MalformedDocument(format!(
            "need 4 bytes for length prefix, have {}",
            buf.len()
        )));
    }
    let len = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len < MIN_DOCUMENT_SIZE as i32 {
        return Err(WireError::MalformedDocument(format!("declared length {}", len)));
    }
    let len = len as usize;
    if len > buf.len() {
        return Err(WireError::MalformedDocument(format!(
            "declared length {} exceeds remaining {}",
            len,
            buf.len()
        )));
    }
    Ok(len)
}

/// Split one document off the front of `buf`.
pub fn split_document(buf: &mut Bytes) -> WireResult<Bytes> {
    let len = declared_len(buf)?;
    Ok(buf.split_to(len))
}

/// Split every remaining document off `buf`.
pub fn split_all(buf: &mut Bytes) -> WireResult<Vec<Bytes>> {
    let mut docs = Vec::new();
    while buf.has_remaining() {
        docs.push(split_document(buf)?);
    }
    Ok(docs)
}

/// Write a NUL-terminated string.
pub fn put_cstring(dst: &mut BytesMut, s: &str) -> WireResult<()> {
    if s.as_bytes().contains(&0) {
        return Err(WireError::Encode(format!("cstring contains NUL: {:?}", s)));
    }
    dst.put_slice(s.as_bytes());
    dst.put_u8(0);
    Ok(())
}

/// Read a NUL-terminated string.
pub fn get_cstring(buf: &mut Bytes) -> WireResult<String> {
    let end = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| WireError::protocol("unterminated cstring"))?;
    let raw = buf.split_to(end);
    buf.advance(1);
    String::from_utf8(raw.to_vec()).map_err(|e| WireError::protocol(format!("cstring: {}", e)))
}

/// Read a little-endian i32, failing on short input.
pub fn get_i32(buf: &mut Bytes) -> WireResult<i32> {
    if buf.remaining() < 4 {
        return Err(WireError::protocol("short read for i32"));
    }
    Ok(buf.get_i32_le())
}

/// Read a little-endian i64, failing on short input.
pub fn get_i64(buf: &mut Bytes) -> WireResult<i64> {
    if buf.remaining() < 8 {
        return Err(WireError::protocol("short read for i64"));
    }
    Ok(buf.get_i64_le())
}
