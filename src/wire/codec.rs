//! Frame codec for tokio_util.
//!
//! Every frame is a 16-byte little-endian header followed by the body. The
//! decoder yields raw frames; callers pick the body type from the opcode.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::error::WireError;
use super::message::{Frame, MsgHeader, Reply, Request, HEADER_LEN};
use super::opcode::OpCode;

/// Default maximum message size (48MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 48_000_000;

/// Outgoing request with its assigned id.
#[derive(Debug, Clone)]
pub struct RequestFrame {
    pub request_id: i32,
    pub request: Request,
}

/// Outgoing reply answering `response_to`.
#[derive(Debug, Clone)]
pub struct ReplyFrame {
    pub request_id: i32,
    pub response_to: i32,
    pub reply: Reply,
}

/// Wire codec for framing.
#[derive(Debug, Clone)]
pub struct WireCodec {
    /// Maximum message size
    max_message_size: usize,
}

impl WireCodec {
    /// Create a codec with default settings.
    pub fn new() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Create a codec with a custom max message size.
    pub fn with_max_size(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    /// Configured maximum message size.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn write_frame(
        &self,
        request_id: i32,
        response_to: i32,
        op_code: OpCode,
        dst: &mut BytesMut,
        body: impl FnOnce(&mut BytesMut) -> Result<(), WireError>,
    ) -> Result<(), WireError> {
        let start = dst.len();
        dst.reserve(HEADER_LEN);
        // Length is patched once the body is known.
        MsgHeader {
            message_length: 0,
            request_id,
            response_to,
            op_code,
        }
        .write(dst);

        if let Err(e) = body(dst) {
            dst.truncate(start);
            return Err(e);
        }

        let size = dst.len() - start;
        if size > self.max_message_size {
            dst.truncate(start);
            return Err(WireError::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }
        dst[start..start + 4].copy_from_slice(&(size as i32).to_le_bytes());
        Ok(())
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for WireCodec {
    type Item = Frame;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = i32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        if length < HEADER_LEN as i32 {
            return Err(WireError::protocol(format!("frame length {} below header size", length)));
        }
        let length = length as usize;
        if length > self.max_message_size {
            return Err(WireError::MessageTooLarge {
                size: length,
                max: self.max_message_size,
            });
        }

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let header = MsgHeader::parse(&src[..HEADER_LEN])?;
        src.advance(HEADER_LEN);
        let body = src.split_to(length - HEADER_LEN).freeze();

        Ok(Some(Frame { header, body }))
    }
}

impl Encoder<RequestFrame> for WireCodec {
    type Error = WireError;

    fn encode(&mut self, item: RequestFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let op_code = item.request.op_code();
        self.write_frame(item.request_id, 0, op_code, dst, |buf| {
            item.request.encode_body(buf)
        })
    }
}

impl Encoder<ReplyFrame> for WireCodec {
    type Error = WireError;

    fn encode(&mut self, item: ReplyFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.write_frame(item.request_id, item.response_to, OpCode::Reply, dst, |buf| {
            item.reply.encode_body(buf);
            Ok(())
        })
    }
}

/// Length placeholder helper for hand-built frames in tests.
#[cfg(test)]
pub(crate) fn raw_frame(request_id: i32, response_to: i32, op_code: i32, body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_i32_le((HEADER_LEN + body.len()) as i32);
    buf.put_i32_le(request_id);
    buf.put_i32_le(response_to);
    buf.put_i32_le(op_code);
    buf.put_slice(body);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::document::encode;
    use crate::wire::message::QueryOp;
    use bson::doc;

    #[test]
    fn test_encode_request_frame() {
        let mut codec = WireCodec::new();
        let query = encode(&doc! { "ismaster": 1 }).unwrap();
        let mut buf = BytesMut::new();
        codec
            .encode(
                RequestFrame {
                    request_id: 5,
                    request: Request::Query(QueryOp::new("admin.$cmd", query)),
                },
                &mut buf,
            )
            .unwrap();

        let header = MsgHeader::parse(&buf[..HEADER_LEN]).unwrap();
        assert_eq!(header.message_length as usize, buf.len());
        assert_eq!(header.request_id, 5);
        assert_eq!(header.response_to, 0);
        assert_eq!(header.op_code, OpCode::Query);
    }

    #[test]
    fn test_decode_partial_then_complete() {
        let mut codec = WireCodec::new();
        let reply = Reply::with_documents(vec![encode(&doc! { "ok": 1 }).unwrap()]);
        let mut full = BytesMut::new();
        codec
            .encode(
                ReplyFrame {
                    request_id: 1,
                    response_to: 9,
                    reply: reply.clone(),
                },
                &mut full,
            )
            .unwrap();

        let mut src = BytesMut::new();
        src.extend_from_slice(&full[..10]);
        assert!(codec.decode(&mut src).unwrap().is_none());

        src.extend_from_slice(&full[10..]);
        let frame = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(frame.header.response_to, 9);
        assert_eq!(frame.header.op_code, OpCode::Reply);
        assert_eq!(Reply::decode_body(frame.body).unwrap(), reply);
        assert!(src.is_empty());
    }

    #[test]
    fn test_decode_two_frames_in_one_buffer() {
        let mut codec = WireCodec::new();
        let mut src = BytesMut::new();
        for id in [1, 2] {
            codec
                .encode(
                    ReplyFrame {
                        request_id: id,
                        response_to: id,
                        reply: Reply::default(),
                    },
                    &mut src,
                )
                .unwrap();
        }
        assert_eq!(codec.decode(&mut src).unwrap().unwrap().header.response_to, 1);
        assert_eq!(codec.decode(&mut src).unwrap().unwrap().header.response_to, 2);
        assert!(codec.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn test_decode_rejects_short_length() {
        let mut codec = WireCodec::new();
        let mut src = raw_frame(1, 0, 1, &[]);
        src[0] = 8;
        assert!(matches!(codec.decode(&mut src), Err(WireError::Protocol(_))));
    }

    #[test]
    fn test_decode_rejects_oversized() {
        let mut codec = WireCodec::with_max_size(64);
        let mut src = raw_frame(1, 0, 1, &[0u8; 100]);
        assert!(matches!(
            codec.decode(&mut src),
            Err(WireError::MessageTooLarge { size: 116, max: 64 })
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_opcode() {
        let mut codec = WireCodec::new();
        let mut src = raw_frame(1, 0, 2013, &[]);
        assert!(matches!(codec.decode(&mut src), Err(WireError::UnknownOpCode(2013))));
    }

    #[test]
    fn test_encode_too_large_leaves_buffer_untouched() {
        let mut codec = WireCodec::with_max_size(32);
        let query = encode(&doc! { "payload": "x".repeat(64) }).unwrap();
        let mut buf = BytesMut::new();
        buf.put_u8(0xAA);
        let result = codec.encode(
            RequestFrame {
                request_id: 1,
                request: Request::Query(QueryOp::new("db.c", query)),
            },
            &mut buf,
        );
        assert!(matches!(result, Err(WireError::MessageTooLarge { .. })));
        assert_eq!(&buf[..], &[0xAA]);
    }
}
