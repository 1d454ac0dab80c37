//! 쓰기 확인
//!
//! 쓰기 op 뒤에 `getLastError` 질의를 같은 배치로 붙여 확인 조건을 걸고,
//! 큰 삽입은 서버 한도에 맞게 나눠 보냅니다.

use std::ops::Range;

use bson::{doc, Bson, Document};
use serde::Deserialize;

use super::command::{error_code, error_message, is_ok};
use super::error::{DriverError, DriverResult};
use super::socket::{await_first, first_reply, Op, Socket};
use crate::wire::{document, insert_flags, InsertOp, QueryOp, Request, HEADER_LEN};

// ============================================================================
// WriteConcern - 확인 조건
// ============================================================================

/// 복제 확인 대상
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum W {
    /// 노드 수
    Nodes(i32),
    /// 과반수
    Majority,
    /// 태그 모드
    Tag(String),
}

/// 쓰기 확인 조건
///
/// 세션에 `None`을 두면 확인 없이 보냅니다.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteConcern {
    /// 복제 확인 대상
    pub w: Option<W>,
    /// 복제 대기 한도 (밀리초, 0이면 무제한)
    pub wtimeout: i32,
    /// 디스크 동기화
    pub fsync: bool,
    /// 저널 기록
    pub journal: bool,
}

impl WriteConcern {
    /// 프라이머리 확인만
    pub fn acknowledged() -> Self {
        Self::default()
    }

    /// 과반수 확인
    pub fn majority() -> Self {
        Self {
            w: Some(W::Majority),
            ..Self::default()
        }
    }

    /// 노드 수 확인
    pub fn nodes(n: i32) -> Self {
        Self {
            w: Some(W::Nodes(n)),
            ..Self::default()
        }
    }

    /// 복제 대기 한도 설정
    pub fn with_wtimeout(mut self, millis: i32) -> Self {
        self.wtimeout = millis;
        self
    }

    /// 저널 기록 요구
    pub fn with_journal(mut self) -> Self {
        self.journal = true;
        self
    }

    /// 디스크 동기화 요구
    pub fn with_fsync(mut self) -> Self {
        self.fsync = true;
        self
    }

    /// `getLastError` 명령 문서
    pub fn command(&self) -> Document {
        let mut cmd = doc! { "getLastError": 1 };
        match &self.w {
            Some(W::Nodes(n)) => {
                cmd.insert("w", *n);
            }
            Some(W::Majority) => {
                cmd.insert("w", "majority");
            }
            Some(W::Tag(tag)) => {
                cmd.insert("w", tag.as_str());
            }
            None => {}
        }
        if self.wtimeout > 0 {
            cmd.insert("wtimeout", self.wtimeout);
        }
        if self.fsync {
            cmd.insert("fsync", true);
        }
        if self.journal {
            cmd.insert("j", true);
        }
        cmd
    }
}

// ============================================================================
// LastError / WriteResult
// ============================================================================

/// `getLastError` 응답
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct LastError {
    pub err: Option<String>,
    pub code: i32,
    pub n: i64,
    #[serde(rename = "updatedExisting")]
    pub updated_existing: bool,
    pub upserted: Option<Bson>,
    pub wtimeout: bool,
}

/// 쓰기 결과
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteResult {
    /// 영향받은 문서 수
    pub n: i64,
    /// 기존 문서를 갱신했는지 여부
    pub updated_existing: bool,
    /// upsert로 생긴 문서의 `_id`
    pub upserted_id: Option<Bson>,
}

impl From<LastError> for WriteResult {
    fn from(last: LastError) -> Self {
        Self {
            n: last.n,
            updated_existing: last.updated_existing,
            upserted_id: last.upserted,
        }
    }
}

/// 응답 문서 해석
pub fn parse_last_error(reply: Document) -> DriverResult<LastError> {
    if !is_ok(&reply) {
        return Err(DriverError::command(error_code(&reply), error_message(&reply)));
    }
    let last: LastError = bson::from_document(reply)?;
    if let Some(message) = &last.err {
        return Err(DriverError::write(last.code, message.clone()));
    }
    Ok(last)
}

/// `db.collection`을 나눔
pub fn split_namespace(ns: &str) -> DriverResult<(&str, &str)> {
    match ns.split_once('.') {
        Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok((db, coll)),
        _ => Err(DriverError::configuration(format!("invalid namespace: {:?}", ns))),
    }
}

// ============================================================================
// 전송
// ============================================================================

/// 쓰기 op 하나 전송
///
/// 확인 조건이 있으면 `getLastError`를 같은 쓰기로 보내고 결과를 기다립니다.
pub(crate) async fn send_write(
    socket: &Socket,
    request: Request,
    concern: Option<&WriteConcern>,
) -> DriverResult<Option<LastError>> {
    let Some(concern) = concern else {
        socket.query(vec![Op::new(request)]).await?;
        return Ok(None);
    };

    let ns = request
        .collection()
        .ok_or_else(|| DriverError::configuration("write without a namespace"))?;
    let (db, _) = split_namespace(ns)?;
    let mut gle = QueryOp::new(format!("{}.$cmd", db), document::encode(&concern.command())?);
    gle.limit = -1;

    let (callback, reply) = first_reply();
    socket
        .query(vec![
            Op::new(request),
            Op::with_reply(Request::Query(gle), callback),
        ])
        .await?;
    let raw = await_first(reply).await?;
    parse_last_error(document::decode(&raw)?).map(Some)
}

/// 문서 크기 목록을 개수와 바이트 한도로 나눔
///
/// 한도를 넘는 문서 하나는 혼자 한 묶음이 됩니다.
pub fn chunk_ranges(sizes: &[usize], max_count: usize, max_bytes: usize) -> Vec<Range<usize>> {
    let max_count = max_count.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut bytes = 0;

    for (i, size) in sizes.iter().enumerate() {
        let count = i - start;
        if count > 0 && (count >= max_count || bytes + size > max_bytes) {
            chunks.push(start..i);
            start = i;
            bytes = 0;
        }
        bytes += size;
    }
    if start < sizes.len() {
        chunks.push(start..sizes.len());
    }
    chunks
}

/// 삽입을 서버 한도에 맞게 나눠 전송
///
/// 순서 있는 삽입은 첫 실패에서 멈추고, `CONTINUE_ON_ERROR`이면 끝까지
/// 보낸 뒤 첫 에러를 돌려줍니다.
pub(crate) async fn send_insert(
    socket: &Socket,
    op: InsertOp,
    concern: Option<&WriteConcern>,
) -> DriverResult<WriteResult> {
    let info = socket.server_info();
    let overhead = HEADER_LEN + 4 + op.collection.len() + 1;
    let max_bytes = info.max_message_size.saturating_sub(overhead);
    let sizes: Vec<usize> = op.documents.iter().map(|d| d.len()).collect();
    let chunks = chunk_ranges(&sizes, info.max_batch_size, max_bytes);
    let ordered = op.flags & insert_flags::CONTINUE_ON_ERROR == 0;

    if chunks.len() > 1 {
        tracing::debug!(
            "Splitting insert into {} of {} documents into {} batches",
            op.collection,
            op.documents.len(),
            chunks.len()
        );
    }

    let mut result = WriteResult::default();
    let mut first_err = None;
    for range in chunks {
        let chunk = InsertOp {
            flags: op.flags,
            collection: op.collection.clone(),
            documents: op.documents[range].to_vec(),
        };
        match send_write(socket, Request::Insert(chunk), concern).await {
            Ok(Some(last)) => result.n += last.n,
            Ok(None) => {}
            Err(e) if ordered => return Err(e),
            Err(e) => {
                first_err.get_or_insert(e);
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(result),
    }
}
