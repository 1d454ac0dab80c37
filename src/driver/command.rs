//! 명령 응답 처리
//!
//! `ok` 필드 검사와 상태 명령(`ismaster`) 응답 타입.

use bson::{Bson, Document};
use serde::Deserialize;

use super::error::{DriverError, DriverResult};

/// `ok` 필드가 성공을 나타내는지 확인
pub fn is_ok(reply: &Document) -> bool {
    match reply.get("ok") {
        Some(Bson::Double(v)) => *v == 1.0,
        Some(Bson::Int32(v)) => *v == 1,
        Some(Bson::Int64(v)) => *v == 1,
        Some(Bson::Boolean(v)) => *v,
        _ => false,
    }
}

/// 응답의 에러 코드
pub fn error_code(reply: &Document) -> i32 {
    match reply.get("code") {
        Some(Bson::Int32(v)) => *v,
        Some(Bson::Int64(v)) => *v as i32,
        Some(Bson::Double(v)) => *v as i32,
        _ => 0,
    }
}

/// 응답의 에러 메시지
pub fn error_message(reply: &Document) -> String {
    ["errmsg", "$err", "err"]
        .iter()
        .find_map(|key| reply.get_str(key).ok())
        .unwrap_or("unknown error")
        .to_string()
}

/// 명령 응답 검사
pub fn check_command(reply: Document) -> DriverResult<Document> {
    if is_ok(&reply) {
        Ok(reply)
    } else {
        Err(DriverError::command(error_code(&reply), error_message(&reply)))
    }
}

/// 쿼리 실패 문서를 에러로 변환
pub fn query_failure(reply: &Document) -> DriverError {
    DriverError::query(error_code(reply), error_message(reply))
}

// ============================================================================
// IsMasterResult - 상태 명령 응답
// ============================================================================

/// `ismaster` 응답
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct IsMasterResult {
    #[serde(rename = "ismaster")]
    pub is_master: bool,
    pub secondary: bool,
    #[serde(rename = "arbiterOnly")]
    pub arbiter_only: Option<bool>,
    pub primary: Option<String>,
    pub hosts: Vec<String>,
    pub passives: Vec<String>,
    pub tags: Option<Document>,
    pub msg: Option<String>,
    #[serde(rename = "setName")]
    pub set_name: Option<String>,
    #[serde(rename = "maxWireVersion")]
    pub max_wire_version: i32,
    #[serde(rename = "maxMessageSizeBytes")]
    pub max_message_size: Option<i64>,
    #[serde(rename = "maxWriteBatchSize")]
    pub max_write_batch_size: Option<i64>,
}

impl IsMasterResult {
    /// 라우터(mongos) 여부
    pub fn is_mongos(&self) -> bool {
        self.msg.as_deref() == Some("isdbgrid")
    }

    /// 추가 탐색 대상 호스트 (primary를 맨 앞에)
    pub fn candidate_hosts(&self) -> Vec<String> {
        let mut hosts = Vec::with_capacity(1 + self.hosts.len() + self.passives.len());
        if let Some(primary) = &self.primary {
            if !primary.is_empty() {
                hosts.push(primary.clone());
            }
        }
        hosts.extend(self.hosts.iter().cloned());
        hosts.extend(self.passives.iter().cloned());
        hosts
    }
}
