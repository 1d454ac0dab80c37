//! Driver Error Types
//!
//! 드라이버 에러 정의

use std::io;
use thiserror::Error;

use crate::wire::WireError;

// ============================================================================
// DriverError - 드라이버 에러
// ============================================================================

/// 드라이버 에러
///
/// 소켓 하나가 죽으면 같은 에러가 대기 중인 모든 호출자에게 전달되므로
/// `Clone`을 구현합니다.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    /// 주소 해석 실패
    #[error("Resolution error: {0}")]
    Resolution(String),

    /// 요청한 역할의 서버 없음
    #[error("Unreachable: {0}")]
    Unreachable(String),

    /// 연결 에러 (dial/read/write)
    #[error("Connection error: {0}")]
    Connection(String),

    /// 프로토콜 에러
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// 서버 역할 또는 레플리카 셋 불일치
    #[error("Role mismatch: {0}")]
    RoleMismatch(String),

    /// 서버별 연결 한도 도달 (내부용)
    #[error("Per-server connection limit reached")]
    PoolExhausted,

    /// 타임아웃 에러
    #[error("Timeout: {0}")]
    Timeout(String),

    /// 인증 에러
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// 설정 에러
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// 명령 실패
    #[error("Command error: {code} - {message}")]
    Command { code: i32, message: String },

    /// 쓰기 실패 (getLastError)
    #[error("Write error: {code} - {message}")]
    Write { code: i32, message: String },

    /// 쿼리 실패
    #[error("Query error: {code} - {message}")]
    Query { code: i32, message: String },

    /// 서버에 커서가 없음
    #[error("Cursor not found")]
    CursorNotFound,

    /// 결과 없음
    #[error("Not found")]
    NotFound,

    /// 닫힌 리소스 사용
    #[error("Closed: {0}")]
    Closed(String),

    /// 직렬화 에러
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DriverError {
    /// 해석 에러 생성
    pub fn resolution(msg: impl Into<String>) -> Self {
        Self::Resolution(msg.into())
    }

    /// 도달 불가 에러 생성
    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::Unreachable(msg.into())
    }

    /// 연결 에러 생성
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// 프로토콜 에러 생성
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// 역할 불일치 에러 생성
    pub fn role_mismatch(msg: impl Into<String>) -> Self {
        Self::RoleMismatch(msg.into())
    }

    /// 타임아웃 에러 생성
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// 인증 에러 생성
    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// 설정 에러 생성
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// 명령 에러 생성
    pub fn command(code: i32, message: impl Into<String>) -> Self {
        Self::Command {
            code,
            message: message.into(),
        }
    }

    /// 쓰기 에러 생성
    pub fn write(code: i32, message: impl Into<String>) -> Self {
        Self::Write {
            code,
            message: message.into(),
        }
    }

    /// 쿼리 에러 생성
    pub fn query(code: i32, message: impl Into<String>) -> Self {
        Self::Query {
            code,
            message: message.into(),
        }
    }

    /// 닫힘 에러 생성
    pub fn closed(msg: impl Into<String>) -> Self {
        Self::Closed(msg.into())
    }

    /// 직렬화 에러 생성
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// 재시도 가능 여부
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout(_) | Self::Unreachable(_) | Self::PoolExhausted
        )
    }

    /// 클라이언트 에러 여부
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Authentication(_) | Self::Configuration(_) | Self::Serialization(_)
        )
    }

    /// 중복 키 에러 여부
    pub fn is_dup(&self) -> bool {
        match self {
            Self::Write { code, .. } | Self::Command { code, .. } | Self::Query { code, .. } => {
                is_dup_code(*code)
            }
            _ => false,
        }
    }

    /// 소켓을 죽게 만드는 에러 여부
    pub fn is_socket_fatal(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Protocol(_) | Self::Timeout(_))
    }
}

/// 중복 키 에러 코드 확인
fn is_dup_code(code: i32) -> bool {
    matches!(code, 11000 | 11001 | 12582)
}

impl From<io::Error> for DriverError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => DriverError::Timeout(err.to_string()),
            _ => DriverError::Connection(err.to_string()),
        }
    }
}

impl From<WireError> for DriverError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Io(e) => e.into(),
            WireError::Encode(msg) => DriverError::Serialization(msg),
            other => DriverError::Protocol(other.to_string()),
        }
    }
}

impl From<bson::ser::Error> for DriverError {
    fn from(err: bson::ser::Error) -> Self {
        DriverError::Serialization(err.to_string())
    }
}

impl From<bson::de::Error> for DriverError {
    fn from(err: bson::de::Error) -> Self {
        DriverError::Serialization(err.to_string())
    }
}

// ============================================================================
// Result Type
// ============================================================================

/// 드라이버 결과 타입
pub type DriverResult<T> = Result<T, DriverError>;

// ============================================================================
// Tests
// ============================================================================
