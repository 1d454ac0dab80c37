//! 인증
//!
//! 자격 증명과 인증 전략 트레이트. 실제 핸드셰이크(SCRAM 등)는 드라이버
//! 외부에서 [`Authenticator`] 구현으로 주입됩니다.

use std::fmt;

use async_trait::async_trait;

use super::error::DriverResult;
use super::socket::Socket;

/// 기본 인증 데이터베이스
pub const DEFAULT_AUTH_SOURCE: &str = "admin";

// ============================================================================
// Credential - 자격 증명
// ============================================================================

/// 자격 증명
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential {
    /// 사용자 이름
    pub username: String,
    /// 비밀번호
    pub password: String,
    /// 인증 데이터베이스
    pub source: String,
    /// 인증 메커니즘
    pub mechanism: Option<String>,
}

impl Credential {
    /// 새 자격 증명 생성
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            source: DEFAULT_AUTH_SOURCE.to_string(),
            mechanism: None,
        }
    }

    /// 인증 데이터베이스 설정
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// 인증 메커니즘 설정
    pub fn with_mechanism(mut self, mechanism: impl Into<String>) -> Self {
        self.mechanism = Some(mechanism.into());
        self
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"********")
            .field("source", &self.source)
            .field("mechanism", &self.mechanism)
            .finish()
    }
}

// ============================================================================
// Authenticator - 인증 전략
// ============================================================================

/// 인증 전략
///
/// 새 소켓마다, 필요한 자격 증명마다 한 번 호출됩니다. 이미 로그인된
/// 자격 증명은 소켓이 캐시하므로 다시 호출되지 않습니다.
#[async_trait]
pub trait Authenticator: Send + Sync + fmt::Debug {
    /// 소켓에서 로그인 수행
    async fn login(&self, socket: &Socket, credential: &Credential) -> DriverResult<()>;
}
