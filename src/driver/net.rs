//! 주소 해석과 연결
//!
//! 디스커버리가 사용하는 두 협력자: 주소를 소켓 주소로 바꾸는 [`Resolver`]와
//! 바이트 스트림을 여는 [`Dialer`].

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::error::{DriverError, DriverResult};

/// 이름 조회 타임아웃
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// IPv6 결과만 있을 때 IPv4 결과를 기다리는 시간
pub const RESOLVE_GRACE: Duration = Duration::from_millis(50);

// ============================================================================
// Streams
// ============================================================================

/// 드라이버가 사용하는 양방향 스트림
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> AsyncStream for T {}

/// 박싱된 스트림
pub type BoxedStream = Box<dyn AsyncStream>;

// ============================================================================
// Resolver - 주소 해석
// ============================================================================

/// 주소 해석기
#[async_trait]
pub trait Resolver: Send + Sync + fmt::Debug {
    /// `host:port` 문자열을 소켓 주소로 해석
    async fn resolve(&self, addr: &str) -> DriverResult<SocketAddr>;
}

/// DNS 해석기
///
/// IPv4와 IPv6 조회를 동시에 시작하고 IPv4를 선호합니다.
#[derive(Debug, Clone)]
pub struct DnsResolver {
    timeout: Duration,
    grace: Duration,
}

impl DnsResolver {
    /// 기본 설정으로 생성
    pub fn new() -> Self {
        Self {
            timeout: RESOLVE_TIMEOUT,
            grace: RESOLVE_GRACE,
        }
    }

    async fn lookup(&self, addr: &str, want_v4: bool) -> Option<SocketAddr> {
        let found = tokio::time::timeout(self.timeout, tokio::net::lookup_host(addr)).await;
        match found {
            Ok(Ok(mut addrs)) => addrs.find(|a| a.is_ipv4() == want_v4),
            _ => None,
        }
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, addr: &str) -> DriverResult<SocketAddr> {
        if let Ok(literal) = addr.parse::<SocketAddr>() {
            return Ok(literal);
        }

        let v4 = self.lookup(addr, true);
        let v6 = self.lookup(addr, false);
        match race_preferred(v4, v6, self.grace).await {
            Some(resolved) => Ok(resolved),
            None => {
                tracing::warn!("Failed to resolve server address: {}", addr);
                Err(DriverError::resolution(format!(
                    "failed to resolve server address: {}",
                    addr
                )))
            }
        }
    }
}

/// 두 해석 전략 경주
///
/// `preferred`가 먼저 끝나면 그 결과를 씁니다. `fallback`이 먼저 성공하면
/// `grace` 동안만 `preferred`를 더 기다립니다.
pub async fn race_preferred<P, F>(preferred: P, fallback: F, grace: Duration) -> Option<SocketAddr>
where
    P: Future<Output = Option<SocketAddr>>,
    F: Future<Output = Option<SocketAddr>>,
{
    tokio::pin!(preferred);
    tokio::pin!(fallback);

    tokio::select! {
        first = &mut preferred => match first {
            Some(addr) => Some(addr),
            None => fallback.await,
        },
        second = &mut fallback => match second {
            Some(addr) => match tokio::time::timeout(grace, &mut preferred).await {
                Ok(Some(better)) => Some(better),
                _ => Some(addr),
            },
            None => preferred.await,
        },
    }
}

// ============================================================================
// Dialer - 연결
// ============================================================================

/// 스트림 다이얼러 (평문 또는 암호화)
#[async_trait]
pub trait Dialer: Send + Sync + fmt::Debug {
    /// 주소로 연결
    async fn dial(&self, addr: SocketAddr, timeout: Duration) -> DriverResult<BoxedStream>;
}

/// TCP 다이얼러
#[derive(Debug, Clone, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: SocketAddr, timeout: Duration) -> DriverResult<BoxedStream> {
        let connect = TcpStream::connect(addr);
        let stream = if timeout.is_zero() {
            connect.await
        } else {
            tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| DriverError::timeout(format!("dial {} timed out", addr)))?
        }
        .map_err(|e| DriverError::connection(format!("dial {}: {}", addr, e)))?;

        stream
            .set_nodelay(true)
            .map_err(|e| DriverError::connection(format!("set_nodelay: {}", e)))?;
        Ok(Box::new(stream))
    }
}
