//! Driver Module
//!
//! 레플리카 셋을 인식하는 문서 데이터베이스 클라이언트.
//!
//! # 구성
//!
//! - [`Cluster`]: 토폴로지 모니터 (서버 탐색, 역할 분류, 동기화 루프)
//! - [`Server`]: 서버 하나의 소켓 풀과 핑
//! - [`Socket`]: 물리 연결 하나를 여러 요청이 나눠 쓰는 멀티플렉서
//! - [`Session`]: 일관성 모드에 따른 소켓 선택과 고정
//! - [`Iter`]: prefetch 하는 결과 커서
//! - [`WriteConcern`]: 쓰기 확인 조건
//!
//! # Example
//!
//! ```ignore
//! use docdb_driver::driver::{Driver, FindOptions, Mode};
//! use bson::doc;
//!
//! let driver = Driver::connect("mongodb://a:27017,b:27017/?replicaSet=rs0").await?;
//!
//! // 세컨더리에서 읽기 시작, 첫 쓰기 뒤 프라이머리에 고정
//! let session = driver.session()?;
//! session.set_mode(Mode::Monotonic, true);
//!
//! session.insert("shop.orders", &[doc! { "item": "pen", "qty": 3 }]).await?;
//! let mut iter = session
//!     .find("shop.orders", doc! { "item": "pen" }, FindOptions::default())
//!     .await?;
//! while let Some(order) = iter.next_document().await? {
//!     println!("{}", order);
//! }
//!
//! session.close();
//! driver.close();
//! ```

mod auth;
mod cluster;
mod command;
mod concern;
mod cursor;
#[allow(clippy::module_inception)]
mod driver;
mod error;
mod net;
mod queue;
mod server;
mod session;
mod socket;
mod stats;

#[cfg(test)]
mod mock;

// Re-exports
pub use auth::{Authenticator, Credential, DEFAULT_AUTH_SOURCE};
pub use cluster::{
    best_fit, wrap_read_preference, Cluster, ClusterConfig, Mode, Role, ServerTable,
    SocketRequest, NEAREST_THRESHOLD,
};
pub use command::{check_command, is_ok, IsMasterResult};
pub use concern::{chunk_ranges, parse_last_error, LastError, WriteConcern, WriteResult, W};
pub use cursor::{Iter, DEFAULT_PREFETCH};
pub use driver::{
    ConnectionUrl, Driver, DriverConfig, DriverConfigBuilder, ServerAddress, DEFAULT_PORT,
};
pub use error::{DriverError, DriverResult};
pub use net::{AsyncStream, BoxedStream, Dialer, DnsResolver, Resolver, TcpDialer};
pub use queue::Queue;
pub use server::{Server, ServerInfo, ServerMetrics, TagSet};
pub use session::{FindOptions, Session, SessionConfig, SessionConfigBuilder, SessionCore};
pub use socket::{Op, ReplyCallback, ReplyEvent, Socket, SocketGuard, SocketState};
pub use stats::{DriverMetrics, Stats};
