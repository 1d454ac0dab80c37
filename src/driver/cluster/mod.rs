//! 클러스터 토폴로지
//!
//! 서버 집합 추적과 서버 선택.
//!
//! # 구성
//!
//! - [`Cluster`]: 토폴로지 모니터 (동기화 루프, 역할 기반 소켓 획득)
//! - [`ServerTable`]: 해석된 주소 순 서버 집합
//! - [`Mode`]: 세션 일관성 모드와 서버 선택 정책

mod discovery;
mod monitor;
mod policy;
mod table;

pub use monitor::{Cluster, ClusterConfig, Role, SocketRequest};
pub use policy::{best_fit, wrap_read_preference, Mode, NEAREST_THRESHOLD};
pub use table::ServerTable;
