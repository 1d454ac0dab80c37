//! 서버 선택 정책
//!
//! 읽기 모드와 태그, 핑, 사용 중 소켓 수로 서버 하나를 고릅니다.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bson::{doc, Bson, Document};

use super::super::error::{DriverError, DriverResult};
use super::super::server::{Server, TagSet};

/// 이 차이 이내의 핑은 같은 거리로 취급
pub const NEAREST_THRESHOLD: Duration = Duration::from_millis(15);

// ============================================================================
// Mode - 일관성 모드
// ============================================================================

/// 세션 일관성 모드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Mode {
    /// 항상 프라이머리 (기본값)
    #[default]
    Strong,
    /// 첫 쓰기 전까지 세컨더리, 이후 프라이머리에 고정
    Monotonic,
    /// 아무 노드나, 고정하지 않음
    Eventual,
    /// 프라이머리 우선
    PrimaryPreferred,
    /// 세컨더리만
    Secondary,
    /// 세컨더리 우선
    SecondaryPreferred,
    /// 가장 가까운 노드
    Nearest,
}

impl Mode {
    /// 라우터에 보내는 읽기 선호도 이름
    pub fn read_preference_name(&self) -> &'static str {
        match self {
            Self::Strong => "primary",
            Self::Monotonic | Self::Eventual | Self::SecondaryPreferred => "secondaryPreferred",
            Self::PrimaryPreferred => "primaryPreferred",
            Self::Secondary => "secondary",
            Self::Nearest => "nearest",
        }
    }

    /// 획득한 소켓을 세션에 고정하는지 여부
    pub fn pins_sockets(&self) -> bool {
        !matches!(self, Self::Strong | Self::Eventual)
    }

    /// 세컨더리 읽기를 기본으로 허용하는지 여부
    pub fn allows_secondary(&self) -> bool {
        *self != Self::Strong
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Strong => "strong",
            Self::Monotonic => "monotonic",
            Self::Eventual => "eventual",
            Self::PrimaryPreferred => "primaryPreferred",
            Self::Secondary => "secondary",
            Self::SecondaryPreferred => "secondaryPreferred",
            Self::Nearest => "nearest",
        };
        f.write_str(name)
    }
}

impl FromStr for Mode {
    type Err = DriverError;

    fn from_str(s: &str) -> DriverResult<Self> {
        match s {
            "primary" | "strong" => Ok(Self::Strong),
            "monotonic" => Ok(Self::Monotonic),
            "eventual" => Ok(Self::Eventual),
            "primaryPreferred" => Ok(Self::PrimaryPreferred),
            "secondary" => Ok(Self::Secondary),
            "secondaryPreferred" => Ok(Self::SecondaryPreferred),
            "nearest" => Ok(Self::Nearest),
            other => Err(DriverError::configuration(format!(
                "unsupported read mode: {}",
                other
            ))),
        }
    }
}

// ============================================================================
// 선택
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Candidate {
    master: bool,
    ping: Duration,
    in_use: usize,
}

/// 후보 중 가장 알맞은 서버
///
/// 태그가 주어지면 일치하지 않는 노드를 거릅니다 (라우터 제외).
/// `Secondary` 모드는 라우터가 아닌 프라이머리를 제외합니다.
pub fn best_fit(servers: &[Arc<Server>], mode: Mode, tags: &[TagSet]) -> Option<Arc<Server>> {
    let mut best: Option<(&Arc<Server>, Candidate)> = None;

    for server in servers {
        let info = server.info();
        if !tags.is_empty() && !info.mongos && !info.has_tags(tags) {
            continue;
        }
        if mode == Mode::Secondary && info.master && !info.mongos {
            continue;
        }

        let next = Candidate {
            master: info.master,
            ping: server.ping_value(),
            in_use: server.in_use_sockets(),
        };
        best = match best {
            Some((current, current_stats)) if !prefer(mode, &next, &current_stats) => {
                Some((current, current_stats))
            }
            _ => Some((server, next)),
        };
    }

    best.map(|(server, _)| Arc::clone(server))
}

fn prefer(mode: Mode, next: &Candidate, best: &Candidate) -> bool {
    if next.master != best.master && mode != Mode::Nearest {
        // PrimaryPreferred는 프라이머리로, 나머지는 세컨더리로 바꿈
        return (mode == Mode::PrimaryPreferred) != best.master;
    }
    let gap = if next.ping > best.ping {
        next.ping - best.ping
    } else {
        best.ping - next.ping
    };
    if gap > NEAREST_THRESHOLD {
        return next.ping < best.ping;
    }
    next.in_use < best.in_use
}

/// 라우터로 보낼 쿼리를 읽기 선호도로 감쌈
pub fn wrap_read_preference(query: Document, mode: Mode, tags: &[TagSet]) -> Document {
    let mut preference = doc! { "mode": mode.read_preference_name() };
    if !tags.is_empty() {
        let sets: Vec<Bson> = tags
            .iter()
            .map(|set| {
                Bson::Document(
                    set.iter()
                        .map(|(k, v)| (k.clone(), Bson::String(v.clone())))
                        .collect(),
                )
            })
            .collect();
        preference.insert("tags", sets);
    }
    doc! { "$query": query, "$readPreference": preference }
}
