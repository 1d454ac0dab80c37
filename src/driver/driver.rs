//! 드라이버
//!
//! 연결 URL 파싱, 드라이버 설정, 클러스터를 소유하는 진입점.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use super::auth::{Authenticator, Credential};
use super::cluster::{Cluster, ClusterConfig, Mode};
use super::concern::WriteConcern;
use super::cursor::DEFAULT_PREFETCH;
use super::error::{DriverError, DriverResult};
use super::net::{Dialer, DnsResolver, Resolver, TcpDialer};
use super::server::TagSet;
use super::session::{Session, SessionConfig};
use super::stats::{DriverMetrics, Stats};

/// 기본 포트
pub const DEFAULT_PORT: u16 = 27017;

/// URL 스킴
pub const URL_SCHEME: &str = "mongodb://";

// ============================================================================
// ServerAddress - 서버 주소
// ============================================================================

/// 서버 주소
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    /// 호스트
    pub host: String,
    /// 포트
    pub port: u16,
}

impl ServerAddress {
    /// 새 서버 주소 생성
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host[:port]` 또는 `[v6][:port]` 파싱
    pub fn parse(s: &str) -> DriverResult<Self> {
        let invalid = || DriverError::configuration(format!("invalid server address: {:?}", s));

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
            match after {
                "" => (host, None),
                _ => (host, Some(after.strip_prefix(':').ok_or_else(invalid)?)),
            }
        } else {
            match s.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (s, None),
            }
        };

        if host.is_empty() {
            return Err(invalid());
        }
        let port = match port {
            Some(p) => p.parse().map_err(|_| invalid())?,
            None => DEFAULT_PORT,
        };
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::new("localhost", DEFAULT_PORT)
    }
}

// ============================================================================
// 연결 URL
// ============================================================================

/// 파싱된 연결 URL
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionUrl {
    /// 시드 주소
    pub seeds: Vec<ServerAddress>,
    /// 데이터베이스
    pub database: Option<String>,
    /// 자격 증명
    pub credential: Option<Credential>,
    /// 시드에만 직접 연결
    pub direct: bool,
    /// 레플리카 셋 이름
    pub replica_set: Option<String>,
    /// 서버당 소켓 상한
    pub pool_limit: Option<usize>,
    /// 읽기 모드
    pub mode: Option<Mode>,
    /// 태그 필터
    pub tags: Vec<TagSet>,
    /// 연결 타임아웃
    pub dial_timeout: Option<Duration>,
    /// 소켓 타임아웃
    pub socket_timeout: Option<Duration>,
    /// 서버 선택 대기 한도
    pub sync_timeout: Option<Duration>,
    /// 도달 불가를 빨리 보고
    pub fail_fast: bool,
}

fn decode_component(s: &str) -> DriverResult<String> {
    percent_encoding::percent_decode_str(s)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| DriverError::configuration(format!("invalid escape in URL: {}", e)))
}

fn parse_millis(key: &str, value: &str) -> DriverResult<Duration> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| DriverError::configuration(format!("invalid {}: {:?}", key, value)))
}

fn parse_bool(key: &str, value: &str) -> DriverResult<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(DriverError::configuration(format!("invalid {}: {:?}", key, value))),
    }
}

/// `k:v,k:v` 태그 집합 (빈 값은 모든 서버와 일치)
fn parse_tag_set(value: &str) -> DriverResult<TagSet> {
    let mut set = TagSet::new();
    for pair in value.split(',').filter(|p| !p.is_empty()) {
        let (k, v) = pair.split_once(':').ok_or_else(|| {
            DriverError::configuration(format!("invalid readPreferenceTags: {:?}", value))
        })?;
        set.insert(k.trim().to_string(), v.trim().to_string());
    }
    Ok(set)
}

impl ConnectionUrl {
    /// `mongodb://[user:pass@]host1[:port][,hostN[:port]][/db][?options]` 파싱
    pub fn parse(url: &str) -> DriverResult<Self> {
        let rest = url.strip_prefix(URL_SCHEME).ok_or_else(|| {
            DriverError::configuration(format!("URL must start with {}", URL_SCHEME))
        })?;

        let (rest, query) = match rest.split_once('?') {
            Some((rest, query)) => (rest, Some(query)),
            None => (rest, None),
        };
        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) => (authority, path),
            None => (rest, ""),
        };
        let (userinfo, hosts) = match authority.rsplit_once('@') {
            Some((userinfo, hosts)) => (Some(userinfo), hosts),
            None => (None, authority),
        };

        let mut parsed = Self::default();
        for host in hosts.split(',') {
            parsed.seeds.push(ServerAddress::parse(host)?);
        }
        if !path.is_empty() {
            parsed.database = Some(decode_component(path)?);
        }
        if let Some(userinfo) = userinfo {
            let (user, pass) = userinfo.split_once(':').unwrap_or((userinfo, ""));
            let mut credential = Credential::new(decode_component(user)?, decode_component(pass)?);
            if let Some(db) = &parsed.database {
                credential.source = db.clone();
            }
            parsed.credential = Some(credential);
        }

        let Some(query) = query else {
            return Ok(parsed);
        };
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            parsed.apply_option(&key, &value)?;
        }
        Ok(parsed)
    }

    fn apply_option(&mut self, key: &str, value: &str) -> DriverResult<()> {
        match key {
            "connect" => match value {
                "direct" => self.direct = true,
                "replicaSet" => self.direct = false,
                _ => {
                    return Err(DriverError::configuration(format!(
                        "invalid connect option: {:?}",
                        value
                    )))
                }
            },
            "replicaSet" => self.replica_set = Some(value.to_string()),
            "maxPoolSize" => {
                let limit = value.parse().map_err(|_| {
                    DriverError::configuration(format!("invalid maxPoolSize: {:?}", value))
                })?;
                self.pool_limit = Some(limit);
            }
            "authSource" => self.credential_mut(key)?.source = value.to_string(),
            "authMechanism" => self.credential_mut(key)?.mechanism = Some(value.to_string()),
            "readPreference" => self.mode = Some(value.parse()?),
            "readPreferenceTags" => self.tags.push(parse_tag_set(value)?),
            "connectTimeoutMS" => self.dial_timeout = Some(parse_millis(key, value)?),
            "socketTimeoutMS" => self.socket_timeout = Some(parse_millis(key, value)?),
            "serverSelectionTimeoutMS" => self.sync_timeout = Some(parse_millis(key, value)?),
            "failFast" => self.fail_fast = parse_bool(key, value)?,
            _ => {
                return Err(DriverError::configuration(format!(
                    "unsupported connection URL option: {}={}",
                    key, value
                )))
            }
        }
        Ok(())
    }

    fn credential_mut(&mut self, key: &str) -> DriverResult<&mut Credential> {
        self.credential
            .as_mut()
            .ok_or_else(|| DriverError::configuration(format!("{} requires a username", key)))
    }
}

// ============================================================================
// DriverConfig - 드라이버 설정
// ============================================================================

/// 드라이버 설정
#[derive(Clone)]
pub struct DriverConfig {
    /// 시드 주소
    pub seeds: Vec<ServerAddress>,
    /// 시드에만 직접 연결
    pub direct: bool,
    /// 레플리카 셋 이름
    pub replica_set: Option<String>,
    /// 도달 불가를 빨리 보고
    pub fail_fast: bool,
    /// 기본 데이터베이스
    pub database: Option<String>,
    /// 자격 증명
    pub credential: Option<Credential>,
    /// 기본 세션 모드
    pub mode: Mode,
    /// 태그 필터
    pub tags: Vec<TagSet>,
    /// 서버당 소켓 상한
    pub pool_limit: usize,
    /// 연결 타임아웃
    pub dial_timeout: Duration,
    /// 서버 선택 대기 한도
    pub sync_timeout: Duration,
    /// 소켓 타임아웃
    pub socket_timeout: Duration,
    /// 정기 동기화 주기
    pub sync_interval: Duration,
    /// 패스 사이 대기
    pub sync_retry_delay: Duration,
    /// 핑 주기
    pub ping_interval: Duration,
    /// prefetch 비율
    pub prefetch: f64,
    /// 기본 쓰기 확인
    pub safe: Option<WriteConcern>,
    /// 주소 해석기
    pub resolver: Arc<dyn Resolver>,
    /// 다이얼러
    pub dialer: Arc<dyn Dialer>,
    /// 인증기
    pub authenticator: Option<Arc<dyn Authenticator>>,
}

impl DriverConfig {
    /// URL로 설정 생성
    pub fn new(url: &str) -> DriverResult<Self> {
        let parsed = ConnectionUrl::parse(url)?;
        let defaults = Self::default();
        Ok(Self {
            seeds: parsed.seeds,
            direct: parsed.direct,
            replica_set: parsed.replica_set,
            fail_fast: parsed.fail_fast,
            database: parsed.database,
            credential: parsed.credential,
            mode: parsed.mode.unwrap_or(defaults.mode),
            tags: parsed.tags,
            pool_limit: parsed.pool_limit.unwrap_or(defaults.pool_limit),
            dial_timeout: parsed.dial_timeout.unwrap_or(defaults.dial_timeout),
            sync_timeout: parsed.sync_timeout.unwrap_or(defaults.sync_timeout),
            socket_timeout: parsed.socket_timeout.unwrap_or(defaults.socket_timeout),
            ..defaults
        })
    }

    /// 빌더 시작
    pub fn builder(url: &str) -> DriverResult<DriverConfigBuilder> {
        let config = Self::new(url)?;
        Ok(DriverConfigBuilder { config })
    }

    /// 설정 검증
    pub fn validate(&self) -> DriverResult<()> {
        if self.seeds.is_empty() {
            return Err(DriverError::configuration("no seed addresses"));
        }
        if self.credential.is_some() && self.authenticator.is_none() {
            return Err(DriverError::configuration(
                "credentials given but no authenticator configured",
            ));
        }
        if !(0.0..=1.0).contains(&self.prefetch) {
            return Err(DriverError::configuration(format!(
                "prefetch must be within [0, 1], got {}",
                self.prefetch
            )));
        }
        Ok(())
    }

    /// 토폴로지 모니터 설정
    pub fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            seeds: self.seeds.iter().map(|s| s.to_string()).collect(),
            direct: self.direct,
            fail_fast: self.fail_fast,
            replica_set: self.replica_set.clone(),
            dial_timeout: self.dial_timeout,
            sync_interval: self.sync_interval,
            sync_retry_delay: self.sync_retry_delay,
            ping_interval: self.ping_interval,
            resolver: Arc::clone(&self.resolver),
            dialer: Arc::clone(&self.dialer),
        }
    }

    /// 기본 세션 설정
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            mode: self.mode,
            safe: self.safe.clone(),
            sync_timeout: self.sync_timeout,
            socket_timeout: self.socket_timeout,
            pool_limit: self.pool_limit,
            batch_size: 0,
            prefetch: self.prefetch,
            tags: self.tags.clone(),
            database: self.database.clone(),
            credentials: self.credential.iter().cloned().collect(),
        }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            seeds: vec![ServerAddress::default()],
            direct: false,
            replica_set: None,
            fail_fast: false,
            database: None,
            credential: None,
            mode: Mode::Strong,
            tags: Vec::new(),
            pool_limit: 4096,
            dial_timeout: Duration::from_secs(10),
            sync_timeout: Duration::from_secs(60),
            socket_timeout: Duration::from_secs(60),
            sync_interval: Duration::from_secs(30),
            sync_retry_delay: Duration::from_millis(500),
            ping_interval: Duration::from_secs(15),
            prefetch: DEFAULT_PREFETCH,
            safe: Some(WriteConcern::acknowledged()),
            resolver: Arc::new(DnsResolver::new()),
            dialer: Arc::new(TcpDialer),
            authenticator: None,
        }
    }
}

impl fmt::Debug for DriverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverConfig")
            .field("seeds", &self.seeds)
            .field("direct", &self.direct)
            .field("replica_set", &self.replica_set)
            .field("database", &self.database)
            .field("credential", &self.credential)
            .field("mode", &self.mode)
            .field("pool_limit", &self.pool_limit)
            .field("sync_timeout", &self.sync_timeout)
            .field("socket_timeout", &self.socket_timeout)
            .finish()
    }
}

// ============================================================================
// DriverConfigBuilder - 설정 빌더
// ============================================================================

/// 드라이버 설정 빌더
pub struct DriverConfigBuilder {
    config: DriverConfig,
}

impl DriverConfigBuilder {
    /// 직접 연결 설정
    pub fn with_direct(mut self, direct: bool) -> Self {
        self.config.direct = direct;
        self
    }

    /// 레플리카 셋 이름 설정
    pub fn with_replica_set(mut self, name: impl Into<String>) -> Self {
        self.config.replica_set = Some(name.into());
        self
    }

    /// fail-fast 설정
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.config.fail_fast = fail_fast;
        self
    }

    /// 자격 증명 설정
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.config.credential = Some(credential);
        self
    }

    /// 기본 모드 설정
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.config.mode = mode;
        self
    }

    /// 서버당 소켓 상한 설정
    pub fn with_pool_limit(mut self, limit: usize) -> Self {
        self.config.pool_limit = limit;
        self
    }

    /// 연결 타임아웃 설정
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.config.dial_timeout = timeout;
        self
    }

    /// 서버 선택 대기 한도 설정
    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.config.sync_timeout = timeout;
        self
    }

    /// 소켓 타임아웃 설정
    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.config.socket_timeout = timeout;
        self
    }

    /// 정기 동기화 주기 설정
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.config.sync_interval = interval;
        self
    }

    /// 패스 사이 대기 설정
    pub fn with_sync_retry_delay(mut self, delay: Duration) -> Self {
        self.config.sync_retry_delay = delay;
        self
    }

    /// 핑 주기 설정 (0이면 핑 안 함)
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.config.ping_interval = interval;
        self
    }

    /// prefetch 비율 설정
    pub fn with_prefetch(mut self, prefetch: f64) -> Self {
        self.config.prefetch = prefetch;
        self
    }

    /// 기본 쓰기 확인 설정
    pub fn with_safe(mut self, safe: Option<WriteConcern>) -> Self {
        self.config.safe = safe;
        self
    }

    /// 주소 해석기 설정
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.config.resolver = resolver;
        self
    }

    /// 다이얼러 설정
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.config.dialer = dialer;
        self
    }

    /// 인증기 설정
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.config.authenticator = Some(authenticator);
        self
    }

    /// 빌드
    pub fn build(self) -> DriverConfig {
        self.config
    }
}

// ============================================================================
// Driver - 드라이버
// ============================================================================

/// 문서 데이터베이스 드라이버
///
/// 클러스터 하나를 소유합니다. 세션은 클러스터 참조를 나눠 가지므로
/// 드라이버를 닫아도 열린 세션이 모두 닫힐 때까지 토폴로지는 유지됩니다.
pub struct Driver {
    /// 설정
    config: DriverConfig,
    /// 클러스터
    cluster: Arc<Cluster>,
    /// 열린 상태
    open: RwLock<bool>,
}

impl Driver {
    /// 새 드라이버 생성 (연결은 백그라운드에서 시작)
    pub fn new(url: &str) -> DriverResult<Self> {
        Self::with_config(DriverConfig::new(url)?)
    }

    /// 연결을 확인한 뒤 드라이버 반환
    pub async fn connect(url: &str) -> DriverResult<Self> {
        let driver = Self::new(url)?;
        driver.verify_connectivity().await?;
        Ok(driver)
    }

    /// 설정으로 드라이버 생성
    ///
    /// 동기화 루프를 띄우므로 Tokio 런타임 안에서 호출해야 합니다.
    pub fn with_config(config: DriverConfig) -> DriverResult<Self> {
        config.validate()?;
        tokio::runtime::Handle::try_current()
            .map_err(|_| DriverError::configuration("driver requires a Tokio runtime"))?;

        tracing::debug!("Creating driver for seeds {:?}", config.seeds);
        let cluster = Cluster::new(config.cluster_config(), Arc::new(Stats::new()));
        Ok(Self {
            config,
            cluster,
            open: RwLock::new(true),
        })
    }

    /// 기본 설정 세션
    pub fn session(&self) -> DriverResult<Session> {
        self.session_with(self.config.session_config())
    }

    /// 세션 생성
    pub fn session_with(&self, config: SessionConfig) -> DriverResult<Session> {
        self.ensure_open()?;
        Ok(Session::new(
            Arc::clone(&self.cluster),
            self.config.authenticator.clone(),
            config,
        ))
    }

    /// 아무 서버에나 핑
    pub async fn verify_connectivity(&self) -> DriverResult<()> {
        let mut config = self.config.session_config();
        config.mode = Mode::Eventual;
        let session = self.session_with(config)?;
        let result = session.ping().await;
        session.close();
        result
    }

    /// 살아 있는 서버 주소
    pub fn live_servers(&self) -> Vec<String> {
        self.cluster.live_servers()
    }

    /// 메트릭 조회
    pub fn metrics(&self) -> DriverMetrics {
        self.cluster.stats().snapshot()
    }

    /// 드라이버 설정
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// 클러스터
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// 열린 상태 확인
    pub fn is_open(&self) -> bool {
        *self.open.read()
    }

    /// 드라이버 종료 (여러 번 불러도 됨)
    pub fn close(&self) {
        let mut open = self.open.write();
        if !*open {
            return;
        }
        *open = false;
        drop(open);
        tracing::debug!("Closing driver for seeds {:?}", self.config.seeds);
        self.cluster.release();
    }

    fn ensure_open(&self) -> DriverResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(DriverError::closed("driver is closed"))
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("seeds", &self.config.seeds)
            .field("open", &self.is_open())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
