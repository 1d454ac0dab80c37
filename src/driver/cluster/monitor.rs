//! 토폴로지 모니터
//!
//! 알려진 서버 집합을 소유하고, 주기적으로 동기화 패스를 돌리며, 역할에
//! 맞는 소켓을 골라 줍니다.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bson::doc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::super::command::IsMasterResult;
use super::super::error::{DriverError, DriverResult};
use super::super::net::{Dialer, DnsResolver, Resolver, TcpDialer};
use super::super::server::{Server, TagSet};
use super::super::socket::{Socket, SocketGuard};
use super::super::stats::Stats;
use super::policy::Mode;
use super::table::ServerTable;

/// 후보가 없을 때 다시 고르기 전 대기
const RESELECT_DELAY: Duration = Duration::from_millis(100);

// ============================================================================
// ClusterConfig - 모니터 설정
// ============================================================================

/// 토폴로지 모니터 설정
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// 시드 주소
    pub seeds: Vec<String>,
    /// 시드에만 직접 연결 (탐색 안 함)
    pub direct: bool,
    /// 도달 불가를 빨리 보고
    pub fail_fast: bool,
    /// 레플리카 셋 이름
    pub replica_set: Option<String>,
    /// 연결 타임아웃
    pub dial_timeout: Duration,
    /// 정기 동기화 주기
    pub sync_interval: Duration,
    /// 패스 사이 짧은 대기 (프로브 재시도 간격과 같음)
    pub sync_retry_delay: Duration,
    /// 핑 주기 (0이면 핑 안 함)
    pub ping_interval: Duration,
    /// 주소 해석기
    pub resolver: Arc<dyn Resolver>,
    /// 다이얼러
    pub dialer: Arc<dyn Dialer>,
}

impl ClusterConfig {
    /// 시드로 기본 설정 생성
    pub fn new(seeds: Vec<String>) -> Self {
        Self {
            seeds,
            direct: false,
            fail_fast: false,
            replica_set: None,
            dial_timeout: Duration::from_secs(10),
            sync_interval: Duration::from_secs(30),
            sync_retry_delay: Duration::from_millis(500),
            ping_interval: Duration::from_secs(15),
            resolver: Arc::new(DnsResolver::new()),
            dialer: Arc::new(TcpDialer),
        }
    }

    /// 프로브 시도 횟수
    pub fn probe_attempts(&self) -> usize {
        if self.fail_fast {
            1
        } else {
            3
        }
    }
}

// ============================================================================
// SocketRequest - 소켓 획득 요청
// ============================================================================

/// 소켓 획득 조건
#[derive(Debug, Clone)]
pub struct SocketRequest {
    /// 일관성 모드
    pub mode: Mode,
    /// 세컨더리 허용
    pub slave_ok: bool,
    /// 후보가 나타날 때까지 기다리는 시간 (0이면 무제한)
    pub sync_timeout: Duration,
    /// 소켓 타임아웃
    pub socket_timeout: Duration,
    /// 태그 필터
    pub tags: Vec<TagSet>,
    /// 서버당 사용 중 소켓 상한 (0이면 무제한)
    pub pool_limit: usize,
}

impl SocketRequest {
    /// 프라이머리 요청
    pub fn master(sync_timeout: Duration, socket_timeout: Duration) -> Self {
        Self {
            mode: Mode::Strong,
            slave_ok: false,
            sync_timeout,
            socket_timeout,
            tags: Vec::new(),
            pool_limit: 0,
        }
    }
}

/// 기다릴 역할
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// 프라이머리
    Master,
    /// 세컨더리
    Secondary,
    /// 아무 노드
    Any,
}

// ============================================================================
// Topology - 공유 상태
// ============================================================================

#[derive(Debug, Default)]
pub(super) struct Topology {
    pub(super) servers: ServerTable,
    pub(super) masters: ServerTable,
    pub(super) dyna_seeds: Vec<String>,
    pub(super) sync_count: u64,
}

impl Topology {
    fn can_serve(&self, mode: Mode, slave_ok: bool) -> bool {
        let masters = self.masters.len();
        let slaves = self.servers.len() - masters;
        (masters > 0 && !(slave_ok && mode == Mode::Secondary))
            || (slaves > 0 && slave_ok)
            || (masters > 0 && mode == Mode::Secondary && self.masters.has_mongos())
    }

    fn has_role(&self, role: Role) -> bool {
        match role {
            Role::Master => !self.masters.is_empty(),
            Role::Secondary => self.servers.len() > self.masters.len(),
            Role::Any => !self.servers.is_empty(),
        }
    }
}

// ============================================================================
// Cluster
// ============================================================================

/// 토폴로지 모니터
///
/// 참조 카운트가 0이 되면 동기화 루프를 멈추고 모든 서버를 닫습니다.
pub struct Cluster {
    pub(super) config: ClusterConfig,
    pub(super) topology: RwLock<Topology>,
    references: Mutex<usize>,
    pub(super) synced: watch::Sender<u64>,
    pub(super) sync_requests: mpsc::Sender<()>,
    pub(super) shutdown: CancellationToken,
    index_cache: Mutex<HashSet<String>>,
    pub(super) stats: Arc<Stats>,
}

impl Cluster {
    /// 모니터 생성과 동기화 루프 시작 (참조 1)
    ///
    /// Tokio 런타임 안에서 호출해야 합니다.
    pub fn new(config: ClusterConfig, stats: Arc<Stats>) -> Arc<Self> {
        let (sync_requests, sync_rx) = mpsc::channel(1);
        let (synced, _) = watch::channel(0);
        let cluster = Arc::new(Self {
            config,
            topology: RwLock::new(Topology::default()),
            references: Mutex::new(1),
            synced,
            sync_requests,
            shutdown: CancellationToken::new(),
            index_cache: Mutex::new(HashSet::new()),
            stats,
        });
        cluster.stats.cluster(1);

        let runner = Arc::clone(&cluster);
        tokio::spawn(async move { runner.sync_loop(sync_rx).await });
        cluster
    }

    /// 설정
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// 통계
    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// 참조 추가
    pub fn acquire(&self) {
        *self.references.lock() += 1;
    }

    /// 참조 해제 (0이 되면 종료)
    pub fn release(&self) {
        {
            let mut refs = self.references.lock();
            if *refs == 0 {
                tracing::warn!("Cluster released more than acquired");
                return;
            }
            *refs -= 1;
            if *refs > 0 {
                return;
            }
        }

        tracing::info!("Closing cluster");
        self.shutdown.cancel();
        let servers = {
            let mut topology = self.topology.write();
            topology.masters.drain();
            topology.servers.drain()
        };
        for server in servers {
            server.close();
        }
        self.stats.cluster(-1);
        self.synced.send_modify(|count| *count += 1);
    }

    /// 참조 수
    pub fn references(&self) -> usize {
        *self.references.lock()
    }

    /// 종료되었는지 여부
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// 살아 있는 서버 주소
    pub fn live_servers(&self) -> Vec<String> {
        self.topology.read().servers.addrs()
    }

    /// 프라이머리 주소
    pub fn masters(&self) -> Vec<String> {
        self.topology.read().masters.addrs()
    }

    /// 완료된 동기화 패스 수
    pub fn sync_count(&self) -> u64 {
        self.topology.read().sync_count
    }

    /// 동기화 요청 (이미 대기 중이면 합쳐짐)
    pub fn request_sync(&self) {
        let _ = self.sync_requests.try_send(());
    }

    /// 토폴로지 변경 구독
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.synced.subscribe()
    }

    // ------------------------------------------------------------------------
    // 인덱스 캐시
    // ------------------------------------------------------------------------

    /// 인덱스가 있다고 캐시되었는지
    pub fn has_cached_index(&self, key: &str) -> bool {
        self.index_cache.lock().contains(key)
    }

    /// 인덱스 존재 여부 기록
    pub fn cache_index(&self, key: &str, exists: bool) {
        let mut cache = self.index_cache.lock();
        if exists {
            cache.insert(key.to_string());
        } else {
            cache.remove(key);
        }
    }

    /// 인덱스 캐시 비움
    pub fn reset_index_cache(&self) {
        self.index_cache.lock().clear();
    }

    // ------------------------------------------------------------------------
    // 대기와 선택
    // ------------------------------------------------------------------------

    /// 역할을 가진 서버가 나타날 때까지 대기 (0이면 무제한)
    pub async fn wait_for_role(&self, role: Role, timeout: Duration) -> DriverResult<()> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let mut synced = self.synced.subscribe();
        loop {
            if self.topology.read().has_role(role) {
                return Ok(());
            }
            self.request_sync();
            if !self.wait_for_change(&mut synced, deadline).await? {
                return Err(DriverError::unreachable("no reachable servers"));
            }
        }
    }

    /// 조건에 맞는 서버에서 소켓 획득
    ///
    /// 후보가 없으면 동기화를 요청하고 `sync_timeout`까지 기다립니다.
    /// 연결에 실패한 서버는 퇴출하고 다시 고릅니다.
    pub async fn acquire_socket(&self, request: &SocketRequest) -> DriverResult<SocketGuard> {
        let mut started: Option<Instant> = None;
        let mut sync_count = 0;
        let mut warned_limit = false;
        let mut synced = self.synced.subscribe();

        loop {
            loop {
                let (ready, count, masters, servers) = {
                    let topology = self.topology.read();
                    (
                        topology.can_serve(request.mode, request.slave_ok),
                        topology.sync_count,
                        topology.masters.len(),
                        topology.servers.len(),
                    )
                };
                tracing::debug!(
                    "Cluster has {} known masters and {} known slaves",
                    masters,
                    servers - masters
                );
                if ready {
                    break;
                }
                if self.is_closed() {
                    return Err(DriverError::closed("cluster is closed"));
                }
                match started {
                    None => {
                        started = Some(Instant::now());
                        sync_count = count;
                    }
                    Some(at) => {
                        let expired = !request.sync_timeout.is_zero()
                            && at.elapsed() >= request.sync_timeout;
                        if expired || (self.config.fail_fast && count != sync_count) {
                            return Err(DriverError::unreachable("no reachable servers"));
                        }
                    }
                }

                tracing::info!("Waiting for servers to synchronize...");
                self.request_sync();
                let deadline = started
                    .filter(|_| !request.sync_timeout.is_zero())
                    .map(|at| at + request.sync_timeout);
                self.wait_for_change(&mut synced, deadline).await?;
            }

            let server = {
                let topology = self.topology.read();
                if request.slave_ok {
                    topology.servers.best_fit(request.mode, &request.tags)
                } else {
                    topology.masters.best_fit(request.mode, &[])
                }
            };
            let Some(server) = server else {
                let began = *started.get_or_insert_with(Instant::now);
                if !request.sync_timeout.is_zero() && began.elapsed() >= request.sync_timeout {
                    return Err(DriverError::unreachable("no reachable servers"));
                }
                self.request_sync();
                tokio::time::sleep(RESELECT_DELAY).await;
                continue;
            };

            match server
                .acquire_socket(request.pool_limit, request.socket_timeout)
                .await
            {
                Err(DriverError::PoolExhausted) => {
                    if !warned_limit {
                        warned_limit = true;
                        tracing::warn!(
                            "Per-server connection limit reached for {}",
                            server.addr()
                        );
                    }
                    let began = *started.get_or_insert_with(Instant::now);
                    if !request.sync_timeout.is_zero() && began.elapsed() >= request.sync_timeout {
                        return Err(DriverError::timeout(format!(
                            "could not acquire connection to {} within {:?}",
                            server.addr(),
                            request.sync_timeout
                        )));
                    }
                    tokio::time::sleep(RESELECT_DELAY).await;
                }
                Err(e) if e.is_client_error() => {
                    tracing::warn!("Could not acquire socket from {}: {}", server.addr(), e);
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!("Could not acquire socket from {}: {}", server.addr(), e);
                    self.remove_server(&server);
                    self.request_sync();
                }
                Ok((socket, abended)) => {
                    if abended && !request.slave_ok {
                        match self.is_master(&socket).await {
                            Ok(result) if result.is_master => {}
                            other => {
                                tracing::info!(
                                    "Cannot confirm server {} as master ({:?})",
                                    server.addr(),
                                    other.map(|r| r.is_master)
                                );
                                drop(socket);
                                self.request_sync();
                                tokio::time::sleep(RESELECT_DELAY).await;
                                continue;
                            }
                        }
                    }
                    return Ok(socket);
                }
            }
        }
    }

    /// 소켓으로 `ismaster` 실행
    pub(super) async fn is_master(&self, socket: &Socket) -> DriverResult<IsMasterResult> {
        let reply = socket
            .run_command("admin", &doc! { "ismaster": 1 }, true)
            .await?;
        Ok(bson::from_document(reply)?)
    }

    /// 변경을 기다림 (기한이 지나면 false)
    async fn wait_for_change(
        &self,
        synced: &mut watch::Receiver<u64>,
        deadline: Option<Instant>,
    ) -> DriverResult<bool> {
        let sleep = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(DriverError::closed("cluster is closed")),
            changed = synced.changed() => match changed {
                Ok(()) => Ok(true),
                Err(_) => Err(DriverError::closed("cluster is closed")),
            },
            _ = sleep => Ok(false),
        }
    }

    // ------------------------------------------------------------------------
    // 동기화 루프
    // ------------------------------------------------------------------------

    async fn sync_loop(self: Arc<Self>, mut requests: mpsc::Receiver<()>) {
        loop {
            if self.is_closed() {
                break;
            }
            tracing::debug!("SYNC Starting full topology synchronization...");
            self.sync_pass().await;
            // 패스 중에 쌓인 요청은 이번 패스로 충족
            while requests.try_recv().is_ok() {}

            if !self.config.fail_fast && !self.pause(self.config.sync_retry_delay).await {
                break;
            }
            if self.is_closed() {
                break;
            }

            let restart = {
                let mut topology = self.topology.write();
                topology.sync_count += 1;
                (!self.config.direct && topology.masters.is_empty()) || topology.servers.is_empty()
            };
            self.synced.send_modify(|count| *count += 1);

            if restart {
                tracing::info!("SYNC No masters found. Will synchronize again.");
                if !self.pause(self.config.sync_retry_delay).await {
                    break;
                }
                continue;
            }

            tracing::debug!("SYNC Cluster waiting for next requested or scheduled sync.");
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = requests.recv() => {}
                _ = tokio::time::sleep(self.config.sync_interval) => {}
            }
        }
        tracing::debug!("SYNC Cluster stopping synchronization loop.");
    }

    /// 대기 (종료되면 false)
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let topology = self.topology.read();
        f.debug_struct("Cluster")
            .field("servers", &topology.servers.addrs())
            .field("masters", &topology.masters.addrs())
            .field("sync_count", &topology.sync_count)
            .field("references", &self.references())
            .finish()
    }
}
