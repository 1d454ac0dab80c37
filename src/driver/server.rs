//! 서버 풀
//!
//! 노드 하나에 대한 소켓 풀과 핑 통계를 관리합니다.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bson::{doc, Bson};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::command::IsMasterResult;
use super::error::{DriverError, DriverResult};
use super::net::Dialer;
use super::socket::{Socket, SocketGuard};
use super::stats::Stats;
use crate::wire::DEFAULT_MAX_MESSAGE_SIZE;

/// 기본 쓰기 배치 크기
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1000;

/// 핑 샘플 수
pub const PING_WINDOW: usize = 6;

/// 태그 집합
pub type TagSet = BTreeMap<String, String>;

// ============================================================================
// ServerInfo - 서버 역할 정보
// ============================================================================

/// 서버 역할 정보
#[derive(Debug, Clone, PartialEq)]
pub struct ServerInfo {
    /// 쓰기 가능 노드
    pub master: bool,
    /// 세컨더리
    pub secondary: bool,
    /// 라우터(mongos)
    pub mongos: bool,
    /// 레플리카 셋 이름
    pub set_name: Option<String>,
    /// 노드 태그
    pub tags: TagSet,
    /// 최대 와이어 버전
    pub max_wire_version: i32,
    /// 최대 메시지 크기
    pub max_message_size: usize,
    /// 최대 쓰기 배치 크기
    pub max_batch_size: usize,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            master: false,
            secondary: false,
            mongos: false,
            set_name: None,
            tags: TagSet::new(),
            max_wire_version: 0,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

impl ServerInfo {
    /// `ismaster` 응답에서 생성
    pub fn from_ismaster(result: &IsMasterResult) -> Self {
        let tags = result
            .tags
            .iter()
            .flat_map(|doc| doc.iter())
            .filter_map(|(k, v)| match v {
                Bson::String(s) => Some((k.clone(), s.clone())),
                _ => None,
            })
            .collect();

        Self {
            master: result.is_master,
            secondary: result.secondary,
            mongos: result.is_mongos(),
            set_name: result.set_name.clone(),
            tags,
            max_wire_version: result.max_wire_version,
            max_message_size: result
                .max_message_size
                .filter(|size| *size > 0)
                .map(|size| size as usize)
                .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE),
            max_batch_size: result
                .max_write_batch_size
                .filter(|size| *size > 0)
                .map(|size| size as usize)
                .unwrap_or(DEFAULT_MAX_BATCH_SIZE),
        }
    }

    /// 태그 집합 중 하나라도 모두 일치하는지 확인
    pub fn has_tags(&self, tag_sets: &[TagSet]) -> bool {
        tag_sets.iter().any(|set| {
            set.iter()
                .all(|(k, v)| self.tags.get(k).map(|mine| mine == v).unwrap_or(false))
        })
    }
}

// ============================================================================
// ServerMetrics - 서버 메트릭
// ============================================================================

/// 서버 메트릭
#[derive(Debug, Clone, Default)]
pub struct ServerMetrics {
    /// 살아 있는 소켓 수
    pub live: usize,
    /// 유휴 소켓 수
    pub unused: usize,
    /// 사용 중인 소켓 수
    pub in_use: usize,
    /// 핑 (최근 샘플 중 최댓값)
    pub ping: Duration,
    /// 총 생성 횟수
    pub total_created: u64,
    /// 총 획득 횟수
    pub total_acquisitions: u64,
}

// ============================================================================
// Server - 노드별 소켓 풀
// ============================================================================

#[derive(Default)]
struct SocketPool {
    live: Vec<Arc<Socket>>,
    unused: VecDeque<Arc<Socket>>,
    closed: bool,
    abended: bool,
}

#[derive(Default)]
struct PingWindow {
    samples: [Duration; PING_WINDOW],
    next: usize,
    value: Duration,
}

impl PingWindow {
    fn record(&mut self, sample: Duration) {
        self.samples[self.next] = sample;
        self.next = (self.next + 1) % PING_WINDOW;
        self.value = self.samples.iter().copied().max().unwrap_or_default();
    }
}

/// 노드 하나
///
/// 풀이 소켓을 소유하고 소켓은 서버를 약하게 참조합니다.
pub struct Server {
    addr: String,
    resolved_addr: SocketAddr,
    me: Weak<Server>,
    info: RwLock<ServerInfo>,
    pool: Mutex<SocketPool>,
    ping: Mutex<PingWindow>,
    pinger_started: AtomicBool,
    sync_requests: mpsc::Sender<()>,
    dialer: Arc<dyn Dialer>,
    dial_timeout: Duration,
    stats: Arc<Stats>,
    total_created: AtomicU64,
    total_acquisitions: AtomicU64,
}

impl Server {
    /// 새 서버 생성
    ///
    /// `sync_requests`는 비정상 종료 시 클러스터 재동기화를 요청하는 채널입니다.
    pub fn new(
        addr: impl Into<String>,
        resolved_addr: SocketAddr,
        sync_requests: mpsc::Sender<()>,
        dialer: Arc<dyn Dialer>,
        dial_timeout: Duration,
        stats: Arc<Stats>,
    ) -> Arc<Self> {
        let addr = addr.into();
        Arc::new_cyclic(|me| Self {
            addr,
            resolved_addr,
            me: me.clone(),
            info: RwLock::new(ServerInfo::default()),
            pool: Mutex::new(SocketPool::default()),
            ping: Mutex::new(PingWindow::default()),
            pinger_started: AtomicBool::new(false),
            sync_requests,
            dialer,
            dial_timeout,
            stats,
            total_created: AtomicU64::new(0),
            total_acquisitions: AtomicU64::new(0),
        })
    }

    /// 사용자가 준 주소
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// 해석된 주소
    pub fn resolved_addr(&self) -> SocketAddr {
        self.resolved_addr
    }

    /// 역할 정보
    pub fn info(&self) -> ServerInfo {
        self.info.read().clone()
    }

    /// 역할 정보 갱신
    pub fn set_info(&self, info: ServerInfo) {
        *self.info.write() = info;
    }

    /// 태그 집합 중 하나와 일치하는지 확인
    pub fn has_tags(&self, tag_sets: &[TagSet]) -> bool {
        self.info.read().has_tags(tag_sets)
    }

    /// 닫혔는지 여부
    pub fn is_closed(&self) -> bool {
        self.pool.lock().closed
    }

    /// 소켓이 비정상 종료된 적이 있는지 여부
    pub fn abended(&self) -> bool {
        self.pool.lock().abended
    }

    /// 핑 값
    pub fn ping_value(&self) -> Duration {
        self.ping.lock().value
    }

    /// 핑 샘플 기록
    pub fn record_ping(&self, sample: Duration) {
        self.ping.lock().record(sample);
    }

    /// 사용 중인 소켓 수
    pub fn in_use_sockets(&self) -> usize {
        let pool = self.pool.lock();
        pool.live.len() - pool.unused.len()
    }

    /// 메트릭
    pub fn metrics(&self) -> ServerMetrics {
        let (live, unused) = {
            let pool = self.pool.lock();
            (pool.live.len(), pool.unused.len())
        };
        ServerMetrics {
            live,
            unused,
            in_use: live - unused,
            ping: self.ping_value(),
            total_created: self.total_created.load(Ordering::Relaxed),
            total_acquisitions: self.total_acquisitions.load(Ordering::Relaxed),
        }
    }

    // ------------------------------------------------------------------------
    // 소켓 획득과 반환
    // ------------------------------------------------------------------------

    /// 소켓 획득
    ///
    /// 유휴 소켓을 먼저 재사용하고, 없으면 새로 연결합니다. 사용 중인 소켓이
    /// `pool_limit`에 이르면 `PoolExhausted`를 돌려줍니다 (0이면 무제한).
    /// 두 번째 값은 이 서버의 소켓이 비정상 종료된 적이 있는지 여부입니다.
    pub async fn acquire_socket(
        &self,
        pool_limit: usize,
        timeout: Duration,
    ) -> DriverResult<(SocketGuard, bool)> {
        loop {
            let (reused, abended) = {
                let mut pool = self.pool.lock();
                if pool.closed {
                    return Err(DriverError::closed(format!("server {} is closed", self.addr)));
                }
                let in_use = pool.live.len() - pool.unused.len();
                if pool_limit > 0 && in_use >= pool_limit {
                    return Err(DriverError::PoolExhausted);
                }
                (pool.unused.pop_front(), pool.abended)
            };

            if let Some(socket) = reused {
                match socket.initial_acquire(self.info(), timeout) {
                    Ok(()) => {
                        self.total_acquisitions.fetch_add(1, Ordering::Relaxed);
                        return Ok((SocketGuard::new(socket), abended));
                    }
                    Err(_) => {
                        // 유휴 중에 죽은 소켓은 버리고 다시 시도
                        self.pool.lock().live.retain(|s| s.id() != socket.id());
                        continue;
                    }
                }
            }

            let socket = self.connect(timeout).await?;
            {
                let mut pool = self.pool.lock();
                if pool.closed {
                    drop(pool);
                    socket.close();
                    return Err(DriverError::closed(format!("server {} is closed", self.addr)));
                }
                pool.live.push(Arc::clone(&socket));
            }
            socket.initial_acquire(self.info(), timeout)?;
            self.total_acquisitions.fetch_add(1, Ordering::Relaxed);
            return Ok((SocketGuard::new(socket), abended));
        }
    }

    /// 새 연결 생성
    pub async fn connect(&self, timeout: Duration) -> DriverResult<Arc<Socket>> {
        tracing::debug!(
            "Establishing new connection to {} (timeout={:?})",
            self.addr,
            self.dial_timeout
        );
        let stream = match self.dialer.dial(self.resolved_addr, self.dial_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("Connection to {} failed: {}", self.addr, e);
                return Err(e);
            }
        };
        tracing::debug!("Connection to {} established", self.addr);
        self.total_created.fetch_add(1, Ordering::Relaxed);

        Ok(Socket::spawn(
            stream,
            self.addr.clone(),
            self.me.clone(),
            self.info(),
            timeout,
            Arc::clone(&self.stats),
        ))
    }

    /// 참조가 0이 된 소켓을 유휴 목록으로
    pub(crate) fn recycle_socket(&self, id: u64) {
        let mut pool = self.pool.lock();
        let Some(socket) = pool.live.iter().find(|s| s.id() == id).cloned() else {
            return;
        };
        if pool.closed {
            pool.live.retain(|s| s.id() != id);
            drop(pool);
            socket.close();
            return;
        }
        if socket.dead_error().is_none() && !pool.unused.iter().any(|s| s.id() == id) {
            pool.unused.push_back(socket);
        }
    }

    /// 죽은 소켓을 풀에서 제거
    ///
    /// `abend`이면 서버를 비정상으로 표시하고 재동기화를 요청합니다.
    pub(crate) fn forget_socket(&self, id: u64, abend: bool) {
        {
            let mut pool = self.pool.lock();
            if abend {
                pool.abended = true;
            }
            if pool.closed {
                return;
            }
            pool.live.retain(|s| s.id() != id);
            pool.unused.retain(|s| s.id() != id);
        }
        if abend {
            // 채널이 가득 찼으면 이미 요청이 대기 중
            let _ = self.sync_requests.try_send(());
        }
    }

    /// 서버 닫기
    ///
    /// 살아 있는 모든 소켓을 닫고 이후 획득을 거부합니다.
    pub fn close(&self) {
        let sockets = {
            let mut pool = self.pool.lock();
            if pool.closed {
                return;
            }
            pool.closed = true;
            pool.unused.clear();
            std::mem::take(&mut pool.live)
        };
        tracing::info!(
            "Connections to {} closing ({} live sockets)",
            self.addr,
            sockets.len()
        );
        for socket in sockets {
            socket.close();
        }
    }

    // ------------------------------------------------------------------------
    // 핑
    // ------------------------------------------------------------------------

    /// 핑 한 번 측정
    pub async fn ping_once(&self) -> DriverResult<Duration> {
        let (socket, _) = self.acquire_socket(0, self.dial_timeout).await?;
        let started = Instant::now();
        socket
            .run_command("admin", &doc! { "ping": 1 }, true)
            .await?;
        Ok(started.elapsed())
    }

    /// 주기적 핑 태스크 시작 (0이면 시작하지 않음)
    ///
    /// 서버가 닫히거나 드롭되면 끝납니다.
    pub fn spawn_pinger(&self, interval: Duration) {
        if interval.is_zero() || self.pinger_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = self.me.clone();
        tokio::spawn(async move {
            loop {
                let Some(server) = weak.upgrade() else {
                    break;
                };
                if server.is_closed() {
                    break;
                }
                match server.ping_once().await {
                    Ok(sample) => {
                        server.record_ping(sample);
                        tracing::trace!(
                            "Ping for {} is {:?} (window max {:?})",
                            server.addr,
                            sample,
                            server.ping_value()
                        );
                    }
                    Err(e) => tracing::debug!("Ping for {} failed: {}", server.addr, e),
                }
                drop(server);
                tokio::time::sleep(interval).await;
            }
        });
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.addr)
            .field("resolved_addr", &self.resolved_addr)
            .field("master", &self.info.read().master)
            .field("metrics", &self.metrics())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::{master_doc, MockNet};
    use crate::driver::socket::SocketState;

    fn server(net: &Arc<MockNet>, addr: &str) -> (Arc<Server>, mpsc::Receiver<()>) {
        let node = net.add_node(addr);
        node.set_ismaster(master_doc("", &[]));
        let (tx, rx) = mpsc::channel(1);
        let server = Server::new(
            addr,
            node.resolved(),
            tx,
            net.clone(),
            Duration::from_secs(1),
            Arc::new(Stats::new()),
        );
        (server, rx)
    }

    #[test]
    fn test_server_info_from_ismaster() {
        let result: IsMasterResult = bson::from_document(doc! {
            "ismaster": false,
            "secondary": true,
            "setName": "rs0",
            "tags": { "dc": "east", "rack": "1" },
            "maxMessageSizeBytes": 1024_i64,
            "ok": 1,
        })
        .unwrap();
        let info = ServerInfo::from_ismaster(&result);
        assert!(!info.master);
        assert!(info.secondary);
        assert_eq!(info.max_message_size, 1024);
        assert_eq!(info.max_batch_size, DEFAULT_MAX_BATCH_SIZE);

        let east: TagSet = [("dc".to_string(), "east".to_string())].into();
        let west: TagSet = [("dc".to_string(), "west".to_string())].into();
        assert!(info.has_tags(&[east.clone()]));
        assert!(!info.has_tags(&[west.clone()]));
        assert!(info.has_tags(&[west, east]));
    }

    #[test]
    fn test_ping_window_keeps_max_of_recent() {
        let mut window = PingWindow::default();
        window.record(Duration::from_millis(50));
        for _ in 0..5 {
            window.record(Duration::from_millis(5));
        }
        assert_eq!(window.value, Duration::from_millis(50));
        window.record(Duration::from_millis(5));
        assert_eq!(window.value, Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_released_socket_is_reused() {
        let net = MockNet::new();
        let (server, _rx) = server(&net, "a:27017");

        let (first, _) = server.acquire_socket(0, Duration::from_secs(1)).await.unwrap();
        let id = first.id();
        drop(first);
        assert_eq!(server.metrics().unused, 1);

        let (second, abended) = server.acquire_socket(0, Duration::from_secs(1)).await.unwrap();
        assert_eq!(second.id(), id);
        assert!(!abended);
        assert_eq!(server.metrics().total_created, 1);
        assert_eq!(server.in_use_sockets(), 1);
    }

    #[tokio::test]
    async fn test_pool_limit() {
        let net = MockNet::new();
        let (server, _rx) = server(&net, "a:27017");

        let (_held, _) = server.acquire_socket(1, Duration::from_secs(1)).await.unwrap();
        let err = server.acquire_socket(1, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, DriverError::PoolExhausted);
        assert!(server.acquire_socket(0, Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_abend_requests_sync() {
        let net = MockNet::new();
        let (server, mut rx) = server(&net, "a:27017");

        let (socket, _) = server.acquire_socket(0, Duration::from_secs(1)).await.unwrap();
        socket.kill(DriverError::connection("reset"), true);

        assert!(server.abended());
        assert_eq!(server.metrics().live, 0);
        assert!(rx.try_recv().is_ok());

        let (_, abended) = server.acquire_socket(0, Duration::from_secs(1)).await.unwrap();
        assert!(abended);
    }

    #[tokio::test]
    async fn test_close_kills_live_sockets() {
        let net = MockNet::new();
        let (server, _rx) = server(&net, "a:27017");

        let (socket, _) = server.acquire_socket(0, Duration::from_secs(1)).await.unwrap();
        server.close();
        assert_eq!(socket.state(), SocketState::Dead);
        assert!(matches!(
            server.acquire_socket(0, Duration::from_secs(1)).await,
            Err(DriverError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_ping_once() {
        let net = MockNet::new();
        let (server, _rx) = server(&net, "a:27017");
        assert!(server.ping_once().await.is_ok());
        assert_eq!(server.metrics().unused, 1);
    }
}
