//! 세션 라우터
//!
//! 일관성 모드에 따라 소켓을 고르고, 순서가 중요한 모드에서는 처음 얻은
//! 소켓을 세션에 고정합니다.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bson::Document;
use bytes::Bytes;
use parking_lot::RwLock;

use super::auth::{Authenticator, Credential};
use super::cluster::{wrap_read_preference, Cluster, SocketRequest};
use super::command::check_command;
use super::concern::{send_insert, send_write, split_namespace, WriteConcern, WriteResult};
use super::cursor::{Iter, DEFAULT_PREFETCH};
use super::error::{DriverError, DriverResult};
use super::server::TagSet;
use super::socket::{Op, Socket, SocketGuard};
use crate::wire::{
    delete_flags, document, query_flags, update_flags, DeleteOp, InsertOp, QueryOp, Request,
    UpdateOp,
};

pub use super::cluster::Mode;

/// 중복 키 경합 시 upsert 최대 시도 횟수
pub const MAX_UPSERT_ATTEMPTS: usize = 5;

// ============================================================================
// SessionConfig - 세션 설정
// ============================================================================

/// 세션 설정
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// 일관성 모드
    pub mode: Mode,
    /// 쓰기 확인 (None이면 확인 안 함)
    pub safe: Option<WriteConcern>,
    /// 서버 선택 대기 한도
    pub sync_timeout: Duration,
    /// 소켓 타임아웃
    pub socket_timeout: Duration,
    /// 서버당 소켓 상한
    pub pool_limit: usize,
    /// 배치 크기 (0이면 서버 기본값)
    pub batch_size: i32,
    /// prefetch 비율
    pub prefetch: f64,
    /// 태그 필터
    pub tags: Vec<TagSet>,
    /// 기본 데이터베이스
    pub database: Option<String>,
    /// 자격 증명
    pub credentials: Vec<Credential>,
}

impl SessionConfig {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 빌더 시작
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Strong,
            safe: Some(WriteConcern::acknowledged()),
            sync_timeout: Duration::from_secs(60),
            socket_timeout: Duration::from_secs(60),
            pool_limit: 4096,
            batch_size: 0,
            prefetch: DEFAULT_PREFETCH,
            tags: Vec::new(),
            database: None,
            credentials: Vec::new(),
        }
    }
}

/// 세션 설정 빌더
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// 새 빌더 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 모드 설정
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.config.mode = mode;
        self
    }

    /// 쓰기 확인 설정
    pub fn with_safe(mut self, safe: Option<WriteConcern>) -> Self {
        self.config.safe = safe;
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

    /// 서버당 소켓 상한 설정
    pub fn with_pool_limit(mut self, limit: usize) -> Self {
        self.config.pool_limit = limit;
        self
    }

    /// 배치 크기 설정
    pub fn with_batch_size(mut self, size: i32) -> Self {
        self.config.batch_size = size;
        self
    }

    /// prefetch 비율 설정
    pub fn with_prefetch(mut self, prefetch: f64) -> Self {
        self.config.prefetch = prefetch;
        self
    }

    /// 태그 필터 설정
    pub fn with_tags(mut self, tags: Vec<TagSet>) -> Self {
        self.config.tags = tags;
        self
    }

    /// 기본 데이터베이스 설정
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.config.database = Some(database.into());
        self
    }

    /// 자격 증명 추가
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.config.credentials.push(credential);
        self
    }

    /// 설정 빌드
    pub fn build(self) -> SessionConfig {
        self.config
    }
}

// ============================================================================
// FindOptions - 조회 옵션
// ============================================================================

/// 조회 옵션
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// 건너뛸 문서 수
    pub skip: i32,
    /// 최대 문서 수 (0이면 무제한)
    pub limit: i32,
    /// 배치 크기 (없으면 세션 값)
    pub batch_size: Option<i32>,
    /// prefetch 비율 (없으면 세션 값)
    pub prefetch: Option<f64>,
    /// 반환 필드
    pub projection: Option<Document>,
    /// tailable 커서
    pub tailable: bool,
    /// 데이터가 올 때까지 서버에서 대기
    pub await_data: bool,
    /// 서버 측 커서 타임아웃 끔
    pub no_cursor_timeout: bool,
    /// tailable 커서의 빈 대기 한도
    pub tail_timeout: Option<Duration>,
}

impl FindOptions {
    /// 한도 설정
    pub fn with_limit(mut self, limit: i32) -> Self {
        self.limit = limit;
        self
    }

    /// 배치 크기 설정
    pub fn with_batch_size(mut self, size: i32) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// prefetch 비율 설정
    pub fn with_prefetch(mut self, prefetch: f64) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    /// tailable 커서로 설정
    pub fn with_tail(mut self, timeout: Option<Duration>) -> Self {
        self.tailable = true;
        self.await_data = true;
        self.tail_timeout = timeout;
        self
    }

    fn flags(&self) -> i32 {
        let mut flags = 0;
        if self.tailable {
            flags |= query_flags::TAILABLE;
        }
        if self.await_data {
            flags |= query_flags::AWAIT_DATA;
        }
        if self.no_cursor_timeout {
            flags |= query_flags::NO_CURSOR_TIMEOUT;
        }
        flags
    }
}

/// 첫 쿼리의 numberToReturn
fn first_batch_limit(batch_size: i32, limit: i32) -> i32 {
    if limit == 1 {
        -1
    } else if limit > 0 && (batch_size <= 0 || limit < batch_size) {
        limit
    } else {
        batch_size
    }
}

// ============================================================================
// SessionCore - 공유 상태
// ============================================================================

#[derive(Clone)]
struct SessionState {
    mode: Mode,
    slave_ok: bool,
    master_socket: Option<SocketGuard>,
    slave_socket: Option<SocketGuard>,
    safe: Option<WriteConcern>,
    sync_timeout: Duration,
    socket_timeout: Duration,
    pool_limit: usize,
    batch_size: i32,
    prefetch: f64,
    tags: Vec<TagSet>,
    database: Option<String>,
    credentials: Vec<Credential>,
}

impl SessionState {
    fn from_config(config: SessionConfig) -> Self {
        Self {
            mode: config.mode,
            slave_ok: config.mode.allows_secondary(),
            master_socket: None,
            slave_socket: None,
            safe: config.safe,
            sync_timeout: config.sync_timeout,
            socket_timeout: config.socket_timeout,
            pool_limit: config.pool_limit,
            batch_size: config.batch_size,
            prefetch: config.prefetch,
            tags: config.tags,
            database: config.database,
            credentials: config.credentials,
        }
    }

    /// 고정 소켓 해제 (드롭은 호출자가 잠금 밖에서)
    fn take_sockets(&mut self) -> (Option<SocketGuard>, Option<SocketGuard>) {
        (self.master_socket.take(), self.slave_socket.take())
    }

    /// 재사용할 고정 소켓
    fn reserved(&self, slave_ok: bool) -> Option<SocketGuard> {
        if let Some(socket) = &self.slave_socket {
            let may_use_slave = self.master_socket.is_none()
                || (self.mode != Mode::PrimaryPreferred && self.mode != Mode::Monotonic);
            if self.slave_ok && slave_ok && may_use_slave {
                return Some(socket.clone());
            }
        }
        self.master_socket.clone()
    }
}

/// 세션 공유 상태
///
/// 세션 핸들과 커서가 함께 참조합니다. 마지막 참조가 사라지면 닫힙니다.
pub struct SessionCore {
    cluster: Arc<Cluster>,
    authenticator: Option<Arc<dyn Authenticator>>,
    state: RwLock<SessionState>,
    acquire_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl SessionCore {
    fn new(
        cluster: Arc<Cluster>,
        authenticator: Option<Arc<dyn Authenticator>>,
        state: SessionState,
    ) -> Self {
        cluster.acquire();
        Self {
            cluster,
            authenticator,
            state: RwLock::new(state),
            acquire_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> DriverResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(DriverError::closed("session is closed"))
        } else {
            Ok(())
        }
    }

    pub(crate) fn socket_timeout(&self) -> Duration {
        self.state.read().socket_timeout
    }

    /// 세션 모드에 맞는 소켓
    ///
    /// 고정 소켓이 있으면 그대로 쓰고, 없으면 클러스터에서 골라 로그인한 뒤
    /// 모드가 허락하면 고정합니다.
    pub(crate) async fn acquire_socket(&self, slave_ok: bool) -> DriverResult<SocketGuard> {
        self.ensure_open()?;
        if let Some(socket) = self.state.read().reserved(slave_ok) {
            return Ok(socket);
        }

        let _serial = self.acquire_lock.lock().await;
        if let Some(socket) = self.state.read().reserved(slave_ok) {
            return Ok(socket);
        }

        let (request, pins) = {
            let st = self.state.read();
            (
                SocketRequest {
                    mode: st.mode,
                    slave_ok: slave_ok && st.slave_ok,
                    sync_timeout: st.sync_timeout,
                    socket_timeout: st.socket_timeout,
                    tags: st.tags.clone(),
                    pool_limit: st.pool_limit,
                },
                st.mode.pins_sockets(),
            )
        };
        let socket = self.cluster.acquire_socket(&request).await?;
        self.login_socket(&socket).await?;

        let mut st = self.state.write();
        if pins {
            if socket.server_info().master {
                if st.master_socket.is_none() {
                    st.master_socket = Some(socket.clone());
                }
            } else if st.slave_socket.is_none() {
                st.slave_socket = Some(socket.clone());
            }
        }
        if !slave_ok && st.mode == Mode::Monotonic {
            st.slave_ok = false;
        }
        drop(st);
        Ok(socket)
    }

    /// 세션의 자격 증명으로 로그인
    pub(crate) async fn login_socket(&self, socket: &Socket) -> DriverResult<()> {
        let credentials = self.state.read().credentials.clone();
        for credential in &credentials {
            socket
                .login(credential, self.authenticator.as_deref())
                .await?;
        }
        Ok(())
    }

    /// 쿼리 문서 인코딩과 플래그 설정
    ///
    /// 세컨더리 읽기를 라우터로 보내면 읽기 선호도로 감쌉니다.
    fn prepare_query(&self, op: &mut QueryOp, query: Document, socket: &Socket) -> DriverResult<()> {
        let (slave_ok, mode, tags) = {
            let st = self.state.read();
            (st.slave_ok, st.mode, st.tags.clone())
        };
        if slave_ok {
            op.flags |= query_flags::SLAVE_OK;
        }
        let query = if slave_ok && socket.server_info().mongos {
            wrap_read_preference(query, mode, &tags)
        } else {
            query
        };
        op.query = document::encode(&query)?;
        Ok(())
    }

    fn unset_sockets(&self) {
        let pins = self.state.write().take_sockets();
        drop(pins);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.unset_sockets();
        self.cluster.release();
    }
}

impl Drop for SessionCore {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Session - 세션
// ============================================================================

/// 데이터베이스 세션
///
/// `Clone`은 고정 소켓까지 공유하는 새 세션을, [`Session::copy`]는 같은
/// 설정에 고정 소켓이 없는 새 세션을 만듭니다.
pub struct Session {
    core: Arc<SessionCore>,
}

impl Session {
    /// 새 세션 생성 (클러스터 참조 +1)
    pub fn new(
        cluster: Arc<Cluster>,
        authenticator: Option<Arc<dyn Authenticator>>,
        config: SessionConfig,
    ) -> Self {
        Self {
            core: Arc::new(SessionCore::new(
                cluster,
                authenticator,
                SessionState::from_config(config),
            )),
        }
    }

    fn with_state(&self, state: SessionState) -> Self {
        Self {
            core: Arc::new(SessionCore::new(
                Arc::clone(&self.core.cluster),
                self.core.authenticator.clone(),
                state,
            )),
        }
    }

    /// 클러스터
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.core.cluster
    }

    /// 살아 있는 서버 주소
    pub fn live_servers(&self) -> Vec<String> {
        self.core.cluster.live_servers()
    }

    // ------------------------------------------------------------------------
    // 모드와 설정
    // ------------------------------------------------------------------------

    /// 현재 모드
    pub fn mode(&self) -> Mode {
        self.core.state.read().mode
    }

    /// 모드 변경
    ///
    /// `refresh`이면 고정 소켓을 풀고 세컨더리 허용 여부를 초기화합니다.
    pub fn set_mode(&self, mode: Mode, refresh: bool) {
        let pins = {
            let mut st = self.core.state.write();
            st.mode = mode;
            if refresh {
                st.slave_ok = mode.allows_secondary();
                st.take_sockets()
            } else {
                if mode == Mode::Strong {
                    st.slave_ok = false;
                } else if st.master_socket.is_none() {
                    st.slave_ok = true;
                }
                (None, None)
            }
        };
        drop(pins);
    }

    /// 고정 소켓 해제
    pub fn refresh(&self) {
        let pins = {
            let mut st = self.core.state.write();
            st.slave_ok = st.mode.allows_secondary();
            st.take_sockets()
        };
        drop(pins);
    }

    /// 같은 설정, 고정 소켓 없는 새 세션
    pub fn copy(&self) -> Self {
        let mut state = self.core.state.read().clone();
        let pins = state.take_sockets();
        drop(pins);
        state.slave_ok = state.mode.allows_secondary();
        self.with_state(state)
    }

    /// 세션 닫기 (여러 번 불러도 됨)
    pub fn close(&self) {
        self.core.close();
    }

    /// 닫혔는지 여부
    pub fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::SeqCst)
    }

    /// 쓰기 확인
    pub fn safe(&self) -> Option<WriteConcern> {
        self.core.state.read().safe.clone()
    }

    /// 쓰기 확인 설정 (None이면 확인 안 함)
    pub fn set_safe(&self, safe: Option<WriteConcern>) {
        self.core.state.write().safe = safe;
    }

    /// 서버 선택 대기 한도 설정
    pub fn set_sync_timeout(&self, timeout: Duration) {
        self.core.state.write().sync_timeout = timeout;
    }

    /// 소켓 타임아웃 설정 (고정 소켓에도 적용)
    pub fn set_socket_timeout(&self, timeout: Duration) {
        let mut st = self.core.state.write();
        st.socket_timeout = timeout;
        for socket in [&st.master_socket, &st.slave_socket].into_iter().flatten() {
            socket.set_timeout(timeout);
        }
    }

    /// 서버당 소켓 상한 설정
    pub fn set_pool_limit(&self, limit: usize) {
        self.core.state.write().pool_limit = limit;
    }

    /// 배치 크기 설정
    pub fn set_batch(&self, size: i32) {
        self.core.state.write().batch_size = size;
    }

    /// prefetch 비율 설정
    pub fn set_prefetch(&self, prefetch: f64) {
        self.core.state.write().prefetch = prefetch;
    }

    /// 태그 필터 설정 (고정 소켓 해제)
    pub fn select_servers(&self, tags: Vec<TagSet>) {
        let pins = {
            let mut st = self.core.state.write();
            st.tags = tags;
            st.take_sockets()
        };
        drop(pins);
    }

    /// 기본 데이터베이스
    pub fn database(&self) -> Option<String> {
        self.core.state.read().database.clone()
    }

    // ------------------------------------------------------------------------
    // 인증
    // ------------------------------------------------------------------------

    /// 로그인하고 세션 자격 증명에 추가 (같은 source는 교체)
    pub async fn login(&self, credential: Credential) -> DriverResult<()> {
        let socket = self.core.acquire_socket(true).await?;
        socket
            .login(&credential, self.core.authenticator.as_deref())
            .await?;
        let mut st = self.core.state.write();
        st.credentials.retain(|c| c.source != credential.source);
        st.credentials.push(credential);
        Ok(())
    }

    /// 모든 자격 증명 로그아웃
    pub fn logout_all(&self) {
        let mut st = self.core.state.write();
        st.credentials.clear();
        for socket in [&st.master_socket, &st.slave_socket].into_iter().flatten() {
            socket.logout_all();
        }
    }

    /// 세션 자격 증명
    pub fn credentials(&self) -> Vec<Credential> {
        self.core.state.read().credentials.clone()
    }

    // ------------------------------------------------------------------------
    // 연산
    // ------------------------------------------------------------------------

    /// 모드에 맞는 소켓 획득
    pub async fn acquire_socket(&self, slave_ok: bool) -> DriverResult<SocketGuard> {
        self.core.acquire_socket(slave_ok).await
    }

    /// 명령 실행
    pub async fn run(&self, db: &str, cmd: Document) -> DriverResult<Document> {
        let socket = self.core.acquire_socket(true).await?;
        let mut op = QueryOp::new(format!("{}.$cmd", db), Bytes::new());
        op.limit = -1;
        self.core.prepare_query(&mut op, cmd, &socket)?;
        let raw = socket.simple_query(op).await?;
        check_command(document::decode(&raw)?)
    }

    /// 핑
    pub async fn ping(&self) -> DriverResult<()> {
        self.run("admin", bson::doc! { "ping": 1 }).await.map(|_| ())
    }

    /// 조회
    pub async fn find(&self, ns: &str, filter: Document, options: FindOptions) -> DriverResult<Iter> {
        split_namespace(ns)?;
        let socket = self.core.acquire_socket(true).await?;
        let (batch_size, prefetch) = {
            let st = self.core.state.read();
            (
                options.batch_size.unwrap_or(st.batch_size),
                options.prefetch.unwrap_or(st.prefetch),
            )
        };

        let mut op = QueryOp::new(ns, Bytes::new());
        op.flags = options.flags();
        op.skip = options.skip;
        op.limit = first_batch_limit(batch_size, options.limit);
        op.selector = options
            .projection
            .as_ref()
            .map(document::encode)
            .transpose()?;
        self.core.prepare_query(&mut op, filter, &socket)?;

        let iter = Iter::new(
            Arc::clone(&self.core),
            socket.server(),
            ns,
            batch_size,
            prefetch,
            options.limit,
            options.tail_timeout,
        );
        socket
            .query(vec![Op::with_reply(Request::Query(op), iter.callback())])
            .await?;
        Ok(iter)
    }

    /// 첫 문서 조회
    pub async fn find_one(&self, ns: &str, filter: Document) -> DriverResult<Option<Document>> {
        let mut iter = self
            .find(ns, filter, FindOptions::default().with_limit(1))
            .await?;
        iter.next_document().await
    }

    /// 삽입
    pub async fn insert(&self, ns: &str, docs: &[Document]) -> DriverResult<WriteResult> {
        split_namespace(ns)?;
        let documents = docs
            .iter()
            .map(document::encode)
            .collect::<Result<Vec<_>, _>>()?;
        let (socket, safe) = self.write_socket().await?;
        let op = InsertOp {
            flags: 0,
            collection: ns.to_string(),
            documents,
        };
        send_insert(&socket, op, safe.as_ref()).await
    }

    /// 갱신
    pub async fn update(
        &self,
        ns: &str,
        selector: Document,
        update: Document,
        multi: bool,
    ) -> DriverResult<WriteResult> {
        let flags = if multi { update_flags::MULTI } else { 0 };
        self.write_update(ns, selector, update, flags).await
    }

    /// upsert
    ///
    /// 동시 upsert의 중복 키 경합은 제한된 횟수만큼 다시 시도합니다.
    pub async fn upsert(
        &self,
        ns: &str,
        selector: Document,
        update: Document,
    ) -> DriverResult<WriteResult> {
        let mut attempt = 1;
        loop {
            match self
                .write_update(ns, selector.clone(), update.clone(), update_flags::UPSERT)
                .await
            {
                Err(e) if e.is_dup() && attempt < MAX_UPSERT_ATTEMPTS => {
                    tracing::debug!("Upsert on {} hit duplicate key (attempt {})", ns, attempt);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// 삭제
    pub async fn remove(&self, ns: &str, selector: Document, multi: bool) -> DriverResult<WriteResult> {
        split_namespace(ns)?;
        let op = DeleteOp {
            collection: ns.to_string(),
            flags: if multi { 0 } else { delete_flags::SINGLE_REMOVE },
            selector: document::encode(&selector)?,
        };
        self.write_one(Request::Delete(op)).await
    }

    async fn write_update(
        &self,
        ns: &str,
        selector: Document,
        update: Document,
        flags: i32,
    ) -> DriverResult<WriteResult> {
        split_namespace(ns)?;
        let op = UpdateOp {
            collection: ns.to_string(),
            flags,
            selector: document::encode(&selector)?,
            update: document::encode(&update)?,
        };
        self.write_one(Request::Update(op)).await
    }

    async fn write_one(&self, request: Request) -> DriverResult<WriteResult> {
        let (socket, safe) = self.write_socket().await?;
        let last = send_write(&socket, request, safe.as_ref()).await?;
        Ok(last.map(WriteResult::from).unwrap_or_default())
    }

    async fn write_socket(&self) -> DriverResult<(SocketGuard, Option<WriteConcern>)> {
        let socket = self.core.acquire_socket(false).await?;
        Ok((socket, self.safe()))
    }
}

impl Clone for Session {
    fn clone(&self) -> Self {
        let state = self.core.state.read().clone();
        self.with_state(state)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.core.state.read();
        f.debug_struct("Session")
            .field("mode", &st.mode)
            .field("slave_ok", &st.slave_ok)
            .field("master_socket", &st.master_socket.as_ref().map(|s| s.id()))
            .field("slave_socket", &st.slave_socket.as_ref().map(|s| s.id()))
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::cluster::Role;
    use crate::driver::mock::{
        master_doc, mongos_doc, secondary_doc, test_cluster_config, CountingAuthenticator,
        MockNet,
    };
    use crate::driver::stats::Stats;
    use bson::doc;
    use pretty_assertions::assert_eq;

    const HOSTS: [&str; 2] = ["a:27017", "b:27017"];

    async fn replica_set(net: &Arc<MockNet>) -> Arc<Cluster> {
        net.add_node("a:27017").set_ismaster(master_doc("rs0", &HOSTS));
        net.add_node("b:27017").set_ismaster(secondary_doc("rs0", &HOSTS));
        let cluster = Cluster::new(test_cluster_config(net, &HOSTS), Arc::new(Stats::new()));
        cluster
            .wait_for_role(Role::Secondary, Duration::from_secs(5))
            .await
            .unwrap();
        cluster
    }

    fn session(cluster: &Arc<Cluster>, mode: Mode) -> Session {
        let config = SessionConfig::builder()
            .with_mode(mode)
            .with_sync_timeout(Duration::from_secs(5))
            .with_socket_timeout(Duration::from_secs(5))
            .build();
        Session::new(Arc::clone(cluster), None, config)
    }

    #[test]
    fn test_first_batch_limit() {
        assert_eq!(first_batch_limit(0, 0), 0);
        assert_eq!(first_batch_limit(0, 1), -1);
        assert_eq!(first_batch_limit(10, 5), 5);
        assert_eq!(first_batch_limit(10, 50), 10);
        assert_eq!(first_batch_limit(0, 50), 50);
    }

    #[test]
    fn test_session_config_builder() {
        let config = SessionConfig::builder()
            .with_mode(Mode::Nearest)
            .with_safe(None)
            .with_batch_size(50)
            .with_database("shop")
            .build();
        assert_eq!(config.mode, Mode::Nearest);
        assert!(config.safe.is_none());
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.database.as_deref(), Some("shop"));
        assert_eq!(SessionConfig::default().pool_limit, 4096);
    }

    #[tokio::test]
    async fn test_strong_routes_to_master_without_pinning() {
        let net = MockNet::new();
        let cluster = replica_set(&net).await;
        let s = session(&cluster, Mode::Strong);

        let socket = s.acquire_socket(true).await.unwrap();
        assert_eq!(socket.addr(), "a:27017");
        drop(socket);
        assert!(s.core.state.read().master_socket.is_none());
        s.close();
        cluster.release();
    }

    #[tokio::test]
    async fn test_monotonic_pins_first_socket() {
        let net = MockNet::new();
        let cluster = replica_set(&net).await;
        let s = session(&cluster, Mode::Monotonic);

        let first = s.acquire_socket(true).await.unwrap();
        let second = s.acquire_socket(true).await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(first.addr(), "b:27017");
        drop((first, second));

        // 쓰기 뒤에는 프라이머리에 고정
        let write = s.acquire_socket(false).await.unwrap();
        assert_eq!(write.addr(), "a:27017");
        let read = s.acquire_socket(true).await.unwrap();
        assert_eq!(read.id(), write.id());
        drop((write, read));

        s.refresh();
        let read = s.acquire_socket(true).await.unwrap();
        assert_eq!(read.addr(), "b:27017");
        drop(read);
        s.close();
        cluster.release();
    }

    #[tokio::test]
    async fn test_set_mode_with_refresh_releases_pins() {
        let net = MockNet::new();
        let cluster = replica_set(&net).await;
        let s = session(&cluster, Mode::Monotonic);

        let write = s.acquire_socket(false).await.unwrap();
        assert_eq!(write.addr(), "a:27017");
        drop(write);
        assert!(!s.core.state.read().slave_ok);

        s.set_mode(Mode::Monotonic, true);
        {
            let st = s.core.state.read();
            assert!(st.master_socket.is_none() && st.slave_socket.is_none());
            assert!(st.slave_ok);
        }
        let read = s.acquire_socket(true).await.unwrap();
        assert_eq!(read.addr(), "b:27017");
        drop(read);

        s.set_mode(Mode::Strong, true);
        {
            let st = s.core.state.read();
            assert!(st.master_socket.is_none() && st.slave_socket.is_none());
            assert!(!st.slave_ok);
        }
        let read = s.acquire_socket(true).await.unwrap();
        assert_eq!(read.addr(), "a:27017");
        drop(read);
        assert_eq!(s.mode(), Mode::Strong);
        s.close();
        cluster.release();
    }

    #[tokio::test]
    async fn test_set_mode_without_refresh_keeps_pins() {
        let net = MockNet::new();
        let cluster = replica_set(&net).await;
        let s = session(&cluster, Mode::Monotonic);

        let read = s.acquire_socket(true).await.unwrap();
        assert_eq!(read.addr(), "b:27017");
        let pinned = read.id();
        drop(read);

        // Strong은 세컨더리 읽기를 끄지만 고정은 유지
        s.set_mode(Mode::Strong, false);
        {
            let st = s.core.state.read();
            assert!(!st.slave_ok);
            assert!(st.slave_socket.is_some());
        }
        let read = s.acquire_socket(true).await.unwrap();
        assert_eq!(read.addr(), "a:27017");
        drop(read);

        // 마스터 고정이 없으면 세컨더리 읽기 다시 허용
        s.set_mode(Mode::Monotonic, false);
        assert!(s.core.state.read().slave_ok);
        let read = s.acquire_socket(true).await.unwrap();
        assert_eq!(read.id(), pinned);
        drop(read);

        let write = s.acquire_socket(false).await.unwrap();
        assert_eq!(write.addr(), "a:27017");
        drop(write);
        s.set_mode(Mode::Eventual, false);
        {
            let st = s.core.state.read();
            assert!(!st.slave_ok);
            assert!(st.master_socket.is_some() && st.slave_socket.is_some());
        }
        s.close();
        cluster.release();
    }

    #[tokio::test]
    async fn test_eventual_never_pins() {
        let net = MockNet::new();
        let cluster = replica_set(&net).await;
        let s = session(&cluster, Mode::Eventual);

        let socket = s.acquire_socket(true).await.unwrap();
        drop(socket);
        let st = s.core.state.read();
        assert!(st.master_socket.is_none() && st.slave_socket.is_none());
        drop(st);
        s.close();
        cluster.release();
    }

    #[tokio::test]
    async fn test_clone_shares_pins_copy_does_not() {
        let net = MockNet::new();
        let cluster = replica_set(&net).await;
        let s = session(&cluster, Mode::Monotonic);
        let pinned = s.acquire_socket(true).await.unwrap().id();

        let cloned = s.clone();
        assert_eq!(cloned.acquire_socket(true).await.unwrap().id(), pinned);

        let copied = s.copy();
        assert!(copied.core.state.read().slave_socket.is_none());
        assert_eq!(copied.mode(), Mode::Monotonic);

        assert_eq!(cluster.references(), 4);
        drop(cloned);
        copied.close();
        s.close();
        s.close();
        assert_eq!(cluster.references(), 1);
        cluster.release();
    }

    #[tokio::test]
    async fn test_reused_socket_is_not_reauthenticated() {
        let net = MockNet::new();
        let cluster = replica_set(&net).await;
        let auth = Arc::new(CountingAuthenticator::default());
        let config = SessionConfig::builder()
            .with_credential(Credential::new("app", "secret").with_source("shop"))
            .with_sync_timeout(Duration::from_secs(5))
            .build();
        let authenticator: Arc<dyn Authenticator> = auth.clone();
        let s = Session::new(Arc::clone(&cluster), Some(authenticator), config);

        let first = s.acquire_socket(false).await.unwrap();
        let id = first.id();
        drop(first);
        let second = s.acquire_socket(false).await.unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(auth.calls(), 1);
        drop(second);
        s.close();
        cluster.release();
    }

    #[tokio::test]
    async fn test_run_and_ping() {
        let net = MockNet::new();
        let cluster = replica_set(&net).await;
        let s = session(&cluster, Mode::Strong);
        s.ping().await.unwrap();
        let err = s.run("admin", doc! { "bogus": 1 }).await.unwrap_err();
        assert!(matches!(err, DriverError::Command { code: 59, .. }));
        s.close();
        cluster.release();
    }

    #[tokio::test]
    async fn test_insert_and_find_with_prefetch() {
        let net = MockNet::new();
        let cluster = replica_set(&net).await;
        let s = session(&cluster, Mode::Strong);

        let docs: Vec<Document> = (0..10).map(|i| doc! { "i": i }).collect();
        s.insert("shop.items", &docs).await.unwrap();
        assert_eq!(net.node("a:27017").documents("shop.items").len(), 10);

        let options = FindOptions::default().with_batch_size(4).with_prefetch(0.5);
        let mut iter = s.find("shop.items", doc! {}, options).await.unwrap();
        iter.next_document().await.unwrap().unwrap();
        iter.next_document().await.unwrap().unwrap();
        assert_eq!(iter.get_mores(), 0);
        // 남은 문서가 prefetch × 배치 아래로 내려가면 미리 요청
        iter.next_document().await.unwrap().unwrap();
        assert_eq!(iter.get_mores(), 1);

        let mut seen = 3;
        while let Some(doc) = iter.next_document().await.unwrap() {
            assert_eq!(doc.get_i32("i").unwrap(), seen);
            seen += 1;
        }
        assert_eq!(seen, 10);
        assert_eq!(iter.cursor_id(), 0);
        s.close();
        cluster.release();
    }

    #[tokio::test]
    async fn test_find_limit_kills_cursor() {
        let net = MockNet::new();
        let cluster = replica_set(&net).await;
        let s = session(&cluster, Mode::Strong);
        let docs: Vec<Document> = (0..10).map(|i| doc! { "i": i }).collect();
        s.insert("shop.items", &docs).await.unwrap();

        let options = FindOptions::default().with_batch_size(2).with_limit(3);
        let mut iter = s.find("shop.items", doc! {}, options).await.unwrap();
        let all: Vec<Document> = iter.all().await.unwrap();
        assert_eq!(all.len(), 3);

        let one = s.find_one("shop.items", doc! {}).await.unwrap().unwrap();
        assert_eq!(one.get_i32("i").unwrap(), 0);
        s.close();
        cluster.release();
    }

    #[tokio::test]
    async fn test_dropped_iter_kills_cursor() {
        let net = MockNet::new();
        let cluster = replica_set(&net).await;
        let s = session(&cluster, Mode::Strong);
        let a = net.node("a:27017");
        a.insert_docs("shop.items", (0..10).map(|i| doc! { "i": i }).collect());

        let options = FindOptions::default().with_batch_size(2).with_prefetch(0.0);
        let mut iter = s.find("shop.items", doc! {}, options).await.unwrap();
        iter.next_document().await.unwrap().unwrap();
        let cursor_id = iter.cursor_id();
        assert_ne!(cursor_id, 0);
        drop(iter);

        for _ in 0..200 {
            if !a.killed_cursors().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(a.killed_cursors(), vec![cursor_id]);
        assert_eq!(a.open_cursors(), 0);
        s.close();
        cluster.release();
    }

    #[tokio::test]
    async fn test_closed_iter_kills_cursor() {
        let net = MockNet::new();
        let cluster = replica_set(&net).await;
        let s = session(&cluster, Mode::Strong);
        let a = net.node("a:27017");
        a.insert_docs("shop.items", (0..10).map(|i| doc! { "i": i }).collect());

        let options = FindOptions::default().with_batch_size(4).with_prefetch(0.0);
        let mut iter = s.find("shop.items", doc! {}, options).await.unwrap();
        iter.next_document().await.unwrap().unwrap();
        let cursor_id = iter.cursor_id();
        assert_ne!(cursor_id, 0);

        iter.close().await.unwrap();
        for _ in 0..200 {
            if !a.killed_cursors().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(a.killed_cursors(), vec![cursor_id]);
        assert_eq!(a.open_cursors(), 0);
        s.close();
        cluster.release();
    }

    #[tokio::test]
    async fn test_unanswered_query_times_out() {
        let net = MockNet::new();
        let cluster = replica_set(&net).await;
        let s = session(&cluster, Mode::Strong);
        s.set_socket_timeout(Duration::from_millis(100));
        net.node("a:27017").hang("shop.slow");

        let mut iter = s
            .find("shop.slow", doc! {}, FindOptions::default())
            .await
            .unwrap();
        let err = iter.next_document().await.unwrap_err();
        assert!(err.is_socket_fatal());
        s.close();
        cluster.release();
    }

    #[tokio::test]
    async fn test_upsert_retries_duplicate_key() {
        let net = MockNet::new();
        let cluster = replica_set(&net).await;
        let s = session(&cluster, Mode::Strong);
        let a = net.node("a:27017");

        a.set_dup_errors(2);
        let result = s
            .upsert("shop.items", doc! { "k": 1 }, doc! { "$set": { "v": 1 } })
            .await
            .unwrap();
        assert_eq!(result.n, 1);
        assert_eq!(a.updates(), 3);

        a.set_dup_errors(MAX_UPSERT_ATTEMPTS);
        let err = s
            .upsert("shop.items", doc! { "k": 1 }, doc! { "$set": { "v": 2 } })
            .await
            .unwrap_err();
        assert!(err.is_dup());
        assert_eq!(a.updates(), 3 + MAX_UPSERT_ATTEMPTS);
        s.close();
        cluster.release();
    }

    #[tokio::test]
    async fn test_unacknowledged_write_sends_no_gle() {
        let net = MockNet::new();
        let cluster = replica_set(&net).await;
        let s = session(&cluster, Mode::Strong);
        s.set_safe(None);

        let result = s.remove("shop.items", doc! { "k": 1 }, false).await.unwrap();
        assert_eq!(result, WriteResult::default());
        s.ping().await.unwrap();
        let a = net.node("a:27017");
        assert_eq!(a.removes(), 1);
        assert_eq!(a.command_count("getlasterror"), 0);
        s.close();
        cluster.release();
    }

    #[tokio::test]
    async fn test_mongos_read_preference_embedding() {
        let net = MockNet::new();
        net.add_node("m:27017").set_ismaster(mongos_doc());
        let cluster = Cluster::new(
            test_cluster_config(&net, &["m:27017"]),
            Arc::new(Stats::new()),
        );
        let tags: Vec<TagSet> = vec![[("dc".to_string(), "east".to_string())].into()];
        let config = SessionConfig::builder()
            .with_mode(Mode::Nearest)
            .with_tags(tags)
            .with_sync_timeout(Duration::from_secs(5))
            .build();
        let s = Session::new(Arc::clone(&cluster), None, config);

        s.find_one("shop.items", doc! { "a": 1 }).await.unwrap();
        let (flags, ns, query) = net.node("m:27017").last_query().unwrap();
        assert_eq!(ns, "shop.items");
        assert_ne!(flags & query_flags::SLAVE_OK, 0);
        assert_eq!(
            query,
            doc! {
                "$query": { "a": 1 },
                "$readPreference": { "mode": "nearest", "tags": [{ "dc": "east" }] },
            }
        );
        s.close();
        cluster.release();
    }

    #[tokio::test]
    async fn test_closed_session_rejects_operations() {
        let net = MockNet::new();
        let cluster = replica_set(&net).await;
        let s = session(&cluster, Mode::Strong);
        s.close();
        assert!(matches!(s.ping().await, Err(DriverError::Closed(_))));
        cluster.release();
    }
}
