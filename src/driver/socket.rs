//! 소켓 멀티플렉서
//!
//! 물리 연결 하나를 여러 논리 요청이 공유합니다. 요청 ID로 응답을 호출자에게
//! 되돌려 주며, 소켓마다 전용 읽기 태스크가 하나씩 돕니다.
//!
//! # 상태
//!
//! `Fresh → InUse → Idle → {InUse | Dead}`. `Dead`는 종착 상태로, I/O 또는
//! 프로토콜 에러가 나면 대기 중인 모든 콜백이 같은 에러를 정확히 한 번
//! 받습니다.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bson::{doc, Document};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{Encoder, FramedRead};

use super::auth::{Authenticator, Credential};
use super::command::{check_command, query_failure};
use super::error::{DriverError, DriverResult};
use super::net::BoxedStream;
use super::server::{Server, ServerInfo};
use super::stats::Stats;
use crate::wire::{
    document, query_flags, reply_flags, Frame, OpCode, QueryOp, Reply, ReplyHeader, Request,
    RequestFrame, WireCodec,
};

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Reply events
// ============================================================================

/// 응답 이벤트
///
/// 문서마다 `Document`가 한 번씩, 마지막에 `End`가 한 번 전달됩니다.
/// 에러는 그 요청의 마지막 이벤트입니다.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyEvent {
    /// 응답 문서 하나
    Document {
        header: ReplyHeader,
        index: usize,
        document: Bytes,
    },
    /// 배치 끝
    End { header: ReplyHeader },
}

/// 응답 콜백
pub type ReplyCallback = Box<dyn FnMut(DriverResult<ReplyEvent>) + Send + 'static>;

/// 전송 단위
pub struct Op {
    /// 요청
    pub request: Request,
    /// 응답 콜백 (응답 없는 요청은 None)
    pub reply: Option<ReplyCallback>,
}

impl Op {
    /// 응답을 기다리지 않는 op
    pub fn new(request: Request) -> Self {
        Self {
            request,
            reply: None,
        }
    }

    /// 응답 콜백이 있는 op
    pub fn with_reply(request: Request, reply: ReplyCallback) -> Self {
        Self {
            request,
            reply: Some(reply),
        }
    }
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Op")
            .field("op_code", &self.request.op_code())
            .field("has_reply", &self.reply.is_some())
            .finish()
    }
}

/// 소켓 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// 생성 직후
    Fresh,
    /// 사용 중 (참조 > 0)
    InUse,
    /// 풀에서 대기 (참조 == 0)
    Idle,
    /// 종료됨
    Dead,
}

/// 다음 요청 ID (0은 건너뜀)
pub fn next_request_id(current: u32) -> u32 {
    match current.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

// ============================================================================
// Socket
// ============================================================================

struct SocketInner {
    last_request_id: u32,
    pending: HashMap<u32, ReplyCallback>,
    dead: Option<DriverError>,
    references: usize,
    acquired_once: bool,
    server_info: ServerInfo,
    counted_master: bool,
    timeout: Duration,
    deadline: Option<Instant>,
    creds: Vec<Credential>,
    logout: Vec<Credential>,
}

impl SocketInner {
    fn refresh_deadline(&mut self) {
        self.deadline = if self.pending.is_empty() || self.timeout.is_zero() {
            None
        } else {
            Some(Instant::now() + self.timeout)
        };
    }
}

/// 멀티플렉스 소켓
pub struct Socket {
    id: u64,
    addr: String,
    server: Weak<Server>,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedStream>>>,
    inner: Mutex<SocketInner>,
    deadline_changed: Notify,
    reader: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<Stats>,
}

impl Socket {
    /// 스트림 위에 소켓을 만들고 읽기 태스크 시작
    ///
    /// Tokio 런타임 안에서 호출해야 합니다.
    pub fn spawn(
        stream: BoxedStream,
        addr: impl Into<String>,
        server: Weak<Server>,
        server_info: ServerInfo,
        timeout: Duration,
        stats: Arc<Stats>,
    ) -> Arc<Self> {
        let (read_half, write_half) = tokio::io::split(stream);
        let max_message_size = server_info.max_message_size;
        stats.sockets_alive(1);
        stats.conn(1, server_info.master);

        let socket = Arc::new(Self {
            id: NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed),
            addr: addr.into(),
            server,
            writer: tokio::sync::Mutex::new(Some(write_half)),
            inner: Mutex::new(SocketInner {
                last_request_id: 0,
                pending: HashMap::new(),
                dead: None,
                references: 0,
                acquired_once: false,
                counted_master: server_info.master,
                server_info,
                timeout,
                deadline: None,
                creds: Vec::new(),
                logout: Vec::new(),
            }),
            deadline_changed: Notify::new(),
            reader: Mutex::new(None),
            stats,
        });

        let frames = FramedRead::new(read_half, WireCodec::with_max_size(max_message_size));
        let handle = tokio::spawn(read_loop(Arc::clone(&socket), frames));
        *socket.reader.lock() = Some(handle);
        tracing::debug!("Socket {} to {}: initialized", socket.id, socket.addr);
        socket
    }

    /// 소켓 ID
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 서버 주소
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// 소유 서버 (퇴출되었으면 None)
    pub fn server(&self) -> Option<Arc<Server>> {
        self.server.upgrade()
    }

    /// 획득 시점의 서버 정보
    pub fn server_info(&self) -> ServerInfo {
        self.inner.lock().server_info.clone()
    }

    /// 현재 상태
    pub fn state(&self) -> SocketState {
        let inner = self.inner.lock();
        if inner.dead.is_some() {
            SocketState::Dead
        } else if inner.references > 0 {
            SocketState::InUse
        } else if inner.acquired_once {
            SocketState::Idle
        } else {
            SocketState::Fresh
        }
    }

    /// 종료 에러
    pub fn dead_error(&self) -> Option<DriverError> {
        self.inner.lock().dead.clone()
    }

    /// 참조 수
    pub fn references(&self) -> usize {
        self.inner.lock().references
    }

    /// 대기 중인 응답 수
    pub fn pending_replies(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// 소켓 타임아웃
    pub fn timeout(&self) -> Duration {
        self.inner.lock().timeout
    }

    /// 소켓 타임아웃 설정 (0이면 무제한)
    pub fn set_timeout(&self, timeout: Duration) {
        let mut inner = self.inner.lock();
        inner.timeout = timeout;
        inner.refresh_deadline();
        drop(inner);
        self.deadline_changed.notify_one();
    }

    // ------------------------------------------------------------------------
    // 참조 카운팅
    // ------------------------------------------------------------------------

    /// 풀에서 꺼낼 때의 첫 획득
    pub(crate) fn initial_acquire(&self, info: ServerInfo, timeout: Duration) -> DriverResult<()> {
        let mut inner = self.inner.lock();
        if let Some(err) = &inner.dead {
            return Err(err.clone());
        }
        inner.references += 1;
        inner.acquired_once = true;
        let recount = inner.counted_master != info.master;
        if recount {
            // 연결 수는 확정된 역할 기준
            self.stats.conn(-1, inner.counted_master);
            self.stats.conn(1, info.master);
            inner.counted_master = info.master;
        }
        inner.server_info = info;
        inner.timeout = timeout;
        drop(inner);
        self.stats.socket_refs(1);
        self.stats.sockets_in_use(1);
        Ok(())
    }

    /// 참조 추가
    pub fn acquire(&self) -> ServerInfo {
        let mut inner = self.inner.lock();
        inner.references += 1;
        inner.acquired_once = true;
        let first = inner.references == 1;
        let info = inner.server_info.clone();
        drop(inner);
        self.stats.socket_refs(1);
        if first {
            self.stats.sockets_in_use(1);
        }
        info
    }

    /// 참조 해제
    ///
    /// 0이 되면 모든 자격 증명을 로그아웃 대기로 옮기고 서버 풀로 돌려줍니다.
    /// 서버가 이미 퇴출되었으면 소켓을 닫습니다.
    pub fn release(&self) {
        let idle = {
            let mut inner = self.inner.lock();
            if inner.references == 0 {
                tracing::warn!("Socket {} to {}: released more than acquired", self.id, self.addr);
                return;
            }
            inner.references -= 1;
            self.stats.socket_refs(-1);
            inner.references == 0
        };
        if !idle {
            return;
        }

        self.stats.sockets_in_use(-1);
        self.logout_all();
        match self.server.upgrade() {
            Some(server) => server.recycle_socket(self.id),
            None => self.close(),
        }
    }

    // ------------------------------------------------------------------------
    // 전송
    // ------------------------------------------------------------------------

    /// op 묶음을 한 번의 쓰기로 전송
    ///
    /// 보내기 잠금 안에서 ID를 배정하고 콜백을 등록한 뒤 프레임을 씁니다.
    /// 대기 중인 로그아웃은 묶음 앞에 붙고, 묶음 전체가 인코딩된 뒤에만
    /// 대기 목록에서 빠집니다.
    pub async fn query(&self, ops: Vec<Op>) -> DriverResult<()> {
        let mut writer = self.writer.lock().await;

        let (buf, timeout, count) = {
            let mut inner = self.inner.lock();
            if let Some(err) = &inner.dead {
                return Err(err.clone());
            }

            let mut batch = logout_ops(&inner.logout)?;
            batch.extend(ops);

            let mut codec = WireCodec::with_max_size(inner.server_info.max_message_size);
            let mut buf = BytesMut::with_capacity(256);
            let mut replies = Vec::new();
            let mut last_id = inner.last_request_id;
            let count = batch.len();
            for op in batch {
                let id = next_request_id(last_id);
                last_id = id;
                codec.encode(
                    RequestFrame {
                        request_id: id as i32,
                        request: op.request,
                    },
                    &mut buf,
                )?;
                if let Some(reply) = op.reply {
                    replies.push((id, reply));
                }
            }

            inner.last_request_id = last_id;
            inner.logout.clear();
            if !replies.is_empty() {
                inner.pending.extend(replies);
                inner.refresh_deadline();
            }
            (buf, inner.timeout, count)
        };
        self.deadline_changed.notify_one();

        let Some(stream) = writer.as_mut() else {
            return Err(self
                .dead_error()
                .unwrap_or_else(|| DriverError::closed("socket writer closed")));
        };

        let write = async {
            stream.write_all(&buf).await?;
            stream.flush().await
        };
        let result = if timeout.is_zero() {
            write.await
        } else {
            match tokio::time::timeout(timeout, write).await {
                Ok(r) => r,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
            }
        };
        drop(writer);

        if let Err(e) = result {
            let err = DriverError::from(e);
            self.kill(err.clone(), true);
            return Err(err);
        }
        self.stats.sent_ops(count as i64);
        Ok(())
    }

    /// 단일 응답의 첫 문서
    pub async fn simple_query(&self, op: QueryOp) -> DriverResult<Bytes> {
        let (callback, reply) = first_reply();
        self.query(vec![Op::with_reply(Request::Query(op), callback)])
            .await?;
        await_first(reply).await
    }

    /// `<db>.$cmd` 명령 실행
    pub async fn run_command(
        &self,
        db: &str,
        cmd: &Document,
        slave_ok: bool,
    ) -> DriverResult<Document> {
        let mut op = QueryOp::new(format!("{}.$cmd", db), document::encode(cmd)?);
        op.limit = -1;
        if slave_ok {
            op.flags |= query_flags::SLAVE_OK;
        }
        let raw = self.simple_query(op).await?;
        check_command(document::decode(&raw)?)
    }

    // ------------------------------------------------------------------------
    // 인증
    // ------------------------------------------------------------------------

    /// 로그인 (이미 로그인했거나 로그아웃 대기 중이면 캐시 사용)
    pub async fn login(
        &self,
        credential: &Credential,
        authenticator: Option<&dyn Authenticator>,
    ) -> DriverResult<()> {
        {
            let mut inner = self.inner.lock();
            if inner.creds.contains(credential) {
                return Ok(());
            }
            if let Some(pos) = inner.logout.iter().position(|c| c == credential) {
                let cred = inner.logout.remove(pos);
                inner.creds.push(cred);
                tracing::debug!(
                    "Socket {} to {}: login: db={} user={} (cached)",
                    self.id,
                    self.addr,
                    credential.source,
                    credential.username
                );
                return Ok(());
            }
        }

        let authenticator = authenticator
            .ok_or_else(|| DriverError::authentication("no authenticator configured"))?;
        authenticator.login(self, credential).await?;
        tracing::debug!(
            "Socket {} to {}: login: db={} user={}",
            self.id,
            self.addr,
            credential.source,
            credential.username
        );

        let mut inner = self.inner.lock();
        if !inner.creds.contains(credential) {
            inner.creds.push(credential.clone());
        }
        Ok(())
    }

    /// 자격 증명 하나 로그아웃 대기로 이동
    pub fn logout(&self, credential: &Credential) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.creds.iter().position(|c| c == credential) {
            let cred = inner.creds.remove(pos);
            inner.logout.push(cred);
        }
    }

    /// 모든 자격 증명 로그아웃 대기로 이동
    pub fn logout_all(&self) {
        let mut inner = self.inner.lock();
        let creds = std::mem::take(&mut inner.creds);
        inner.logout.extend(creds);
    }

    /// 로그인된 자격 증명
    pub fn credentials(&self) -> Vec<Credential> {
        self.inner.lock().creds.clone()
    }

    // ------------------------------------------------------------------------
    // 종료
    // ------------------------------------------------------------------------

    /// 명시적으로 닫기
    pub fn close(&self) {
        self.kill(DriverError::closed("closed explicitly"), false);
    }

    /// 소켓 종료
    ///
    /// 대기 중인 콜백 전부에 같은 에러를 한 번씩 전달합니다. `abend`이면
    /// 서버에 비정상 종료를 알려 재동기화를 요청합니다.
    pub(crate) fn kill(&self, err: DriverError, abend: bool) {
        let (pending, master) = {
            let mut inner = self.inner.lock();
            if inner.dead.is_some() {
                return;
            }
            tracing::info!("Socket {} to {}: closing: {}", self.id, self.addr, err);
            inner.dead = Some(err.clone());
            inner.deadline = None;
            let mut pending: Vec<_> = inner.pending.drain().collect();
            pending.sort_by_key(|(id, _)| *id);
            (pending, inner.counted_master)
        };
        self.stats.sockets_alive(-1);
        self.stats.conn(-1, master);

        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        self.shutdown_writer();

        if !pending.is_empty() {
            tracing::debug!(
                "Socket {} to {}: notifying {} pending replies",
                self.id,
                self.addr,
                pending.len()
            );
        }
        for (_, mut callback) in pending {
            callback(Err(err.clone()));
        }

        if let Some(server) = self.server.upgrade() {
            server.forget_socket(self.id, abend);
        }
    }

    fn shutdown_writer(&self) {
        let Ok(mut guard) = self.writer.try_lock() else {
            return;
        };
        let Some(mut stream) = guard.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = stream.shutdown().await;
            });
        }
    }

    fn dispatch(&self, frame: Frame) -> DriverResult<()> {
        if frame.header.op_code != OpCode::Reply {
            return Err(DriverError::protocol(format!(
                "unexpected {} from server",
                frame.header.op_code.name()
            )));
        }
        let reply = Reply::decode_body(frame.body)?;
        let response_to = frame.header.response_to as u32;

        let callback = {
            let mut inner = self.inner.lock();
            let callback = inner.pending.remove(&response_to);
            inner.refresh_deadline();
            callback
        };
        self.deadline_changed.notify_one();
        self.stats.received_ops(1);
        self.stats.received_docs(reply.documents.len() as i64);

        let Some(mut callback) = callback else {
            tracing::debug!(
                "Socket {} to {}: dropping reply to unknown request {}",
                self.id,
                self.addr,
                response_to
            );
            return Ok(());
        };

        let header = reply.header();
        for (index, document) in reply.documents.into_iter().enumerate() {
            callback(Ok(ReplyEvent::Document {
                header,
                index,
                document,
            }));
        }
        callback(Ok(ReplyEvent::End { header }));
        Ok(())
    }

    fn deadline(&self) -> Option<Instant> {
        self.inner.lock().deadline
    }

    #[cfg(test)]
    pub(crate) fn set_last_request_id(&self, id: u32) {
        self.inner.lock().last_request_id = id;
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("state", &self.state())
            .field("references", &self.references())
            .finish()
    }
}

/// 로그아웃 대기 자격 증명마다 `logout` 명령 op
fn logout_ops(creds: &[Credential]) -> DriverResult<Vec<Op>> {
    creds
        .iter()
        .map(|cred| {
            let query = document::encode(&doc! { "logout": 1 })?;
            let mut op = QueryOp::new(format!("{}.$cmd", cred.source), query);
            op.limit = -1;
            Ok(Op::with_reply(Request::Query(op), Box::new(|_| {})))
        })
        .collect()
}

/// 첫 문서를 전달하는 콜백과 그 수신 측
pub(crate) fn first_reply() -> (ReplyCallback, oneshot::Receiver<DriverResult<Bytes>>) {
    let (tx, rx) = oneshot::channel();
    let mut tx = Some(tx);
    let mut first: Option<Bytes> = None;

    let callback: ReplyCallback = Box::new(move |event| match event {
        Ok(ReplyEvent::Document {
            index: 0, document, ..
        }) => first = Some(document),
        Ok(ReplyEvent::Document { .. }) => {}
        Ok(ReplyEvent::End { header }) => {
            if let Some(tx) = tx.take() {
                let _ = tx.send(first_document(header, first.take()));
            }
        }
        Err(e) => {
            if let Some(tx) = tx.take() {
                let _ = tx.send(Err(e));
            }
        }
    });
    (callback, rx)
}

/// [`first_reply`] 결과 대기
pub(crate) async fn await_first(
    reply: oneshot::Receiver<DriverResult<Bytes>>,
) -> DriverResult<Bytes> {
    reply
        .await
        .map_err(|_| DriverError::connection("reply dropped before completion"))?
}

fn first_document(header: ReplyHeader, first: Option<Bytes>) -> DriverResult<Bytes> {
    let document = first.ok_or(DriverError::NotFound)?;
    if header.flags & reply_flags::QUERY_FAILURE != 0 {
        return Err(query_failure(&document::decode(&document)?));
    }
    Ok(document)
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn read_loop(socket: Arc<Socket>, mut frames: FramedRead<ReadHalf<BoxedStream>, WireCodec>) {
    loop {
        let deadline = socket.deadline();
        let next = tokio::select! {
            frame = frames.next() => frame,
            _ = socket.deadline_changed.notified() => continue,
            _ = sleep_until_opt(deadline) => {
                socket.kill(DriverError::timeout(format!("i/o timeout reading from {}", socket.addr)), true);
                return;
            }
        };

        let result = match next {
            Some(Ok(frame)) => socket.dispatch(frame),
            Some(Err(e)) => Err(e.into()),
            None => Err(DriverError::connection(format!(
                "connection to {} closed by peer",
                socket.addr
            ))),
        };
        if let Err(err) = result {
            socket.kill(err, true);
            return;
        }
    }
}

// ============================================================================
// SocketGuard - 참조 가드
// ============================================================================

/// 획득한 소켓 참조
///
/// 드롭되면 참조를 해제합니다.
pub struct SocketGuard {
    socket: Arc<Socket>,
}

impl SocketGuard {
    /// 이미 참조가 잡힌 소켓을 감쌈
    pub(crate) fn new(socket: Arc<Socket>) -> Self {
        Self { socket }
    }

    /// 소켓
    pub fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }
}

impl Deref for SocketGuard {
    type Target = Socket;

    fn deref(&self) -> &Socket {
        &self.socket
    }
}

impl Clone for SocketGuard {
    fn clone(&self) -> Self {
        self.socket.acquire();
        Self::new(Arc::clone(&self.socket))
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        self.socket.release();
    }
}

impl fmt::Debug for SocketGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.socket.fmt(f)
    }
}

// ============================================================================
// Tests
// ============================================================================
