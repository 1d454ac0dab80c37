//! 커서
//!
//! 쿼리 결과를 배치 단위로 받아 링 버퍼에 쌓아 두고 하나씩 꺼냅니다.
//! 버퍼에 남은 문서가 `prefetch × 배치 크기` 아래로 내려가면 다음 배치를
//! 미리 요청합니다.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bson::Document;
use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::command::query_failure;
use super::error::{DriverError, DriverResult};
use super::queue::Queue;
use super::server::Server;
use super::session::SessionCore;
use super::socket::{Op, ReplyCallback, ReplyEvent, SocketGuard};
use crate::wire::{document, reply_flags, GetMoreOp, KillCursorsOp, Request};

/// 기본 prefetch 비율
pub const DEFAULT_PREFETCH: f64 = 0.25;

// ============================================================================
// 공유 상태
// ============================================================================

struct IterState {
    docs: Queue<Bytes>,
    err: Option<DriverError>,
    cursor_id: i64,
    in_flight: usize,
    docs_before_more: i64,
    prefetch: f64,
    /// 남은 문서 한도 (0이면 무제한)
    limit: i32,
    done: bool,
    get_mores: u64,
}

impl IterState {
    /// 버퍼를 비우고 열린 커서 ID를 넘김
    fn discard(&mut self) -> i64 {
        self.docs.clear();
        self.done = true;
        std::mem::replace(&mut self.cursor_id, 0)
    }

    fn on_reply(&mut self, event: DriverResult<ReplyEvent>) {
        match event {
            Err(e) => {
                self.in_flight = self.in_flight.saturating_sub(1);
                self.err.get_or_insert(e);
            }
            Ok(ReplyEvent::Document {
                header,
                index,
                document,
            }) => {
                if header.flags & reply_flags::QUERY_FAILURE != 0 {
                    if self.err.is_none() {
                        self.err = Some(match document::decode(&document) {
                            Ok(doc) => query_failure(&doc),
                            Err(e) => e.into(),
                        });
                    }
                    return;
                }
                if index == 0 {
                    self.cursor_id = header.cursor_id;
                    let returned = i64::from(header.number_returned);
                    let to_process = self.docs.len() as i64 + returned;
                    self.docs_before_more = if self.limit == 0 || to_process < i64::from(self.limit) {
                        to_process - (self.prefetch * returned as f64) as i64
                    } else {
                        -1
                    };
                }
                self.docs.push(document);
            }
            Ok(ReplyEvent::End { header }) => {
                self.in_flight = self.in_flight.saturating_sub(1);
                if header.flags & reply_flags::QUERY_FAILURE != 0 {
                    self.cursor_id = 0;
                    return;
                }
                self.cursor_id = header.cursor_id;
                if header.number_returned == 0
                    && header.cursor_id == 0
                    && header.flags & reply_flags::CURSOR_NOT_FOUND != 0
                {
                    self.err.get_or_insert(DriverError::CursorNotFound);
                }
            }
        }
    }
}

struct IterShared {
    state: Mutex<IterState>,
    notify: Notify,
}

fn reply_callback(shared: &Arc<IterShared>) -> ReplyCallback {
    let shared = Arc::clone(shared);
    Box::new(move |event| {
        shared.state.lock().on_reply(event);
        shared.notify.notify_one();
    })
}

enum Step {
    Yield { doc: Bytes, more: bool, finished: bool },
    Fail(DriverError),
    Exhausted,
    Fetch,
    Wait,
}

// ============================================================================
// Iter
// ============================================================================

/// 쿼리 결과 커서
///
/// 커서 ID가 0이고 버퍼가 비면 끝납니다. 열린 채로 드롭되면 백그라운드에서
/// 서버 측 커서를 닫습니다.
pub struct Iter {
    shared: Arc<IterShared>,
    session: Arc<SessionCore>,
    server: Option<Arc<Server>>,
    collection: String,
    batch_size: i32,
    tail_timeout: Option<Duration>,
    timed_out: bool,
}

impl Iter {
    /// 첫 쿼리 응답을 기다리는 커서
    pub(crate) fn new(
        session: Arc<SessionCore>,
        server: Option<Arc<Server>>,
        collection: impl Into<String>,
        batch_size: i32,
        prefetch: f64,
        limit: i32,
        tail_timeout: Option<Duration>,
    ) -> Self {
        Self {
            shared: Arc::new(IterShared {
                state: Mutex::new(IterState {
                    docs: Queue::new(),
                    err: None,
                    cursor_id: 0,
                    in_flight: 1,
                    docs_before_more: -1,
                    prefetch,
                    limit: limit.max(0),
                    done: false,
                    get_mores: 0,
                }),
                notify: Notify::new(),
            }),
            session,
            server,
            collection: collection.into(),
            batch_size,
            tail_timeout,
            timed_out: false,
        }
    }

    /// 응답 콜백
    pub(crate) fn callback(&self) -> ReplyCallback {
        reply_callback(&self.shared)
    }

    /// 서버 측 커서 ID (0이면 닫힘)
    pub fn cursor_id(&self) -> i64 {
        self.shared.state.lock().cursor_id
    }

    /// 버퍼에 쌓인 문서 수
    pub fn buffered(&self) -> usize {
        self.shared.state.lock().docs.len()
    }

    /// 응답을 기다리는 배치 수
    pub fn batches_in_flight(&self) -> usize {
        self.shared.state.lock().in_flight
    }

    /// 보낸 getMore 수
    pub fn get_mores(&self) -> u64 {
        self.shared.state.lock().get_mores
    }

    /// 마지막 호출이 tail 타임아웃으로 끝났는지 여부
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// 저장된 에러
    pub fn err(&self) -> Option<DriverError> {
        self.shared.state.lock().err.clone()
    }

    /// 다음 원시 문서
    pub async fn next_raw(&mut self) -> DriverResult<Option<Bytes>> {
        self.timed_out = false;
        let mut tail_deadline: Option<Instant> = None;

        loop {
            let step = {
                let mut st = self.shared.state.lock();
                if let Some(doc) = st.docs.pop() {
                    let mut finished = false;
                    if st.limit > 0 {
                        st.limit -= 1;
                        if st.limit == 0 {
                            st.done = true;
                            finished = true;
                        }
                    }
                    let mut more = false;
                    if st.cursor_id != 0 && st.err.is_none() && !finished {
                        st.docs_before_more -= 1;
                        if st.docs_before_more == -1 && st.in_flight == 0 {
                            st.in_flight += 1;
                            more = true;
                        }
                    }
                    Step::Yield {
                        doc,
                        more,
                        finished,
                    }
                } else if let Some(err) = st.err.clone() {
                    Step::Fail(err)
                } else if st.done || (st.cursor_id == 0 && st.in_flight == 0) {
                    Step::Exhausted
                } else if st.in_flight == 0 {
                    Step::Fetch
                } else {
                    Step::Wait
                }
            };

            match step {
                Step::Yield {
                    doc,
                    more,
                    finished,
                } => {
                    if more {
                        self.get_more().await;
                    }
                    if finished {
                        if let Err(e) = self.kill_cursor().await {
                            tracing::debug!("Failed to kill cursor after limit: {}", e);
                        }
                    }
                    return Ok(Some(doc));
                }
                Step::Fail(err) => return Err(err),
                Step::Exhausted => return Ok(None),
                Step::Fetch => {
                    if let Some(timeout) = self.tail_timeout {
                        let at = *tail_deadline.get_or_insert_with(|| Instant::now() + timeout);
                        if Instant::now() >= at {
                            self.timed_out = true;
                            return Ok(None);
                        }
                    }
                    self.shared.state.lock().in_flight += 1;
                    self.get_more().await;
                }
                Step::Wait => self.shared.notify.notified().await,
            }
        }
    }

    /// 다음 문서
    pub async fn next_document(&mut self) -> DriverResult<Option<Document>> {
        match self.next_raw().await? {
            Some(raw) => Ok(Some(document::decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// 다음 문서를 타입으로 디코딩
    pub async fn next<T: DeserializeOwned>(&mut self) -> DriverResult<Option<T>> {
        match self.next_raw().await? {
            Some(raw) => Ok(Some(bson::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// 남은 문서 전부
    pub async fn all<T: DeserializeOwned>(&mut self) -> DriverResult<Vec<T>> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await? {
            out.push(item);
        }
        Ok(out)
    }

    /// 문서 스트림 (에러 뒤에는 끝남)
    pub fn into_stream(self) -> impl Stream<Item = DriverResult<Document>> + Send {
        futures::stream::unfold(Some(self), |state| async move {
            let mut iter = state?;
            match iter.next_document().await {
                Ok(Some(doc)) => Some((Ok(doc), Some(iter))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    /// 커서 닫기
    ///
    /// 서버 측 커서가 열려 있으면 killCursors를 보냅니다.
    pub async fn close(mut self) -> DriverResult<()> {
        self.kill_cursor().await?;
        match self.err() {
            Some(DriverError::CursorNotFound) | None => Ok(()),
            Some(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------------
    // 내부
    // ------------------------------------------------------------------------

    /// getMore 전송 (호출 전에 in_flight를 올려 둠)
    async fn get_more(&mut self) {
        let result = self.send_get_more().await;
        if let Err(e) = result {
            let mut st = self.shared.state.lock();
            // 소켓이 죽으며 콜백이 이미 에러를 받았으면 건드리지 않음
            if st.err.is_none() {
                st.in_flight = st.in_flight.saturating_sub(1);
                st.err = Some(e);
            }
        }
    }

    async fn send_get_more(&self) -> DriverResult<()> {
        let socket = self.acquire_socket().await?;
        let (op, count) = {
            let mut st = self.shared.state.lock();
            let mut limit = self.batch_size;
            if st.limit > 0 {
                let remaining = st.limit - st.docs.len() as i32;
                if limit <= 0 || remaining < limit {
                    limit = remaining;
                }
            }
            st.get_mores += 1;
            (
                GetMoreOp {
                    collection: self.collection.clone(),
                    limit,
                    cursor_id: st.cursor_id,
                },
                st.get_mores,
            )
        };
        tracing::trace!(
            "Iter on {}: getMore #{} for cursor {}",
            self.collection,
            count,
            op.cursor_id
        );
        socket
            .query(vec![Op::with_reply(Request::GetMore(op), self.callback())])
            .await
    }

    /// 커서가 열린 서버의 소켓
    async fn acquire_socket(&self) -> DriverResult<SocketGuard> {
        acquire_cursor_socket(&self.session, self.server.as_ref()).await
    }

    async fn kill_cursor(&mut self) -> DriverResult<()> {
        let cursor_id = self.shared.state.lock().discard();
        if cursor_id == 0 {
            return Ok(());
        }
        let socket = self.acquire_socket().await?;
        socket
            .query(vec![Op::new(Request::KillCursors(KillCursorsOp {
                cursor_ids: vec![cursor_id],
            }))])
            .await
    }
}

async fn acquire_cursor_socket(
    session: &SessionCore,
    server: Option<&Arc<Server>>,
) -> DriverResult<SocketGuard> {
    let socket = session.acquire_socket(true).await?;
    let Some(server) = server else {
        return Ok(socket);
    };
    if socket
        .server()
        .map(|s| Arc::ptr_eq(&s, server))
        .unwrap_or(false)
    {
        return Ok(socket);
    }
    drop(socket);

    let (socket, _) = server
        .acquire_socket(0, session.socket_timeout())
        .await?;
    session.login_socket(&socket).await?;
    Ok(socket)
}

impl Drop for Iter {
    fn drop(&mut self) {
        let cursor_id = self.shared.state.lock().discard();
        if cursor_id == 0 {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let session = Arc::clone(&self.session);
        let server = self.server.clone();
        handle.spawn(async move {
            let killed = async {
                let socket = acquire_cursor_socket(&session, server.as_ref()).await?;
                socket
                    .query(vec![Op::new(Request::KillCursors(KillCursorsOp {
                        cursor_ids: vec![cursor_id],
                    }))])
                    .await
            };
            if let Err(e) = killed.await {
                tracing::debug!("Failed to kill cursor {} on drop: {}", cursor_id, e);
            }
        });
    }
}

impl fmt::Debug for Iter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.shared.state.lock();
        f.debug_struct("Iter")
            .field("collection", &self.collection)
            .field("cursor_id", &st.cursor_id)
            .field("buffered", &st.docs.len())
            .field("in_flight", &st.in_flight)
            .finish()
    }
}
