//! 테스트용 가짜 네트워크
//!
//! 주소 해석과 연결을 메모리 안의 노드로 돌리고, 각 노드는 와이어
//! 프로토콜로 명령, 쿼리, 커서, 쓰기에 응답합니다.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::broadcast;
use tokio_util::codec::Framed;

use super::auth::{Authenticator, Credential};
use super::cluster::ClusterConfig;
use super::error::{DriverError, DriverResult};
use super::net::{BoxedStream, Dialer, Resolver};
use super::socket::Socket;
use crate::wire::{
    delete_flags, document, reply_flags, update_flags, Frame, Reply, ReplyFrame, Request,
    WireCodec,
};

/// 첫 배치 기본 크기
const DEFAULT_FIRST_BATCH: usize = 101;

// ============================================================================
// Helpers
// ============================================================================

/// 테스트 로그 초기화 (`RUST_LOG`로 조절)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn host_list(hosts: &[&str]) -> Vec<Bson> {
    hosts.iter().map(|h| Bson::String(h.to_string())).collect()
}

/// 프라이머리 응답 (set이 비면 단독 서버)
pub fn master_doc(set: &str, hosts: &[&str]) -> Document {
    let mut doc = doc! { "ismaster": true, "secondary": false, "maxWireVersion": 2, "ok": 1 };
    if !set.is_empty() {
        doc.insert("setName", set);
        doc.insert("hosts", host_list(hosts));
    }
    doc
}

/// 세컨더리 응답
pub fn secondary_doc(set: &str, hosts: &[&str]) -> Document {
    doc! {
        "ismaster": false,
        "secondary": true,
        "setName": set,
        "hosts": host_list(hosts),
        "maxWireVersion": 2,
        "ok": 1,
    }
}

/// 라우터 응답
pub fn mongos_doc() -> Document {
    doc! { "ismaster": true, "msg": "isdbgrid", "maxWireVersion": 2, "ok": 1 }
}

/// 프라이머리도 세컨더리도 아닌 노드 응답
pub fn other_doc() -> Document {
    doc! { "ismaster": false, "secondary": false, "ok": 1 }
}

/// 가짜 네트워크를 쓰는 빠른 클러스터 설정
pub fn test_cluster_config(net: &Arc<MockNet>, seeds: &[&str]) -> ClusterConfig {
    let mut config = ClusterConfig::new(seeds.iter().map(|s| s.to_string()).collect());
    config.dial_timeout = Duration::from_secs(1);
    config.sync_retry_delay = Duration::from_millis(10);
    config.ping_interval = Duration::ZERO;
    config.resolver = net.clone();
    config.dialer = net.clone();
    config
}

// ============================================================================
// CountingAuthenticator
// ============================================================================

/// 호출 횟수만 세는 인증기
#[derive(Debug, Default)]
pub struct CountingAuthenticator {
    calls: AtomicUsize,
}

impl CountingAuthenticator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Authenticator for CountingAuthenticator {
    async fn login(&self, _socket: &Socket, _credential: &Credential) -> DriverResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// MockNet
// ============================================================================

/// 메모리 안의 네트워크
#[derive(Default)]
pub struct MockNet {
    nodes: Mutex<HashMap<String, Arc<MockNode>>>,
}

impl MockNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 노드 추가 (이미 있으면 그 노드)
    pub fn add_node(&self, addr: &str) -> Arc<MockNode> {
        let mut nodes = self.nodes.lock();
        let next = nodes.len() as u32 + 1;
        Arc::clone(
            nodes
                .entry(addr.to_string())
                .or_insert_with(|| Arc::new(MockNode::new(addr, next))),
        )
    }

    /// 주소로 노드 조회
    pub fn node(&self, addr: &str) -> Arc<MockNode> {
        match self.nodes.lock().get(addr) {
            Some(node) => Arc::clone(node),
            None => panic!("no mock node {}", addr),
        }
    }

    fn by_resolved(&self, resolved: SocketAddr) -> Option<Arc<MockNode>> {
        self.nodes
            .lock()
            .values()
            .find(|n| n.resolved == resolved)
            .cloned()
    }
}

impl fmt::Debug for MockNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut addrs: Vec<String> = self.nodes.lock().keys().cloned().collect();
        addrs.sort();
        f.debug_struct("MockNet").field("nodes", &addrs).finish()
    }
}

#[async_trait]
impl Resolver for MockNet {
    async fn resolve(&self, addr: &str) -> DriverResult<SocketAddr> {
        self.nodes
            .lock()
            .get(addr)
            .map(|n| n.resolved)
            .ok_or_else(|| DriverError::resolution(format!("unknown host {}", addr)))
    }
}

#[async_trait]
impl Dialer for MockNet {
    async fn dial(&self, addr: SocketAddr, _timeout: Duration) -> DriverResult<BoxedStream> {
        let node = self
            .by_resolved(addr)
            .ok_or_else(|| DriverError::connection(format!("no route to {}", addr)))?;
        if !node.state.lock().up {
            return Err(DriverError::connection(format!("connection refused: {}", addr)));
        }
        let (client, server) = tokio::io::duplex(256 * 1024);
        let sever = node.sever.subscribe();
        tokio::spawn(serve(node, server, sever));
        Ok(Box::new(client))
    }
}

// ============================================================================
// MockNode
// ============================================================================

struct NodeState {
    up: bool,
    ismaster: Document,
    commands: HashMap<String, usize>,
    collections: HashMap<String, Vec<Document>>,
    cursors: HashMap<i64, (String, VecDeque<Document>)>,
    next_cursor: i64,
    last_error: Document,
    dup_errors: usize,
    hung: HashSet<String>,
    last_query: Option<(i32, String, Document)>,
    updates: usize,
    removes: usize,
    get_mores: usize,
    killed: Vec<i64>,
}

/// 가짜 서버 노드
pub struct MockNode {
    addr: String,
    resolved: SocketAddr,
    state: Mutex<NodeState>,
    sever: broadcast::Sender<()>,
}

impl MockNode {
    fn new(addr: &str, n: u32) -> Self {
        let port = addr
            .rsplit_once(':')
            .and_then(|(_, p)| p.parse().ok())
            .unwrap_or(27017);
        let ip = Ipv4Addr::new(10, 0, (n >> 8) as u8, n as u8);
        let (sever, _) = broadcast::channel(4);
        Self {
            addr: addr.to_string(),
            resolved: SocketAddr::new(IpAddr::V4(ip), port),
            state: Mutex::new(NodeState {
                up: true,
                ismaster: master_doc("", &[]),
                commands: HashMap::new(),
                collections: HashMap::new(),
                cursors: HashMap::new(),
                next_cursor: 1000,
                last_error: doc! { "ok": 1, "err": Bson::Null, "n": 0 },
                dup_errors: 0,
                hung: HashSet::new(),
                last_query: None,
                updates: 0,
                removes: 0,
                get_mores: 0,
                killed: Vec::new(),
            }),
            sever,
        }
    }

    pub fn resolved(&self) -> SocketAddr {
        self.resolved
    }

    pub fn set_ismaster(&self, doc: Document) {
        self.state.lock().ismaster = doc;
    }

    /// 새 연결 수락 여부
    pub fn set_up(&self, up: bool) {
        self.state.lock().up = up;
    }

    /// 열린 연결 전부 끊기
    pub fn sever(&self) {
        let _ = self.sever.send(());
    }

    pub fn command_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .commands
            .get(&name.to_lowercase())
            .copied()
            .unwrap_or(0)
    }

    /// 컬렉션에 문서 채우기
    pub fn insert_docs(&self, ns: &str, docs: Vec<Document>) {
        self.state
            .lock()
            .collections
            .entry(ns.to_string())
            .or_default()
            .extend(docs);
    }

    pub fn documents(&self, ns: &str) -> Vec<Document> {
        self.state
            .lock()
            .collections
            .get(ns)
            .cloned()
            .unwrap_or_default()
    }

    /// 이 컬렉션의 쿼리에 응답하지 않음
    pub fn hang(&self, ns: &str) {
        self.state.lock().hung.insert(ns.to_string());
    }

    /// 다음 n번의 갱신을 중복 키 에러로
    pub fn set_dup_errors(&self, n: usize) {
        self.state.lock().dup_errors = n;
    }

    /// 마지막 일반 쿼리 (플래그, 네임스페이스, 원본 쿼리 문서)
    pub fn last_query(&self) -> Option<(i32, String, Document)> {
        self.state.lock().last_query.clone()
    }

    pub fn updates(&self) -> usize {
        self.state.lock().updates
    }

    pub fn removes(&self) -> usize {
        self.state.lock().removes
    }

    pub fn get_mores(&self) -> usize {
        self.state.lock().get_mores
    }

    pub fn killed_cursors(&self) -> Vec<i64> {
        self.state.lock().killed.clone()
    }

    pub fn open_cursors(&self) -> usize {
        self.state.lock().cursors.len()
    }

    fn handle(&self, request: Request) -> Option<Reply> {
        let mut st = self.state.lock();
        match request {
            Request::Query(op) => {
                let query = document::decode(&op.query).unwrap_or_default();
                if op.collection.ends_with(".$cmd") {
                    return Some(command_reply(&mut st, unwrap_query(query)));
                }
                st.last_query = Some((op.flags, op.collection.clone(), query.clone()));
                if st.hung.contains(&op.collection) {
                    return None;
                }
                let filter = unwrap_query(query);
                let mut docs: VecDeque<Document> = st
                    .collections
                    .get(&op.collection)
                    .map(|all| all.iter().filter(|d| matches(d, &filter)).cloned().collect())
                    .unwrap_or_default();
                docs.drain(..(op.skip.max(0) as usize).min(docs.len()));
                let (batch, single) = match op.limit {
                    0 => (DEFAULT_FIRST_BATCH, false),
                    n if n < 0 => (n.unsigned_abs() as usize, true),
                    n => (n as usize, false),
                };
                Some(batch_reply(&mut st, &op.collection, docs, batch, single))
            }
            Request::GetMore(op) => {
                st.get_mores += 1;
                let Some((ns, docs)) = st.cursors.remove(&op.cursor_id) else {
                    return Some(Reply {
                        flags: reply_flags::CURSOR_NOT_FOUND,
                        ..Reply::default()
                    });
                };
                let batch = if op.limit > 0 { op.limit as usize } else { docs.len() };
                let mut reply = batch_reply(&mut st, &ns, docs, batch, false);
                if reply.cursor_id != 0 {
                    // 같은 커서 ID 유지
                    if let Some(rest) = st.cursors.remove(&reply.cursor_id) {
                        st.cursors.insert(op.cursor_id, rest);
                        reply.cursor_id = op.cursor_id;
                    }
                }
                Some(reply)
            }
            Request::KillCursors(op) => {
                for id in op.cursor_ids {
                    st.cursors.remove(&id);
                    st.killed.push(id);
                }
                None
            }
            Request::Insert(op) => {
                let docs: Vec<Document> = op
                    .documents
                    .iter()
                    .filter_map(|raw| document::decode(raw).ok())
                    .collect();
                let n = docs.len() as i64;
                st.collections.entry(op.collection).or_default().extend(docs);
                st.last_error = doc! { "ok": 1, "err": Bson::Null, "n": n };
                None
            }
            Request::Update(op) => {
                st.updates += 1;
                if st.dup_errors > 0 {
                    st.dup_errors -= 1;
                    st.last_error = doc! {
                        "ok": 1,
                        "err": "E11000 duplicate key error",
                        "code": 11000,
                        "n": 0,
                    };
                    return None;
                }
                let selector = document::decode(&op.selector).unwrap_or_default();
                let matched = st
                    .collections
                    .get(&op.collection)
                    .map(|all| all.iter().filter(|d| matches(d, &selector)).count())
                    .unwrap_or(0);
                let mut last = doc! { "ok": 1, "err": Bson::Null };
                if matched > 0 {
                    let n = if op.flags & update_flags::MULTI != 0 { matched } else { 1 };
                    last.insert("n", n as i64);
                    last.insert("updatedExisting", true);
                } else if op.flags & update_flags::UPSERT != 0 {
                    let id = bson::oid::ObjectId::new();
                    let mut created = selector;
                    created.insert("_id", id);
                    st.collections.entry(op.collection).or_default().push(created);
                    last.insert("n", 1_i64);
                    last.insert("updatedExisting", false);
                    last.insert("upserted", id);
                } else {
                    last.insert("n", 0_i64);
                }
                st.last_error = last;
                None
            }
            Request::Delete(op) => {
                st.removes += 1;
                let selector = document::decode(&op.selector).unwrap_or_default();
                let single = op.flags & delete_flags::SINGLE_REMOVE != 0;
                let mut n = 0_i64;
                if let Some(all) = st.collections.get_mut(&op.collection) {
                    all.retain(|d| {
                        if (single && n > 0) || !matches(d, &selector) {
                            return true;
                        }
                        n += 1;
                        false
                    });
                }
                st.last_error = doc! { "ok": 1, "err": Bson::Null, "n": n };
                None
            }
        }
    }
}

impl fmt::Debug for MockNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockNode")
            .field("addr", &self.addr)
            .field("resolved", &self.resolved)
            .finish()
    }
}

fn unwrap_query(query: Document) -> Document {
    match query.get_document("$query") {
        Ok(inner) => inner.clone(),
        Err(_) => query,
    }
}

fn matches(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(k, v)| doc.get(k) == Some(v))
}

fn command_reply(st: &mut NodeState, cmd: Document) -> Reply {
    let name = cmd
        .keys()
        .next()
        .map(|k| k.to_lowercase())
        .unwrap_or_default();
    *st.commands.entry(name.clone()).or_default() += 1;
    let reply = match name.as_str() {
        "ismaster" => st.ismaster.clone(),
        "ping" | "logout" => doc! { "ok": 1 },
        "getlasterror" => st.last_error.clone(),
        _ => doc! { "ok": 0, "errmsg": format!("no such cmd: {}", name), "code": 59 },
    };
    encode_reply(vec![reply], 0)
}

fn batch_reply(
    st: &mut NodeState,
    ns: &str,
    mut docs: VecDeque<Document>,
    batch: usize,
    single: bool,
) -> Reply {
    let take = batch.min(docs.len());
    let out: Vec<Document> = docs.drain(..take).collect();
    let mut cursor_id = 0;
    if !single && !docs.is_empty() {
        st.next_cursor += 1;
        cursor_id = st.next_cursor;
        st.cursors.insert(cursor_id, (ns.to_string(), docs));
    }
    encode_reply(out, cursor_id)
}

fn encode_reply(docs: Vec<Document>, cursor_id: i64) -> Reply {
    let documents = docs
        .iter()
        .filter_map(|d| document::encode(d).ok())
        .collect();
    let mut reply = Reply::with_documents(documents);
    reply.cursor_id = cursor_id;
    reply
}

async fn serve(node: Arc<MockNode>, stream: DuplexStream, mut sever: broadcast::Receiver<()>) {
    let mut framed = Framed::new(stream, WireCodec::new());
    let mut next_id = 0;
    loop {
        let frame: Frame = tokio::select! {
            _ = sever.recv() => return,
            frame = framed.next() => match frame {
                Some(Ok(frame)) => frame,
                _ => return,
            },
        };
        let Ok(request) = Request::decode_body(frame.header.op_code, frame.body) else {
            return;
        };
        let Some(reply) = node.handle(request) else {
            continue;
        };
        next_id += 1;
        let sent = framed
            .send(ReplyFrame {
                request_id: next_id,
                response_to: frame.header.request_id,
                reply,
            })
            .await;
        if sent.is_err() {
            return;
        }
    }
}
