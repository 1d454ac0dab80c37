//! 드라이버 통계
//!
//! 클러스터가 소유하고 서버와 소켓에 공유되는 원자 카운터.

use std::sync::atomic::{AtomicI64, Ordering};

/// 원자 카운터 모음
#[derive(Debug, Default)]
pub struct Stats {
    clusters: AtomicI64,
    master_conns: AtomicI64,
    slave_conns: AtomicI64,
    sent_ops: AtomicI64,
    received_ops: AtomicI64,
    received_docs: AtomicI64,
    sockets_alive: AtomicI64,
    sockets_in_use: AtomicI64,
    socket_refs: AtomicI64,
}

impl Stats {
    /// 새 통계
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn cluster(&self, delta: i64) {
        self.clusters.fetch_add(delta, Ordering::Relaxed);
    }

    pub(crate) fn conn(&self, delta: i64, master: bool) {
        if master {
            self.master_conns.fetch_add(delta, Ordering::Relaxed);
        } else {
            self.slave_conns.fetch_add(delta, Ordering::Relaxed);
        }
    }

    pub(crate) fn sent_ops(&self, delta: i64) {
        self.sent_ops.fetch_add(delta, Ordering::Relaxed);
    }

    pub(crate) fn received_ops(&self, delta: i64) {
        self.received_ops.fetch_add(delta, Ordering::Relaxed);
    }

    pub(crate) fn received_docs(&self, delta: i64) {
        self.received_docs.fetch_add(delta, Ordering::Relaxed);
    }

    pub(crate) fn sockets_alive(&self, delta: i64) {
        self.sockets_alive.fetch_add(delta, Ordering::Relaxed);
    }

    pub(crate) fn sockets_in_use(&self, delta: i64) {
        self.sockets_in_use.fetch_add(delta, Ordering::Relaxed);
    }

    pub(crate) fn socket_refs(&self, delta: i64) {
        self.socket_refs.fetch_add(delta, Ordering::Relaxed);
    }

    /// 현재 값 스냅샷
    pub fn snapshot(&self) -> DriverMetrics {
        DriverMetrics {
            clusters: self.clusters.load(Ordering::Relaxed),
            master_conns: self.master_conns.load(Ordering::Relaxed),
            slave_conns: self.slave_conns.load(Ordering::Relaxed),
            sent_ops: self.sent_ops.load(Ordering::Relaxed),
            received_ops: self.received_ops.load(Ordering::Relaxed),
            received_docs: self.received_docs.load(Ordering::Relaxed),
            sockets_alive: self.sockets_alive.load(Ordering::Relaxed),
            sockets_in_use: self.sockets_in_use.load(Ordering::Relaxed),
            socket_refs: self.socket_refs.load(Ordering::Relaxed),
        }
    }
}

/// 드라이버 메트릭 스냅샷
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverMetrics {
    /// 살아 있는 클러스터 수
    pub clusters: i64,
    /// 마스터 연결 수
    pub master_conns: i64,
    /// 세컨더리 연결 수
    pub slave_conns: i64,
    /// 보낸 op 수
    pub sent_ops: i64,
    /// 받은 응답 수
    pub received_ops: i64,
    /// 받은 문서 수
    pub received_docs: i64,
    /// 살아 있는 소켓 수
    pub sockets_alive: i64,
    /// 사용 중 소켓 수
    pub sockets_in_use: i64,
    /// 소켓 참조 수
    pub socket_refs: i64,
}
