//! 서버 테이블
//!
//! 해석된 주소 순으로 정렬된 서버 집합.

use std::net::SocketAddr;
use std::sync::Arc;

use super::super::server::{Server, TagSet};
use super::policy::{best_fit, Mode};

/// 정렬된 서버 집합
#[derive(Debug, Clone, Default)]
pub struct ServerTable {
    servers: Vec<Arc<Server>>,
}

impl ServerTable {
    /// 빈 테이블
    pub fn new() -> Self {
        Self::default()
    }

    /// 서버 수
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// 비었는지 여부
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// 서버 목록
    pub fn servers(&self) -> &[Arc<Server>] {
        &self.servers
    }

    /// 해석된 주소로 검색
    pub fn search(&self, resolved: &SocketAddr) -> Option<Arc<Server>> {
        self.servers
            .binary_search_by_key(resolved, |s| s.resolved_addr())
            .ok()
            .map(|i| Arc::clone(&self.servers[i]))
    }

    /// 추가 (이미 있으면 false)
    pub fn add(&mut self, server: Arc<Server>) -> bool {
        match self
            .servers
            .binary_search_by_key(&server.resolved_addr(), |s| s.resolved_addr())
        {
            Ok(_) => false,
            Err(pos) => {
                self.servers.insert(pos, server);
                true
            }
        }
    }

    /// 제거 (없었으면 false)
    pub fn remove(&mut self, server: &Server) -> bool {
        match self
            .servers
            .binary_search_by_key(&server.resolved_addr(), |s| s.resolved_addr())
        {
            Ok(pos) => {
                self.servers.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    /// 라우터가 있는지 여부
    pub fn has_mongos(&self) -> bool {
        self.servers.iter().any(|s| s.info().mongos)
    }

    /// 사용자 주소 목록
    pub fn addrs(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.addr().to_string()).collect()
    }

    /// 모드와 태그에 맞는 서버
    pub fn best_fit(&self, mode: Mode, tags: &[TagSet]) -> Option<Arc<Server>> {
        best_fit(&self.servers, mode, tags)
    }

    /// 모두 꺼냄
    pub fn drain(&mut self) -> Vec<Arc<Server>> {
        std::mem::take(&mut self.servers)
    }
}
