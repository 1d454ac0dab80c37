//! 동기화 패스
//!
//! 알려진 주소를 모두 동시에 프로브하고, 프라이머리가 알려 준 호스트를
//! 따라가며, 결과를 토폴로지에 반영합니다.
//!
//! 프라이머리가 아닌 노드는 프라이머리의 호스트 목록에서 확인되어야 바로
//! 추가됩니다. 확인되지 않은 노드는 패스가 끝날 때 처리합니다: 완전한
//! 패스에서는 퇴출하고, 부분 패스에서는 이미 알려진 노드만 갱신합니다.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinSet;

use super::super::command::IsMasterResult;
use super::super::error::{DriverError, DriverResult};
use super::super::server::{Server, ServerInfo};
use super::monitor::Cluster;

/// 패스 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncKind {
    /// 프라이머리와 통신한 패스
    Complete,
    /// 프라이머리에 닿지 못한 패스
    Partial,
}

#[derive(Default)]
struct PassState {
    not_yet_added: HashMap<SocketAddr, (Arc<Server>, ServerInfo)>,
    add_if_found: HashSet<SocketAddr>,
    seen: HashSet<SocketAddr>,
    complete: bool,
}

#[derive(Default)]
struct Probed {
    hosts: Vec<String>,
    by_master: bool,
}

impl Cluster {
    /// 동기화 패스 한 번
    pub(crate) async fn sync_pass(self: &Arc<Self>) {
        let state = Arc::new(Mutex::new(PassState::default()));
        let mut probes = JoinSet::new();

        for addr in self.known_addrs() {
            probes.spawn(Arc::clone(self).probe(addr, false, Arc::clone(&state)));
        }
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(found) => {
                    for host in found.hosts {
                        probes.spawn(Arc::clone(self).probe(
                            host,
                            found.by_master,
                            Arc::clone(&state),
                        ));
                    }
                }
                Err(e) => tracing::warn!("SYNC Probe task failed: {}", e),
            }
        }

        let (complete, pending) = {
            let mut state = state.lock();
            (state.complete, std::mem::take(&mut state.not_yet_added))
        };

        if complete {
            tracing::info!("SYNC Synchronization was complete (got data from primary).");
            for (server, _) in pending.into_values() {
                self.remove_server(&server);
            }
        } else {
            tracing::info!("SYNC Synchronization was partial (cannot talk to primary).");
            for (server, info) in pending.into_values() {
                self.add_server(&server, info, SyncKind::Partial);
            }
        }

        let mut topology = self.topology.write();
        if complete {
            topology.dyna_seeds = topology.servers.addrs();
            tracing::debug!("SYNC New dynamic seeds: {:?}", topology.dyna_seeds);
        }
        tracing::info!(
            "SYNC Synchronization completed: {} master(s) and {} slave(s) alive.",
            topology.masters.len(),
            topology.servers.len() - topology.masters.len()
        );
    }

    /// 시드, 동적 시드, 살아 있는 서버 주소의 합집합
    fn known_addrs(&self) -> Vec<String> {
        let topology = self.topology.read();
        let mut seen = HashSet::new();
        self.config
            .seeds
            .iter()
            .cloned()
            .chain(topology.dyna_seeds.iter().cloned())
            .chain(topology.servers.addrs())
            .filter(|addr| seen.insert(addr.clone()))
            .collect()
    }

    async fn probe(
        self: Arc<Self>,
        addr: String,
        by_master: bool,
        state: Arc<Mutex<PassState>>,
    ) -> Probed {
        let resolved = match self.config.resolver.resolve(&addr).await {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::warn!("SYNC Failed to resolve server address {}: {}", addr, e);
                return Probed::default();
            }
        };

        let confirmed = {
            let mut state = state.lock();
            let mut confirmed = None;
            if by_master {
                match state.not_yet_added.remove(&resolved) {
                    Some(pending) => confirmed = Some(pending),
                    None => {
                        state.add_if_found.insert(resolved);
                    }
                }
            }
            if confirmed.is_none() && !state.seen.insert(resolved) {
                return Probed::default();
            }
            confirmed
        };
        if let Some((server, info)) = confirmed {
            self.add_server(&server, info, SyncKind::Complete);
            return Probed::default();
        }

        let server = self.server_for(&addr, resolved);
        let (info, hosts) = match self.probe_server(&server).await {
            Ok(probed) => probed,
            Err(e) => {
                tracing::warn!("SYNC Server {} failed probe: {}", addr, e);
                self.remove_server(&server);
                return Probed::default();
            }
        };

        let add = {
            let mut state = state.lock();
            let add = self.config.direct || info.master || state.add_if_found.contains(&resolved);
            if add {
                state.complete = true;
            } else {
                state
                    .not_yet_added
                    .insert(resolved, (Arc::clone(&server), info.clone()));
            }
            add
        };
        if add {
            self.add_server(&server, info.clone(), SyncKind::Complete);
        }

        if self.config.direct {
            return Probed::default();
        }
        Probed {
            hosts,
            by_master: info.master,
        }
    }

    /// 살아 있는 서버를 재사용하거나 새로 만듦
    fn server_for(&self, addr: &str, resolved: SocketAddr) -> Arc<Server> {
        if let Some(server) = self.topology.read().servers.search(&resolved) {
            return server;
        }
        Server::new(
            addr,
            resolved,
            self.sync_requests.clone(),
            Arc::clone(&self.config.dialer),
            self.config.dial_timeout,
            Arc::clone(&self.stats),
        )
    }

    /// 상태 명령으로 역할 확인 (일시적 실패는 제한된 횟수만 재시도)
    async fn probe_server(&self, server: &Server) -> DriverResult<(ServerInfo, Vec<String>)> {
        let attempts = self.config.probe_attempts();
        let mut last_err = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.sync_retry_delay).await;
            }
            match self.query_status(server).await {
                Ok(result) => {
                    let info = classify(
                        server.addr(),
                        &result,
                        self.config.direct,
                        self.config.replica_set.as_deref(),
                    )?;
                    return Ok((info, result.candidate_hosts()));
                }
                Err(e) => {
                    tracing::debug!(
                        "SYNC Status query to {} failed (attempt {}): {}",
                        server.addr(),
                        attempt + 1,
                        e
                    );
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| DriverError::unreachable(server.addr())))
    }

    async fn query_status(&self, server: &Server) -> DriverResult<IsMasterResult> {
        let (socket, _) = server.acquire_socket(0, self.config.dial_timeout).await?;
        self.is_master(&socket).await
    }

    // ------------------------------------------------------------------------
    // 토폴로지 갱신
    // ------------------------------------------------------------------------

    /// 서버를 토폴로지에 반영
    ///
    /// 부분 패스에서 모르는 서버는 추가하지 않고 닫습니다.
    pub(crate) fn add_server(&self, server: &Arc<Server>, info: ServerInfo, kind: SyncKind) {
        let mut topology = self.topology.write();
        if self.is_closed() {
            drop(topology);
            server.close();
            return;
        }

        let mut newly_added = false;
        match topology.servers.search(&server.resolved_addr()) {
            None => {
                if kind == SyncKind::Partial {
                    drop(topology);
                    tracing::info!(
                        "SYNC Discarding unknown server {} due to partial sync.",
                        server.addr()
                    );
                    server.close();
                    return;
                }
                topology.servers.add(Arc::clone(server));
                if info.master {
                    topology.masters.add(Arc::clone(server));
                    tracing::info!("SYNC Adding {} to cluster as a master.", server.addr());
                } else {
                    tracing::info!("SYNC Adding {} to cluster as a slave.", server.addr());
                }
                newly_added = true;
                server.set_info(info);
            }
            Some(current) => {
                if !Arc::ptr_eq(&current, server) {
                    tracing::debug!(
                        "SYNC Duplicate server object for {}; keeping the live one",
                        server.addr()
                    );
                }
                if current.info().master != info.master {
                    if info.master {
                        topology.masters.add(Arc::clone(&current));
                        tracing::info!("SYNC Server {} is now a master.", current.addr());
                    } else {
                        topology.masters.remove(&current);
                        tracing::info!("SYNC Server {} is now a slave.", current.addr());
                    }
                }
                current.set_info(info);
                if !Arc::ptr_eq(&current, server) {
                    drop(topology);
                    server.close();
                    self.synced.send_modify(|count| *count += 1);
                    return;
                }
            }
        }
        drop(topology);

        self.synced.send_modify(|count| *count += 1);
        if newly_added {
            server.spawn_pinger(self.config.ping_interval);
        }
    }

    /// 서버 퇴출과 닫기
    pub(crate) fn remove_server(&self, server: &Arc<Server>) {
        let removed = {
            let mut topology = self.topology.write();
            let removed = topology.servers.remove(server);
            topology.masters.remove(server);
            removed
        };
        server.close();
        if removed {
            tracing::info!("SYNC Removing server {} from cluster.", server.addr());
            self.synced.send_modify(|count| *count += 1);
        }
    }
}

/// `ismaster` 응답으로 역할 판정
///
/// 프라이머리와 세컨더리만 받아들입니다. 직접 연결에서는 다른 상태의
/// 노드도 세컨더리로 취급합니다.
pub(crate) fn classify(
    addr: &str,
    result: &IsMasterResult,
    direct: bool,
    replica_set: Option<&str>,
) -> DriverResult<ServerInfo> {
    if let Some(want) = replica_set {
        if result.set_name.as_deref() != Some(want) {
            tracing::info!("SYNC Server {} is not a member of replica set {:?}", addr, want);
            return Err(DriverError::role_mismatch(format!(
                "server {} is not a member of replica set {:?}",
                addr, want
            )));
        }
    }

    if result.is_master {
        tracing::debug!("SYNC {} is a master.", addr);
    } else if result.secondary {
        tracing::debug!("SYNC {} is a slave.", addr);
    } else if direct {
        tracing::info!(
            "SYNC {} in unknown state. Pretending it's a slave due to direct connection.",
            addr
        );
    } else {
        tracing::info!("SYNC {} is neither a master nor a slave.", addr);
        return Err(DriverError::role_mismatch(format!(
            "{} is not a master nor slave",
            addr
        )));
    }
    Ok(ServerInfo::from_ismaster(result))
}

// ============================================================================
// Tests
// ============================================================================
