//! Process-wide session registry and accept loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicI64;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::{ChainType, Config, StratumServerInfo};
use crate::coordinator::Coordinator;
use crate::error::{Result, SwitcherError};
use crate::net::Conn;
use crate::session::Session;
use crate::session_id::SessionIdManager;
use crate::upgrade::{self, RuntimeData, SessionData};

/// Metadata written into the server-ID lease node so operators can see who
/// holds which ID.
#[derive(Debug, Serialize)]
struct SwitcherMetadata {
    #[serde(rename = "ChainType")]
    chain_type: String,
    #[serde(rename = "Coins")]
    coins: Vec<String>,
    #[serde(rename = "IPs")]
    ips: Vec<String>,
    #[serde(rename = "HostName")]
    host_name: String,
    #[serde(rename = "ListenAddr")]
    listen_addr: String,
}

pub struct SessionManager {
    /// Weak self-handle so `&self` methods can hand strong references to
    /// the tasks and sessions they spawn.
    self_ref: Weak<SessionManager>,
    chain_type: ChainType,
    server_id: u8,
    listen_addr: String,
    server_info: HashMap<String, StratumServerInfo>,
    switcher_watch_dir: String,
    enable_user_auto_reg: bool,
    auto_reg_watch_dir: String,
    auto_reg_allow_users: AtomicI64,
    stratum_server_case_insensitive: bool,
    user_case_index_dir: String,
    /// Sessions in normal proxy state, keyed by session ID.
    sessions: DashMap<u32, Arc<Session>>,
    session_ids: SessionIdManager,
    coordinator: Arc<Coordinator>,
}

impl SessionManager {
    pub async fn new(
        config: Config,
        coordinator: Arc<Coordinator>,
        prev_server_id: u8,
    ) -> Result<Arc<Self>> {
        let chain_type = config.chain_type;

        let mut server_id = config.server_id;
        if server_id == 0 {
            server_id = Self::assign_server_id_from_coordinator(
                &coordinator,
                &config,
                prev_server_id,
            )
            .await
            .map_err(|e| {
                SwitcherError::Coordinator(format!("cannot assign server id: {e}"))
            })?;
        }

        let session_ids = SessionIdManager::new(server_id, chain_type.index_bits())?;
        let alloc_interval = chain_type.alloc_interval();
        if alloc_interval > 0 {
            // Pre-allocated IDs must keep NiceHash's 2-byte extranonce
            // sub-ranges from overlapping.
            session_ids.set_alloc_interval(alloc_interval);
        }

        Ok(Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            chain_type,
            server_id,
            listen_addr: config.listen_addr,
            server_info: config.stratum_servers,
            switcher_watch_dir: config.coordinator.switcher_watch_dir,
            enable_user_auto_reg: config.auto_reg.enabled,
            auto_reg_watch_dir: config.auto_reg.watch_dir,
            auto_reg_allow_users: AtomicI64::new(config.auto_reg.max_wait_users),
            stratum_server_case_insensitive: config.stratum_server_case_insensitive,
            user_case_index_dir: config.user_case_index_dir,
            sessions: DashMap::new(),
            session_ids,
            coordinator,
        }))
    }

    fn arc(&self) -> Arc<SessionManager> {
        self.self_ref.upgrade().expect("session manager is alive")
    }

    /// Leases a server ID from the coordinator: scan the taken IDs, claim
    /// the first free slot at or above the previous ID (stable reuse across
    /// restarts) with an ephemeral node, retry on collision.
    async fn assign_server_id_from_coordinator(
        coordinator: &Arc<Coordinator>,
        config: &Config,
        prev_server_id: u8,
    ) -> Result<u8> {
        let assign_dir = &config.coordinator.server_id_assign_dir;
        if let Err(e) = coordinator.create_recursive(assign_dir).await {
            warn!("create server id assign dir failed: {}", e);
        }

        let parent = assign_dir.trim_end_matches('/');
        let children = coordinator.children(parent).await?;

        let mut taken = [false; 256];
        taken[0] = true; // id 0 is not assignable
        for name in &children {
            match name.parse::<usize>() {
                Ok(id) if (1..=255).contains(&id) => taken[id] = true,
                Ok(_) => warn!("found out of range server id in coordinator: {}", name),
                Err(e) => warn!("bad server id node name {:?}: {}", name, e),
            }
        }

        let metadata = SwitcherMetadata {
            chain_type: config.chain_type.as_str().to_string(),
            coins: config.stratum_servers.keys().cloned().collect(),
            ips: local_ip_list(),
            host_name: sysinfo::System::host_name().unwrap_or_default(),
            listen_addr: config.listen_addr.clone(),
        };
        let payload = serde_json::to_vec(&metadata)?;

        let mut index = prev_server_id as usize;
        loop {
            let Some(id) = (index..256).find(|&i| !taken[i]) else {
                return Err(SwitcherError::Coordinator("server id is full".into()));
            };

            let node = format!("{}{}", assign_dir, id);
            match coordinator.create_ephemeral(&node, &payload).await {
                Ok(()) => {
                    info!("assigned server id {} ({})", id, node);
                    return Ok(id as u8);
                }
                Err(e) => {
                    warn!("claim server id node {} failed: {}", node, e);
                    taken[id] = true;
                    index = id;
                }
            }
        }
    }

    pub fn server_id(&self) -> u8 {
        self.server_id
    }

    pub fn chain_type(&self) -> ChainType {
        self.chain_type
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn server_info(&self, coin: &str) -> Option<StratumServerInfo> {
        self.server_info.get(coin).cloned()
    }

    pub(crate) fn switcher_watch_dir(&self) -> &str {
        &self.switcher_watch_dir
    }

    pub(crate) fn auto_reg_watch_dir(&self) -> &str {
        &self.auto_reg_watch_dir
    }

    pub(crate) fn enable_user_auto_reg(&self) -> bool {
        self.enable_user_auto_reg
    }

    pub(crate) fn auto_reg_allow_users(&self) -> &AtomicI64 {
        &self.auto_reg_allow_users
    }

    pub(crate) fn session_list(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Runs the switcher: restore upgraded sessions, then accept forever.
    /// Only returns on a bind failure.
    pub async fn run(&self, runtime: Option<RuntimeData>) -> Result<()> {
        if let Some(runtime) = runtime {
            if runtime.action == "upgrade" {
                for data in runtime.session_datas {
                    self.resume_session(data).await;
                }
            }
        }

        info!("listen TCP {}", self.listen_addr);
        let listener = TcpListener::bind(&self.listen_addr).await?;

        upgrade::spawn_signal_handler(self.arc());
        info!("stratum switcher is now upgradable");

        self.accept_loop(listener).await;
        Ok(())
    }

    /// Binds the listener and accepts in a background task. Returns the
    /// bound address; used by tests and the debug endpoint.
    pub async fn listen(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        let addr = listener.local_addr()?;
        info!("listen TCP {}", addr);

        let manager = self.arc();
        tokio::spawn(async move { manager.accept_loop(listener).await });
        Ok(addr)
    }

    async fn accept_loop(&self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("new miner connection from {}", addr);
                    metrics::counter!("sessions_connected_total").increment(1);
                    self.run_session(stream, addr);
                }
                Err(e) => {
                    error!("failed to accept connection: {}", e);
                }
            }
        }
    }

    /// Allocates a session ID and spawns the session driver. An exhausted
    /// allocator drops the connection on the floor.
    fn run_session(&self, stream: TcpStream, addr: SocketAddr) {
        let session_id = match self.session_ids.alloc() {
            Ok(id) => id,
            Err(e) => {
                error!("new stratum session failed: {}", e);
                return;
            }
        };

        let conn = match Conn::new(stream) {
            Ok(conn) => conn,
            Err(e) => {
                error!("wrap client connection failed: {}", e);
                self.session_ids.free(session_id);
                return;
            }
        };

        let session = Session::new(self.arc(), conn, session_id, addr);
        tokio::spawn(session.run());
    }

    /// Rebuilds one session from inherited descriptors during an upgrade.
    pub async fn resume_session(&self, data: SessionData) {
        let client = match unsafe { Conn::from_raw_fd(data.client_conn_fd) } {
            Ok(conn) => conn,
            Err(e) => {
                error!("resume client conn failed: {}", e);
                return;
            }
        };
        let server = match unsafe { Conn::from_raw_fd(data.server_conn_fd) } {
            Ok(conn) => conn,
            Err(e) => {
                error!("resume server conn failed: {}", e);
                return;
            }
        };

        let Ok(client_addr) = client.peer_addr() else {
            error!("resume client conn failed: downstream exited.");
            return;
        };
        if server.peer_addr().is_err() {
            error!("resume server conn failed: upstream exited.");
            return;
        }

        if let Err(e) = self.session_ids.resume(data.session_id) {
            error!("resume session id failed: {}", e);
            return;
        }

        let session = Session::new(self.arc(), client, data.session_id, client_addr);
        tokio::spawn(async move { session.resume(data, server).await });
    }

    /// Called when a session enters normal proxy state.
    pub(crate) fn register(&self, session: &Arc<Session>) {
        self.sessions
            .insert(session.session_id(), Arc::clone(session));
    }

    /// Called when a session starts reconnecting: it leaves the registry but
    /// keeps its session ID.
    pub(crate) async fn unregister(&self, session_id: u32, watch_path: &str) {
        self.sessions.remove(&session_id);
        if !watch_path.is_empty() {
            self.coordinator.release_w(watch_path, session_id).await;
        }
    }

    /// Called when a session stops: registry, session ID and coordinator
    /// watch are all released.
    pub(crate) async fn release(&self, session_id: u32, watch_path: &str) {
        self.sessions.remove(&session_id);
        self.session_ids.free(session_id);
        if !watch_path.is_empty() {
            self.coordinator.release_w(watch_path, session_id).await;
        }
    }

    /// Canonical spelling of a sub-account name. Lowercases outright when
    /// the upstream is case-insensitive; otherwise consults the optional
    /// case index and falls back to the input.
    pub(crate) async fn regular_subaccount_name(&self, name: &str) -> String {
        if self.stratum_server_case_insensitive {
            return name.to_lowercase();
        }
        if self.user_case_index_dir.is_empty() {
            return name.to_string();
        }

        let path = format!("{}{}", self.user_case_index_dir, name.to_lowercase());
        match self.coordinator.get(&path).await {
            Ok(value) => {
                let regular = String::from_utf8_lossy(&value).into_owned();
                debug!("regular subaccount name: {} -> {}", name, regular);
                regular
            }
            Err(e) => {
                debug!("regular subaccount name lookup failed: {}: {}", name, e);
                name.to_string()
            }
        }
    }
}

fn local_ip_list() -> Vec<String> {
    let networks = sysinfo::Networks::new_with_refreshed_list();
    let mut ips = Vec::new();
    for (_name, data) in &networks {
        for ip in data.ip_networks() {
            ips.push(ip.to_string());
        }
    }
    ips
}
