//! Per-connection session engine.
//!
//! A session is driven by one task through detection, handshake and upstream
//! dial; entering pure-proxy mode spawns the relay tasks. Cross-task state
//! lives behind a single async lock, and every spawned task captures the
//! reconnect counter at birth: before any observable action it re-checks the
//! counter under the lock and bows out if the session has moved on. That
//! epoch check is the only fencing mechanism — there is no cancellation
//! token; closing the sockets is what unblocks stalled I/O.

pub(crate) mod handshake;
pub(crate) mod relay;
pub(crate) mod upstream;

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info};

use crate::coordinator::WatchEvent;
use crate::error::Result;
use crate::manager::SessionManager;
use crate::net::{Conn, LineReader};
use crate::protocol::rpc::{Request, Response, RpcVersion};
use crate::protocol::ProtocolType;
use crate::upgrade::SessionData;

/// Deadline for classifying the first byte from a fresh connection.
pub(crate) const PROTOCOL_DETECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Total budget from accept to a completed client handshake.
pub(crate) const FIND_WORKER_NAME_TIMEOUT: Duration = Duration::from_secs(60);

/// Budget for the upstream subscribe/authorize exchange.
pub(crate) const READ_SERVER_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Relay reads give up this often to re-check the session state, so a
/// stopped or switched session never stays blocked on a silent peer.
pub(crate) const RECEIVE_MESSAGE_TIMEOUT: Duration = Duration::from_secs(15);

/// Upstream reconnect attempts after the first failure.
pub(crate) const RETRY_TIME_WHEN_SERVER_DOWN: usize = 10;

pub(crate) const RECONNECT_RETRY_SLEEP: Duration = Duration::from_secs(1);

/// Back-off before re-reading a coordinator path after a watch error.
pub(crate) const COORDINATOR_RETRY_SLEEP: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningState {
    Stopped,
    Running,
    Reconnecting,
}

/// Handshake progress. Only meaningful until the session is authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizeState {
    Connected,
    Subscribed,
    Authorized,
}

/// Mutable session state shared between the driver, the relay tasks and the
/// currency watcher.
pub(crate) struct SessionState {
    pub running: RunningState,
    /// Incremented on every transition into `Reconnecting`; the epoch that
    /// fences out stale tasks.
    pub reconnect_counter: u32,

    pub protocol: ProtocolType,
    pub is_btc_agent: bool,
    pub is_nicehash_client: bool,
    pub rpc_version: RpcVersion,
    /// AsicBoost version-rolling mask, 0 when unused.
    pub version_mask: u32,

    pub subscribe_request: Option<Request>,
    pub authorize_request: Option<Request>,

    pub full_worker_name: String,
    pub subaccount_name: String,
    pub miner_name_with_dot: String,

    pub mining_coin: String,
    pub watch_path: String,
    pub watch_rx: Option<oneshot::Receiver<WatchEvent>>,

    pub client_reader: Option<LineReader>,
    pub server: Option<Arc<Conn>>,
    pub server_reader: Option<LineReader>,
}

pub struct Session {
    /// Weak self-handle so `&self` methods can spawn tasks that keep the
    /// session alive.
    self_ref: Weak<Session>,
    pub(crate) manager: Arc<SessionManager>,
    pub(crate) session_id: u32,
    /// Chain-specific rendering of the session ID, also the Extranonce1.
    pub(crate) id_string: String,
    pub(crate) client: Arc<Conn>,
    pub(crate) client_addr: SocketAddr,
    pub(crate) state: Mutex<SessionState>,
}

impl Session {
    pub fn new(
        manager: Arc<SessionManager>,
        conn: Conn,
        session_id: u32,
        client_addr: SocketAddr,
    ) -> Arc<Self> {
        let id_string = manager.chain_type().session_id_string(session_id);
        debug!("IP: {}, session ID: {}", client_addr, id_string);

        let client = Arc::new(conn);
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            manager,
            session_id,
            id_string,
            client_addr,
            state: Mutex::new(SessionState {
                running: RunningState::Stopped,
                reconnect_counter: 0,
                protocol: ProtocolType::Unknown,
                is_btc_agent: false,
                is_nicehash_client: false,
                rpc_version: RpcVersion::V1,
                version_mask: 0,
                subscribe_request: None,
                authorize_request: None,
                full_worker_name: String::new(),
                subaccount_name: String::new(),
                miner_name_with_dot: String::new(),
                mining_coin: String::new(),
                watch_path: String::new(),
                watch_rx: None,
                client_reader: Some(LineReader::new(Arc::clone(&client))),
                server: None,
                server_reader: None,
            }),
            client,
        })
    }

    /// A strong handle to this session. Always succeeds while any `&self`
    /// borrow exists, since that borrow comes out of a live `Arc`.
    pub(crate) fn arc(&self) -> Arc<Session> {
        self.self_ref.upgrade().expect("session is alive")
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Starts a fresh session: detect the protocol, run the handshake, dial
    /// the upstream, then enter pure-proxy mode.
    pub async fn run(self: Arc<Self>) {
        {
            let mut st = self.state.lock().await;
            if st.running != RunningState::Stopped {
                return;
            }
            st.running = RunningState::Running;
        }

        let protocol = self.protocol_detect().await;
        self.state.lock().await.protocol = protocol;

        if protocol == ProtocolType::Unknown {
            self.stop().await;
            return;
        }

        self.run_proxy_stratum().await;
    }

    async fn run_proxy_stratum(&self) {
        if self.find_worker_name().await.is_err() {
            self.stop().await;
            return;
        }

        if self
            .find_mining_coin(self.manager.enable_user_auto_reg())
            .await
            .is_err()
        {
            self.stop().await;
            return;
        }

        {
            let mut st = self.state.lock().await;
            if self.connect_stratum_server(&mut st).await.is_err() {
                drop(st);
                self.stop().await;
                return;
            }
        }

        self.arc().proxy_stratum().await;
    }

    /// Restores a session inherited across a zero-downtime upgrade. The
    /// saved subscribe/authorize requests are replayed through the normal
    /// handshake path with a scratch state; a replay that does not end
    /// `Authorized` on the same coin discards the session.
    pub async fn resume(self: Arc<Self>, data: SessionData, server: Conn) {
        {
            let mut st = self.state.lock().await;
            if st.running != RunningState::Stopped {
                return;
            }
            st.running = RunningState::Running;
        }

        let server = Arc::new(server);
        {
            let mut st = self.state.lock().await;
            st.protocol = self.default_protocol();
            st.server_reader = Some(LineReader::new(Arc::clone(&server)));
            st.server = Some(server);
            st.version_mask = data.version_mask;

            let mut stat = AuthorizeState::Connected;
            for request in [
                data.stratum_subscribe_request.clone(),
                data.stratum_authorize_request.clone(),
            ]
            .into_iter()
            .flatten()
            {
                let (_, stratum_err) = self.handle_request(&mut st, request, &mut stat).await;
                if let Some(err) = stratum_err {
                    error!("resume session {} failed: {}", self.client_addr, err);
                    drop(st);
                    self.stop().await;
                    return;
                }
            }

            if stat != AuthorizeState::Authorized {
                error!(
                    "resume session {} failed: stat should be Authorized, but is {:?}",
                    self.client_addr, stat
                );
                drop(st);
                self.stop().await;
                return;
            }
        }

        if self.find_mining_coin(false).await.is_err() {
            self.stop().await;
            return;
        }

        {
            let st = self.state.lock().await;
            if st.mining_coin != data.mining_coin {
                error!(
                    "resume session {} failed: mining coin changed: {} -> {}",
                    self.client_addr, data.mining_coin, st.mining_coin
                );
                drop(st);
                self.stop().await;
                return;
            }
        }

        info!("resume session success: {}", self.client_addr);
        self.arc().proxy_stratum().await;
    }

    /// Stops the session. Idempotent; closes both sockets so every blocked
    /// task unwinds, then releases the session ID and the coordinator watch.
    pub async fn stop(&self) {
        let (server, watch_path, worker, coin) = {
            let mut st = self.state.lock().await;
            if st.running == RunningState::Stopped {
                return;
            }
            st.running = RunningState::Stopped;
            (
                st.server.take(),
                st.watch_path.clone(),
                st.full_worker_name.clone(),
                st.mining_coin.clone(),
            )
        };

        if let Some(server) = server {
            server.shutdown();
        }
        self.client.shutdown();

        self.manager.release(self.session_id, &watch_path).await;

        metrics::counter!("sessions_stopped_total").increment(1);
        info!(
            "session stopped: {}; {}; {}",
            self.client_addr, worker, coin
        );
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running != RunningState::Stopped
    }

    pub(crate) async fn running_state(&self) -> RunningState {
        self.state.lock().await.running
    }

    pub(crate) async fn reconnect_counter(&self) -> u32 {
        self.state.lock().await.reconnect_counter
    }

    pub(crate) async fn is_btc_agent(&self) -> bool {
        self.state.lock().await.is_btc_agent
    }

    /// Writes a response to the miner in the session's JSON-RPC envelope.
    /// The newline is a separate write, matching the upstream framing rules;
    /// throughput here is bounded by miner cadence, not syscall count.
    pub(crate) async fn write_response_to_client(
        &self,
        response: &Response,
        version: RpcVersion,
    ) -> Result<()> {
        let bytes = response.to_bytes(version)?;
        self.client.write_all(&bytes).await?;
        self.client.write_all(b"\n").await?;
        Ok(())
    }

    pub(crate) async fn write_notify_to_client(&self, request: &Request) -> Result<()> {
        let bytes = request.to_bytes()?;
        self.client.write_all(&bytes).await?;
        self.client.write_all(b"\n").await?;
        Ok(())
    }

    pub(crate) async fn write_request_to_server(
        &self,
        server: &Conn,
        request: &Request,
    ) -> Result<()> {
        let bytes = request.to_bytes()?;
        server.write_all(&bytes).await?;
        server.write_all(b"\n").await?;
        Ok(())
    }

    pub(crate) fn auth_request_id(st: &SessionState) -> Value {
        st.authorize_request
            .as_ref()
            .map(|r| r.id.clone())
            .unwrap_or(Value::Null)
    }
}
