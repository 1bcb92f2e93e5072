//! Client-side handshake: protocol detection, subscribe/authorize/configure
//! parsing and the sub-account to currency resolution.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{
    AuthorizeState, Session, SessionState, FIND_WORKER_NAME_TIMEOUT, PROTOCOL_DETECT_TIMEOUT,
};
use crate::config::ChainType;
use crate::error::{Result, StratumError, SwitcherError};
use crate::manager::SessionManager;
use crate::protocol::rpc::{Request, Response, RpcVersion};
use crate::protocol::{
    ProtocolType, BTC_AGENT_CLIENT_TYPE_PREFIX, ETHEREUM_STRATUM_NICEHASH_PREFIX,
    ETHEREUM_STRATUM_NICEHASH_VERSION, ETHPROXY_USER_AGENT, ETHPROXY_VERSION,
    NICEHASH_CLIENT_TYPE_PREFIX,
};
use crate::utils::{filter_worker_name, split_worker_name, strip_eth_addr_from_full_name};

/// RAII admission slot for a pending auto-registration. The slot is held
/// until registration completes, not just until the request is submitted.
struct AutoRegSlot {
    manager: Arc<SessionManager>,
}

impl AutoRegSlot {
    fn take(manager: &Arc<SessionManager>) -> Self {
        manager
            .auto_reg_allow_users()
            .fetch_sub(1, Ordering::Relaxed);
        Self {
            manager: Arc::clone(manager),
        }
    }
}

impl Drop for AutoRegSlot {
    fn drop(&mut self) {
        self.manager
            .auto_reg_allow_users()
            .fetch_add(1, Ordering::Relaxed);
    }
}

impl Session {
    pub(crate) fn default_protocol(&self) -> ProtocolType {
        match self.manager.chain_type() {
            // Decred speaks almost exactly the Bitcoin dialect.
            ChainType::Bitcoin | ChainType::DecredNormal | ChainType::DecredGominer => {
                ProtocolType::BitcoinStratum
            }
            // EthProxy has no subscribe phase, which makes it the simplest
            // default; a later subscribe upgrades the classification.
            ChainType::Ethereum => ProtocolType::EthereumProxy,
        }
    }

    /// Peeks the first byte from the client. BTCAgent speaks plain Stratum
    /// JSON until authorization completes, so every supported client must
    /// open with `{`; anything else is unusable.
    pub(crate) async fn protocol_detect(&self) -> ProtocolType {
        let mut st = self.state.lock().await;
        let reader = st
            .client_reader
            .as_mut()
            .expect("client reader present before handshake");

        match reader.peek_byte(PROTOCOL_DETECT_TIMEOUT).await {
            Ok(b'{') => {
                debug!("found stratum protocol: {}", self.client_addr);
                self.default_protocol()
            }
            Ok(_) => {
                warn!("unknown protocol: {}", self.client_addr);
                ProtocolType::Unknown
            }
            Err(e) => {
                warn!("read failed: {}: {}", self.client_addr, e);
                ProtocolType::Unknown
            }
        }
    }

    /// Runs the client handshake loop until the session is authorized or the
    /// 60-second budget runs out. Protocol errors are answered but do not
    /// abort the loop; only I/O failures and the deadline do.
    pub(crate) async fn find_worker_name(&self) -> Result<()> {
        let handshake = async {
            let mut stat = AuthorizeState::Connected;
            let mut st = self.state.lock().await;

            while stat != AuthorizeState::Authorized {
                let line = st
                    .client_reader
                    .as_mut()
                    .expect("client reader present during handshake")
                    .read_line()
                    .await?;

                let request: Request = match serde_json::from_slice(&line) {
                    Ok(request) => request,
                    Err(e) => {
                        debug!(
                            "JSON decode failed: {}: {}",
                            e,
                            String::from_utf8_lossy(&line)
                        );
                        continue;
                    }
                };

                let request_id = request.id.clone();
                let (result, stratum_err) = self.handle_request(&mut st, request, &mut stat).await;

                // Neither a result nor an error means nothing to send back.
                if result.is_some() || stratum_err.is_some() {
                    let response = Response {
                        id: request_id,
                        result: result.unwrap_or(Value::Null),
                        error: stratum_err
                            .map(|e| e.to_rpc_array(self.manager.server_id()))
                            .unwrap_or(Value::Null),
                    };
                    self.write_response_to_client(&response, st.rpc_version)
                        .await?;
                }
            }

            Ok::<String, SwitcherError>(st.full_worker_name.clone())
        };

        match tokio::time::timeout(FIND_WORKER_NAME_TIMEOUT, handshake).await {
            Ok(Ok(worker)) => {
                debug!("find worker name success: {}", worker);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("find worker name failed: {}", e);
                Err(e)
            }
            Err(_) => {
                warn!("find worker name timeout: {}", self.client_addr);
                Err(SwitcherError::ReadTimeout)
            }
        }
    }

    /// Dispatches one handshake request. Subscribe must precede authorize,
    /// except that `eth_submitLogin` implicitly subscribes.
    pub(crate) async fn handle_request(
        &self,
        st: &mut SessionState,
        request: Request,
        stat: &mut AuthorizeState,
    ) -> (Option<Value>, Option<StratumError>) {
        match request.method.as_str() {
            "mining.subscribe" => {
                if *stat != AuthorizeState::Connected {
                    return (None, Some(StratumError::DuplicateSubscribed));
                }
                let (result, err) = self.parse_subscribe(st, request);
                if err.is_none() {
                    *stat = AuthorizeState::Subscribed;
                }
                (result, err)
            }

            "eth_submitLogin" | "mining.authorize" => {
                if request.method == "eth_submitLogin"
                    && st.protocol == ProtocolType::EthereumProxy
                {
                    self.make_subscribe_for_ethproxy(st);
                    *stat = AuthorizeState::Subscribed;
                    // ETHProxy expects JSON-RPC 2.0 responses.
                    st.rpc_version = RpcVersion::V2;
                }
                if *stat != AuthorizeState::Subscribed {
                    return (None, Some(StratumError::NeedSubscribed));
                }
                let (result, err) = self.parse_authorize(st, request).await;
                if err.is_none() {
                    *stat = AuthorizeState::Authorized;
                }
                (result, err)
            }

            "mining.configure" => {
                if st.protocol == ProtocolType::BitcoinStratum {
                    self.parse_configure(st, request)
                } else {
                    (None, None)
                }
            }

            // Unimplemented methods are ignored.
            _ => (None, None),
        }
    }

    fn parse_subscribe(
        &self,
        st: &mut SessionState,
        request: Request,
    ) -> (Option<Value>, Option<StratumError>) {
        let user_agent = request
            .params
            .first()
            .and_then(Value::as_str)
            .map(str::to_lowercase);

        let result = match self.manager.chain_type() {
            ChainType::Bitcoin | ChainType::DecredNormal | ChainType::DecredGominer => {
                if let Some(ua) = &user_agent {
                    if ua.starts_with(BTC_AGENT_CLIENT_TYPE_PREFIX) {
                        st.is_btc_agent = true;
                    }
                }
                let sid = &self.id_string;
                json!([
                    [["mining.set_difficulty", sid], ["mining.notify", sid]],
                    sid,
                    8
                ])
            }

            ChainType::Ethereum => {
                // Only the plain and NiceHash Ethereum dialects have a
                // subscribe phase at all.
                st.protocol = ProtocolType::EthereumStratum;

                if let Some(ua) = &user_agent {
                    if ua.starts_with(NICEHASH_CLIENT_TYPE_PREFIX) {
                        st.is_nicehash_client = true;
                    }
                    if ua.starts_with(BTC_AGENT_CLIENT_TYPE_PREFIX) {
                        st.is_btc_agent = true;
                        st.protocol = ProtocolType::EthereumStratumNiceHash;
                    }
                }

                if let Some(protocol) = request.params.get(1).and_then(Value::as_str) {
                    if protocol
                        .to_lowercase()
                        .starts_with(ETHEREUM_STRATUM_NICEHASH_PREFIX)
                    {
                        st.protocol = ProtocolType::EthereumStratumNiceHash;
                    }
                }

                if st.protocol == ProtocolType::EthereumStratumNiceHash {
                    let mut extra_nonce = self.id_string.clone();
                    if st.is_nicehash_client {
                        // The NiceHash Ethereum client only supports
                        // extranonces up to 2 bytes.
                        extra_nonce.truncate(4);
                    }
                    json!([
                        [
                            "mining.notify",
                            self.id_string,
                            ETHEREUM_STRATUM_NICEHASH_VERSION
                        ],
                        extra_nonce
                    ])
                } else {
                    json!(true)
                }
            }
        };

        // Keep the original request for replay toward the upstream.
        st.subscribe_request = Some(request);
        (Some(result), None)
    }

    /// Synthesizes the subscribe an EthProxy client never sends, so the
    /// upstream still learns the session ID and the miner's IP.
    fn make_subscribe_for_ethproxy(&self, st: &mut SessionState) {
        let mut request = Request::new("mining.subscribe");
        request.params = vec![json!(ETHPROXY_USER_AGENT), json!(ETHPROXY_VERSION)];
        st.subscribe_request = Some(request);
    }

    async fn parse_authorize(
        &self,
        st: &mut SessionState,
        request: Request,
    ) -> (Option<Value>, Option<StratumError>) {
        // Keep the original request for replay toward the upstream.
        st.authorize_request = Some(request.clone());

        if request.params.is_empty() {
            return (None, Some(StratumError::TooFewParams));
        }
        let Some(full_name) = request.params[0].as_str() else {
            return (None, Some(StratumError::WorkerNameMustBeString));
        };

        let mut full_worker_name = filter_worker_name(full_name);

        // Ethereum worker names may carry a wallet address, and the rig name
        // may live in a separate `worker` field.
        if st.protocol != ProtocolType::BitcoinStratum {
            if !request.worker.is_empty() {
                full_worker_name =
                    format!("{}.{}", full_worker_name, filter_worker_name(&request.worker));
            }
            full_worker_name = strip_eth_addr_from_full_name(&full_worker_name);
        }

        let (subaccount, miner_with_dot) = split_worker_name(&full_worker_name);
        let subaccount = self.manager.regular_subaccount_name(subaccount).await;

        st.miner_name_with_dot = miner_with_dot.to_string();
        st.full_worker_name = format!("{}{}", subaccount, miner_with_dot);
        st.subaccount_name = subaccount;

        if st.subaccount_name.is_empty() {
            return (None, Some(StratumError::EmptySubaccountName));
        }

        // Nothing goes back to the miner yet; the upstream's authorize
        // response will be forwarded once it arrives.
        (None, None)
    }

    fn parse_configure(
        &self,
        st: &mut SessionState,
        request: Request,
    ) -> (Option<Value>, Option<StratumError>) {
        if request.params.len() < 2 {
            return (None, Some(StratumError::TooFewParams));
        }

        if let Some(options) = request.params[1].as_object() {
            if let Some(mask_str) = options.get("version-rolling.mask").and_then(Value::as_str) {
                if let Ok(mask) = u32::from_str_radix(mask_str, 16) {
                    st.version_mask = mask;
                }
            }
        }

        if st.version_mask != 0 {
            // A provisional answer. The truly-allowed mask reaches the miner
            // via mining.set_version_mask after the upstream weighs in.
            return (
                Some(json!({
                    "version-rolling": true,
                    "version-rolling.mask": format!("{:08x}", st.version_mask),
                })),
                None,
            );
        }

        // Unknown configure content gets no response.
        (None, None)
    }

    /// Resolves the sub-account's assigned currency from the coordinator and
    /// arms the change watch on its path.
    pub(crate) async fn find_mining_coin(&self, auto_reg: bool) -> Result<()> {
        let (subaccount, auth_id, rpc_version) = {
            let st = self.state.lock().await;
            (
                st.subaccount_name.clone(),
                Self::auth_request_id(&st),
                st.rpc_version,
            )
        };

        let path = format!("{}{}", self.manager.switcher_watch_dir(), subaccount);
        self.state.lock().await.watch_path = path.clone();

        match self
            .manager
            .coordinator()
            .get_w(&path, self.session_id)
            .await
        {
            Ok((data, watch_rx)) => {
                let mut st = self.state.lock().await;
                st.mining_coin = String::from_utf8_lossy(&data).into_owned();
                st.watch_rx = Some(watch_rx);
                Ok(())
            }
            Err(err) => {
                if auto_reg {
                    return self.try_auto_reg().await;
                }

                debug!("find mining coin failed: {}: {}", path, err);
                let response = Response {
                    id: auth_id,
                    result: Value::Null,
                    error: StratumError::InvalidSubaccountName
                        .to_rpc_array(self.manager.server_id()),
                };
                let _ = self.write_response_to_client(&response, rpc_version).await;
                Err(err)
            }
        }
    }

    /// Auto-registration rendezvous: publish `{SessionID, Worker}` under the
    /// auto-reg path and block until an external registrar installs the
    /// currency key (its deletion of the rendezvous node fires our watch).
    async fn try_auto_reg(&self) -> Result<()> {
        let (subaccount, full_worker_name) = {
            let st = self.state.lock().await;
            (st.subaccount_name.clone(), st.full_worker_name.clone())
        };
        info!(
            "try to auto register sub-account, worker: {}",
            full_worker_name
        );

        let path = format!("{}{}", self.manager.auto_reg_watch_dir(), subaccount);
        let coordinator = self.manager.coordinator();

        // Held until registration completes; bounds the number of miners
        // parked on the registrar at once.
        let mut _slot: Option<AutoRegSlot> = None;

        let watch_rx = match coordinator.get_w(&path, self.session_id).await {
            Ok((_, watch_rx)) => watch_rx,
            Err(_) => {
                if self
                    .manager
                    .auto_reg_allow_users()
                    .load(Ordering::Relaxed)
                    < 1
                {
                    warn!(
                        "too much pending auto reg request, worker: {}",
                        full_worker_name
                    );
                    return Err(SwitcherError::TooMuchPendingAutoRegReq);
                }
                // Unlocked counter: a transient dip below zero under a burst
                // admits a few extra requests, nothing worse.
                _slot = Some(AutoRegSlot::take(&self.manager));

                let info = json!({
                    "SessionID": self.session_id,
                    "Worker": full_worker_name,
                });
                let create_result = coordinator.create(&path, info.to_string().as_bytes()).await;

                match coordinator.get_w(&path, self.session_id).await {
                    Ok((_, watch_rx)) => watch_rx,
                    Err(err) => {
                        match create_result {
                            Err(create_err) => warn!(
                                "create auto register key failed, worker: {}, errmsg: {}",
                                full_worker_name, create_err
                            ),
                            Ok(()) => info!(
                                "sub-account auto register failed, worker: {}, errmsg: {}",
                                full_worker_name, err
                            ),
                        }
                        return Err(err);
                    }
                }
            }
        };

        // Wait for the remote registrar to finish.
        let _ = watch_rx.await;

        Box::pin(self.find_mining_coin(false)).await
    }
}
