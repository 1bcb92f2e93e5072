//! Upstream side of a session: dialing the sserver for the current coin and
//! replaying the (rewritten) subscribe/authorize handshake. Runs on first
//! connect and again on every reconnect.

use serde_json::{json, Value};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use super::{RunningState, Session, SessionState, READ_SERVER_RESPONSE_TIMEOUT};
use crate::error::{Result, StratumError, SwitcherError};
use crate::net::{Conn, LineReader};
use crate::protocol::rpc::{Request, Response};
use crate::protocol::ProtocolType;
use crate::utils::{ip_to_long, u32_to_hex};
use std::sync::Arc;

impl Session {
    /// Dials the upstream for the session's current coin and runs the
    /// subscribe/authorize replay. Routing errors are reported to the miner
    /// only outside `Reconnecting` (a reconnect loop retries silently).
    pub(crate) async fn connect_stratum_server(&self, st: &mut SessionState) -> Result<()> {
        let running = st.running;
        let rpc_id = Self::auth_request_id(st);

        let Some(info) = self.manager.server_info(&st.mining_coin) else {
            error!("stratum server not found: {}", st.mining_coin);
            if running != RunningState::Reconnecting {
                let response = Response {
                    id: rpc_id,
                    result: Value::Null,
                    error: StratumError::StratumServerNotFound
                        .to_rpc_array(self.manager.server_id()),
                };
                let _ = self.write_response_to_client(&response, st.rpc_version).await;
            }
            return Err(StratumError::StratumServerNotFound.into());
        };

        let stream = match TcpStream::connect(info.url.as_str()).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(
                    "connect stratum server failed: {}; {}; {}",
                    st.mining_coin, info.url, e
                );
                if running != RunningState::Reconnecting {
                    let response = Response {
                        id: rpc_id,
                        result: Value::Null,
                        error: StratumError::ConnectStratumServerFailed
                            .to_rpc_array(self.manager.server_id()),
                    };
                    let _ = self.write_response_to_client(&response, st.rpc_version).await;
                }
                return Err(StratumError::ConnectStratumServerFailed.into());
            }
        };

        debug!(
            "connect stratum server success: {}; {}",
            st.mining_coin, info.url
        );

        let server = Arc::new(Conn::new(stream)?);
        st.server_reader = Some(LineReader::new(Arc::clone(&server)));
        st.server = Some(server);

        self.server_subscribe_and_authorize(st).await
    }

    async fn send_mining_configure(&self, st: &SessionState) -> Result<()> {
        if st.version_mask == 0 {
            return Ok(());
        }
        let server = st.server.clone().expect("server connected");
        let request = Request {
            id: json!("configure"),
            method: "mining.configure".to_string(),
            params: vec![
                json!(["version-rolling"]),
                json!({"version-rolling.mask": format!("{:08x}", st.version_mask)}),
            ],
            worker: String::new(),
        };
        self.write_request_to_server(&server, &request).await
    }

    /// Rewrites the saved subscribe with our session ID and the miner's IP
    /// and sends it upstream. This is how the upstream learns the session is
    /// pre-identified. Parameter layout is protocol-specific.
    async fn send_mining_subscribe(&self, st: &mut SessionState) -> Result<(String, String)> {
        let mut user_agent = "stratumSwitcher".to_string();
        let mut protocol = "Stratum".to_string();
        let client_ip_long = ip_to_long(&self.client_addr.ip());
        let protocol_type = st.protocol;

        let request = st
            .subscribe_request
            .as_mut()
            .ok_or_else(|| SwitcherError::Protocol("missing subscribe request".into()))?;
        request.id = json!("subscribe");

        match protocol_type {
            ProtocolType::BitcoinStratum => {
                if let Some(ua) = request.params.first().and_then(Value::as_str) {
                    user_agent = ua.to_string();
                }
                // The plain hex rendering: the Decred session ID string is
                // already padded and byte-reversed, which is not what the
                // upstream matches against here.
                let sid = u32_to_hex(self.session_id);
                request.params = vec![json!(user_agent), json!(sid), json!(client_ip_long)];
            }

            ProtocolType::EthereumStratum
            | ProtocolType::EthereumStratumNiceHash
            | ProtocolType::EthereumProxy => {
                if let Some(ua) = request.params.first().and_then(Value::as_str) {
                    user_agent = ua.to_string();
                }
                if let Some(p) = request.params.get(1).and_then(Value::as_str) {
                    protocol = p.to_string();
                }
                // Session ID in slot 3, miner IP in slot 4.
                request.params = vec![
                    json!(user_agent),
                    json!(protocol),
                    json!(self.id_string),
                    json!(client_ip_long),
                ];
            }

            ProtocolType::Unknown => {
                error!("unimplemented stratum protocol");
                return Err(SwitcherError::ParseSubscribeResponseFailed);
            }
        }
        debug!("user agent: {}; protocol: {}", user_agent, protocol);

        let request = request.clone();
        let server = st.server.clone().expect("server connected");
        self.write_request_to_server(&server, &request).await?;
        Ok((user_agent, protocol))
    }

    fn user_suffix(&self, st: &SessionState) -> String {
        self.manager
            .server_info(&st.mining_coin)
            .map(|info| info.user_suffix)
            .unwrap_or_else(|| st.mining_coin.clone())
    }

    async fn send_mining_authorize(&self, st: &SessionState, with_suffix: bool) -> Result<String> {
        let auth = st
            .authorize_request
            .as_ref()
            .ok_or_else(|| SwitcherError::Protocol("missing authorize request".into()))?;

        let worker_name = if with_suffix {
            format!(
                "{}_{}{}",
                st.subaccount_name,
                self.user_suffix(st),
                st.miner_name_with_dot
            )
        } else {
            st.full_worker_name.clone()
        };

        let mut request = Request {
            id: json!("auth"),
            method: auth.method.clone(),
            params: auth.params.clone(),
            worker: String::new(),
        };
        if request.params.is_empty() {
            request.params.push(json!(worker_name));
        } else {
            request.params[0] = json!(worker_name);
        }

        let server = st.server.clone().expect("server connected");
        self.write_request_to_server(&server, &request).await?;
        Ok(worker_name)
    }

    /// Sends configure/subscribe/authorize and consumes upstream responses
    /// until both subscribe and authorization resolve, bounded by a single
    /// 10-second budget. A failed plain authorize triggers one retry with
    /// the `<sub-account>_<suffix>` spelling.
    pub(crate) async fn server_subscribe_and_authorize(
        &self,
        st: &mut SessionState,
    ) -> Result<()> {
        self.send_mining_configure(st).await?;
        let (user_agent, protocol) = self.send_mining_subscribe(st).await?;
        let mut auth_worker_name = self.send_mining_authorize(st, false).await?;

        let exchange = async {
            let mut allowed_version_mask = 0u32;
            let mut auth_response: Option<Response> = None;
            let mut auth_msg_counter = 0u32;
            let mut auth_success = false;

            // The loop ends when authorization has fully resolved.
            while auth_msg_counter < 2 {
                let line = st
                    .server_reader
                    .as_mut()
                    .expect("server reader present")
                    .read_line()
                    .await?;

                let parsed = serde_json::from_slice::<Response>(&line);
                if let Ok(response) = parsed {
                    // An id-less frame is a notification, handled below.
                    if !response.id.is_null() {
                        let id_tag = response.id.as_str().map(str::to_owned);
                        match id_tag.as_deref() {
                            Some("configure") => {}
                            Some("subscribe") => {
                                self.handle_server_subscribe_response(st, &response)?
                            }
                            Some("auth") => {
                                auth_msg_counter += 1;
                                let success = response.result.as_bool().unwrap_or(false);
                                if success || !auth_success {
                                    auth_response = Some(response);
                                }
                                if success {
                                    auth_success = true;
                                    // No further authorize needed.
                                    auth_msg_counter = 2;
                                } else if auth_msg_counter == 1 {
                                    // Retry with the currency suffix.
                                    auth_worker_name =
                                        self.send_mining_authorize(st, true).await?;
                                }
                            }
                            other => {
                                warn!("server response ID is not a known tag: {:?}", other)
                            }
                        }
                        continue;
                    }
                }

                if let Ok(notify) = serde_json::from_slice::<Request>(&line) {
                    if notify.method == "mining.set_version_mask" {
                        if let Some(mask_str) = notify.params.first().and_then(Value::as_str) {
                            if let Ok(mask) = u32::from_str_radix(mask_str, 16) {
                                allowed_version_mask = mask;
                            }
                        }
                    }
                }
            }

            Ok::<(bool, u32, Option<Response>), SwitcherError>((
                auth_success,
                allowed_version_mask,
                auth_response,
            ))
        };

        let (auth_success, allowed_version_mask, auth_response) =
            match tokio::time::timeout(READ_SERVER_RESPONSE_TIMEOUT, exchange).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    warn!(
                        "authorize failed: {}; {}; {}; {}",
                        self.client_addr, st.mining_coin, auth_worker_name, e
                    );
                    return Err(e);
                }
                Err(_) => {
                    warn!("authorize timeout: {}; {}", self.client_addr, st.mining_coin);
                    return Err(SwitcherError::ReadTimeout);
                }
            };

        // Forward the (possibly second) authorize response to the miner.
        let mut response = auth_response.unwrap_or_default();
        response.id = Self::auth_request_id(st);
        self.write_response_to_client(&response, st.rpc_version)
            .await?;

        if auth_success && st.version_mask != 0 {
            let mask = allowed_version_mask & st.version_mask;
            let notify = Request {
                id: Value::Null,
                method: "mining.set_version_mask".to_string(),
                params: vec![json!(format!("{mask:08x}"))],
                worker: String::new(),
            };
            self.write_notify_to_client(&notify).await?;
        }

        if !auth_success {
            warn!(
                "authorize failed: {}; {}; {}; {}; {:08x}; {}",
                self.client_addr,
                st.mining_coin,
                auth_worker_name,
                user_agent,
                st.version_mask,
                protocol
            );
            return Err(SwitcherError::AuthorizeFailed);
        }

        info!(
            "authorize success: {}; {}; {}; {}; {:08x}; {}",
            self.client_addr, st.mining_coin, auth_worker_name, user_agent, st.version_mask, protocol
        );
        Ok(())
    }

    /// Verifies that the upstream echoed our pre-allocated session ID. A
    /// mismatch means every share mined from here on would be misattributed,
    /// most likely because the upstream is not built for pre-allocated
    /// session IDs, so the session is torn down.
    fn handle_server_subscribe_response(
        &self,
        st: &SessionState,
        response: &Response,
    ) -> Result<()> {
        match st.protocol {
            ProtocolType::BitcoinStratum => {
                let result = response.result.as_array().ok_or_else(|| {
                    warn!("parse subscribe response failed: result is not an array");
                    SwitcherError::ParseSubscribeResponseFailed
                })?;
                if result.len() < 2 {
                    warn!("too few fields in subscribe response result: {:?}", result);
                    return Err(SwitcherError::ParseSubscribeResponseFailed);
                }
                let session_id = result[1].as_str().ok_or_else(|| {
                    warn!("parse subscribe response failed: result[1] is not a string");
                    SwitcherError::ParseSubscribeResponseFailed
                })?;
                if session_id != self.id_string {
                    warn!(
                        "session ID mismatched: {} != {}",
                        session_id, self.id_string
                    );
                    return Err(SwitcherError::SessionIdInconformity);
                }
            }

            ProtocolType::EthereumStratumNiceHash => {
                let result = response.result.as_array().ok_or_else(|| {
                    warn!("parse subscribe response failed: result is not an array");
                    SwitcherError::ParseSubscribeResponseFailed
                })?;
                if result.len() < 2 {
                    warn!("too few fields in subscribe response result: {:?}", result);
                    return Err(SwitcherError::ParseSubscribeResponseFailed);
                }
                let session_id = result[0]
                    .as_array()
                    .and_then(|notify| notify.get(1))
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        warn!("parse subscribe response failed: result[0][1] is not a string");
                        SwitcherError::ParseSubscribeResponseFailed
                    })?;
                let extra_nonce = result[1].as_str().ok_or_else(|| {
                    warn!("parse subscribe response failed: result[1] is not a string");
                    SwitcherError::ParseSubscribeResponseFailed
                })?;

                let mut expected_extra_nonce = self.id_string.clone();
                if st.is_nicehash_client {
                    expected_extra_nonce.truncate(4);
                }

                if session_id != self.id_string {
                    warn!(
                        "session ID mismatched: {} != {}",
                        session_id, self.id_string
                    );
                    return Err(SwitcherError::SessionIdInconformity);
                }
                if extra_nonce != expected_extra_nonce {
                    warn!(
                        "extra nonce mismatched: {} != {}",
                        extra_nonce, expected_extra_nonce
                    );
                    return Err(SwitcherError::SessionIdInconformity);
                }
            }

            ProtocolType::EthereumStratum | ProtocolType::EthereumProxy => {
                if !response.result.as_bool().unwrap_or(false) {
                    warn!("parse subscribe response failed: response is {:?}", response);
                    return Err(SwitcherError::ParseSubscribeResponseFailed);
                }
            }

            ProtocolType::Unknown => {
                error!("unimplemented stratum protocol");
                return Err(SwitcherError::ParseSubscribeResponseFailed);
            }
        }

        debug!("subscribe success: {:?}", response);
        Ok(())
    }
}
