//! Pure-proxy mode: two byte-copy tasks plus the currency watcher, all
//! fenced by the reconnect epoch.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{
    RunningState, Session, SessionState, COORDINATOR_RETRY_SLEEP, RECEIVE_MESSAGE_TIMEOUT,
    RECONNECT_RETRY_SLEEP, RETRY_TIME_WHEN_SERVER_DOWN,
};
use crate::net::{LineReader, READER_BUF_SIZE};

impl Session {
    /// Enters pure-proxy mode: registers the session and spawns the two
    /// relay tasks and the currency watcher for the current epoch.
    pub(crate) async fn proxy_stratum(self: Arc<Self>) {
        if self.running_state().await != RunningState::Running {
            info!("proxy stratum: session stopped by another task");
            return;
        }

        self.manager.register(&self);

        self.spawn_upstream_to_client();
        self.spawn_client_to_upstream();
        self.spawn_coin_watcher();
    }

    /// Upstream → client. Drains whatever the handshake left in the server
    /// reader first; the buffered reader may have captured frames past the
    /// handshake and those must not be lost.
    fn spawn_upstream_to_client(&self) {
        let session = self.arc();
        tokio::spawn(async move {
            let (epoch, server, leftover) = {
                let mut st = session.state.lock().await;
                let Some(server) = st.server.clone() else {
                    return;
                };
                let leftover = st
                    .server_reader
                    .take()
                    .map(|mut reader| reader.take_buffered())
                    .unwrap_or_default();
                (st.reconnect_counter, server, leftover)
            };

            if !leftover.is_empty() && session.client.write_all(&leftover).await.is_err() {
                session.try_stop(epoch).await;
                return;
            }

            let mut buf = [0u8; READER_BUF_SIZE];
            loop {
                match tokio::time::timeout(RECEIVE_MESSAGE_TIMEOUT, server.read_some(&mut buf))
                    .await
                {
                    // Liveness tick: resume reading unless the session moved on.
                    Err(_) => {
                        let st = session.state.lock().await;
                        if st.running == RunningState::Stopped || st.reconnect_counter != epoch {
                            break;
                        }
                    }
                    Ok(Ok(0)) | Ok(Err(_)) => {
                        // Upstream closed. BTCAgent sessions cannot be
                        // re-homed, so they stop instead of reconnecting.
                        if !session.is_btc_agent().await {
                            session.try_reconnect(epoch).await;
                        } else {
                            session.try_stop(epoch).await;
                        }
                        break;
                    }
                    Ok(Ok(n)) => {
                        if session.client.write_all(&buf[..n]).await.is_err() {
                            session.try_stop(epoch).await;
                            break;
                        }
                    }
                }
            }
            debug!("downstream: exited; {}", session.client_addr);
        });
    }

    /// Client → upstream. On a failed upstream write the last-read frame is
    /// kept and forwarded to the freshly connected upstream, so a frame that
    /// arrived right before a switch is not lost.
    fn spawn_client_to_upstream(&self) {
        let session = self.arc();
        tokio::spawn(async move {
            let (epoch, server, leftover) = {
                let mut st = session.state.lock().await;
                let Some(server) = st.server.clone() else {
                    return;
                };
                let leftover = st
                    .client_reader
                    .take()
                    .map(|mut reader| reader.take_buffered())
                    .unwrap_or_default();
                (st.reconnect_counter, server, leftover)
            };

            if !leftover.is_empty() {
                let _ = server.write_all(&leftover).await;
            }

            let mut buf = [0u8; READER_BUF_SIZE];
            loop {
                match tokio::time::timeout(
                    RECEIVE_MESSAGE_TIMEOUT,
                    session.client.read_some(&mut buf),
                )
                .await
                {
                    Err(_) => {
                        let st = session.state.lock().await;
                        if st.running == RunningState::Stopped || st.reconnect_counter != epoch {
                            break;
                        }
                    }
                    // Client gone: the session is over.
                    Ok(Ok(0)) | Ok(Err(_)) => {
                        session.try_stop(epoch).await;
                        break;
                    }
                    Ok(Ok(n)) => {
                        if server.write_all(&buf[..n]).await.is_err() {
                            if !session.is_btc_agent().await {
                                session.try_reconnect(epoch).await;
                                // Whoever won the reconnect, hand the pending
                                // frame to the current upstream.
                                let current = {
                                    let st = session.state.lock().await;
                                    if st.running == RunningState::Running {
                                        st.server.clone()
                                    } else {
                                        None
                                    }
                                };
                                if let Some(current) = current {
                                    let _ = current.write_all(&buf[..n]).await;
                                }
                            } else {
                                session.try_stop(epoch).await;
                            }
                            break;
                        }
                    }
                }
            }
            debug!("upstream: exited; {}", session.client_addr);
        });
    }

    /// Waits on the coordinator watch and reacts to currency changes. The
    /// task exits after driving (or skipping) one switch; the next epoch's
    /// `proxy_stratum` starts a fresh one.
    fn spawn_coin_watcher(&self) {
        let session = self.arc();
        tokio::spawn(async move {
            let epoch = session.reconnect_counter().await;

            loop {
                let watch_rx = session.state.lock().await.watch_rx.take();
                if let Some(watch_rx) = watch_rx {
                    // Fires on the node event, or wakes immediately with an
                    // error when the subscription was released.
                    let _ = watch_rx.await;
                }

                if !session.is_running().await {
                    break;
                }
                if session.reconnect_counter().await != epoch {
                    break;
                }

                let path = session.state.lock().await.watch_path.clone();
                let (data, watch_rx) = match session
                    .manager
                    .coordinator()
                    .get_w(&path, session.session_id)
                    .await
                {
                    Ok(read) => read,
                    Err(e) => {
                        warn!(
                            "read from coordinator failed, sleep {:?}: {}: {}",
                            COORDINATOR_RETRY_SLEEP, path, e
                        );
                        tokio::time::sleep(COORDINATOR_RETRY_SLEEP).await;
                        continue;
                    }
                };

                let new_coin = String::from_utf8_lossy(&data).into_owned();
                let current_coin = {
                    let mut st = session.state.lock().await;
                    st.watch_rx = Some(watch_rx);
                    st.mining_coin.clone()
                };

                if new_coin == current_coin {
                    debug!("mining coin not changed: {}", current_coin);
                    continue;
                }
                if session.manager.server_info(&new_coin).is_none() {
                    warn!("stratum server not found for new mining coin: {}", new_coin);
                    continue;
                }

                info!(
                    "mining coin changed: {}; {} -> {}; {}",
                    session.client_addr, current_coin, new_coin, epoch
                );

                if session.is_btc_agent().await {
                    // A BTCAgent connection multiplexes many logical mining
                    // sessions with upstream-held state; swapping upstreams
                    // under it is unsafe. Disconnect and let it redial.
                    session.try_stop(epoch).await;
                } else {
                    metrics::counter!("coin_switches_total").increment(1);
                    session.switch_coin_type(new_coin, epoch).await;
                }
                break;
            }
            debug!("coin watcher: exited; {}", session.client_addr);
        });
    }

    /// Stops the session unless another task has already driven a reconnect
    /// past `epoch`.
    pub(crate) async fn try_stop(&self, epoch: u32) -> bool {
        let st = self.state.lock().await;
        if st.running != RunningState::Running {
            return false;
        }
        if st.reconnect_counter == epoch {
            drop(st);
            let session = self.arc();
            tokio::spawn(async move { session.stop().await });
            return true;
        }
        false
    }

    /// Transitions into `Reconnecting` and drives the reconnect, unless a
    /// concurrent task already advanced the epoch. The session lock is held
    /// through the whole reconnect so stop/switch cannot interleave.
    pub(crate) async fn try_reconnect(&self, epoch: u32) -> bool {
        let mut st = self.state.lock().await;
        if st.running != RunningState::Running {
            return false;
        }
        if st.reconnect_counter != epoch {
            return false;
        }

        st.running = RunningState::Reconnecting;
        st.reconnect_counter += 1;
        info!("reconnect server: {}; {}", self.client_addr, st.mining_coin);
        metrics::counter!("upstream_reconnects_total").increment(1);

        self.reconnect_stratum_server(&mut st, RETRY_TIME_WHEN_SERVER_DOWN)
            .await;
        true
    }

    /// Reacts to a coordinator-driven currency change.
    async fn switch_coin_type(&self, new_coin: String, epoch: u32) {
        let mut st = self.state.lock().await;
        if st.running != RunningState::Running {
            warn!("switch coin type: session not running");
            return;
        }
        if st.reconnect_counter != epoch {
            warn!("switch coin type: session reconnected by another task");
            return;
        }

        st.mining_coin = new_coin;
        st.running = RunningState::Reconnecting;
        st.reconnect_counter += 1;

        self.reconnect_stratum_server(&mut st, RETRY_TIME_WHEN_SERVER_DOWN)
            .await;
    }

    /// Tears down the old upstream and dials the current coin's server, up
    /// to `retries` extra attempts, one second apart. The client socket is
    /// untouched throughout.
    async fn reconnect_stratum_server(&self, st: &mut SessionState, retries: usize) {
        // The session keeps its ID but leaves the registry while between
        // upstreams; this also releases the coordinator watch channel.
        self.manager
            .unregister(self.session_id, &st.watch_path)
            .await;

        // Flush any bytes the old upstream had in flight toward the client.
        if let Some(mut reader) = st.server_reader.take() {
            let leftover = reader.take_buffered();
            if !leftover.is_empty() {
                let _ = self.client.write_all(&leftover).await;
            }
        }
        if let Some(server) = st.server.take() {
            server.shutdown();
        }

        if st.client_reader.is_none() {
            st.client_reader = Some(LineReader::new(Arc::clone(&self.client)));
        }

        let mut result = Ok(());
        for attempt in 0..=retries {
            result = self.connect_stratum_server(st).await;
            if result.is_ok() {
                break;
            }
            if attempt < retries {
                tokio::time::sleep(RECONNECT_RETRY_SLEEP).await;
            }
        }

        if let Err(e) = result {
            info!(
                "reconnect server failed: {}; {}; {}",
                self.client_addr, st.mining_coin, e
            );
            // Stop asynchronously: the session lock is still held here.
            let session = self.arc();
            tokio::spawn(async move { session.stop().await });
            return;
        }

        st.running = RunningState::Running;

        let session = self.arc();
        tokio::spawn(session.proxy_stratum());

        info!(
            "reconnect server success: {}; {}",
            self.client_addr, st.mining_coin
        );
    }
}
