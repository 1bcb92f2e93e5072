//! Test doubles: an in-memory coordinator store and a mock sserver.
//!
//! Both are used by the integration tests to exercise the full proxy path
//! without a ZooKeeper cluster or a real mining pool.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use crate::coordinator::{KvStore, WatchEvent, WatchFuture};
use crate::error::{Result, SwitcherError};

/// In-memory hierarchical key-value store with single-shot watches.
#[derive(Default)]
pub struct MemoryStore {
    nodes: Mutex<HashMap<String, Vec<u8>>>,
    watchers: Mutex<HashMap<String, Vec<oneshot::Sender<WatchEvent>>>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates or overwrites a node, firing any armed watches.
    pub fn put(&self, path: &str, data: &[u8]) {
        self.nodes
            .lock()
            .unwrap()
            .insert(path.to_string(), data.to_vec());
        self.fire(path, WatchEvent::DataChanged);
    }

    /// Deletes a node, firing any armed watches.
    pub fn remove(&self, path: &str) {
        self.nodes.lock().unwrap().remove(path);
        self.fire(path, WatchEvent::Deleted);
    }

    pub fn value(&self, path: &str) -> Option<Vec<u8>> {
        self.nodes.lock().unwrap().get(path).cloned()
    }

    fn fire(&self, path: &str, event: WatchEvent) {
        if let Some(senders) = self.watchers.lock().unwrap().remove(path) {
            for tx in senders {
                let _ = tx.send(event);
            }
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.nodes.lock().unwrap().contains_key(path))
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.nodes
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| SwitcherError::NoNode(path.to_string()))
    }

    async fn get_watch(&self, path: &str) -> Result<(Vec<u8>, WatchFuture)> {
        let value = {
            let nodes = self.nodes.lock().unwrap();
            nodes
                .get(path)
                .cloned()
                .ok_or_else(|| SwitcherError::NoNode(path.to_string()))?
        };
        let (tx, rx) = oneshot::channel();
        self.watchers
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push(tx);
        let watch: WatchFuture =
            Box::pin(async move { rx.await.unwrap_or(WatchEvent::Session) });
        Ok((value, watch))
    }

    async fn create(&self, path: &str, data: &[u8], _ephemeral: bool) -> Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        if nodes.contains_key(path) {
            return Err(SwitcherError::NodeExists(path.to_string()));
        }
        nodes.insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let nodes = self.nodes.lock().unwrap();
        Ok(nodes
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(|rest| rest.to_string())
            .collect())
    }

    async fn set(&self, path: &str, data: &[u8], _expected_version: Option<i32>) -> Result<()> {
        {
            let mut nodes = self.nodes.lock().unwrap();
            if !nodes.contains_key(path) {
                return Err(SwitcherError::NoNode(path.to_string()));
            }
            nodes.insert(path.to_string(), data.to_vec());
        }
        self.fire(path, WatchEvent::DataChanged);
        Ok(())
    }
}

/// How the mock sserver answers `mining.authorize`.
#[derive(Debug, Clone, Default)]
pub enum AuthPolicy {
    #[default]
    AcceptAll,
    /// Only accept worker names whose sub-account part carries
    /// `_<suffix>`, forcing the proxy through its retry-with-suffix path.
    RequireSuffix(String),
}

#[derive(Debug, Clone)]
pub struct SserverOptions {
    /// Sent in a `mining.notify` right after a successful authorize so tests
    /// can tell which upstream a client is attached to.
    pub tag: String,
    pub auth_policy: AuthPolicy,
    /// Ethereum-style subscribe handling (session ID in params\[2\]).
    pub ethereum: bool,
}

impl Default for SserverOptions {
    fn default() -> Self {
        Self {
            tag: "pool".to_string(),
            auth_policy: AuthPolicy::AcceptAll,
            ethereum: false,
        }
    }
}

/// A minimal upstream Stratum server, built with pre-allocated session ID
/// support: it echoes the session ID the proxy announces in subscribe.
pub struct MockSserver {
    pub addr: SocketAddr,
    options: SserverOptions,
    received: Mutex<Vec<Value>>,
}

impl MockSserver {
    pub async fn start(options: SserverOptions) -> std::io::Result<Arc<Self>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let server = Arc::new(Self {
            addr: listener.local_addr()?,
            options,
            received: Mutex::new(Vec::new()),
        });

        let accept = Arc::clone(&server);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let server = Arc::clone(&accept);
                tokio::spawn(async move {
                    let _ = server.serve(stream).await;
                });
            }
        });
        Ok(server)
    }

    /// Every request this upstream has seen, in order.
    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_methods(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|v| v["method"].as_str().map(str::to_string))
            .collect()
    }

    fn authorize_ok(&self, worker: &str) -> bool {
        match &self.options.auth_policy {
            AuthPolicy::AcceptAll => true,
            AuthPolicy::RequireSuffix(suffix) => {
                let subaccount = worker.split('.').next().unwrap_or("");
                subaccount.ends_with(&format!("_{suffix}"))
            }
        }
    }

    async fn serve(&self, stream: TcpStream) -> std::io::Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();

        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }
            let Ok(request) = serde_json::from_str::<Value>(line.trim()) else {
                continue;
            };
            self.received.lock().unwrap().push(request.clone());

            let id = request["id"].clone();
            let mut replies: Vec<Value> = Vec::new();

            match request["method"].as_str().unwrap_or_default() {
                "mining.configure" => {
                    let mask = request["params"][1]["version-rolling.mask"]
                        .as_str()
                        .unwrap_or("1fffe000")
                        .to_string();
                    replies.push(json!({
                        "id": id,
                        "result": {"version-rolling": true, "version-rolling.mask": mask},
                        "error": null,
                    }));
                    replies.push(json!({
                        "id": null,
                        "method": "mining.set_version_mask",
                        "params": [mask],
                    }));
                }
                "mining.subscribe" => {
                    if self.options.ethereum {
                        let user_agent =
                            request["params"][0].as_str().unwrap_or_default().to_string();
                        let protocol =
                            request["params"][1].as_str().unwrap_or_default().to_string();
                        let session_id =
                            request["params"][2].as_str().unwrap_or_default().to_string();
                        if protocol.to_lowercase().starts_with("ethereumstratum/") {
                            let extra_nonce = if user_agent.to_lowercase().starts_with("nicehash/")
                            {
                                session_id[..4.min(session_id.len())].to_string()
                            } else {
                                session_id.clone()
                            };
                            replies.push(json!({
                                "id": id,
                                "result": [
                                    ["mining.notify", session_id, "EthereumStratum/1.0.0"],
                                    extra_nonce,
                                ],
                                "error": null,
                            }));
                        } else {
                            replies.push(json!({"id": id, "result": true, "error": null}));
                        }
                    } else {
                        let session_id =
                            request["params"][1].as_str().unwrap_or_default().to_string();
                        replies.push(json!({
                            "id": id,
                            "result": [
                                [
                                    ["mining.set_difficulty", session_id],
                                    ["mining.notify", session_id],
                                ],
                                session_id,
                                8,
                            ],
                            "error": null,
                        }));
                    }
                }
                "mining.authorize" | "eth_submitLogin" => {
                    let worker = request["params"][0].as_str().unwrap_or_default();
                    if self.authorize_ok(worker) {
                        replies.push(json!({"id": id, "result": true, "error": null}));
                        replies.push(json!({
                            "id": null,
                            "method": "mining.notify",
                            "params": [self.options.tag.clone()],
                        }));
                    } else {
                        replies.push(json!({
                            "id": id,
                            "result": false,
                            "error": [24, "unauthorized worker", null],
                        }));
                    }
                }
                "mining.submit" => {
                    replies.push(json!({"id": id, "result": true, "error": null}));
                }
                _ => {}
            }

            for reply in replies {
                let mut bytes = serde_json::to_vec(&reply)?;
                bytes.push(b'\n');
                write_half.write_all(&bytes).await?;
            }
        }
    }
}
