//! Coordinator client: a thin layer over a hierarchical key-value store
//! (ZooKeeper in production, an in-memory store in tests) that adds the
//! watch fan-out sessions rely on.
//!
//! The store hands out one single-shot watch per read; it does not free the
//! watch until the event fires. Many sessions may watch the same sub-account
//! path, so the client keeps one underlying watch per path and fans its
//! event out to per-session delivery channels. Releasing a session's
//! subscription only removes its channel; the underlying watch survives
//! until its event fires, because dropping it early would leak watches
//! inside the store.

pub mod zk;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};

use crate::error::Result;

/// What happened to a watched node. Sessions only use this as a wake-up
/// signal; the kind is informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    DataChanged,
    Deleted,
    /// Session-level event from the store (expiry, disconnect).
    Session,
}

pub type WatchFuture = Pin<Box<dyn Future<Output = WatchEvent> + Send>>;

/// The store interface the coordinator client consumes.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn exists(&self, path: &str) -> Result<bool>;
    async fn get(&self, path: &str) -> Result<Vec<u8>>;
    /// Reads a node and arms a single-shot watch on it.
    async fn get_watch(&self, path: &str) -> Result<(Vec<u8>, WatchFuture)>;
    async fn create(&self, path: &str, data: &[u8], ephemeral: bool) -> Result<()>;
    async fn children(&self, path: &str) -> Result<Vec<String>>;
    async fn set(&self, path: &str, data: &[u8], expected_version: Option<i32>) -> Result<()>;
}

struct NodeWatcher {
    value: Vec<u8>,
    channels: HashMap<u32, oneshot::Sender<WatchEvent>>,
}

pub struct Coordinator {
    self_ref: Weak<Coordinator>,
    store: Arc<dyn KvStore>,
    watchers: Mutex<HashMap<String, NodeWatcher>>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn KvStore>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            store,
            watchers: Mutex::new(HashMap::new()),
        })
    }

    /// Reads `path` and registers `session_id` for its next change event.
    ///
    /// The returned receiver fires at most once and then closes; a closed
    /// receiver (subscription released, or the event was consumed by the
    /// fan-out) wakes the caller the same way an event does.
    pub async fn get_w(
        &self,
        path: &str,
        session_id: u32,
    ) -> Result<(Vec<u8>, oneshot::Receiver<WatchEvent>)> {
        let mut watchers = self.watchers.lock().await;

        if !watchers.contains_key(path) {
            let (value, watch) = self.store.get_watch(path).await?;
            watchers.insert(
                path.to_string(),
                NodeWatcher {
                    value,
                    channels: HashMap::new(),
                },
            );
            tracing::debug!(path, "coordinator: add node watcher");

            let this = self.self_ref.upgrade().expect("coordinator is alive");
            let watched_path = path.to_string();
            tokio::spawn(async move {
                let event = watch.await;
                let mut watchers = this.watchers.lock().await;
                if let Some(watcher) = watchers.remove(&watched_path) {
                    for (_, tx) in watcher.channels {
                        let _ = tx.send(event);
                    }
                }
                tracing::debug!(path = %watched_path, "coordinator: release node watcher");
            });
        }

        let watcher = watchers
            .get_mut(path)
            .expect("node watcher inserted above");
        let (tx, rx) = oneshot::channel();
        watcher.channels.insert(session_id, tx);
        tracing::debug!(path, session_id, "coordinator: add watcher channel");

        Ok((watcher.value.clone(), rx))
    }

    /// Drops a session's delivery channel. The underlying watch is left in
    /// place until its event fires.
    pub async fn release_w(&self, path: &str, session_id: u32) {
        let mut watchers = self.watchers.lock().await;
        if let Some(watcher) = watchers.get_mut(path) {
            if watcher.channels.remove(&session_id).is_some() {
                tracing::debug!(path, session_id, "coordinator: release watcher channel");
            }
        }
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        self.store.exists(path).await
    }

    pub async fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.store.get(path).await
    }

    pub async fn create(&self, path: &str, data: &[u8]) -> Result<()> {
        self.store.create(path, data, false).await
    }

    pub async fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<()> {
        self.store.create(path, data, true).await
    }

    pub async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.store.children(path).await
    }

    pub async fn set(&self, path: &str, data: &[u8], expected_version: Option<i32>) -> Result<()> {
        self.store.set(path, data, expected_version).await
    }

    /// Creates every path segment that does not exist yet, like `mkdir -p`.
    pub async fn create_recursive(&self, path: &str) -> Result<()> {
        let mut current = String::new();
        for dir in path.trim_matches('/').split('/') {
            if dir.is_empty() {
                continue;
            }
            current.push('/');
            current.push_str(dir);

            if self.exists(&current).await? {
                continue;
            }
            self.create(&current, &[]).await?;
            tracing::info!("created coordinator path: {}", current);
        }
        Ok(())
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::mock::MemoryStore;
    use std::time::Duration;

    #[tokio::test]
    async fn fans_out_one_event_to_every_subscriber() {
        let store = MemoryStore::new();
        store.put("/w/alice", b"btc");
        let coordinator = Coordinator::new(store.clone());

        let (v1, rx1) = coordinator.get_w("/w/alice", 1).await.unwrap();
        let (v2, rx2) = coordinator.get_w("/w/alice", 2).await.unwrap();
        assert_eq!(v1, b"btc");
        assert_eq!(v2, b"btc");

        store.put("/w/alice", b"bch");

        let e1 = tokio::time::timeout(Duration::from_secs(1), rx1)
            .await
            .unwrap()
            .unwrap();
        let e2 = tokio::time::timeout(Duration::from_secs(1), rx2)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(e1, WatchEvent::DataChanged);
        assert_eq!(e2, WatchEvent::DataChanged);

        // The watcher removed itself; a fresh get_w arms a new one.
        let (v3, _rx3) = coordinator.get_w("/w/alice", 1).await.unwrap();
        assert_eq!(v3, b"bch");
    }

    #[tokio::test]
    async fn releasing_one_channel_keeps_the_others() {
        let store = MemoryStore::new();
        store.put("/w/alice", b"btc");
        let coordinator = Coordinator::new(store.clone());

        let (_, rx1) = coordinator.get_w("/w/alice", 1).await.unwrap();
        let (_, rx2) = coordinator.get_w("/w/alice", 2).await.unwrap();

        coordinator.release_w("/w/alice", 1).await;

        // Session 1's channel closes without an event.
        assert!(tokio::time::timeout(Duration::from_secs(1), rx1)
            .await
            .unwrap()
            .is_err());

        store.remove("/w/alice");
        let event = tokio::time::timeout(Duration::from_secs(1), rx2)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, WatchEvent::Deleted);
    }

    #[tokio::test]
    async fn missing_node_is_an_error_and_arms_nothing() {
        let store = MemoryStore::new();
        let coordinator = Coordinator::new(store.clone());
        assert!(coordinator.get_w("/w/ghost", 1).await.is_err());
        coordinator.release_w("/w/ghost", 1).await;
    }

    #[tokio::test]
    async fn create_recursive_builds_the_whole_chain() {
        let store = MemoryStore::new();
        let coordinator = Coordinator::new(store.clone());
        coordinator
            .create_recursive("/switcher/server-id-assign/")
            .await
            .unwrap();
        assert!(coordinator.exists("/switcher").await.unwrap());
        assert!(coordinator
            .exists("/switcher/server-id-assign")
            .await
            .unwrap());
    }
}
