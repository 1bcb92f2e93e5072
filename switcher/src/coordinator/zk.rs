//! ZooKeeper-backed store.
//!
//! Connection policy: the session liveness timeout is short (5s) so a dead
//! broker is noticed quickly, but the initial connect is given a generous
//! total budget (60s) to ride out elections. Failing to connect inside the
//! budget is fatal for the process.

use std::time::Duration;

use async_trait::async_trait;
use zookeeper_client as zk;

use super::{KvStore, WatchEvent, WatchFuture};
use crate::error::{Result, SwitcherError};

const SESSION_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

pub struct ZkStore {
    client: zk::Client,
}

impl ZkStore {
    pub async fn connect(brokers: &[String]) -> Result<Self> {
        let cluster = brokers.join(",");
        tracing::info!("coordinator: connecting to {}", cluster);

        let mut connector = zk::Client::connector();
        connector.session_timeout(SESSION_TIMEOUT);
        let connect = connector.connect(&cluster);
        let client = tokio::time::timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| SwitcherError::Coordinator("connecting timeout".into()))?
            .map_err(|e| SwitcherError::Coordinator(e.to_string()))?;

        tracing::info!("coordinator: connected");
        Ok(Self { client })
    }
}

fn map_err(path: &str, err: zk::Error) -> SwitcherError {
    match err {
        zk::Error::NoNode => SwitcherError::NoNode(path.to_string()),
        zk::Error::NodeExists => SwitcherError::NodeExists(path.to_string()),
        other => SwitcherError::Coordinator(other.to_string()),
    }
}

fn map_event(event: zk::WatchedEvent) -> WatchEvent {
    match event.event_type {
        zk::EventType::NodeDeleted => WatchEvent::Deleted,
        zk::EventType::NodeDataChanged => WatchEvent::DataChanged,
        _ => WatchEvent::Session,
    }
}

#[async_trait]
impl KvStore for ZkStore {
    async fn exists(&self, path: &str) -> Result<bool> {
        let stat = self
            .client
            .check_stat(path)
            .await
            .map_err(|e| map_err(path, e))?;
        Ok(stat.is_some())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let (data, _stat) = self
            .client
            .get_data(path)
            .await
            .map_err(|e| map_err(path, e))?;
        Ok(data)
    }

    async fn get_watch(&self, path: &str) -> Result<(Vec<u8>, WatchFuture)> {
        let (data, _stat, watcher) = self
            .client
            .get_and_watch_data(path)
            .await
            .map_err(|e| map_err(path, e))?;
        let watch: WatchFuture = Box::pin(async move { map_event(watcher.changed().await) });
        Ok((data, watch))
    }

    async fn create(&self, path: &str, data: &[u8], ephemeral: bool) -> Result<()> {
        let mode = if ephemeral {
            zk::CreateMode::Ephemeral
        } else {
            zk::CreateMode::Persistent
        };
        self.client
            .create(path, data, &mode.with_acls(zk::Acls::anyone_all()))
            .await
            .map_err(|e| map_err(path, e))?;
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.client
            .list_children(path)
            .await
            .map_err(|e| map_err(path, e))
    }

    async fn set(&self, path: &str, data: &[u8], expected_version: Option<i32>) -> Result<()> {
        self.client
            .set_data(path, data, expected_version)
            .await
            .map_err(|e| map_err(path, e))?;
        Ok(())
    }
}
