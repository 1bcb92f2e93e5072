//! End-to-end tests: a real listener and sessions proxying between scripted
//! miners and mock sservers, with the coordinator backed by the in-memory
//! store.

#![cfg(feature = "mock")]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use stratum_switcher::config::{
    AutoRegConfig, ChainType, Config, CoordinatorConfig, HttpDebugConfig, StratumServerInfo,
};
use stratum_switcher::coordinator::{Coordinator, KvStore};
use stratum_switcher::mock::{AuthPolicy, MemoryStore, MockSserver, SserverOptions};
use stratum_switcher::SessionManager;

const WATCH_DIR: &str = "/switcher/switcher-watch/";
const AUTO_REG_DIR: &str = "/switcher/auto-reg/";

struct Miner {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Miner {
    async fn connect(addr: std::net::SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer,
        })
    }

    async fn send(&mut self, message: &Value) -> Result<()> {
        let mut line = message.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Value> {
        let mut line = String::new();
        let n = tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .context("timed out waiting for a frame")??;
        if n == 0 {
            bail!("connection closed");
        }
        Ok(serde_json::from_str(line.trim())?)
    }

    /// Reads frames until one satisfies the predicate.
    async fn recv_until<F: Fn(&Value) -> bool>(&mut self, predicate: F) -> Result<Value> {
        for _ in 0..16 {
            let frame = self.recv().await?;
            if predicate(&frame) {
                return Ok(frame);
            }
        }
        bail!("expected frame never arrived");
    }

    async fn expect_closed(&mut self) -> Result<()> {
        let deadline = Duration::from_secs(10);
        let read = async {
            loop {
                let mut line = String::new();
                if self.reader.read_line(&mut line).await? == 0 {
                    return Ok::<(), anyhow::Error>(());
                }
            }
        };
        tokio::time::timeout(deadline, read)
            .await
            .context("connection was not closed")??;
        Ok(())
    }
}

fn test_config(
    server_id: u8,
    chain_type: ChainType,
    servers: &[(&str, std::net::SocketAddr)],
    auto_reg: bool,
) -> Config {
    let mut stratum_servers = HashMap::new();
    for (coin, addr) in servers {
        stratum_servers.insert(
            coin.to_string(),
            StratumServerInfo {
                url: addr.to_string(),
                user_suffix: coin.to_string(),
            },
        );
    }
    Config {
        server_id,
        chain_type,
        listen_addr: "127.0.0.1:0".to_string(),
        stratum_servers,
        coordinator: CoordinatorConfig {
            brokers: vec!["in-memory".to_string()],
            server_id_assign_dir: "/switcher/server-id-assign/".to_string(),
            switcher_watch_dir: WATCH_DIR.to_string(),
        },
        auto_reg: AutoRegConfig {
            enabled: auto_reg,
            watch_dir: AUTO_REG_DIR.to_string(),
            max_wait_users: 10,
        },
        http_debug: HttpDebugConfig::default(),
        stratum_server_case_insensitive: false,
        user_case_index_dir: String::new(),
    }
}

async fn start_switcher(
    store: &Arc<MemoryStore>,
    config: Config,
) -> Result<(Arc<SessionManager>, std::net::SocketAddr)> {
    let coordinator = Coordinator::new(Arc::clone(store) as Arc<dyn KvStore>);
    let manager = SessionManager::new(config, coordinator, 0).await?;
    let addr = manager.listen().await?;
    Ok((manager, addr))
}

/// 127.0.0.1 as the integer the proxy passes upstream.
const LOCALHOST_LONG: u32 = 0x7f000001;

#[tokio::test]
async fn bitcoin_happy_path() -> Result<()> {
    let sserver = MockSserver::start(SserverOptions {
        tag: "pool-btc".to_string(),
        ..Default::default()
    })
    .await?;

    let store = MemoryStore::new();
    store.put(&format!("{WATCH_DIR}alice"), b"btc");
    let (_manager, addr) =
        start_switcher(&store, test_config(3, ChainType::Bitcoin, &[("btc", sserver.addr)], false))
            .await?;

    let mut miner = Miner::connect(addr).await?;

    miner
        .send(&json!({"id":1,"method":"mining.subscribe","params":["cgminer/4.10.0"]}))
        .await?;
    let subscribe = miner.recv().await?;
    assert_eq!(subscribe["id"], 1);
    assert_eq!(subscribe["result"][1], "03000080");
    assert_eq!(subscribe["result"][2], 8);
    assert_eq!(subscribe["result"][0][0][0], "mining.set_difficulty");
    assert!(subscribe["error"].is_null());

    miner
        .send(&json!({"id":2,"method":"mining.authorize","params":["alice.rig1","x"]}))
        .await?;
    let auth = miner.recv().await?;
    assert_eq!(auth["id"], 2);
    assert_eq!(auth["result"], true);
    assert!(auth["error"].is_null());

    // The upstream's post-auth notify flows through untouched.
    let notify = miner
        .recv_until(|f| f["method"] == "mining.notify")
        .await?;
    assert_eq!(notify["params"][0], "pool-btc");

    // And bytes keep flowing both ways in pure-proxy mode.
    miner
        .send(&json!({"id":9,"method":"mining.submit","params":["alice.rig1","job"]}))
        .await?;
    let submit = miner.recv_until(|f| f["id"] == 9).await?;
    assert_eq!(submit["result"], true);

    // The upstream saw our rewritten subscribe and the plain authorize.
    let received = sserver.received();
    let upstream_subscribe = received
        .iter()
        .find(|r| r["method"] == "mining.subscribe")
        .expect("upstream subscribe");
    assert_eq!(upstream_subscribe["id"], "subscribe");
    assert_eq!(
        upstream_subscribe["params"],
        json!(["cgminer/4.10.0", "03000080", LOCALHOST_LONG])
    );
    let upstream_auth = received
        .iter()
        .find(|r| r["method"] == "mining.authorize")
        .expect("upstream authorize");
    assert_eq!(upstream_auth["id"], "auth");
    assert_eq!(upstream_auth["params"][0], "alice.rig1");
    Ok(())
}

#[tokio::test]
async fn authorize_retries_with_currency_suffix() -> Result<()> {
    let sserver = MockSserver::start(SserverOptions {
        tag: "pool-btc".to_string(),
        auth_policy: AuthPolicy::RequireSuffix("btc".to_string()),
        ..Default::default()
    })
    .await?;

    let store = MemoryStore::new();
    store.put(&format!("{WATCH_DIR}alice"), b"btc");
    let (_manager, addr) =
        start_switcher(&store, test_config(3, ChainType::Bitcoin, &[("btc", sserver.addr)], false))
            .await?;

    let mut miner = Miner::connect(addr).await?;
    miner
        .send(&json!({"id":1,"method":"mining.subscribe","params":["cgminer/4.10.0"]}))
        .await?;
    miner.recv().await?;
    miner
        .send(&json!({"id":2,"method":"mining.authorize","params":["alice.rig1","x"]}))
        .await?;

    // The miner only ever sees the successful (suffixed) response.
    let auth = miner.recv().await?;
    assert_eq!(auth["id"], 2);
    assert_eq!(auth["result"], true);

    let workers: Vec<String> = sserver
        .received()
        .iter()
        .filter(|r| r["method"] == "mining.authorize")
        .map(|r| r["params"][0].as_str().unwrap().to_string())
        .collect();
    assert_eq!(workers, vec!["alice.rig1", "alice_btc.rig1"]);
    Ok(())
}

#[tokio::test]
async fn currency_switch_rehomes_the_session() -> Result<()> {
    let btc = MockSserver::start(SserverOptions {
        tag: "pool-btc".to_string(),
        ..Default::default()
    })
    .await?;
    let bch = MockSserver::start(SserverOptions {
        tag: "pool-bch".to_string(),
        ..Default::default()
    })
    .await?;

    let store = MemoryStore::new();
    store.put(&format!("{WATCH_DIR}alice"), b"btc");
    let (_manager, addr) = start_switcher(
        &store,
        test_config(
            3,
            ChainType::Bitcoin,
            &[("btc", btc.addr), ("bch", bch.addr)],
            false,
        ),
    )
    .await?;

    let mut miner = Miner::connect(addr).await?;
    miner
        .send(&json!({"id":1,"method":"mining.subscribe","params":["cgminer/4.10.0"]}))
        .await?;
    miner.recv().await?;
    miner
        .send(&json!({"id":2,"method":"mining.authorize","params":["alice.rig1","x"]}))
        .await?;
    miner.recv().await?;
    miner
        .recv_until(|f| f["method"] == "mining.notify" && f["params"][0] == "pool-btc")
        .await?;

    // An external actor reassigns the sub-account.
    store.put(&format!("{WATCH_DIR}alice"), b"bch");

    // The same TCP connection starts receiving from the bch upstream: the
    // replayed authorize response comes through again, then bch's notify.
    miner
        .recv_until(|f| f["method"] == "mining.notify" && f["params"][0] == "pool-bch")
        .await?;

    // The new upstream was told the same pre-allocated session ID.
    let upstream_subscribe = bch
        .received()
        .iter()
        .find(|r| r["method"] == "mining.subscribe")
        .cloned()
        .expect("bch subscribe");
    assert_eq!(upstream_subscribe["params"][1], "03000080");

    // Relay still works after the switch.
    miner
        .send(&json!({"id":9,"method":"mining.submit","params":["alice.rig1","job"]}))
        .await?;
    let submit = miner.recv_until(|f| f["id"] == 9).await?;
    assert_eq!(submit["result"], true);
    assert!(bch
        .received()
        .iter()
        .any(|r| r["method"] == "mining.submit"));
    Ok(())
}

#[tokio::test]
async fn btc_agent_sessions_stop_on_currency_switch() -> Result<()> {
    let btc = MockSserver::start(SserverOptions {
        tag: "pool-btc".to_string(),
        ..Default::default()
    })
    .await?;
    let bch = MockSserver::start(SserverOptions {
        tag: "pool-bch".to_string(),
        ..Default::default()
    })
    .await?;

    let store = MemoryStore::new();
    store.put(&format!("{WATCH_DIR}alice"), b"btc");
    let (_manager, addr) = start_switcher(
        &store,
        test_config(
            3,
            ChainType::Bitcoin,
            &[("btc", btc.addr), ("bch", bch.addr)],
            false,
        ),
    )
    .await?;

    let mut miner = Miner::connect(addr).await?;
    miner
        .send(&json!({"id":1,"method":"mining.subscribe","params":["btccom-agent/0.1"]}))
        .await?;
    miner.recv().await?;
    miner
        .send(&json!({"id":2,"method":"mining.authorize","params":["alice.rig1","x"]}))
        .await?;
    miner.recv().await?;
    miner
        .recv_until(|f| f["method"] == "mining.notify" && f["params"][0] == "pool-btc")
        .await?;

    // A BTCAgent connection cannot be re-homed: the switch disconnects it.
    store.put(&format!("{WATCH_DIR}alice"), b"bch");
    miner.expect_closed().await?;
    Ok(())
}

#[tokio::test]
async fn nicehash_ethereum_handshake() -> Result<()> {
    let sserver = MockSserver::start(SserverOptions {
        tag: "pool-eth".to_string(),
        ethereum: true,
        ..Default::default()
    })
    .await?;

    let store = MemoryStore::new();
    store.put(&format!("{WATCH_DIR}alice"), b"eth");
    let (_manager, addr) = start_switcher(
        &store,
        test_config(1, ChainType::Ethereum, &[("eth", sserver.addr)], false),
    )
    .await?;

    let mut miner = Miner::connect(addr).await?;
    miner
        .send(&json!({
            "id":1,
            "method":"mining.subscribe",
            "params":["nicehash/1.0","EthereumStratum/1.0.0"]
        }))
        .await?;

    // 16 index bits, cursor seed 128: session 0x010080, NiceHash extranonce
    // truncated to 2 bytes.
    let subscribe = miner.recv().await?;
    assert_eq!(
        subscribe["result"],
        json!([["mining.notify", "010080", "EthereumStratum/1.0.0"], "0100"])
    );

    let eth_addr = "0x00d8c82Eb65124Ea3452CaC59B64aCC230AA3482";
    miner
        .send(&json!({
            "id":2,
            "method":"mining.authorize",
            "params":[format!("{eth_addr}.alice.rig1"), "x"]
        }))
        .await?;
    let auth = miner.recv().await?;
    assert_eq!(auth["id"], 2);
    assert_eq!(auth["result"], true);

    let upstream_subscribe = sserver
        .received()
        .iter()
        .find(|r| r["method"] == "mining.subscribe")
        .cloned()
        .expect("upstream subscribe");
    assert_eq!(
        upstream_subscribe["params"],
        json!(["nicehash/1.0", "EthereumStratum/1.0.0", "010080", LOCALHOST_LONG])
    );

    // The wallet address was stripped before the worker name went upstream.
    let upstream_auth = sserver
        .received()
        .iter()
        .find(|r| r["method"] == "mining.authorize")
        .cloned()
        .expect("upstream authorize");
    assert_eq!(upstream_auth["params"][0], "alice.rig1");
    Ok(())
}

#[tokio::test]
async fn ethproxy_login_uses_jsonrpc2() -> Result<()> {
    let sserver = MockSserver::start(SserverOptions {
        tag: "pool-eth".to_string(),
        ethereum: true,
        ..Default::default()
    })
    .await?;

    let store = MemoryStore::new();
    store.put(&format!("{WATCH_DIR}alice"), b"eth");
    let (_manager, addr) = start_switcher(
        &store,
        test_config(1, ChainType::Ethereum, &[("eth", sserver.addr)], false),
    )
    .await?;

    let mut miner = Miner::connect(addr).await?;
    // No subscribe: EthProxy logs straight in, rig name in the worker field.
    miner
        .send(&json!({
            "id":1,
            "method":"eth_submitLogin",
            "params":["alice"],
            "worker":"rig1"
        }))
        .await?;

    let login = miner.recv().await?;
    assert_eq!(login["jsonrpc"], "2.0");
    assert_eq!(login["id"], 1);
    assert_eq!(login["result"], true);
    assert!(login.get("error").is_none());

    // The proxy synthesized a subscribe so the upstream still learns the
    // session ID and miner IP.
    let upstream_subscribe = sserver
        .received()
        .iter()
        .find(|r| r["method"] == "mining.subscribe")
        .cloned()
        .expect("synthesized subscribe");
    assert_eq!(
        upstream_subscribe["params"],
        json!(["ETHProxy", "ETHProxy/1.0.0", "010080", LOCALHOST_LONG])
    );

    let upstream_login = sserver
        .received()
        .iter()
        .find(|r| r["method"] == "eth_submitLogin")
        .cloned()
        .expect("forwarded login");
    assert_eq!(upstream_login["params"][0], "alice.rig1");
    Ok(())
}

#[tokio::test]
async fn handshake_ordering_errors() -> Result<()> {
    let sserver = MockSserver::start(SserverOptions::default()).await?;
    let store = MemoryStore::new();
    store.put(&format!("{WATCH_DIR}alice"), b"btc");
    let (_manager, addr) =
        start_switcher(&store, test_config(3, ChainType::Bitcoin, &[("btc", sserver.addr)], false))
            .await?;

    let mut miner = Miner::connect(addr).await?;

    // Authorize before subscribe: 101, session stays up.
    miner
        .send(&json!({"id":1,"method":"mining.authorize","params":["alice.rig1","x"]}))
        .await?;
    let needs_subscribe = miner.recv().await?;
    assert_eq!(needs_subscribe["error"][0], 101);

    miner
        .send(&json!({"id":2,"method":"mining.subscribe","params":["cgminer/4.10.0"]}))
        .await?;
    let subscribe = miner.recv().await?;
    assert!(subscribe["error"].is_null());

    // Second subscribe: 102.
    miner
        .send(&json!({"id":3,"method":"mining.subscribe","params":["cgminer/4.10.0"]}))
        .await?;
    let duplicate = miner.recv().await?;
    assert_eq!(duplicate["error"][0], 102);

    // A worker name of exactly "." has no sub-account: 105.
    miner
        .send(&json!({"id":4,"method":"mining.authorize","params":[".","x"]}))
        .await?;
    let empty = miner.recv().await?;
    assert_eq!(empty["error"][0], 105);
    assert_eq!(empty["error"][1], "Sub-account Name Cannot be Empty");

    // And the handshake can still complete afterwards.
    miner
        .send(&json!({"id":5,"method":"mining.authorize","params":["alice.rig1","x"]}))
        .await?;
    let auth = miner.recv().await?;
    assert_eq!(auth["id"], 5);
    assert_eq!(auth["result"], true);
    Ok(())
}

#[tokio::test]
async fn unknown_subaccount_gets_error_201() -> Result<()> {
    let sserver = MockSserver::start(SserverOptions::default()).await?;
    let store = MemoryStore::new(); // no assignment for anyone
    let (_manager, addr) =
        start_switcher(&store, test_config(3, ChainType::Bitcoin, &[("btc", sserver.addr)], false))
            .await?;

    let mut miner = Miner::connect(addr).await?;
    miner
        .send(&json!({"id":1,"method":"mining.subscribe","params":["cgminer/4.10.0"]}))
        .await?;
    miner.recv().await?;
    miner
        .send(&json!({"id":2,"method":"mining.authorize","params":["ghost.rig1","x"]}))
        .await?;

    let rejected = miner.recv().await?;
    assert_eq!(rejected["id"], 2);
    assert_eq!(rejected["error"], json!([201, "Invalid Sub-account Name", 3]));

    miner.expect_closed().await?;
    Ok(())
}

#[tokio::test]
async fn auto_registration_rendezvous() -> Result<()> {
    let sserver = MockSserver::start(SserverOptions {
        tag: "pool-btc".to_string(),
        ..Default::default()
    })
    .await?;

    let store = MemoryStore::new(); // "newbie" is unknown
    let (_manager, addr) =
        start_switcher(&store, test_config(3, ChainType::Bitcoin, &[("btc", sserver.addr)], true))
            .await?;

    let mut miner = Miner::connect(addr).await?;
    miner
        .send(&json!({"id":1,"method":"mining.subscribe","params":["cgminer/4.10.0"]}))
        .await?;
    miner.recv().await?;
    miner
        .send(&json!({"id":2,"method":"mining.authorize","params":["newbie.rig1","x"]}))
        .await?;

    // The proxy publishes the rendezvous node and parks the miner.
    let auto_reg_path = format!("{AUTO_REG_DIR}newbie");
    let payload = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(value) = store.value(&auto_reg_path) {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("auto-reg node never appeared")?;
    let info: Value = serde_json::from_slice(&payload)?;
    assert_eq!(info["SessionID"], 0x03000080);
    assert_eq!(info["Worker"], "newbie.rig1");

    // The external registrar installs the assignment and removes the
    // rendezvous node, which releases the parked session.
    store.put(&format!("{WATCH_DIR}newbie"), b"btc");
    store.remove(&auto_reg_path);

    let auth = miner.recv().await?;
    assert_eq!(auth["id"], 2);
    assert_eq!(auth["result"], true);
    Ok(())
}

#[tokio::test]
async fn version_rolling_mask_is_narrowed_by_upstream() -> Result<()> {
    let sserver = MockSserver::start(SserverOptions {
        tag: "pool-btc".to_string(),
        ..Default::default()
    })
    .await?;

    let store = MemoryStore::new();
    store.put(&format!("{WATCH_DIR}alice"), b"btc");
    let (_manager, addr) =
        start_switcher(&store, test_config(3, ChainType::Bitcoin, &[("btc", sserver.addr)], false))
            .await?;

    let mut miner = Miner::connect(addr).await?;

    miner
        .send(&json!({
            "id":1,
            "method":"mining.configure",
            "params":[["version-rolling"], {"version-rolling.mask":"1fffe000","version-rolling.min-bit-count":2}]
        }))
        .await?;
    let configure = miner.recv().await?;
    assert_eq!(configure["result"]["version-rolling"], true);
    assert_eq!(configure["result"]["version-rolling.mask"], "1fffe000");

    miner
        .send(&json!({"id":2,"method":"mining.subscribe","params":["cgminer/4.10.0"]}))
        .await?;
    miner.recv().await?;
    miner
        .send(&json!({"id":3,"method":"mining.authorize","params":["alice.rig1","x"]}))
        .await?;
    let auth = miner.recv_until(|f| f["id"] == 3).await?;
    assert_eq!(auth["result"], true);

    // After upstream auth, the truly-allowed mask arrives as a notify.
    let mask_update = miner
        .recv_until(|f| f["method"] == "mining.set_version_mask")
        .await?;
    assert_eq!(mask_update["params"][0], "1fffe000");

    // The upstream got a configure carrying our mask.
    let upstream_configure = sserver
        .received()
        .iter()
        .find(|r| r["method"] == "mining.configure")
        .cloned()
        .expect("upstream configure");
    assert_eq!(upstream_configure["id"], "configure");
    assert_eq!(
        upstream_configure["params"][1]["version-rolling.mask"],
        "1fffe000"
    );
    Ok(())
}
