use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SwitcherError};
use crate::utils::{u32_to_hex, u32_to_hex_le};

/// Blockchain family served by this proxy instance. Selects the session ID
/// index width and the extranonce rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChainType {
    Bitcoin,
    DecredNormal,
    DecredGominer,
    Ethereum,
}

impl ChainType {
    /// Bits of the session index part of a session ID.
    pub fn index_bits(&self) -> u8 {
        match self {
            ChainType::Bitcoin | ChainType::DecredNormal | ChainType::DecredGominer => 24,
            ChainType::Ethereum => 16,
        }
    }

    /// Allocation stride. Ethereum spaces IDs out so a NiceHash client whose
    /// extranonce is truncated to two bytes cannot alias a neighbor's range.
    pub fn alloc_interval(&self) -> u32 {
        match self {
            ChainType::Ethereum => 256,
            _ => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChainType::Bitcoin => "bitcoin",
            ChainType::DecredNormal => "decred-normal",
            ChainType::DecredGominer => "decred-gominer",
            ChainType::Ethereum => "ethereum",
        }
    }

    /// Chain-specific session ID rendering, also used as the miner's
    /// Extranonce1.
    pub fn session_id_string(&self, session_id: u32) -> String {
        match self {
            ChainType::Bitcoin => u32_to_hex(session_id),
            // Reversed 12 bytes.
            ChainType::DecredNormal => format!("0000000000000000{}", u32_to_hex_le(session_id)),
            // Reversed 4 bytes.
            ChainType::DecredGominer => u32_to_hex_le(session_id),
            // Ethereum uses the low 24 bits.
            ChainType::Ethereum => u32_to_hex(session_id)[2..8].to_string(),
        }
    }
}

impl std::fmt::Display for ChainType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-currency upstream server entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumServerInfo {
    pub url: String,
    /// Suffix appended to the sub-account on the second authorize attempt.
    /// Defaults to the coin key.
    #[serde(default)]
    pub user_suffix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub brokers: Vec<String>,
    /// Directory holding the server ID leases; normalized to end with `/`.
    pub server_id_assign_dir: String,
    /// Directory watched for per-sub-account currency assignments.
    pub switcher_watch_dir: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoRegConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub watch_dir: String,
    /// Cap on concurrently pending auto-registrations. Protects the
    /// registrar from connection floods for unknown sub-accounts.
    #[serde(default)]
    pub max_wait_users: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpDebugConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub listen_addr: String,
}

/// Proxy configuration, loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// 0 means "lease one from the coordinator on startup".
    #[serde(default)]
    pub server_id: u8,
    pub chain_type: ChainType,
    pub listen_addr: String,
    pub stratum_servers: HashMap<String, StratumServerInfo>,
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub auto_reg: AutoRegConfig,
    #[serde(default)]
    pub http_debug: HttpDebugConfig,
    /// Whether the upstreams treat sub-account names case-insensitively.
    #[serde(default)]
    pub stratum_server_case_insensitive: bool,
    /// Coordinator directory mapping lowercased sub-accounts to their
    /// canonical spelling. Only consulted when the upstream is
    /// case-sensitive. Empty disables the lookup.
    #[serde(default)]
    pub user_case_index_dir: String,
}

fn ensure_trailing_slash(dir: &mut String) {
    if !dir.is_empty() && !dir.ends_with('/') {
        dir.push('/');
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            SwitcherError::Config(format!(
                "failed to read {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let mut config: Config = toml::from_str(&content)
            .map_err(|e| SwitcherError::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Normalizes directory prefixes and fills in defaults. Called once at
    /// load time; the rest of the code can rely on the invariants.
    pub fn validate(&mut self) -> Result<()> {
        self.listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| SwitcherError::Config(format!("bad listen_addr: {e}")))?;

        if self.stratum_servers.is_empty() {
            return Err(SwitcherError::Config("stratum_servers is empty".into()));
        }
        if self.coordinator.brokers.is_empty() {
            return Err(SwitcherError::Config("coordinator.brokers is empty".into()));
        }

        ensure_trailing_slash(&mut self.coordinator.server_id_assign_dir);
        ensure_trailing_slash(&mut self.coordinator.switcher_watch_dir);
        ensure_trailing_slash(&mut self.auto_reg.watch_dir);
        if !self.stratum_server_case_insensitive {
            ensure_trailing_slash(&mut self.user_case_index_dir);
        }

        for (coin, info) in self.stratum_servers.iter_mut() {
            if info.user_suffix.is_empty() {
                info.user_suffix = coin.clone();
            }
            tracing::info!("chain: {}, user suffix: {}", coin, info.user_suffix);
        }

        if self.auto_reg.enabled && self.auto_reg.watch_dir.is_empty() {
            return Err(SwitcherError::Config(
                "auto_reg.enabled requires auto_reg.watch_dir".into(),
            ));
        }
        if self.http_debug.enabled && self.http_debug.listen_addr.is_empty() {
            return Err(SwitcherError::Config(
                "http_debug.enabled requires http_debug.listen_addr".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        let toml = r#"
            server_id = 3
            chain_type = "bitcoin"
            listen_addr = "0.0.0.0:3333"

            [stratum_servers.btc]
            url = "127.0.0.1:13333"

            [stratum_servers.bch]
            url = "127.0.0.1:13334"
            user_suffix = "bcc"

            [coordinator]
            brokers = ["127.0.0.1:2181"]
            server_id_assign_dir = "/switcher/server-id-assign"
            switcher_watch_dir = "/switcher/switcher-watch"
        "#;
        let mut config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        config
    }

    #[test]
    fn chain_type_parsing() {
        for (name, expected) in [
            ("bitcoin", ChainType::Bitcoin),
            ("decred-normal", ChainType::DecredNormal),
            ("decred-gominer", ChainType::DecredGominer),
            ("ethereum", ChainType::Ethereum),
        ] {
            let parsed: ChainType = serde_json::from_value(serde_json::json!(name)).unwrap();
            assert_eq!(parsed, expected);
        }
    }

    #[test]
    fn index_bits_by_chain() {
        assert_eq!(ChainType::Bitcoin.index_bits(), 24);
        assert_eq!(ChainType::DecredNormal.index_bits(), 24);
        assert_eq!(ChainType::DecredGominer.index_bits(), 24);
        assert_eq!(ChainType::Ethereum.index_bits(), 16);
        assert_eq!(ChainType::Ethereum.alloc_interval(), 256);
        assert_eq!(ChainType::Bitcoin.alloc_interval(), 0);
    }

    #[test]
    fn session_id_renderings() {
        assert_eq!(
            ChainType::Bitcoin.session_id_string(0x03000080),
            "03000080"
        );
        assert_eq!(
            ChainType::Ethereum.session_id_string(0x0001003f),
            "01003f"
        );
        assert_eq!(
            ChainType::DecredNormal.session_id_string(0x03000080),
            "000000000000000080000003"
        );
        assert_eq!(
            ChainType::DecredGominer.session_id_string(0x03000080),
            "80000003"
        );
    }

    #[test]
    fn normalization() {
        let config = base_config();
        assert!(config.coordinator.switcher_watch_dir.ends_with('/'));
        assert!(config.coordinator.server_id_assign_dir.ends_with('/'));
        assert_eq!(config.stratum_servers["btc"].user_suffix, "btc");
        assert_eq!(config.stratum_servers["bch"].user_suffix, "bcc");
    }
}
