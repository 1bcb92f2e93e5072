pub mod rpc;

/// Client type prefix that marks a BTCAgent connection.
pub const BTC_AGENT_CLIENT_TYPE_PREFIX: &str = "btccom-agent/";

/// Client type prefix of the NiceHash mining client.
pub const NICEHASH_CLIENT_TYPE_PREFIX: &str = "nicehash/";

/// Protocol hint prefix announcing the NiceHash Ethereum Stratum dialect.
pub const ETHEREUM_STRATUM_NICEHASH_PREFIX: &str = "ethereumstratum/";

/// Version string embedded verbatim in NiceHash protocol responses.
pub const ETHEREUM_STRATUM_NICEHASH_VERSION: &str = "EthereumStratum/1.0.0";

/// User agent / version sent upstream on behalf of EthProxy clients, which
/// never send a `mining.subscribe` of their own.
pub const ETHPROXY_USER_AGENT: &str = "ETHProxy";
pub const ETHPROXY_VERSION: &str = "ETHProxy/1.0.0";

/// Stratum protocol variant spoken on the client side of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolType {
    /// Bitcoin Stratum; Decred chains speak a near-identical dialect.
    BitcoinStratum,
    /// Plain Ethereum Stratum.
    EthereumStratum,
    /// The Ethereum Stratum dialect proposed by NiceHash.
    EthereumStratumNiceHash,
    /// The dialect implemented by the EthProxy software (no subscribe phase,
    /// JSON-RPC 2.0 responses).
    EthereumProxy,
    /// Anything we cannot handle.
    Unknown,
}

impl std::fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolType::BitcoinStratum => write!(f, "bitcoin-stratum"),
            ProtocolType::EthereumStratum => write!(f, "ethereum-stratum"),
            ProtocolType::EthereumStratumNiceHash => write!(f, "ethereum-stratum-nicehash"),
            ProtocolType::EthereumProxy => write!(f, "ethereum-proxy"),
            ProtocolType::Unknown => write!(f, "unknown"),
        }
    }
}
