use serde_json::{json, Value};
use thiserror::Error;

/// Errors carried back to miners as part of the numeric Stratum contract.
///
/// 1xx — handshake, 2xx — sub-account assignment, 3xx — upstream routing,
/// 5xx — internal. The wire form is a JSON-RPC 1.0 error array
/// `[code, message, serverID]` (converted to a 2.0 error object for EthProxy
/// sessions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StratumError {
    #[error("Need Subscribed")]
    NeedSubscribed,
    #[error("Duplicate Subscribed")]
    DuplicateSubscribed,
    #[error("Too Few Params")]
    TooFewParams,
    #[error("Worker Name Must be a String")]
    WorkerNameMustBeString,
    #[error("Sub-account Name Cannot be Empty")]
    EmptySubaccountName,
    #[error("Invalid Sub-account Name")]
    InvalidSubaccountName,
    #[error("Stratum Server Not Found")]
    StratumServerNotFound,
    #[error("Connect Stratum Server Failed")]
    ConnectStratumServerFailed,
    #[error("Unknown Chain Type")]
    UnknownChainType,
}

impl StratumError {
    pub fn code(&self) -> i64 {
        match self {
            StratumError::NeedSubscribed => 101,
            StratumError::DuplicateSubscribed => 102,
            StratumError::TooFewParams => 103,
            StratumError::WorkerNameMustBeString => 104,
            StratumError::EmptySubaccountName => 105,
            StratumError::InvalidSubaccountName => 201,
            StratumError::StratumServerNotFound => 301,
            StratumError::ConnectStratumServerFailed => 302,
            StratumError::UnknownChainType => 500,
        }
    }

    /// The JSON-RPC 1.0 error payload. The server ID rides along as extra
    /// data so operators can tell which proxy instance rejected the request.
    pub fn to_rpc_array(&self, server_id: u8) -> Value {
        json!([self.code(), self.to_string(), server_id])
    }
}

/// Internal error type for the switcher core.
#[derive(Debug, Error)]
pub enum SwitcherError {
    #[error("read timeout")]
    ReadTimeout,
    #[error("Session ID is Full")]
    SessionIdFull,
    #[error("Session ID has been occupied")]
    SessionIdOccupied,
    #[error("Parse Subscribe Response Failed")]
    ParseSubscribeResponseFailed,
    #[error("Session ID Inconformity")]
    SessionIdInconformity,
    #[error("Authorize Failed")]
    AuthorizeFailed,
    #[error("Too much pending auto reg request")]
    TooMuchPendingAutoRegReq,
    #[error("{0}")]
    Stratum(#[from] StratumError),
    #[error("node not found: {0}")]
    NoNode(String),
    #[error("node already exists: {0}")]
    NodeExists(String),
    #[error("coordinator error: {0}")]
    Coordinator(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SwitcherError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_contract() {
        assert_eq!(StratumError::NeedSubscribed.code(), 101);
        assert_eq!(StratumError::DuplicateSubscribed.code(), 102);
        assert_eq!(StratumError::TooFewParams.code(), 103);
        assert_eq!(StratumError::WorkerNameMustBeString.code(), 104);
        assert_eq!(StratumError::EmptySubaccountName.code(), 105);
        assert_eq!(StratumError::InvalidSubaccountName.code(), 201);
        assert_eq!(StratumError::StratumServerNotFound.code(), 301);
        assert_eq!(StratumError::ConnectStratumServerFailed.code(), 302);
        assert_eq!(StratumError::UnknownChainType.code(), 500);
    }

    #[test]
    fn rpc_array_shape() {
        let arr = StratumError::InvalidSubaccountName.to_rpc_array(3);
        assert_eq!(arr, json!([201, "Invalid Sub-account Name", 3]));
    }
}
