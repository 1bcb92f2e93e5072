//! JSON-RPC framing as spoken by Stratum miners and servers.
//!
//! Requests and responses are JSON-RPC 1.0; EthProxy sessions additionally
//! expect responses in a JSON-RPC 2.0 envelope. Every framed message ends
//! with a single newline, appended by the connection layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which response envelope a session speaks. Only sessions classified as
/// EthProxy (via `eth_submitLogin`) are upgraded to V2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RpcVersion {
    #[default]
    V1,
    V2,
}

/// A JSON-RPC 1.0 request.
///
/// The `worker` field is not part of JSON-RPC proper: ETHProxy-style miners
/// put the rig name there instead of inside the login parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub worker: String,
}

impl Request {
    pub fn new(method: &str) -> Self {
        Self {
            id: Value::Null,
            method: method.to_string(),
            params: Vec::new(),
            worker: String::new(),
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// A JSON-RPC 1.0 response. All three fields are always serialized, `null`
/// included, which is what stock Stratum implementations expect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Value,
}

impl Response {
    /// Serializes the response in the given envelope version. V1 keeps the
    /// 1.0 shape; V2 repacks the error array into a 2.0 error object.
    pub fn to_bytes(&self, version: RpcVersion) -> serde_json::Result<Vec<u8>> {
        match version {
            RpcVersion::V1 => serde_json::to_vec(self),
            RpcVersion::V2 => {
                let v2 = Rpc2Response {
                    id: self.id.clone(),
                    jsonrpc: "2.0",
                    result: self.result.clone(),
                    error: Rpc2Error::from_v1(&self.error),
                };
                serde_json::to_vec(&v2)
            }
        }
    }
}

/// Error object of JSON-RPC 2.0, built from the 1.0 `[code, message, data]`
/// array as a last-mile conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rpc2Error {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Rpc2Error {
    pub fn from_v1(v1_error: &Value) -> Option<Self> {
        let arr = v1_error.as_array()?;
        Some(Self {
            code: arr.first().and_then(Value::as_i64).unwrap_or(0),
            message: arr
                .get(1)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            data: arr.get(2).cloned().unwrap_or(Value::Null),
        })
    }
}

/// Response envelope of JSON-RPC 2.0.
#[derive(Debug, Clone, Serialize)]
pub struct Rpc2Response {
    pub id: Value,
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Rpc2Error>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_request_with_worker_field() {
        let line = r#"{"id":1,"method":"eth_submitLogin","params":["test"],"worker":"aaa"}"#;
        let req: Request = serde_json::from_str(line).unwrap();
        assert_eq!(req.id, json!(1));
        assert_eq!(req.method, "eth_submitLogin");
        assert_eq!(req.params, vec![json!("test")]);
        assert_eq!(req.worker, "aaa");
    }

    #[test]
    fn request_round_trip() {
        let line = r#"{"id":2,"method":"mining.authorize","params":["alice.rig1","x"]}"#;
        let req: Request = serde_json::from_str(line).unwrap();
        let bytes = req.to_bytes().unwrap();
        let again: Request = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(req, again);
    }

    #[test]
    fn request_omits_empty_worker() {
        let req = Request::new("mining.subscribe");
        let text = String::from_utf8(req.to_bytes().unwrap()).unwrap();
        assert!(!text.contains("worker"));
    }

    #[test]
    fn v1_response_keeps_nulls() {
        let resp = Response {
            id: json!(2),
            result: json!(true),
            error: Value::Null,
        };
        let text = String::from_utf8(resp.to_bytes(RpcVersion::V1).unwrap()).unwrap();
        assert_eq!(text, r#"{"id":2,"result":true,"error":null}"#);
    }

    #[test]
    fn v2_response_envelope() {
        let resp = Response {
            id: json!(1),
            result: json!(true),
            error: Value::Null,
        };
        let text = String::from_utf8(resp.to_bytes(RpcVersion::V2).unwrap()).unwrap();
        assert_eq!(text, r#"{"id":1,"jsonrpc":"2.0","result":true}"#);
    }

    #[test]
    fn v2_error_conversion() {
        let resp = Response {
            id: json!(7),
            result: Value::Null,
            error: json!([201, "Invalid Sub-account Name", 3]),
        };
        let value: Value =
            serde_json::from_slice(&resp.to_bytes(RpcVersion::V2).unwrap()).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["error"]["code"], 201);
        assert_eq!(value["error"]["message"], "Invalid Sub-account Name");
        assert_eq!(value["error"]["data"], 3);
        assert!(value.get("result").is_none());
    }
}
