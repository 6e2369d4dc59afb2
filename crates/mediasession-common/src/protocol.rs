//! JSON-RPC 2.0 schema spoken with the media server's content endpoint.
//!
//! Two methods exist: `start` carries the local offer and the media
//! direction constraints, `terminate` releases a server-side session. The
//! server answers `start` with the SDP answer and the session id it assigned.

use serde::{Deserialize, Serialize};

pub const JSONRPC_VERSION: &str = "2.0";

/// Media direction requested for one media type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    SendOnly,
    RecvOnly,
    SendRecv,
    Inactive,
}

impl Direction {
    /// SDP attribute name for this direction (`a=sendrecv`, ...).
    pub fn sdp_attribute(self) -> &'static str {
        match self {
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::SendRecv => "sendrecv",
            Direction::Inactive => "inactive",
        }
    }

    pub fn from_sdp_attribute(name: &str) -> Option<Self> {
        match name {
            "sendonly" => Some(Direction::SendOnly),
            "recvonly" => Some(Direction::RecvOnly),
            "sendrecv" => Some(Direction::SendRecv),
            "inactive" => Some(Direction::Inactive),
            _ => None,
        }
    }
}

/// Per-media-type direction constraints sent with `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    pub audio: Direction,
    pub video: Direction,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            audio: Direction::Inactive,
            video: Direction::SendRecv,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartParams {
    pub sdp: String,
    pub constraints: Constraints,
}

/// Why the client is tearing the session down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reason {
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminateParams {
    pub session_id: String,
    pub reason: Reason,
}

/// Method plus its parameters, tagged the JSON-RPC way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "lowercase")]
pub enum Call {
    Start(StartParams),
    Terminate(TerminateParams),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(flatten)]
    pub call: Call,
    pub id: u64,
}

impl JsonRpcRequest {
    pub fn start(sdp: impl Into<String>, constraints: Constraints, sequence: u64) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            call: Call::Start(StartParams {
                sdp: sdp.into(),
                constraints,
            }),
            id: sequence,
        }
    }

    pub fn terminate(
        session_id: impl Into<String>,
        code: i32,
        message: impl Into<String>,
        sequence: u64,
    ) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            call: Call::Terminate(TerminateParams {
                session_id: session_id.into(),
                reason: Reason {
                    code,
                    message: message.into(),
                },
            }),
            id: sequence,
        }
    }

    pub fn method(&self) -> &'static str {
        match self.call {
            Call::Start(_) => "start",
            Call::Terminate(_) => "terminate",
        }
    }
}

/// Successful result payload. Fields are optional on the wire; `start`
/// responses must carry both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResponseResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
    #[serde(default)]
    pub id: Option<u64>,
}

impl JsonRpcResponse {
    pub fn result(id: u64, result: ResponseResult) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id: Some(id),
        }
    }

    pub fn error(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(ResponseError {
                code,
                message: message.into(),
                data: None,
            }),
            id: Some(id),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Splits the response into its result or error half. An error object
    /// wins over a result if a server sends both.
    pub fn into_outcome(self) -> std::result::Result<ResponseResult, ResponseError> {
        match (self.error, self.result) {
            (Some(error), _) => Err(error),
            (None, Some(result)) => Ok(result),
            (None, None) => Ok(ResponseResult::default()),
        }
    }
}
