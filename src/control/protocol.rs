//! Wire types for the control socket.
//!
//! Requests are `{"type": ..., "data": ...}`; responses are
//! `{"success": bool, "error"?: ..., "data"?: ...}`.

use serde::{Deserialize, Serialize};

pub const REQ_PING: &str = "ping";
pub const REQ_STATUS: &str = "status";
pub const REQ_STOP: &str = "stop";
pub const REQ_TUNNEL_UP: &str = "tunnel_up";
pub const REQ_TUNNEL_DOWN: &str = "tunnel_down";
pub const REQ_GROUP_ENABLE: &str = "group_enable";
pub const REQ_GROUP_DISABLE: &str = "group_disable";
pub const REQ_RELOAD_CONFIG: &str = "reload_config";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<RequestData>,
}

/// Payload for tunnel and group requests. `host` is required when
/// bringing something up and absent when taking it down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestData {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            data: None,
        }
    }

    pub fn ok_with<T: Serialize>(data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self {
                success: true,
                error: None,
                data: Some(value),
            },
            Err(e) => Self::error(format!("failed to encode response: {}", e)),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            data: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub running: bool,
    pub pid: u32,
    pub uptime: String,
    pub tunnels: Vec<TunnelStatusInfo>,
    pub groups: Vec<GroupStatus>,
    pub network: NetworkStatusInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelStatusInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub host: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub connections: u64,
    pub reconnect_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupStatus {
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub tunnels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkStatusInfo {
    pub status: String,
}
