//! Wire Types
//!
//! Request payloads and response bodies exchanged with clients. Field names
//! are camelCase on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use vpnd_core::{Server, ServerOrder, StatusSnapshot};

/// Default number of log lines returned by `logs`
pub const DEFAULT_LOG_COUNT: i64 = 100;

/// `connect` payload
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub server_id: String,
}

/// `logs` payload
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogsRequest {
    pub count: i64,
}

impl LogsRequest {
    /// Requested count; negative means none
    pub fn count(&self) -> usize {
        usize::try_from(self.count).unwrap_or(0)
    }
}

impl Default for LogsRequest {
    fn default() -> Self {
        Self {
            count: DEFAULT_LOG_COUNT,
        }
    }
}

/// `servers` payload; both filters optional
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServersRequest {
    pub country: Option<String>,
    #[serde(rename = "sortBy")]
    pub sort_by: Option<ServerOrder>,
}

/// `killswitch` payload
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KillSwitchRequest {
    pub enabled: bool,
}

impl Default for KillSwitchRequest {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Outcome of a mutating command
#[derive(Debug, Clone, Serialize)]
pub struct CommandResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
            status: None,
            error: None,
        }
    }

    pub fn failed(message: &str, error: impl ToString) -> Self {
        Self {
            success: false,
            message: Some(message.to_string()),
            status: None,
            error: Some(error.to_string()),
        }
    }

    pub fn with_message(mut self, message: &str) -> Self {
        self.message = Some(message.to_string());
        self
    }

    pub fn with_status(mut self, status: StatusSnapshot) -> Self {
        self.status = Some(status);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServersResponse {
    pub servers: Vec<Server>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogsResponse {
    pub logs: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpeedResponse {
    pub success: bool,
    pub speed: f64,
}

/// Bare error body (unknown channel, internal failure)
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Inbound request frame
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    /// Echoed back on the response
    #[serde(default)]
    pub id: Option<Value>,
    pub channel: String,
    #[serde(default)]
    pub data: Value,
}

/// Response frame
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub channel: String,
    pub data: Value,
}

/// Outbound event frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventFrame {
    pub event: &'static str,
    pub data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_logs_count_default_and_clamp() {
        let default: LogsRequest = serde_json::from_value(json!({})).unwrap();
        assert_eq!(default.count(), 100);

        let negative: LogsRequest = serde_json::from_value(json!({"count": -5})).unwrap();
        assert_eq!(negative.count(), 0);
    }

    #[test]
    fn test_killswitch_defaults_to_enable() {
        let request: KillSwitchRequest = serde_json::from_value(json!({})).unwrap();
        assert!(request.enabled);
    }

    #[test]
    fn test_command_response_omits_empty_fields() {
        let value = serde_json::to_value(CommandResponse::ok()).unwrap();
        assert_eq!(value, json!({"success": true}));

        let value = serde_json::to_value(CommandResponse::failed("Connection failed", "boom")).unwrap();
        assert_eq!(value["message"], "Connection failed");
        assert_eq!(value["error"], "boom");
    }

    #[test]
    fn test_request_without_data() {
        let request: Request = serde_json::from_str(r#"{"channel": "vpn:status"}"#).unwrap();
        assert!(request.id.is_none());
        assert!(request.data.is_null());
    }
}
