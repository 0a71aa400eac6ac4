//! Command Dispatcher
//!
//! Maps a channel name to one engine operation and shapes the outcome into
//! a JSON response. This is the only place engine errors are turned into
//! wire responses; nothing escapes unshaped, panics included.

use crate::wire::{
    CommandResponse, ConnectRequest, ErrorResponse, EventFrame, KillSwitchRequest, LogsRequest,
    LogsResponse, ServersRequest, ServersResponse, SpeedResponse,
};
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use tracing::{debug, error, warn};
use vpnd_core::{Engine, EngineError, Event, RawSettings};

/// Optional channel prefix
const CHANNEL_PREFIX: &str = "vpn:";

/// Command channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Connect,
    Disconnect,
    Status,
    Settings,
    Servers,
    Logs,
    KillSwitch,
    Test,
}

impl Channel {
    /// Parse a channel name, bare (`connect`) or prefixed (`vpn:connect`)
    pub fn parse(name: &str) -> Option<Self> {
        let bare = name.strip_prefix(CHANNEL_PREFIX).unwrap_or(name);

        match bare {
            "connect" => Some(Self::Connect),
            "disconnect" => Some(Self::Disconnect),
            "status" => Some(Self::Status),
            "settings" => Some(Self::Settings),
            "servers" => Some(Self::Servers),
            "logs" => Some(Self::Logs),
            "killswitch" => Some(Self::KillSwitch),
            "test" => Some(Self::Test),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Status => "status",
            Self::Settings => "settings",
            Self::Servers => "servers",
            Self::Logs => "logs",
            Self::KillSwitch => "killswitch",
            Self::Test => "test",
        }
    }

    /// `message` of a failed response
    fn failure_message(&self) -> &'static str {
        match self {
            Self::Connect => "Connection failed",
            Self::Disconnect => "Disconnection failed",
            Self::Settings => "Settings rejected",
            Self::KillSwitch => "Kill switch update failed",
            _ => "Command failed",
        }
    }
}

/// Dispatch errors
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("Invalid {channel} payload: {reason}")]
    InvalidPayload {
        channel: &'static str,
        reason: String,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Command dispatcher bound to one engine
#[derive(Clone)]
pub struct Dispatcher {
    engine: Engine,
}

impl Dispatcher {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Handle one command; always produces a response
    pub async fn handle(&self, channel: &str, data: &Value) -> Value {
        let Some(command) = Channel::parse(channel) else {
            warn!("Unknown channel: {}", channel);
            return to_value(&ErrorResponse {
                error: DispatchError::UnknownChannel(channel.to_string()).to_string(),
            });
        };
        debug!("Dispatching {}", command.name());

        let outcome = AssertUnwindSafe(self.execute(command, data))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => self.failure(command, e).await,
            Err(panic) => {
                let reason = panic_message(&*panic);
                error!("Handler for {} panicked: {}", command.name(), reason);
                to_value(&ErrorResponse {
                    error: format!("Internal error in {}: {}", command.name(), reason),
                })
            }
        }
    }

    async fn execute(&self, command: Channel, data: &Value) -> Result<Value, DispatchError> {
        let engine = &self.engine;

        let response = match command {
            Channel::Connect => {
                let request: ConnectRequest = required(command, data)?;
                let status = engine.connect(&request.server_id).await?;
                to_value(&CommandResponse::ok().with_message("Connected").with_status(status))
            }
            Channel::Disconnect => {
                let status = engine.disconnect().await?;
                to_value(&CommandResponse::ok().with_message("Disconnected").with_status(status))
            }
            Channel::Status => to_value(&engine.status().await),
            Channel::Settings => {
                let raw: RawSettings = optional(command, data)?;
                engine.apply_settings(raw)?;
                to_value(&CommandResponse::ok().with_message("Settings updated"))
            }
            Channel::Servers => {
                let request: ServersRequest = optional(command, data)?;
                let catalog = engine.catalog();
                let servers = catalog
                    .query(request.country.as_deref(), request.sort_by)
                    .into_iter()
                    .cloned()
                    .collect();
                to_value(&ServersResponse { servers })
            }
            Channel::Logs => {
                let request: LogsRequest = optional(command, data)?;
                to_value(&LogsResponse {
                    logs: engine.logs(request.count()),
                })
            }
            Channel::KillSwitch => {
                let request: KillSwitchRequest = optional(command, data)?;
                if request.enabled {
                    engine.enable_kill_switch();
                } else {
                    engine.disable_kill_switch();
                }
                to_value(&CommandResponse::ok())
            }
            Channel::Test => to_value(&SpeedResponse {
                success: true,
                speed: engine.test_speed().await,
            }),
        };

        Ok(response)
    }

    async fn failure(&self, command: Channel, e: DispatchError) -> Value {
        warn!("{} failed: {}", command.name(), e);
        let mut response = CommandResponse::failed(command.failure_message(), &e);

        if matches!(command, Channel::Connect | Channel::Disconnect) {
            response = response.with_status(self.engine.status().await);
        }
        to_value(&response)
    }
}

/// Map an engine event to its outbound frame
pub fn event_frame(event: &Event) -> EventFrame {
    match event {
        Event::Status(status) => EventFrame {
            event: "vpn:status-update",
            data: to_value(status),
        },
        Event::Log(line) => EventFrame {
            event: "vpn:log-update",
            data: json!({ "log": line }),
        },
        Event::Error(message) => EventFrame {
            event: "vpn:error",
            data: json!({ "error": message }),
        },
    }
}

/// Payload that must be present
fn required<T: DeserializeOwned>(command: Channel, data: &Value) -> Result<T, DispatchError> {
    T::deserialize(data).map_err(|e| DispatchError::InvalidPayload {
        channel: command.name(),
        reason: e.to_string(),
    })
}

/// Payload that may be omitted entirely
fn optional<T: DeserializeOwned + Default>(command: Channel, data: &Value) -> Result<T, DispatchError> {
    if data.is_null() {
        return Ok(T::default());
    }
    required(command, data)
}

fn to_value<T: Serialize>(body: &T) -> Value {
    serde_json::to_value(body).unwrap_or_else(|e| {
        error!("Response serialization failed: {}", e);
        json!({ "error": format!("Response serialization failed: {}", e) })
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use vpnd_core::{
        ConnectionState, DryRunSupervisor, EngineConfig, ExitNotifier, Server, ServerCatalog, SupervisorError,
        TunnelConfig, TunnelSupervisor,
    };

    fn catalog() -> ServerCatalog {
        ServerCatalog::new(vec![Server {
            id: "us-1".to_string(),
            name: "US East".to_string(),
            country: "US".to_string(),
            city: "New York".to_string(),
            protocol: "OpenVPN".to_string(),
            ip: "1.2.3.4".parse().unwrap(),
            load: 0.3,
            ping: 20,
        }])
        .unwrap()
    }

    fn dispatcher_with(supervisor: Arc<dyn TunnelSupervisor>) -> Dispatcher {
        let engine = Engine::new(EngineConfig::default(), catalog(), supervisor).unwrap();
        Dispatcher::new(engine)
    }

    fn dispatcher() -> Dispatcher {
        dispatcher_with(Arc::new(DryRunSupervisor::new()))
    }

    /// Panics on the first start only
    #[derive(Default)]
    struct PanickingSupervisor {
        panicked: AtomicBool,
    }

    #[async_trait]
    impl TunnelSupervisor for PanickingSupervisor {
        async fn start(&self, _: &TunnelConfig, _: ExitNotifier) -> Result<(), SupervisorError> {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("supervisor exploded");
            }
            Ok(())
        }

        async fn terminate(&self) -> Result<(), SupervisorError> {
            Ok(())
        }
    }

    #[test]
    fn test_channel_parse() {
        assert_eq!(Channel::parse("vpn:connect"), Some(Channel::Connect));
        assert_eq!(Channel::parse("killswitch"), Some(Channel::KillSwitch));
        assert_eq!(Channel::parse("vpn:"), None);
        assert_eq!(Channel::parse("VPN:connect"), None);
    }

    #[tokio::test]
    async fn test_connect_success() {
        let dispatcher = dispatcher();

        let response = dispatcher
            .handle("vpn:connect", &json!({"serverId": "us-1"}))
            .await;

        assert_eq!(response["success"], true);
        assert_eq!(response["status"]["connected"], true);
        assert_eq!(response["status"]["ipAddress"], "1.2.3.4");
        assert_eq!(response["status"]["currentServer"]["id"], "us-1");
    }

    #[tokio::test]
    async fn test_connect_unknown_server() {
        let dispatcher = dispatcher();

        let response = dispatcher.handle("connect", &json!({"serverId": "missing"})).await;

        assert_eq!(response["success"], false);
        assert_eq!(response["message"], "Connection failed");
        assert_eq!(response["status"]["connected"], false);
        assert!(!dispatcher.engine().is_connected().await);
    }

    #[tokio::test]
    async fn test_connect_without_server_id() {
        let response = dispatcher().handle("connect", &json!({})).await;

        assert_eq!(response["success"], false);
        assert!(response["error"].as_str().unwrap().contains("connect"));
    }

    #[tokio::test]
    async fn test_disconnect_when_idle() {
        let response = dispatcher().handle("vpn:disconnect", &Value::Null).await;

        assert_eq!(response["success"], false);
        assert_eq!(response["message"], "Disconnection failed");
        assert_eq!(response["error"], "VPN not connected");
    }

    #[tokio::test]
    async fn test_status_is_bare_snapshot() {
        let response = dispatcher().handle("status", &Value::Null).await;

        assert_eq!(response["connected"], false);
        assert_eq!(response["uptime"], 0);
        assert!(response.get("currentServer").is_none());
        assert!(response.get("success").is_none());
    }

    #[tokio::test]
    async fn test_settings_defaults_and_validation() {
        let dispatcher = dispatcher();

        let response = dispatcher
            .handle("settings", &json!({"protocol": "TCP", "killSwitch": true}))
            .await;
        assert_eq!(response, json!({"success": true, "message": "Settings updated"}));
        let settings = dispatcher.engine().settings();
        assert!(settings.kill_switch);
        assert_eq!(settings.dns, "8.8.8.8");

        let response = dispatcher
            .handle("settings", &json!({"encryptionLevel": "extreme"}))
            .await;
        assert_eq!(response["success"], false);
        assert!(dispatcher.engine().settings().kill_switch);
    }

    #[tokio::test]
    async fn test_servers_and_logs() {
        let dispatcher = dispatcher();

        let servers = dispatcher.handle("servers", &Value::Null).await;
        assert_eq!(servers["servers"][0]["ip"], "1.2.3.4");
        assert_eq!(servers["servers"][0]["ping"], 20);

        let logs = dispatcher.handle("logs", &json!({"count": 1})).await;
        assert_eq!(logs["logs"].as_array().unwrap().len(), 1);

        let none = dispatcher.handle("logs", &json!({"count": -3})).await;
        assert_eq!(none["logs"], json!([]));
    }

    #[tokio::test]
    async fn test_servers_filtered_and_sorted() {
        let engine = Engine::new(
            EngineConfig::default(),
            ServerCatalog::defaults(),
            Arc::new(DryRunSupervisor::new()),
        )
        .unwrap();
        let dispatcher = Dispatcher::new(engine);

        let response = dispatcher
            .handle("vpn:servers", &json!({"country": "us", "sortBy": "ping"}))
            .await;
        let servers = response["servers"].as_array().unwrap();
        assert_eq!(servers.len(), 2);
        assert!(servers.iter().all(|s| s["country"] == "US"));
        assert!(servers[0]["ping"].as_u64() <= servers[1]["ping"].as_u64());

        let response = dispatcher.handle("servers", &json!({"sortBy": "load"})).await;
        assert_eq!(response["servers"][0]["id"], "us-ny-1");

        let response = dispatcher.handle("servers", &json!({"sortBy": "speed"})).await;
        assert_eq!(response["success"], false);
    }

    #[tokio::test]
    async fn test_killswitch_toggle() {
        let dispatcher = dispatcher();

        let response = dispatcher.handle("killswitch", &Value::Null).await;
        assert_eq!(response, json!({"success": true}));
        assert!(dispatcher.engine().settings().kill_switch);

        dispatcher.handle("killswitch", &json!({"enabled": false})).await;
        assert!(!dispatcher.engine().settings().kill_switch);
    }

    #[tokio::test]
    async fn test_speed_is_non_negative() {
        let response = dispatcher().handle("test", &Value::Null).await;

        assert_eq!(response["success"], true);
        assert!(response["speed"].as_f64().unwrap() >= 0.0);
    }

    #[tokio::test]
    async fn test_unknown_channel() {
        let dispatcher = dispatcher();

        for (channel, data) in [
            ("vpn:reboot", json!({})),
            ("", Value::Null),
            ("connect:", json!([1, 2, 3])),
            ("vpn:status-update", json!("text")),
        ] {
            let response = dispatcher.handle(channel, &data).await;
            assert_eq!(
                response,
                json!({ "error": format!("Unknown channel: {}", channel) })
            );
        }
    }

    #[tokio::test]
    async fn test_malformed_payloads_are_shaped() {
        let dispatcher = dispatcher();

        for data in [json!(42), json!("x"), json!([]), json!({"count": "many"})] {
            for channel in ["connect", "settings", "logs", "killswitch"] {
                let response = dispatcher.handle(channel, &data).await;
                assert!(response.is_object(), "{} with {}", channel, data);
            }
        }
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let dispatcher = dispatcher_with(Arc::new(PanickingSupervisor::default()));

        let response = dispatcher.handle("connect", &json!({"serverId": "us-1"})).await;
        assert_eq!(response["success"], false);
        let error = response["error"].as_str().unwrap();
        assert!(error.contains("supervisor exploded"));
        assert_eq!(response["status"]["connected"], false);

        // The engine is usable again afterwards
        assert_eq!(dispatcher.engine().state().await, ConnectionState::Idle);
        let response = dispatcher.handle("connect", &json!({"serverId": "us-1"})).await;
        assert_eq!(response["success"], true);
    }

    #[test]
    fn test_event_frames() {
        let frame = event_frame(&Event::Log("hello".to_string()));
        assert_eq!(frame.event, "vpn:log-update");
        assert_eq!(frame.data, json!({"log": "hello"}));

        let frame = event_frame(&Event::Error("down".to_string()));
        assert_eq!(frame.data, json!({"error": "down"}));
    }
}
