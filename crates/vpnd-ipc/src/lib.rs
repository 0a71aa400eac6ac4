//! vpnd IPC - command dispatch for the VPN engine
//!
//! Clients send `{channel, data}` requests; every request gets exactly one
//! JSON response. Engine events are forwarded as separate frames.
//!
//! | Channel      | Input                         | Response                      |
//! |--------------|-------------------------------|-------------------------------|
//! | `connect`    | `serverId`                    | `success`, `message`, `status`|
//! | `disconnect` |                               | `success`, `message`, `status`|
//! | `status`     |                               | status snapshot               |
//! | `settings`   | settings object               | `success`, `message`          |
//! | `servers`    | `country`, `sortBy` (optional)| `servers`                     |
//! | `logs`       | `count` (default 100)         | `logs`                        |
//! | `killswitch` | `enabled` (default true)      | `success`                     |
//! | `test`       |                               | `success`, `speed`            |
//!
//! Channels may carry a `vpn:` prefix.

mod dispatcher;
mod wire;

pub use dispatcher::{event_frame, Channel, DispatchError, Dispatcher};
pub use wire::{
    CommandResponse, ConnectRequest, ErrorResponse, EventFrame, KillSwitchRequest, LogsRequest,
    LogsResponse, Request, Response, ServersRequest, ServersResponse, SpeedResponse, DEFAULT_LOG_COUNT,
};
