//! IPC message protocol definitions
//!
//! All messages are JSON-encoded, prefixed with a 4-byte little-endian length.
//! A connection starts in control mode; `RegisterAgent` switches it to agent
//! mode for the rest of its life.

use serde::{Deserialize, Serialize};

use crate::channel::SourceId;
use crate::coordinator::CoordinatorStatus;
use crate::events::CoordinatorEvent;
use crate::state::ProtectionState;

/// Largest accepted frame
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Requests from the UI, the host or a connecting agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Request current daemon status
    GetStatus,

    /// Request `{active, protectedSourceId}`
    GetState,

    /// Toggle protection of a source
    ToggleProtectedSource { source_id: SourceId },

    /// The host closed a source
    SourceDestroyed { source_id: SourceId },

    /// Ping to check connectivity
    Ping,

    /// Subscribe to coordinator event notifications
    Subscribe,

    /// Turn this connection into the link of a source's agent
    RegisterAgent { source_id: SourceId },
}

/// Responses from daemon to a control client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Current daemon status
    Status(DaemonStatus),

    /// Protection state after a query or toggle
    State(ProtectionState),

    /// Request accepted, nothing to report
    Ack,

    /// Pong response to ping
    Pong,

    /// Subscription confirmed
    Subscribed,

    /// Connection now carries agent traffic
    Registered { source_id: SourceId },

    /// Error response
    Error { code: String, message: String },
}

impl Response {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Response::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Push notification from daemon to UI (for subscribed clients)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// Coordinator event occurred
    Event { event: CoordinatorEvent },
}

/// Full daemon status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    /// Daemon version
    pub version: String,

    pub active: bool,

    pub protected_source_id: Option<SourceId>,

    /// Whether the protected source is currently lowered
    pub ducked: bool,

    /// Number of sources with a live agent link
    pub connected_sources: usize,

    /// Uptime in seconds
    pub uptime_secs: u64,
}

impl DaemonStatus {
    pub fn new(status: CoordinatorStatus, uptime_secs: u64) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            active: status.state.active,
            protected_source_id: status.state.protected_source_id,
            ducked: status.ducked,
            connected_sources: status.connected_sources,
            uptime_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let req = Request::ToggleProtectedSource {
            source_id: "tabA".into(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("toggle_protected_source"));
        assert!(json.contains("tabA"));
    }

    #[test]
    fn test_state_response_uses_persisted_layout() {
        let resp = Response::State(ProtectionState::active("tabA".into()));
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"type":"state","active":true,"protectedSourceId":"tabA"}"#);
    }
}
