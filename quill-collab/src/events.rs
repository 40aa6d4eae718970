//! Control events exchanged beside the binary sync frames.
//!
//! Commands and events are JSON objects tagged by an `event` field, e.g.
//! `{"event":"join-vault","vaultId":"team-notes"}`. Binary sync payloads
//! never travel through here; they ride raw WebSocket binary frames (see
//! [`crate::protocol`]). The engine writes to connections only through the
//! [`ClientChannel`] seam, so tests can swap the socket for a channel.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use quill_store::Role;

/// Client → server control messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientCommand {
    Authenticate { token: String },
    JoinVault { vault_id: String },
    LeaveVault { vault_id: String },
    Ping,
}

/// Server → client control messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    Authenticated {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<UserInfo>,
    },
    VaultJoined {
        vault_id: String,
        role: Role,
    },
    /// Pushed when a joined client's role changes server-side.
    VaultRole {
        vault_id: String,
        role: Role,
    },
    FileList {
        files: Vec<String>,
    },
    UserJoined {
        user_id: i64,
        name: String,
        role: Role,
    },
    UserLeft {
        user_id: i64,
        name: String,
    },
    PermissionDenied {
        action: DeniedAction,
        vault_id: String,
        message: String,
    },
    Error {
        message: String,
    },
    Pong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeniedAction {
    Join,
    Write,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub user_id: i64,
    pub name: String,
    pub is_server_admin: bool,
}

/// Anything the server pushes down one connection.
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(ServerEvent),
    /// Pre-encoded sync/awareness frame, shared across fan-out targets.
    Frame(Arc<Vec<u8>>),
}

/// Write side of one client connection.
///
/// Implementations must preserve push order per connection (FIFO); the
/// engine relies on that for broadcast ordering.
pub trait ClientChannel: Send + Sync {
    /// Queue a message. Returns `false` once the peer is gone; the engine
    /// treats that as a silent no-op and lets the connection driver clean up.
    fn push(&self, msg: Outbound) -> bool;
}

impl ClientChannel for mpsc::UnboundedSender<Outbound> {
    fn push(&self, msg: Outbound) -> bool {
        self.send(msg).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_shape() {
        let cmd: ClientCommand =
            serde_json::from_str(r#"{"event":"join-vault","vaultId":"team-notes"}"#).unwrap();
        assert_eq!(
            cmd,
            ClientCommand::JoinVault {
                vault_id: "team-notes".into()
            }
        );

        let json = serde_json::to_string(&ClientCommand::Authenticate {
            token: "t0k".into(),
        })
        .unwrap();
        assert!(json.contains(r#""event":"authenticate""#));
        assert!(json.contains(r#""token":"t0k""#));
    }

    #[test]
    fn test_event_wire_shape() {
        let ev = ServerEvent::PermissionDenied {
            action: DeniedAction::Write,
            vault_id: "v2".into(),
            message: "viewers cannot write".into(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains(r#""event":"permission-denied""#));
        assert!(json.contains(r#""action":"write""#));
        assert!(json.contains(r#""vaultId":"v2""#));

        let back: ServerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn test_authenticated_omits_absent_user() {
        let json = serde_json::to_string(&ServerEvent::Authenticated {
            success: false,
            user: None,
        })
        .unwrap();
        assert!(!json.contains("user"));
    }

    #[test]
    fn test_channel_push_reports_closed_peer() {
        let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
        assert!(tx.push(Outbound::Event(ServerEvent::Pong)));
        drop(rx);
        assert!(!tx.push(Outbound::Event(ServerEvent::Pong)));
    }
}
