//! Per-connection session state.
//!
//! A connection progresses `New → Authed → Joined → Gone`; authentication
//! must precede any vault join, and a session is joined to at most one
//! vault at a time. All connection-scoped facts live here explicitly.

use std::sync::Arc;

use crate::events::{ClientChannel, Outbound, ServerEvent};
use quill_store::VaultId;

/// Identity returned by the external credential store for a valid token.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthUser {
    pub id: i64,
    pub name: String,
    pub is_server_admin: bool,
}

/// The seam to the external credential store. Token hashing, minting and
/// expiry live on the other side of this trait.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Option<AuthUser>;
}

#[derive(Debug, Clone, PartialEq)]
enum SessionState {
    New,
    Authed { user: AuthUser },
    Joined { user: AuthUser, vault_id: VaultId },
    Gone,
}

/// One client connection's state, owned by its connection driver task.
pub struct Session {
    conn_id: u64,
    channel: Arc<dyn ClientChannel>,
    state: SessionState,
}

impl Session {
    pub(crate) fn new(conn_id: u64, channel: Arc<dyn ClientChannel>) -> Self {
        Self {
            conn_id,
            channel,
            state: SessionState::New,
        }
    }

    /// Process-unique connection id; also the key in a vault's client set.
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn channel(&self) -> &Arc<dyn ClientChannel> {
        &self.channel
    }

    pub fn is_authenticated(&self) -> bool {
        !matches!(self.state, SessionState::New | SessionState::Gone)
    }

    pub fn user(&self) -> Option<&AuthUser> {
        match &self.state {
            SessionState::Authed { user } | SessionState::Joined { user, .. } => Some(user),
            _ => None,
        }
    }

    pub fn joined_vault(&self) -> Option<&VaultId> {
        match &self.state {
            SessionState::Joined { vault_id, .. } => Some(vault_id),
            _ => None,
        }
    }

    /// Queue a control event on this connection.
    pub fn send(&self, event: ServerEvent) {
        self.channel.push(Outbound::Event(event));
    }

    pub(crate) fn set_authenticated(&mut self, user: AuthUser) {
        self.state = match std::mem::replace(&mut self.state, SessionState::Gone) {
            // Re-authentication keeps the joined vault.
            SessionState::Joined { vault_id, .. } => SessionState::Joined { user, vault_id },
            _ => SessionState::Authed { user },
        };
    }

    pub(crate) fn set_joined(&mut self, vault_id: VaultId) {
        if let Some(user) = self.user().cloned() {
            self.state = SessionState::Joined { user, vault_id };
        }
    }

    /// Leave the vault but stay authenticated.
    pub(crate) fn set_left(&mut self) -> Option<VaultId> {
        match std::mem::replace(&mut self.state, SessionState::Gone) {
            SessionState::Joined { user, vault_id } => {
                self.state = SessionState::Authed { user };
                Some(vault_id)
            }
            other => {
                self.state = other;
                None
            }
        }
    }

    pub(crate) fn set_gone(&mut self) {
        self.state = SessionState::Gone;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn session() -> (Session, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Session::new(1, Arc::new(tx)), rx)
    }

    fn user() -> AuthUser {
        AuthUser {
            id: 42,
            name: "alice".into(),
            is_server_admin: false,
        }
    }

    #[test]
    fn test_lifecycle() {
        let (mut s, _rx) = session();
        assert!(!s.is_authenticated());
        assert!(s.user().is_none());

        s.set_authenticated(user());
        assert!(s.is_authenticated());
        assert!(s.joined_vault().is_none());

        s.set_joined(VaultId::parse("v1").unwrap());
        assert_eq!(s.joined_vault().map(|v| v.as_str()), Some("v1"));

        let left = s.set_left();
        assert_eq!(left.map(|v| v.to_string()), Some("v1".to_string()));
        assert!(s.is_authenticated());
        assert!(s.joined_vault().is_none());

        s.set_gone();
        assert!(!s.is_authenticated());
    }

    #[test]
    fn test_join_requires_auth() {
        let (mut s, _rx) = session();
        s.set_joined(VaultId::parse("v1").unwrap());
        assert!(s.joined_vault().is_none());
    }

    #[test]
    fn test_send_queues_event() {
        let (s, mut rx) = session();
        s.send(ServerEvent::Pong);
        match rx.try_recv().unwrap() {
            Outbound::Event(ServerEvent::Pong) => {}
            other => panic!("unexpected outbound: {other:?}"),
        }
    }
}
