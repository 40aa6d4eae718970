//! The sync engine: per-client protocol handling and fan-out.
//!
//! ```text
//! Client A ──┐                        ┌── broadcast ──► Client B
//!            ├── SyncEngine ── VaultEntry (doc + awareness + clients)
//! Client B ──┘        │                └── debounce ──► VaultStore
//!                     └── PermissionStore (roles, write gate)
//! ```
//!
//! Every inbound frame is applied under the vault's single lock, then fanned
//! out to all other clients of the same vault through their outbound
//! channels (FIFO per recipient, originator excluded). Mutating frames from
//! viewers are neither applied nor broadcast; the sender gets a
//! `permission-denied` event instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quill_store::{PermissionError, PermissionStore, Role, VaultError, VaultId};

use crate::awareness::AwarenessDelta;
use crate::events::{ClientChannel, DeniedAction, Outbound, ServerEvent, UserInfo};
use crate::protocol::{Frame, ProtocolError, SyncPayload};
use crate::registry::{ClientHandle, DocRegistry, VaultState};
use crate::session::{Session, TokenVerifier};

/// Delay between the staged join messages (file list, SyncStep1, SyncStep2).
/// Prevents frame coalescing on some client transports; not semantic.
const JOIN_PACING: Duration = Duration::from_millis(25);

#[derive(Debug)]
pub enum EngineError {
    Store(VaultError),
    Permission(PermissionError),
    Protocol(ProtocolError),
    Crdt(String),
    NotAuthenticated,
    NotJoined,
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(e) => write!(f, "store error: {e}"),
            Self::Permission(e) => write!(f, "permission error: {e}"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::Crdt(e) => write!(f, "CRDT error: {e}"),
            Self::NotAuthenticated => write!(f, "authentication required"),
            Self::NotJoined => write!(f, "no vault joined"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<VaultError> for EngineError {
    fn from(e: VaultError) -> Self {
        Self::Store(e)
    }
}

impl From<PermissionError> for EngineError {
    fn from(e: PermissionError) -> Self {
        Self::Permission(e)
    }
}

impl From<ProtocolError> for EngineError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

/// Engine counters, readable at any time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub total_connections: u64,
    pub frames_received: u64,
    pub broadcasts: u64,
    pub permission_denials: u64,
}

/// Lock-free counters; incremented on the hot path without any lock.
#[derive(Default)]
struct AtomicEngineStats {
    total_connections: AtomicU64,
    frames_received: AtomicU64,
    broadcasts: AtomicU64,
    permission_denials: AtomicU64,
}

impl AtomicEngineStats {
    fn snapshot(&self) -> EngineStats {
        EngineStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            permission_denials: self.permission_denials.load(Ordering::Relaxed),
        }
    }
}

pub struct SyncEngine {
    registry: Arc<DocRegistry>,
    permissions: Arc<PermissionStore>,
    verifier: Arc<dyn TokenVerifier>,
    pacing: Duration,
    next_conn_id: AtomicU64,
    stats: AtomicEngineStats,
}

impl SyncEngine {
    pub fn new(
        registry: Arc<DocRegistry>,
        permissions: Arc<PermissionStore>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        Self {
            registry,
            permissions,
            verifier,
            pacing: JOIN_PACING,
            next_conn_id: AtomicU64::new(1),
            stats: AtomicEngineStats::default(),
        }
    }

    /// Current counter snapshot.
    pub fn stats(&self) -> EngineStats {
        self.stats.snapshot()
    }

    pub fn registry(&self) -> &Arc<DocRegistry> {
        &self.registry
    }

    pub fn permissions(&self) -> &Arc<PermissionStore> {
        &self.permissions
    }

    /// Create the session for a freshly accepted connection.
    pub fn open_session(&self, channel: Arc<dyn ClientChannel>) -> Session {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        Session::new(conn_id, channel)
    }

    /// Handle a JSON control command.
    pub async fn handle_command(&self, session: &mut Session, cmd: crate::events::ClientCommand) {
        use crate::events::ClientCommand;
        match cmd {
            ClientCommand::Authenticate { token } => self.authenticate(session, &token),
            ClientCommand::JoinVault { vault_id } => self.join_vault(session, &vault_id).await,
            ClientCommand::LeaveVault { vault_id } => {
                let joined = session
                    .joined_vault()
                    .map(|v| v.as_str() == vault_id)
                    .unwrap_or(false);
                if joined {
                    self.leave_vault(session).await;
                } else {
                    session.send(ServerEvent::Error {
                        message: format!("not joined to vault {vault_id:?}"),
                    });
                }
            }
            ClientCommand::Ping => session.send(ServerEvent::Pong),
        }
    }

    /// Verify a token with the external credential store.
    pub fn authenticate(&self, session: &mut Session, token: &str) {
        match self.verifier.verify(token) {
            Some(user) => {
                if let Err(e) =
                    self.permissions
                        .upsert_user(user.id, &user.name, user.is_server_admin)
                {
                    log::error!("failed to upsert user {}: {e}", user.id);
                    session.send(ServerEvent::Error {
                        message: "internal error".into(),
                    });
                    return;
                }
                log::info!("conn {}: authenticated as {} ({})", session.conn_id(), user.name, user.id);
                let info = UserInfo {
                    user_id: user.id,
                    name: user.name.clone(),
                    is_server_admin: user.is_server_admin,
                };
                session.set_authenticated(user);
                session.send(ServerEvent::Authenticated {
                    success: true,
                    user: Some(info),
                });
            }
            None => {
                log::warn!("conn {}: authentication rejected", session.conn_id());
                session.send(ServerEvent::Authenticated {
                    success: false,
                    user: None,
                });
            }
        }
    }

    /// Join a vault, determine the role, and run the staged catch-up:
    /// file list → SyncStep1 → eager SyncStep2 → awareness.
    pub async fn join_vault(&self, session: &mut Session, vault_id_raw: &str) {
        let Some(user) = session.user().cloned() else {
            session.send(ServerEvent::Error {
                message: "authentication required before joining a vault".into(),
            });
            return;
        };
        let vault_id = match VaultId::parse(vault_id_raw) {
            Ok(id) => id,
            Err(_) => {
                session.send(ServerEvent::Error {
                    message: format!("invalid vault id {vault_id_raw:?}"),
                });
                return;
            }
        };

        // One vault per session: joining another implies leaving the first.
        if session.joined_vault().is_some() {
            self.leave_vault(session).await;
        }

        let role = match self.resolve_join_role(&vault_id, user.id) {
            Ok(Some(role)) => role,
            Ok(None) => {
                self.stats.permission_denials.fetch_add(1, Ordering::Relaxed);
                session.send(ServerEvent::PermissionDenied {
                    action: DeniedAction::Join,
                    vault_id: vault_id.to_string(),
                    message: "you are not a member of this vault".into(),
                });
                return;
            }
            Err(e) => {
                log::error!("vault {vault_id}: role lookup failed: {e}");
                session.send(ServerEvent::Error {
                    message: "internal error".into(),
                });
                return;
            }
        };

        let entry = match self.registry.get_or_create(&vault_id).await {
            Ok(entry) => entry,
            Err(e) => {
                log::error!("vault {vault_id}: load failed: {e}");
                session.send(ServerEvent::Error {
                    message: "failed to open vault".into(),
                });
                return;
            }
        };

        let (files, state_vector, full_update, awareness) = {
            let mut state = entry.state.lock().await;
            state.clients.insert(
                session.conn_id(),
                ClientHandle {
                    conn_id: session.conn_id(),
                    user_id: user.id,
                    user_name: user.name.clone(),
                    role,
                    channel: session.channel().clone(),
                    awareness_ids: Default::default(),
                },
            );
            broadcast_event_except(
                &state,
                session.conn_id(),
                ServerEvent::UserJoined {
                    user_id: user.id,
                    name: user.name.clone(),
                    role,
                },
            );
            (
                state.file_list(),
                state.encode_state_vector(),
                state.encode_full_update(),
                state.awareness.snapshot(),
            )
        };

        session.set_joined(vault_id.clone());
        session.send(ServerEvent::VaultJoined {
            vault_id: vault_id.to_string(),
            role,
        });
        session.send(ServerEvent::FileList { files });

        // Staged catch-up with pacing between the binary frames.
        let channel = session.channel().clone();
        tokio::time::sleep(self.pacing).await;
        channel.push(Outbound::Frame(Arc::new(
            Frame::sync_step1(state_vector).encode(),
        )));
        tokio::time::sleep(self.pacing).await;
        channel.push(Outbound::Frame(Arc::new(
            Frame::sync_step2(full_update).encode(),
        )));
        if let Some(snapshot) = awareness {
            match snapshot.encode() {
                Ok(bytes) => {
                    channel.push(Outbound::Frame(Arc::new(Frame::awareness(bytes).encode())));
                }
                Err(e) => log::warn!("vault {vault_id}: awareness snapshot encode failed: {e}"),
            }
        }
        log::info!(
            "conn {}: user {} joined vault {vault_id} as {role}",
            session.conn_id(),
            user.id
        );
    }

    /// Role resolution on join, including the legacy-vault migration: the
    /// first user to join a vault with an empty member table becomes owner.
    fn resolve_join_role(
        &self,
        vault_id: &VaultId,
        user_id: i64,
    ) -> Result<Option<Role>, EngineError> {
        if !self.permissions.has_members(vault_id.as_str())? {
            self.permissions.set_owner(vault_id.as_str(), user_id)?;
            log::info!("vault {vault_id}: user {user_id} promoted to owner (no members)");
            return Ok(Some(Role::Owner));
        }
        Ok(self.permissions.get_role(user_id, vault_id.as_str())?)
    }

    /// Leave the currently joined vault, dropping this client's awareness
    /// entries and evicting the vault if it was the last client.
    pub async fn leave_vault(&self, session: &mut Session) {
        let Some(vault_id) = session.set_left() else {
            return;
        };
        let Some(entry) = self.registry.get(&vault_id).await else {
            return;
        };

        let last_client = {
            let mut state = entry.state.lock().await;
            let Some(handle) = state.clients.remove(&session.conn_id()) else {
                return;
            };
            if let Some(removal) = state.awareness.remove_clients(handle.awareness_ids.iter()) {
                match removal.encode() {
                    Ok(bytes) => {
                        let frame = Arc::new(Frame::awareness(bytes).encode());
                        broadcast_frame_except(&state, session.conn_id(), frame);
                    }
                    Err(e) => log::warn!("vault {vault_id}: awareness removal encode failed: {e}"),
                }
            }
            broadcast_event_except(
                &state,
                session.conn_id(),
                ServerEvent::UserLeft {
                    user_id: handle.user_id,
                    name: handle.user_name.clone(),
                },
            );
            state.clients.is_empty()
        };

        log::info!("conn {}: left vault {vault_id}", session.conn_id());
        if last_client {
            if let Err(e) = self.registry.flush_and_evict(&vault_id).await {
                log::error!("vault {vault_id}: flush on last leave failed: {e}");
            }
        }
    }

    /// Connection teardown: leave and forget.
    pub async fn disconnect(&self, session: &mut Session) {
        self.leave_vault(session).await;
        session.set_gone();
    }

    /// Handle a binary sync/awareness frame from a client.
    ///
    /// Returns `Err` only for state-machine violations (unauthenticated or
    /// unjoined senders) — the connection driver drops those connections.
    /// Undecodable frames are logged and skipped; the connection survives.
    pub async fn handle_frame(
        &self,
        session: &mut Session,
        bytes: &[u8],
    ) -> Result<(), EngineError> {
        if !session.is_authenticated() {
            session.send(ServerEvent::Error {
                message: "authentication required".into(),
            });
            return Err(EngineError::NotAuthenticated);
        }
        let Some(vault_id) = session.joined_vault().cloned() else {
            session.send(ServerEvent::Error {
                message: "join a vault before syncing".into(),
            });
            return Err(EngineError::NotJoined);
        };

        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!(
                    "conn {}: dropping undecodable frame ({e})",
                    session.conn_id()
                );
                return Ok(());
            }
        };

        let Some(entry) = self.registry.get(&vault_id).await else {
            session.send(ServerEvent::Error {
                message: "vault is no longer loaded".into(),
            });
            return Err(EngineError::NotJoined);
        };

        match frame {
            Frame::Sync(SyncPayload::Step1(state_vector)) => {
                let state = entry.state.lock().await;
                match state.encode_diff(&state_vector) {
                    Ok(diff) => {
                        session
                            .channel()
                            .push(Outbound::Frame(Arc::new(Frame::sync_step2(diff).encode())));
                    }
                    Err(e) => log::warn!(
                        "conn {}: dropping SyncStep1 with bad state vector ({e})",
                        session.conn_id()
                    ),
                }
            }
            Frame::Sync(payload) => {
                // SyncStep2 or Update: both carry a mutation.
                let state = entry.state.lock().await;
                let role = state
                    .clients
                    .get(&session.conn_id())
                    .map(|c| c.role)
                    .unwrap_or(Role::Viewer);
                if !role.can_write() {
                    self.stats.permission_denials.fetch_add(1, Ordering::Relaxed);
                    session.send(ServerEvent::PermissionDenied {
                        action: DeniedAction::Write,
                        vault_id: vault_id.to_string(),
                        message: "viewers cannot modify vault content".into(),
                    });
                    return Ok(());
                }
                let body = payload.body().to_vec();
                if let Err(e) = state.apply_update_bytes(&body) {
                    log::warn!("conn {}: dropping bad update ({e})", session.conn_id());
                    return Ok(());
                }
                // Received diffs are rebroadcast as plain updates.
                let frame = Arc::new(Frame::sync_update(body).encode());
                broadcast_frame_except(&state, session.conn_id(), frame);
                self.stats.broadcasts.fetch_add(1, Ordering::Relaxed);
            }
            Frame::Awareness(delta_bytes) => {
                let delta = match AwarenessDelta::decode(&delta_bytes) {
                    Ok(delta) => delta,
                    Err(e) => {
                        log::warn!(
                            "conn {}: dropping bad awareness delta ({e})",
                            session.conn_id()
                        );
                        return Ok(());
                    }
                };
                let mut state = entry.state.lock().await;
                let touched = state.awareness.apply(&delta);
                if let Some(client) = state.clients.get_mut(&session.conn_id()) {
                    client.awareness_ids.extend(touched);
                }
                let frame = Arc::new(Frame::awareness(delta_bytes).encode());
                broadcast_frame_except(&state, session.conn_id(), frame);
                self.stats.broadcasts.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Push a role change into any live session of `user_id` on `vault_id`.
    ///
    /// Called by the administrative boundary after membership mutations so
    /// the write gate uses the fresh role without waiting for a rejoin.
    pub async fn refresh_role(&self, vault_id: &VaultId, user_id: i64) {
        let Some(entry) = self.registry.get(vault_id).await else {
            return;
        };
        let role = match self.permissions.get_role(user_id, vault_id.as_str()) {
            Ok(role) => role,
            Err(e) => {
                log::error!("vault {vault_id}: role refresh lookup failed: {e}");
                return;
            }
        };
        let mut state = entry.state.lock().await;
        for client in state.clients.values_mut() {
            if client.user_id != user_id {
                continue;
            }
            // Removed members fall back to viewer until their next join
            // attempt, which will then be refused outright.
            client.role = role.unwrap_or(Role::Viewer);
            client.channel.push(Outbound::Event(ServerEvent::VaultRole {
                vault_id: vault_id.to_string(),
                role: client.role,
            }));
            log::info!(
                "vault {vault_id}: pushed role {} to user {user_id}",
                client.role
            );
        }
    }

    /// Server-side file write, applied through the CRDT so every joined
    /// client converges on it. Used by the administrative boundary.
    pub async fn write_file(
        &self,
        vault_id: &VaultId,
        path: &str,
        content: &str,
    ) -> Result<(), EngineError> {
        let entry = self.registry.get_or_create(vault_id).await?;
        {
            let state = entry.state.lock().await;
            let update = state.set_file_text(path, content);
            let frame = Arc::new(Frame::sync_update(update).encode());
            broadcast_frame_except(&state, 0, frame);
        }
        self.release_if_idle(vault_id).await;
        Ok(())
    }

    /// Server-side file delete through the CRDT.
    pub async fn delete_file(&self, vault_id: &VaultId, path: &str) -> Result<(), EngineError> {
        let entry = self.registry.get_or_create(vault_id).await?;
        {
            let state = entry.state.lock().await;
            if let Some(update) = state.remove_file(path) {
                let frame = Arc::new(Frame::sync_update(update).encode());
                broadcast_frame_except(&state, 0, frame);
            }
        }
        // The materialized file goes too, without waiting for the debounce.
        self.registry.store().delete_file(vault_id, path).await?;
        self.release_if_idle(vault_id).await;
        Ok(())
    }

    /// Server-side read of one file's current content.
    pub async fn read_file(&self, vault_id: &VaultId, path: &str) -> Result<String, EngineError> {
        let entry = self.registry.get_or_create(vault_id).await?;
        let content = { entry.state.lock().await.file_text(path) };
        self.release_if_idle(vault_id).await;
        content.ok_or_else(|| EngineError::Store(VaultError::FileNotFound(path.to_string())))
    }

    /// Sorted file paths currently in the vault's CRDT.
    pub async fn list_files(&self, vault_id: &VaultId) -> Result<Vec<String>, EngineError> {
        let entry = self.registry.get_or_create(vault_id).await?;
        let files = { entry.state.lock().await.file_list() };
        self.release_if_idle(vault_id).await;
        Ok(files)
    }

    /// Evict a vault that an administrative call loaded but nobody joined.
    async fn release_if_idle(&self, vault_id: &VaultId) {
        let Some(entry) = self.registry.get(vault_id).await else {
            return;
        };
        let idle = { entry.state.lock().await.clients.is_empty() };
        if idle {
            if let Err(e) = self.registry.flush_and_evict(vault_id).await {
                log::error!("vault {vault_id}: flush after admin access failed: {e}");
            }
        }
    }
}

/// Queue a frame on every client of the vault except `skip`.
pub(crate) fn broadcast_frame_except(state: &VaultState, skip: u64, frame: Arc<Vec<u8>>) {
    for (conn_id, client) in &state.clients {
        if *conn_id == skip {
            continue;
        }
        client.channel.push(Outbound::Frame(frame.clone()));
    }
}

/// Queue a control event on every client of the vault except `skip`.
pub(crate) fn broadcast_event_except(state: &VaultState, skip: u64, event: ServerEvent) {
    for (conn_id, client) in &state.clients {
        if *conn_id == skip {
            continue;
        }
        client.channel.push(Outbound::Event(event.clone()));
    }
}
