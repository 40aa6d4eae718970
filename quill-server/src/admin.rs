//! The programmatic administrative boundary.
//!
//! An external HTTP router calls into this facade; nothing here knows about
//! requests or responses. Every operation authenticates the caller's token
//! and checks their vault role. Server admins bypass per-vault roles for
//! administrative reads and writes — except ownership transfer, which only
//! the current owner may invoke.

use std::sync::Arc;

use thiserror::Error;

use quill_collab::{AuthUser, EngineError, SyncEngine, TokenVerifier};
use quill_store::{
    Actor, BackupError, BackupInfo, BackupKind, BackupScheduler, Membership, PermissionError,
    Role, VaultError, VaultId,
};

/// Error taxonomy of the administrative boundary.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<VaultError> for ApiError {
    fn from(e: VaultError) -> Self {
        match e {
            VaultError::AlreadyExists(v) => ApiError::Conflict(format!("vault {v} exists")),
            VaultError::VaultNotFound(v) => ApiError::NotFound(format!("vault {v}")),
            VaultError::FileNotFound(p) => ApiError::NotFound(format!("file {p}")),
            VaultError::InvalidVaultId(v) => ApiError::Invalid(format!("vault id {v:?}")),
            VaultError::InvalidPath(p) => ApiError::Invalid(format!("path {p:?}")),
            VaultError::Io(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<PermissionError> for ApiError {
    fn from(e: PermissionError) -> Self {
        match e {
            PermissionError::AlreadyMember => ApiError::Conflict("already a member".into()),
            PermissionError::AlreadyOwned => ApiError::Conflict("vault already has an owner".into()),
            PermissionError::InsufficientRole
            | PermissionError::IsOwner
            | PermissionError::IsOwnerAssignment
            | PermissionError::CannotSelf => ApiError::Forbidden,
            PermissionError::InvalidRole(r) => ApiError::Invalid(format!("role {r:?}")),
            PermissionError::NotFound => ApiError::NotFound("membership".into()),
            PermissionError::Database(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<BackupError> for ApiError {
    fn from(e: BackupError) -> Self {
        match e {
            BackupError::NotFound { vault_id, kind, name } => {
                ApiError::NotFound(format!("backup {vault_id}/{kind}/{name}"))
            }
            BackupError::VaultNotFound(v) => ApiError::NotFound(format!("vault {v}")),
            BackupError::Io(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Store(e) => e.into(),
            EngineError::Permission(e) => e.into(),
            EngineError::Protocol(e) => ApiError::Invalid(e.to_string()),
            EngineError::Crdt(e) => ApiError::Internal(e),
            EngineError::NotAuthenticated => ApiError::Unauthorized,
            EngineError::NotJoined => ApiError::Invalid("no vault joined".into()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;

pub struct AdminApi {
    engine: Arc<SyncEngine>,
    backups: Arc<BackupScheduler>,
    verifier: Arc<dyn TokenVerifier>,
}

impl AdminApi {
    pub fn new(
        engine: Arc<SyncEngine>,
        backups: Arc<BackupScheduler>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        Self {
            engine,
            backups,
            verifier,
        }
    }

    // ── vaults ──────────────────────────────────────────────────────

    pub async fn create_vault(&self, token: &str, vault_id: &str) -> Result<()> {
        let user = self.authorize(token)?;
        let vault_id = parse_vault(vault_id)?;
        self.engine.registry().store().create_vault(&vault_id).await?;
        self.engine
            .permissions()
            .set_owner(vault_id.as_str(), user.id)?;
        log::info!("vault {vault_id}: created by user {}", user.id);
        Ok(())
    }

    pub async fn delete_vault(&self, token: &str, vault_id: &str) -> Result<()> {
        let user = self.authorize(token)?;
        let vault_id = parse_vault(vault_id)?;
        self.require_role(&user, &vault_id, Role::Owner)?;

        // Drop the live doc first so no materializer writes into the tree
        // while it is being removed, then cascade rows, then the directory.
        self.engine.registry().discard(&vault_id).await;
        self.engine
            .permissions()
            .remove_vault_memberships(vault_id.as_str())?;
        self.engine.registry().store().delete_vault(&vault_id).await?;
        log::info!("vault {vault_id}: deleted by user {}", user.id);
        Ok(())
    }

    /// Vaults visible to the caller: their memberships, or every vault on
    /// disk for a server admin (role `None` where they are not a member).
    pub async fn list_vaults(&self, token: &str) -> Result<Vec<(String, Option<Role>)>> {
        let user = self.authorize(token)?;
        if user.is_server_admin {
            let mut out = Vec::new();
            for id in self.engine.registry().store().vault_ids().await? {
                let role = self.engine.permissions().get_role(user.id, id.as_str())?;
                out.push((id.to_string(), role));
            }
            return Ok(out);
        }
        Ok(self
            .engine
            .permissions()
            .vaults_of(user.id)?
            .into_iter()
            .map(|(vault, role)| (vault, Some(role)))
            .collect())
    }

    // ── files ───────────────────────────────────────────────────────

    pub async fn list_files(&self, token: &str, vault_id: &str) -> Result<Vec<String>> {
        let user = self.authorize(token)?;
        let vault_id = parse_vault(vault_id)?;
        self.require_role(&user, &vault_id, Role::Viewer)?;
        Ok(self.engine.list_files(&vault_id).await?)
    }

    pub async fn read_file(&self, token: &str, vault_id: &str, path: &str) -> Result<String> {
        let user = self.authorize(token)?;
        let vault_id = parse_vault(vault_id)?;
        self.require_role(&user, &vault_id, Role::Viewer)?;
        Ok(self.engine.read_file(&vault_id, path).await?)
    }

    /// Write through the CRDT so joined editors converge on the new content.
    pub async fn write_file(
        &self,
        token: &str,
        vault_id: &str,
        path: &str,
        content: &str,
    ) -> Result<()> {
        let user = self.authorize(token)?;
        let vault_id = parse_vault(vault_id)?;
        self.require_role(&user, &vault_id, Role::Editor)?;
        Ok(self.engine.write_file(&vault_id, path, content).await?)
    }

    pub async fn delete_file(&self, token: &str, vault_id: &str, path: &str) -> Result<()> {
        let user = self.authorize(token)?;
        let vault_id = parse_vault(vault_id)?;
        self.require_role(&user, &vault_id, Role::Editor)?;
        Ok(self.engine.delete_file(&vault_id, path).await?)
    }

    // ── members ─────────────────────────────────────────────────────

    pub fn list_members(&self, token: &str, vault_id: &str) -> Result<Vec<Membership>> {
        let user = self.authorize(token)?;
        let vault_id = parse_vault(vault_id)?;
        self.require_role(&user, &vault_id, Role::Viewer)?;
        Ok(self.engine.permissions().members(vault_id.as_str())?)
    }

    pub async fn add_member(
        &self,
        token: &str,
        vault_id: &str,
        user_id: i64,
        role: &str,
    ) -> Result<()> {
        let actor = self.authorize(token)?;
        let vault_id = parse_vault(vault_id)?;
        let role = parse_role(role)?;
        self.engine
            .permissions()
            .add_member(vault_id.as_str(), user_id, role, actor_for(&actor))?;
        self.engine.refresh_role(&vault_id, user_id).await;
        Ok(())
    }

    pub async fn update_role(
        &self,
        token: &str,
        vault_id: &str,
        user_id: i64,
        role: &str,
    ) -> Result<()> {
        let actor = self.authorize(token)?;
        let vault_id = parse_vault(vault_id)?;
        let role = parse_role(role)?;
        self.engine
            .permissions()
            .update_role(vault_id.as_str(), user_id, role, actor_for(&actor))?;
        self.engine.refresh_role(&vault_id, user_id).await;
        Ok(())
    }

    pub async fn remove_member(&self, token: &str, vault_id: &str, user_id: i64) -> Result<()> {
        let actor = self.authorize(token)?;
        let vault_id = parse_vault(vault_id)?;
        self.engine
            .permissions()
            .remove_member(vault_id.as_str(), user_id, actor_for(&actor))?;
        self.engine.refresh_role(&vault_id, user_id).await;
        Ok(())
    }

    /// Only the current owner may transfer ownership; there is no
    /// server-admin bypass here.
    pub async fn transfer_ownership(
        &self,
        token: &str,
        vault_id: &str,
        new_owner_id: i64,
    ) -> Result<()> {
        let actor = self.authorize(token)?;
        let vault_id = parse_vault(vault_id)?;
        self.engine
            .permissions()
            .transfer_ownership(vault_id.as_str(), new_owner_id, actor.id)?;
        self.engine.refresh_role(&vault_id, actor.id).await;
        self.engine.refresh_role(&vault_id, new_owner_id).await;
        Ok(())
    }

    // ── backups ─────────────────────────────────────────────────────

    pub async fn list_backups(&self, token: &str, vault_id: &str) -> Result<Vec<BackupInfo>> {
        let user = self.authorize(token)?;
        let vault_id = parse_vault(vault_id)?;
        self.require_role(&user, &vault_id, Role::Admin)?;
        Ok(self.backups.list(&vault_id).await?)
    }

    pub async fn create_backup(&self, token: &str, vault_id: &str) -> Result<BackupInfo> {
        let user = self.authorize(token)?;
        let vault_id = parse_vault(vault_id)?;
        self.require_role(&user, &vault_id, Role::Admin)?;
        Ok(self.backups.snapshot_vault(&vault_id).await?)
    }

    /// Restore a backup and drop the live doc so the next join reloads the
    /// restored tree from disk.
    pub async fn restore_backup(
        &self,
        token: &str,
        vault_id: &str,
        kind: &str,
        name: &str,
    ) -> Result<()> {
        let user = self.authorize(token)?;
        let vault_id = parse_vault(vault_id)?;
        self.require_role(&user, &vault_id, Role::Admin)?;
        let kind = BackupKind::parse(kind)
            .ok_or_else(|| ApiError::Invalid(format!("backup kind {kind:?}")))?;
        self.backups.restore(&vault_id, kind, name).await?;
        self.engine.registry().discard(&vault_id).await;
        Ok(())
    }

    // ── helpers ─────────────────────────────────────────────────────

    fn authorize(&self, token: &str) -> Result<AuthUser> {
        let user = self.verifier.verify(token).ok_or(ApiError::Unauthorized)?;
        self.engine
            .permissions()
            .upsert_user(user.id, &user.name, user.is_server_admin)
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok(user)
    }

    fn require_role(&self, user: &AuthUser, vault_id: &VaultId, min: Role) -> Result<()> {
        if user.is_server_admin {
            return Ok(());
        }
        match self.engine.permissions().get_role(user.id, vault_id.as_str())? {
            Some(role) if role >= min => Ok(()),
            _ => Err(ApiError::Forbidden),
        }
    }
}

fn parse_vault(raw: &str) -> Result<VaultId> {
    VaultId::parse(raw).map_err(ApiError::from)
}

fn parse_role(raw: &str) -> Result<Role> {
    Role::parse(raw).ok_or_else(|| ApiError::Invalid(format!("role {raw:?}")))
}

fn actor_for(user: &AuthUser) -> Actor {
    if user.is_server_admin {
        Actor::System
    } else {
        Actor::User(user.id)
    }
}
