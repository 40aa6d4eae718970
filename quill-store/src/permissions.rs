//! Membership roles for vaults.
//!
//! One sqlite table maps `(vault_id, user_id)` to a role in the fixed
//! hierarchy `viewer < editor < admin < owner`. Invariants enforced here:
//!
//! - at most one `owner` per vault,
//! - an actor only assigns roles strictly below their own, to targets
//!   strictly below their own,
//! - `owner` never moves through [`PermissionStore::add_member`] or
//!   [`PermissionStore::update_role`]; only
//!   [`PermissionStore::transfer_ownership`] (transactional) and the
//!   [`PermissionStore::set_owner`] seed may assign it.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Vault role, ordered by privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Editor,
    Admin,
    Owner,
}

impl Role {
    pub fn rank(self) -> u8 {
        match self {
            Role::Viewer => 1,
            Role::Editor => 2,
            Role::Admin => 3,
            Role::Owner => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Editor => "editor",
            Role::Admin => "admin",
            Role::Owner => "owner",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "viewer" => Some(Role::Viewer),
            "editor" => Some(Role::Editor),
            "admin" => Some(Role::Admin),
            "owner" => Some(Role::Owner),
            _ => None,
        }
    }

    /// Roles that may mutate vault content over the sync socket.
    pub fn can_write(self) -> bool {
        self >= Role::Editor
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is performing a membership mutation.
///
/// `System` skips the actor-rank checks; it is reserved for vault creation,
/// the first-join legacy migration, and server-admin calls at the
/// administrative boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    System,
    User(i64),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Membership {
    pub vault_id: String,
    pub user_id: i64,
    pub user_name: String,
    pub role: Role,
    pub added_by: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Error)]
pub enum PermissionError {
    #[error("user is already a member")]
    AlreadyMember,

    #[error("vault already has an owner")]
    AlreadyOwned,

    #[error("actor role is insufficient")]
    InsufficientRole,

    #[error("invalid role: {0:?}")]
    InvalidRole(String),

    #[error("owner is only assignable via ownership transfer")]
    IsOwnerAssignment,

    #[error("the vault owner cannot be removed")]
    IsOwner,

    #[error("membership not found")]
    NotFound,

    #[error("operation cannot target the acting user")]
    CannotSelf,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, PermissionError>;

/// Persistent membership table.
///
/// Synchronous rusqlite behind a mutex; every query is a point lookup on a
/// small table, so callers in async context use it directly.
pub struct PermissionStore {
    conn: Mutex<Connection>,
}

impl PermissionStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             CREATE TABLE IF NOT EXISTS users (
                 user_id INTEGER PRIMARY KEY,
                 name TEXT NOT NULL,
                 is_server_admin INTEGER NOT NULL DEFAULT 0
             );
             CREATE TABLE IF NOT EXISTS memberships (
                 vault_id TEXT NOT NULL,
                 user_id INTEGER NOT NULL,
                 role TEXT NOT NULL CHECK (role IN ('viewer','editor','admin','owner')),
                 added_by INTEGER,
                 created_at INTEGER NOT NULL,
                 PRIMARY KEY (vault_id, user_id),
                 FOREIGN KEY (user_id) REFERENCES users(user_id) ON DELETE CASCADE
             );
             CREATE INDEX IF NOT EXISTS idx_memberships_user ON memberships(user_id);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("permission store mutex poisoned")
    }

    /// Insert or refresh a user row. Called on every successful
    /// authentication so membership foreign keys always resolve.
    pub fn upsert_user(&self, user_id: i64, name: &str, is_server_admin: bool) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (user_id, name, is_server_admin) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET name = ?2, is_server_admin = ?3",
            params![user_id, name, is_server_admin as i64],
        )?;
        Ok(())
    }

    /// Delete a user; their memberships cascade.
    pub fn remove_user(&self, user_id: i64) -> Result<()> {
        let n = self
            .conn()
            .execute("DELETE FROM users WHERE user_id = ?1", params![user_id])?;
        if n == 0 {
            return Err(PermissionError::NotFound);
        }
        Ok(())
    }

    pub fn get_role(&self, user_id: i64, vault_id: &str) -> Result<Option<Role>> {
        let conn = self.conn();
        role_of(&conn, vault_id, user_id)
    }

    pub fn has_role_or_higher(&self, user_id: i64, vault_id: &str, min: Role) -> Result<bool> {
        Ok(self
            .get_role(user_id, vault_id)?
            .map(|r| r >= min)
            .unwrap_or(false))
    }

    pub fn has_members(&self, vault_id: &str) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM memberships WHERE vault_id = ?1",
            params![vault_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Members of a vault, highest role first.
    pub fn members(&self, vault_id: &str) -> Result<Vec<Membership>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT m.vault_id, m.user_id, u.name, m.role, m.added_by, m.created_at
             FROM memberships m JOIN users u ON u.user_id = m.user_id
             WHERE m.vault_id = ?1",
        )?;
        let mut rows: Vec<Membership> = stmt
            .query_map(params![vault_id], |row| {
                Ok(Membership {
                    vault_id: row.get(0)?,
                    user_id: row.get(1)?,
                    user_name: row.get(2)?,
                    role: parse_role_row(row.get::<_, String>(3)?)?,
                    added_by: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;
        rows.sort_by(|a, b| b.role.cmp(&a.role).then(a.user_id.cmp(&b.user_id)));
        Ok(rows)
    }

    /// Vaults a user belongs to, with their role in each.
    pub fn vaults_of(&self, user_id: i64) -> Result<Vec<(String, Role)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT vault_id, role FROM memberships WHERE user_id = ?1 ORDER BY vault_id",
        )?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok((row.get::<_, String>(0)?, parse_role_row(row.get(1)?)?))
            })?
            .collect::<std::result::Result<_, _>>()?;
        Ok(rows)
    }

    /// Add a member with a role strictly below the actor's. `owner` is not
    /// a valid role to grant here; it only moves via transfer or seeding.
    pub fn add_member(&self, vault_id: &str, user_id: i64, role: Role, actor: Actor) -> Result<()> {
        if role == Role::Owner {
            return Err(PermissionError::InvalidRole("owner".to_string()));
        }
        let conn = self.conn();
        if let Actor::User(actor_id) = actor {
            let actor_role = role_of(&conn, vault_id, actor_id)?;
            if actor_role.map(|r| r > role) != Some(true) {
                return Err(PermissionError::InsufficientRole);
            }
        }
        if role_of(&conn, vault_id, user_id)?.is_some() {
            return Err(PermissionError::AlreadyMember);
        }
        let added_by = match actor {
            Actor::User(id) => Some(id),
            Actor::System => None,
        };
        conn.execute(
            "INSERT INTO memberships (vault_id, user_id, role, added_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![vault_id, user_id, role.as_str(), added_by, now()],
        )?;
        Ok(())
    }

    /// Remove a member strictly below the actor. The owner cannot be
    /// removed, and an actor cannot remove themselves.
    pub fn remove_member(&self, vault_id: &str, user_id: i64, actor: Actor) -> Result<()> {
        if actor == Actor::User(user_id) {
            return Err(PermissionError::CannotSelf);
        }
        let conn = self.conn();
        let target = role_of(&conn, vault_id, user_id)?.ok_or(PermissionError::NotFound)?;
        if target == Role::Owner {
            return Err(PermissionError::IsOwner);
        }
        if let Actor::User(actor_id) = actor {
            let actor_role = role_of(&conn, vault_id, actor_id)?;
            if actor_role.map(|r| r > target) != Some(true) {
                return Err(PermissionError::InsufficientRole);
            }
        }
        conn.execute(
            "DELETE FROM memberships WHERE vault_id = ?1 AND user_id = ?2",
            params![vault_id, user_id],
        )?;
        Ok(())
    }

    /// Change a member's role. Both the target's current role and the new
    /// role must be strictly below the actor's; `owner` is not assignable.
    pub fn update_role(
        &self,
        vault_id: &str,
        user_id: i64,
        new_role: Role,
        actor: Actor,
    ) -> Result<()> {
        if new_role == Role::Owner {
            return Err(PermissionError::IsOwnerAssignment);
        }
        let conn = self.conn();
        let target = role_of(&conn, vault_id, user_id)?.ok_or(PermissionError::NotFound)?;
        if target == Role::Owner {
            return Err(PermissionError::InsufficientRole);
        }
        if let Actor::User(actor_id) = actor {
            let actor_role = role_of(&conn, vault_id, actor_id)?;
            let permitted = actor_role
                .map(|r| r > target && r > new_role)
                .unwrap_or(false);
            if !permitted {
                return Err(PermissionError::InsufficientRole);
            }
        }
        conn.execute(
            "UPDATE memberships SET role = ?3 WHERE vault_id = ?1 AND user_id = ?2",
            params![vault_id, user_id, new_role.as_str()],
        )?;
        Ok(())
    }

    /// Atomically demote the current owner to admin and promote the target
    /// to owner. Rolls back fully if either step fails.
    pub fn transfer_ownership(
        &self,
        vault_id: &str,
        new_owner_id: i64,
        current_owner_id: i64,
    ) -> Result<()> {
        if new_owner_id == current_owner_id {
            return Err(PermissionError::CannotSelf);
        }
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let actor = role_in_tx(&tx, vault_id, current_owner_id)?;
        if actor != Some(Role::Owner) {
            return Err(PermissionError::InsufficientRole);
        }

        tx.execute(
            "UPDATE memberships SET role = 'admin' WHERE vault_id = ?1 AND user_id = ?2",
            params![vault_id, current_owner_id],
        )?;
        let promoted = tx.execute(
            "UPDATE memberships SET role = 'owner' WHERE vault_id = ?1 AND user_id = ?2",
            params![vault_id, new_owner_id],
        )?;
        if promoted == 0 {
            // Target is not a member: dropping the transaction undoes the
            // demotion above.
            return Err(PermissionError::NotFound);
        }
        tx.commit()?;
        Ok(())
    }

    /// Seed a vault's owner. Used only by vault creation and the first-join
    /// legacy migration; bypasses actor checks.
    ///
    /// Idempotent when the target already owns the vault. If the vault has
    /// no owner yet, an existing membership row is upgraded in place.
    pub fn set_owner(&self, vault_id: &str, user_id: i64) -> Result<()> {
        let conn = self.conn();
        let existing: Option<i64> = conn
            .query_row(
                "SELECT user_id FROM memberships WHERE vault_id = ?1 AND role = 'owner'",
                params![vault_id],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            Some(owner) if owner == user_id => Ok(()),
            Some(_) => Err(PermissionError::AlreadyOwned),
            None => {
                if role_of(&conn, vault_id, user_id)?.is_some() {
                    conn.execute(
                        "UPDATE memberships SET role = 'owner' WHERE vault_id = ?1 AND user_id = ?2",
                        params![vault_id, user_id],
                    )?;
                } else {
                    conn.execute(
                        "INSERT INTO memberships (vault_id, user_id, role, added_by, created_at)
                         VALUES (?1, ?2, 'owner', NULL, ?3)",
                        params![vault_id, user_id, now()],
                    )?;
                }
                Ok(())
            }
        }
    }

    /// Cascade used by vault deletion.
    pub fn remove_vault_memberships(&self, vault_id: &str) -> Result<usize> {
        let n = self.conn().execute(
            "DELETE FROM memberships WHERE vault_id = ?1",
            params![vault_id],
        )?;
        Ok(n)
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn role_of(conn: &Connection, vault_id: &str, user_id: i64) -> Result<Option<Role>> {
    let role: Option<String> = conn
        .query_row(
            "SELECT role FROM memberships WHERE vault_id = ?1 AND user_id = ?2",
            params![vault_id, user_id],
            |row| row.get(0),
        )
        .optional()?;
    match role {
        Some(s) => Ok(Some(
            Role::parse(&s).ok_or_else(|| PermissionError::InvalidRole(s))?,
        )),
        None => Ok(None),
    }
}

fn role_in_tx(tx: &Transaction<'_>, vault_id: &str, user_id: i64) -> Result<Option<Role>> {
    let role: Option<String> = tx
        .query_row(
            "SELECT role FROM memberships WHERE vault_id = ?1 AND user_id = ?2",
            params![vault_id, user_id],
            |row| row.get(0),
        )
        .optional()?;
    match role {
        Some(s) => Ok(Some(
            Role::parse(&s).ok_or_else(|| PermissionError::InvalidRole(s))?,
        )),
        None => Ok(None),
    }
}

fn parse_role_row(s: String) -> std::result::Result<Role, rusqlite::Error> {
    Role::parse(&s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown role {s:?}").into(),
        )
    })
}
