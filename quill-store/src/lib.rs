//! # quill-store — persistence layer for Quill vaults
//!
//! Three cooperating pieces, all rooted under one data directory:
//!
//! ```text
//! <data-root>/
//!   quill.db                          membership roles (sqlite)
//!   vaults/<vaultId>/_state.ydoc      binary CRDT snapshot
//!   vaults/<vaultId>/<path/to/file>   materialized UTF-8 text
//!   backups/<vaultId>/hourly/<ts>/…   periodic snapshot copies
//!   backups/<vaultId>/daily/<date>/…
//! ```
//!
//! ## Modules
//!
//! - [`vault`] — vault directories, atomic snapshot/file writes
//! - [`permissions`] — per-(vault, user) role table with ownership invariants
//! - [`backup`] — hourly/daily snapshot copies with retention and restore
//! - [`paths`] — the single place vault ids and relative paths are validated

pub mod backup;
pub mod paths;
pub mod permissions;
pub mod vault;

pub use backup::{BackupError, BackupInfo, BackupKind, BackupScheduler};
pub use paths::VaultId;
pub use permissions::{Actor, Membership, PermissionError, PermissionStore, Role};
pub use vault::{VaultError, VaultStore, SNAPSHOT_FILE};
