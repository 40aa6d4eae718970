//! Periodic vault backups.
//!
//! Snapshots are plain recursive copies of a vault directory:
//!
//! ```text
//! backups/<vaultId>/hourly/<YYYY-MM-DDTHH-MM-SS>/…
//! backups/<vaultId>/daily/<YYYY-MM-DD>/…
//! ```
//!
//! Both name shapes sort lexicographically in wall-clock order, which makes
//! retention a sort-and-truncate. Each scheduler tick creates an hourly
//! snapshot for every vault, adds the daily snapshot if today's is missing,
//! then prunes to the retention limits.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::fs;

use crate::paths::VaultId;

pub const HOURLY_KEEP: usize = 24;
pub const DAILY_KEEP: usize = 7;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup not found: {vault_id}/{kind}/{name}")]
    NotFound {
        vault_id: String,
        kind: BackupKind,
        name: String,
    },

    #[error("vault not found: {0}")]
    VaultNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupKind {
    Hourly,
    Daily,
}

impl BackupKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupKind::Hourly => "hourly",
            BackupKind::Daily => "daily",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hourly" => Some(BackupKind::Hourly),
            "daily" => Some(BackupKind::Daily),
            _ => None,
        }
    }
}

impl std::fmt::Display for BackupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackupInfo {
    pub vault_id: String,
    pub kind: BackupKind,
    /// Directory name: the ISO-safe timestamp (hourly) or UTC date (daily).
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Copies vault directories into timestamped backup directories.
pub struct BackupScheduler {
    vaults_root: PathBuf,
    backups_root: PathBuf,
}

impl BackupScheduler {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        let data_root = data_root.into();
        Self {
            vaults_root: data_root.join("vaults"),
            backups_root: data_root.join("backups"),
        }
    }

    /// Run the periodic loop. Errors are logged; a failing vault never
    /// stops the tick for the others.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match self.snapshot_all().await {
                Ok(n) => log::info!("backup tick complete: {n} vaults"),
                Err(e) => log::error!("backup tick failed: {e}"),
            }
        }
    }

    /// One scheduler tick: hourly + daily-if-missing + prune, per vault.
    pub async fn snapshot_all(&self) -> Result<usize> {
        let mut count = 0;
        for vault_id in self.live_vault_ids().await? {
            if let Err(e) = self.tick_vault(&vault_id).await {
                log::error!("backup failed for vault {vault_id}: {e}");
                continue;
            }
            count += 1;
        }
        Ok(count)
    }

    async fn tick_vault(&self, vault_id: &VaultId) -> Result<()> {
        self.snapshot_vault(vault_id).await?;
        self.daily_if_missing(vault_id).await?;
        self.prune(vault_id).await?;
        Ok(())
    }

    /// Create one hourly snapshot now. Also the "manual snapshot" entry
    /// point. An existing directory with the same name is replaced.
    pub async fn snapshot_vault(&self, vault_id: &VaultId) -> Result<BackupInfo> {
        let name = hourly_stamp();
        self.copy_into(vault_id, BackupKind::Hourly, &name).await
    }

    async fn daily_if_missing(&self, vault_id: &VaultId) -> Result<()> {
        let name = daily_stamp();
        let target = self.backup_dir(vault_id, BackupKind::Daily, &name);
        if fs::try_exists(&target).await? {
            return Ok(());
        }
        self.copy_into(vault_id, BackupKind::Daily, &name).await?;
        Ok(())
    }

    /// Delete everything beyond the newest 24 hourly / 7 daily snapshots.
    pub async fn prune(&self, vault_id: &VaultId) -> Result<()> {
        self.prune_kind(vault_id, BackupKind::Hourly, HOURLY_KEEP).await?;
        self.prune_kind(vault_id, BackupKind::Daily, DAILY_KEEP).await?;
        Ok(())
    }

    async fn prune_kind(&self, vault_id: &VaultId, kind: BackupKind, keep: usize) -> Result<()> {
        let mut names = self.snapshot_names(vault_id, kind).await?;
        if names.len() <= keep {
            return Ok(());
        }
        // Newest sort last; everything before the cutoff goes.
        names.sort();
        let cutoff = names.len() - keep;
        for name in &names[..cutoff] {
            let dir = self.backup_dir(vault_id, kind, name);
            if let Err(e) = fs::remove_dir_all(&dir).await {
                log::warn!("failed to prune backup {}: {e}", dir.display());
            }
        }
        Ok(())
    }

    /// All snapshots of a vault, both kinds, newest first within each kind.
    pub async fn list(&self, vault_id: &VaultId) -> Result<Vec<BackupInfo>> {
        let mut out = Vec::new();
        for kind in [BackupKind::Hourly, BackupKind::Daily] {
            let mut names = self.snapshot_names(vault_id, kind).await?;
            names.sort();
            names.reverse();
            for name in names {
                let path = self.backup_dir(vault_id, kind, &name);
                let size_bytes = tree_size(&path).await.unwrap_or(0);
                out.push(BackupInfo {
                    vault_id: vault_id.to_string(),
                    kind,
                    name,
                    path,
                    size_bytes,
                });
            }
        }
        Ok(out)
    }

    /// Replace the live vault directory with a chosen backup.
    ///
    /// The current live tree is first saved as a `pre-restore-*` hourly
    /// snapshot. The caller is responsible for evicting any in-memory doc
    /// afterward so the next join reloads from disk.
    pub async fn restore(&self, vault_id: &VaultId, kind: BackupKind, name: &str) -> Result<()> {
        let source = self.backup_dir(vault_id, kind, name);
        if !fs::try_exists(&source).await? {
            return Err(BackupError::NotFound {
                vault_id: vault_id.to_string(),
                kind,
                name: name.to_string(),
            });
        }

        let live = self.vaults_root.join(vault_id.as_str());
        if fs::try_exists(&live).await? {
            let safety = format!("pre-restore-{}", hourly_stamp());
            self.copy_into(vault_id, BackupKind::Hourly, &safety).await?;
            fs::remove_dir_all(&live).await?;
        }
        copy_tree(&source, &live).await?;
        log::info!("restored vault {vault_id} from {kind}/{name}");
        Ok(())
    }

    fn backup_dir(&self, vault_id: &VaultId, kind: BackupKind, name: &str) -> PathBuf {
        self.backups_root
            .join(vault_id.as_str())
            .join(kind.as_str())
            .join(name)
    }

    async fn copy_into(
        &self,
        vault_id: &VaultId,
        kind: BackupKind,
        name: &str,
    ) -> Result<BackupInfo> {
        let source = self.vaults_root.join(vault_id.as_str());
        if !fs::try_exists(&source).await? {
            return Err(BackupError::VaultNotFound(vault_id.to_string()));
        }
        let target = self.backup_dir(vault_id, kind, name);
        if fs::try_exists(&target).await? {
            fs::remove_dir_all(&target).await?;
        }
        let size_bytes = copy_tree(&source, &target).await?;
        log::debug!("backed up vault {vault_id} to {kind}/{name} ({size_bytes} bytes)");
        Ok(BackupInfo {
            vault_id: vault_id.to_string(),
            kind,
            name: name.to_string(),
            path: target,
            size_bytes,
        })
    }

    async fn snapshot_names(&self, vault_id: &VaultId, kind: BackupKind) -> Result<Vec<String>> {
        let dir = self
            .backups_root
            .join(vault_id.as_str())
            .join(kind.as_str());
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }

    async fn live_vault_ids(&self) -> Result<Vec<VaultId>> {
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(&self.vaults_root).await {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Ok(id) = VaultId::parse(&entry.file_name().to_string_lossy()) {
                out.push(id);
            }
        }
        Ok(out)
    }
}

/// ISO-8601 UTC with `:` replaced by `-`, seconds precision.
fn hourly_stamp() -> String {
    Utc::now().format("%Y-%m-%dT%H-%M-%S").to_string()
}

fn daily_stamp() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

async fn copy_tree(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut bytes = 0u64;
    let mut stack = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = stack.pop() {
        fs::create_dir_all(&to).await?;
        let mut entries = fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = to.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                stack.push((entry.path(), target));
            } else {
                bytes += fs::copy(entry.path(), &target).await?;
            }
        }
    }
    Ok(bytes)
}

async fn tree_size(root: &Path) -> io::Result<u64> {
    let mut bytes = 0u64;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                stack.push(entry.path());
            } else {
                bytes += entry.metadata().await?.len();
            }
        }
    }
    Ok(bytes)
}
