//! On-disk vault storage.
//!
//! Layout under the store root:
//!
//! ```text
//! vaults/<vaultId>/
//!     _state.ydoc         binary CRDT snapshot (opaque bytes)
//!     <relative>/<file>   materialized text files, UTF-8
//! ```
//!
//! Names starting with `_` or `.` are reserved for the store itself and are
//! never enumerated as user files. All writes are atomic: a unique temporary
//! sibling is fsync'd, then renamed over the target, so a crash mid-write
//! leaves the prior file intact.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::paths::{is_reserved, resolve_rel_path, VaultId};

/// File name of the binary CRDT snapshot inside a vault directory.
pub const SNAPSHOT_FILE: &str = "_state.ydoc";

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault already exists: {0}")]
    AlreadyExists(String),

    #[error("vault not found: {0}")]
    VaultNotFound(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("invalid vault id: {0:?}")]
    InvalidVaultId(String),

    #[error("invalid path: {0:?}")]
    InvalidPath(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, VaultError>;

/// Filesystem store for vault directories.
///
/// Cheap to clone behind an `Arc`; all methods take `&self` and any number
/// of them may run concurrently. Same-path write serialization is the
/// caller's job (the registry's per-path debounce provides it).
pub struct VaultStore {
    root: PathBuf,
}

impl VaultStore {
    /// Create a store rooted at `<data_root>/vaults`.
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            root: data_root.into().join("vaults"),
        }
    }

    /// Ensure the store root exists. Called once at startup.
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Absolute path of a vault's directory.
    pub fn vault_dir(&self, id: &VaultId) -> PathBuf {
        self.root.join(id.as_str())
    }

    pub async fn exists(&self, id: &VaultId) -> bool {
        fs::try_exists(self.vault_dir(id)).await.unwrap_or(false)
    }

    /// Create the vault directory with an empty snapshot.
    pub async fn create_vault(&self, id: &VaultId) -> Result<()> {
        let dir = self.vault_dir(id);
        if fs::try_exists(&dir).await? {
            return Err(VaultError::AlreadyExists(id.to_string()));
        }
        fs::create_dir_all(&dir).await?;
        write_atomic(&dir.join(SNAPSHOT_FILE), &[]).await?;
        Ok(())
    }

    /// Load the binary snapshot; empty bytes if none was written yet.
    pub async fn load_snapshot(&self, id: &VaultId) -> Result<Vec<u8>> {
        match fs::read(self.vault_dir(id).join(SNAPSHOT_FILE)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save_snapshot(&self, id: &VaultId, bytes: &[u8]) -> Result<()> {
        let dir = self.vault_dir(id);
        fs::create_dir_all(&dir).await?;
        write_atomic(&dir.join(SNAPSHOT_FILE), bytes).await
    }

    /// All user file paths in the vault, `/`-separated, sorted.
    ///
    /// Reserved names (`_`/`.` prefixed) are skipped at every level.
    pub async fn list_files(&self, id: &VaultId) -> Result<Vec<String>> {
        let root = self.vault_dir(id);
        if !fs::try_exists(&root).await? {
            return Err(VaultError::VaultNotFound(id.to_string()));
        }

        let mut out = Vec::new();
        let mut stack = vec![root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with('_') || name.starts_with('.') {
                    continue;
                }
                if entry.file_type().await?.is_dir() {
                    stack.push(entry.path());
                } else {
                    out.push(rel_string(&root, &entry.path()));
                }
            }
        }
        out.sort();
        Ok(out)
    }

    pub async fn read_file(&self, id: &VaultId, path: &str) -> Result<String> {
        let target = self.resolve_user_path(id, path)?;
        match fs::read_to_string(&target).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(VaultError::FileNotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write a text file atomically, creating parent directories as needed.
    pub async fn write_file(&self, id: &VaultId, path: &str, content: &str) -> Result<()> {
        let target = self.resolve_user_path(id, path)?;
        write_atomic(&target, content.as_bytes()).await
    }

    /// Delete a file; a missing file is not an error.
    pub async fn delete_file(&self, id: &VaultId, path: &str) -> Result<()> {
        let target = self.resolve_user_path(id, path)?;
        match fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn rename_file(&self, id: &VaultId, old: &str, new: &str) -> Result<()> {
        let from = self.resolve_user_path(id, old)?;
        let to = self.resolve_user_path(id, new)?;
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await?;
        }
        match fs::rename(&from, &to).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(VaultError::FileNotFound(old.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the vault directory recursively.
    ///
    /// The caller must have cascaded membership rows first.
    pub async fn delete_vault(&self, id: &VaultId) -> Result<()> {
        let dir = self.vault_dir(id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(VaultError::VaultNotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// All vault ids present on disk, sorted.
    pub async fn vault_ids(&self) -> Result<Vec<VaultId>> {
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
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
        out.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(out)
    }

    fn resolve_user_path(&self, id: &VaultId, path: &str) -> Result<PathBuf> {
        if is_reserved(path) {
            return Err(VaultError::InvalidPath(path.to_string()));
        }
        resolve_rel_path(&self.vault_dir(id), path)
    }
}

fn rel_string(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Write `bytes` to `path` via a unique fsync'd temporary sibling + rename.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.tmp", Uuid::new_v4().simple()));
    let tmp = PathBuf::from(tmp);

    let result = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path).await?;
        Ok::<(), io::Error>(())
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&tmp).await;
    }
    result.map_err(VaultError::from)
}
