//! Vault-id and relative-path validation.
//!
//! Every user-supplied identifier passes through here exactly once before it
//! is used in a filesystem path. Rejections surface as
//! [`VaultError::InvalidVaultId`] or [`VaultError::InvalidPath`].

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::vault::VaultError;

/// A validated vault identifier: non-empty, `[A-Za-z0-9_-]` only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VaultId(String);

impl VaultId {
    pub fn parse(raw: &str) -> Result<Self, VaultError> {
        if raw.is_empty()
            || !raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(VaultError::InvalidVaultId(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VaultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for VaultId {
    type Error = VaultError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        VaultId::parse(&value)
    }
}

impl From<VaultId> for String {
    fn from(id: VaultId) -> String {
        id.0
    }
}

/// Resolve a user-supplied relative path against a vault root.
///
/// Rejects absolute paths, `..` segments, and anything whose resolved form
/// does not stay under `vault_root`. Returns the resolved absolute path.
pub(crate) fn resolve_rel_path(vault_root: &Path, raw: &str) -> Result<PathBuf, VaultError> {
    let normalized = raw.replace('\\', "/");
    if Path::new(&normalized).is_absolute() {
        return Err(VaultError::InvalidPath(raw.to_string()));
    }
    let trimmed = normalized.trim_start_matches('/');

    let mut rel = PathBuf::new();
    for segment in trimmed.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(VaultError::InvalidPath(raw.to_string())),
            s => rel.push(s),
        }
    }
    if rel.as_os_str().is_empty() {
        return Err(VaultError::InvalidPath(raw.to_string()));
    }

    let resolved = vault_root.join(&rel);
    // Final containment check: the resolved path must extend the vault root.
    if !resolved.starts_with(vault_root) {
        return Err(VaultError::InvalidPath(raw.to_string()));
    }
    Ok(resolved)
}

/// Names whose first segment starts with `_` or `.` belong to the store.
pub(crate) fn is_reserved(raw: &str) -> bool {
    let normalized = raw.replace('\\', "/");
    let trimmed = normalized.trim_start_matches('/');
    trimmed
        .split('/')
        .find(|s| !s.is_empty() && *s != ".")
        .map(|first| first.starts_with('_') || first.starts_with('.'))
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vault_id_accepts_charset() {
        assert!(VaultId::parse("team-notes_2").is_ok());
        assert!(VaultId::parse("A").is_ok());
    }

    #[test]
    fn vault_id_rejects_everything_else() {
        for bad in ["", "a/b", "a b", "vault!", "../up", "naïve"] {
            assert!(VaultId::parse(bad).is_err(), "should reject {bad:?}");
        }
    }

    #[test]
    fn resolve_accepts_nested_paths() {
        let root = Path::new("/data/vaults/v1");
        let p = resolve_rel_path(root, "notes/daily/2026-08-02.md").unwrap();
        assert_eq!(p, root.join("notes/daily/2026-08-02.md"));
    }

    #[test]
    fn resolve_strips_leading_separators() {
        let root = Path::new("/data/vaults/v1");
        let p = resolve_rel_path(root, "a.md").unwrap();
        assert_eq!(p, root.join("a.md"));
    }

    #[test]
    fn resolve_rejects_traversal() {
        let root = Path::new("/data/vaults/v1");
        assert!(resolve_rel_path(root, "../secret").is_err());
        assert!(resolve_rel_path(root, "a/../../b").is_err());
        assert!(resolve_rel_path(root, "../../etc/passwd").is_err());
    }

    #[test]
    fn resolve_rejects_absolute_and_empty() {
        let root = Path::new("/data/vaults/v1");
        assert!(resolve_rel_path(root, "/etc/passwd").is_err());
        assert!(resolve_rel_path(root, "").is_err());
        assert!(resolve_rel_path(root, "./").is_err());
    }

    #[test]
    fn reserved_names() {
        assert!(is_reserved("_state.ydoc"));
        assert!(is_reserved(".obsidian/config"));
        assert!(is_reserved("_tmp/inner.md"));
        assert!(!is_reserved("notes/_draft.md"));
        assert!(!is_reserved("a.md"));
    }
}
