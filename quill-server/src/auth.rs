//! Token verification for self-hosted deployments.
//!
//! The credential store proper (hashing, minting, expiry) is an external
//! collaborator behind [`TokenVerifier`]. This module ships the one
//! implementation a self-hosted server needs out of the box: a static token
//! file mapping opaque tokens to user identities.
//!
//! ```toml
//! [tokens.s3cret-alice]
//! id = 1
//! name = "alice"
//! admin = true
//!
//! [tokens.s3cret-bob]
//! id = 2
//! name = "bob"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use quill_collab::{AuthUser, TokenVerifier};

#[derive(Debug, Deserialize)]
struct TokenFile {
    #[serde(default)]
    tokens: HashMap<String, TokenEntry>,
}

#[derive(Debug, Deserialize)]
struct TokenEntry {
    id: i64,
    name: String,
    #[serde(default)]
    admin: bool,
}

pub struct StaticTokenVerifier {
    tokens: HashMap<String, AuthUser>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self {
            tokens: HashMap::new(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, AuthError> {
        let raw = std::fs::read_to_string(path).map_err(|e| AuthError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let file: TokenFile = toml::from_str(&raw).map_err(|e| AuthError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let mut verifier = Self::new();
        for (token, entry) in file.tokens {
            verifier.insert(token, entry.id, entry.name, entry.admin);
        }
        Ok(verifier)
    }

    pub fn insert(&mut self, token: impl Into<String>, id: i64, name: impl Into<String>, admin: bool) {
        self.tokens.insert(
            token.into(),
            AuthUser {
                id,
                name: name.into(),
                is_server_admin: admin,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Default for StaticTokenVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Option<AuthUser> {
        self.tokens.get(token).cloned()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("cannot read token file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse token file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}
