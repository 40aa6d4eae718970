//! # quill-server — wiring for the Quill collaboration server
//!
//! Composes the storage layer and the sync engine into a runnable server:
//! configuration, the token-file verifier, the WebSocket accept loop, and
//! the programmatic administrative boundary an external HTTP router calls.

pub mod admin;
pub mod auth;
pub mod config;
pub mod ws;

pub use admin::{AdminApi, ApiError};
pub use auth::{AuthError, StaticTokenVerifier};
pub use config::{ConfigError, ServerConfig};
pub use ws::ServerCtx;
