//! # quill-collab — real-time collaboration engine for Quill vaults
//!
//! Keeps every connected editor of a vault converged on one CRDT document
//! and materializes its files to disk.
//!
//! ```text
//! ┌─────────────┐    WebSocket     ┌─────────────┐
//! │ Editor      │ ◄──────────────► │ SyncEngine  │
//! │ (per user)  │   binary frames  │ (central)   │
//! └─────────────┘                  └──────┬──────┘
//!                                         │
//!                               ┌─────────┴──────────┐
//!                               │ DocRegistry        │
//!                               │ (doc + awareness + │
//!                               │  clients per vault)│
//!                               └─────────┬──────────┘
//!                                         │ debounced writes
//!                                         ▼
//!                                  quill-store (disk)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — binary sync frames (SYNC / AWARENESS tags)
//! - [`events`] — JSON control events and the [`events::ClientChannel`] seam
//! - [`awareness`] — per-vault presence states
//! - [`session`] — per-connection state machine and the auth seam
//! - [`registry`] — live docs, dirty tracking, flush and eviction
//! - [`debounce`] — per-path write coalescing
//! - [`engine`] — join/leave, message routing, write gate, fan-out

pub mod awareness;
pub mod debounce;
pub mod engine;
pub mod events;
pub mod protocol;
pub mod registry;
pub mod session;

pub use awareness::{AwarenessDelta, AwarenessEntry, AwarenessSet};
pub use engine::{EngineError, EngineStats, SyncEngine};
pub use events::{ClientChannel, ClientCommand, DeniedAction, Outbound, ServerEvent, UserInfo};
pub use protocol::{Frame, ProtocolError, SyncPayload};
pub use registry::{ClientHandle, DocRegistry, VaultEntry, VaultState};
pub use session::{AuthUser, Session, TokenVerifier};
