//! Debounced file materialization.
//!
//! CRDT changes arrive character-by-character; disk writes should not. Each
//! vault runs one materializer task that collapses change notifications into
//! at most one write per path per debounce window (default 200 ms).
//! Rescheduling a path cancels its pending action, so a write scheduled
//! after a delete (or vice versa) wins. Disk writes for the same path are
//! serialized by construction: the materializer performs them one at a time.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use quill_store::{VaultId, VaultStore};

use crate::registry::VaultEntry;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Write,
    Delete,
}

/// One observed change to a path in the vault's `files` map.
#[derive(Debug, Clone)]
pub struct FileChange {
    pub path: String,
    pub kind: ChangeKind,
}

struct PendingTimer {
    kind: ChangeKind,
    generation: u64,
    handle: JoinHandle<()>,
}

/// Drive the per-path debounce timers for one vault.
///
/// Exits when the change channel closes (observers dropped) or the vault
/// entry is evicted. Holds only a `Weak` to the entry so it never keeps an
/// evicted vault alive.
pub(crate) fn spawn_materializer(
    store: Arc<VaultStore>,
    vault_id: VaultId,
    entry: Weak<VaultEntry>,
    mut changes: mpsc::UnboundedReceiver<FileChange>,
    delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timers: HashMap<String, PendingTimer> = HashMap::new();
        let mut generation: u64 = 0;
        let (fire_tx, mut fire_rx) = mpsc::unbounded_channel::<(String, u64)>();

        loop {
            tokio::select! {
                change = changes.recv() => {
                    let Some(FileChange { path, kind }) = change else { break };
                    generation += 1;
                    if let Some(old) = timers.remove(&path) {
                        old.handle.abort();
                    }
                    let tx = fire_tx.clone();
                    let fire_path = path.clone();
                    let gen = generation;
                    let handle = tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send((fire_path, gen));
                    });
                    timers.insert(path, PendingTimer { kind, generation: gen, handle });
                }
                fired = fire_rx.recv() => {
                    let Some((path, gen)) = fired else { break };
                    // A newer schedule for this path supersedes the firing.
                    let kind = match timers.get(&path) {
                        Some(t) if t.generation == gen => t.kind,
                        _ => continue,
                    };
                    timers.remove(&path);

                    let Some(entry) = entry.upgrade() else { break };
                    materialize(&store, &vault_id, &entry, &path, kind).await;
                }
            }
        }
    })
}

async fn materialize(
    store: &VaultStore,
    vault_id: &VaultId,
    entry: &VaultEntry,
    path: &str,
    kind: ChangeKind,
) {
    let content = match kind {
        ChangeKind::Delete => None,
        ChangeKind::Write => entry.state.lock().await.file_text(path),
    };
    let result = match &content {
        Some(text) => store.write_file(vault_id, path, text).await,
        // The entry vanished from the CRDT between schedule and fire.
        None => store.delete_file(vault_id, path).await,
    };
    if let Err(e) = result {
        // Disk trouble never tears down the vault; the autosave tick will
        // re-persist the snapshot since the vault stays dirty.
        log::warn!("vault {vault_id}: failed to materialize {path:?}: {e}");
        entry.mark_dirty();
    } else {
        log::trace!("vault {vault_id}: materialized {path:?} ({kind:?})");
    }
}
