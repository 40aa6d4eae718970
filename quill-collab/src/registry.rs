//! Live document registry.
//!
//! One entry per vault with at least one joined client (plus short-lived
//! entries for administrative writes). Each entry bundles the CRDT doc, the
//! awareness set and the client set behind a single async mutex — the
//! per-vault critical section that serializes CRDT application — and keeps
//! a dirty flag for the autosave loop.
//!
//! ```text
//! join ──► get_or_create ──► load snapshot ──► observers wired:
//!            │                                   update    → dirty flag
//!            │                                   files map → debounce → disk
//!            └─► clients tracked per entry; last leave → flush + evict
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use yrs::types::{Event, PathSegment};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    DeepObservable, Doc, GetString, Map, MapRef, Out, ReadTxn, StateVector, Subscription, Text,
    TextPrelim, Transact, Update,
};

use quill_store::{Role, VaultId, VaultStore};

use crate::awareness::AwarenessSet;
use crate::debounce::{spawn_materializer, ChangeKind, FileChange, DEFAULT_DEBOUNCE};
use crate::engine::EngineError;
use crate::events::ClientChannel;

/// Root map holding one text sequence per file path.
const FILES_MAP: &str = "files";

/// A joined client as seen by the vault it joined.
pub struct ClientHandle {
    pub conn_id: u64,
    pub user_id: i64,
    pub user_name: String,
    /// Cached role; refreshed by role-change pushes from the admin boundary.
    pub role: Role,
    pub channel: Arc<dyn ClientChannel>,
    /// Awareness client ids this connection introduced, removed on leave.
    pub awareness_ids: std::collections::HashSet<u64>,
}

/// The mutable unit of one live vault. Guarded by `VaultEntry::state`.
pub struct VaultState {
    pub doc: Doc,
    pub files: MapRef,
    pub awareness: AwarenessSet,
    pub clients: HashMap<u64, ClientHandle>,
    _subscriptions: Vec<Subscription>,
}

impl VaultState {
    /// Sorted paths currently present in the CRDT.
    pub fn file_list(&self) -> Vec<String> {
        let txn = self.doc.transact();
        let mut paths: Vec<String> = self.files.keys(&txn).map(|k| k.to_string()).collect();
        paths.sort();
        paths
    }

    /// Current text of one path, if present.
    pub fn file_text(&self, path: &str) -> Option<String> {
        let txn = self.doc.transact();
        match self.files.get(&txn, path) {
            Some(Out::YText(text)) => Some(text.get_string(&txn)),
            _ => None,
        }
    }

    /// Every path with its current text, for shutdown materialization.
    pub fn materialized_files(&self) -> Vec<(String, String)> {
        let txn = self.doc.transact();
        let mut out = Vec::new();
        for key in self.files.keys(&txn) {
            if let Some(Out::YText(text)) = self.files.get(&txn, key) {
                out.push((key.to_string(), text.get_string(&txn)));
            }
        }
        out.sort();
        out
    }

    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Full document state as a single update.
    pub fn encode_full_update(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// Diff against a peer's state vector.
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, EngineError> {
        let sv = StateVector::decode_v1(state_vector)
            .map_err(|e| EngineError::Crdt(e.to_string()))?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    /// Apply a remote update (SyncStep2 or Update payload).
    pub fn apply_update_bytes(&self, bytes: &[u8]) -> Result<(), EngineError> {
        let update = Update::decode_v1(bytes).map_err(|e| EngineError::Crdt(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| EngineError::Crdt(e.to_string()))
    }

    /// Replace one file's content server-side; returns the update to
    /// broadcast. Used by the administrative boundary.
    pub fn set_file_text(&self, path: &str, content: &str) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        let text = match self.files.get(&txn, path) {
            Some(Out::YText(text)) => text,
            _ => self.files.insert(&mut txn, path, TextPrelim::new("")),
        };
        let len = text.len(&txn);
        if len > 0 {
            text.remove_range(&mut txn, 0, len);
        }
        if !content.is_empty() {
            text.insert(&mut txn, 0, content);
        }
        txn.encode_update_v1()
    }

    /// Remove one file from the CRDT; returns the update to broadcast if
    /// the path existed.
    pub fn remove_file(&self, path: &str) -> Option<Vec<u8>> {
        let mut txn = self.doc.transact_mut();
        self.files.remove(&mut txn, path)?;
        Some(txn.encode_update_v1())
    }
}

/// One live vault: the coarse per-vault lock plus its dirty flag.
///
/// The dirty flag is shared with the doc's update observer, so any applied
/// update marks the vault for the next autosave flush.
pub struct VaultEntry {
    pub vault_id: VaultId,
    pub state: Mutex<VaultState>,
    dirty: Arc<AtomicBool>,
}

impl VaultEntry {
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

/// Process-wide registry of live vaults.
pub struct DocRegistry {
    store: Arc<VaultStore>,
    vaults: RwLock<HashMap<String, Arc<VaultEntry>>>,
    debounce: std::time::Duration,
}

impl DocRegistry {
    pub fn new(store: Arc<VaultStore>) -> Self {
        Self::with_debounce(store, DEFAULT_DEBOUNCE)
    }

    pub fn with_debounce(store: Arc<VaultStore>, debounce: std::time::Duration) -> Self {
        Self {
            store,
            vaults: RwLock::new(HashMap::new()),
            debounce,
        }
    }

    pub fn store(&self) -> &Arc<VaultStore> {
        &self.store
    }

    pub async fn get(&self, vault_id: &VaultId) -> Option<Arc<VaultEntry>> {
        self.vaults.read().await.get(vault_id.as_str()).cloned()
    }

    /// Number of live vaults (for logging and tests).
    pub async fn live_count(&self) -> usize {
        self.vaults.read().await.len()
    }

    /// Get the live entry for a vault, loading it from disk if needed.
    ///
    /// Creates the vault directory on first use, applies the persisted
    /// snapshot (an unreadable snapshot degrades to an empty document), and
    /// wires the dirty-flag and file-materialization observers.
    pub async fn get_or_create(
        self: &Arc<Self>,
        vault_id: &VaultId,
    ) -> Result<Arc<VaultEntry>, EngineError> {
        if let Some(entry) = self.vaults.read().await.get(vault_id.as_str()) {
            return Ok(entry.clone());
        }

        let mut vaults = self.vaults.write().await;
        // Double-check after acquiring the write lock.
        if let Some(entry) = vaults.get(vault_id.as_str()) {
            return Ok(entry.clone());
        }

        if !self.store.exists(vault_id).await {
            self.store.create_vault(vault_id).await?;
            log::info!("vault {vault_id}: created on first use");
        }
        let snapshot = self.store.load_snapshot(vault_id).await?;

        let doc = Doc::new();
        let files = doc.get_or_insert_map(FILES_MAP);
        if !snapshot.is_empty() {
            match Update::decode_v1(&snapshot) {
                Ok(update) => {
                    let mut txn = doc.transact_mut();
                    if let Err(e) = txn.apply_update(update) {
                        log::warn!("vault {vault_id}: snapshot rejected, starting empty: {e}");
                    }
                }
                Err(e) => {
                    log::warn!("vault {vault_id}: snapshot undecodable, starting empty: {e}");
                }
            }
        }

        let dirty = Arc::new(AtomicBool::new(false));
        let flag = dirty.clone();
        let update_sub = doc
            .observe_update_v1(move |_txn, _event| {
                flag.store(true, Ordering::Release);
            })
            .map_err(|e| EngineError::Crdt(e.to_string()))?;

        let (change_tx, change_rx) = mpsc::unbounded_channel::<FileChange>();
        let files_sub = files.observe_deep(move |txn, events| {
            for event in events.iter() {
                match event {
                    Event::Map(map_event) => {
                        for (key, change) in map_event.keys(txn).iter() {
                            let kind = match change {
                                yrs::types::EntryChange::Removed(_) => ChangeKind::Delete,
                                _ => ChangeKind::Write,
                            };
                            let _ = change_tx.send(FileChange {
                                path: key.to_string(),
                                kind,
                            });
                        }
                    }
                    Event::Text(text_event) => {
                        let path = text_event.path();
                        if let Some(PathSegment::Key(key)) = path.front() {
                            let _ = change_tx.send(FileChange {
                                path: key.to_string(),
                                kind: ChangeKind::Write,
                            });
                        }
                    }
                    _ => {}
                }
            }
        });

        let entry = Arc::new(VaultEntry {
            vault_id: vault_id.clone(),
            state: Mutex::new(VaultState {
                doc,
                files,
                awareness: AwarenessSet::default(),
                clients: HashMap::new(),
                _subscriptions: vec![update_sub, files_sub],
            }),
            dirty,
        });
        vaults.insert(vault_id.to_string(), entry.clone());
        drop(vaults);

        spawn_materializer(
            self.store.clone(),
            vault_id.clone(),
            Arc::downgrade(&entry),
            change_rx,
            self.debounce,
        );

        log::debug!("vault {vault_id}: loaded into registry");
        Ok(entry)
    }

    /// Persist the full snapshot; on failure the vault stays dirty so the
    /// next autosave tick retries.
    pub async fn flush(&self, entry: &VaultEntry) -> Result<(), EngineError> {
        entry.dirty.store(false, Ordering::Release);
        let bytes = { entry.state.lock().await.encode_full_update() };
        if let Err(e) = self.store.save_snapshot(&entry.vault_id, &bytes).await {
            entry.mark_dirty();
            return Err(e.into());
        }
        log::debug!(
            "vault {}: snapshot flushed ({} bytes)",
            entry.vault_id,
            bytes.len()
        );
        Ok(())
    }

    /// Flush, materialize every file, and drop the vault from memory if no
    /// clients remain. Returns whether the vault was evicted.
    pub async fn flush_and_evict(&self, vault_id: &VaultId) -> Result<bool, EngineError> {
        let Some(entry) = self.get(vault_id).await else {
            return Ok(false);
        };

        let (files, no_clients) = {
            let state = entry.state.lock().await;
            (state.materialized_files(), state.clients.is_empty())
        };
        for (path, content) in &files {
            if let Err(e) = self.store.write_file(vault_id, path, content).await {
                log::warn!("vault {vault_id}: failed to materialize {path:?} on flush: {e}");
            }
        }
        self.flush(&entry).await?;

        if no_clients {
            self.vaults.write().await.remove(vault_id.as_str());
            log::info!("vault {vault_id}: evicted (no clients)");
        }
        Ok(no_clients)
    }

    /// Autosave tick: flush every dirty vault. Returns how many flushed.
    pub async fn flush_dirty(&self) -> usize {
        let entries: Vec<Arc<VaultEntry>> =
            self.vaults.read().await.values().cloned().collect();
        let mut flushed = 0;
        for entry in entries {
            if !entry.is_dirty() {
                continue;
            }
            match self.flush(&entry).await {
                Ok(()) => flushed += 1,
                Err(e) => log::error!("vault {}: autosave flush failed: {e}", entry.vault_id),
            }
        }
        flushed
    }

    /// Flush everything on shutdown, regardless of dirtiness.
    pub async fn flush_all(&self) {
        let ids: Vec<VaultId> = self
            .vaults
            .read()
            .await
            .values()
            .map(|e| e.vault_id.clone())
            .collect();
        for id in ids {
            if let Err(e) = self.flush_and_evict(&id).await {
                log::error!("vault {id}: shutdown flush failed: {e}");
            }
        }
    }

    /// Drop a vault from memory without flushing. Used after a backup
    /// restore, where the on-disk state is newer than the in-memory doc.
    pub async fn discard(&self, vault_id: &VaultId) {
        if self.vaults.write().await.remove(vault_id.as_str()).is_some() {
            log::info!("vault {vault_id}: discarded from registry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn vid(s: &str) -> VaultId {
        VaultId::parse(s).unwrap()
    }

    async fn registry() -> (tempfile::TempDir, Arc<DocRegistry>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(VaultStore::new(dir.path()));
        store.init().await.unwrap();
        let registry = Arc::new(DocRegistry::with_debounce(
            store,
            Duration::from_millis(50),
        ));
        (dir, registry)
    }

    #[tokio::test]
    async fn get_or_create_creates_vault_on_disk() {
        let (_dir, registry) = registry().await;
        let id = vid("v1");
        assert!(!registry.store().exists(&id).await);
        let entry = registry.get_or_create(&id).await.unwrap();
        assert!(registry.store().exists(&id).await);
        assert!(!entry.is_dirty());
        assert_eq!(registry.live_count().await, 1);

        // Second call returns the same entry.
        let again = registry.get_or_create(&id).await.unwrap();
        assert!(Arc::ptr_eq(&entry, &again));
    }

    #[tokio::test]
    async fn applied_update_marks_dirty() {
        let (_dir, registry) = registry().await;
        let entry = registry.get_or_create(&vid("v1")).await.unwrap();
        {
            let state = entry.state.lock().await;
            state.set_file_text("n.md", "abc");
        }
        assert!(entry.is_dirty());
        assert_eq!(
            entry.state.lock().await.file_text("n.md").as_deref(),
            Some("abc")
        );
    }

    #[tokio::test]
    async fn flush_persists_and_clears_dirty() {
        let (_dir, registry) = registry().await;
        let id = vid("v1");
        let entry = registry.get_or_create(&id).await.unwrap();
        {
            let state = entry.state.lock().await;
            state.set_file_text("n.md", "abc");
        }
        registry.flush(&entry).await.unwrap();
        assert!(!entry.is_dirty());
        assert!(!registry.store().load_snapshot(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn flush_dirty_only_touches_dirty_vaults() {
        let (_dir, registry) = registry().await;
        let a = registry.get_or_create(&vid("a")).await.unwrap();
        let _b = registry.get_or_create(&vid("b")).await.unwrap();
        {
            let state = a.state.lock().await;
            state.set_file_text("n.md", "x");
        }
        assert_eq!(registry.flush_dirty().await, 1);
        assert_eq!(registry.flush_dirty().await, 0);
    }

    #[tokio::test]
    async fn evict_and_reload_roundtrips_state() {
        let (_dir, registry) = registry().await;
        let id = vid("v5");
        let entry = registry.get_or_create(&id).await.unwrap();
        {
            let state = entry.state.lock().await;
            state.set_file_text("n.md", "abc");
        }
        drop(entry);
        assert!(registry.flush_and_evict(&id).await.unwrap());
        assert!(registry.get(&id).await.is_none());

        // Reload reconstructs the same document.
        let entry = registry.get_or_create(&id).await.unwrap();
        let state = entry.state.lock().await;
        assert_eq!(state.file_text("n.md").as_deref(), Some("abc"));
        assert_eq!(state.file_list(), vec!["n.md".to_string()]);
    }

    #[tokio::test]
    async fn evict_materializes_files() {
        let (_dir, registry) = registry().await;
        let id = vid("v5");
        let entry = registry.get_or_create(&id).await.unwrap();
        {
            let state = entry.state.lock().await;
            state.set_file_text("notes/n.md", "abc");
        }
        drop(entry);
        registry.flush_and_evict(&id).await.unwrap();
        assert_eq!(
            registry.store().read_file(&id, "notes/n.md").await.unwrap(),
            "abc"
        );
    }

    #[tokio::test]
    async fn debounce_materializes_edits() {
        let (_dir, registry) = registry().await;
        let id = vid("v1");
        let entry = registry.get_or_create(&id).await.unwrap();

        // Burst of edits within one debounce window.
        {
            let state = entry.state.lock().await;
            state.set_file_text("note.md", "Hello");
        }
        {
            let state = entry.state.lock().await;
            state.set_file_text("note.md", "Hello World");
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            registry.store().read_file(&id, "note.md").await.unwrap(),
            "Hello World"
        );
    }

    #[tokio::test]
    async fn debounce_deletes_removed_files() {
        let (_dir, registry) = registry().await;
        let id = vid("v1");
        let entry = registry.get_or_create(&id).await.unwrap();
        {
            let state = entry.state.lock().await;
            state.set_file_text("gone.md", "x");
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(registry.store().read_file(&id, "gone.md").await.is_ok());

        {
            let state = entry.state.lock().await;
            assert!(state.remove_file("gone.md").is_some());
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(matches!(
            registry.store().read_file(&id, "gone.md").await,
            Err(quill_store::VaultError::FileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn corrupt_snapshot_degrades_to_empty_doc() {
        let (_dir, registry) = registry().await;
        let id = vid("v1");
        registry.store().create_vault(&id).await.unwrap();
        registry
            .store()
            .save_snapshot(&id, b"definitely not an update")
            .await
            .unwrap();
        let entry = registry.get_or_create(&id).await.unwrap();
        assert!(entry.state.lock().await.file_list().is_empty());
    }

    #[tokio::test]
    async fn discard_drops_without_flush() {
        let (_dir, registry) = registry().await;
        let id = vid("v1");
        let entry = registry.get_or_create(&id).await.unwrap();
        {
            let state = entry.state.lock().await;
            state.set_file_text("n.md", "unsaved");
        }
        drop(entry);
        registry.discard(&id).await;
        assert!(registry.get(&id).await.is_none());
        // Nothing was persisted.
        let entry = registry.get_or_create(&id).await.unwrap();
        assert!(entry.state.lock().await.file_text("n.md").is_none());
    }

    #[tokio::test]
    async fn diff_and_state_vector_work_against_peer() {
        let (_dir, registry) = registry().await;
        let entry = registry.get_or_create(&vid("v1")).await.unwrap();
        {
            let state = entry.state.lock().await;
            state.set_file_text("n.md", "server text");
        }
        let state = entry.state.lock().await;

        // A fresh peer announces an empty state vector and gets everything.
        let empty_sv = StateVector::default().encode_v1();
        let diff = state.encode_diff(&empty_sv).unwrap();

        let peer = Doc::new();
        let files = peer.get_or_insert_map(FILES_MAP);
        {
            let mut txn = peer.transact_mut();
            txn.apply_update(Update::decode_v1(&diff).unwrap()).unwrap();
        }
        let txn = peer.transact();
        match files.get(&txn, "n.md") {
            Some(Out::YText(text)) => assert_eq!(text.get_string(&txn), "server text"),
            other => panic!("peer missing file after diff: {other:?}"),
        }

        // Bad state vectors are reported, not panicked on.
        assert!(state.encode_diff(b"garbage!").is_err());
    }
}
