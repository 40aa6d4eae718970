//! Per-vault presence state.
//!
//! Awareness is the ephemeral "who is looking at what" layer: each client
//! publishes an opaque JSON state (cursor, selection, active file) keyed by
//! its numeric client id. States live only in memory, are fanned out to the
//! other clients of the same vault, and vanish with the vault.
//!
//! Deltas are bincode-encoded and ride inside `AWARENESS` frames. An entry
//! with `state: None` removes that client from the set, which is also how
//! a departing client's presence is broadcast away.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::protocol::ProtocolError;

/// One client's entry in a delta. `state` is raw JSON text, treated as
/// opaque bytes by the server; `None` removes the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    pub client_id: u64,
    pub state: Option<String>,
}

/// A batch of awareness changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessDelta {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessDelta {
    pub fn set(client_id: u64, state: impl Into<String>) -> Self {
        Self {
            entries: vec![AwarenessEntry {
                client_id,
                state: Some(state.into()),
            }],
        }
    }

    pub fn remove(client_ids: impl IntoIterator<Item = u64>) -> Self {
        Self {
            entries: client_ids
                .into_iter()
                .map(|client_id| AwarenessEntry {
                    client_id,
                    state: None,
                })
                .collect(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (delta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
        Ok(delta)
    }
}

/// The live awareness set of one vault.
#[derive(Debug, Default)]
pub struct AwarenessSet {
    states: HashMap<u64, String>,
}

impl AwarenessSet {
    /// Apply a delta; returns the client ids it touched.
    pub fn apply(&mut self, delta: &AwarenessDelta) -> Vec<u64> {
        let mut touched = Vec::with_capacity(delta.entries.len());
        for entry in &delta.entries {
            match &entry.state {
                Some(state) => {
                    self.states.insert(entry.client_id, state.clone());
                }
                None => {
                    self.states.remove(&entry.client_id);
                }
            }
            touched.push(entry.client_id);
        }
        touched
    }

    /// Drop the given clients; returns the removal delta to broadcast, or
    /// `None` if none of them had a state.
    pub fn remove_clients<'a>(
        &mut self,
        ids: impl IntoIterator<Item = &'a u64>,
    ) -> Option<AwarenessDelta> {
        let removed: Vec<u64> = ids
            .into_iter()
            .filter(|id| self.states.remove(id).is_some())
            .copied()
            .collect();
        if removed.is_empty() {
            None
        } else {
            Some(AwarenessDelta::remove(removed))
        }
    }

    /// Full current state as a delta, for newly joined clients.
    pub fn snapshot(&self) -> Option<AwarenessDelta> {
        if self.states.is_empty() {
            return None;
        }
        let mut entries: Vec<AwarenessEntry> = self
            .states
            .iter()
            .map(|(client_id, state)| AwarenessEntry {
                client_id: *client_id,
                state: Some(state.clone()),
            })
            .collect();
        entries.sort_by_key(|e| e.client_id);
        Some(AwarenessDelta { entries })
    }

    pub fn get(&self, client_id: u64) -> Option<&str> {
        self.states.get(&client_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_roundtrip() {
        let delta = AwarenessDelta {
            entries: vec![
                AwarenessEntry {
                    client_id: 7,
                    state: Some(r#"{"cursor":{"file":"a.md","offset":4}}"#.into()),
                },
                AwarenessEntry {
                    client_id: 9,
                    state: None,
                },
            ],
        };
        let decoded = AwarenessDelta::decode(&delta.encode().unwrap()).unwrap();
        assert_eq!(decoded, delta);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(AwarenessDelta::decode(&[0xFF, 0xFE]).is_err());
    }

    #[test]
    fn test_apply_set_and_remove() {
        let mut set = AwarenessSet::default();
        set.apply(&AwarenessDelta::set(1, r#"{"file":"a.md"}"#));
        set.apply(&AwarenessDelta::set(2, r#"{"file":"b.md"}"#));
        assert_eq!(set.len(), 2);
        assert_eq!(set.get(1), Some(r#"{"file":"a.md"}"#));

        let touched = set.apply(&AwarenessDelta::remove([1]));
        assert_eq!(touched, vec![1]);
        assert_eq!(set.len(), 1);
        assert!(set.get(1).is_none());
    }

    #[test]
    fn test_remove_clients_emits_delta_only_for_known() {
        let mut set = AwarenessSet::default();
        set.apply(&AwarenessDelta::set(3, "{}"));

        let delta = set.remove_clients([&3u64, &99u64].into_iter()).unwrap();
        assert_eq!(delta.entries.len(), 1);
        assert_eq!(delta.entries[0].client_id, 3);
        assert!(delta.entries[0].state.is_none());

        assert!(set.remove_clients([&3u64].into_iter()).is_none());
    }

    #[test]
    fn test_snapshot_is_sorted_and_skips_empty() {
        let mut set = AwarenessSet::default();
        assert!(set.snapshot().is_none());
        set.apply(&AwarenessDelta::set(9, "{}"));
        set.apply(&AwarenessDelta::set(2, "{}"));
        let snap = set.snapshot().unwrap();
        let ids: Vec<u64> = snap.entries.iter().map(|e| e.client_id).collect();
        assert_eq!(ids, vec![2, 9]);
    }
}
