//! Binary sync protocol frames.
//!
//! One message per WebSocket binary frame:
//!
//! ```text
//! ┌─────────┬───────────┬──────────────────────────────┐
//! │ tag     │ sub-tag   │ payload                      │
//! │ 1 byte  │ 1 byte    │ variable                     │
//! └─────────┴───────────┴──────────────────────────────┘
//!
//! tag 0 = SYNC       sub 0 SyncStep1 (state vector)
//!                    sub 1 SyncStep2 (full/diff update)
//!                    sub 2 Update    (incremental update)
//! tag 1 = AWARENESS  no sub-tag; bincode AwarenessDelta payload
//! tag 2 = AUTH       reserved, never produced or consumed
//! ```
//!
//! SYNC payload bodies are the CRDT library's v1 binary encodings (state
//! vectors and updates); this module does not interpret them.

/// Leading frame tags.
pub const TAG_SYNC: u8 = 0;
pub const TAG_AWARENESS: u8 = 1;
pub const TAG_AUTH: u8 = 2;

/// SYNC sub-message tags.
pub const SYNC_STEP1: u8 = 0;
pub const SYNC_STEP2: u8 = 1;
pub const SYNC_UPDATE: u8 = 2;

/// A SYNC sub-message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncPayload {
    /// State vector: "tell me what I'm missing".
    Step1(Vec<u8>),
    /// The reply diff, or the eager full state sent on join.
    Step2(Vec<u8>),
    /// Incremental delta from a live edit.
    Update(Vec<u8>),
}

impl SyncPayload {
    pub fn body(&self) -> &[u8] {
        match self {
            SyncPayload::Step1(b) | SyncPayload::Step2(b) | SyncPayload::Update(b) => b,
        }
    }

    /// SyncStep2 and Update carry document mutations; SyncStep1 does not.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, SyncPayload::Step1(_))
    }
}

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Sync(SyncPayload),
    Awareness(Vec<u8>),
}

impl Frame {
    pub fn sync_step1(state_vector: Vec<u8>) -> Self {
        Frame::Sync(SyncPayload::Step1(state_vector))
    }

    pub fn sync_step2(update: Vec<u8>) -> Self {
        Frame::Sync(SyncPayload::Step2(update))
    }

    pub fn sync_update(update: Vec<u8>) -> Self {
        Frame::Sync(SyncPayload::Update(update))
    }

    pub fn awareness(delta: Vec<u8>) -> Self {
        Frame::Awareness(delta)
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Sync(payload) => {
                let (sub, body) = match payload {
                    SyncPayload::Step1(b) => (SYNC_STEP1, b),
                    SyncPayload::Step2(b) => (SYNC_STEP2, b),
                    SyncPayload::Update(b) => (SYNC_UPDATE, b),
                };
                let mut out = Vec::with_capacity(2 + body.len());
                out.push(TAG_SYNC);
                out.push(sub);
                out.extend_from_slice(body);
                out
            }
            Frame::Awareness(delta) => {
                let mut out = Vec::with_capacity(1 + delta.len());
                out.push(TAG_AWARENESS);
                out.extend_from_slice(delta);
                out
            }
        }
    }

    /// Deserialize from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Frame, ProtocolError> {
        let (&tag, rest) = bytes.split_first().ok_or(ProtocolError::EmptyFrame)?;
        match tag {
            TAG_SYNC => {
                let (&sub, body) = rest.split_first().ok_or(ProtocolError::EmptyFrame)?;
                let payload = match sub {
                    SYNC_STEP1 => SyncPayload::Step1(body.to_vec()),
                    SYNC_STEP2 => SyncPayload::Step2(body.to_vec()),
                    SYNC_UPDATE => SyncPayload::Update(body.to_vec()),
                    other => return Err(ProtocolError::UnknownSyncType(other)),
                };
                Ok(Frame::Sync(payload))
            }
            TAG_AWARENESS => Ok(Frame::Awareness(rest.to_vec())),
            TAG_AUTH => Err(ProtocolError::ReservedTag(TAG_AUTH)),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    EmptyFrame,
    ReservedTag(u8),
    UnknownTag(u8),
    UnknownSyncType(u8),
    InvalidPayload(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyFrame => write!(f, "empty or truncated frame"),
            Self::ReservedTag(t) => write!(f, "reserved frame tag: {t}"),
            Self::UnknownTag(t) => write!(f, "unknown frame tag: {t}"),
            Self::UnknownSyncType(t) => write!(f, "unknown sync sub-message: {t}"),
            Self::InvalidPayload(e) => write!(f, "invalid payload: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_step1_roundtrip() {
        let frame = Frame::sync_step1(vec![10, 20, 30]);
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
        assert!(!matches!(&decoded, Frame::Sync(p) if p.is_mutation()));
    }

    #[test]
    fn test_sync_step2_roundtrip() {
        let frame = Frame::sync_step2(vec![1, 2, 3, 4]);
        let encoded = frame.encode();
        assert_eq!(encoded[0], TAG_SYNC);
        assert_eq!(encoded[1], SYNC_STEP2);
        assert_eq!(Frame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn test_update_roundtrip_and_mutation_flag() {
        let frame = Frame::sync_update(vec![9; 64]);
        let decoded = Frame::decode(&frame.encode()).unwrap();
        match &decoded {
            Frame::Sync(p) => {
                assert!(p.is_mutation());
                assert_eq!(p.body(), &[9; 64]);
            }
            other => panic!("expected sync frame, got {other:?}"),
        }
    }

    #[test]
    fn test_awareness_roundtrip() {
        let frame = Frame::awareness(vec![7, 7, 7]);
        let encoded = frame.encode();
        assert_eq!(encoded[0], TAG_AWARENESS);
        assert_eq!(Frame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn test_empty_payloads_survive() {
        let frame = Frame::sync_update(Vec::new());
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
        let frame = Frame::awareness(Vec::new());
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(Frame::decode(&[]), Err(ProtocolError::EmptyFrame));
        assert_eq!(Frame::decode(&[0]), Err(ProtocolError::EmptyFrame));
        assert_eq!(Frame::decode(&[0, 9, 1]), Err(ProtocolError::UnknownSyncType(9)));
        assert_eq!(Frame::decode(&[2, 0]), Err(ProtocolError::ReservedTag(2)));
        assert_eq!(Frame::decode(&[0xFF]), Err(ProtocolError::UnknownTag(0xFF)));
    }

    #[test]
    fn test_tag_values() {
        assert_eq!(TAG_SYNC, 0);
        assert_eq!(TAG_AWARENESS, 1);
        assert_eq!(TAG_AUTH, 2);
        assert_eq!(SYNC_STEP1, 0);
        assert_eq!(SYNC_STEP2, 1);
        assert_eq!(SYNC_UPDATE, 2);
    }
}
