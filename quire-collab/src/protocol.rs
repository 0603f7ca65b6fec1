//! Binary framing for the room sync protocol.
//!
//! Wire format (y-protocols compatible, all integers are unsigned LEB128):
//! ```text
//! ┌──────────┬──────────┬─────────────┬──────────────┐
//! │ kind     │ sub-kind │ payload len │ payload      │
//! │ varint   │ varint   │ varint      │ len bytes    │
//! └──────────┴──────────┴─────────────┴──────────────┘
//!   0 = SYNC   0 = STEP1 (state vector)
//!              1 = STEP2 (state diff)
//!              2 = UPDATE (incremental delta)
//!   1 = AWARENESS (no sub-kind, opaque payload)
//! ```
//!
//! Awareness frames are never interpreted by the server; rooms relay the
//! original bytes.

use thiserror::Error;

/// Top-level message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Document synchronization (handshake and updates)
    Sync = 0,
    /// Presence / cursor metadata, relayed verbatim
    Awareness = 1,
}

impl MessageType {
    fn from_u64(value: u64) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::Sync),
            1 => Ok(Self::Awareness),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// Sub-kinds of a SYNC message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncKind {
    Step1 = 0,
    Step2 = 1,
    Update = 2,
}

/// A SYNC message with its CRDT payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Sender's encoded state vector; the receiver answers with a diff.
    Step1(Vec<u8>),
    /// Diff computed against a previously received state vector.
    Step2(Vec<u8>),
    /// Incremental update produced by a document mutation.
    Update(Vec<u8>),
}

impl SyncMessage {
    pub fn kind(&self) -> SyncKind {
        match self {
            Self::Step1(_) => SyncKind::Step1,
            Self::Step2(_) => SyncKind::Step2,
            Self::Update(_) => SyncKind::Update,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Self::Step1(p) | Self::Step2(p) | Self::Update(p) => p,
        }
    }
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Sync(SyncMessage),
    Awareness(Vec<u8>),
}

impl Message {
    pub fn step1(state_vector: Vec<u8>) -> Self {
        Self::Sync(SyncMessage::Step1(state_vector))
    }

    pub fn step2(diff: Vec<u8>) -> Self {
        Self::Sync(SyncMessage::Step2(diff))
    }

    pub fn update(update: Vec<u8>) -> Self {
        Self::Sync(SyncMessage::Update(update))
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Sync(_) => MessageType::Sync,
            Self::Awareness(_) => MessageType::Awareness,
        }
    }

    /// Serialize to wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.payload_len() + 12);
        write_var(&mut buf, self.message_type() as u64);
        match self {
            Self::Sync(sync) => {
                write_var(&mut buf, sync.kind() as u64);
                write_bytes(&mut buf, sync.payload());
            }
            Self::Awareness(payload) => write_bytes(&mut buf, payload),
        }
        buf
    }

    /// Deserialize from wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.is_empty() {
            return Err(ProtocolError::Empty);
        }
        let mut cursor = Cursor::new(bytes);
        let msg = match MessageType::from_u64(cursor.read_var()?)? {
            MessageType::Sync => {
                let sub_kind = cursor.read_var()?;
                let payload = cursor.read_bytes()?.to_vec();
                let sync = match sub_kind {
                    0 => SyncMessage::Step1(payload),
                    1 => SyncMessage::Step2(payload),
                    2 => SyncMessage::Update(payload),
                    other => return Err(ProtocolError::UnknownSyncKind(other)),
                };
                Self::Sync(sync)
            }
            MessageType::Awareness => Self::Awareness(cursor.read_bytes()?.to_vec()),
        };
        Ok(msg)
    }

    fn payload_len(&self) -> usize {
        match self {
            Self::Sync(sync) => sync.payload().len(),
            Self::Awareness(payload) => payload.len(),
        }
    }
}

impl From<SyncMessage> for Message {
    fn from(sync: SyncMessage) -> Self {
        Self::Sync(sync)
    }
}

/// Peek at the message kind without decoding the payload.
pub fn message_kind(bytes: &[u8]) -> Result<MessageType, ProtocolError> {
    if bytes.is_empty() {
        return Err(ProtocolError::Empty);
    }
    MessageType::from_u64(Cursor::new(bytes).read_var()?)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,
    #[error("unknown message type {0}")]
    UnknownMessageType(u64),
    #[error("unknown sync message kind {0}")]
    UnknownSyncKind(u64),
    #[error("message truncated")]
    Truncated,
    #[error("varint overflow")]
    VarintOverflow,
}

fn write_var(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_var(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_var(&mut self) -> Result<u64, ProtocolError> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = *self.bytes.get(self.pos).ok_or(ProtocolError::Truncated)?;
            self.pos += 1;
            if shift >= 64 {
                return Err(ProtocolError::VarintOverflow);
            }
            value |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn read_bytes(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = usize::try_from(self.read_var()?).map_err(|_| ProtocolError::Truncated)?;
        let end = self.pos.checked_add(len).ok_or(ProtocolError::Truncated)?;
        let slice = self.bytes.get(self.pos..end).ok_or(ProtocolError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_update_layout() {
        let encoded = Message::update(vec![7, 8, 9]).encode();
        assert_eq!(encoded, vec![0, 2, 3, 7, 8, 9]);
        assert_eq!(Message::decode(&encoded).unwrap(), Message::update(vec![7, 8, 9]));
    }

    #[test]
    fn test_step1_and_step2_kinds() {
        let step1 = Message::step1(vec![1]).encode();
        let step2 = Message::step2(vec![2]).encode();
        assert_eq!(step1[1], SyncKind::Step1 as u8);
        assert_eq!(step2[1], SyncKind::Step2 as u8);
        assert!(matches!(Message::decode(&step2).unwrap(), Message::Sync(SyncMessage::Step2(p)) if p == vec![2]));
    }

    #[test]
    fn test_awareness_payload_is_opaque() {
        let payload = vec![0xFF, 0x00, 0x10];
        let encoded = Message::Awareness(payload.clone()).encode();
        assert_eq!(message_kind(&encoded).unwrap(), MessageType::Awareness);
        assert_eq!(Message::decode(&encoded).unwrap(), Message::Awareness(payload));
    }

    #[test]
    fn test_large_payload_uses_multibyte_length() {
        let payload = vec![42u8; 300];
        let encoded = Message::update(payload.clone()).encode();
        // 300 = 0b1_0010_1100 → two varint bytes
        assert_eq!(&encoded[2..4], &[0xAC, 0x02]);
        assert_eq!(Message::decode(&encoded).unwrap(), Message::update(payload));
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(Message::decode(&[]), Err(ProtocolError::Empty));
        assert_eq!(Message::decode(&[5, 0]), Err(ProtocolError::UnknownMessageType(5)));
        assert_eq!(Message::decode(&[0, 9, 0]), Err(ProtocolError::UnknownSyncKind(9)));
        assert_eq!(Message::decode(&[0, 2, 10, 1]), Err(ProtocolError::Truncated));
        assert_eq!(Message::decode(&[0x80]), Err(ProtocolError::Truncated));
    }

    #[test]
    fn test_empty_update() {
        let encoded = Message::update(Vec::new()).encode();
        assert_eq!(Message::decode(&encoded).unwrap(), Message::update(Vec::new()));
    }
}
