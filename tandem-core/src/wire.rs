//! Framing: 13-byte prefix (1 byte kind, 4 bytes text length, 8 bytes file length,
//! little-endian via bincode fixint) followed by the text segment and, for files,
//! the raw file segment.

use serde::{Deserialize, Serialize};

/// Size of the fixed prefix preceding every message.
pub const PREFIX_SIZE: usize = 1 + 4 + 8;
/// Upper bound on a text segment (message body or file name).
pub const MAX_TEXT_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Payload kind carried in the first prefix byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    File,
}

impl MessageKind {
    pub fn as_byte(self) -> u8 {
        match self {
            MessageKind::Text => 0,
            MessageKind::File => 1,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(MessageKind::Text),
            1 => Some(MessageKind::File),
            _ => None,
        }
    }
}

/// On-wire prefix layout. Field order is the wire order.
#[derive(Serialize, Deserialize)]
struct RawPrefix {
    kind: u8,
    text_len: u32,
    file_len: u64,
}

/// Parsed message prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prefix {
    pub kind: MessageKind,
    pub text_len: u32,
    pub file_len: u64,
}

impl Prefix {
    pub fn text(text_len: u32) -> Self {
        Prefix {
            kind: MessageKind::Text,
            text_len,
            file_len: 0,
        }
    }

    pub fn file(name_len: u32, file_len: u64) -> Self {
        Prefix {
            kind: MessageKind::File,
            text_len: name_len,
            file_len,
        }
    }

    /// Serialize into the fixed 13-byte layout.
    pub fn encode(&self) -> Result<[u8; PREFIX_SIZE], PrefixError> {
        let raw = RawPrefix {
            kind: self.kind.as_byte(),
            text_len: self.text_len,
            file_len: self.file_len,
        };
        let mut out = [0u8; PREFIX_SIZE];
        bincode::serialize_into(&mut out[..], &raw)?;
        Ok(out)
    }

    /// Parse and validate a complete prefix.
    pub fn decode(bytes: &[u8; PREFIX_SIZE]) -> Result<Self, PrefixError> {
        let raw: RawPrefix = bincode::deserialize(bytes)?;
        let kind = MessageKind::from_byte(raw.kind).ok_or(PrefixError::UnknownKind(raw.kind))?;
        if raw.text_len > MAX_TEXT_LEN {
            return Err(PrefixError::TextTooLong(raw.text_len));
        }
        if kind == MessageKind::Text && raw.file_len != 0 {
            return Err(PrefixError::UnexpectedFileSegment(raw.file_len));
        }
        Ok(Prefix {
            kind,
            text_len: raw.text_len,
            file_len: raw.file_len,
        })
    }
}

/// Error building or parsing a prefix.
#[derive(Debug, thiserror::Error)]
pub enum PrefixError {
    #[error("prefix codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
    #[error("text segment of {0} bytes exceeds limit")]
    TextTooLong(u32),
    #[error("text message declares a {0}-byte file segment")]
    UnexpectedFileSegment(u64),
}

/// Validate a text segment length for the wire, returning it as the 4-byte field value.
pub fn text_len_field(len: usize) -> Option<u32> {
    u32::try_from(len).ok().filter(|&l| l <= MAX_TEXT_LEN)
}

/// Encode a complete Text message (prefix + body) into one buffer.
pub fn encode_text_frame(text: &str) -> Result<Vec<u8>, PrefixError> {
    let len = text_len_field(text.len()).ok_or(PrefixError::TextTooLong(u32::MAX))?;
    let prefix = Prefix::text(len).encode()?;
    let mut out = Vec::with_capacity(PREFIX_SIZE + text.len());
    out.extend_from_slice(&prefix);
    out.extend_from_slice(text.as_bytes());
    Ok(out)
}

/// Encode the header of a File message: prefix followed by the destination name.
pub fn encode_file_header(name: &str, file_len: u64) -> Result<Vec<u8>, PrefixError> {
    let len = text_len_field(name.len()).ok_or(PrefixError::TextTooLong(u32::MAX))?;
    let prefix = Prefix::file(len, file_len).encode()?;
    let mut out = Vec::with_capacity(PREFIX_SIZE + name.len());
    out.extend_from_slice(&prefix);
    out.extend_from_slice(name.as_bytes());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_layout_is_little_endian_without_padding() {
        let bytes = Prefix::file(5, 0x0102).encode().unwrap();
        assert_eq!(bytes.len(), PREFIX_SIZE);
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..5], &5u32.to_le_bytes());
        assert_eq!(&bytes[5..13], &0x0102u64.to_le_bytes());
    }

    #[test]
    fn prefix_decode_roundtrip() {
        let p = Prefix::file(7, 1 << 40);
        let decoded = Prefix::decode(&p.encode().unwrap()).unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn unknown_kind_rejected() {
        let mut bytes = Prefix::text(3).encode().unwrap();
        bytes[0] = 9;
        assert!(matches!(
            Prefix::decode(&bytes),
            Err(PrefixError::UnknownKind(9))
        ));
    }

    #[test]
    fn oversized_text_rejected() {
        let mut bytes = Prefix::text(0).encode().unwrap();
        bytes[1..5].copy_from_slice(&(MAX_TEXT_LEN + 1).to_le_bytes());
        assert!(matches!(
            Prefix::decode(&bytes),
            Err(PrefixError::TextTooLong(_))
        ));
    }

    #[test]
    fn text_with_file_segment_rejected() {
        let mut bytes = Prefix::text(1).encode().unwrap();
        bytes[5] = 1;
        assert!(matches!(
            Prefix::decode(&bytes),
            Err(PrefixError::UnexpectedFileSegment(1))
        ));
    }

    #[test]
    fn text_frame_layout() {
        let frame = encode_text_frame("hello").unwrap();
        assert_eq!(frame.len(), PREFIX_SIZE + 5);
        assert_eq!(frame[0], 0);
        assert_eq!(&frame[PREFIX_SIZE..], b"hello");
    }

    #[test]
    fn file_header_layout() {
        let header = encode_file_header("a.bin", 99).unwrap();
        assert_eq!(header.len(), PREFIX_SIZE + 5);
        let mut prefix = [0u8; PREFIX_SIZE];
        prefix.copy_from_slice(&header[..PREFIX_SIZE]);
        assert_eq!(Prefix::decode(&prefix).unwrap(), Prefix::file(5, 99));
        assert_eq!(&header[PREFIX_SIZE..], b"a.bin");
    }
}
