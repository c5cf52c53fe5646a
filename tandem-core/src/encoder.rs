//! Send chunking: serializes an outbound message and hands it out one buffer at a time.
//!
//! Text messages are framed in memory once. Files send their prefix and name first,
//! then stream from disk, so memory use is bounded by the chunk buffer no matter how
//! large the file is.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

use crate::wire::{self, PrefixError};

/// Error preparing or chunking an outbound message.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("text of {0} bytes exceeds the wire limit")]
    TextTooLong(usize),
    #[error("byte counter does not fit a chunk size")]
    Overflow,
    #[error("file {0:?} has no usable file name")]
    InvalidFileName(String),
    #[error("file ended {missing} bytes early")]
    FileTruncated { missing: u64 },
    #[error("no message loaded")]
    Idle,
    #[error("bad prefix: {0}")]
    Prefix(#[from] PrefixError),
    #[error("reading file: {0}")]
    Io(#[from] std::io::Error),
}

enum Payload {
    Idle,
    Text { frame: Vec<u8> },
    File { header: Vec<u8>, file: File, label: String },
}

/// Resumable send-side progress for one outbound message.
pub struct SendToken {
    payload: Payload,
    total: u64,
    bytes_sent: u64,
    remaining_bytes_to_send: u64,
}

impl Default for SendToken {
    fn default() -> Self {
        Self::new()
    }
}

impl SendToken {
    pub fn new() -> Self {
        SendToken {
            payload: Payload::Idle,
            total: 0,
            bytes_sent: 0,
            remaining_bytes_to_send: 0,
        }
    }

    /// Frame `text` for sending.
    pub fn load_text(&mut self, text: &str) -> Result<(), EncodeError> {
        if wire::text_len_field(text.len()).is_none() {
            return Err(EncodeError::TextTooLong(text.len()));
        }
        let frame = wire::encode_text_frame(text)?;
        let total = u64::try_from(frame.len()).map_err(|_| EncodeError::Overflow)?;
        self.payload = Payload::Text { frame };
        self.start(total);
        Ok(())
    }

    /// Open `path` for streaming. The peer receives it under the path's file name.
    pub fn load_file(&mut self, path: &Path) -> Result<(), EncodeError> {
        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| EncodeError::InvalidFileName(path.display().to_string()))?;
        if wire::text_len_field(label.len()).is_none() {
            return Err(EncodeError::TextTooLong(label.len()));
        }
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let header = wire::encode_file_header(&label, file_len)?;
        let total = u64::try_from(header.len())
            .ok()
            .and_then(|h| h.checked_add(file_len))
            .ok_or(EncodeError::Overflow)?;
        self.payload = Payload::File {
            header,
            file,
            label,
        };
        self.start(total);
        Ok(())
    }

    fn start(&mut self, total: u64) {
        self.total = total;
        self.bytes_sent = 0;
        self.remaining_bytes_to_send = total;
    }

    /// Copy the next chunk (at most `buf.len()` bytes) into `buf` and return its length.
    /// Counters move only in [`SendToken::complete_chunk`].
    pub fn fill(&mut self, buf: &mut [u8]) -> Result<usize, EncodeError> {
        let cap = u64::try_from(buf.len()).map_err(|_| EncodeError::Overflow)?;
        let chunk = usize::try_from(self.remaining_bytes_to_send.min(cap))
            .map_err(|_| EncodeError::Overflow)?;
        let offset = usize::try_from(self.bytes_sent).map_err(|_| EncodeError::Overflow);
        let buf = &mut buf[..chunk];
        match &mut self.payload {
            Payload::Idle => Err(EncodeError::Idle),
            Payload::Text { frame } => {
                let offset = offset?;
                buf.copy_from_slice(&frame[offset..offset + chunk]);
                Ok(chunk)
            }
            Payload::File { header, file, .. } => {
                let mut filled = 0;
                if let Ok(offset) = offset {
                    if offset < header.len() {
                        let n = (header.len() - offset).min(chunk);
                        buf[..n].copy_from_slice(&header[offset..offset + n]);
                        filled = n;
                    }
                }
                while filled < chunk {
                    match file.read(&mut buf[filled..]) {
                        Ok(0) => {
                            let missing = self.remaining_bytes_to_send - filled as u64;
                            return Err(EncodeError::FileTruncated { missing });
                        }
                        Ok(n) => filled += n,
                        Err(e) if e.kind() == ErrorKind::Interrupted => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(chunk)
            }
        }
    }

    /// Record that `n` bytes from the last [`SendToken::fill`] reached the transport.
    pub fn complete_chunk(&mut self, n: usize) -> Result<(), EncodeError> {
        let n = u64::try_from(n).map_err(|_| EncodeError::Overflow)?;
        self.remaining_bytes_to_send = self
            .remaining_bytes_to_send
            .checked_sub(n)
            .ok_or(EncodeError::Overflow)?;
        self.bytes_sent += n;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.remaining_bytes_to_send == 0
    }

    pub fn is_file(&self) -> bool {
        matches!(self.payload, Payload::File { .. })
    }

    /// File name for file sends; empty otherwise.
    pub fn label(&self) -> &str {
        match &self.payload {
            Payload::File { label, .. } => label,
            _ => "",
        }
    }

    /// Fraction of the message sent, in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.bytes_sent as f64 / self.total as f64
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn remaining_bytes_to_send(&self) -> u64 {
        self.remaining_bytes_to_send
    }

    /// Drop the payload (closing any file) and zero all counters.
    pub fn reset(&mut self) {
        let SendToken {
            payload,
            total,
            bytes_sent,
            remaining_bytes_to_send,
        } = self;
        *payload = Payload::Idle;
        *total = 0;
        *bytes_sent = 0;
        *remaining_bytes_to_send = 0;
    }
}
