//! Receive reassembly: a resumable state machine fed with whatever bytes each read delivers.
//!
//! A read may end anywhere: inside the prefix, inside the text segment, inside the
//! file segment, or past the end of one message and into the next. The token keeps
//! exactly enough state to pick up where the previous read stopped. File content is
//! written straight to disk as it arrives and is never accumulated in memory.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::wire::{MessageKind, Prefix, PrefixError, PREFIX_SIZE};

/// Most text bytes reserved up front; longer segments grow as bytes arrive.
const TEXT_PREALLOC_LIMIT: usize = 64 * 1024;

/// A fully received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Text(String),
    File { name: String, path: PathBuf, len: u64 },
}

/// Outcome of one decode step.
#[derive(Debug)]
pub struct Step {
    /// Bytes of the input taken by this step.
    pub consumed: usize,
    /// Set when this step completed a message.
    pub delivery: Option<Delivery>,
}

impl Step {
    fn pending(consumed: usize) -> Self {
        Step {
            consumed,
            delivery: None,
        }
    }

    fn done(consumed: usize, delivery: Delivery) -> Self {
        Step {
            consumed,
            delivery: Some(delivery),
        }
    }
}

/// Error decoding the inbound stream. Any of these is fatal for the connection.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("bad prefix: {0}")]
    Prefix(#[from] PrefixError),
    #[error("file name {0:?} has no usable file component")]
    InvalidFileName(String),
    #[error("writing received file: {0}")]
    Io(#[from] std::io::Error),
}

/// Resumable receive-side progress for one connection.
pub struct ReceiveToken {
    download_dir: PathBuf,
    prefix: [u8; PREFIX_SIZE],
    prefix_bytes_received: usize,
    kind: Option<MessageKind>,
    text_length: usize,
    file_length: u64,
    text: Vec<u8>,
    text_bytes_received: usize,
    file_bytes_received: u64,
    file_name: Option<String>,
    destination: Option<PathBuf>,
    output: Option<File>,
}

impl ReceiveToken {
    /// Token whose received files land under `download_dir`.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        ReceiveToken {
            download_dir: download_dir.into(),
            prefix: [0u8; PREFIX_SIZE],
            prefix_bytes_received: 0,
            kind: None,
            text_length: 0,
            file_length: 0,
            text: Vec::new(),
            text_bytes_received: 0,
            file_bytes_received: 0,
            file_name: None,
            destination: None,
            output: None,
        }
    }

    /// Consume all of `input`, calling `on_delivery` for every message it completes.
    pub fn feed(
        &mut self,
        mut input: &[u8],
        mut on_delivery: impl FnMut(Delivery),
    ) -> Result<(), DecodeError> {
        while !input.is_empty() {
            let step = self.step(input)?;
            input = &input[step.consumed..];
            if let Some(delivery) = step.delivery {
                on_delivery(delivery);
            }
        }
        Ok(())
    }

    /// Advance through at most one message. Consumes at least one byte of non-empty
    /// input; stops early only when a message completes.
    pub fn step(&mut self, input: &[u8]) -> Result<Step, DecodeError> {
        let mut used = 0;

        let kind = match self.kind {
            Some(kind) => kind,
            None => {
                let want = PREFIX_SIZE - self.prefix_bytes_received;
                let take = want.min(input.len());
                let at = self.prefix_bytes_received;
                self.prefix[at..at + take].copy_from_slice(&input[..take]);
                self.prefix_bytes_received += take;
                used += take;
                if self.prefix_bytes_received < PREFIX_SIZE {
                    return Ok(Step::pending(used));
                }
                let prefix = Prefix::decode(&self.prefix)?;
                self.kind = Some(prefix.kind);
                self.text_length = prefix.text_len as usize;
                self.file_length = prefix.file_len;
                self.text.clear();
                self.text.reserve(self.text_length.min(TEXT_PREALLOC_LIMIT));
                prefix.kind
            }
        };

        if self.text_bytes_received < self.text_length {
            let rest = &input[used..];
            let take = (self.text_length - self.text_bytes_received).min(rest.len());
            self.text.extend_from_slice(&rest[..take]);
            self.text_bytes_received += take;
            used += take;
            if self.text_bytes_received < self.text_length {
                return Ok(Step::pending(used));
            }
        }

        match kind {
            MessageKind::Text => {
                let body = String::from_utf8_lossy(&self.text).into_owned();
                self.reset();
                Ok(Step::done(used, Delivery::Text(body)))
            }
            MessageKind::File => self.file_step(&input[used..], used),
        }
    }

    fn file_step(&mut self, rest: &[u8], mut used: usize) -> Result<Step, DecodeError> {
        if self.destination.is_none() {
            let name = String::from_utf8_lossy(&self.text).into_owned();
            let file_name = Path::new(&name)
                .file_name()
                .ok_or_else(|| DecodeError::InvalidFileName(name.clone()))?;
            self.destination = Some(self.download_dir.join(file_name));
            self.file_name = Some(name);
        }

        let remaining = self.file_length - self.file_bytes_received;
        let take = usize::try_from(remaining).map_or(rest.len(), |r| r.min(rest.len()));
        if take > 0 {
            let out = self.output_file()?;
            out.write_all(&rest[..take])?;
            out.flush()?;
            self.file_bytes_received += take as u64;
            used += take;
        }
        if self.file_bytes_received < self.file_length {
            return Ok(Step::pending(used));
        }

        // Zero-length files are created here; longer ones are already open.
        self.output_file()?;
        let delivery = Delivery::File {
            name: self.file_name.take().unwrap_or_default(),
            path: self.destination.take().unwrap_or_default(),
            len: self.file_length,
        };
        self.reset();
        Ok(Step::done(used, delivery))
    }

    fn output_file(&mut self) -> Result<&mut File, DecodeError> {
        let file = match self.output.take() {
            Some(file) => file,
            None => {
                let path = self
                    .destination
                    .as_ref()
                    .ok_or_else(|| DecodeError::InvalidFileName(String::new()))?;
                let file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)?;
                tracing::debug!(path = %path.display(), len = self.file_length, "receiving file");
                file
            }
        };
        Ok(self.output.insert(file))
    }

    /// Return every field to its zero state. Closes (but keeps) any partial output file.
    pub fn reset(&mut self) {
        let ReceiveToken {
            download_dir: _,
            prefix,
            prefix_bytes_received,
            kind,
            text_length,
            file_length,
            text,
            text_bytes_received,
            file_bytes_received,
            file_name,
            destination,
            output,
        } = self;
        *prefix = [0u8; PREFIX_SIZE];
        *prefix_bytes_received = 0;
        *kind = None;
        *text_length = 0;
        *file_length = 0;
        text.clear();
        *text_bytes_received = 0;
        *file_bytes_received = 0;
        *file_name = None;
        *destination = None;
        *output = None;
    }

    /// True when no message is partially received.
    pub fn is_idle(&self) -> bool {
        self.prefix_bytes_received == 0
    }

    /// Destination and byte count of a file transfer that is mid-way, if any.
    pub fn partial_file(&self) -> Option<(&Path, u64)> {
        self.output
            .as_ref()
            .and(self.destination.as_deref())
            .map(|p| (p, self.file_bytes_received))
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn kind(&self) -> Option<MessageKind> {
        self.kind
    }

    pub fn prefix_bytes_received(&self) -> usize {
        self.prefix_bytes_received
    }

    pub fn text_bytes_received(&self) -> usize {
        self.text_bytes_received
    }

    pub fn file_bytes_received(&self) -> u64 {
        self.file_bytes_received
    }

    pub fn text_length(&self) -> usize {
        self.text_length
    }

    pub fn file_length(&self) -> u64 {
        self.file_length
    }
}
