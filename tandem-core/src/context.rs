//! Operation contexts: reusable per-operation state, one kind per socket operation.

use std::fmt;
use std::path::PathBuf;

use crate::arena::Region;
use crate::decoder::ReceiveToken;
use crate::encoder::SendToken;
use crate::endpoint::Endpoint;
use crate::pool::Reusable;

/// The four pooled socket operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Accept,
    Connect,
    Send,
    Receive,
}

impl OperationKind {
    /// Short lowercase name, also used to label the kind's context pool.
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Accept => "accept",
            OperationKind::Connect => "connect",
            OperationKind::Send => "send",
            OperationKind::Receive => "receive",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one pending accept. Accepts move no payload, so no region is bound.
#[derive(Debug, Default)]
pub struct AcceptContext {
    pub peer: Option<Endpoint>,
}

impl Reusable for AcceptContext {
    fn reset(&mut self) {
        self.peer = None;
    }
}

/// State of one outbound connect attempt.
#[derive(Debug, Default)]
pub struct ConnectContext {
    pub target: Option<Endpoint>,
}

impl Reusable for ConnectContext {
    fn reset(&mut self) {
        self.target = None;
    }
}

/// Chunked send state: an arena region plus the encoder's progress token.
pub struct SendContext {
    pub region: Region,
    pub token: SendToken,
}

impl SendContext {
    pub fn new(region: Region) -> Self {
        SendContext {
            region,
            token: SendToken::new(),
        }
    }
}

impl Reusable for SendContext {
    fn reset(&mut self) {
        self.token.reset();
    }
}

/// Receive state: an arena region plus the decoder's progress token.
pub struct ReceiveContext {
    pub region: Region,
    pub token: ReceiveToken,
}

impl ReceiveContext {
    pub fn new(region: Region, download_dir: impl Into<PathBuf>) -> Self {
        ReceiveContext {
            region,
            token: ReceiveToken::new(download_dir),
        }
    }
}

impl Reusable for ReceiveContext {
    fn reset(&mut self) {
        self.token.reset();
    }
}
