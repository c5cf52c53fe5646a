//! Tandem engine core: buffer arena, operation-context pools, wire codec, connection registry.
//! Runtime-agnostic: the host owns the sockets and feeds bytes in; only received and
//! sent files are touched on disk here.

pub mod arena;
pub mod context;
pub mod decoder;
pub mod encoder;
pub mod endpoint;
pub mod pool;
pub mod registry;
pub mod wire;

pub use arena::{ArenaError, BufferArena, Region};
pub use context::{AcceptContext, ConnectContext, OperationKind, ReceiveContext, SendContext};
pub use decoder::{DecodeError, Delivery, ReceiveToken, Step};
pub use encoder::{EncodeError, SendToken};
pub use endpoint::Endpoint;
pub use pool::{ContextPool, Lease, Reusable};
pub use registry::{ConnectionRegistry, RegistryError};
pub use wire::{MessageKind, Prefix, PrefixError, MAX_TEXT_LEN, PREFIX_SIZE};
