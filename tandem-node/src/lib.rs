//! Tandem node: tokio socket engine over tandem-core.

pub mod collaborator;
pub mod config;
mod connection;
pub mod driver;
pub mod engine;

pub use collaborator::{Collaborator, LogCollaborator};
pub use config::NodeConfig;
pub use engine::{ConnectOutcome, Engine, EngineError, EngineStats};
