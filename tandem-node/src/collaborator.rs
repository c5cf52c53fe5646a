//! Callbacks from the engine to whatever front end drives it.

use tandem_core::{Delivery, Endpoint};

/// The engine's view of its front end. Called from worker tasks, possibly concurrently.
pub trait Collaborator: Send + Sync + 'static {
    /// Log-style status line.
    fn notify(&self, message: &str);

    /// Outbound connect completed.
    fn on_connected(&self, endpoint: Endpoint);

    /// Connection gone, for any reason.
    fn on_disconnected(&self, endpoint: Endpoint);

    /// File send progress; `fraction` is in `[0, 1]`.
    fn on_progress(&self, endpoint: Endpoint, label: &str, fraction: f64);

    /// A complete message arrived. Defaults to a status line.
    fn on_received(&self, endpoint: Endpoint, delivery: &Delivery) {
        match delivery {
            Delivery::Text(text) => self.notify(&format!("{endpoint}: {text}")),
            Delivery::File { name, path, len } => self.notify(&format!(
                "{endpoint}: received file {name} ({len} bytes) at {}",
                path.display()
            )),
        }
    }
}

/// Collaborator that writes every callback to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCollaborator;

impl Collaborator for LogCollaborator {
    fn notify(&self, message: &str) {
        tracing::info!("{message}");
    }

    fn on_connected(&self, endpoint: Endpoint) {
        tracing::info!(%endpoint, "connected");
    }

    fn on_disconnected(&self, endpoint: Endpoint) {
        tracing::info!(%endpoint, "disconnected");
    }

    fn on_progress(&self, endpoint: Endpoint, label: &str, fraction: f64) {
        tracing::debug!(%endpoint, label, percent = fraction * 100.0, "sending");
    }
}
