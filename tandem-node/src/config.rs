//! Load config from file and environment.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Node configuration. File: ~/.config/tandem/config.toml or /etc/tandem/config.toml.
/// Env overrides: TANDEM_PORT, TANDEM_BUFFER_SIZE, TANDEM_BACKLOG, TANDEM_DOWNLOAD_DIR,
/// TANDEM_IDLE_TIMEOUT_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Listen address (default 0.0.0.0).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: IpAddr,
    /// Listen port (default 45680). 0 picks an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bytes per send/receive operation; one arena region each (default 64 KiB).
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Listen backlog depth (default 128).
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Concurrent accept operations (default 4).
    #[serde(default = "default_max_accepts")]
    pub max_accepts: usize,
    /// Concurrent outbound connects (default 16).
    #[serde(default = "default_max_connects")]
    pub max_connects: usize,
    /// Preallocated send contexts (default 64).
    #[serde(default = "default_max_sends")]
    pub max_sends: usize,
    /// Preallocated receive contexts (default 64).
    #[serde(default = "default_max_receives")]
    pub max_receives: usize,
    /// Where received files are written (default: working directory).
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Tear down connections idle this long on the receive side. Unset: never.
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
}

fn default_listen_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_port() -> u16 {
    45680
}
fn default_buffer_size() -> usize {
    64 * 1024
}
fn default_backlog() -> u32 {
    128
}
fn default_max_accepts() -> usize {
    4
}
fn default_max_connects() -> usize {
    16
}
fn default_max_sends() -> usize {
    64
}
fn default_max_receives() -> usize {
    64
}
fn default_download_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            port: default_port(),
            buffer_size: default_buffer_size(),
            backlog: default_backlog(),
            max_accepts: default_max_accepts(),
            max_connects: default_max_connects(),
            max_sends: default_max_sends(),
            max_receives: default_max_receives(),
            download_dir: default_download_dir(),
            idle_timeout_secs: None,
        }
    }
}

impl NodeConfig {
    pub fn listen_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.port)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.buffer_size == 0 {
            return Err("buffer_size must be non-zero".into());
        }
        if self.max_accepts == 0 {
            return Err("max_accepts must be non-zero".into());
        }
        if self.max_connects == 0 || self.max_sends == 0 || self.max_receives == 0 {
            return Err("max_connects, max_sends and max_receives must be non-zero".into());
        }
        if self.idle_timeout_secs == Some(0) {
            return Err("idle_timeout_secs must be non-zero when set".into());
        }
        Ok(())
    }

    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Apply TANDEM_* environment overrides. Unparseable values are ignored.
    pub fn apply_env(&mut self) {
        if let Ok(s) = std::env::var("TANDEM_PORT") {
            if let Ok(p) = s.parse::<u16>() {
                self.port = p;
            }
        }
        if let Ok(s) = std::env::var("TANDEM_BUFFER_SIZE") {
            if let Ok(n) = s.parse::<usize>() {
                self.buffer_size = n;
            }
        }
        if let Ok(s) = std::env::var("TANDEM_BACKLOG") {
            if let Ok(n) = s.parse::<u32>() {
                self.backlog = n;
            }
        }
        if let Some(dir) = std::env::var_os("TANDEM_DOWNLOAD_DIR") {
            self.download_dir = PathBuf::from(dir);
        }
        if let Ok(s) = std::env::var("TANDEM_IDLE_TIMEOUT_SECS") {
            if let Ok(n) = s.parse::<u64>() {
                self.idle_timeout_secs = Some(n);
            }
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> NodeConfig {
    let mut c = load_file().unwrap_or_default();
    c.apply_env();
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/tandem/config.toml"));
    }
    out.push(PathBuf::from("/etc/tandem/config.toml"));
    out
}

fn load_file() -> Option<NodeConfig> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match load_path(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable config file");
            None
        }
    }
}

/// Read one config file.
pub fn load_path(path: &Path) -> anyhow::Result<NodeConfig> {
    use anyhow::Context;
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let c = NodeConfig::from_toml_str(&s).with_context(|| format!("parsing {}", path.display()))?;
    Ok(c)
}
