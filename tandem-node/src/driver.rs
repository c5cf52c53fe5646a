//! Line-oriented stdin driver for the daemon.
//!
//! ```text
//! connect <ip:port>
//! disconnect <ip:port>
//! text <ip:port> <message...>
//! file <ip:port> <path>
//! quit
//! ```

use std::path::PathBuf;

use tandem_core::Endpoint;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{info, warn};

use crate::engine::Engine;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect(Endpoint),
    Disconnect(Endpoint),
    Text(Endpoint, String),
    File(Endpoint, PathBuf),
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unknown command {0:?}")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("bad endpoint {0:?}")]
    Endpoint(String),
}

fn endpoint(s: Option<&str>, usage: &'static str) -> Result<Endpoint, ParseError> {
    let s = s.ok_or(ParseError::Usage(usage))?;
    s.parse().map_err(|_| ParseError::Endpoint(s.to_string()))
}

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<Command>, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (verb, rest) = line
        .split_once(char::is_whitespace)
        .map_or((line, ""), |(v, r)| (v, r.trim_start()));
    let (target, tail) = rest
        .split_once(char::is_whitespace)
        .map_or((rest, ""), |(t, r)| (t, r.trim_start()));
    let target = (!target.is_empty()).then_some(target);

    let cmd = match verb {
        "connect" => Command::Connect(endpoint(target, "connect <ip:port>")?),
        "disconnect" => Command::Disconnect(endpoint(target, "disconnect <ip:port>")?),
        "text" => {
            const USAGE: &str = "text <ip:port> <message>";
            let ep = endpoint(target, USAGE)?;
            if tail.is_empty() {
                return Err(ParseError::Usage(USAGE));
            }
            Command::Text(ep, tail.to_string())
        }
        "file" => {
            const USAGE: &str = "file <ip:port> <path>";
            let ep = endpoint(target, USAGE)?;
            if tail.is_empty() {
                return Err(ParseError::Usage(USAGE));
            }
            Command::File(ep, PathBuf::from(tail))
        }
        "quit" | "exit" => Command::Quit,
        other => return Err(ParseError::Unknown(other.to_string())),
    };
    Ok(Some(cmd))
}

/// Read commands from `input` until `quit` or end of input.
pub async fn run<R: AsyncBufRead + Unpin>(engine: &Engine, input: R) -> anyhow::Result<()> {
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let cmd = match parse_command(&line) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => continue,
            Err(e) => {
                warn!("{e}");
                continue;
            }
        };
        let result = match cmd {
            Command::Quit => break,
            Command::Connect(ep) => engine.connect(ep).await.map(drop),
            Command::Disconnect(ep) => engine.disconnect(ep).await,
            Command::Text(ep, text) => engine.send_text(ep, text),
            Command::File(ep, path) => engine.send_file(ep, path),
        };
        if let Err(e) = result {
            warn!("{e}");
        }
    }
    info!("command input closed");
    Ok(())
}
