//! Error types for the engine communication layer

use thiserror::Error;

use crate::locator::EngineAddress;

/// Errors raised while establishing or using an engine session
#[derive(Error, Debug)]
pub enum EngineError {
    /// The local OSC endpoint could not be bound
    #[error("failed to bind OSC endpoint on {host}:{}: {source}", display_port(.port))]
    Bind {
        host: String,
        port: Option<u16>,
        #[source]
        source: std::io::Error,
    },

    /// No engine answered the handshake
    #[error("no engine found at {target}{}", spawn_suffix(.spawn_attempted))]
    NoEngine {
        target: EngineAddress,
        spawn_attempted: bool,
    },

    /// The destination could not be resolved to a socket address
    #[error("invalid engine address {0}")]
    InvalidAddress(String),

    /// A message could not be built or written to the socket
    #[error("failed to send {path}: {reason}")]
    Send { path: String, reason: String },

    /// The transport was stopped while a handshake was pending
    #[error("transport stopped during handshake")]
    Cancelled,
}

fn display_port(port: &Option<u16>) -> String {
    port.map_or_else(|| "any port".to_string(), |p| p.to_string())
}

fn spawn_suffix(spawn_attempted: &bool) -> &'static str {
    if *spawn_attempted {
        " (even after spawning a local engine)"
    } else {
        ""
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
