//! Error types for Tunium

use thiserror::Error;

/// Main error type for Tunium
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Tunnel closed")]
    TunnelClosed,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Timeout")]
    Timeout,
}

/// Result type alias for Tunium
pub type Result<T> = std::result::Result<T, Error>;
