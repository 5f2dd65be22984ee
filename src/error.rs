//! Error types for oppnet

use thiserror::Error;

/// Main error type for oppnet
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The envelope header could not be delimited or parsed
    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    /// Opening, reading or writing a payload file failed
    #[error("Payload I/O error: {0}")]
    PayloadIo(String),

    #[error("Payload hash mismatch")]
    HashMismatch,

    /// No usable interface or protocol instance for a send
    #[error("No route: {0}")]
    NoRoute(String),

    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,
}

impl Error {
    /// Wrap an I/O error raised while touching a payload file
    pub fn payload(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        Error::PayloadIo(format!("{}: {}", context, err))
    }
}

/// Result type alias for oppnet
pub type Result<T> = std::result::Result<T, Error>;
