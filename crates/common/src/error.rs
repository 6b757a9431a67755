// Error types for Shadowlink

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed share link: {0}")]
    Link(String),

    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Local port {port} is already in use")]
    PortInUse { port: u16 },

    #[error("Bridge error: {0}")]
    Bridge(String),

    #[error("Clipboard error: {0}")]
    Clipboard(String),

    #[error("QR encoding error: {0}")]
    Qr(String),

    #[error("Operation canceled by a newer request")]
    Canceled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors that should surface as the dedicated
    /// port-conflict service code rather than a generic failure.
    pub fn is_port_conflict(&self) -> bool {
        matches!(self, Error::PortInUse { .. })
    }
}
