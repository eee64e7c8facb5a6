pub mod crypto;
pub mod device;
pub mod framing;
pub mod session;
pub mod state;
pub mod transport;

pub use crypto::*;
pub use device::*;
pub use framing::*;
pub use session::*;
pub use state::*;
pub use transport::*;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out: {0}")]
    Timeout(&'static str),

    #[error("Malformed frame: {0}")]
    Format(String),

    #[error("Cipher error: {0}")]
    Crypto(String),

    #[error("Command not acknowledged: {0}")]
    Command(String),

    #[error("Session not synced: {0} requires a completed sync handshake")]
    NotSynced(&'static str),
}

impl From<hex::FromHexError> for ProtocolError {
    fn from(err: hex::FromHexError) -> Self {
        ProtocolError::Format(format!("invalid hex: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
