use thiserror::Error;

use crate::codec::FrameError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid session: {0}")]
    InvalidSession(String),

    #[error("Signature error: {0}")]
    Signature(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connect timed out after {0}s")]
    ConnectTimeout(u64),

    #[error("Entry rejected: {0}")]
    EntryRejected(String),

    #[error("Gave up after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Live stream ended")]
    StreamEnded,

    #[error("Client is already running")]
    AlreadyRunning,

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
