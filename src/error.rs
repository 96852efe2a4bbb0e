use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Callback registration failed: {0}")]
    Registration(String),

    #[error("Remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse config file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Controller channel closed")]
    ChannelClosed,
}

impl Error {
    /// Remote-side failures: expected while the worker restarts, never
    /// surfaced past the connection layer. A link that produced one is no
    /// longer trusted.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Transport(_) | Error::Timeout(_) | Error::ChannelClosed
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
