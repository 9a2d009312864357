//! Crate-level error types.

use std::error::Error as StdError;
use std::io;

use crate::frame::FrameError;

/// Crate-level error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A socket or file operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A configuration file could not be parsed.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// A configuration could not be serialized.
    #[error("config write error: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    /// A scene frame could not be encoded or decoded.
    #[error("frame codec error: {0}")]
    Frame(#[from] FrameError),

    /// A discovery session could not be started.
    #[error("discovery error: {0}")]
    Discovery(String),

    /// The service state machine refused a request in its current state.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// An error with context describing what operation failed.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// A simple error message.
    #[error("{0}")]
    Message(String),
}

impl Error {
    /// Create a simple message error.
    pub fn msg(msg: impl Into<String>) -> Self {
        Self::Message(msg.into())
    }

    /// Create an error with context wrapping another error.
    pub fn context(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Create a discovery start-up error.
    pub fn discovery(msg: impl Into<String>) -> Self {
        Self::Discovery(msg.into())
    }

    /// Create a rejected-request error.
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }
}

/// Crate-level result type.
pub type Result<T> = std::result::Result<T, Error>;
