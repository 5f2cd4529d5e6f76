use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by the client, cache and orchestrator.
#[derive(Debug, Error)]
pub enum Error {
    /// The server answered, but not with a success status.
    #[error("{operation} failed: {status} {text}")]
    Transport {
        operation: &'static str,
        status: StatusCode,
        text: String,
    },
    /// The request could not be sent or its response could not be read.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("server at {server} still unreachable after {attempts} attempts")]
    Unreachable { server: String, attempts: u32 },
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("unexpected payload: {0}")]
    Decode(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Server(#[from] warp::Error),
}

impl Error {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Transport { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True when the request never got an answer from the server.
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_))
    }
}
