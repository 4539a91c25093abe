//! Bridge error types

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use super::session::SessionState;
use crate::ssh::{KeyError, SshError};

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("SSH channel closed")]
    ChannelClosed,

    #[error("Session is {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },
}

impl From<tungstenite::Error> for BridgeError {
    fn from(err: tungstenite::Error) -> Self {
        BridgeError::WebSocket(err.to_string())
    }
}
