//! SSH Error types

use thiserror::Error;

use super::keys::KeyError;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Could not resolve hostname {host}: {reason}")]
    HostResolution { host: String, reason: String },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Host key rejected: {0}")]
    HostKeyRejected(String),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("SSH Agent not available: {0}")]
    AgentNotAvailable(String),

    #[error("SSH Agent error: {0}")]
    AgentError(String),
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}
