//! wssh - WebSocket to SSH bridge
//!
//! Lets a browser-hosted terminal drive a remote shell: a small JSON
//! framing protocol carried over a WebSocket is translated into SSH channel
//! I/O and back.

pub mod bridge;
pub mod ssh;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use bridge::{BridgeError, Session, SessionState};
pub use ssh::{AuthMethod, HostKeyPolicy, SshConfig, SshError};

/// Initialize logging
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
