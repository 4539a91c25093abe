//! SSH module - credentials, connections and channels
//!
//! This module provides the SSH side of the bridge using the russh library.
//!
//! # Features
//! - Password, raw private key and ssh-agent authentication
//! - Ordered key-algorithm fallback for key material of unknown type
//! - Configurable host key policy (trust-on-first-use by default)
//! - PTY-backed shell and exec channels driven by a single owner task

mod agent;
mod channel;
mod client;
mod config;
mod error;
pub mod keys;
#[cfg(test)]
pub(crate) mod test_server;

pub use agent::AgentAuth;
pub use channel::{
    open_exec, open_shell, spawn_channel_pump, ChannelCommand, ChannelIo, CHUNK_SIZE,
};
pub use client::{disconnect, resolve_host, ClientHandler, SshClient, SshTransport};
pub use config::{AuthMethod, HostKeyPolicy, SshConfig};
pub use error::SshError;
pub use keys::{resolve_private_key, KeyError, ResolvedAuth};
