//! SSH Client implementation using russh

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::ssh_key::{Algorithm, HashAlg};
use russh::keys::PublicKey;
use russh::Disconnect;
use tracing::{debug, info, warn};

use super::agent::AgentAuth;
use super::config::{HostKeyPolicy, SshConfig};
use super::error::SshError;
use super::keys::ResolvedAuth;

/// Authenticated SSH connection
pub type SshTransport = Handle<ClientHandler>;

/// Opens authenticated SSH transports
pub struct SshClient {
    config: SshConfig,
}

impl SshClient {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// Connect and authenticate, bounded by the configured timeout
    pub async fn connect(self, auth: ResolvedAuth) -> Result<SshTransport, SshError> {
        let timeout = Duration::from_secs(self.config.timeout_secs);

        tokio::time::timeout(timeout, self.establish(auth))
            .await
            .map_err(|_| {
                SshError::Timeout(format!(
                    "connection to {}:{} timed out after {}s",
                    self.config.host, self.config.port, self.config.timeout_secs
                ))
            })?
    }

    async fn establish(&self, auth: ResolvedAuth) -> Result<SshTransport, SshError> {
        let socket_addr = resolve_host(&self.config.host, self.config.port).await?;

        info!(
            "Connecting to SSH server at {}:{} ({})",
            self.config.host, self.config.port, socket_addr
        );

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler::new(
            self.config.host.clone(),
            self.config.port,
            self.config.host_key_policy.clone(),
        );

        let mut handle = client::connect(Arc::new(ssh_config), socket_addr, handler)
            .await
            .map_err(|e| match e {
                SshError::ProtocolError(msg) => SshError::ConnectionFailed(msg),
                other => other,
            })?;

        debug!("SSH handshake completed, authenticating via {}", auth.kind());

        let username = self.config.username.as_str();
        let authenticated = match auth {
            ResolvedAuth::Password(password) => handle
                .authenticate_password(username, password)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
                .success(),
            ResolvedAuth::Key(key) => {
                let hash_alg = if matches!(key.algorithm(), Algorithm::Rsa { .. }) {
                    handle.best_supported_rsa_hash().await.ok().flatten().flatten()
                } else {
                    None
                };
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg);

                handle
                    .authenticate_publickey(username, key_with_hash)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
                    .success()
            }
            ResolvedAuth::Agent => {
                let target = format!("{}@{}:{}", username, self.config.host, self.config.port);
                let mut agent = AgentAuth::open(target).await?;
                agent.authenticate(&mut handle, username).await?;
                true
            }
        };

        if !authenticated {
            return Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            ));
        }

        info!(
            "SSH authentication successful for {}@{}",
            self.config.username, self.config.host
        );

        Ok(handle)
    }
}

/// Resolve `host:port` to the first socket address
pub async fn resolve_host(host: &str, port: u16) -> Result<SocketAddr, SshError> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| SshError::HostResolution {
            host: host.to_string(),
            reason: e.to_string(),
        })?;

    addrs.next().ok_or_else(|| SshError::HostResolution {
        host: host.to_string(),
        reason: "no addresses found".to_string(),
    })
}

/// Close an SSH transport, ignoring a peer that has already gone away
pub async fn disconnect(transport: &SshTransport) {
    if let Err(e) = transport
        .disconnect(Disconnect::ByApplication, "bridge closed", "en")
        .await
    {
        debug!("SSH disconnect: {}", e);
    }
}

/// Client handler for russh callbacks
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, policy: HostKeyPolicy) -> Self {
        Self { host, port, policy }
    }
}

fn fingerprint_matches(expected: &str, actual: &str) -> bool {
    let strip = |f: &str| f.trim().trim_start_matches("SHA256:").to_string();
    strip(expected) == strip(actual)
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();

        match &self.policy {
            HostKeyPolicy::AcceptAny => {
                warn!(
                    "Accepting unverified host key for {}:{} (fingerprint: {})",
                    self.host, self.port, fingerprint
                );
                Ok(true)
            }
            HostKeyPolicy::Fingerprints(allowed) => {
                if allowed.iter().any(|f| fingerprint_matches(f, &fingerprint)) {
                    info!("Host key verified for {}:{}", self.host, self.port);
                    Ok(true)
                } else {
                    warn!(
                        "Host key for {}:{} not in the allowed list (fingerprint: {})",
                        self.host, self.port, fingerprint
                    );
                    Err(SshError::HostKeyRejected(format!(
                        "{}:{} presented {}",
                        self.host, self.port, fingerprint
                    )))
                }
            }
        }
    }
}
