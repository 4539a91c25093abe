//! ssh-agent authentication
//!
//! The agent consulted is the one next to the bridge process, found through
//! `SSH_AUTH_SOCK` (or the OpenSSH named pipe on Windows), never the agent of
//! the person behind the WebSocket. Identities are offered in the order the
//! agent lists them; the first one the SSH server accepts wins.

use std::future::Future;

use russh::client::Handle;
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::ssh_key::{HashAlg, PublicKey};
use russh::{AgentAuthError, CryptoVec, Signer};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

type AgentConnection = AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>;

#[cfg(windows)]
const AGENT_PIPE: &str = r"\\.\pipe\openssh-ssh-agent";

/// Signs challenges through the agent.
///
/// The key is cloned into the returned future; holding the borrowed key
/// across the agent round trip would make authentication non-`Send`.
struct ChallengeSigner<'a> {
    agent: &'a mut AgentConnection,
}

impl Signer for ChallengeSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &PublicKey,
        hash_alg: Option<HashAlg>,
        challenge: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key = key.clone();
        async move {
            let signature = self.agent.sign_request(&key, hash_alg, challenge).await?;
            Ok(signature)
        }
    }
}

/// Agent connection used to authenticate one SSH target
pub struct AgentAuth {
    agent: AgentConnection,
    target: String,
}

impl AgentAuth {
    /// Reach the local agent on behalf of `target` (`user@host:port`)
    pub async fn open(target: impl Into<String>) -> Result<Self, SshError> {
        let target = target.into();
        debug!("Reaching ssh-agent for {}", target);

        let agent = connect_local_agent().await?;
        Ok(Self { agent, target })
    }

    /// Offer every agent identity to the server until one is accepted
    pub async fn authenticate(
        &mut self,
        handle: &mut Handle<ClientHandler>,
        username: &str,
    ) -> Result<(), SshError> {
        let identities = self.agent.request_identities().await.map_err(|e| {
            SshError::AgentError(format!("ssh-agent identity listing for {} failed: {}", self.target, e))
        })?;

        if identities.is_empty() {
            return Err(SshError::AgentError(format!(
                "ssh-agent holds no identities to offer {}",
                self.target
            )));
        }

        let mut signer = ChallengeSigner {
            agent: &mut self.agent,
        };
        let mut last_failure = None;

        for identity in &identities {
            let outcome = handle
                .authenticate_publickey_with(username, identity.clone(), None, &mut signer)
                .await;

            match outcome {
                Ok(result) if result.success() => {
                    info!("{} accepted agent identity {:?}", self.target, identity.comment());
                    return Ok(());
                }
                Ok(_) => debug!("{} refused agent identity {:?}", self.target, identity.comment()),
                Err(e) => {
                    warn!(
                        "Agent could not sign for {} with {:?}: {}",
                        self.target,
                        identity.comment(),
                        e
                    );
                    last_failure = Some(e.to_string());
                }
            }
        }

        Err(SshError::AuthenticationFailed(rejection_message(
            &self.target,
            identities.len(),
            last_failure.as_deref(),
        )))
    }
}

#[cfg(unix)]
async fn connect_local_agent() -> Result<AgentConnection, SshError> {
    AgentClient::connect_env()
        .await
        .map(AgentClient::dynamic)
        .map_err(|e| SshError::AgentNotAvailable(format!("no ssh-agent at SSH_AUTH_SOCK ({})", e)))
}

#[cfg(windows)]
async fn connect_local_agent() -> Result<AgentConnection, SshError> {
    AgentClient::connect_named_pipe(AGENT_PIPE)
        .await
        .map(AgentClient::dynamic)
        .map_err(|e| SshError::AgentNotAvailable(format!("no ssh-agent on {} ({})", AGENT_PIPE, e)))
}

#[cfg(not(any(unix, windows)))]
async fn connect_local_agent() -> Result<AgentConnection, SshError> {
    Err(SshError::AgentNotAvailable(
        "ssh-agent is not supported on this platform".to_string(),
    ))
}

fn rejection_message(target: &str, offered: usize, last_failure: Option<&str>) -> String {
    let mut message = format!("{} refused all {} ssh-agent identities", target, offered);
    if let Some(failure) = last_failure {
        message.push_str(&format!(" (last signing error: {})", failure));
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_without_agent_is_not_available() {
        match AgentAuth::open("root@example.com:22").await {
            Ok(auth) => assert_eq!(auth.target, "root@example.com:22"),
            Err(SshError::AgentNotAvailable(msg)) => assert!(msg.starts_with("no ssh-agent")),
            Err(e) => panic!("unexpected error: {:?}", e),
        }
    }

    #[test]
    fn test_rejection_message_names_target() {
        assert_eq!(
            rejection_message("root@example.com:22", 2, None),
            "root@example.com:22 refused all 2 ssh-agent identities"
        );
        assert_eq!(
            rejection_message("git@host:2222", 1, Some("agent refused to sign")),
            "git@host:2222 refused all 1 ssh-agent identities (last signing error: agent refused to sign)"
        );
    }
}
