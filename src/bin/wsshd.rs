//! wsshd - WebSocket to SSH bridge daemon

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use wssh::bridge::{serve, ServerConfig};
use wssh::HostKeyPolicy;

#[derive(Parser, Debug)]
#[command(name = "wsshd", version, about = "WebSocket to SSH bridge daemon")]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:5000")]
    listen: SocketAddr,

    /// Shared secret clients must pass as the `key` query parameter
    #[arg(long)]
    secret: Option<String>,

    /// SSH connection timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Default terminal type for PTYs
    #[arg(long, default_value = "xterm")]
    term: String,

    /// Only accept SSH servers presenting this host key fingerprint (repeatable)
    #[arg(long = "strict-host-key", value_name = "SHA256:...")]
    host_keys: Vec<String>,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        let host_key_policy = if self.host_keys.is_empty() {
            HostKeyPolicy::AcceptAny
        } else {
            HostKeyPolicy::Fingerprints(self.host_keys.clone())
        };

        ServerConfig {
            secret: self.secret.clone(),
            timeout_secs: self.timeout,
            term: self.term.clone(),
            host_key_policy,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    wssh::init_logging();

    let config = cli.server_config();
    if matches!(config.host_key_policy, HostKeyPolicy::AcceptAny) {
        warn!("Host keys are not verified; pass --strict-host-key to pin servers");
    }
    if config.secret.is_none() && !cli.listen.ip().is_loopback() {
        warn!("Listening on {} without --secret", cli.listen);
    }

    let listener = TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("failed to bind {}", cli.listen))?;

    info!(
        "wsshd {} accepting ws://{}/wssh/<hostname>/<username>",
        env!("CARGO_PKG_VERSION"),
        listener.local_addr()?
    );

    serve(listener, config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await
    .context("server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["wsshd"]).unwrap();
        assert_eq!(cli.listen, "127.0.0.1:5000".parse::<SocketAddr>().unwrap());

        let config = cli.server_config();
        assert!(config.secret.is_none());
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.term, "xterm");
        assert!(matches!(config.host_key_policy, HostKeyPolicy::AcceptAny));
    }

    #[test]
    fn test_strict_host_keys() {
        let cli = Cli::try_parse_from([
            "wsshd",
            "--secret",
            "s",
            "--strict-host-key",
            "SHA256:aaa",
            "--strict-host-key",
            "SHA256:bbb",
        ])
        .unwrap();

        let config = cli.server_config();
        assert_eq!(config.secret.as_deref(), Some("s"));
        match config.host_key_policy {
            HostKeyPolicy::Fingerprints(keys) => assert_eq!(keys, vec!["SHA256:aaa", "SHA256:bbb"]),
            other => panic!("unexpected policy: {:?}", other),
        }
    }
}
