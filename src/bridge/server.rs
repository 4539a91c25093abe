//! WebSocket server for the SSH bridge
//!
//! Accepts upgrades on `/wssh/<hostname>/<username>`. Connection parameters
//! come from the query string:
//!
//! | param            | meaning                                        |
//! |------------------|------------------------------------------------|
//! | `port`           | SSH port (default 22)                          |
//! | `password`       | password authentication                        |
//! | `private_key`    | key material for key authentication            |
//! | `key_passphrase` | passphrase for an encrypted `private_key`      |
//! | `allow_agent`    | `1`/`true`: authenticate through ssh-agent     |
//! | `run`            | run this command instead of a login shell      |
//! | `term`           | terminal type for the PTY                      |
//! | `key`            | shared secret, required when one is configured |
//!
//! Requests that cannot name a usable connection are refused during the
//! HTTP upgrade, before any SSH traffic.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::StreamExt;
use subtle::ConstantTimeEq;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};
use tracing::{debug, error, info, warn};

use super::error::BridgeError;
use super::session::Session;
use crate::ssh::{AuthMethod, HostKeyPolicy, SshConfig};

/// Route prefix for bridge connections
pub const ROUTE_PREFIX: &str = "/wssh/";

/// Daemon-wide settings applied to every connection
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Shared secret expected in the `key` query parameter
    pub secret: Option<String>,
    /// SSH connection timeout in seconds
    pub timeout_secs: u64,
    /// Terminal type used when the request doesn't name one
    pub term: String,
    pub host_key_policy: HostKeyPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            secret: None,
            timeout_secs: 30,
            term: "xterm".to_string(),
            host_key_policy: HostKeyPolicy::default(),
        }
    }
}

/// Why an upgrade request was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("Not found")]
    NotFound,
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl RouteError {
    pub fn status(&self) -> StatusCode {
        match self {
            RouteError::NotFound => StatusCode::NOT_FOUND,
            RouteError::Unauthorized => StatusCode::UNAUTHORIZED,
            RouteError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn into_response(self) -> ErrorResponse {
        let mut response = ErrorResponse::new(Some(self.to_string()));
        *response.status_mut() = self.status();
        response
    }
}

/// A parsed `/wssh/<hostname>/<username>` request
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub host: String,
    pub username: String,
    pub port: u16,
    pub auth: AuthMethod,
    pub command: Option<String>,
    pub term: Option<String>,
}

impl ConnectRequest {
    pub fn from_uri(uri: &Uri, secret: Option<&str>) -> Result<Self, RouteError> {
        let url = url::Url::parse("ws://localhost")
            .and_then(|base| base.join(&uri.to_string()))
            .map_err(|e| RouteError::BadRequest(e.to_string()))?;

        let rest = url
            .path()
            .strip_prefix(ROUTE_PREFIX)
            .ok_or(RouteError::NotFound)?;
        let mut segments = rest.split('/');
        let (host, username) = match (segments.next(), segments.next(), segments.next()) {
            (Some(host), Some(username), None) if !host.is_empty() && !username.is_empty() => {
                (host.to_string(), username.to_string())
            }
            _ => return Err(RouteError::NotFound),
        };

        let mut port = None;
        let mut password = None;
        let mut private_key = None;
        let mut passphrase = None;
        let mut allow_agent = false;
        let mut command = None;
        let mut term = None;
        let mut key = None;

        for (name, value) in url.query_pairs() {
            let value = value.into_owned();
            match name.as_ref() {
                "port" => port = Some(value),
                "password" => password = Some(value),
                "private_key" => private_key = Some(value),
                "key_passphrase" => passphrase = Some(value),
                "allow_agent" => allow_agent = matches!(value.as_str(), "1" | "true" | "yes"),
                "run" => command = Some(value).filter(|c| !c.is_empty()),
                "term" => term = Some(value).filter(|t| !t.is_empty()),
                "key" => key = Some(value),
                other => debug!("Ignoring unknown query parameter {}", other),
            }
        }

        if let Some(secret) = secret {
            let given = key.unwrap_or_default();
            if !bool::from(given.as_bytes().ct_eq(secret.as_bytes())) {
                return Err(RouteError::Unauthorized);
            }
        }

        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| RouteError::BadRequest(format!("invalid port: {}", p)))?,
            None => 22,
        };

        let auth = AuthMethod::from_parts(password, private_key, passphrase, allow_agent)
            .map_err(|e| RouteError::BadRequest(e.to_string()))?;

        Ok(Self {
            host,
            username,
            port,
            auth,
            command,
            term,
        })
    }

    fn ssh_config(&self, config: &ServerConfig) -> SshConfig {
        let mut ssh = SshConfig::new(&self.host, &self.username, self.auth.clone())
            .with_port(self.port)
            .with_timeout(config.timeout_secs);
        ssh.term = self.term.clone().unwrap_or_else(|| config.term.clone());
        ssh.host_key_policy = config.host_key_policy.clone();
        ssh
    }
}

/// Accept connections on `listener` until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, config: ServerConfig, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()>,
{
    let config = Arc::new(config);
    tokio::pin!(shutdown);

    info!("WebSocket bridge listening on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("WebSocket bridge shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                };
                // Disable Nagle's algorithm for low-latency interactive terminal
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY: {}", e);
                }
                let config = config.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, addr, config).await {
                        warn!("Connection from {} ended with error: {}", addr, e);
                    }
                });
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    config: Arc<ServerConfig>,
) -> Result<(), BridgeError> {
    let mut request = None;
    let ws = accept_hdr_async(stream, |req: &Request, response: Response| {
        match ConnectRequest::from_uri(req.uri(), config.secret.as_deref()) {
            Ok(parsed) => {
                request = Some(parsed);
                Ok(response)
            }
            Err(e) => {
                warn!("Refusing upgrade from {}: {}", addr, e);
                Err(e.into_response())
            }
        }
    })
    .await?;

    let request = request.ok_or_else(|| BridgeError::Protocol("upgrade without request".to_string()))?;
    let ssh_config = request.ssh_config(&config);

    let (sink, source) = ws.split();
    let session = Session::new(sink, source);
    info!(
        "WebSocket connection from {} for {}@{}:{} (session {})",
        addr,
        request.username,
        request.host,
        request.port,
        session.id()
    );

    if let Err(e) = session.open(&ssh_config).await {
        session.close_websocket().await;
        return Err(e);
    }

    let result = match &request.command {
        Some(command) => session.execute(command, &ssh_config.term).await,
        None => session.shell(&ssh_config.term).await,
    };

    session.close().await;
    session.close_websocket().await;
    info!("Session {} finished", session.id());
    result
}
