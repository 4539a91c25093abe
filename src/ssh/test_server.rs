//! In-process SSH server for tests
//!
//! Accepts the password [`TEST_PASSWORD`] or any public key, grants PTY
//! session channels and reports every channel request as a [`ServerEvent`].
//! Shell input is echoed back. `exec` of `echo <text>` replies with
//! `<text>\r\n`, exit status 0, EOF and close; other commands just close.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::keys::PublicKey;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::debug;

pub const TEST_PASSWORD: &str = "hunter2";

const HOST_KEY: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/id_ed25519"));

/// Channel activity observed by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Pty { term: String, cols: u32, rows: u32 },
    Shell,
    Exec(String),
    WindowChange { cols: u32, rows: u32 },
    Data(Vec<u8>),
    Eof,
    Close,
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub events: mpsc::UnboundedReceiver<ServerEvent>,
}

impl TestServer {
    /// Wait for the next event matching `wanted`, skipping the rest
    pub async fn wait_for(&mut self, wanted: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
        let next = async {
            loop {
                match self.events.recv().await {
                    Some(event) if wanted(&event) => return event,
                    Some(_) => continue,
                    None => panic!("test server stopped"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), next)
            .await
            .expect("timed out waiting for server event")
    }
}

/// Listen on an ephemeral loopback port and serve until the test ends
pub async fn start() -> TestServer {
    let host_key = russh::keys::decode_secret_key(HOST_KEY, None).expect("fixture host key");
    let config = Arc::new(russh::server::Config {
        auth_rejection_time: Duration::from_millis(10),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keys: vec![host_key],
        ..Default::default()
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test server");
    let addr = listener.local_addr().expect("test server address");
    let (events_tx, events) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = EventRecorder {
                events: events_tx.clone(),
            };
            let config = config.clone();
            tokio::spawn(async move {
                match russh::server::run_stream(config, stream, handler).await {
                    Ok(session) => {
                        if let Err(e) = session.await {
                            debug!("Test server session ended: {}", e);
                        }
                    }
                    Err(e) => debug!("Test server handshake failed: {}", e),
                }
            });
        }
    });

    TestServer { addr, events }
}

struct EventRecorder {
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl EventRecorder {
    fn record(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }
}

impl Handler for EventRecorder {
    type Error = russh::Error;

    async fn auth_password(&mut self, _user: &str, password: &str) -> Result<Auth, Self::Error> {
        if password == TEST_PASSWORD {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn auth_publickey(&mut self, _user: &str, _key: &PublicKey) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        _channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.record(ServerEvent::Pty {
            term: term.to_string(),
            cols: col_width,
            rows: row_height,
        });
        Ok(())
    }

    async fn shell_request(&mut self, _channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        self.record(ServerEvent::Shell);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).to_string();
        self.record(ServerEvent::Exec(command.clone()));

        let reply = command.strip_prefix("echo ").map(|text| format!("{}\r\n", text));
        let handle = session.handle();
        tokio::spawn(async move {
            if let Some(reply) = reply {
                let _ = handle.data(channel, CryptoVec::from_slice(reply.as_bytes())).await;
            }
            let _ = handle.exit_status_request(channel, 0).await;
            let _ = handle.eof(channel).await;
            let _ = handle.close(channel).await;
        });
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        _channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.record(ServerEvent::WindowChange {
            cols: col_width,
            rows: row_height,
        });
        Ok(())
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
        self.record(ServerEvent::Data(data.to_vec()));
        let _ = session.data(channel, CryptoVec::from_slice(data));
        Ok(())
    }

    async fn channel_eof(&mut self, _channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        self.record(ServerEvent::Eof);
        Ok(())
    }

    async fn channel_close(&mut self, _channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        self.record(ServerEvent::Close);
        Ok(())
    }
}
