//! Bridge session
//!
//! A [`Session`] ties one client WebSocket to one SSH transport. It is
//! created unopened, becomes connected after [`Session::open`], bridges one
//! shell or command channel at a time, and ends in the closed state.
//!
//! While bridging, two tasks run side by side:
//! - inbound: WebSocket frames -> channel writes and PTY resizes
//! - outbound: channel output -> `data` frames
//!
//! Whichever task stops first cancels the shared token and closes the
//! session; the other task is stopped at its current await point and its
//! abort handle is fired as a backstop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use russh::client::Msg;
use russh::Channel;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::BridgeError;
use super::protocol::{ClientFrame, OutputDecoder, ServerFrame};
use super::socket::{FrameSink, FrameSource};
use crate::ssh::{
    disconnect, open_exec, open_shell, spawn_channel_pump, ChannelCommand, ChannelIo, SshClient,
    SshConfig, SshTransport,
};

/// How long to wait for the channel task to finish after the bridge ends
const CHANNEL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unopened,
    Connected,
    Bridging,
    Closed,
}

pub struct Session<Tx: FrameSink, Rx: FrameSource> {
    id: String,
    sink: Arc<tokio::sync::Mutex<Tx>>,
    source: parking_lot::Mutex<Option<Rx>>,
    transport: parking_lot::Mutex<Option<Arc<SshTransport>>>,
    pty_size: parking_lot::Mutex<(u32, u32)>,
    tasks: parking_lot::Mutex<Vec<AbortHandle>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    error_sent: AtomicBool,
    state: parking_lot::Mutex<SessionState>,
}

impl<Tx: FrameSink, Rx: FrameSource> Session<Tx, Rx> {
    pub fn new(sink: Tx, source: Rx) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sink: Arc::new(tokio::sync::Mutex::new(sink)),
            source: parking_lot::Mutex::new(Some(source)),
            transport: parking_lot::Mutex::new(None),
            pty_size: parking_lot::Mutex::new((80, 24)),
            tasks: parking_lot::Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            error_sent: AtomicBool::new(false),
            state: parking_lot::Mutex::new(SessionState::Unopened),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    fn expect_state(&self, expected: SessionState) -> Result<(), BridgeError> {
        let actual = self.state();
        if actual == expected {
            Ok(())
        } else {
            Err(BridgeError::InvalidState { expected, actual })
        }
    }

    /// Establish the authenticated SSH transport.
    ///
    /// Credential problems are returned without touching the network or the
    /// WebSocket. Connection and authentication failures are reported to the
    /// client as a single `error` frame before being returned; closing the
    /// WebSocket afterwards is up to the caller.
    pub async fn open(&self, config: &SshConfig) -> Result<(), BridgeError> {
        self.expect_state(SessionState::Unopened)?;

        let auth = config.auth.resolve()?;

        info!(
            "Opening session {} to {}@{}:{}",
            self.id, config.username, config.host, config.port
        );

        let transport = match SshClient::new(config.clone()).connect(auth).await {
            Ok(transport) => transport,
            Err(e) => {
                error!("Session {} failed to connect: {}", self.id, e);
                self.notify_error(&e.to_string()).await;
                return Err(e.into());
            }
        };

        if self.is_closed() {
            disconnect(&transport).await;
            return Err(BridgeError::InvalidState {
                expected: SessionState::Unopened,
                actual: SessionState::Closed,
            });
        }

        *self.transport.lock() = Some(Arc::new(transport));
        *self.pty_size.lock() = (config.cols, config.rows);
        self.set_state(SessionState::Connected);
        info!("Session {} connected", self.id);
        Ok(())
    }

    /// Bridge an interactive login shell
    pub async fn shell(&self, term: &str) -> Result<(), BridgeError> {
        let transport = self.connected_transport()?;
        let (cols, rows) = *self.pty_size.lock();

        let channel = open_shell(&transport, term, cols, rows).await?;
        self.run_channel(channel).await
    }

    /// Bridge a single remote command; ends when the command exits
    pub async fn execute(&self, command: &str, term: &str) -> Result<(), BridgeError> {
        let transport = self.connected_transport()?;
        let (cols, rows) = *self.pty_size.lock();

        debug!("Session {} executing {:?}", self.id, command);
        let channel = open_exec(&transport, command, term, cols, rows).await?;
        self.run_channel(channel).await
    }

    fn connected_transport(&self) -> Result<Arc<SshTransport>, BridgeError> {
        self.expect_state(SessionState::Connected)?;
        self.transport
            .lock()
            .clone()
            .ok_or(BridgeError::InvalidState {
                expected: SessionState::Connected,
                actual: SessionState::Closed,
            })
    }

    async fn run_channel(&self, channel: Channel<Msg>) -> Result<(), BridgeError> {
        let (io, mut pump) = spawn_channel_pump(channel, self.id.clone());
        let control = io.input.clone();

        let result = self.bridge(io).await;

        // The channel is closed no matter which side ended the bridge
        let _ = control.send(ChannelCommand::Close).await;
        drop(control);
        match tokio::time::timeout(CHANNEL_SHUTDOWN_TIMEOUT, &mut pump).await {
            Ok(Err(e)) if !e.is_cancelled() => warn!("Channel task for session {} failed: {}", self.id, e),
            Ok(_) => {}
            Err(_) => {
                warn!("Channel task for session {} did not stop, aborting", self.id);
                pump.abort();
            }
        }

        result
    }

    /// Forward frames between the WebSocket and `io` until either side stops.
    ///
    /// Returns once both forwarding tasks have finished and the session has
    /// been closed. A clean stop on either side (peer close, remote EOF,
    /// external [`close`](Self::close)) is `Ok`.
    pub async fn bridge(&self, io: ChannelIo) -> Result<(), BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::InvalidState {
                expected: SessionState::Connected,
                actual: SessionState::Closed,
            });
        }
        let source = self.source.lock().take().ok_or(BridgeError::InvalidState {
            expected: SessionState::Connected,
            actual: SessionState::Bridging,
        })?;
        self.set_state(SessionState::Bridging);

        let ChannelIo { input, output } = io;
        let inbound = tokio::spawn(forward_inbound(
            self.id.clone(),
            source,
            input,
            self.shutdown.clone(),
        ));
        let outbound = tokio::spawn(forward_outbound(
            self.id.clone(),
            output,
            self.sink.clone(),
            self.shutdown.clone(),
        ));
        {
            let mut tasks = self.tasks.lock();
            tasks.push(inbound.abort_handle());
            tasks.push(outbound.abort_handle());
        }

        info!("Bridge started for session {}", self.id);

        let (inbound_result, outbound_result) = tokio::join!(inbound, outbound);
        self.close().await;

        info!("Bridge stopped for session {}", self.id);

        let inbound_result = task_result(inbound_result);
        let outbound_result = task_result(outbound_result);
        if let Err(e) = &inbound_result {
            warn!("Inbound forwarding for session {} failed: {}", self.id, e);
        }
        if let Err(e) = &outbound_result {
            warn!("Outbound forwarding for session {} failed: {}", self.id, e);
        }
        inbound_result.and(outbound_result)
    }

    /// Stop forwarding and release the SSH transport. Safe to call any
    /// number of times from any task; only the first call does work.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Session {} already closed", self.id);
            return;
        }

        info!("Closing session {}", self.id);
        self.shutdown.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let transport = self.transport.lock().take();
        if let Some(transport) = transport {
            disconnect(&transport).await;
        }

        self.set_state(SessionState::Closed);
    }

    /// Close the client WebSocket
    pub async fn close_websocket(&self) {
        if let Err(e) = self.sink.lock().await.close().await {
            debug!("WebSocket close for session {}: {}", self.id, e);
        }
    }

    async fn notify_error(&self, message: &str) {
        if self.error_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        let frame = ServerFrame::Error(message.to_string()).encode();
        if let Err(e) = self.sink.lock().await.send_text(frame).await {
            warn!("Failed to send error frame for session {}: {}", self.id, e);
        }
    }
}

fn task_result(joined: Result<Result<(), BridgeError>, JoinError>) -> Result<(), BridgeError> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(BridgeError::Protocol(format!("forwarding task panicked: {}", e))),
    }
}

async fn forward_inbound<Rx: FrameSource>(
    session_id: String,
    mut source: Rx,
    input: mpsc::Sender<ChannelCommand>,
    shutdown: CancellationToken,
) -> Result<(), BridgeError> {
    let result = tokio::select! {
        biased;
        _ = shutdown.cancelled() => Ok(()),
        result = inbound_loop(&session_id, &mut source, &input) => result,
    };
    shutdown.cancel();
    debug!("WS -> SSH forwarding stopped for session {}", session_id);

    match result {
        Err(BridgeError::ChannelClosed) => Ok(()),
        other => other,
    }
}

async fn inbound_loop<Rx: FrameSource>(
    session_id: &str,
    source: &mut Rx,
    input: &mpsc::Sender<ChannelCommand>,
) -> Result<(), BridgeError> {
    loop {
        let text = match source.recv_text().await? {
            Some(text) if !text.is_empty() => text,
            _ => {
                info!("WebSocket closed by client for session {}", session_id);
                return Ok(());
            }
        };

        let frame = ClientFrame::parse(&text)?;

        if let Some(resize) = frame.resize {
            debug!(
                "Resize {}x{} for session {}",
                resize.width, resize.height, session_id
            );
            input
                .send(ChannelCommand::Resize {
                    cols: resize.width,
                    rows: resize.height,
                })
                .await
                .map_err(|_| BridgeError::ChannelClosed)?;
        }

        if let Some(data) = frame.data {
            input
                .send(ChannelCommand::Data(Bytes::from(data)))
                .await
                .map_err(|_| BridgeError::ChannelClosed)?;
        }
    }
}

async fn forward_outbound<Tx: FrameSink>(
    session_id: String,
    mut output: mpsc::Receiver<Bytes>,
    sink: Arc<tokio::sync::Mutex<Tx>>,
    shutdown: CancellationToken,
) -> Result<(), BridgeError> {
    let result = tokio::select! {
        biased;
        _ = shutdown.cancelled() => Ok(()),
        result = outbound_loop(&session_id, &mut output, &sink) => result,
    };
    shutdown.cancel();
    debug!("SSH -> WS forwarding stopped for session {}", session_id);
    result
}

async fn outbound_loop<Tx: FrameSink>(
    session_id: &str,
    output: &mut mpsc::Receiver<Bytes>,
    sink: &tokio::sync::Mutex<Tx>,
) -> Result<(), BridgeError> {
    let mut decoder = OutputDecoder::new();

    while let Some(chunk) = output.recv().await {
        if chunk.is_empty() {
            break;
        }
        let text = decoder.decode(&chunk);
        if text.is_empty() {
            continue;
        }
        sink.lock()
            .await
            .send_text(ServerFrame::Data(text).encode())
            .await?;
    }

    let tail = decoder.finish();
    if !tail.is_empty() {
        sink.lock()
            .await
            .send_text(ServerFrame::Data(tail).encode())
            .await?;
    }

    info!("SSH output ended for session {}", session_id);
    Ok(())
}
