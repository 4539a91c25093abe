//! SSH channel pump
//!
//! One task owns the russh `Channel` and serializes every operation on it.
//! The bridge talks to that task through two queues:
//! - `ChannelIo::input` carries writes, PTY resizes and the close request
//! - `ChannelIo::output` yields remote output in chunks of at most
//!   [`CHUNK_SIZE`] bytes and ends (`None`) at SSH-side EOF

use bytes::Bytes;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::client::SshTransport;
use super::error::SshError;

/// Largest output chunk forwarded in a single read
pub const CHUNK_SIZE: usize = 1024;

const INPUT_CAPACITY: usize = 256;
const OUTPUT_CAPACITY: usize = 256;

/// Commands that can be sent to the channel task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCommand {
    /// Bytes for the remote stdin
    Data(Bytes),
    /// Change the PTY size
    Resize { cols: u32, rows: u32 },
    /// Send EOF and close the channel
    Close,
}

/// Duplex byte stream for one shell or command invocation
pub struct ChannelIo {
    pub input: mpsc::Sender<ChannelCommand>,
    pub output: mpsc::Receiver<Bytes>,
}

impl ChannelIo {
    /// Create an unattached channel, returning the far ends of both queues
    pub fn pair() -> (Self, mpsc::Receiver<ChannelCommand>, mpsc::Sender<Bytes>) {
        let (input, input_rx) = mpsc::channel(INPUT_CAPACITY);
        let (output_tx, output) = mpsc::channel(OUTPUT_CAPACITY);
        (Self { input, output }, input_rx, output_tx)
    }
}

/// Open a session channel with a PTY and start an interactive shell
pub async fn open_shell(
    transport: &SshTransport,
    term: &str,
    cols: u32,
    rows: u32,
) -> Result<Channel<Msg>, SshError> {
    let channel = open_pty_channel(transport, term, cols, rows).await?;

    channel
        .request_shell(false)
        .await
        .map_err(|e| SshError::ChannelError(format!("Shell request failed: {}", e)))?;

    info!("Interactive shell started ({})", term);
    Ok(channel)
}

/// Open a session channel with a PTY and execute a single command
pub async fn open_exec(
    transport: &SshTransport,
    command: &str,
    term: &str,
    cols: u32,
    rows: u32,
) -> Result<Channel<Msg>, SshError> {
    let channel = open_pty_channel(transport, term, cols, rows).await?;

    channel
        .exec(true, command)
        .await
        .map_err(|e| SshError::ChannelError(format!("Exec request failed: {}", e)))?;

    info!("Remote command started ({})", term);
    Ok(channel)
}

async fn open_pty_channel(
    transport: &SshTransport,
    term: &str,
    cols: u32,
    rows: u32,
) -> Result<Channel<Msg>, SshError> {
    let channel = transport
        .channel_open_session()
        .await
        .map_err(|e| SshError::ChannelError(format!("Channel open failed: {}", e)))?;

    debug!("Channel opened, requesting PTY {}x{}", cols, rows);

    channel
        .request_pty(false, term, cols, rows, 0, 0, &[])
        .await
        .map_err(|e| SshError::ChannelError(format!("PTY request failed: {}", e)))?;

    Ok(channel)
}

/// Spawn the task that owns `channel`
pub fn spawn_channel_pump(mut channel: Channel<Msg>, session_id: String) -> (ChannelIo, JoinHandle<()>) {
    let (io, mut cmd_rx, stdout_tx) = ChannelIo::pair();

    let task = tokio::spawn(async move {
        debug!("Channel pump started for session {}", session_id);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ChannelCommand::Data(data)) => {
                            if let Err(e) = channel.data(&data[..]).await {
                                error!("Failed to send data to SSH channel: {}", e);
                                break;
                            }
                        }
                        Some(ChannelCommand::Resize { cols, rows }) => {
                            debug!("window_change {}x{} for session {}", cols, rows, session_id);
                            if let Err(e) = channel.window_change(cols, rows, 0, 0).await {
                                error!("Failed to resize PTY: {}", e);
                            }
                        }
                        Some(ChannelCommand::Close) | None => {
                            debug!("Closing SSH channel for session {}", session_id);
                            let _ = channel.eof().await;
                            let _ = channel.close().await;
                            break;
                        }
                    }
                }

                msg = channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            if forward_chunks(&stdout_tx, &data).await.is_err() {
                                debug!("Output receiver dropped for session {}", session_id);
                                break;
                            }
                        }
                        // stderr (ext == 1); a PTY normally merges it into stdout
                        Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                            if forward_chunks(&stdout_tx, &data).await.is_err() {
                                break;
                            }
                        }
                        Some(ChannelMsg::Eof) => {
                            info!("SSH channel EOF for session {}", session_id);
                            break;
                        }
                        Some(ChannelMsg::Close) | None => {
                            info!("SSH channel closed for session {}", session_id);
                            break;
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            info!("Remote exit status {} for session {}", exit_status, session_id);
                        }
                        Some(_) => {}
                    }
                }
            }
        }

        debug!("Channel pump terminated for session {}", session_id);
    });

    (io, task)
}

async fn forward_chunks(
    stdout_tx: &mpsc::Sender<Bytes>,
    data: &[u8],
) -> Result<(), mpsc::error::SendError<Bytes>> {
    for chunk in data.chunks(CHUNK_SIZE) {
        stdout_tx.send(Bytes::copy_from_slice(chunk)).await?;
    }
    Ok(())
}
