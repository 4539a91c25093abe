//! wssh - terminal client for a wsshd bridge
//!
//! Puts the local terminal in raw mode, forwards keystrokes and window size
//! changes as bridge frames and writes remote output to stdout.
//! Press Ctrl+] to disconnect.

use std::io::Write;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use wssh::bridge::{ClientFrame, ServerFrame};

const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "wssh", version, about = "Terminal client for a wsshd WebSocket-to-SSH bridge")]
struct Cli {
    /// Bridge endpoint, e.g. ws://localhost:5000/wssh/example.com/root?password=...
    url: String,
}

/// Restores cooked mode on drop
struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    fn enter() -> Result<Self> {
        terminal::enable_raw_mode().context("failed to enable raw terminal mode")?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

enum Input {
    Frame(ClientFrame),
    Quit,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Log output would interleave with the remote screen, so stay quiet unless asked
    if std::env::var_os("RUST_LOG").is_some() {
        wssh::init_logging();
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("wssh: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let (ws, _) = tokio_tungstenite::connect_async(cli.url.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", cli.url))?;
    info!("Connected to {}", cli.url);

    let (mut sink, mut stream) = ws.split();

    let (cols, rows) = terminal::size().unwrap_or((80, 24));
    sink.send(Message::Text(
        ClientFrame::resize(cols.into(), rows.into()).encode(),
    ))
    .await
    .context("failed to send initial window size")?;

    let guard = RawModeGuard::enter()?;
    let stop = Arc::new(AtomicBool::new(false));
    let (input_tx, mut input_rx) = mpsc::channel::<Input>(64);
    let reader = tokio::task::spawn_blocking({
        let stop = stop.clone();
        move || read_terminal_events(input_tx, stop)
    });

    let mut stdout = std::io::stdout();
    let result: Result<()> = loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(ServerFrame::Data(data)) => {
                        if let Err(e) = stdout.write_all(data.as_bytes()).and_then(|_| stdout.flush()) {
                            break Err(e).context("failed to write to stdout");
                        }
                    }
                    Ok(ServerFrame::Error(message)) => break Err(anyhow!(message)),
                    Err(e) => debug!("Ignoring unrecognized frame: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(e).context("connection lost"),
            },
            input = input_rx.recv() => match input {
                Some(Input::Frame(frame)) => {
                    if let Err(e) = sink.send(Message::Text(frame.encode())).await {
                        break Err(e).context("failed to send input");
                    }
                }
                Some(Input::Quit) | None => break Ok(()),
            },
        }
    };

    stop.store(true, Ordering::SeqCst);
    drop(guard);
    let _ = sink.close().await;
    let _ = reader.await;

    if result.is_ok() {
        eprintln!("\r\nConnection closed.");
    }
    result
}

fn read_terminal_events(tx: mpsc::Sender<Input>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        match event::poll(EVENT_POLL_INTERVAL) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(e) => {
                warn!("Terminal event error: {}", e);
                break;
            }
        }

        let input = match event::read() {
            Ok(Event::Key(key)) if key.kind != KeyEventKind::Release => {
                if is_disconnect(&key) {
                    Input::Quit
                } else {
                    match key_to_input(&key) {
                        Some(data) => Input::Frame(ClientFrame::data(data)),
                        None => continue,
                    }
                }
            }
            Ok(Event::Paste(text)) => Input::Frame(ClientFrame::data(text)),
            Ok(Event::Resize(cols, rows)) => Input::Frame(ClientFrame::resize(cols.into(), rows.into())),
            Ok(_) => continue,
            Err(e) => {
                warn!("Terminal event error: {}", e);
                break;
            }
        };

        let quit = matches!(input, Input::Quit);
        if tx.blocking_send(input).is_err() || quit {
            break;
        }
    }
}

fn is_disconnect(key: &KeyEvent) -> bool {
    key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char(']')
}

/// Translate a key press into the bytes a remote PTY expects
fn key_to_input(key: &KeyEvent) -> Option<String> {
    let text = match key.code {
        KeyCode::Char(c) if key.modifiers.contains(KeyModifiers::CONTROL) => {
            let lower = c.to_ascii_lowercase();
            if lower.is_ascii_lowercase() {
                char::from(lower as u8 - b'a' + 1).to_string()
            } else {
                c.to_string()
            }
        }
        KeyCode::Char(c) if key.modifiers.contains(KeyModifiers::ALT) => format!("\x1b{}", c),
        KeyCode::Char(c) => c.to_string(),
        KeyCode::Enter => "\r".to_string(),
        KeyCode::Backspace => "\x7f".to_string(),
        KeyCode::Tab => "\t".to_string(),
        KeyCode::BackTab => "\x1b[Z".to_string(),
        KeyCode::Esc => "\x1b".to_string(),
        KeyCode::Up => "\x1b[A".to_string(),
        KeyCode::Down => "\x1b[B".to_string(),
        KeyCode::Right => "\x1b[C".to_string(),
        KeyCode::Left => "\x1b[D".to_string(),
        KeyCode::Home => "\x1b[H".to_string(),
        KeyCode::End => "\x1b[F".to_string(),
        KeyCode::PageUp => "\x1b[5~".to_string(),
        KeyCode::PageDown => "\x1b[6~".to_string(),
        KeyCode::Insert => "\x1b[2~".to_string(),
        KeyCode::Delete => "\x1b[3~".to_string(),
        KeyCode::F(n) => match n {
            1 => "\x1bOP",
            2 => "\x1bOQ",
            3 => "\x1bOR",
            4 => "\x1bOS",
            5 => "\x1b[15~",
            6 => "\x1b[17~",
            7 => "\x1b[18~",
            8 => "\x1b[19~",
            9 => "\x1b[20~",
            10 => "\x1b[21~",
            11 => "\x1b[23~",
            12 => "\x1b[24~",
            _ => return None,
        }
        .to_string(),
        _ => return None,
    };
    Some(text)
}
