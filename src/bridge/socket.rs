//! WebSocket seams
//!
//! The session only needs "next text message" and "send text message", so
//! the two halves of a split `WebSocketStream` are put behind small traits.
//! Tests drive sessions with in-memory fakes through the same traits.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::trace;

use super::error::BridgeError;

/// Receiving half of a client connection
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Next text payload, or `None` once the peer has closed
    async fn recv_text(&mut self) -> Result<Option<String>, BridgeError>;
}

/// Sending half of a client connection
#[async_trait]
pub trait FrameSink: Send + 'static {
    async fn send_text(&mut self, text: String) -> Result<(), BridgeError>;

    async fn close(&mut self) -> Result<(), BridgeError>;
}

fn is_closed(err: &tungstenite::Error) -> bool {
    matches!(
        err,
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed
    )
}

#[async_trait]
impl<S> FrameSource for SplitStream<WebSocketStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv_text(&mut self) -> Result<Option<String>, BridgeError> {
        while let Some(msg) = self.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) if is_closed(&e) => return Ok(None),
                Err(e) => return Err(e.into()),
            };

            match msg {
                Message::Text(text) => return Ok(Some(text)),
                Message::Binary(data) => {
                    return String::from_utf8(data).map(Some).map_err(|_| {
                        BridgeError::Protocol("binary message is not valid UTF-8".to_string())
                    });
                }
                Message::Close(_) => return Ok(None),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
                    trace!("Skipping control frame");
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl<S> FrameSink for SplitSink<WebSocketStream<S>, Message>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_text(&mut self, text: String) -> Result<(), BridgeError> {
        self.send(Message::Text(text)).await.map_err(Into::into)
    }

    async fn close(&mut self) -> Result<(), BridgeError> {
        match SinkExt::close(self).await {
            Err(e) if !is_closed(&e) => Err(e.into()),
            _ => Ok(()),
        }
    }
}
