//! Bridge wire protocol
//!
//! One JSON object per WebSocket text message.
//!
//! ```text
//! client -> server   {"data": "<keystrokes>"}
//!                    {"resize": {"width": N, "height": N}}
//! server -> client   {"data": "<remote output>"}
//!                    {"error": "<message>"}      (sent at most once, then teardown)
//! ```
//!
//! Client frames are read leniently: unknown keys are ignored, a frame may
//! carry both `resize` and `data` (resize is applied first), and only text
//! that is not JSON at all is a protocol error.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::error::BridgeError;

/// Width used when a resize frame omits it
pub const DEFAULT_WIDTH: u32 = 80;
/// Height used when a resize frame omits it
pub const DEFAULT_HEIGHT: u32 = 24;

/// Frames sent by the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerFrame {
    /// Remote output
    Data(String),
    /// Fatal session error
    Error(String),
}

impl ServerFrame {
    pub fn encode(&self) -> String {
        let (key, text) = match self {
            ServerFrame::Data(text) => ("data", text),
            ServerFrame::Error(text) => ("error", text),
        };
        let mut map = Map::with_capacity(1);
        map.insert(key.to_string(), Value::String(text.clone()));
        Value::Object(map).to_string()
    }
}

/// PTY size requested by the client. Values are passed through unchecked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resize {
    pub width: u32,
    pub height: u32,
}

/// Frame received from the terminal client
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientFrame {
    pub resize: Option<Resize>,
    pub data: Option<String>,
}

impl ClientFrame {
    pub fn data(text: impl Into<String>) -> Self {
        Self {
            data: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn resize(width: u32, height: u32) -> Self {
        Self {
            resize: Some(Resize { width, height }),
            ..Default::default()
        }
    }

    /// Parse one WebSocket text payload
    pub fn parse(text: &str) -> Result<Self, BridgeError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| BridgeError::Protocol(format!("malformed frame: {}", e)))?;

        let Value::Object(map) = value else {
            debug!("Ignoring non-object frame");
            return Ok(Self::default());
        };

        let resize = map.get("resize").and_then(parse_resize);
        let data = match map.get("data") {
            Some(Value::String(text)) => Some(text.clone()),
            Some(other) => {
                debug!("Ignoring non-string data payload: {}", other);
                None
            }
            None => None,
        };

        Ok(Self { resize, data })
    }

    pub fn encode(&self) -> String {
        let mut map = Map::new();
        if let Some(resize) = self.resize {
            map.insert(
                "resize".to_string(),
                serde_json::json!({ "width": resize.width, "height": resize.height }),
            );
        }
        if let Some(data) = &self.data {
            map.insert("data".to_string(), Value::String(data.clone()));
        }
        Value::Object(map).to_string()
    }
}

fn parse_resize(value: &Value) -> Option<Resize> {
    let Value::Object(dims) = value else {
        warn!("Ignoring resize frame that is not an object: {}", value);
        return None;
    };

    let width = dimension(dims, "width", DEFAULT_WIDTH)?;
    let height = dimension(dims, "height", DEFAULT_HEIGHT)?;
    Some(Resize { width, height })
}

fn dimension(dims: &Map<String, Value>, key: &str, default: u32) -> Option<u32> {
    match dims.get(key) {
        None => Some(default),
        Some(value) => {
            let parsed = value.as_u64().and_then(|n| u32::try_from(n).ok());
            if parsed.is_none() {
                warn!("Ignoring resize frame with unusable {}: {}", key, value);
            }
            parsed
        }
    }
}

/// Incremental UTF-8 decoder for SSH output
///
/// A multibyte character split across two reads is held back until the
/// rest arrives; invalid bytes decode to U+FFFD. Call [`finish`](Self::finish)
/// at end of stream so a truncated trailing sequence is not lost.
pub struct OutputDecoder {
    decoder: encoding_rs::Decoder,
}

impl OutputDecoder {
    pub fn new() -> Self {
        Self {
            decoder: encoding_rs::UTF_8.new_decoder_without_bom_handling(),
        }
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.decode_inner(chunk, false)
    }

    /// Flush bytes held back from an incomplete sequence
    pub fn finish(&mut self) -> String {
        self.decode_inner(&[], true)
    }

    fn decode_inner(&mut self, chunk: &[u8], last: bool) -> String {
        let capacity = self
            .decoder
            .max_utf8_buffer_length(chunk.len())
            .unwrap_or(chunk.len() * 3 + 4);
        let mut text = String::with_capacity(capacity);
        let (_, _, _) = self.decoder.decode_to_string(chunk, &mut text, last);
        text
    }
}

impl Default for OutputDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_data_frame() {
        let frame = ClientFrame::parse(r#"{"data": "ls -l\n"}"#).unwrap();
        assert_eq!(frame, ClientFrame::data("ls -l\n"));
    }

    #[test]
    fn test_parse_resize_frame() {
        let frame = ClientFrame::parse(r#"{"resize": {"width": 132, "height": 43}}"#).unwrap();
        assert_eq!(frame, ClientFrame::resize(132, 43));
    }

    #[test]
    fn test_parse_resize_no_clamping() {
        let frame = ClientFrame::parse(r#"{"resize": {"width": 0, "height": 100000}}"#).unwrap();
        assert_eq!(frame.resize, Some(Resize { width: 0, height: 100000 }));
    }

    #[test]
    fn test_parse_resize_defaults() {
        let frame = ClientFrame::parse(r#"{"resize": {"height": 50}}"#).unwrap();
        assert_eq!(frame.resize, Some(Resize { width: DEFAULT_WIDTH, height: 50 }));

        let frame = ClientFrame::parse(r#"{"resize": {}}"#).unwrap();
        assert_eq!(
            frame.resize,
            Some(Resize { width: DEFAULT_WIDTH, height: DEFAULT_HEIGHT })
        );
    }

    #[test]
    fn test_parse_resize_negative_dimension_dropped() {
        let frame = ClientFrame::parse(r#"{"resize": {"width": -1, "height": 24}}"#).unwrap();
        assert_eq!(frame, ClientFrame::default());
    }

    #[test]
    fn test_parse_both_keys() {
        let frame =
            ClientFrame::parse(r#"{"resize": {"width": 100, "height": 30}, "data": "x"}"#).unwrap();
        assert_eq!(frame.resize, Some(Resize { width: 100, height: 30 }));
        assert_eq!(frame.data.as_deref(), Some("x"));
    }

    #[test]
    fn test_unknown_keys_ignored() {
        assert_eq!(ClientFrame::parse(r#"{"ping": 1}"#).unwrap(), ClientFrame::default());
        assert_eq!(ClientFrame::parse("[1, 2]").unwrap(), ClientFrame::default());
        assert_eq!(ClientFrame::parse(r#"{"data": 42}"#).unwrap(), ClientFrame::default());
    }

    #[test]
    fn test_malformed_frame_is_protocol_error() {
        let err = ClientFrame::parse("ls -l").unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(_)));
    }

    #[test]
    fn test_client_frame_encoding() {
        assert_eq!(ClientFrame::data("a\"b").encode(), r#"{"data":"a\"b"}"#);
        assert_eq!(
            ClientFrame::resize(80, 24).encode(),
            r#"{"resize":{"height":24,"width":80}}"#
        );
    }

    #[test]
    fn test_server_frame_encoding() {
        assert_eq!(ServerFrame::Data("hi\n".into()).encode(), r#"{"data":"hi\n"}"#);
        assert_eq!(
            ServerFrame::Error("boom".into()).encode(),
            r#"{"error":"boom"}"#
        );

        let decoded: ServerFrame = serde_json::from_str(r#"{"error":"boom"}"#).unwrap();
        assert_eq!(decoded, ServerFrame::Error("boom".into()));
    }

    #[test]
    fn test_output_decoder_joins_split_characters() {
        let mut decoder = OutputDecoder::new();
        assert_eq!(decoder.decode(&[b'a', 0xC3]), "a");
        assert_eq!(decoder.decode(&[0xA9, b'b']), "\u{e9}b");
    }

    #[test]
    fn test_output_decoder_finish_flushes_truncated_sequence() {
        let mut decoder = OutputDecoder::new();
        assert_eq!(decoder.decode(&[b'a', 0xE2, 0x82]), "a");
        assert_eq!(decoder.finish(), "\u{fffd}");
    }

    #[test]
    fn test_output_decoder_finish_without_pending_bytes() {
        let mut decoder = OutputDecoder::new();
        assert_eq!(decoder.decode(b"done"), "done");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_output_decoder_replaces_invalid_bytes() {
        let mut decoder = OutputDecoder::new();
        assert_eq!(decoder.decode(&[b'o', 0xFF, b'k']), "o\u{fffd}k");
    }
}
