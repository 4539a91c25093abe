//! WebSocket bridge
//!
//! Carries a JSON framing protocol over a WebSocket and translates it into
//! SSH channel I/O:
//! - `protocol`: frame encoding and lenient client-frame parsing
//! - `socket`: the send/receive seams the session is written against
//! - `session`: open, bridge and close one SSH session per WebSocket
//! - `server`: upgrade routing for the `wsshd` daemon

mod error;
pub mod protocol;
mod server;
mod session;
mod socket;

pub use error::BridgeError;
pub use protocol::{ClientFrame, OutputDecoder, Resize, ServerFrame};
pub use server::{serve, ConnectRequest, RouteError, ServerConfig, ROUTE_PREFIX};
pub use session::{Session, SessionState};
pub use socket::{FrameSink, FrameSource};
