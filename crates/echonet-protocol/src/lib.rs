//! Shared wire types for the ECHONET Lite controller.
//!
//! Mirrors the role `rt-protocol` plays in the timing stack this was
//! grown from: a dependency-free crate of plain data types shared by
//! the codec, engine, registry and hub, plus the JSON envelope spoken
//! over the hub's WebSocket connections.

mod device;
mod esv;
mod ws;

pub use device::{DeviceKey, Eoj, NodeId};
pub use esv::Esv;
pub use ws::{ClientEnvelope, ClientMessage, ErrorCode, EventPayload, ServerMessage};
