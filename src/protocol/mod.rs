//! Peer-to-peer wire protocol
//!
//! Defines the request/response messages exchanged between peers for the
//! directory service and the averaging engine. Frames are JSON envelopes
//! with a version header; tensor data travels base64-encoded.

mod messages;
mod version;

pub use messages::*;
pub use version::*;
