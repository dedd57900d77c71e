//! `Tabula` relay server library.
//!
//! Holds pending table questions as short-lived sessions and relays the
//! streamed answer from the inference service to the client as
//! server-sent events.

pub mod relay;
pub mod server;
pub mod session;
pub mod upstream;
