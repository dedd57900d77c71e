//! Streaming relay between the upstream generation and one client.
//!
//! Upstream bytes flow through [`LineReassembler`](tabula_core::ndjson::LineReassembler)
//! and the [`EventTranslator`] into a [`FrameWriter`], while a [`Watchdog`]
//! watches for silence. The [`RelayContext`] starts one relay task per client
//! stream.

mod controller;
mod frame;
mod translator;
mod types;
mod watchdog;
mod writer;

pub use controller::{RelayContext, RelayStream, rejection_frame};
pub use frame::Frame;
pub use translator::EventTranslator;
pub use types::{RelayOutcome, RelayState, TerminationReason};
pub use watchdog::Watchdog;
pub use writer::{FlushOutcome, FrameWriter};
