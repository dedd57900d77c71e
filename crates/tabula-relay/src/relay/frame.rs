//! Outbound event-stream frames.

use axum::response::sse::Event;
use serde_json::json;

/// One event on the client stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Incremental generated text, already escaped.
    Token(String),
    /// End of the generation.
    Done,
    Error(String),
    Timeout(String),
}

impl Frame {
    /// Token frame for raw upstream text.
    ///
    /// Newlines and carriage returns are replaced with their two-character
    /// escapes so each token stays on one logical line once decoded.
    pub fn token(text: &str) -> Self {
        Self::Token(text.replace('\n', "\\n").replace('\r', "\\r"))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    /// Whether this frame ends the client stream.
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Token(_))
    }

    /// Short label for logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Token(_) => "token",
            Self::Done => "done",
            Self::Error(_) => "error",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Event-stream encoding of this frame.
    pub fn into_event(self) -> Event {
        match self {
            Self::Token(token) => Event::default().data(json!({ "token": token }).to_string()),
            Self::Done => Event::default().data("[DONE]"),
            Self::Error(message) => Event::default()
                .event("error")
                .data(json!({ "error": message }).to_string()),
            Self::Timeout(message) => Event::default()
                .event("timeout")
                .data(json!({ "msg": message }).to_string()),
        }
    }
}
