//! Generate records to outbound frames.

use tabula_core::ndjson::{GenerateChunk, parse_line};
use tracing::{debug, trace, warn};

use super::frame::Frame;

/// Converts parsed upstream records into client frames.
///
/// Once a terminal record has been seen, everything after it is ignored.
#[derive(Debug, Default)]
pub struct EventTranslator {
    finished: bool,
    tokens: u64,
    malformed: u64,
}

impl EventTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate one complete NDJSON line. Malformed lines are logged and
    /// skipped.
    pub fn translate_line(&mut self, line: &str) -> Option<Frame> {
        if self.finished {
            trace!(line_len = line.len(), "Ignoring record after terminal");
            return None;
        }
        match parse_line(line) {
            Ok(chunk) => self.translate(&chunk),
            Err(e) => {
                self.malformed += 1;
                warn!(error = %e, line_len = line.len(), "Skipping malformed upstream record");
                None
            }
        }
    }

    /// Translate one parsed record into zero or one frame.
    pub fn translate(&mut self, chunk: &GenerateChunk) -> Option<Frame> {
        if self.finished {
            return None;
        }

        if let Some(message) = chunk.error.as_deref() {
            self.finished = true;
            warn!(error = %message, "Upstream reported a generation error");
            return Some(Frame::error(message));
        }

        if chunk.done {
            self.finished = true;
            debug!(reason = ?chunk.done_reason, tokens = self.tokens, "Upstream generation done");
            return Some(Frame::Done);
        }

        let text = chunk.text()?;
        self.tokens += 1;
        Some(Frame::token(text))
    }

    pub const fn tokens(&self) -> u64 {
        self.tokens
    }

    pub const fn malformed(&self) -> u64 {
        self.malformed
    }
}
