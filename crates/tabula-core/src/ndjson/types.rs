//! Record types for the generation NDJSON protocol.

use serde::{Deserialize, Serialize};

/// One record of a streaming generate response.
///
/// Every field is optional on the wire; unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GenerateChunk {
    #[serde(default)]
    pub model: Option<String>,
    /// Incremental text produced since the previous record.
    #[serde(default)]
    pub response: Option<String>,
    /// Set on the final record of a generation.
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub done_reason: Option<String>,
    /// Reported by the service when generation fails mid-stream.
    #[serde(default)]
    pub error: Option<String>,
}

impl GenerateChunk {
    /// Text carried by this record, if any and non-empty.
    pub fn text(&self) -> Option<&str> {
        self.response.as_deref().filter(|t| !t.is_empty())
    }
}
