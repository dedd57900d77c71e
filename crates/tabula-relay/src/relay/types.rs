//! Relay module types.

use std::fmt;
use std::time::Duration;

/// Lifecycle of one relay instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    SessionResolving,
    UpstreamConnecting,
    Streaming,
    Terminating,
    Closed,
}

/// Why a relay ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Upstream sent its terminal record.
    Completed,
    /// Upstream body ended without a terminal record.
    UpstreamEnded,
    /// The session id did not resolve.
    SessionNotFound,
    /// The session already has a relay attached.
    SessionBusy,
    /// The upstream could not be opened.
    ConnectFailed(String),
    /// The upstream failed after streaming started.
    UpstreamError(String),
    /// No upstream bytes for a full watchdog window.
    Timeout,
    /// The client went away.
    ClientGone,
}

impl TerminationReason {
    /// Whether the client saw a successful end of stream.
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::UpstreamEnded)
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::UpstreamEnded => f.write_str("upstream_ended"),
            Self::SessionNotFound => f.write_str("session_not_found"),
            Self::SessionBusy => f.write_str("session_busy"),
            Self::ConnectFailed(e) => write!(f, "connect_failed: {e}"),
            Self::UpstreamError(e) => write!(f, "upstream_error: {e}"),
            Self::Timeout => f.write_str("timeout"),
            Self::ClientGone => f.write_str("client_gone"),
        }
    }
}

/// Summary reported when a relay finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    pub session_id: String,
    pub reason: TerminationReason,
    /// Token frames produced from upstream records.
    pub tokens: u64,
    /// Upstream lines that failed to parse.
    pub malformed: u64,
    /// Partial records dropped because they outgrew the buffer cap.
    pub overflows: u64,
    /// Frames the client transport accepted.
    pub frames_sent: usize,
    pub duration: Duration,
}
