//! Resettable silence deadline for the upstream stream.

use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Instant, Sleep};

/// Fires when no upstream activity was seen for a full window.
///
/// While disarmed, [`Watchdog::expired`] never resolves, so it can sit in a
/// `select!` unconditionally.
#[derive(Debug)]
pub struct Watchdog {
    window: Duration,
    deadline: Pin<Box<Sleep>>,
    armed: bool,
}

impl Watchdog {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: Box::pin(tokio::time::sleep(window)),
            armed: false,
        }
    }

    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Start a fresh window from now.
    pub fn arm(&mut self) {
        self.deadline.as_mut().reset(Instant::now() + self.window);
        self.armed = true;
    }

    /// Record activity. No effect once disarmed, so a late chunk cannot
    /// revive a watchdog that teardown already stopped.
    pub fn rearm(&mut self) {
        if self.armed {
            self.arm();
        }
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }

    pub const fn is_armed(&self) -> bool {
        self.armed
    }

    /// Resolves when the armed window elapses.
    pub async fn expired(&mut self) {
        if self.armed {
            self.deadline.as_mut().await;
        } else {
            std::future::pending::<()>().await;
        }
    }
}
