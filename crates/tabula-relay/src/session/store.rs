//! In-memory session store with bounded lifetime.
//!
//! Sessions hold the inputs of a pending question until a stream attaches to
//! them. Each session is removed when its TTL elapses or when the relay that
//! attached to it terminates, whichever comes first.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Inputs captured when a session is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPayload {
    pub tabular_data: String,
    pub question: String,
}

struct SessionEntry {
    payload: SessionPayload,
    created: Instant,
    attached: bool,
    expiry: AbortHandle,
}

type EntryMap = RwLock<HashMap<String, SessionEntry>>;

/// Attempts at drawing an unused id before giving up.
const MAX_ID_ATTEMPTS: usize = 4;

/// Thread-safe session map. Cloning shares the underlying map.
#[derive(Clone)]
pub struct SessionStore {
    entries: Arc<EntryMap>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Store a payload under a fresh random id and schedule its expiry.
    pub async fn create(&self, payload: SessionPayload) -> Result<String, SessionError> {
        let mut entries = self.entries.write().await;

        let id = (0..MAX_ID_ATTEMPTS)
            .map(|_| uuid::Uuid::new_v4().to_string())
            .find(|id| !entries.contains_key(id))
            .ok_or(SessionError::IdExhausted)?;

        let expiry = spawn_expiry(Arc::downgrade(&self.entries), id.clone(), self.ttl);
        entries.insert(
            id.clone(),
            SessionEntry {
                payload,
                created: Instant::now(),
                attached: false,
                expiry,
            },
        );
        drop(entries);

        info!(session_id = %id, ttl_secs = self.ttl.as_secs(), "Session created");
        Ok(id)
    }

    /// Look up a session payload. Does not extend the TTL.
    pub async fn get(&self, id: &str) -> Option<SessionPayload> {
        self.entries
            .read()
            .await
            .get(id)
            .map(|entry| entry.payload.clone())
    }

    /// Mark a session as streaming and return its payload.
    ///
    /// A session accepts one stream over its lifetime; later attempts are
    /// rejected with [`SessionError::AlreadyAttached`].
    pub async fn claim(&self, id: &str) -> Result<SessionPayload, SessionError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        if entry.attached {
            return Err(SessionError::AlreadyAttached(id.to_string()));
        }
        entry.attached = true;
        Ok(entry.payload.clone())
    }

    /// Remove a session and cancel its expiry timer.
    ///
    /// Returns `false` when the session was already gone.
    pub async fn delete(&self, id: &str) -> bool {
        let removed = self.entries.write().await.remove(id);
        match removed {
            Some(entry) => {
                entry.expiry.abort();
                debug!(session_id = %id, "Session deleted");
                true
            }
            None => false,
        }
    }

    /// Drop every session whose TTL has elapsed. Returns the count removed.
    ///
    /// Expiry timers normally handle this; the sweep covers sessions whose
    /// timer task could not run (for example after the runtime was stalled).
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| {
            let live = entry.created.elapsed() < self.ttl;
            if !live {
                entry.expiry.abort();
            }
            live
        });
        let removed = before - entries.len();
        drop(entries);

        if removed > 0 {
            info!(removed, "Purged expired sessions");
        }
        removed
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

fn spawn_expiry(entries: Weak<EntryMap>, id: String, ttl: Duration) -> AbortHandle {
    tokio::spawn(async move {
        tokio::time::sleep(ttl).await;
        let Some(entries) = entries.upgrade() else {
            return;
        };
        let removed = entries.write().await.remove(&id);
        match removed {
            Some(entry) if entry.attached => {
                warn!(session_id = %id, "Session expired while a stream was attached");
            }
            Some(_) => info!(session_id = %id, "Session expired"),
            None => {}
        }
    })
    .abort_handle()
}

/// Session store errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session already streaming: {0}")]
    AlreadyAttached(String),

    #[error("Could not allocate a unique session id")]
    IdExhausted,
}
