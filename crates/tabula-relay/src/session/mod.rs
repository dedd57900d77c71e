//! Session storage for pending table questions.

mod store;

pub use store::{SessionError, SessionPayload, SessionStore};
