//! Session Pool
//!
//! Maps caller-assigned session ids to live sessions. Entries live until the
//! caller overwrites or removes them; there is no expiry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Session, SessionError};

/// Concurrency-safe id → session map
pub struct SessionPool {
    sessions: Mutex<HashMap<i64, Arc<dyn Session>>>,
}

impl SessionPool {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a session
    pub fn get_session(&self, id: i64) -> Result<Arc<dyn Session>, SessionError> {
        self.sessions
            .lock()
            .get(&id)
            .cloned()
            .ok_or(SessionError::NotFound(id))
    }

    /// Insert or replace the session for `id` (last write wins)
    pub fn set_session(&self, id: i64, session: Arc<dyn Session>) {
        let replaced = self.sessions.lock().insert(id, session).is_some();
        if replaced {
            tracing::debug!("Session {} replaced in pool", id);
        } else {
            tracing::debug!("Session {} added to pool", id);
        }
    }

    /// Remove and return the session for `id`
    ///
    /// The session is not closed; that stays with the caller.
    pub fn remove_session(&self, id: i64) -> Option<Arc<dyn Session>> {
        let removed = self.sessions.lock().remove(&id);
        if removed.is_some() {
            tracing::debug!("Session {} removed from pool", id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

impl Default for SessionPool {
    fn default() -> Self {
        Self::new()
    }
}
