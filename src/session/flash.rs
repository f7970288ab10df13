/// Session Flash Relay
///
/// One-time messages for the next render. The pending list is kept in the
/// session as a JSON array and emptied by the read that returns it.
/// A single in-flight reader per session is assumed.

use std::sync::Arc;

use crate::error::SessionError;
use crate::session::SessionStore;

pub const FLASH_SESSION_KEY: &str = "_flash";

pub struct FlashRelay {
    store: Arc<dyn SessionStore>,
}

impl FlashRelay {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Append `message` to the session's pending list
    pub async fn push(&self, session_id: &str, message: impl Into<String>) -> Result<(), SessionError> {
        let mut pending = self.pending(session_id).await?;
        pending.push(message.into());

        let encoded = serde_json::to_string(&pending)
            .map_err(|e| SessionError::Store(format!("encode flash messages: {}", e)))?;
        self.store.set(session_id, FLASH_SESSION_KEY, encoded).await
    }

    /// All pending messages in push order; the list is empty afterwards
    pub async fn pop_all(&self, session_id: &str) -> Result<Vec<String>, SessionError> {
        let pending = match self.pending(session_id).await {
            Ok(pending) => pending,
            Err(SessionError::Corrupt(key)) => {
                // Drop the unreadable value so it cannot wedge every later render
                tracing::warn!(key = %key, "Discarding corrupt flash messages");
                self.store.clear(session_id, FLASH_SESSION_KEY).await?;
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        if !pending.is_empty() {
            self.store.clear(session_id, FLASH_SESSION_KEY).await?;
        }
        Ok(pending)
    }

    async fn pending(&self, session_id: &str) -> Result<Vec<String>, SessionError> {
        match self.store.get(session_id, FLASH_SESSION_KEY).await? {
            None => Ok(Vec::new()),
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|_| SessionError::Corrupt(FLASH_SESSION_KEY.to_string())),
        }
    }
}
