/// Session-scoped helpers
///
/// CSRF tokens and flash messages live in the host's server-side session.
/// Both helpers talk to it only through `SessionStore`.

mod csrf;
mod flash;

use async_trait::async_trait;

use crate::error::SessionError;

pub use csrf::{CsrfTokenManager, CSRF_SESSION_KEY, CSRF_TOKEN_LENGTH};
pub use flash::{FlashRelay, FLASH_SESSION_KEY};

/// Key/value view of the host's per-session storage.
///
/// Implementations must give read-your-writes consistency for one session
/// within one request. Nothing here needs multi-key transactions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &str, key: &str) -> Result<Option<String>, SessionError>;

    async fn set(&self, session_id: &str, key: &str, value: String) -> Result<(), SessionError>;

    async fn clear(&self, session_id: &str, key: &str) -> Result<(), SessionError>;
}
