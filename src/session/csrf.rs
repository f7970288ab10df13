/// CSRF Token Manager
///
/// One random token per session, created lazily on first use and then kept
/// for the session's lifetime so several open tabs share it. Tokens are not
/// derived from user identity.

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::error::{AppError, AuthError, SessionError};
use crate::session::SessionStore;

pub const CSRF_SESSION_KEY: &str = "csrf_token";
/// 43 alphanumeric characters, about 256 bits
pub const CSRF_TOKEN_LENGTH: usize = 43;

pub struct CsrfTokenManager {
    store: Arc<dyn SessionStore>,
}

impl CsrfTokenManager {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// The session's token, created and stored if absent
    ///
    /// # Errors
    /// Returns error if the session store fails
    pub async fn ensure(&self, session_id: &str) -> Result<String, SessionError> {
        if let Some(token) = self.store.get(session_id, CSRF_SESSION_KEY).await? {
            if is_well_formed(&token) {
                return Ok(token);
            }
            tracing::warn!("Replacing malformed CSRF token in session");
        }

        let token = generate_csrf_token();
        self.store
            .set(session_id, CSRF_SESSION_KEY, token.clone())
            .await?;
        Ok(token)
    }

    /// Constant-time comparison against the session's token.
    ///
    /// A missing session token, a missing or malformed presented token, or a
    /// store failure all yield `false`.
    pub async fn validate(&self, session_id: &str, presented: Option<&str>) -> bool {
        let presented = match presented {
            Some(token) if is_well_formed(token) => token,
            _ => return false,
        };

        let expected = match self.store.get(session_id, CSRF_SESSION_KEY).await {
            Ok(Some(token)) => token,
            Ok(None) => return false,
            Err(e) => {
                tracing::error!(error = %e, "CSRF validation could not read session");
                return false;
            }
        };

        expected.as_bytes().ct_eq(presented.as_bytes()).into()
    }

    /// Gate for session-mutating form posts
    ///
    /// # Errors
    /// `AuthError::Forbidden` unless `validate` passes
    pub async fn require(&self, session_id: &str, presented: Option<&str>) -> Result<(), AppError> {
        if self.validate(session_id, presented).await {
            Ok(())
        } else {
            tracing::warn!("CSRF token mismatch");
            Err(AuthError::Forbidden.into())
        }
    }
}

fn generate_csrf_token() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CSRF_TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

fn is_well_formed(token: &str) -> bool {
    token.len() == CSRF_TOKEN_LENGTH && token.bytes().all(|b| b.is_ascii_alphanumeric())
}
