/// Access token claims
///
/// Payload of an access token: subject identity and role plus the standard
/// JWT time claims (RFC 7519). Every field is covered by the signature.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::principal::Role;
use crate::error::TokenError;

/// Token-type marker carried by every access token
pub const ACCESS_TOKEN_TYPE: &str = "access";

/// JWT Claims for access tokens
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Claims {
    /// Subject (principal ID as UUID string)
    pub sub: String,
    pub role: Role,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    pub iss: String,
    /// Token-type marker, always `access`
    pub typ: String,
}

impl Claims {
    pub fn new(
        subject: Uuid,
        role: Role,
        issued_at: DateTime<Utc>,
        ttl: Duration,
        issuer: String,
    ) -> Self {
        let iat = issued_at.timestamp();
        Self {
            sub: subject.to_string(),
            role,
            iat,
            exp: iat + ttl.num_seconds(),
            iss: issuer,
            typ: ACCESS_TOKEN_TYPE.to_string(),
        }
    }

    pub fn subject(&self) -> Result<Uuid, TokenError> {
        Uuid::parse_str(&self.sub).map_err(|_| TokenError::Malformed)
    }

    pub fn expires_at(&self) -> Result<DateTime<Utc>, TokenError> {
        Utc.timestamp_opt(self.exp, 0)
            .single()
            .ok_or(TokenError::Malformed)
    }

    /// Expired once `now` reaches `exp`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() >= self.exp
    }
}
