/// Access Token Codec
///
/// Signs and verifies short-lived, stateless HS256 access tokens.
/// The codec holds an ordered list of keys: the first one signs, all of them
/// verify, so tokens minted before a key rotation stay valid until they
/// expire. Tokens carry the signing key id in the `kid` header.
///
/// No revocation list is consulted; a short TTL is what bounds the damage of
/// a leaked token.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use uuid::Uuid;

use crate::auth::claims::{Claims, ACCESS_TOKEN_TYPE};
use crate::auth::principal::Role;
use crate::configuration::{AuthSettings, SigningKeySettings};
use crate::error::{AppError, ConfigError, TokenError};

struct SigningKey {
    kid: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

/// Identity proven by a valid access token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedAccess {
    pub subject: Uuid,
    pub role: Role,
    pub expires_at: DateTime<Utc>,
}

pub struct AccessTokenCodec {
    keys: Vec<SigningKey>,
    ttl: Duration,
    issuer: String,
}

impl AccessTokenCodec {
    /// # Arguments
    /// * `keys` - current key first, then previous keys still accepted
    /// * `ttl` - lifetime of every issued token
    /// * `issuer` - value of the `iss` claim, checked on verification
    ///
    /// # Errors
    /// Returns a config error if no key is given or the TTL is not positive
    pub fn new(keys: &[SigningKeySettings], ttl: Duration, issuer: String) -> Result<Self, AppError> {
        if keys.is_empty() {
            return Err(ConfigError::MissingRequired("signing keys".to_string()).into());
        }
        if ttl <= Duration::zero() {
            return Err(ConfigError::InvalidValue("access token TTL must be positive".to_string()).into());
        }

        let keys = keys
            .iter()
            .map(|key| SigningKey {
                kid: key.kid.clone(),
                encoding: EncodingKey::from_secret(key.secret.as_bytes()),
                decoding: DecodingKey::from_secret(key.secret.as_bytes()),
            })
            .collect();

        Ok(Self { keys, ttl, issuer })
    }

    pub fn from_settings(settings: &AuthSettings) -> Result<Self, AppError> {
        Self::new(
            &settings.signing_keys,
            Duration::seconds(settings.access_token_ttl),
            settings.issuer.clone(),
        )
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mint a token for `subject`, valid from `now` for one TTL
    ///
    /// # Errors
    /// Returns error if signing fails
    pub fn issue(
        &self,
        subject: Uuid,
        role: Role,
        now: DateTime<Utc>,
    ) -> Result<(String, DateTime<Utc>), AppError> {
        let current = &self.keys[0];
        let claims = Claims::new(subject, role, now, self.ttl, self.issuer.clone());
        let expires_at = claims.expires_at()?;

        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(current.kid.clone());

        let token = encode(&header, &claims, &current.encoding)
            .map_err(|e| AppError::Internal(format!("Token generation failed: {}", e)))?;

        Ok((token, expires_at))
    }

    /// Verify signature, structure and expiry of `token` at `now`
    ///
    /// Any defect is a typed failure; nothing here panics on hostile input.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<VerifiedAccess, TokenError> {
        let header = decode_header(token).map_err(|_| TokenError::Malformed)?;
        if header.alg != Algorithm::HS256 {
            return Err(TokenError::Malformed);
        }

        let claims = self.decode_with_accepted_keys(token, header.kid.as_deref())?;

        if claims.typ != ACCESS_TOKEN_TYPE {
            return Err(TokenError::Malformed);
        }
        // A token claiming a longer life than this codec grants was not minted by it
        if claims.exp - claims.iat > self.ttl.num_seconds() {
            return Err(TokenError::Malformed);
        }
        let subject = claims.subject()?;
        let expires_at = claims.expires_at()?;

        if claims.is_expired_at(now) {
            return Err(TokenError::Expired);
        }

        Ok(VerifiedAccess {
            subject,
            role: claims.role,
            expires_at,
        })
    }

    fn decode_with_accepted_keys(&self, token: &str, kid: Option<&str>) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked against the injected clock, not the system time
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "sub", "iss"]);

        let candidates = self
            .keys
            .iter()
            .filter(|key| kid.map_or(true, |kid| key.kid == kid));

        for key in candidates {
            match decode::<Claims>(token, &key.decoding, &validation) {
                Ok(data) => return Ok(data.claims),
                Err(e) if matches!(e.kind(), ErrorKind::InvalidSignature) => continue,
                Err(e) => {
                    tracing::debug!("Access token rejected: {}", e);
                    return Err(TokenError::Malformed);
                }
            }
        }

        tracing::debug!(kid = ?kid, "No accepted key verifies the access token");
        Err(TokenError::BadSignature)
    }
}
