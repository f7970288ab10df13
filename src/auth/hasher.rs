/// Credential Hashing and Verification
///
/// Two one-way schemes behind one contract:
/// - `PasswordHasher`: bcrypt with a configured cost over the SHA-256 of the
///   password, for login passwords
/// - `TokenDigest`: SHA-256, for high-entropy refresh secrets that must be
///   looked up by digest
///
/// Both produce self-describing digests (`$2b$<cost>$...` and `sha256$<hex>`),
/// so the parameters can change without invalidating stored values.

use bcrypt::{hash, verify};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{AppError, ConfigError};

const TOKEN_DIGEST_PREFIX: &str = "sha256$";
const DUMMY_PASSWORD: &str = "warden-timing-equaliser";

pub trait CredentialHasher: Send + Sync {
    /// One-way digest of `secret`
    fn hash(&self, secret: &str) -> Result<String, AppError>;

    /// Never fails: a malformed digest is a non-match
    fn verify(&self, secret: &str, digest: &str) -> bool;
}

/// bcrypt password hasher
pub struct PasswordHasher {
    cost: u32,
    dummy_digest: String,
}

impl PasswordHasher {
    /// # Errors
    /// Returns a config error when `cost` is outside bcrypt's 4..=31
    pub fn new(cost: u32) -> Result<Self, AppError> {
        let dummy_digest = hash(prehash(DUMMY_PASSWORD), cost).map_err(|e| {
            AppError::Config(ConfigError::InvalidValue(format!(
                "password cost {}: {}",
                cost, e
            )))
        })?;

        Ok(Self { cost, dummy_digest })
    }

    /// Burns the same work as a real verification.
    /// Used when there is no stored digest to check against.
    pub fn verify_dummy(&self, secret: &str) -> bool {
        let _ = self.verify(secret, &self.dummy_digest);
        false
    }
}

impl CredentialHasher for PasswordHasher {
    fn hash(&self, secret: &str) -> Result<String, AppError> {
        hash(prehash(secret), self.cost)
            .map_err(|e| AppError::Internal(format!("Password hashing failed: {}", e)))
    }

    fn verify(&self, secret: &str, digest: &str) -> bool {
        match verify(prehash(secret), digest) {
            Ok(matches) => matches,
            Err(e) => {
                tracing::warn!("Stored password digest is unreadable: {}", e);
                false
            }
        }
    }
}

// bcrypt ignores input past 72 bytes; the 64-char hex digest stays below that
fn prehash(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Deterministic digest for refresh secrets
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenDigest;

impl TokenDigest {
    pub fn digest(secret: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        format!("{}{:x}", TOKEN_DIGEST_PREFIX, hasher.finalize())
    }
}

impl CredentialHasher for TokenDigest {
    fn hash(&self, secret: &str) -> Result<String, AppError> {
        Ok(Self::digest(secret))
    }

    fn verify(&self, secret: &str, digest: &str) -> bool {
        if !digest.starts_with(TOKEN_DIGEST_PREFIX) {
            return false;
        }
        let expected = Self::digest(secret);
        expected.as_bytes().ct_eq(digest.as_bytes()).into()
    }
}
