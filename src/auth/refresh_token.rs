/// Refresh Token Ledger
///
/// Long-lived, revocable refresh credentials with rotation and reuse detection.
/// Refresh tokens are:
/// - 64 random alphanumeric characters (about 380 bits of entropy)
/// - Stored only as a SHA-256 digest, the raw secret is handed out once
/// - Single-use: every refresh consumes the presented secret and mints its
///   successor in the same family
/// - Grouped in families: one family per login, linked by `replaced_by_id`
///
/// Presenting a secret that was already consumed or revoked is treated as
/// theft: the whole family is revoked and the caller gets `Reused`.
///
/// Lifecycle of a record: `Active -> Rotated` (via `replaced_by_id`) or
/// `Active -> Revoked` (via `revoked_at`). Both are terminal.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::hasher::{CredentialHasher, TokenDigest};
use crate::clock::Clock;
use crate::error::{AppError, DatabaseError, RefreshError};

pub const REFRESH_SECRET_LENGTH: usize = 64;
// Anything longer cannot be one of ours; skip the store round-trip
const MAX_PRESENTED_LENGTH: usize = 512;

/// Persisted refresh token row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTokenRecord {
    pub id: Uuid,
    pub subject_id: Uuid,
    pub token_hash: String,
    pub family_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub replaced_by_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Active,
    Rotated,
    Revoked,
    Expired,
}

impl RefreshTokenRecord {
    /// Not revoked, not rotated and not yet expired
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.replaced_by_id.is_none() && now < self.expires_at
    }

    pub fn state(&self, now: DateTime<Utc>) -> RecordState {
        if self.revoked_at.is_some() {
            RecordState::Revoked
        } else if self.replaced_by_id.is_some() {
            RecordState::Rotated
        } else if now >= self.expires_at {
            RecordState::Expired
        } else {
            RecordState::Active
        }
    }
}

/// A freshly minted refresh token. `secret` exists nowhere else.
#[derive(Clone)]
pub struct IssuedRefreshToken {
    pub secret: String,
    pub record: RefreshTokenRecord,
}

impl fmt::Debug for IssuedRefreshToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedRefreshToken")
            .field("secret", &"[redacted]")
            .field("record", &self.record)
            .finish()
    }
}

/// What `RefreshTokenLedger::revoke` acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeTarget {
    /// Logout this device
    Record(Uuid),
    /// Logout the whole chain started by one login
    Family(Uuid),
}

/// Persistence contract for the ledger.
///
/// Rows are only ever mutated through `rotate` and the `revoke*` methods.
/// `rotate` is the one operation that must be atomic: check liveness and
/// mark the row rotated in a single conditional update.
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn insert(&self, record: &RefreshTokenRecord) -> Result<(), DatabaseError>;

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshTokenRecord>, DatabaseError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<RefreshTokenRecord>, DatabaseError>;

    /// Records of one family, oldest first
    async fn find_family(&self, family_id: Uuid) -> Result<Vec<RefreshTokenRecord>, DatabaseError>;

    /// Inserts `successor` and points `current_id` at it, but only if
    /// `current_id` is still live at `now`. Returns `false` (and changes
    /// nothing) when it is not.
    async fn rotate(
        &self,
        current_id: Uuid,
        successor: &RefreshTokenRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Returns `false` if the record was already revoked
    async fn revoke(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError>;

    /// Revokes every not-yet-revoked record of the family, returns the count
    async fn revoke_family(
        &self,
        subject_id: Uuid,
        family_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;

    /// Revokes every not-yet-revoked record of the subject, returns the count
    async fn revoke_subject(&self, subject_id: Uuid, now: DateTime<Utc>) -> Result<u64, DatabaseError>;
}

/// Generate a new cryptographically secure refresh secret
pub fn generate_refresh_secret() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(REFRESH_SECRET_LENGTH)
        .map(char::from)
        .collect()
}

pub struct RefreshTokenLedger {
    store: Arc<dyn RefreshTokenStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl RefreshTokenLedger {
    pub fn new(store: Arc<dyn RefreshTokenStore>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self { store, clock, ttl }
    }

    pub fn is_live(&self, record: &RefreshTokenRecord) -> bool {
        record.is_live(self.clock.now())
    }

    /// Start a new family for `subject_id`
    ///
    /// # Errors
    /// Returns error if the store rejects the insert
    pub async fn mint(&self, subject_id: Uuid) -> Result<IssuedRefreshToken, AppError> {
        let issued = self.build(subject_id, Uuid::new_v4(), self.clock.now());
        self.store.insert(&issued.record).await?;

        tracing::debug!(
            subject_id = %subject_id,
            family_id = %issued.record.family_id,
            "Refresh token family started"
        );
        Ok(issued)
    }

    /// Consume `presented` and mint its successor in the same family
    ///
    /// # Errors
    /// - `RefreshError::NotFound` for unknown secrets
    /// - `RefreshError::Expired` for a live but expired record (which is revoked)
    /// - `RefreshError::Reused` for a consumed or revoked secret, or for the
    ///   loser of two concurrent rotations of the same secret; the family is
    ///   revoked before this is returned
    pub async fn rotate(&self, presented: &str) -> Result<IssuedRefreshToken, AppError> {
        let now = self.clock.now();
        let record = self.locate(presented).await?.ok_or(RefreshError::NotFound)?;

        match record.state(now) {
            RecordState::Rotated | RecordState::Revoked => {
                return Err(self.revoke_for_reuse(&record, now).await);
            }
            RecordState::Expired => {
                self.store.revoke(record.id, now).await?;
                tracing::info!(
                    subject_id = %record.subject_id,
                    family_id = %record.family_id,
                    "Refresh token expired"
                );
                return Err(RefreshError::Expired.into());
            }
            RecordState::Active => {}
        }

        let successor = self.build(record.subject_id, record.family_id, now);
        if !self.store.rotate(record.id, &successor.record, now).await? {
            // Someone consumed or revoked it between our read and our update
            return Err(self.revoke_for_reuse(&record, now).await);
        }

        tracing::debug!(
            subject_id = %record.subject_id,
            family_id = %record.family_id,
            "Refresh token rotated"
        );
        Ok(successor)
    }

    /// Read-only check of `presented`; never rotates or revokes
    ///
    /// # Errors
    /// `NotFound` for unknown, rotated or revoked secrets; `Expired` for
    /// expired ones
    pub async fn inspect(&self, presented: &str) -> Result<RefreshTokenRecord, AppError> {
        let now = self.clock.now();
        let record = self.locate(presented).await?.ok_or(RefreshError::NotFound)?;

        match record.state(now) {
            RecordState::Active => Ok(record),
            RecordState::Expired => Err(RefreshError::Expired.into()),
            RecordState::Rotated | RecordState::Revoked => Err(RefreshError::NotFound.into()),
        }
    }

    /// Record matching `presented` in any state
    pub async fn lookup(&self, presented: &str) -> Result<Option<RefreshTokenRecord>, AppError> {
        self.locate(presented).await
    }

    /// Explicit logout of one record or one family owned by `subject_id`
    ///
    /// # Returns
    /// Number of records newly revoked
    pub async fn revoke(&self, subject_id: Uuid, target: RevokeTarget) -> Result<u64, AppError> {
        let now = self.clock.now();

        let revoked = match target {
            RevokeTarget::Record(id) => match self.store.find_by_id(id).await? {
                Some(record) if record.subject_id == subject_id => {
                    u64::from(self.store.revoke(record.id, now).await?)
                }
                _ => return Err(RefreshError::NotFound.into()),
            },
            RevokeTarget::Family(family_id) => {
                self.store.revoke_family(subject_id, family_id, now).await?
            }
        };

        tracing::info!(subject_id = %subject_id, target = ?target, revoked, "Refresh tokens revoked");
        Ok(revoked)
    }

    /// Logout everywhere
    pub async fn revoke_all(&self, subject_id: Uuid) -> Result<u64, AppError> {
        let revoked = self.store.revoke_subject(subject_id, self.clock.now()).await?;
        tracing::info!(subject_id = %subject_id, revoked, "All refresh tokens revoked for subject");
        Ok(revoked)
    }

    pub async fn family(&self, family_id: Uuid) -> Result<Vec<RefreshTokenRecord>, AppError> {
        Ok(self.store.find_family(family_id).await?)
    }

    async fn locate(&self, presented: &str) -> Result<Option<RefreshTokenRecord>, AppError> {
        if presented.is_empty() || presented.len() > MAX_PRESENTED_LENGTH {
            return Ok(None);
        }

        let token_hash = TokenDigest::digest(presented);
        let record = self.store.find_by_hash(&token_hash).await?;

        // Index lookups are not constant time; confirm the match in constant time
        Ok(record.filter(|record| TokenDigest.verify(presented, &record.token_hash)))
    }

    async fn revoke_for_reuse(&self, record: &RefreshTokenRecord, now: DateTime<Utc>) -> AppError {
        if let Err(e) = self
            .store
            .revoke_family(record.subject_id, record.family_id, now)
            .await
        {
            tracing::error!(
                family_id = %record.family_id,
                error = %e,
                "Failed to revoke family after refresh token reuse"
            );
            return e.into();
        }

        tracing::error!(
            security_event = "refresh_token_reuse",
            subject_id = %record.subject_id,
            family_id = %record.family_id,
            record_id = %record.id,
            "Consumed refresh token presented again, family revoked"
        );

        RefreshError::Reused {
            subject_id: record.subject_id,
            family_id: record.family_id,
        }
        .into()
    }

    fn build(&self, subject_id: Uuid, family_id: Uuid, now: DateTime<Utc>) -> IssuedRefreshToken {
        let secret = generate_refresh_secret();
        let record = RefreshTokenRecord {
            id: Uuid::new_v4(),
            subject_id,
            token_hash: TokenDigest::digest(&secret),
            family_id,
            created_at: now,
            expires_at: now + self.ttl,
            revoked_at: None,
            replaced_by_id: None,
        };

        IssuedRefreshToken { secret, record }
    }
}
