/// Authentication Service
///
/// Composes the credential hasher, access token codec and refresh token
/// ledger into the register, login, refresh and logout flows.
///
/// # Security Notes
/// - Unknown email and wrong password produce the same `InvalidCredentials`,
///   and both spend one bcrypt verification
/// - A locked account is refused before its password is checked
/// - `AccountInactive` is only reported once the password has verified
/// - Refresh reuse surfaces as `RefreshError::Reused`; the host must end the
///   session and tell the user

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::hasher::{CredentialHasher, PasswordHasher};
use crate::auth::jwt::{AccessTokenCodec, VerifiedAccess};
use crate::auth::principal::{Principal, PrincipalStore, Role};
use crate::auth::refresh_token::{
    IssuedRefreshToken, RefreshTokenLedger, RefreshTokenRecord, RefreshTokenStore, RevokeTarget,
};
use crate::clock::Clock;
use crate::configuration::AuthSettings;
use crate::error::{AppError, AuthError, DatabaseError, ErrorContext, RefreshError};
use crate::validators::{is_valid_email, validate_password_strength};

/// Consecutive password failures allowed before an account is locked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutPolicy {
    pub threshold: i32,
    pub duration: Duration,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            threshold: 5,
            duration: Duration::minutes(15),
        }
    }
}

/// Credentials handed to the client after login or refresh
#[derive(Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_token: String,
    pub refresh_expires_at: DateTime<Utc>,
    pub family_id: Uuid,
    pub token_type: String,
    /// Access token lifetime in seconds
    pub expires_in: i64,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"[redacted]")
            .field("access_expires_at", &self.access_expires_at)
            .field("refresh_token", &"[redacted]")
            .field("refresh_expires_at", &self.refresh_expires_at)
            .field("family_id", &self.family_id)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

pub struct AuthService {
    principals: Arc<dyn PrincipalStore>,
    hasher: PasswordHasher,
    codec: Arc<AccessTokenCodec>,
    ledger: RefreshTokenLedger,
    clock: Arc<dyn Clock>,
    lockout: LockoutPolicy,
}

impl AuthService {
    pub fn new(
        principals: Arc<dyn PrincipalStore>,
        hasher: PasswordHasher,
        codec: Arc<AccessTokenCodec>,
        ledger: RefreshTokenLedger,
        clock: Arc<dyn Clock>,
        lockout: LockoutPolicy,
    ) -> Self {
        Self {
            principals,
            hasher,
            codec,
            ledger,
            clock,
            lockout,
        }
    }

    /// Build every component from validated settings
    ///
    /// # Errors
    /// Returns a config error when the settings are unusable
    pub fn from_settings(
        settings: &AuthSettings,
        principals: Arc<dyn PrincipalStore>,
        refresh_tokens: Arc<dyn RefreshTokenStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AppError> {
        settings.validate()?;

        let hasher = PasswordHasher::new(settings.password_cost)?;
        let codec = Arc::new(AccessTokenCodec::from_settings(settings)?);
        let ledger = RefreshTokenLedger::new(
            refresh_tokens,
            clock.clone(),
            Duration::seconds(settings.refresh_token_ttl),
        );
        let lockout = LockoutPolicy {
            threshold: settings.lockout_threshold,
            duration: Duration::minutes(settings.lockout_minutes),
        };

        Ok(Self::new(principals, hasher, codec, ledger, clock, lockout))
    }

    /// Shared with the bearer middleware
    pub fn codec(&self) -> Arc<AccessTokenCodec> {
        self.codec.clone()
    }

    pub fn ledger(&self) -> &RefreshTokenLedger {
        &self.ledger
    }

    /// Create a standard principal
    ///
    /// # Validation
    /// - Email must be well formed and not already registered
    /// - Password must satisfy the password policy
    ///
    /// # Errors
    /// - `Validation` for a bad email or weak password
    /// - `Database(UniqueConstraintViolation)` for a registered email
    pub async fn register(&self, email: &str, password: &str) -> Result<Principal, AppError> {
        let context = ErrorContext::new("register");
        let result = self.register_principal(email, password).await;

        match &result {
            Ok(principal) => tracing::info!(
                request_id = %context.request_id,
                subject_id = %principal.id,
                "Principal registered"
            ),
            Err(e) => context.log_error(e),
        }
        result
    }

    async fn register_principal(&self, email: &str, password: &str) -> Result<Principal, AppError> {
        let email = is_valid_email(email)?;
        validate_password_strength(password)?;

        if self.principals.find_by_email(&email).await?.is_some() {
            return Err(DatabaseError::UniqueConstraintViolation(
                "Email already registered".to_string(),
            )
            .into());
        }

        let password_hash = self.hasher.hash(password)?;
        let principal = Principal::new(email, password_hash, Role::Standard, self.clock.now());
        self.principals.create(&principal).await?;

        Ok(principal)
    }

    /// Verify email and password, then start a new refresh family
    ///
    /// # Errors
    /// - `AuthError::InvalidCredentials` for an unknown email or a wrong password
    /// - `AuthError::AccountLocked` while a lockout is in force
    /// - `AuthError::AccountInactive` for a deactivated principal
    pub async fn login(&self, email: &str, password: &str) -> Result<TokenPair, AppError> {
        let context = ErrorContext::new("login");
        let result = self.authenticate_password(email, password).await;

        match &result {
            Ok(pair) => tracing::info!(
                request_id = %context.request_id,
                family_id = %pair.family_id,
                "Login succeeded"
            ),
            Err(e) => context.log_error(e),
        }
        result
    }

    async fn authenticate_password(&self, email: &str, password: &str) -> Result<TokenPair, AppError> {
        let now = self.clock.now();

        let principal = match is_valid_email(email) {
            Ok(email) => self.principals.find_by_email(&email).await?,
            Err(_) => None,
        };
        let principal = match principal {
            Some(principal) => principal,
            None => {
                self.hasher.verify_dummy(password);
                return Err(AuthError::InvalidCredentials.into());
            }
        };

        if principal.is_locked_at(now) {
            if let Some(until) = principal.locked_until {
                return Err(AuthError::AccountLocked { until }.into());
            }
        }

        if !self.hasher.verify(password, &principal.password_hash) {
            self.register_failure(&principal, now).await?;
            return Err(AuthError::InvalidCredentials.into());
        }

        if !principal.is_active {
            return Err(AuthError::AccountInactive.into());
        }

        self.principals.record_login_success(principal.id).await?;

        let refresh = self.ledger.mint(principal.id).await?;
        self.token_pair(principal.id, principal.role, refresh, now)
    }

    async fn register_failure(&self, principal: &Principal, now: DateTime<Utc>) -> Result<(), AppError> {
        let failures = self.principals.record_login_failure(principal.id).await?;
        if failures < self.lockout.threshold {
            return Ok(());
        }

        let until = now + self.lockout.duration;
        self.principals.lock_until(principal.id, until).await?;
        tracing::warn!(
            subject_id = %principal.id,
            failures,
            locked_until = %until.to_rfc3339(),
            "Account locked after repeated login failures"
        );
        Ok(())
    }

    /// Exchange a refresh secret for a fresh pair
    ///
    /// # Errors
    /// - `RefreshError::NotFound`/`Expired` for unusable secrets
    /// - `RefreshError::Reused` when the secret was already consumed; the
    ///   family is revoked and the host must end the session
    /// - `AuthError::AccountInactive` when the principal was deactivated; the
    ///   family is revoked
    pub async fn refresh(&self, presented: &str) -> Result<TokenPair, AppError> {
        let context = ErrorContext::new("refresh");
        let result = self.rotate_pair(presented).await;

        match &result {
            Ok(pair) => tracing::info!(
                request_id = %context.request_id,
                family_id = %pair.family_id,
                "Refresh token rotated"
            ),
            Err(e) => context.log_error(e),
        }
        result
    }

    async fn rotate_pair(&self, presented: &str) -> Result<TokenPair, AppError> {
        let refresh = self.ledger.rotate(presented).await?;
        let subject_id = refresh.record.subject_id;
        let family_id = refresh.record.family_id;

        let principal = match self.principals.find_by_id(subject_id).await? {
            Some(principal) if principal.is_active => principal,
            missing_or_inactive => {
                self.ledger
                    .revoke(subject_id, RevokeTarget::Family(family_id))
                    .await?;
                return Err(match missing_or_inactive {
                    Some(_) => AuthError::AccountInactive.into(),
                    None => RefreshError::NotFound.into(),
                });
            }
        };

        self.token_pair(principal.id, principal.role, refresh, self.clock.now())
    }

    /// Read-only validity check of a refresh secret; consumes nothing
    pub async fn inspect_refresh(&self, presented: &str) -> Result<RefreshTokenRecord, AppError> {
        self.ledger.inspect(presented).await
    }

    /// Revoke the family of `presented`. Unknown secrets are a no-op.
    ///
    /// # Returns
    /// Number of records newly revoked
    pub async fn logout(&self, presented: &str) -> Result<u64, AppError> {
        let record = match self.ledger.lookup(presented).await? {
            Some(record) => record,
            None => return Ok(0),
        };

        let context = ErrorContext::new("logout").with_subject_id(record.subject_id);
        self.ledger
            .revoke(record.subject_id, RevokeTarget::Family(record.family_id))
            .await
            .map_err(|e| {
                context.log_error(&e);
                e
            })
    }

    /// Revoke every refresh token of `subject_id`
    pub async fn logout_all(&self, subject_id: Uuid) -> Result<u64, AppError> {
        let context = ErrorContext::new("logout_all").with_subject_id(subject_id);
        self.ledger.revoke_all(subject_id).await.map_err(|e| {
            context.log_error(&e);
            e
        })
    }

    /// Verify a bearer access token at the current time
    pub fn authenticate(&self, access_token: &str) -> Result<VerifiedAccess, AppError> {
        Ok(self.codec.verify(access_token, self.clock.now())?)
    }

    /// `authenticate`, then insist on the admin role
    ///
    /// # Errors
    /// `AuthError::InsufficientRole` for a valid non-admin token
    pub fn require_admin(&self, access_token: &str) -> Result<VerifiedAccess, AppError> {
        let access = self.authenticate(access_token)?;
        if access.role != Role::Admin {
            tracing::warn!(subject_id = %access.subject, role = %access.role, "Admin role required");
            return Err(AuthError::InsufficientRole.into());
        }
        Ok(access)
    }

    fn token_pair(
        &self,
        subject_id: Uuid,
        role: Role,
        refresh: IssuedRefreshToken,
        now: DateTime<Utc>,
    ) -> Result<TokenPair, AppError> {
        let (access_token, access_expires_at) = self.codec.issue(subject_id, role, now)?;

        Ok(TokenPair {
            access_token,
            access_expires_at,
            refresh_token: refresh.secret,
            refresh_expires_at: refresh.record.expires_at,
            family_id: refresh.record.family_id,
            token_type: "Bearer".to_string(),
            expires_in: self.codec.ttl().num_seconds(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::configuration::SigningKeySettings;
    use crate::error::TokenError;
    use crate::storage::memory::{InMemoryPrincipalStore, InMemoryRefreshTokenStore};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing::{Event, Subscriber};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    /// Counts events that carry a `security_event` field
    #[derive(Clone, Default)]
    struct SecurityEvents(Arc<AtomicUsize>);

    impl<S: Subscriber> Layer<S> for SecurityEvents {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            if event.metadata().fields().field("security_event").is_some() {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    const PASSWORD: &str = "Correct1horse";

    struct Fixture {
        service: AuthService,
        principals: Arc<InMemoryPrincipalStore>,
        clock: Arc<ManualClock>,
    }

    fn settings() -> AuthSettings {
        AuthSettings {
            issuer: "warden-test".to_string(),
            access_token_ttl: 900,
            refresh_token_ttl: 30 * 24 * 60 * 60,
            password_cost: 4,
            signing_keys: vec![SigningKeySettings {
                kid: "k1".to_string(),
                secret: "s".repeat(40),
            }],
            lockout_threshold: 3,
            lockout_minutes: 15,
        }
    }

    fn fixture() -> Fixture {
        let principals = Arc::new(InMemoryPrincipalStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ));
        let service = AuthService::from_settings(
            &settings(),
            principals.clone(),
            Arc::new(InMemoryRefreshTokenStore::new()),
            clock.clone(),
        )
        .expect("Failed to build service");

        Fixture {
            service,
            principals,
            clock,
        }
    }

    #[tokio::test]
    async fn test_register_normalises_email_and_hashes_password() {
        let f = fixture();

        let principal = f.service.register("  Alice@Example.COM ", PASSWORD).await.unwrap();

        assert_eq!(principal.email, "alice@example.com");
        assert_ne!(principal.password_hash, PASSWORD);
        assert_eq!(principal.role, Role::Standard);
        assert!(principal.is_active);
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate_and_weak_password() {
        let f = fixture();
        f.service.register("alice@example.com", PASSWORD).await.unwrap();

        assert!(matches!(
            f.service.register("ALICE@example.com", PASSWORD).await,
            Err(AppError::Database(DatabaseError::UniqueConstraintViolation(_)))
        ));
        assert!(matches!(
            f.service.register("bob@example.com", "short").await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_login_issues_verifiable_pair() {
        let f = fixture();
        let principal = f.service.register("alice@example.com", PASSWORD).await.unwrap();

        let pair = f.service.login("alice@example.com", PASSWORD).await.unwrap();

        assert_eq!(pair.token_type, "Bearer");
        assert_eq!(pair.expires_in, 900);
        let access = f.service.authenticate(&pair.access_token).unwrap();
        assert_eq!(access.subject, principal.id);
        assert_eq!(access.role, Role::Standard);
    }

    #[tokio::test]
    async fn test_unknown_email_and_wrong_password_are_indistinguishable() {
        let f = fixture();
        f.service.register("alice@example.com", PASSWORD).await.unwrap();

        let unknown = f.service.login("nobody@example.com", PASSWORD).await;
        let wrong = f.service.login("alice@example.com", "Wrong1horse").await;

        assert_eq!(unknown.unwrap_err(), wrong.unwrap_err());
    }

    #[tokio::test]
    async fn test_lockout_after_threshold() {
        let f = fixture();
        f.service.register("alice@example.com", PASSWORD).await.unwrap();

        for _ in 0..3 {
            assert_eq!(
                f.service.login("alice@example.com", "Wrong1horse").await.unwrap_err(),
                AppError::Auth(AuthError::InvalidCredentials)
            );
        }

        // Even the right password is refused while locked
        assert!(matches!(
            f.service.login("alice@example.com", PASSWORD).await,
            Err(AppError::Auth(AuthError::AccountLocked { .. }))
        ));

        f.clock.advance(Duration::minutes(15));
        assert!(f.service.login("alice@example.com", PASSWORD).await.is_ok());
    }

    #[tokio::test]
    async fn test_inactive_account_rejected_only_with_right_password() {
        let f = fixture();
        let principal = f.service.register("alice@example.com", PASSWORD).await.unwrap();
        f.principals.update(principal.id, |p| p.is_active = false).unwrap();

        assert_eq!(
            f.service.login("alice@example.com", "Wrong1horse").await.unwrap_err(),
            AppError::Auth(AuthError::InvalidCredentials)
        );
        assert_eq!(
            f.service.login("alice@example.com", PASSWORD).await.unwrap_err(),
            AppError::Auth(AuthError::AccountInactive)
        );
    }

    #[tokio::test]
    async fn test_refresh_for_deactivated_principal_revokes_family() {
        let f = fixture();
        let principal = f.service.register("alice@example.com", PASSWORD).await.unwrap();
        let pair = f.service.login("alice@example.com", PASSWORD).await.unwrap();

        f.principals.update(principal.id, |p| p.is_active = false).unwrap();

        assert_eq!(
            f.service.refresh(&pair.refresh_token).await.unwrap_err(),
            AppError::Auth(AuthError::AccountInactive)
        );
        let family = f.service.ledger().family(pair.family_id).await.unwrap();
        assert!(family.iter().all(|record| record.revoked_at.is_some()));
    }

    #[tokio::test]
    async fn test_reuse_raises_one_security_event() {
        let events = SecurityEvents::default();
        let _guard = tracing::subscriber::set_default(
            tracing_subscriber::registry().with(events.clone()),
        );
        let f = fixture();
        f.service.register("alice@example.com", PASSWORD).await.unwrap();
        let pair = f.service.login("alice@example.com", PASSWORD).await.unwrap();
        f.service.refresh(&pair.refresh_token).await.unwrap();

        let err = f.service.refresh(&pair.refresh_token).await.unwrap_err();
        // The host turning it into a response must not raise a second one
        let _ = actix_web::ResponseError::error_response(&err);

        assert!(matches!(err, AppError::Refresh(RefreshError::Reused { .. })));
        assert_eq!(events.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_carries_current_role() {
        let f = fixture();
        let principal = f.service.register("alice@example.com", PASSWORD).await.unwrap();
        let pair = f.service.login("alice@example.com", PASSWORD).await.unwrap();

        assert_eq!(
            f.service.require_admin(&pair.access_token).unwrap_err(),
            AppError::Auth(AuthError::InsufficientRole)
        );

        f.principals.update(principal.id, |p| p.role = Role::Admin).unwrap();
        let refreshed = f.service.refresh(&pair.refresh_token).await.unwrap();

        assert_eq!(refreshed.family_id, pair.family_id);
        assert_eq!(
            f.service.require_admin(&refreshed.access_token).unwrap().subject,
            principal.id
        );
    }

    #[tokio::test]
    async fn test_logout_revokes_family_and_is_idempotent() {
        let f = fixture();
        f.service.register("alice@example.com", PASSWORD).await.unwrap();
        let pair = f.service.login("alice@example.com", PASSWORD).await.unwrap();

        assert_eq!(f.service.logout(&pair.refresh_token).await.unwrap(), 1);
        assert_eq!(f.service.logout(&pair.refresh_token).await.unwrap(), 0);
        assert_eq!(f.service.logout("not-a-token").await.unwrap(), 0);
        assert!(f.service.inspect_refresh(&pair.refresh_token).await.is_err());
    }

    #[tokio::test]
    async fn test_logout_all_spans_families() {
        let f = fixture();
        let principal = f.service.register("alice@example.com", PASSWORD).await.unwrap();
        let laptop = f.service.login("alice@example.com", PASSWORD).await.unwrap();
        let phone = f.service.login("alice@example.com", PASSWORD).await.unwrap();

        assert_eq!(f.service.logout_all(principal.id).await.unwrap(), 2);
        assert!(f.service.inspect_refresh(&laptop.refresh_token).await.is_err());
        assert!(f.service.inspect_refresh(&phone.refresh_token).await.is_err());
    }

    #[tokio::test]
    async fn test_authenticate_honours_clock() {
        let f = fixture();
        f.service.register("alice@example.com", PASSWORD).await.unwrap();
        let pair = f.service.login("alice@example.com", PASSWORD).await.unwrap();

        f.clock.advance(Duration::seconds(900));

        assert_eq!(
            f.service.authenticate(&pair.access_token).unwrap_err(),
            AppError::Token(TokenError::Expired)
        );
    }
}
