use chrono::{Duration, TimeZone, Utc};
use std::sync::Arc;
use warden::auth::{AuthService, Role};
use warden::clock::{Clock, ManualClock};
use warden::configuration::{AuthSettings, SigningKeySettings};
use warden::error::{AppError, AuthError, TokenError};
use warden::storage::{InMemoryPrincipalStore, InMemoryRefreshTokenStore};

pub struct TestService {
    pub service: AuthService,
    pub principals: Arc<InMemoryPrincipalStore>,
    pub clock: Arc<ManualClock>,
}

fn auth_settings() -> AuthSettings {
    AuthSettings {
        issuer: "warden-integration".to_string(),
        access_token_ttl: 900,
        refresh_token_ttl: 30 * 24 * 60 * 60,
        password_cost: 4,
        signing_keys: vec![SigningKeySettings {
            kid: "primary".to_string(),
            secret: "integration-signing-secret-0123456789".to_string(),
        }],
        lockout_threshold: 5,
        lockout_minutes: 15,
    }
}

fn spawn_service() -> TestService {
    let principals = Arc::new(InMemoryPrincipalStore::new());
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 5, 4, 9, 30, 0).unwrap(),
    ));
    let service = AuthService::from_settings(
        &auth_settings(),
        principals.clone(),
        Arc::new(InMemoryRefreshTokenStore::new()),
        clock.clone(),
    )
    .expect("Failed to build auth service");

    TestService {
        service,
        principals,
        clock,
    }
}

// --- Login Tests ---

#[tokio::test]
async fn login_then_verify_yields_same_subject_and_role() {
    let app = spawn_service();
    let users = [
        ("john@example.com", "SecurePass123"),
        ("jane.doe@example.org", "An0ther-Secret"),
    ];

    for (email, password) in users {
        let principal = app.service.register(email, password).await.unwrap();
        let pair = app.service.login(email, password).await.unwrap();

        let access = app.service.authenticate(&pair.access_token).unwrap();
        assert_eq!(access.subject, principal.id, "subject mismatch for {}", email);
        assert_eq!(access.role, Role::Standard);
    }
}

#[tokio::test]
async fn login_failures_do_not_reveal_which_part_was_wrong() {
    let app = spawn_service();
    app.service
        .register("john@example.com", "SecurePass123")
        .await
        .unwrap();

    let wrong_password = app
        .service
        .login("john@example.com", "WrongPass123")
        .await
        .unwrap_err();
    let unknown_email = app
        .service
        .login("nobody@example.com", "SecurePass123")
        .await
        .unwrap_err();
    let garbage_email = app
        .service
        .login("not an email", "SecurePass123")
        .await
        .unwrap_err();

    assert_eq!(wrong_password, AppError::Auth(AuthError::InvalidCredentials));
    assert_eq!(unknown_email, wrong_password);
    assert_eq!(garbage_email, wrong_password);
}

#[tokio::test]
async fn long_password_must_match_in_full() {
    let app = spawn_service();
    let shared = format!("Aa1{}", "x".repeat(69));
    let real = format!("{}REAL-TAIL-0001", shared);
    app.service.register("john@example.com", &real).await.unwrap();

    let wrong_tail = app
        .service
        .login("john@example.com", &format!("{}totally-different", shared))
        .await
        .unwrap_err();

    assert_eq!(wrong_tail, AppError::Auth(AuthError::InvalidCredentials));
    assert!(app.service.login("john@example.com", &real).await.is_ok());
}

#[tokio::test]
async fn login_accepts_email_in_any_case() {
    let app = spawn_service();
    app.service
        .register("john@example.com", "SecurePass123")
        .await
        .unwrap();

    assert!(app
        .service
        .login("  JOHN@Example.com", "SecurePass123")
        .await
        .is_ok());
}

#[tokio::test]
async fn account_locks_after_five_failures_and_unlocks_later() {
    let app = spawn_service();
    app.service
        .register("john@example.com", "SecurePass123")
        .await
        .unwrap();

    for _ in 0..5 {
        let _ = app.service.login("john@example.com", "WrongPass123").await;
    }

    let locked = app
        .service
        .login("john@example.com", "SecurePass123")
        .await
        .unwrap_err();
    let expected_until = app.clock.now() + Duration::minutes(15);
    assert_eq!(
        locked,
        AppError::Auth(AuthError::AccountLocked {
            until: expected_until
        })
    );

    app.clock.advance(Duration::minutes(16));
    assert!(app
        .service
        .login("john@example.com", "SecurePass123")
        .await
        .is_ok());
}

#[tokio::test]
async fn successful_login_resets_failure_count() {
    let app = spawn_service();
    app.service
        .register("john@example.com", "SecurePass123")
        .await
        .unwrap();

    for _ in 0..4 {
        let _ = app.service.login("john@example.com", "WrongPass123").await;
    }
    app.service
        .login("john@example.com", "SecurePass123")
        .await
        .unwrap();
    for _ in 0..4 {
        let _ = app.service.login("john@example.com", "WrongPass123").await;
    }

    assert!(app
        .service
        .login("john@example.com", "SecurePass123")
        .await
        .is_ok());
}

// --- Access Token Tests ---

#[tokio::test]
async fn access_token_expires_exactly_at_ttl() {
    let app = spawn_service();
    app.service
        .register("john@example.com", "SecurePass123")
        .await
        .unwrap();
    let pair = app
        .service
        .login("john@example.com", "SecurePass123")
        .await
        .unwrap();

    app.clock.advance(Duration::seconds(899));
    assert!(app.service.authenticate(&pair.access_token).is_ok());

    app.clock.advance(Duration::seconds(1));
    assert_eq!(
        app.service.authenticate(&pair.access_token).unwrap_err(),
        AppError::Token(TokenError::Expired)
    );
}

#[tokio::test]
async fn admin_guard_follows_principal_role() {
    let app = spawn_service();
    let principal = app
        .service
        .register("admin@example.com", "SecurePass123")
        .await
        .unwrap();
    app.principals
        .update(principal.id, |p| p.role = Role::Admin)
        .unwrap();

    let pair = app
        .service
        .login("admin@example.com", "SecurePass123")
        .await
        .unwrap();

    let access = app.service.require_admin(&pair.access_token).unwrap();
    assert_eq!(access.role, Role::Admin);
}
