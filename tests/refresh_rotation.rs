use chrono::{Duration, TimeZone, Utc};
use std::sync::Arc;
use uuid::Uuid;
use warden::auth::{AuthService, RecordState, RefreshTokenLedger, RevokeTarget};
use warden::clock::{Clock, ManualClock};
use warden::configuration::{AuthSettings, SigningKeySettings};
use warden::error::{AppError, RefreshError};
use warden::storage::{InMemoryPrincipalStore, InMemoryRefreshTokenStore};

fn spawn_ledger() -> (RefreshTokenLedger, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap(),
    ));
    let ledger = RefreshTokenLedger::new(
        Arc::new(InMemoryRefreshTokenStore::new()),
        clock.clone(),
        Duration::days(30),
    );
    (ledger, clock)
}

fn spawn_service() -> AuthService {
    let settings = AuthSettings {
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
    };

    AuthService::from_settings(
        &settings,
        Arc::new(InMemoryPrincipalStore::new()),
        Arc::new(InMemoryRefreshTokenStore::new()),
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap())),
    )
    .expect("Failed to build auth service")
}

#[tokio::test]
async fn replayed_secret_kills_the_whole_family() {
    let (ledger, _) = spawn_ledger();
    let subject = Uuid::new_v4();

    let s0 = ledger.mint(subject).await.unwrap();
    let s1 = ledger.rotate(&s0.secret).await.unwrap();
    assert_eq!(s1.record.family_id, s0.record.family_id);

    let replay = ledger.rotate(&s0.secret).await.unwrap_err();
    assert_eq!(
        replay,
        AppError::Refresh(RefreshError::Reused {
            subject_id: subject,
            family_id: s0.record.family_id,
        })
    );

    let now = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
    let family = ledger.family(s0.record.family_id).await.unwrap();
    assert_eq!(family.len(), 2);
    assert!(family
        .iter()
        .all(|record| record.state(now) == RecordState::Revoked));

    // The legitimate holder of S1 is logged out too
    assert!(matches!(
        ledger.rotate(&s1.secret).await,
        Err(AppError::Refresh(RefreshError::Reused { .. }))
    ));
}

#[tokio::test]
async fn rotation_chain_stays_linked() {
    let (ledger, _) = spawn_ledger();
    let mut current = ledger.mint(Uuid::new_v4()).await.unwrap();
    let family_id = current.record.family_id;

    for _ in 0..4 {
        current = ledger.rotate(&current.secret).await.unwrap();
    }

    let family = ledger.family(family_id).await.unwrap();
    assert_eq!(family.len(), 5);
    for pair in family.windows(2) {
        assert_eq!(pair[0].replaced_by_id, Some(pair[1].id));
    }
    assert_eq!(family[4].replaced_by_id, None);
    assert!(ledger.is_live(&family[4]));
}

#[tokio::test]
async fn expired_secret_is_revoked_not_rotated() {
    let (ledger, clock) = spawn_ledger();
    let issued = ledger.mint(Uuid::new_v4()).await.unwrap();

    clock.advance(Duration::days(30));

    assert_eq!(
        ledger.rotate(&issued.secret).await.unwrap_err(),
        AppError::Refresh(RefreshError::Expired)
    );
    let family = ledger.family(issued.record.family_id).await.unwrap();
    assert_eq!(family.len(), 1);
    assert_eq!(family[0].revoked_at, Some(clock.now()));
}

#[tokio::test]
async fn unknown_secret_is_not_found() {
    let (ledger, _) = spawn_ledger();
    ledger.mint(Uuid::new_v4()).await.unwrap();

    for presented in ["", "definitely-not-issued", "\u{0000}"] {
        assert_eq!(
            ledger.rotate(presented).await.unwrap_err(),
            AppError::Refresh(RefreshError::NotFound)
        );
    }
}

#[tokio::test]
async fn device_logout_leaves_other_families_alone() {
    let (ledger, _) = spawn_ledger();
    let subject = Uuid::new_v4();
    let laptop = ledger.mint(subject).await.unwrap();
    let phone = ledger.mint(subject).await.unwrap();

    let revoked = ledger
        .revoke(subject, RevokeTarget::Family(laptop.record.family_id))
        .await
        .unwrap();

    assert_eq!(revoked, 1);
    assert!(ledger.inspect(&laptop.secret).await.is_err());
    assert!(ledger.rotate(&phone.secret).await.is_ok());
}

#[tokio::test]
async fn revoking_someone_elses_record_is_refused() {
    let (ledger, _) = spawn_ledger();
    let issued = ledger.mint(Uuid::new_v4()).await.unwrap();

    assert_eq!(
        ledger
            .revoke(Uuid::new_v4(), RevokeTarget::Record(issued.record.id))
            .await
            .unwrap_err(),
        AppError::Refresh(RefreshError::NotFound)
    );
    assert!(ledger.inspect(&issued.secret).await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_rotation_of_one_secret_succeeds_once() {
    let (ledger, _) = spawn_ledger();
    let ledger = Arc::new(ledger);
    let issued = ledger.mint(Uuid::new_v4()).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let ledger = ledger.clone();
        let secret = issued.secret.clone();
        handles.push(tokio::spawn(async move { ledger.rotate(&secret).await }));
    }

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.expect("rotation task panicked") {
            Ok(_) => succeeded += 1,
            Err(e) => assert!(
                matches!(e, AppError::Refresh(RefreshError::Reused { .. })),
                "unexpected error {:?}",
                e
            ),
        }
    }

    assert_eq!(succeeded, 1);
}

#[tokio::test]
async fn service_refresh_reports_reuse_as_security_event() {
    let service = spawn_service();
    service
        .register("john@example.com", "SecurePass123")
        .await
        .unwrap();
    let pair = service
        .login("john@example.com", "SecurePass123")
        .await
        .unwrap();

    let rotated = service.refresh(&pair.refresh_token).await.unwrap();
    assert_ne!(rotated.refresh_token, pair.refresh_token);
    assert!(service.authenticate(&rotated.access_token).is_ok());

    match service.refresh(&pair.refresh_token).await {
        Err(AppError::Refresh(e)) => assert!(e.is_security_event()),
        other => panic!("expected reuse, got {:?}", other),
    }
    assert!(service.refresh(&rotated.refresh_token).await.is_err());
}
