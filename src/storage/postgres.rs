/// Postgres-backed stores
///
/// Schema lives in `migrations/`. The refresh token table is only mutated
/// through `rotate` and the `revoke*` methods; `rotate` is a single
/// transaction whose conditional UPDATE serialises concurrent rotations of
/// the same row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::{Principal, PrincipalStore, RefreshTokenRecord, RefreshTokenStore, Role};
use crate::error::DatabaseError;

type RefreshTokenRow = (
    Uuid,
    Uuid,
    String,
    Uuid,
    DateTime<Utc>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    Option<Uuid>,
);

const REFRESH_TOKEN_COLUMNS: &str =
    "id, subject_id, token_hash, family_id, created_at, expires_at, revoked_at, replaced_by_id";

fn to_record(row: RefreshTokenRow) -> RefreshTokenRecord {
    let (id, subject_id, token_hash, family_id, created_at, expires_at, revoked_at, replaced_by_id) = row;
    RefreshTokenRecord {
        id,
        subject_id,
        token_hash,
        family_id,
        created_at,
        expires_at,
        revoked_at,
        replaced_by_id,
    }
}

#[derive(Clone)]
pub struct PgRefreshTokenStore {
    pool: PgPool,
}

impl PgRefreshTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RefreshTokenStore for PgRefreshTokenStore {
    async fn insert(&self, record: &RefreshTokenRecord) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO refresh_tokens
                (id, subject_id, token_hash, family_id, created_at, expires_at, revoked_at, replaced_by_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.id)
        .bind(record.subject_id)
        .bind(&record.token_hash)
        .bind(record.family_id)
        .bind(record.created_at)
        .bind(record.expires_at)
        .bind(record.revoked_at)
        .bind(record.replaced_by_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshTokenRecord>, DatabaseError> {
        let row = sqlx::query_as::<_, RefreshTokenRow>(&format!(
            "SELECT {} FROM refresh_tokens WHERE token_hash = $1",
            REFRESH_TOKEN_COLUMNS
        ))
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(to_record))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<RefreshTokenRecord>, DatabaseError> {
        let row = sqlx::query_as::<_, RefreshTokenRow>(&format!(
            "SELECT {} FROM refresh_tokens WHERE id = $1",
            REFRESH_TOKEN_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(to_record))
    }

    async fn find_family(&self, family_id: Uuid) -> Result<Vec<RefreshTokenRecord>, DatabaseError> {
        let rows = sqlx::query_as::<_, RefreshTokenRow>(&format!(
            "SELECT {} FROM refresh_tokens WHERE family_id = $1 ORDER BY seq",
            REFRESH_TOKEN_COLUMNS
        ))
        .bind(family_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(to_record).collect())
    }

    async fn rotate(
        &self,
        current_id: Uuid,
        successor: &RefreshTokenRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO refresh_tokens
                (id, subject_id, token_hash, family_id, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(successor.id)
        .bind(successor.subject_id)
        .bind(&successor.token_hash)
        .bind(successor.family_id)
        .bind(successor.created_at)
        .bind(successor.expires_at)
        .execute(&mut tx)
        .await?;

        // The row lock taken here makes a concurrent rotation wait, then
        // re-evaluate the predicate and match nothing.
        let updated = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET replaced_by_id = $1
            WHERE id = $2
              AND revoked_at IS NULL
              AND replaced_by_id IS NULL
              AND expires_at > $3
            "#,
        )
        .bind(successor.id)
        .bind(current_id)
        .bind(now)
        .execute(&mut tx)
        .await?;

        if updated.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn revoke(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked_at = $1 WHERE id = $2 AND revoked_at IS NULL",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn revoke_family(
        &self,
        subject_id: Uuid,
        family_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET revoked_at = $1
            WHERE subject_id = $2 AND family_id = $3 AND revoked_at IS NULL
            "#,
        )
        .bind(now)
        .bind(subject_id)
        .bind(family_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn revoke_subject(&self, subject_id: Uuid, now: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked_at = $1 WHERE subject_id = $2 AND revoked_at IS NULL",
        )
        .bind(now)
        .bind(subject_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

type PrincipalRow = (
    Uuid,
    String,
    String,
    String,
    bool,
    i32,
    Option<DateTime<Utc>>,
    DateTime<Utc>,
);

const PRINCIPAL_COLUMNS: &str =
    "id, email, password_hash, role, is_active, failed_login_attempts, locked_until, created_at";

fn to_principal(row: PrincipalRow) -> Result<Principal, DatabaseError> {
    let (id, email, password_hash, role, is_active, failed_login_attempts, locked_until, created_at) = row;
    let role = role
        .parse::<Role>()
        .map_err(|_| DatabaseError::UnexpectedError(format!("unknown role {:?} for {}", role, id)))?;

    Ok(Principal {
        id,
        email,
        password_hash,
        role,
        is_active,
        failed_login_attempts,
        locked_until,
        created_at,
    })
}

#[derive(Clone)]
pub struct PgPrincipalStore {
    pool: PgPool,
}

impl PgPrincipalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PrincipalStore for PgPrincipalStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<Principal>, DatabaseError> {
        let row = sqlx::query_as::<_, PrincipalRow>(&format!(
            "SELECT {} FROM principals WHERE email = $1",
            PRINCIPAL_COLUMNS
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        row.map(to_principal).transpose()
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Principal>, DatabaseError> {
        let row = sqlx::query_as::<_, PrincipalRow>(&format!(
            "SELECT {} FROM principals WHERE id = $1",
            PRINCIPAL_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(to_principal).transpose()
    }

    async fn create(&self, principal: &Principal) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO principals
                (id, email, password_hash, role, is_active, failed_login_attempts, locked_until, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(principal.id)
        .bind(&principal.email)
        .bind(&principal.password_hash)
        .bind(principal.role.as_str())
        .bind(principal.is_active)
        .bind(principal.failed_login_attempts)
        .bind(principal.locked_until)
        .bind(principal.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_login_failure(&self, id: Uuid) -> Result<i32, DatabaseError> {
        sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE principals
            SET failed_login_attempts = failed_login_attempts + 1
            WHERE id = $1
            RETURNING failed_login_attempts
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("principal {}", id)))
    }

    async fn lock_until(&self, id: Uuid, until: DateTime<Utc>) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE principals SET locked_until = $1, failed_login_attempts = 0 WHERE id = $2",
        )
        .bind(until)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_login_success(&self, id: Uuid) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE principals SET locked_until = NULL, failed_login_attempts = 0 WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
