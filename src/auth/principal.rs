/// Principals as seen by the authentication core
///
/// The principal store belongs to the host application; this core reads
/// principals, creates them on registration, and maintains the lockout
/// counters.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{DatabaseError, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Standard,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Standard => "standard",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "standard" => Ok(Role::Standard),
            "admin" => Ok(Role::Admin),
            _ => Err(ValidationError::InvalidFormat("role".to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: Uuid,
    /// Canonical (lower-cased) email
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub is_active: bool,
    pub failed_login_attempts: i32,
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Principal {
    pub fn new(email: String, password_hash: String, role: Role, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email,
            password_hash,
            role,
            is_active: true,
            failed_login_attempts: 0,
            locked_until: None,
            created_at: now,
        }
    }

    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.locked_until, Some(until) if until > now)
    }
}

#[async_trait]
pub trait PrincipalStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<Principal>, DatabaseError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Principal>, DatabaseError>;

    /// # Errors
    /// `UniqueConstraintViolation` when the email is already registered
    async fn create(&self, principal: &Principal) -> Result<(), DatabaseError>;

    /// Increments the consecutive-failure counter and returns the new value
    async fn record_login_failure(&self, id: Uuid) -> Result<i32, DatabaseError>;

    /// Locks the principal and resets the failure counter
    async fn lock_until(&self, id: Uuid, until: DateTime<Utc>) -> Result<(), DatabaseError>;

    /// Clears the failure counter and any lock
    async fn record_login_success(&self, id: Uuid) -> Result<(), DatabaseError>;
}
