/// In-process stores
///
/// Single-process implementations of the three store contracts. Each store
/// guards its state with one mutex, which makes the ledger's conditional
/// rotation trivially atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::auth::{Principal, PrincipalStore, RefreshTokenRecord, RefreshTokenStore};
use crate::error::{DatabaseError, SessionError};
use crate::session::SessionStore;

fn poisoned(what: &str) -> DatabaseError {
    DatabaseError::UnexpectedError(format!("{} lock poisoned", what))
}

// ============================================================================
// Refresh tokens
// ============================================================================

#[derive(Default)]
struct Ledger {
    // Insertion order doubles as family order
    records: Vec<RefreshTokenRecord>,
    by_id: HashMap<Uuid, usize>,
    by_hash: HashMap<String, usize>,
}

impl Ledger {
    fn push(&mut self, record: &RefreshTokenRecord) -> Result<(), DatabaseError> {
        if self.by_id.contains_key(&record.id) || self.by_hash.contains_key(&record.token_hash) {
            return Err(DatabaseError::UniqueConstraintViolation(
                "refresh token already exists".to_string(),
            ));
        }
        let index = self.records.len();
        self.by_id.insert(record.id, index);
        self.by_hash.insert(record.token_hash.clone(), index);
        self.records.push(record.clone());
        Ok(())
    }

    fn revoke_where<F>(&mut self, now: DateTime<Utc>, matches: F) -> u64
    where
        F: Fn(&RefreshTokenRecord) -> bool,
    {
        let mut count = 0;
        for record in self.records.iter_mut() {
            if record.revoked_at.is_none() && matches(record) {
                record.revoked_at = Some(now);
                count += 1;
            }
        }
        count
    }
}

#[derive(Default)]
pub struct InMemoryRefreshTokenStore {
    inner: Mutex<Ledger>,
}

impl InMemoryRefreshTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Ledger>, DatabaseError> {
        self.inner.lock().map_err(|_| poisoned("refresh token store"))
    }
}

#[async_trait]
impl RefreshTokenStore for InMemoryRefreshTokenStore {
    async fn insert(&self, record: &RefreshTokenRecord) -> Result<(), DatabaseError> {
        self.lock()?.push(record)
    }

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshTokenRecord>, DatabaseError> {
        let ledger = self.lock()?;
        Ok(ledger
            .by_hash
            .get(token_hash)
            .map(|&index| ledger.records[index].clone()))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<RefreshTokenRecord>, DatabaseError> {
        let ledger = self.lock()?;
        Ok(ledger.by_id.get(&id).map(|&index| ledger.records[index].clone()))
    }

    async fn find_family(&self, family_id: Uuid) -> Result<Vec<RefreshTokenRecord>, DatabaseError> {
        Ok(self
            .lock()?
            .records
            .iter()
            .filter(|record| record.family_id == family_id)
            .cloned()
            .collect())
    }

    async fn rotate(
        &self,
        current_id: Uuid,
        successor: &RefreshTokenRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut ledger = self.lock()?;

        let index = match ledger.by_id.get(&current_id) {
            Some(&index) => index,
            None => return Ok(false),
        };
        if !ledger.records[index].is_live(now) {
            return Ok(false);
        }

        ledger.push(successor)?;
        ledger.records[index].replaced_by_id = Some(successor.id);
        Ok(true)
    }

    async fn revoke(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        Ok(self.lock()?.revoke_where(now, |record| record.id == id) == 1)
    }

    async fn revoke_family(
        &self,
        subject_id: Uuid,
        family_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        Ok(self.lock()?.revoke_where(now, |record| {
            record.subject_id == subject_id && record.family_id == family_id
        }))
    }

    async fn revoke_subject(&self, subject_id: Uuid, now: DateTime<Utc>) -> Result<u64, DatabaseError> {
        Ok(self
            .lock()?
            .revoke_where(now, |record| record.subject_id == subject_id))
    }
}

// ============================================================================
// Principals
// ============================================================================

#[derive(Default)]
pub struct InMemoryPrincipalStore {
    principals: Mutex<HashMap<Uuid, Principal>>,
}

impl InMemoryPrincipalStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<Uuid, Principal>>, DatabaseError> {
        self.principals.lock().map_err(|_| poisoned("principal store"))
    }

    /// Host-side administration, e.g. deactivating or promoting an account
    pub fn update<F>(&self, id: Uuid, change: F) -> Result<(), DatabaseError>
    where
        F: FnOnce(&mut Principal),
    {
        let mut principals = self.lock()?;
        let principal = principals
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::NotFound(format!("principal {}", id)))?;
        change(principal);
        Ok(())
    }
}

#[async_trait]
impl PrincipalStore for InMemoryPrincipalStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<Principal>, DatabaseError> {
        Ok(self
            .lock()?
            .values()
            .find(|principal| principal.email == email)
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Principal>, DatabaseError> {
        Ok(self.lock()?.get(&id).cloned())
    }

    async fn create(&self, principal: &Principal) -> Result<(), DatabaseError> {
        let mut principals = self.lock()?;
        if principals
            .values()
            .any(|existing| existing.email == principal.email)
        {
            return Err(DatabaseError::UniqueConstraintViolation(
                "Email already registered".to_string(),
            ));
        }
        principals.insert(principal.id, principal.clone());
        Ok(())
    }

    async fn record_login_failure(&self, id: Uuid) -> Result<i32, DatabaseError> {
        let mut principals = self.lock()?;
        let principal = principals
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::NotFound(format!("principal {}", id)))?;
        principal.failed_login_attempts += 1;
        Ok(principal.failed_login_attempts)
    }

    async fn lock_until(&self, id: Uuid, until: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.update(id, |principal| {
            principal.locked_until = Some(until);
            principal.failed_login_attempts = 0;
        })
    }

    async fn record_login_success(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.update(id, |principal| {
            principal.locked_until = None;
            principal.failed_login_attempts = 0;
        })
    }
}

// ============================================================================
// Sessions
// ============================================================================

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, HashMap<String, String>>>, SessionError> {
        self.sessions
            .lock()
            .map_err(|_| SessionError::Store("session store lock poisoned".to_string()))
    }

    /// Drops every key of the session
    pub fn destroy(&self, session_id: &str) -> Result<(), SessionError> {
        self.lock()?.remove(session_id);
        Ok(())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: &str, key: &str) -> Result<Option<String>, SessionError> {
        Ok(self
            .lock()?
            .get(session_id)
            .and_then(|values| values.get(key))
            .cloned())
    }

    async fn set(&self, session_id: &str, key: &str, value: String) -> Result<(), SessionError> {
        self.lock()?
            .entry(session_id.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn clear(&self, session_id: &str, key: &str) -> Result<(), SessionError> {
        let mut sessions = self.lock()?;
        if let Some(values) = sessions.get_mut(session_id) {
            values.remove(key);
            if values.is_empty() {
                sessions.remove(session_id);
            }
        }
        Ok(())
    }
}
