/// Error Handling Module
///
/// One error type per concern, all folding into `AppError`:
/// 1. Domain-specific errors (validation, database, configuration, session)
/// 2. Credential errors (login, access token, refresh token)
/// 3. HTTP mapping for the host web layer
/// 4. Structured error logging with context

use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use chrono::{DateTime, Utc};
use std::error::Error as StdError;
use std::fmt;
use uuid::Uuid;

// ============================================================================
// 1. DOMAIN-SPECIFIC ERROR TYPES
// ============================================================================

/// Validation errors for input data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    EmptyField(String),
    TooShort(String, usize),
    TooLong(String, usize),
    InvalidFormat(String),
    WeakPassword(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::EmptyField(field) => write!(f, "{} is empty", field),
            ValidationError::TooShort(field, min) => {
                write!(f, "{} is too short (minimum {} characters)", field, min)
            }
            ValidationError::TooLong(field, max) => {
                write!(f, "{} is too long (maximum {} characters)", field, max)
            }
            ValidationError::InvalidFormat(field) => write!(f, "{} has invalid format", field),
            ValidationError::WeakPassword(reason) => write!(f, "password {}", reason),
        }
    }
}

impl StdError for ValidationError {}

/// Persistence errors raised by the ledger and principal stores
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseError {
    UniqueConstraintViolation(String),
    NotFound(String),
    QueryExecution(String),
    ConnectionPool(String),
    UnexpectedError(String),
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseError::UniqueConstraintViolation(msg) => {
                write!(f, "Duplicate entry: {}", msg)
            }
            DatabaseError::NotFound(msg) => write!(f, "Not found: {}", msg),
            DatabaseError::QueryExecution(msg) => write!(f, "Query error: {}", msg),
            DatabaseError::ConnectionPool(msg) => write!(f, "Database connection error: {}", msg),
            DatabaseError::UnexpectedError(msg) => write!(f, "Database error: {}", msg),
        }
    }
}

impl StdError for DatabaseError {}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound("Record not found".to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DatabaseError::ConnectionPool(err.to_string())
            }
            sqlx::Error::Database(db_err) => {
                // 23505 = unique_violation
                if db_err.code().as_deref() == Some("23505") {
                    DatabaseError::UniqueConstraintViolation(db_err.message().to_string())
                } else {
                    DatabaseError::QueryExecution(db_err.message().to_string())
                }
            }
            _ => DatabaseError::UnexpectedError(err.to_string()),
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    MissingRequired(String),
    InvalidValue(String),
    ParseError(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingRequired(msg) => write!(f, "Missing required config: {}", msg),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config value: {}", msg),
            ConfigError::ParseError(msg) => write!(f, "Config parse error: {}", msg),
        }
    }
}

impl StdError for ConfigError {}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        match err {
            config::ConfigError::NotFound(key) => ConfigError::MissingRequired(key),
            other => ConfigError::ParseError(other.to_string()),
        }
    }
}

/// Session store errors (CSRF and flash state)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    Store(String),
    Corrupt(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Store(msg) => write!(f, "Session store error: {}", msg),
            SessionError::Corrupt(key) => write!(f, "Session value for {} is corrupt", key),
        }
    }
}

impl StdError for SessionError {}

// ============================================================================
// 2. CREDENTIAL ERRORS
// ============================================================================

/// Authentication and authorization errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Unknown email and wrong password are deliberately the same value.
    InvalidCredentials,
    AccountInactive,
    AccountLocked { until: DateTime<Utc> },
    /// CSRF token missing or mismatched.
    Forbidden,
    InsufficientRole,
    MissingToken,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::InvalidCredentials => write!(f, "Invalid credentials"),
            AuthError::AccountInactive => write!(f, "Account is inactive"),
            AuthError::AccountLocked { until } => {
                write!(f, "Account locked until {}", until.to_rfc3339())
            }
            AuthError::Forbidden => write!(f, "Forbidden"),
            AuthError::InsufficientRole => write!(f, "Insufficient role"),
            AuthError::MissingToken => write!(f, "Missing authentication token"),
        }
    }
}

impl StdError for AuthError {}

/// Access token verification failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    Expired,
    Malformed,
    BadSignature,
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenError::Expired => write!(f, "Access token has expired"),
            TokenError::Malformed => write!(f, "Access token is malformed"),
            TokenError::BadSignature => write!(f, "Access token signature is invalid"),
        }
    }
}

impl StdError for TokenError {}

/// Refresh token rotation failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    NotFound,
    Expired,
    /// A consumed or revoked secret was presented again. The whole family
    /// has been revoked by the time this is returned.
    Reused { subject_id: Uuid, family_id: Uuid },
}

impl RefreshError {
    /// True when the host must treat the failure as a security event.
    pub fn is_security_event(&self) -> bool {
        matches!(self, RefreshError::Reused { .. })
    }
}

impl fmt::Display for RefreshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshError::NotFound => write!(f, "Refresh token not found"),
            RefreshError::Expired => write!(f, "Refresh token has expired"),
            RefreshError::Reused { family_id, .. } => {
                write!(f, "Refresh token reuse detected in family {}", family_id)
            }
        }
    }
}

impl StdError for RefreshError {}

// ============================================================================
// 3. UNIFIED APPLICATION ERROR TYPE
// ============================================================================

/// Central error type returned by every public operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    Validation(ValidationError),
    Database(DatabaseError),
    Config(ConfigError),
    Session(SessionError),
    Auth(AuthError),
    Token(TokenError),
    Refresh(RefreshError),
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Validation(e) => write!(f, "{}", e),
            AppError::Database(e) => write!(f, "{}", e),
            AppError::Config(e) => write!(f, "{}", e),
            AppError::Session(e) => write!(f, "{}", e),
            AppError::Auth(e) => write!(f, "{}", e),
            AppError::Token(e) => write!(f, "{}", e),
            AppError::Refresh(e) => write!(f, "{}", e),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl StdError for AppError {}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError::Validation(err)
    }
}

impl From<DatabaseError> for AppError {
    fn from(err: DatabaseError) -> Self {
        AppError::Database(err)
    }
}

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        AppError::Config(err)
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        AppError::Session(err)
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        AppError::Auth(err)
    }
}

impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        AppError::Token(err)
    }
}

impl From<RefreshError> for AppError {
    fn from(err: RefreshError) -> Self {
        AppError::Refresh(err)
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err.into())
    }
}

// ============================================================================
// 4. HTTP RESPONSE MAPPING
// ============================================================================

/// Error response structure for HTTP responses
#[derive(Debug, serde::Serialize)]
pub struct ErrorResponse {
    /// Unique error ID for tracking
    pub error_id: String,
    /// Human-readable error message
    pub message: String,
    /// Error code for client-side handling
    pub code: String,
    /// HTTP status code
    pub status: u16,
    /// Timestamp when error occurred
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(error_id: String, message: String, code: String, status: u16) -> Self {
        Self {
            error_id,
            message,
            code,
            status,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Trait for converting errors to HTTP responses with proper logging
pub trait ErrorHandler {
    fn error_response(&self, request_id: &str) -> (StatusCode, ErrorResponse);
    fn log_error(&self, request_id: &str);
}

impl AppError {
    fn classify(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Validation(e) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string()),

            AppError::Database(e) => match e {
                DatabaseError::UniqueConstraintViolation(_) => {
                    (StatusCode::CONFLICT, "DUPLICATE_ENTRY", e.to_string())
                }
                DatabaseError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", e.to_string()),
                DatabaseError::ConnectionPool(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Database service temporarily unavailable".to_string(),
                ),
                _ => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "Database error occurred".to_string(),
                ),
            },

            AppError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "CONFIG_ERROR",
                "Server configuration error".to_string(),
            ),

            AppError::Session(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "SESSION_ERROR",
                "Session unavailable".to_string(),
            ),

            AppError::Auth(e) => match e {
                AuthError::InvalidCredentials => (
                    StatusCode::UNAUTHORIZED,
                    "INVALID_CREDENTIALS",
                    "Invalid credentials".to_string(),
                ),
                AuthError::MissingToken => (
                    StatusCode::UNAUTHORIZED,
                    "MISSING_TOKEN",
                    "Missing authentication token".to_string(),
                ),
                AuthError::AccountInactive => {
                    (StatusCode::FORBIDDEN, "ACCOUNT_INACTIVE", e.to_string())
                }
                AuthError::AccountLocked { .. } => {
                    (StatusCode::FORBIDDEN, "ACCOUNT_LOCKED", e.to_string())
                }
                AuthError::Forbidden => (
                    StatusCode::FORBIDDEN,
                    "CSRF_MISMATCH",
                    "Invalid CSRF token".to_string(),
                ),
                AuthError::InsufficientRole => {
                    (StatusCode::FORBIDDEN, "INSUFFICIENT_ROLE", e.to_string())
                }
            },

            // Every access token defect looks the same to the client
            AppError::Token(_) => (
                StatusCode::UNAUTHORIZED,
                "TOKEN_INVALID",
                "Invalid or expired token".to_string(),
            ),

            AppError::Refresh(e) => match e {
                RefreshError::Reused { .. } => (
                    StatusCode::UNAUTHORIZED,
                    "SESSION_COMPROMISED",
                    "Session terminated, please sign in again".to_string(),
                ),
                _ => (
                    StatusCode::UNAUTHORIZED,
                    "REFRESH_TOKEN_INVALID",
                    "Invalid or expired refresh token".to_string(),
                ),
            },

            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Internal server error".to_string(),
            ),
        }
    }
}

impl ErrorHandler for AppError {
    fn error_response(&self, request_id: &str) -> (StatusCode, ErrorResponse) {
        let (status, code, message) = self.classify();
        let error_response = ErrorResponse::new(
            request_id.to_string(),
            message,
            code.to_string(),
            status.as_u16(),
        );

        (status, error_response)
    }

    fn log_error(&self, request_id: &str) {
        match self {
            // The ledger already emitted the security event for this reuse
            AppError::Refresh(RefreshError::Reused {
                subject_id,
                family_id,
            }) => {
                tracing::warn!(
                    request_id = request_id,
                    subject_id = %subject_id,
                    family_id = %family_id,
                    "Session terminated after refresh token reuse"
                );
            }
            AppError::Validation(_) | AppError::Auth(_) | AppError::Token(_) | AppError::Refresh(_) => {
                tracing::warn!(
                    request_id = request_id,
                    error = %self,
                    "Request rejected"
                );
            }
            AppError::Database(DatabaseError::UniqueConstraintViolation(_)) => {
                tracing::warn!(
                    request_id = request_id,
                    error = %self,
                    "Duplicate entry attempt"
                );
            }
            AppError::Database(_) | AppError::Config(_) | AppError::Session(_) | AppError::Internal(_) => {
                tracing::error!(
                    request_id = request_id,
                    error = %self,
                    "Internal failure"
                );
            }
        }
    }
}

/// Lets host handlers return `Result<_, AppError>` directly
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let request_id = Uuid::new_v4().to_string();
        self.log_error(&request_id);

        let (status, error_response) = <Self as ErrorHandler>::error_response(self, &request_id);

        HttpResponse::build(status).json(error_response)
    }

    fn status_code(&self) -> StatusCode {
        self.classify().0
    }
}

// ============================================================================
// 5. ERROR CONTEXT ENRICHMENT
// ============================================================================

/// Per-operation context for correlated log lines
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub request_id: String,
    pub subject_id: Option<Uuid>,
    pub operation: String,
    pub timestamp: DateTime<Utc>,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            subject_id: None,
            operation: operation.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_subject_id(mut self, subject_id: Uuid) -> Self {
        self.subject_id = Some(subject_id);
        self
    }

    pub fn log_error(&self, error: &AppError) {
        let subject_id = self.subject_id.map(|id| id.to_string());

        match error {
            AppError::Validation(_) | AppError::Auth(_) | AppError::Token(_) | AppError::Refresh(_) => {
                tracing::warn!(
                    request_id = %self.request_id,
                    operation = %self.operation,
                    subject_id = ?subject_id,
                    error = %error,
                    "Operation rejected"
                );
            }
            _ => {
                tracing::error!(
                    request_id = %self.request_id,
                    operation = %self.operation,
                    subject_id = ?subject_id,
                    error = %error,
                    "Operation failed"
                );
            }
        }
    }
}
