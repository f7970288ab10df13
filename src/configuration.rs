use std::collections::HashSet;

use crate::error::ConfigError;

#[derive(serde::Deserialize, Clone, Debug)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub auth: AuthSettings,
}

#[derive(serde::Deserialize, Clone, Debug)]
pub struct DatabaseSettings {
    pub username: String,
    pub password: String,
    pub port: u16,
    pub host: String,
    pub database_name: String,
}

impl DatabaseSettings {
    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.database_name
        )
    }

    pub fn connection_string_without_db(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}",
            self.username, self.password, self.host, self.port
        )
    }
}

/// One HMAC key the access token codec accepts
#[derive(serde::Deserialize, Clone)]
pub struct SigningKeySettings {
    pub kid: String,
    pub secret: String,
}

// Secrets stay out of debug output.
impl std::fmt::Debug for SigningKeySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeySettings")
            .field("kid", &self.kid)
            .field("secret", &"[redacted]")
            .finish()
    }
}

/// Credential lifetimes, key material and login policy
#[derive(serde::Deserialize, Clone, Debug)]
pub struct AuthSettings {
    pub issuer: String,
    #[serde(default = "default_access_token_ttl")]
    pub access_token_ttl: i64, // seconds
    #[serde(default = "default_refresh_token_ttl")]
    pub refresh_token_ttl: i64, // seconds
    #[serde(default = "default_password_cost")]
    pub password_cost: u32,
    /// First entry signs; the rest are still accepted for verification.
    pub signing_keys: Vec<SigningKeySettings>,
    #[serde(default = "default_lockout_threshold")]
    pub lockout_threshold: i32,
    #[serde(default = "default_lockout_minutes")]
    pub lockout_minutes: i64,
}

pub const MIN_SIGNING_SECRET_LENGTH: usize = 32;

fn default_access_token_ttl() -> i64 {
    15 * 60
}

fn default_refresh_token_ttl() -> i64 {
    30 * 24 * 60 * 60
}

fn default_password_cost() -> u32 {
    bcrypt::DEFAULT_COST
}

fn default_lockout_threshold() -> i32 {
    5
}

fn default_lockout_minutes() -> i64 {
    15
}

impl AuthSettings {
    /// Rejects settings the credential components cannot run safely with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signing_keys.is_empty() {
            return Err(ConfigError::MissingRequired("auth.signing_keys".to_string()));
        }

        let mut seen = HashSet::new();
        for key in &self.signing_keys {
            if key.kid.trim().is_empty() {
                return Err(ConfigError::InvalidValue("signing key id is empty".to_string()));
            }
            if !seen.insert(key.kid.as_str()) {
                return Err(ConfigError::InvalidValue(format!(
                    "duplicate signing key id {}",
                    key.kid
                )));
            }
            if key.secret.len() < MIN_SIGNING_SECRET_LENGTH {
                return Err(ConfigError::InvalidValue(format!(
                    "signing key {} must be at least {} bytes",
                    key.kid, MIN_SIGNING_SECRET_LENGTH
                )));
            }
        }

        if self.access_token_ttl <= 0 || self.refresh_token_ttl <= 0 {
            return Err(ConfigError::InvalidValue("token TTLs must be positive".to_string()));
        }
        if self.access_token_ttl >= self.refresh_token_ttl {
            return Err(ConfigError::InvalidValue(
                "access_token_ttl must be shorter than refresh_token_ttl".to_string(),
            ));
        }
        if !(4..=31).contains(&self.password_cost) {
            return Err(ConfigError::InvalidValue(format!(
                "password_cost {} outside 4..=31",
                self.password_cost
            )));
        }
        if self.lockout_threshold <= 0 || self.lockout_minutes <= 0 {
            return Err(ConfigError::InvalidValue(
                "lockout threshold and duration must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Loads `configuration.{yaml,toml,json}` if present, then `APP__*` overrides
/// (e.g. `APP__AUTH__ACCESS_TOKEN_TTL=600`).
pub fn get_configuration() -> Result<Settings, ConfigError> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name("configuration").required(false))
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("__")
                .separator("__"),
        )
        .build()?;
    let settings = settings.try_deserialize::<Settings>()?;
    settings.auth.validate()?;
    Ok(settings)
}
