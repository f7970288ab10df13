//! Credential core for web applications: password hashing, short-lived
//! access tokens, rotating refresh tokens with reuse detection, and the
//! per-session CSRF and flash helpers.
//!
//! The crate has no server of its own. Hosts wire `auth::AuthService` and the
//! session helpers into their handlers and mount `middleware::BearerAuth`
//! in front of protected routes.

pub mod auth;
pub mod clock;
pub mod configuration;
pub mod error;
pub mod middleware;
pub mod session;
pub mod storage;
pub mod telemetry;
pub mod validators;
