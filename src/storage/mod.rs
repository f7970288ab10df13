/// Store implementations
///
/// - `postgres`: sqlx-backed principal and refresh token stores
/// - `memory`: in-process versions of every store, including sessions

pub mod memory;
pub mod postgres;

pub use memory::{InMemoryPrincipalStore, InMemoryRefreshTokenStore, InMemorySessionStore};
pub use postgres::{PgPrincipalStore, PgRefreshTokenStore};
