/// Authentication module
///
/// Credential hashing, access token signing/verification, the refresh token
/// ledger, and the service that composes them into login flows.

mod claims;
mod hasher;
mod jwt;
mod principal;
mod refresh_token;
mod service;

pub use claims::{Claims, ACCESS_TOKEN_TYPE};
pub use hasher::{CredentialHasher, PasswordHasher, TokenDigest};
pub use jwt::{AccessTokenCodec, VerifiedAccess};
pub use principal::{Principal, PrincipalStore, Role};
pub use refresh_token::{
    generate_refresh_secret, IssuedRefreshToken, RecordState, RefreshTokenLedger,
    RefreshTokenRecord, RefreshTokenStore, RevokeTarget, REFRESH_SECRET_LENGTH,
};
pub use service::{AuthService, LockoutPolicy, TokenPair};
