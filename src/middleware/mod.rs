/// Middleware module
///
/// actix-web middleware for the host application's HTTP boundary.

mod bearer;

pub use bearer::{BearerAuth, BearerAuthService};
