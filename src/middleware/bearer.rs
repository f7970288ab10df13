/// Bearer Access Token Middleware
///
/// Verifies the access token from the Authorization header and injects the
/// resulting `VerifiedAccess` into request extensions for route handlers.
/// Rejections go through `AppError`, so clients see the same error body as
/// everywhere else.

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpMessage,
};
use futures::future::LocalBoxFuture;
use std::rc::Rc;
use std::sync::Arc;

use crate::auth::{AccessTokenCodec, Role, VerifiedAccess};
use crate::clock::Clock;
use crate::error::{AppError, AuthError};

/// Guard for routes that require a bearer access token
///
/// Bearer-authenticated requests are not subject to the CSRF check; that
/// guard belongs to cookie-session form posts.
pub struct BearerAuth {
    codec: Arc<AccessTokenCodec>,
    clock: Arc<dyn Clock>,
    required_role: Option<Role>,
}

impl BearerAuth {
    pub fn new(codec: Arc<AccessTokenCodec>, clock: Arc<dyn Clock>) -> Self {
        Self {
            codec,
            clock,
            required_role: None,
        }
    }

    /// Additionally reject valid tokens whose role is not `role`
    pub fn require_role(mut self, role: Role) -> Self {
        self.required_role = Some(role);
        self
    }
}

impl<S, B> Transform<S, ServiceRequest> for BearerAuth
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = BearerAuthService<S>;
    type Future = std::future::Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        std::future::ready(Ok(BearerAuthService {
            service: Rc::new(service),
            codec: self.codec.clone(),
            clock: self.clock.clone(),
            required_role: self.required_role,
        }))
    }
}

pub struct BearerAuthService<S> {
    service: Rc<S>,
    codec: Arc<AccessTokenCodec>,
    clock: Arc<dyn Clock>,
    required_role: Option<Role>,
}

impl<S> BearerAuthService<S> {
    fn authorize(&self, req: &ServiceRequest) -> Result<VerifiedAccess, AppError> {
        let token = bearer_token(req).ok_or(AuthError::MissingToken)?;
        let access = self.codec.verify(token, self.clock.now())?;

        match self.required_role {
            Some(role) if access.role != role => Err(AuthError::InsufficientRole.into()),
            _ => Ok(access),
        }
    }
}

impl<S, B> Service<ServiceRequest> for BearerAuthService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        match self.authorize(&req) {
            Ok(access) => {
                tracing::debug!(
                    subject_id = %access.subject,
                    role = %access.role,
                    "Access token verified"
                );
                req.extensions_mut().insert(access);

                let service = self.service.clone();
                Box::pin(async move { service.call(req).await })
            }
            Err(e) => Box::pin(async move { Err(e.into()) }),
        }
    }
}

fn bearer_token(req: &ServiceRequest) -> Option<&str> {
    req.headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}
