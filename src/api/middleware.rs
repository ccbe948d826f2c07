/// Authentication extractors.
///
/// Two token families arrive at the XRPC surface: legacy session JWTs as
/// `Bearer`, and DPoP-bound OAuth access tokens as `DPoP` (which must be
/// accompanied by a valid proof over this exact request). Both resolve to
/// the same AuthContext.
use crate::account::session::{SCOPE_ACCESS, SCOPE_APP_PASSWORD};
use crate::context::AppContext;
use crate::error::PdsError;
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// An authenticated caller
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub did: String,
    pub scope: String,
    /// Bearer token the request arrived with (needed for deleteSession)
    pub token: String,
}

impl AuthContext {
    pub fn is_app_password(&self) -> bool {
        self.scope == SCOPE_APP_PASSWORD
    }
}

fn split_auth_header(parts: &Parts) -> Option<(String, String)> {
    let value = parts
        .headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .trim();
    let (scheme, token) = value.split_once(' ')?;
    Some((scheme.to_string(), token.trim().to_string()))
}

#[async_trait]
impl FromRequestParts<AppContext> for AuthContext {
    type Rejection = PdsError;

    async fn from_request_parts(
        parts: &mut Parts,
        ctx: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let (scheme, token) = split_auth_header(parts)
            .ok_or_else(|| PdsError::AuthRequired("missing authorization header".to_string()))?;

        match scheme.to_ascii_lowercase().as_str() {
            "bearer" => {
                let session = ctx.sessions.validate_access_token(&token).await?;
                Ok(AuthContext {
                    did: session.did,
                    scope: session.scope,
                    token,
                })
            }
            "dpop" => {
                let url = format!(
                    "{}{}",
                    ctx.public_url(),
                    parts.uri.path_and_query().map(|p| p.as_str()).unwrap_or("/")
                );
                let proof = ctx.oauth_provider.dpop_manager.check_proof(
                    parts.method.as_str(),
                    &url,
                    &parts.headers,
                    Some(&token),
                )?;
                let session = ctx
                    .oauth_provider
                    .verify_access_token(&token, &proof)
                    .await?;
                Ok(AuthContext {
                    did: session.did,
                    scope: session.scope,
                    token,
                })
            }
            _ => Err(PdsError::AuthRequired(
                "unsupported authorization scheme".to_string(),
            )),
        }
    }
}

/// Full-access auth: app-password sessions are turned away
#[derive(Debug, Clone)]
pub struct FullAuthContext(pub AuthContext);

#[async_trait]
impl FromRequestParts<AppContext> for FullAuthContext {
    type Rejection = PdsError;

    async fn from_request_parts(
        parts: &mut Parts,
        ctx: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let auth = AuthContext::from_request_parts(parts, ctx).await?;
        if auth.is_app_password() {
            return Err(PdsError::AuthRequired(
                "full session required".to_string(),
            ));
        }
        Ok(FullAuthContext(auth))
    }
}

/// Legacy access-token scopes accepted for normal writes
pub fn is_access_scope(scope: &str) -> bool {
    scope == SCOPE_ACCESS || scope == SCOPE_APP_PASSWORD || scope.contains("atproto")
}

/// Admin auth: HTTP basic with the configured admin password
#[derive(Debug, Clone)]
pub struct AdminAuthContext;

#[async_trait]
impl FromRequestParts<AppContext> for AdminAuthContext {
    type Rejection = PdsError;

    async fn from_request_parts(
        parts: &mut Parts,
        ctx: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let (scheme, payload) = split_auth_header(parts)
            .ok_or_else(|| PdsError::AuthRequired("missing authorization header".to_string()))?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return Err(PdsError::AuthRequired("admin auth required".to_string()));
        }

        let decoded = STANDARD
            .decode(payload)
            .map_err(|_| PdsError::AuthRequired("malformed basic auth".to_string()))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| PdsError::AuthRequired("malformed basic auth".to_string()))?;
        let Some((user, password)) = decoded.split_once(':') else {
            return Err(PdsError::AuthRequired("malformed basic auth".to_string()));
        };

        if user != "admin" || password != ctx.config.service.admin_password {
            return Err(PdsError::AuthRequired("bad admin credentials".to_string()));
        }

        Ok(AdminAuthContext)
    }
}
