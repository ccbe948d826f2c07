/// Discovery endpoints under /.well-known/
use crate::context::AppContext;
use crate::error::{PdsError, PdsResult};
use axum::{
    extract::State,
    http::HeaderMap,
    routing::get,
    Json, Router,
};

/// did:web document for the server itself
async fn did_json(State(ctx): State<AppContext>) -> Json<serde_json::Value> {
    let did = &ctx.config.service.did;
    Json(serde_json::json!({
        "@context": ["https://www.w3.org/ns/did/v1"],
        "id": did,
        "service": [{
            "id": "#atproto_pds",
            "type": "AtprotoPersonalDataServer",
            "serviceEndpoint": ctx.public_url(),
        }],
    }))
}

/// Handle to DID lookup: the handle is the Host the request arrived on.
async fn atproto_did(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
) -> PdsResult<String> {
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(':').next().unwrap_or(v).to_string())
        .ok_or_else(|| PdsError::InvalidRequest("missing host header".to_string()))?;

    if host == ctx.config.service.hostname {
        return Ok(ctx.config.service.did.clone());
    }

    ctx.accounts.resolve_handle(&host).await
}

/// OAuth authorization server metadata
async fn oauth_authorization_server(State(ctx): State<AppContext>) -> Json<serde_json::Value> {
    let issuer = ctx.public_url();
    Json(serde_json::json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{}/oauth/authorize", issuer),
        "token_endpoint": format!("{}/oauth/token", issuer),
        "pushed_authorization_request_endpoint": format!("{}/oauth/par", issuer),
        "jwks_uri": format!("{}/oauth/jwks", issuer),
        "require_pushed_authorization_requests": true,
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "refresh_token"],
        "token_endpoint_auth_methods_supported": ["none", "private_key_jwt"],
        "token_endpoint_auth_signing_alg_values_supported": ["ES256"],
        "dpop_signing_alg_values_supported": ["ES256"],
        "code_challenge_methods_supported": ["S256"],
        "scopes_supported": ["atproto", "transition:generic", "transition:chat.bsky"],
        "authorization_response_iss_parameter_supported": true,
        "client_id_metadata_document_supported": true,
    }))
}

/// OAuth protected resource metadata
async fn oauth_protected_resource(State(ctx): State<AppContext>) -> Json<serde_json::Value> {
    let issuer = ctx.public_url();
    Json(serde_json::json!({
        "resource": issuer,
        "authorization_servers": [issuer],
        "scopes_supported": [],
        "bearer_methods_supported": ["header"],
        "resource_documentation": "https://atproto.com",
    }))
}

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/.well-known/did.json", get(did_json))
        .route("/.well-known/atproto-did", get(atproto_did))
        .route(
            "/.well-known/oauth-authorization-server",
            get(oauth_authorization_server),
        )
        .route(
            "/.well-known/oauth-protected-resource",
            get(oauth_protected_resource),
        )
}
