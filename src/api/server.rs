/// com.atproto.server.* handlers, plus identity and actor preferences.
use crate::account::manager::CreateAccountParams;
use crate::account::session::{SCOPE_ACCESS, SCOPE_APP_PASSWORD};
use crate::api::middleware::{AdminAuthContext, AuthContext, FullAuthContext};
use crate::context::AppContext;
use crate::error::{PdsError, PdsResult};
use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccountRequest {
    pub handle: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub invite_code: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub access_jwt: String,
    pub refresh_jwt: String,
    pub handle: String,
    pub did: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

async fn create_account(
    State(ctx): State<AppContext>,
    Json(req): Json<CreateAccountRequest>,
) -> PdsResult<Json<SessionResponse>> {
    let account = ctx
        .accounts
        .create_account(CreateAccountParams {
            handle: req.handle,
            email: req.email,
            password: req.password,
            invite_code: req.invite_code,
        })
        .await?;

    let session = ctx
        .sessions
        .create_session(&account.repo.did, SCOPE_ACCESS)
        .await?;

    Ok(Json(SessionResponse {
        access_jwt: session.access_jwt,
        refresh_jwt: session.refresh_jwt,
        handle: account.handle,
        did: account.repo.did,
        active: Some(true),
        status: None,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub identifier: String,
    pub password: String,
}

async fn create_session(
    State(ctx): State<AppContext>,
    Json(req): Json<CreateSessionRequest>,
) -> PdsResult<Json<SessionResponse>> {
    let (account, is_app_password) = ctx.accounts.login(&req.identifier, &req.password).await?;

    let scope = if is_app_password {
        SCOPE_APP_PASSWORD
    } else {
        SCOPE_ACCESS
    };
    let session = ctx.sessions.create_session(&account.repo.did, scope).await?;

    Ok(Json(SessionResponse {
        access_jwt: session.access_jwt,
        refresh_jwt: session.refresh_jwt,
        handle: account.handle,
        did: account.repo.did.clone(),
        active: Some(account.repo.active()),
        status: account.repo.status().map(|s| s.to_string()),
    }))
}

async fn refresh_session(
    State(ctx): State<AppContext>,
    headers: axum::http::HeaderMap,
) -> PdsResult<Json<SessionResponse>> {
    let token = bearer_token(&headers)?;
    let (did, session) = ctx.sessions.refresh_session(&token).await?;
    let account = ctx.accounts.get_repo_actor_by_did(&did).await?;

    Ok(Json(SessionResponse {
        access_jwt: session.access_jwt,
        refresh_jwt: session.refresh_jwt,
        handle: account.handle,
        did,
        active: Some(account.repo.active()),
        status: account.repo.status().map(|s| s.to_string()),
    }))
}

async fn delete_session(
    State(ctx): State<AppContext>,
    headers: axum::http::HeaderMap,
) -> PdsResult<Json<serde_json::Value>> {
    let token = bearer_token(&headers)?;
    ctx.sessions.delete_session(&token).await?;
    Ok(Json(serde_json::json!({})))
}

async fn get_session(
    State(ctx): State<AppContext>,
    auth: AuthContext,
) -> PdsResult<Json<serde_json::Value>> {
    let account = ctx.accounts.get_repo_actor_by_did(&auth.did).await?;
    Ok(Json(serde_json::json!({
        "did": account.repo.did,
        "handle": account.handle,
        "email": account.repo.email,
        "emailConfirmed": account.repo.email_confirmed_at.is_some(),
        "active": account.repo.active(),
        "status": account.repo.status(),
    })))
}

async fn describe_server(State(ctx): State<AppContext>) -> Json<serde_json::Value> {
    let config = &ctx.config;
    Json(serde_json::json!({
        "did": config.service.did,
        "availableUserDomains": [format!(".{}", config.service.hostname)],
        "inviteCodeRequired": config.invites.required,
        "links": {},
        "contact": { "email": config.service.contact_email },
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetServiceAuthParams {
    pub aud: String,
    #[serde(default)]
    pub lxm: Option<String>,
    #[serde(default)]
    pub exp: Option<i64>,
}

/// Service-auth tokens are ES256K JWTs signed by the account's repo key.
async fn get_service_auth(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    Query(params): Query<GetServiceAuthParams>,
) -> PdsResult<Json<serde_json::Value>> {
    let account = ctx.accounts.get_repo_actor_by_did(&auth.did).await?;
    let key = crate::account::AccountManager::signing_key(&account.repo)?;

    let now = Utc::now().timestamp();
    let exp = params.exp.unwrap_or(now + 60);
    if exp > now + 3600 {
        return Err(PdsError::InvalidRequest(
            "expiration too far in the future".to_string(),
        ));
    }

    let mut claims = serde_json::json!({
        "iss": auth.did,
        "aud": params.aud,
        "iat": now,
        "exp": exp,
        "jti": hex::encode(rand::random::<[u8; 16]>()),
    });
    if let Some(lxm) = params.lxm {
        claims["lxm"] = lxm.into();
    }

    Ok(Json(serde_json::json!({ "token": key.sign_jwt(&claims)? })))
}

async fn activate_account(
    State(ctx): State<AppContext>,
    auth: FullAuthContext,
) -> PdsResult<Json<serde_json::Value>> {
    ctx.accounts.set_deactivated(&auth.0.did, false).await?;
    Ok(Json(serde_json::json!({})))
}

async fn deactivate_account(
    State(ctx): State<AppContext>,
    auth: FullAuthContext,
) -> PdsResult<Json<serde_json::Value>> {
    ctx.accounts.set_deactivated(&auth.0.did, true).await?;
    Ok(Json(serde_json::json!({})))
}

async fn check_account_status(
    State(ctx): State<AppContext>,
    auth: AuthContext,
) -> PdsResult<Json<serde_json::Value>> {
    let account = ctx.accounts.get_repo_actor_by_did(&auth.did).await?;

    let (record_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM records WHERE did = ?")
        .bind(&auth.did)
        .fetch_one(ctx.db.reader())
        .await
        .map_err(PdsError::Database)?;
    let (block_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM blocks WHERE did = ?")
        .bind(&auth.did)
        .fetch_one(ctx.db.reader())
        .await
        .map_err(PdsError::Database)?;
    let (blob_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM blobs WHERE did = ?")
        .bind(&auth.did)
        .fetch_one(ctx.db.reader())
        .await
        .map_err(PdsError::Database)?;

    let root = libipld::Cid::try_from(account.repo.root.as_slice())
        .map_err(|e| PdsError::Repo(format!("stored root is invalid: {}", e)))?;

    Ok(Json(serde_json::json!({
        "activated": account.repo.active(),
        "validDid": true,
        "repoCommit": root.to_string(),
        "repoRev": account.repo.rev,
        "repoBlocks": block_count,
        "indexedRecords": record_count,
        "expectedBlobs": blob_count,
        "importedBlobs": blob_count,
    })))
}

#[derive(Debug, Deserialize)]
pub struct DeleteAccountRequest {
    pub did: String,
    pub password: String,
}

async fn delete_account(
    State(ctx): State<AppContext>,
    Json(req): Json<DeleteAccountRequest>,
) -> PdsResult<Json<serde_json::Value>> {
    let (account, is_app_password) = ctx.accounts.login(&req.did, &req.password).await?;
    if is_app_password {
        return Err(PdsError::AuthRequired(
            "app passwords cannot delete the account".to_string(),
        ));
    }

    ctx.sessions.revoke_all(&account.repo.did).await?;
    let deletion = ctx.accounts.delete_account(&account.repo.did).await?;
    ctx.blob_store.run_cleanups(deletion.s3_blobs).await;

    Ok(Json(serde_json::json!({})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInviteCodeRequest {
    #[serde(default = "default_use_count")]
    pub use_count: i64,
    #[serde(default)]
    pub for_account: Option<String>,
}

fn default_use_count() -> i64 {
    1
}

async fn create_invite_code(
    State(ctx): State<AppContext>,
    _admin: AdminAuthContext,
    Json(req): Json<CreateInviteCodeRequest>,
) -> PdsResult<Json<serde_json::Value>> {
    let owner = req.for_account.unwrap_or_else(|| "admin".to_string());
    let code = ctx.accounts.create_invite_code(&owner, req.use_count).await?;
    Ok(Json(serde_json::json!({ "code": code })))
}

#[derive(Debug, Deserialize)]
pub struct ReserveSigningKeyRequest {
    #[serde(default)]
    pub did: Option<String>,
}

async fn reserve_signing_key(
    State(ctx): State<AppContext>,
    Json(req): Json<ReserveSigningKeyRequest>,
) -> PdsResult<Json<serde_json::Value>> {
    let key_did = ctx.accounts.reserve_signing_key(req.did.as_deref()).await?;
    Ok(Json(serde_json::json!({ "signingKey": key_did })))
}

#[derive(Debug, Deserialize)]
pub struct CreateAppPasswordRequest {
    pub name: String,
    #[serde(default)]
    pub privileged: bool,
}

async fn create_app_password(
    State(ctx): State<AppContext>,
    auth: FullAuthContext,
    Json(req): Json<CreateAppPasswordRequest>,
) -> PdsResult<Json<serde_json::Value>> {
    let password = ctx
        .accounts
        .create_app_password(&auth.0.did, &req.name, req.privileged)
        .await?;
    Ok(Json(serde_json::json!({
        "name": req.name,
        "password": password,
        "createdAt": Utc::now().to_rfc3339(),
        "privileged": req.privileged,
    })))
}

async fn list_app_passwords(
    State(ctx): State<AppContext>,
    auth: AuthContext,
) -> PdsResult<Json<serde_json::Value>> {
    let passwords = ctx.accounts.list_app_passwords(&auth.did).await?;
    Ok(Json(serde_json::json!({
        "passwords": passwords
            .into_iter()
            .map(|p| serde_json::json!({
                "name": p.name,
                "createdAt": p.created_at.to_rfc3339(),
                "privileged": p.privileged,
            }))
            .collect::<Vec<_>>(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct RevokeAppPasswordRequest {
    pub name: String,
}

async fn revoke_app_password(
    State(ctx): State<AppContext>,
    auth: FullAuthContext,
    Json(req): Json<RevokeAppPasswordRequest>,
) -> PdsResult<Json<serde_json::Value>> {
    ctx.accounts.revoke_app_password(&auth.0.did, &req.name).await?;
    Ok(Json(serde_json::json!({})))
}

#[derive(Debug, Deserialize)]
pub struct ResolveHandleParams {
    pub handle: String,
}

async fn resolve_handle(
    State(ctx): State<AppContext>,
    Query(params): Query<ResolveHandleParams>,
) -> PdsResult<Json<serde_json::Value>> {
    let did = ctx.accounts.resolve_handle(&params.handle).await?;
    Ok(Json(serde_json::json!({ "did": did })))
}

#[derive(Debug, Deserialize)]
pub struct UpdateHandleRequest {
    pub handle: String,
}

async fn update_handle(
    State(ctx): State<AppContext>,
    auth: FullAuthContext,
    Json(req): Json<UpdateHandleRequest>,
) -> PdsResult<Json<serde_json::Value>> {
    ctx.accounts.update_handle(&auth.0.did, &req.handle).await?;
    Ok(Json(serde_json::json!({})))
}

async fn get_preferences(
    State(ctx): State<AppContext>,
    auth: AuthContext,
) -> PdsResult<Json<serde_json::Value>> {
    Ok(Json(ctx.accounts.get_preferences(&auth.did).await?))
}

async fn put_preferences(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    Json(preferences): Json<serde_json::Value>,
) -> PdsResult<Json<serde_json::Value>> {
    ctx.accounts.put_preferences(&auth.did, &preferences).await?;
    Ok(Json(serde_json::json!({})))
}

fn bearer_token(headers: &axum::http::HeaderMap) -> PdsResult<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
        .ok_or_else(|| PdsError::AuthRequired("missing bearer token".to_string()))
}

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/xrpc/com.atproto.server.createAccount", post(create_account))
        .route("/xrpc/com.atproto.server.createSession", post(create_session))
        .route("/xrpc/com.atproto.server.refreshSession", post(refresh_session))
        .route("/xrpc/com.atproto.server.deleteSession", post(delete_session))
        .route("/xrpc/com.atproto.server.getSession", get(get_session))
        .route("/xrpc/com.atproto.server.describeServer", get(describe_server))
        .route("/xrpc/com.atproto.server.getServiceAuth", get(get_service_auth))
        .route("/xrpc/com.atproto.server.activateAccount", post(activate_account))
        .route("/xrpc/com.atproto.server.deactivateAccount", post(deactivate_account))
        .route("/xrpc/com.atproto.server.checkAccountStatus", get(check_account_status))
        .route("/xrpc/com.atproto.server.deleteAccount", post(delete_account))
        .route("/xrpc/com.atproto.server.createInviteCode", post(create_invite_code))
        .route("/xrpc/com.atproto.server.reserveSigningKey", post(reserve_signing_key))
        .route("/xrpc/com.atproto.server.createAppPassword", post(create_app_password))
        .route("/xrpc/com.atproto.server.listAppPasswords", get(list_app_passwords))
        .route("/xrpc/com.atproto.server.revokeAppPassword", post(revoke_app_password))
        .route("/xrpc/com.atproto.identity.resolveHandle", get(resolve_handle))
        .route("/xrpc/com.atproto.identity.updateHandle", post(update_handle))
        .route("/xrpc/app.bsky.actor.getPreferences", get(get_preferences))
        .route("/xrpc/app.bsky.actor.putPreferences", post(put_preferences))
}
