/// The OAuth HTTP surface: /oauth/par, /oauth/token, /oauth/authorize and
/// /oauth/jwks.
use crate::context::AppContext;
use crate::error::{PdsError, PdsResult};
use crate::models::ParRequestParameters;
use crate::oauth::dpop::Proof;
use crate::oauth::provider::{ParRequest, TokenRequest};
use axum::{
    extract::{Form, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

fn full_url(ctx: &AppContext, path: &str) -> String {
    format!("{}{}", ctx.public_url(), path)
}

/// OAuth endpoints answer errors in the protocol shape, and a nonce
/// challenge always carries a fresh DPoP-Nonce header.
fn oauth_error(ctx: &AppContext, err: PdsError) -> Response {
    match err {
        PdsError::UseDpopNonce => {
            let nonce = ctx.oauth_provider.next_nonce();
            let mut headers = HeaderMap::new();
            if let Ok(value) = nonce.parse() {
                headers.insert("DPoP-Nonce", value);
            }
            if let Ok(value) = "DPoP-Nonce".parse() {
                headers.insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, value);
            }
            (
                StatusCode::BAD_REQUEST,
                headers,
                Json(serde_json::json!({ "error": "use_dpop_nonce" })),
            )
                .into_response()
        }
        PdsError::Oauth { code, message } => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": code, "error_description": message })),
        )
            .into_response(),
        other => other.into_response(),
    }
}

fn check_proof(ctx: &AppContext, method: &str, path: &str, headers: &HeaderMap) -> PdsResult<Proof> {
    ctx.oauth_provider
        .dpop_manager
        .check_proof(method, &full_url(ctx, path), headers, None)
}

async fn par(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Form(request): Form<ParRequest>,
) -> Response {
    let proof = match check_proof(&ctx, "POST", "/oauth/par", &headers) {
        Ok(proof) => proof,
        Err(err) => return oauth_error(&ctx, err),
    };

    let result = async {
        let credentials = request.credentials();
        let (client, client_auth) = ctx.oauth_provider.authenticate_client(&credentials).await?;
        ctx.oauth_provider
            .pushed_authorization_request(request, &client, &client_auth, &proof, "")
            .await
    }
    .await;

    match result {
        Ok((request_uri, expires_in)) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "request_uri": request_uri,
                "expires_in": expires_in,
            })),
        )
            .into_response(),
        Err(err) => oauth_error(&ctx, err),
    }
}

async fn token(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Form(request): Form<TokenRequest>,
) -> Response {
    let proof = match check_proof(&ctx, "POST", "/oauth/token", &headers) {
        Ok(proof) => proof,
        Err(err) => return oauth_error(&ctx, err),
    };

    let result = async {
        let credentials = request.credentials();
        let (client, client_auth) = ctx.oauth_provider.authenticate_client(&credentials).await?;

        if !ctx
            .oauth_provider
            .supported_grant_types()
            .iter()
            .any(|g| *g == request.grant_type)
        {
            return Err(PdsError::Oauth {
                code: "unsupported_grant_type",
                message: format!("grant type {} is not supported by the server", request.grant_type),
            });
        }
        if !client.metadata.grant_types.iter().any(|g| *g == request.grant_type) {
            return Err(PdsError::oauth_invalid(format!(
                "grant type {} is not registered by the client",
                request.grant_type
            )));
        }

        match request.grant_type.as_str() {
            "authorization_code" => {
                ctx.oauth_provider
                    .exchange_authorization_code(&request, &client, &client_auth, &proof)
                    .await
            }
            "refresh_token" => {
                ctx.oauth_provider
                    .refresh_token_grant(&request, &client, &client_auth, &proof)
                    .await
            }
            other => Err(PdsError::Oauth {
                code: "unsupported_grant_type",
                message: format!("grant type {} is not supported", other),
            }),
        }
    }
    .await;

    match result {
        Ok(response) => Json(response).into_response(),
        Err(err) => oauth_error(&ctx, err),
    }
}

#[derive(Debug, Deserialize)]
pub struct AuthorizeParams {
    pub request_uri: String,
    pub client_id: String,
}

/// Render the approval page. Sign-in is folded into the same form; the
/// fancy account chooser lives outside the core.
async fn authorize_page(
    State(ctx): State<AppContext>,
    Query(params): Query<AuthorizeParams>,
) -> Response {
    let request = match ctx
        .oauth_provider
        .get_authorization_request(&params.request_uri, &params.client_id)
        .await
    {
        Ok(request) => request,
        Err(err) => return oauth_error(&ctx, err),
    };

    let client_name = match ctx.oauth_provider.client_manager.get_client(&params.client_id).await {
        Ok(client) => client.metadata.client_name.clone(),
        Err(_) => params.client_id.clone(),
    };

    let parameters = match request.parameters() {
        Ok(parameters) => parameters,
        Err(e) => return oauth_error(&ctx, PdsError::Internal(e.to_string())),
    };

    let hint = parameters.login_hint.unwrap_or_default();
    let page = format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Authorize {client}</title></head>
<body>
  <h1>Authorize {client}</h1>
  <p>{client} is asking for access with scope: <code>{scope}</code></p>
  <form method="post" action="/oauth/authorize">
    <input type="hidden" name="request_uri" value="{request_uri}">
    <input type="hidden" name="client_id" value="{client_id}">
    <label>Handle or email <input name="identifier" value="{hint}"></label><br>
    <label>Password <input name="password" type="password"></label><br>
    <button name="action" value="approve">Approve</button>
    <button name="action" value="deny">Deny</button>
  </form>
</body>
</html>"#,
        client = html_escape(&client_name),
        scope = html_escape(&parameters.scope),
        request_uri = html_escape(&params.request_uri),
        client_id = html_escape(&params.client_id),
        hint = html_escape(&hint),
    );

    Html(page).into_response()
}

#[derive(Debug, Deserialize)]
pub struct AuthorizeDecision {
    pub request_uri: String,
    pub client_id: String,
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub password: String,
    pub action: String,
}

async fn authorize_submit(
    State(ctx): State<AppContext>,
    Form(form): Form<AuthorizeDecision>,
) -> Response {
    let request = match ctx
        .oauth_provider
        .get_authorization_request(&form.request_uri, &form.client_id)
        .await
    {
        Ok(request) => request,
        Err(err) => return oauth_error(&ctx, err),
    };

    let issuer = ctx.public_url();

    if form.action != "approve" {
        if let Ok(parameters) = ctx
            .oauth_provider
            .reject_authorization(&request.request_id)
            .await
        {
            let location = redirect_location(
                &parameters,
                &[
                    ("error", "access_denied"),
                    ("state", &parameters.state),
                    ("iss", &issuer),
                ],
            );
            return Redirect::to(&location).into_response();
        }
        return oauth_error(&ctx, PdsError::oauth_invalid("request no longer available"));
    }

    // the subject has to prove who they are before approving
    let account = match ctx.accounts.login(&form.identifier, &form.password).await {
        Ok((account, false)) => account,
        Ok((_, true)) => {
            return oauth_error(
                &ctx,
                PdsError::oauth_invalid("app passwords cannot approve oauth requests"),
            );
        }
        Err(err) => return oauth_error(&ctx, err),
    };

    match ctx
        .oauth_provider
        .accept_authorization(&request.request_id, &account.repo.did)
        .await
    {
        Ok((parameters, code)) => {
            let location = redirect_location(
                &parameters,
                &[
                    ("code", &code),
                    ("state", &parameters.state),
                    ("iss", &issuer),
                ],
            );
            Redirect::to(&location).into_response()
        }
        Err(err) => oauth_error(&ctx, err),
    }
}

async fn jwks(State(ctx): State<AppContext>) -> Json<serde_json::Value> {
    Json(ctx.server_key.public_jwks())
}

/// Query response mode by default; fragment on request.
fn redirect_location(parameters: &ParRequestParameters, pairs: &[(&str, &str)]) -> String {
    let separator = match parameters.response_mode.as_deref() {
        Some("fragment") => '#',
        _ => '?',
    };
    let query: Vec<String> = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect();
    format!("{}{}{}", parameters.redirect_uri, separator, query.join("&"))
}

fn html_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/oauth/par", post(par))
        .route("/oauth/token", post(token))
        .route("/oauth/authorize", get(authorize_page).post(authorize_submit))
        .route("/oauth/jwks", get(jwks))
}
