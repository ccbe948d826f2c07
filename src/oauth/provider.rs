/// The authorization server: client authentication, pushed authorization
/// requests, the approval flow, and token issuance/rotation.
use crate::crypto::P256ServerKey;
use crate::db::Db;
use crate::error::{PdsError, PdsResult};
use crate::models::{ClientAuth, OauthAuthorizationRequestRow, OauthTokenRow, ParRequestParameters};
use crate::oauth::client::{ec_thumbprint, ClientManager, OauthClient};
use crate::oauth::dpop::{DpopManager, Proof};
use crate::oauth::{
    self, decode_request_uri, encode_request_uri, generate_code, generate_refresh_token,
    generate_request_id, generate_token_id,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

pub const CLIENT_ASSERTION_TYPE_JWT_BEARER: &str =
    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Client identification fields shared by PAR and token requests
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientCredentials {
    pub client_id: String,
    #[serde(default)]
    pub client_assertion_type: Option<String>,
    #[serde(default)]
    pub client_assertion: Option<String>,
}

/// Body of POST /oauth/par
#[derive(Debug, Clone, Deserialize)]
pub struct ParRequest {
    pub client_id: String,
    #[serde(default)]
    pub client_assertion_type: Option<String>,
    #[serde(default)]
    pub client_assertion: Option<String>,
    pub response_type: String,
    #[serde(default)]
    pub code_challenge: Option<String>,
    #[serde(default)]
    pub code_challenge_method: String,
    pub state: String,
    pub redirect_uri: String,
    pub scope: String,
    #[serde(default)]
    pub response_mode: Option<String>,
    #[serde(default)]
    pub login_hint: Option<String>,
    #[serde(default)]
    pub dpop_jkt: Option<String>,
}

impl ParRequest {
    pub fn credentials(&self) -> ClientCredentials {
        ClientCredentials {
            client_id: self.client_id.clone(),
            client_assertion_type: self.client_assertion_type.clone(),
            client_assertion: self.client_assertion.clone(),
        }
    }
}

/// Body of POST /oauth/token
#[derive(Debug, Clone, Deserialize)]
pub struct TokenRequest {
    pub client_id: String,
    #[serde(default)]
    pub client_assertion_type: Option<String>,
    #[serde(default)]
    pub client_assertion: Option<String>,
    pub grant_type: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub code_verifier: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl TokenRequest {
    pub fn credentials(&self) -> ClientCredentials {
        ClientCredentials {
            client_id: self.client_id.clone(),
            client_assertion_type: self.client_assertion_type.clone(),
            client_assertion: self.client_assertion.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub refresh_token: String,
    pub scope: String,
    pub expires_in: i64,
    pub sub: String,
}

/// Session resolved from an OAuth access token at a protected resource
#[derive(Debug, Clone)]
pub struct OauthSession {
    pub did: String,
    pub scope: String,
    pub client_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct AccessClaims {
    scope: String,
    aud: String,
    sub: String,
    iat: i64,
    exp: i64,
    jti: String,
    client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cnf: Option<String>,
}

pub struct Provider {
    pub client_manager: ClientManager,
    pub dpop_manager: DpopManager,
    db: Db,
    hostname: String,
    server_did: String,
    server_key: Arc<P256ServerKey>,
    supported_grant_types: Vec<String>,
}

impl Provider {
    pub fn new(
        db: Db,
        hostname: String,
        server_did: String,
        server_key: Arc<P256ServerKey>,
        client_manager: ClientManager,
        dpop_manager: DpopManager,
    ) -> Self {
        Self {
            client_manager,
            dpop_manager,
            db,
            hostname,
            server_did,
            server_key,
            supported_grant_types: vec![
                "authorization_code".to_string(),
                "refresh_token".to_string(),
            ],
        }
    }

    pub fn next_nonce(&self) -> String {
        self.dpop_manager.next_nonce()
    }

    pub fn supported_grant_types(&self) -> &[String] {
        &self.supported_grant_types
    }

    /// Resolve the client and verify its credentials. `none` clients pass by
    /// existing; `private_key_jwt` clients must present a fresh ES256
    /// assertion signed by a key in their published set.
    pub async fn authenticate_client(
        &self,
        credentials: &ClientCredentials,
    ) -> PdsResult<(OauthClient, ClientAuth)> {
        let client = self.client_manager.get_client(&credentials.client_id).await?;

        let auth = match client.metadata.token_endpoint_auth_method.as_str() {
            "none" => ClientAuth {
                method: "none".to_string(),
                ..Default::default()
            },
            "private_key_jwt" => self.verify_client_assertion(&client, credentials)?,
            other => {
                return Err(PdsError::oauth_invalid(format!(
                    "auth method `{}` is not implemented",
                    other
                )));
            }
        };

        Ok((client, auth))
    }

    fn verify_client_assertion(
        &self,
        client: &OauthClient,
        credentials: &ClientCredentials,
    ) -> PdsResult<ClientAuth> {
        let assertion = credentials.client_assertion.as_deref().ok_or_else(|| {
            PdsError::oauth_invalid("private_key_jwt requires a client_assertion")
        })?;
        if credentials.client_assertion_type.as_deref() != Some(CLIENT_ASSERTION_TYPE_JWT_BEARER) {
            return Err(PdsError::oauth_invalid("unsupported client_assertion_type"));
        }

        let header = jsonwebtoken::decode_header(assertion)
            .map_err(|e| PdsError::oauth_invalid(format!("invalid client_assertion: {}", e)))?;
        if header.alg != jsonwebtoken::Algorithm::ES256 {
            return Err(PdsError::oauth_invalid("client_assertion must use ES256"));
        }
        let kid = header
            .kid
            .filter(|k| !k.is_empty())
            .ok_or_else(|| PdsError::oauth_invalid("client_assertion missing kid"))?;

        let jwks = client
            .jwks
            .as_ref()
            .ok_or_else(|| PdsError::oauth_invalid("client has no keys"))?;
        let jwk = jwks
            .find(&kid)
            .ok_or_else(|| PdsError::oauth_invalid(format!("kid {} not found in client jwks", kid)))?;

        let decoding_key = jsonwebtoken::DecodingKey::from_jwk(jwk)
            .map_err(|e| PdsError::oauth_invalid(format!("invalid client jwk: {}", e)))?;

        #[derive(Deserialize)]
        struct AssertionClaims {
            sub: String,
            #[serde(default)]
            aud: Option<String>,
            iat: i64,
            jti: String,
            #[serde(default)]
            exp: Option<i64>,
        }

        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::ES256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let token = jsonwebtoken::decode::<AssertionClaims>(assertion, &decoding_key, &validation)
            .map_err(|e| {
                PdsError::oauth_invalid(format!("client_assertion verification failed: {}", e))
            })?;
        let claims = token.claims;

        if claims.sub != client.metadata.client_id {
            return Err(PdsError::oauth_invalid("client_assertion sub must be the client_id"));
        }
        let expected_aud = format!("https://{}", self.hostname);
        if let Some(aud) = &claims.aud {
            if !aud.is_empty() && *aud != expected_aud {
                return Err(PdsError::oauth_invalid(format!(
                    "client_assertion aud must be {}",
                    expected_aud
                )));
            }
        }
        let age = Utc::now().timestamp() - claims.iat;
        if age > oauth::assertion_max_age().num_seconds() || age < -30 {
            return Err(PdsError::oauth_invalid("client_assertion is not fresh"));
        }
        if claims.jti.is_empty() {
            return Err(PdsError::oauth_invalid("client_assertion jti is required"));
        }

        Ok(ClientAuth {
            method: "private_key_jwt".to_string(),
            alg: "ES256".to_string(),
            kid,
            jkt: ec_thumbprint(jwk)?,
            jti: claims.jti,
            exp: claims.exp,
        })
    }

    /// Handle a pushed authorization request. Returns the request_uri and
    /// its lifetime in seconds.
    pub async fn pushed_authorization_request(
        &self,
        mut request: ParRequest,
        client: &OauthClient,
        client_auth: &ClientAuth,
        proof: &Proof,
        ip: &str,
    ) -> PdsResult<(String, i64)> {
        if request.response_type != "code" {
            return Err(PdsError::oauth_invalid("response_type must be `code`"));
        }
        if !client
            .metadata
            .redirect_uris
            .iter()
            .any(|uri| *uri == request.redirect_uri)
        {
            return Err(PdsError::oauth_invalid("redirect_uri is not registered"));
        }

        match request.dpop_jkt.as_deref() {
            None => {
                if client.metadata.dpop_bound_access_tokens {
                    request.dpop_jkt = Some(proof.jkt.clone());
                }
            }
            Some(jkt) => {
                if jkt != proof.jkt {
                    return Err(PdsError::oauth_invalid(
                        "supplied dpop_jkt does not match the proof key",
                    ));
                }
            }
        }

        let request_id = generate_request_id();
        let now = Utc::now();
        let expires_at = now + oauth::par_lifetime();

        let parameters = ParRequestParameters {
            client_id: request.client_id.clone(),
            response_type: request.response_type.clone(),
            code_challenge: request.code_challenge.clone(),
            code_challenge_method: request.code_challenge_method.clone(),
            state: request.state.clone(),
            redirect_uri: request.redirect_uri.clone(),
            scope: request.scope.clone(),
            response_mode: request.response_mode.clone(),
            login_hint: request.login_hint.clone(),
            dpop_jkt: request.dpop_jkt.clone(),
        };

        self.db
            .exec(
                sqlx::query(
                    "INSERT INTO oauth_authorization_requests
                     (request_id, client_id, client_auth, parameters, ip, expires_at, created_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&request_id)
                .bind(&client.metadata.client_id)
                .bind(serde_json::to_string(client_auth)?)
                .bind(serde_json::to_string(&parameters)?)
                .bind(ip)
                .bind(expires_at)
                .bind(now),
            )
            .await?;

        Ok((
            encode_request_uri(&request_id),
            oauth::par_lifetime().num_seconds(),
        ))
    }

    /// Look up a PAR record for the authorize page.
    pub async fn get_authorization_request(
        &self,
        request_uri: &str,
        client_id: &str,
    ) -> PdsResult<OauthAuthorizationRequestRow> {
        let request_id = decode_request_uri(request_uri)
            .ok_or_else(|| PdsError::oauth_invalid("malformed request_uri"))?;

        let row: Option<OauthAuthorizationRequestRow> =
            sqlx::query_as("SELECT * FROM oauth_authorization_requests WHERE request_id = ?")
                .bind(request_id)
                .fetch_optional(self.db.reader())
                .await
                .map_err(PdsError::Database)?;

        let row = row.ok_or_else(|| PdsError::oauth_invalid("unknown request_uri"))?;
        if row.client_id != client_id {
            return Err(PdsError::oauth_invalid("client_id mismatch"));
        }
        if row.expires_at < Utc::now() {
            return Err(PdsError::oauth_invalid("authorization request has expired"));
        }
        if row.code.is_some() {
            return Err(PdsError::oauth_invalid("authorization request already used"));
        }

        Ok(row)
    }

    /// Record the user's approval: bind the subject and mint the code.
    pub async fn accept_authorization(
        &self,
        request_id: &str,
        sub: &str,
    ) -> PdsResult<(ParRequestParameters, String)> {
        let code = generate_code();

        let row: Option<OauthAuthorizationRequestRow> = {
            let mut wtx = self.db.begin().await?;
            let row = sqlx::query_as(
                "UPDATE oauth_authorization_requests
                 SET sub = ?, code = ?, accepted = 1
                 WHERE request_id = ? AND code IS NULL AND expires_at > ?
                 RETURNING *",
            )
            .bind(sub)
            .bind(&code)
            .bind(request_id)
            .bind(Utc::now())
            .fetch_optional(&mut *wtx.tx)
            .await
            .map_err(PdsError::Database)?;
            wtx.commit().await?;
            row
        };

        let row = row.ok_or_else(|| PdsError::oauth_invalid("authorization request not available"))?;
        Ok((row.parameters()?, code))
    }

    /// The user said no: drop the request and hand back redirect details.
    pub async fn reject_authorization(
        &self,
        request_id: &str,
    ) -> PdsResult<ParRequestParameters> {
        let row: Option<OauthAuthorizationRequestRow> = {
            let mut wtx = self.db.begin().await?;
            let row = sqlx::query_as(
                "DELETE FROM oauth_authorization_requests WHERE request_id = ? RETURNING *",
            )
            .bind(request_id)
            .fetch_optional(&mut *wtx.tx)
            .await
            .map_err(PdsError::Database)?;
            wtx.commit().await?;
            row
        };

        let row = row.ok_or_else(|| PdsError::oauth_invalid("authorization request not available"))?;
        Ok(row.parameters()?)
    }

    /// `grant_type=authorization_code`: redeem a code (single use, the row
    /// dies with the redemption) and mint the first token pair.
    pub async fn exchange_authorization_code(
        &self,
        request: &TokenRequest,
        client: &OauthClient,
        client_auth: &ClientAuth,
        proof: &Proof,
    ) -> PdsResult<TokenResponse> {
        let code = request
            .code
            .as_deref()
            .ok_or_else(|| PdsError::oauth_invalid("`code` is required"))?;

        // fetch-and-delete in one statement; a second redemption finds nothing
        let row: Option<OauthAuthorizationRequestRow> = {
            let mut wtx = self.db.begin().await?;
            let row = sqlx::query_as(
                "DELETE FROM oauth_authorization_requests WHERE code = ? RETURNING *",
            )
            .bind(code)
            .fetch_optional(&mut *wtx.tx)
            .await
            .map_err(PdsError::Database)?;
            wtx.commit().await?;
            row
        };

        let row = row.ok_or_else(|| PdsError::Oauth {
            code: "invalid_grant",
            message: "unknown or already redeemed code".to_string(),
        })?;

        if row.expires_at < Utc::now() {
            return Err(PdsError::Oauth {
                code: "invalid_grant",
                message: "authorization code has expired".to_string(),
            });
        }

        let parameters = row.parameters()?;
        let sub = row.sub.clone().ok_or_else(|| {
            PdsError::oauth_invalid("authorization request was never approved")
        })?;

        if request.redirect_uri.as_deref() != Some(parameters.redirect_uri.as_str()) {
            return Err(PdsError::oauth_invalid("`redirect_uri` mismatch"));
        }

        verify_pkce(&parameters, request.code_verifier.as_deref())?;

        if let Some(expected_jkt) = &parameters.dpop_jkt {
            if *expected_jkt != proof.jkt {
                return Err(PdsError::oauth_invalid("dpop proof does not match the bound key"));
            }
        }

        self.mint_token_pair(
            &sub,
            &client.metadata.client_id,
            client_auth,
            parameters,
            code,
        )
        .await
    }

    /// `grant_type=refresh_token`: rotate. The UPDATE keyed on the old
    /// refresh token is the atomic gate; a reused token matches zero rows.
    pub async fn refresh_token_grant(
        &self,
        request: &TokenRequest,
        client: &OauthClient,
        client_auth: &ClientAuth,
        proof: &Proof,
    ) -> PdsResult<TokenResponse> {
        let refresh_token = request
            .refresh_token
            .as_deref()
            .ok_or_else(|| PdsError::oauth_invalid("`refresh_token` is required"))?;

        let row: Option<OauthTokenRow> =
            sqlx::query_as("SELECT * FROM oauth_tokens WHERE refresh_token = ?")
                .bind(refresh_token)
                .fetch_optional(self.db.reader())
                .await
                .map_err(PdsError::Database)?;
        let row = row.ok_or_else(|| PdsError::Oauth {
            code: "invalid_grant",
            message: "unknown refresh token".to_string(),
        })?;

        if row.client_id != client.metadata.client_id {
            return Err(PdsError::oauth_invalid("`client_id` mismatch"));
        }
        let stored_auth = row.client_auth()?;
        if stored_auth.method != client_auth.method {
            return Err(PdsError::oauth_invalid("client authentication method mismatch"));
        }

        let parameters = row.parameters()?;
        match &parameters.dpop_jkt {
            Some(jkt) => {
                if *jkt != proof.jkt {
                    return Err(PdsError::oauth_invalid("dpop proof does not match expected jkt"));
                }
            }
            None => {
                if client.metadata.dpop_bound_access_tokens {
                    return Err(PdsError::oauth_invalid(
                        "dpop jkt is required for dpop bound access tokens",
                    ));
                }
            }
        }

        let age = oauth::session_age(
            row.created_at,
            row.updated_at,
            client.metadata.is_confidential(),
            Utc::now(),
        );
        if age.session_expired {
            return Err(PdsError::Oauth {
                code: "invalid_grant",
                message: "session expired".to_string(),
            });
        }
        if age.refresh_expired {
            return Err(PdsError::Oauth {
                code: "invalid_grant",
                message: "refresh token expired".to_string(),
            });
        }

        let now = Utc::now();
        let expires_at = now + oauth::token_max_age();
        let access_token = self.sign_access_token(&row.sub, &row.client_id, &parameters, expires_at.timestamp())?;
        let next_refresh_token = generate_refresh_token();

        let result = self
            .db
            .exec(
                sqlx::query(
                    "UPDATE oauth_tokens
                     SET token = ?, refresh_token = ?, expires_at = ?, updated_at = ?
                     WHERE refresh_token = ?",
                )
                .bind(&access_token)
                .bind(&next_refresh_token)
                .bind(expires_at)
                .bind(now)
                .bind(refresh_token),
            )
            .await?;
        if result.rows_affected() == 0 {
            return Err(PdsError::Oauth {
                code: "invalid_grant",
                message: "refresh token already rotated".to_string(),
            });
        }

        Ok(TokenResponse {
            access_token,
            token_type: token_type(&parameters),
            refresh_token: next_refresh_token,
            scope: parameters.scope.clone(),
            expires_in: oauth::token_max_age().num_seconds(),
            sub: row.sub,
        })
    }

    async fn mint_token_pair(
        &self,
        sub: &str,
        client_id: &str,
        client_auth: &ClientAuth,
        parameters: ParRequestParameters,
        code: &str,
    ) -> PdsResult<TokenResponse> {
        let now = Utc::now();
        let expires_at = now + oauth::token_max_age();

        let access_token = self.sign_access_token(sub, client_id, &parameters, expires_at.timestamp())?;
        let refresh_token = generate_refresh_token();

        self.db
            .exec(
                sqlx::query(
                    "INSERT INTO oauth_tokens
                     (client_id, client_auth, parameters, sub, code, token, refresh_token, ip,
                      expires_at, created_at, updated_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(client_id)
                .bind(serde_json::to_string(client_auth)?)
                .bind(serde_json::to_string(&parameters)?)
                .bind(sub)
                .bind(code)
                .bind(&access_token)
                .bind(&refresh_token)
                .bind("")
                .bind(expires_at)
                .bind(now)
                .bind(now),
            )
            .await?;

        Ok(TokenResponse {
            access_token,
            token_type: token_type(&parameters),
            refresh_token,
            scope: parameters.scope.clone(),
            expires_in: oauth::token_max_age().num_seconds(),
            sub: sub.to_string(),
        })
    }

    fn sign_access_token(
        &self,
        sub: &str,
        client_id: &str,
        parameters: &ParRequestParameters,
        exp: i64,
    ) -> PdsResult<String> {
        self.server_key.sign(&AccessClaims {
            scope: parameters.scope.clone(),
            aud: self.server_did.clone(),
            sub: sub.to_string(),
            iat: Utc::now().timestamp(),
            exp,
            jti: generate_token_id(),
            client_id: client_id.to_string(),
            cnf: parameters.dpop_jkt.clone(),
        })
    }

    /// Validate an access token at a protected resource. Only DPoP-bound
    /// tokens are honored; the proof must be signed by the bound key.
    pub async fn verify_access_token(
        &self,
        token: &str,
        proof: &Proof,
    ) -> PdsResult<OauthSession> {
        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::ES256);
        validation.validate_aud = false;

        let decoded = jsonwebtoken::decode::<AccessClaims>(
            token,
            &self.server_key.decoding_key(),
            &validation,
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => PdsError::ExpiredToken,
            _ => PdsError::InvalidToken,
        })?;
        let claims = decoded.claims;

        let bound_jkt = claims.cnf.ok_or(PdsError::InvalidToken)?;
        if bound_jkt != proof.jkt {
            return Err(PdsError::InvalidToken);
        }

        // a rotated or revoked token no longer has a row
        let row: Option<(String,)> = sqlx::query_as("SELECT sub FROM oauth_tokens WHERE token = ?")
            .bind(token)
            .fetch_optional(self.db.reader())
            .await
            .map_err(PdsError::Database)?;
        if row.is_none() {
            return Err(PdsError::InvalidToken);
        }

        Ok(OauthSession {
            did: claims.sub,
            scope: claims.scope,
            client_id: claims.client_id,
        })
    }

    /// Reap expired authorization requests; returns how many died.
    pub async fn cleanup_expired_requests(&self) -> PdsResult<u64> {
        let result = self
            .db
            .exec(
                sqlx::query("DELETE FROM oauth_authorization_requests WHERE expires_at < ?")
                    .bind(Utc::now()),
            )
            .await?;
        Ok(result.rows_affected())
    }
}

fn token_type(parameters: &ParRequestParameters) -> String {
    if parameters.dpop_jkt.is_some() {
        "DPoP".to_string()
    } else {
        "Bearer".to_string()
    }
}

/// PKCE check: S256 compares SHA-256(verifier) against the stored challenge,
/// `plain` compares literally; the verifier must be at least 43 chars.
fn verify_pkce(parameters: &ParRequestParameters, verifier: Option<&str>) -> PdsResult<()> {
    match &parameters.code_challenge {
        Some(challenge) => {
            let verifier =
                verifier.ok_or_else(|| PdsError::oauth_invalid("`code_verifier` is required"))?;
            if verifier.len() < 43 {
                return Err(PdsError::oauth_invalid("`code_verifier` is too short"));
            }

            match parameters.code_challenge_method.as_str() {
                "" | "plain" => {
                    if challenge != verifier {
                        return Err(PdsError::oauth_invalid("invalid code_verifier"));
                    }
                }
                "S256" => {
                    let expected = URL_SAFE_NO_PAD
                        .decode(challenge)
                        .map_err(|_| PdsError::oauth_invalid("stored code_challenge is invalid"))?;
                    let computed = Sha256::digest(verifier.as_bytes());
                    if expected != computed.as_slice() {
                        return Err(PdsError::oauth_invalid("invalid code_verifier"));
                    }
                }
                other => {
                    return Err(PdsError::oauth_invalid(format!(
                        "unsupported code_challenge_method {}",
                        other
                    )));
                }
            }
            Ok(())
        }
        None => {
            if verifier.is_some() {
                return Err(PdsError::oauth_invalid(
                    "code_challenge parameter wasn't provided",
                ));
            }
            Ok(())
        }
    }
}
