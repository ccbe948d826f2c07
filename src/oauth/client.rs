/// OAuth client metadata: fetch, validation, and key discovery.
///
/// A client is identified by the URL of its metadata document. Both the
/// metadata and any referenced JWKS are cached in bounded TTL caches so a
/// busy authorization server is not hammering client hosts.
use crate::error::{PdsError, PdsResult};
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const METADATA_CACHE_SIZE: u64 = 500;
const METADATA_CACHE_TTL: Duration = Duration::from_secs(600);
const JWKS_CACHE_TTL: Duration = Duration::from_secs(300);

/// Metadata fields not supported by this server; their presence fails
/// validation outright.
const DISALLOWED_FIELDS: &[&str] = &[
    "default_max_age",
    "userinfo_signed_response_alg",
    "id_token_signed_response_alg",
    "userinfo_encrypted_response_alg",
    "authorization_encrypted_response_enc",
    "authorization_encrypted_response_alg",
    "tls_client_certificate_bound_access_tokens",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMetadata {
    pub client_id: String,
    #[serde(default)]
    pub client_name: String,
    #[serde(default)]
    pub client_uri: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub response_types: Vec<String>,
    #[serde(default)]
    pub grant_types: Vec<String>,
    #[serde(default)]
    pub scope: String,
    #[serde(default = "default_auth_method")]
    pub token_endpoint_auth_method: String,
    #[serde(default)]
    pub token_endpoint_auth_signing_alg: String,
    #[serde(default = "default_application_type")]
    pub application_type: String,
    #[serde(default)]
    pub dpop_bound_access_tokens: bool,
    #[serde(default)]
    pub jwks: Option<jsonwebtoken::jwk::JwkSet>,
    #[serde(default)]
    pub jwks_uri: Option<String>,
}

fn default_auth_method() -> String {
    "none".to_string()
}

fn default_application_type() -> String {
    "web".to_string()
}

impl ClientMetadata {
    pub fn is_confidential(&self) -> bool {
        self.token_endpoint_auth_method == "private_key_jwt"
    }
}

/// A resolved client: metadata plus the key set needed for its auth method
#[derive(Debug, Clone)]
pub struct OauthClient {
    pub metadata: Arc<ClientMetadata>,
    pub jwks: Option<Arc<jsonwebtoken::jwk::JwkSet>>,
}

pub struct ClientManager {
    http: reqwest::Client,
    metadata_cache: Cache<String, Arc<ClientMetadata>>,
    jwks_cache: Cache<String, Arc<jsonwebtoken::jwk::JwkSet>>,
}

impl ClientManager {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            metadata_cache: Cache::builder()
                .max_capacity(METADATA_CACHE_SIZE)
                .time_to_live(METADATA_CACHE_TTL)
                .build(),
            jwks_cache: Cache::builder()
                .max_capacity(METADATA_CACHE_SIZE)
                .time_to_live(JWKS_CACHE_TTL)
                .build(),
        }
    }

    /// Resolve and validate a client by its metadata URL.
    pub async fn get_client(&self, client_id: &str) -> PdsResult<OauthClient> {
        let metadata = self.get_metadata(client_id).await?;

        let jwks = if metadata.is_confidential() {
            if let Some(inline) = &metadata.jwks {
                Some(Arc::new(inline.clone()))
            } else if let Some(uri) = &metadata.jwks_uri {
                Some(self.get_jwks(client_id, uri).await?)
            } else {
                return Err(PdsError::oauth_invalid(
                    "no usable jwks in client metadata",
                ));
            }
        } else {
            None
        };

        Ok(OauthClient { metadata, jwks })
    }

    async fn get_metadata(&self, client_id: &str) -> PdsResult<Arc<ClientMetadata>> {
        if let Some(cached) = self.metadata_cache.get(client_id) {
            return Ok(cached);
        }

        let resp = self
            .http
            .get(client_id)
            .send()
            .await
            .map_err(|e| PdsError::oauth_invalid(format!("failed to fetch client metadata: {}", e)))?;
        if !resp.status().is_success() {
            return Err(PdsError::oauth_invalid(format!(
                "client metadata fetch returned {}",
                resp.status()
            )));
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| PdsError::oauth_invalid(format!("failed to read client metadata: {}", e)))?;

        let metadata = Arc::new(validate_and_parse_metadata(client_id, &body)?);
        self.metadata_cache
            .insert(client_id.to_string(), Arc::clone(&metadata));
        Ok(metadata)
    }

    async fn get_jwks(
        &self,
        client_id: &str,
        jwks_uri: &str,
    ) -> PdsResult<Arc<jsonwebtoken::jwk::JwkSet>> {
        if let Some(cached) = self.jwks_cache.get(client_id) {
            return Ok(cached);
        }

        let resp = self
            .http
            .get(jwks_uri)
            .send()
            .await
            .map_err(|e| PdsError::oauth_invalid(format!("failed to fetch client jwks: {}", e)))?;
        if !resp.status().is_success() {
            return Err(PdsError::oauth_invalid(format!(
                "client jwks fetch returned {}",
                resp.status()
            )));
        }
        let set: jsonwebtoken::jwk::JwkSet = resp
            .json()
            .await
            .map_err(|e| PdsError::oauth_invalid(format!("invalid jwks response: {}", e)))?;
        if set.keys.is_empty() {
            return Err(PdsError::oauth_invalid("no keys in jwks response"));
        }

        let set = Arc::new(set);
        self.jwks_cache
            .insert(client_id.to_string(), Arc::clone(&set));
        Ok(set)
    }
}

/// Parse a metadata document and enforce the registration policy.
pub fn validate_and_parse_metadata(client_id: &str, body: &[u8]) -> PdsResult<ClientMetadata> {
    let raw: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| PdsError::oauth_invalid(format!("client metadata is not json: {}", e)))?;

    for field in DISALLOWED_FIELDS {
        if raw.get(field).is_some() {
            return Err(PdsError::oauth_invalid(format!(
                "unsupported `{}` parameter",
                field
            )));
        }
    }

    if raw.get("jwks").is_some() && raw.get("jwks_uri").is_some() {
        return Err(PdsError::oauth_invalid("jwks and jwks_uri are mutually exclusive"));
    }

    if let Some(subject_type) = raw.get("subject_type").and_then(|v| v.as_str()) {
        if subject_type != "public" {
            return Err(PdsError::oauth_invalid("only public subject_type is supported"));
        }
    }

    let mut metadata: ClientMetadata = serde_json::from_value(raw)
        .map_err(|e| PdsError::oauth_invalid(format!("invalid client metadata: {}", e)))?;

    if metadata.client_id != client_id {
        return Err(PdsError::oauth_invalid("client_id does not match document url"));
    }

    if metadata.client_uri.is_empty() {
        let mut base = Url::parse(client_id)
            .map_err(|e| PdsError::oauth_invalid(format!("unparseable client_id: {}", e)))?;
        base.set_query(None);
        base.set_fragment(None);
        metadata.client_uri = base.to_string();
    }
    if metadata.client_name.is_empty() {
        metadata.client_name = metadata.client_uri.clone();
    }

    let client_uri = Url::parse(&metadata.client_uri)
        .map_err(|e| PdsError::oauth_invalid(format!("unparseable client_uri: {}", e)))?;
    if is_local_hostname(client_uri.host_str().unwrap_or_default()) {
        return Err(PdsError::oauth_invalid("client_uri hostname is not allowed"));
    }

    validate_scopes(&metadata.scope)?;
    validate_grant_types(&metadata.grant_types)?;

    if !metadata.dpop_bound_access_tokens {
        return Err(PdsError::oauth_invalid("dpop_bound_access_tokens must be true"));
    }

    if !metadata.response_types.iter().any(|t| t == "code") {
        return Err(PdsError::oauth_invalid("response_types must include `code`"));
    }
    if !metadata.grant_types.iter().any(|t| t == "authorization_code") {
        return Err(PdsError::oauth_invalid(
            "the `code` response type requires the `authorization_code` grant type",
        ));
    }

    match metadata.token_endpoint_auth_method.as_str() {
        "none" => {
            if !metadata.token_endpoint_auth_signing_alg.is_empty() {
                return Err(PdsError::oauth_invalid(
                    "auth method `none` must not set token_endpoint_auth_signing_alg",
                ));
            }
        }
        "private_key_jwt" => {
            let inline_keys = metadata.jwks.as_ref().map(|s| s.keys.len()).unwrap_or(0);
            if metadata.jwks.is_none() && metadata.jwks_uri.is_none() {
                return Err(PdsError::oauth_invalid(
                    "private_key_jwt requires jwks or jwks_uri",
                ));
            }
            if metadata.jwks.is_some() && inline_keys == 0 {
                return Err(PdsError::oauth_invalid(
                    "private_key_jwt requires at least one key in jwks",
                ));
            }
            if metadata.token_endpoint_auth_signing_alg.is_empty() {
                return Err(PdsError::oauth_invalid(
                    "missing token_endpoint_auth_signing_alg in client metadata",
                ));
            }
        }
        other => {
            return Err(PdsError::oauth_invalid(format!(
                "unsupported client authentication method `{}`",
                other
            )));
        }
    }

    if metadata.application_type == "native" && metadata.token_endpoint_auth_method != "none" {
        return Err(PdsError::oauth_invalid(
            "native clients must authenticate with the `none` method",
        ));
    }

    if metadata.redirect_uris.is_empty() {
        return Err(PdsError::oauth_invalid("at least one redirect_uri is required"));
    }
    for redirect_uri in &metadata.redirect_uris {
        validate_redirect_uri(redirect_uri, &metadata.application_type)?;
    }

    Ok(metadata)
}

fn validate_scopes(scope: &str) -> PdsResult<()> {
    if scope.is_empty() {
        return Err(PdsError::oauth_invalid("missing scope"));
    }
    let scopes: Vec<&str> = scope.split(' ').collect();
    if !scopes.contains(&"atproto") {
        return Err(PdsError::oauth_invalid("missing `atproto` scope"));
    }
    let mut seen = std::collections::HashSet::new();
    for s in scopes {
        if !seen.insert(s) {
            return Err(PdsError::oauth_invalid(format!("duplicate scope `{}`", s)));
        }
    }
    Ok(())
}

fn validate_grant_types(grant_types: &[String]) -> PdsResult<()> {
    let mut seen = std::collections::HashSet::new();
    for gt in grant_types {
        if !seen.insert(gt.as_str()) {
            return Err(PdsError::oauth_invalid(format!("duplicate grant type `{}`", gt)));
        }
        match gt.as_str() {
            "authorization_code" | "refresh_token" => {}
            "implicit" => {
                return Err(PdsError::oauth_invalid("grant type `implicit` is not allowed"));
            }
            other => {
                return Err(PdsError::oauth_invalid(format!(
                    "grant type `{}` is not supported",
                    other
                )));
            }
        }
    }
    Ok(())
}

/// Per-URI redirect policy:
///  - https URIs must not point at local-TLD or single-label hosts
///  - http is loopback-IP only, and loopback is native only
///  - reverse-DNS private schemes are native only
///  - no credentials, no plain `localhost`
fn validate_redirect_uri(redirect_uri: &str, application_type: &str) -> PdsResult<()> {
    let url = Url::parse(redirect_uri)
        .map_err(|e| PdsError::oauth_invalid(format!("invalid redirect_uri: {}", e)))?;

    if !url.username().is_empty() || url.password().is_some() {
        return Err(PdsError::oauth_invalid(format!(
            "redirect uri {} must not contain credentials",
            redirect_uri
        )));
    }

    let host = url.host_str().unwrap_or_default();

    if host == "localhost" {
        return Err(PdsError::oauth_invalid(
            "`localhost` redirect uris are not allowed (use an explicit loopback ip)",
        ));
    }

    if host == "127.0.0.1" || host == "[::1]" || host == "::1" {
        if application_type != "native" {
            return Err(PdsError::oauth_invalid(
                "loopback redirect uris are only allowed for native apps",
            ));
        }
        if url.scheme() != "http" {
            return Err(PdsError::oauth_invalid(format!(
                "loopback redirect uri {} must use http",
                redirect_uri
            )));
        }
        return Ok(());
    }

    match url.scheme() {
        "http" => Err(PdsError::oauth_invalid(
            "only loopback redirect uris may use the `http` scheme",
        )),
        "https" => {
            if is_local_hostname(host) {
                return Err(PdsError::oauth_invalid(format!(
                    "redirect uri {} must not use a local hostname",
                    redirect_uri
                )));
            }
            Ok(())
        }
        scheme if scheme.contains('.') => {
            // reverse-DNS private-use scheme, e.g. com.example.app:/callback
            if application_type != "native" {
                return Err(PdsError::oauth_invalid(
                    "private-use scheme redirect uris are only allowed for native apps",
                ));
            }
            let reversed: Vec<&str> = scheme.split('.').rev().collect();
            if is_local_hostname(&reversed.join(".")) {
                return Err(PdsError::oauth_invalid(
                    "private-use scheme must not reverse to a local hostname",
                ));
            }
            if url.host_str().is_some() {
                return Err(PdsError::oauth_invalid(
                    "private-use scheme redirect uris must not carry an authority",
                ));
            }
            Ok(())
        }
        scheme => Err(PdsError::oauth_invalid(format!(
            "invalid redirect uri scheme `{}`",
            scheme
        ))),
    }
}

/// Single-label hosts and the reserved local TLDs
fn is_local_hostname(hostname: &str) -> bool {
    let parts: Vec<&str> = hostname.split('.').filter(|p| !p.is_empty()).collect();
    if parts.len() < 2 {
        return true;
    }
    matches!(
        parts[parts.len() - 1].to_ascii_lowercase().as_str(),
        "local" | "test" | "localhost" | "invalid" | "example"
    )
}

/// RFC 7638 thumbprint of an EC key, base64url of SHA-256 over the
/// canonical `{crv, kty, x, y}` members.
pub fn ec_thumbprint(jwk: &jsonwebtoken::jwk::Jwk) -> PdsResult<String> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    use sha2::{Digest, Sha256};

    let jsonwebtoken::jwk::AlgorithmParameters::EllipticCurve(params) = &jwk.algorithm else {
        return Err(PdsError::oauth_invalid("only EC keys are supported"));
    };
    let curve = match params.curve {
        jsonwebtoken::jwk::EllipticCurve::P256 => "P-256",
        _ => return Err(PdsError::oauth_invalid("only P-256 keys are supported")),
    };

    // members in lexicographic order, no whitespace
    let canonical = format!(
        r#"{{"crv":"{}","kty":"EC","x":"{}","y":"{}"}}"#,
        curve, params.x, params.y
    );
    Ok(URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_metadata() -> serde_json::Value {
        serde_json::json!({
            "client_id": "https://client.example.com/metadata.json",
            "redirect_uris": ["https://client.example.com/callback"],
            "response_types": ["code"],
            "grant_types": ["authorization_code", "refresh_token"],
            "scope": "atproto transition:generic",
            "token_endpoint_auth_method": "none",
            "application_type": "web",
            "dpop_bound_access_tokens": true,
        })
    }

    fn parse(value: serde_json::Value) -> PdsResult<ClientMetadata> {
        validate_and_parse_metadata(
            "https://client.example.com/metadata.json",
            &serde_json::to_vec(&value).unwrap(),
        )
    }

    #[test]
    fn test_valid_metadata_passes() {
        let metadata = parse(base_metadata()).unwrap();
        assert_eq!(metadata.client_name, "https://client.example.com/");
        assert!(!metadata.is_confidential());
    }

    #[test]
    fn test_client_id_mismatch_fails() {
        let mut value = base_metadata();
        value["client_id"] = "https://elsewhere.example.com/metadata.json".into();
        assert!(parse(value).is_err());
    }

    #[test]
    fn test_disallowed_fields_fail() {
        let mut value = base_metadata();
        value["default_max_age"] = 300.into();
        assert!(parse(value).is_err());

        let mut value = base_metadata();
        value["tls_client_certificate_bound_access_tokens"] = true.into();
        assert!(parse(value).is_err());
    }

    #[test]
    fn test_dpop_binding_is_mandatory() {
        let mut value = base_metadata();
        value["dpop_bound_access_tokens"] = false.into();
        assert!(parse(value).is_err());
    }

    #[test]
    fn test_scope_must_include_atproto() {
        let mut value = base_metadata();
        value["scope"] = "email profile".into();
        assert!(parse(value).is_err());

        let mut value = base_metadata();
        value["scope"] = "atproto atproto".into();
        assert!(parse(value).is_err(), "duplicate scopes must fail");
    }

    #[test]
    fn test_implicit_grant_is_rejected() {
        let mut value = base_metadata();
        value["grant_types"] = serde_json::json!(["authorization_code", "implicit"]);
        assert!(parse(value).is_err());
    }

    #[test]
    fn test_redirect_uri_policy() {
        // local TLD over https
        let mut value = base_metadata();
        value["redirect_uris"] = serde_json::json!(["https://client.test/callback"]);
        assert!(parse(value).is_err());

        // plain http to a real host
        let mut value = base_metadata();
        value["redirect_uris"] = serde_json::json!(["http://client.example.com/callback"]);
        assert!(parse(value).is_err());

        // localhost by name
        let mut value = base_metadata();
        value["redirect_uris"] = serde_json::json!(["http://localhost:8080/callback"]);
        assert!(parse(value).is_err());

        // loopback ip on a web client
        let mut value = base_metadata();
        value["redirect_uris"] = serde_json::json!(["http://127.0.0.1:8080/callback"]);
        assert!(parse(value).is_err());

        // loopback ip on a native client is fine
        let mut value = base_metadata();
        value["application_type"] = "native".into();
        value["redirect_uris"] = serde_json::json!(["http://127.0.0.1:8080/callback"]);
        assert!(parse(value).is_ok());

        // credentials in the authority
        let mut value = base_metadata();
        value["redirect_uris"] = serde_json::json!(["https://user:pw@client.example.com/cb"]);
        assert!(parse(value).is_err());

        // private-use scheme on a native client
        let mut value = base_metadata();
        value["application_type"] = "native".into();
        value["redirect_uris"] = serde_json::json!(["com.example.client:/callback"]);
        assert!(parse(value).is_ok());

        // private-use scheme on a web client
        let mut value = base_metadata();
        value["redirect_uris"] = serde_json::json!(["com.example.client:/callback"]);
        assert!(parse(value).is_err());
    }

    #[test]
    fn test_private_key_jwt_requires_keys_and_alg() {
        let mut value = base_metadata();
        value["token_endpoint_auth_method"] = "private_key_jwt".into();
        assert!(parse(value).is_err(), "missing jwks must fail");

        let mut value = base_metadata();
        value["token_endpoint_auth_method"] = "private_key_jwt".into();
        value["token_endpoint_auth_signing_alg"] = "ES256".into();
        value["jwks"] = serde_json::json!({"keys": [{
            "kty": "EC", "crv": "P-256", "kid": "key-1",
            "x": "WKn-ZIGevcwGIyyrzFoZNBdaq9_TsqzGl96oc0CWuis",
            "y": "y77t-RvAHRKTsSGdIYUfweuOvwrvDD-Q3Hv5J0fSKbE",
        }]});
        let metadata = parse(value).unwrap();
        assert!(metadata.is_confidential());
    }

    #[test]
    fn test_local_hostname_detection() {
        assert!(is_local_hostname("localhost"));
        assert!(is_local_hostname("single-label"));
        assert!(is_local_hostname("app.test"));
        assert!(is_local_hostname("app.local"));
        assert!(is_local_hostname("thing.example"));
        assert!(!is_local_hostname("client.example.com"));
    }

    #[test]
    fn test_ec_thumbprint_is_stable() {
        let jwk: jsonwebtoken::jwk::Jwk = serde_json::from_value(serde_json::json!({
            "kty": "EC", "crv": "P-256", "kid": "key-1",
            "x": "WKn-ZIGevcwGIyyrzFoZNBdaq9_TsqzGl96oc0CWuis",
            "y": "y77t-RvAHRKTsSGdIYUfweuOvwrvDD-Q3Hv5J0fSKbE",
        }))
        .unwrap();
        let a = ec_thumbprint(&jwk).unwrap();
        let b = ec_thumbprint(&jwk).unwrap();
        assert_eq!(a, b);
        assert!(!a.contains('='));
    }
}
