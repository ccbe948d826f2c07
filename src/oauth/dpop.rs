/// DPoP proof validation.
///
/// Every protected OAuth request carries a `DPoP` header: a one-shot ES256
/// JWT bound to the request method/URL and to the client's key. Replay is
/// fenced two ways: `jti` values are remembered in a TTL cache, and proofs
/// must embed a server nonce derived from a persisted secret and a rotating
/// time bucket.
use crate::error::{PdsError, PdsResult};
use crate::oauth::client::ec_thumbprint;
use axum::http::HeaderMap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use moka::sync::Cache;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;
use url::Url;

const JTI_CACHE_SIZE: u64 = 100_000;
const JTI_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Nonce buckets rotate once a minute; the previous and next bucket stay
/// acceptable to absorb clock skew.
const NONCE_BUCKET_SECS: i64 = 60;
/// Proof freshness: how old/early `iat` may be
const IAT_MAX_AGE_SECS: i64 = 300;
const IAT_MAX_SKEW_SECS: i64 = 30;

/// A validated proof
#[derive(Debug, Clone)]
pub struct Proof {
    /// Thumbprint of the proving key
    pub jkt: String,
    pub jti: String,
    pub htm: String,
    pub htu: String,
}

#[derive(Debug, Deserialize)]
struct ProofClaims {
    jti: String,
    htm: String,
    htu: String,
    iat: i64,
    #[serde(default)]
    nonce: Option<String>,
    #[serde(default)]
    ath: Option<String>,
}

pub struct DpopManager {
    jti_cache: Cache<String, ()>,
    secret: Vec<u8>,
}

impl DpopManager {
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            jti_cache: Cache::builder()
                .max_capacity(JTI_CACHE_SIZE)
                .time_to_live(JTI_TTL)
                .build(),
            secret,
        }
    }

    /// Load the nonce secret, generating 32 random bytes on first boot.
    pub async fn load_or_generate(path: &Path) -> PdsResult<Self> {
        let secret = if tokio::fs::try_exists(path).await? {
            tokio::fs::read(path).await?
        } else {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut secret = vec![0u8; 32];
            rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut secret);
            tokio::fs::write(path, &secret).await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644)).await?;
            }
            secret
        };

        Ok(Self::new(secret))
    }

    /// The nonce clients should use right now
    pub fn next_nonce(&self) -> String {
        self.nonce_for_bucket(Utc::now().timestamp() / NONCE_BUCKET_SECS)
    }

    fn nonce_for_bucket(&self, bucket: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.secret);
        hasher.update(bucket.to_be_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }

    fn is_valid_nonce(&self, nonce: &str) -> bool {
        let bucket = Utc::now().timestamp() / NONCE_BUCKET_SECS;
        [bucket - 1, bucket, bucket + 1]
            .iter()
            .any(|b| self.nonce_for_bucket(*b) == nonce)
    }

    /// Validate the proof on a request. `access_token` is set when the proof
    /// accompanies a protected-resource call, binding it via `ath`.
    pub fn check_proof(
        &self,
        method: &str,
        url: &str,
        headers: &HeaderMap,
        access_token: Option<&str>,
    ) -> PdsResult<Proof> {
        let header_value = headers
            .get("DPoP")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| PdsError::oauth_invalid("dpop proof required"))?;

        let header = jsonwebtoken::decode_header(header_value)
            .map_err(|e| PdsError::oauth_invalid(format!("invalid dpop jwt: {}", e)))?;

        if header.typ.as_deref() != Some("dpop+jwt") {
            return Err(PdsError::oauth_invalid("dpop jwt must have typ dpop+jwt"));
        }
        if header.alg != jsonwebtoken::Algorithm::ES256 {
            return Err(PdsError::oauth_invalid("dpop jwt must be signed with ES256"));
        }
        let jwk = header
            .jwk
            .ok_or_else(|| PdsError::oauth_invalid("dpop jwt missing embedded jwk"))?;

        let decoding_key = jsonwebtoken::DecodingKey::from_jwk(&jwk)
            .map_err(|e| PdsError::oauth_invalid(format!("invalid dpop jwk: {}", e)))?;

        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::ES256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let token = jsonwebtoken::decode::<ProofClaims>(header_value, &decoding_key, &validation)
            .map_err(|e| PdsError::oauth_invalid(format!("dpop jwt verification failed: {}", e)))?;
        let claims = token.claims;

        if !claims.htm.eq_ignore_ascii_case(method) {
            return Err(PdsError::oauth_invalid("dpop htm does not match request method"));
        }

        let expected_htu = normalize_htu(url)?;
        let proof_htu = normalize_htu(&claims.htu)?;
        if expected_htu != proof_htu {
            return Err(PdsError::oauth_invalid("dpop htu does not match request url"));
        }

        let now = Utc::now().timestamp();
        if claims.iat < now - IAT_MAX_AGE_SECS || claims.iat > now + IAT_MAX_SKEW_SECS {
            return Err(PdsError::oauth_invalid("dpop proof iat is not fresh"));
        }

        match &claims.nonce {
            None => return Err(PdsError::UseDpopNonce),
            Some(nonce) if !self.is_valid_nonce(nonce) => {
                return Err(PdsError::UseDpopNonce);
            }
            Some(_) => {}
        }

        if claims.jti.is_empty() {
            return Err(PdsError::oauth_invalid("dpop jti is required"));
        }
        if self.jti_cache.contains_key(&claims.jti) {
            return Err(PdsError::oauth_invalid("dpop jti has already been used"));
        }
        self.jti_cache.insert(claims.jti.clone(), ());

        if let Some(access_token) = access_token {
            let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(access_token.as_bytes()));
            if claims.ath.as_deref() != Some(expected.as_str()) {
                return Err(PdsError::oauth_invalid("dpop ath does not match access token"));
            }
        }

        Ok(Proof {
            jkt: ec_thumbprint(&jwk)?,
            jti: claims.jti,
            htm: claims.htm,
            htu: proof_htu,
        })
    }
}

/// scheme + authority + path, credentials rejected, query/fragment dropped
fn normalize_htu(raw: &str) -> PdsResult<String> {
    let url =
        Url::parse(raw).map_err(|_| PdsError::oauth_invalid("htu is not a valid url"))?;

    if !url.username().is_empty() || url.password().is_some() {
        return Err(PdsError::oauth_invalid("htu must not contain credentials"));
    }
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(PdsError::oauth_invalid("htu must be http or https"));
    }

    let mut out = format!("{}://", url.scheme());
    out.push_str(url.host_str().unwrap_or_default());
    if let Some(port) = url.port() {
        out.push(':');
        out.push_str(&port.to_string());
    }
    out.push_str(url.path());
    Ok(out)
}

#[doc(hidden)]
pub mod test_support {
    //! Proof construction for tests: a client-side DPoP signer.
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use p256::ecdsa::signature::Signer;

    pub struct TestDpopKey {
        signing_key: p256::ecdsa::SigningKey,
    }

    impl TestDpopKey {
        pub fn generate() -> Self {
            Self {
                signing_key: p256::ecdsa::SigningKey::random(&mut rand::thread_rng()),
            }
        }

        pub fn public_jwk(&self) -> serde_json::Value {
            let point = self
                .signing_key
                .verifying_key()
                .to_encoded_point(false);
            serde_json::json!({
                "kty": "EC",
                "crv": "P-256",
                "x": URL_SAFE_NO_PAD.encode(point.x().unwrap()),
                "y": URL_SAFE_NO_PAD.encode(point.y().unwrap()),
            })
        }

        pub fn jkt(&self) -> String {
            let jwk: jsonwebtoken::jwk::Jwk =
                serde_json::from_value(self.public_jwk()).unwrap();
            ec_thumbprint(&jwk).unwrap()
        }

        pub fn sign_proof(&self, claims: &serde_json::Value) -> String {
            let header = serde_json::json!({
                "typ": "dpop+jwt",
                "alg": "ES256",
                "jwk": self.public_jwk(),
            });
            let signing_input = format!(
                "{}.{}",
                URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap()),
                URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap()),
            );
            let sig: p256::ecdsa::Signature = self.signing_key.sign(signing_input.as_bytes());
            format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(sig.to_bytes()))
        }

        /// A complete, currently valid proof for the given request
        pub fn proof_header(
            &self,
            method: &str,
            url: &str,
            nonce: Option<&str>,
            access_token: Option<&str>,
        ) -> String {
            let mut claims = serde_json::json!({
                "jti": uuid::Uuid::new_v4().to_string(),
                "htm": method,
                "htu": url,
                "iat": chrono::Utc::now().timestamp(),
            });
            if let Some(nonce) = nonce {
                claims["nonce"] = nonce.into();
            }
            if let Some(token) = access_token {
                claims["ath"] = URL_SAFE_NO_PAD
                    .encode(sha2::Sha256::digest(token.as_bytes()))
                    .into();
            }
            self.sign_proof(&claims)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::TestDpopKey;
    use super::*;

    fn manager() -> DpopManager {
        DpopManager::new(vec![42u8; 32])
    }

    fn headers_with(proof: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("DPoP", proof.parse().unwrap());
        headers
    }

    const URL: &str = "https://pds.example.com/oauth/par";

    #[test]
    fn test_missing_nonce_asks_for_one() {
        let manager = manager();
        let key = TestDpopKey::generate();
        let proof = key.proof_header("POST", URL, None, None);

        let err = manager
            .check_proof("POST", URL, &headers_with(&proof), None)
            .unwrap_err();
        assert!(matches!(err, PdsError::UseDpopNonce));
    }

    #[test]
    fn test_valid_proof_passes_and_reports_jkt() {
        let manager = manager();
        let key = TestDpopKey::generate();
        let nonce = manager.next_nonce();
        let proof = key.proof_header("POST", URL, Some(&nonce), None);

        let checked = manager
            .check_proof("POST", URL, &headers_with(&proof), None)
            .unwrap();
        assert_eq!(checked.jkt, key.jkt());
        assert_eq!(checked.htu, "https://pds.example.com/oauth/par");
    }

    #[test]
    fn test_stale_nonce_is_challenged() {
        let manager = manager();
        let key = TestDpopKey::generate();
        let proof = key.proof_header("POST", URL, Some("nonsense-nonce"), None);

        let err = manager
            .check_proof("POST", URL, &headers_with(&proof), None)
            .unwrap_err();
        assert!(matches!(err, PdsError::UseDpopNonce));
    }

    #[test]
    fn test_jti_replay_is_rejected() {
        let manager = manager();
        let key = TestDpopKey::generate();
        let nonce = manager.next_nonce();
        let proof = key.proof_header("POST", URL, Some(&nonce), None);
        let headers = headers_with(&proof);

        manager.check_proof("POST", URL, &headers, None).unwrap();
        let err = manager.check_proof("POST", URL, &headers, None).unwrap_err();
        assert!(matches!(err, PdsError::Oauth { .. }));
    }

    #[test]
    fn test_htm_and_htu_must_match() {
        let manager = manager();
        let key = TestDpopKey::generate();
        let nonce = manager.next_nonce();

        let proof = key.proof_header("POST", URL, Some(&nonce), None);
        assert!(manager
            .check_proof("GET", URL, &headers_with(&proof), None)
            .is_err());

        let proof = key.proof_header("POST", "https://other.example.com/oauth/par", Some(&nonce), None);
        assert!(manager
            .check_proof("POST", URL, &headers_with(&proof), None)
            .is_err());

        // query strings are ignored by normalization
        let proof = key.proof_header("POST", URL, Some(&nonce), None);
        assert!(manager
            .check_proof(
                "POST",
                "https://pds.example.com/oauth/par?extra=1",
                &headers_with(&proof),
                None
            )
            .is_ok());
    }

    #[test]
    fn test_ath_binding() {
        let manager = manager();
        let key = TestDpopKey::generate();
        let nonce = manager.next_nonce();

        let proof = key.proof_header("GET", URL, Some(&nonce), Some("the-access-token"));
        assert!(manager
            .check_proof("GET", URL, &headers_with(&proof), Some("the-access-token"))
            .is_ok());

        let proof = key.proof_header("GET", URL, Some(&nonce), Some("the-access-token"));
        assert!(manager
            .check_proof("GET", URL, &headers_with(&proof), Some("another-token"))
            .is_err());
    }

    #[test]
    fn test_nonce_rotates_but_stays_deterministic() {
        let manager = manager();
        assert_eq!(manager.next_nonce(), manager.next_nonce());

        let other_secret = DpopManager::new(vec![7u8; 32]);
        assert_ne!(manager.next_nonce(), other_secret.next_nonce());
    }

    #[tokio::test]
    async fn test_secret_persists_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonce.secret");

        let first = DpopManager::load_or_generate(&path).await.unwrap();
        let second = DpopManager::load_or_generate(&path).await.unwrap();
        assert_eq!(first.next_nonce(), second.next_nonce());
    }
}
