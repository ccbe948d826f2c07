/// Row types for the relational store.
///
/// Every table in `migrations/` has a struct here. Columns are snake_case in
/// SQL and map by name through sqlx::FromRow.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// An account's repository head plus the account columns that ride along
/// with it (credentials, state codes, preferences).
#[derive(Debug, Clone, FromRow)]
pub struct Repo {
    pub did: String,
    pub created_at: DateTime<Utc>,
    pub email: String,
    pub email_confirmed_at: Option<DateTime<Utc>>,
    pub email_verification_code: Option<String>,
    pub email_verification_code_expires_at: Option<DateTime<Utc>>,
    pub password: String,
    /// secp256k1 private scalar, raw 32 bytes
    pub signing_key: Vec<u8>,
    /// Current revision TID
    pub rev: String,
    /// CID bytes of the current signed commit
    pub root: Vec<u8>,
    pub preferences: Option<Vec<u8>>,
    pub deactivated: bool,
}

impl Repo {
    pub fn status(&self) -> Option<&'static str> {
        if self.deactivated {
            Some("deactivated")
        } else {
            None
        }
    }

    pub fn active(&self) -> bool {
        self.status().is_none()
    }
}

/// DID to handle mapping
#[derive(Debug, Clone, FromRow)]
pub struct Actor {
    pub did: String,
    pub handle: String,
}

/// Repo joined with its actor, the shape most handlers work with
#[derive(Debug, Clone, FromRow)]
pub struct RepoActor {
    #[sqlx(flatten)]
    pub repo: Repo,
    pub handle: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct InviteCode {
    pub code: String,
    pub did: String,
    pub remaining_use_count: i64,
}

/// Legacy access token row, keyed by the JWT string itself
#[derive(Debug, Clone, FromRow)]
pub struct Token {
    pub token: String,
    pub did: String,
    pub refresh_token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Legacy refresh token row
#[derive(Debug, Clone, FromRow)]
pub struct RefreshToken {
    pub token: String,
    pub did: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Indexed view over the MST: one row per live record
#[derive(Debug, Clone, FromRow)]
pub struct Record {
    pub did: String,
    pub nsid: String,
    pub rkey: String,
    pub cid: String,
    pub created_at: String,
    /// dag-cbor bytes of the record body
    pub value: Vec<u8>,
}

/// Content-addressed block scoped to a DID
#[derive(Debug, Clone, FromRow)]
pub struct Block {
    pub did: String,
    pub cid: Vec<u8>,
    /// Revision tag; blocks written by one commit share a sort key
    pub rev: String,
    pub value: Vec<u8>,
}

/// Storage kind for blob bodies
pub const BLOB_STORAGE_SQLITE: &str = "sqlite";
pub const BLOB_STORAGE_S3: &str = "s3";

#[derive(Debug, Clone, FromRow)]
pub struct Blob {
    pub id: i64,
    pub did: String,
    /// Written last, once the full body has been hashed
    pub cid: Option<Vec<u8>>,
    pub ref_count: i64,
    pub storage: String,
    pub created_at: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct BlobPart {
    pub blob_id: i64,
    pub idx: i64,
    pub data: Vec<u8>,
}

/// Pre-signed key from reserveSigningKey, consumed at account creation
#[derive(Debug, Clone, FromRow)]
pub struct ReservedKey {
    pub key_did: String,
    pub did: Option<String>,
    pub private_key: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct AppPassword {
    pub did: String,
    pub name: String,
    /// bcrypt hash
    pub password: String,
    pub privileged: bool,
    pub created_at: DateTime<Utc>,
}

/// Persisted firehose event; `data` is the framed CBOR exactly as it goes
/// over the wire.
#[derive(Debug, Clone, FromRow)]
pub struct Event {
    pub seq: i64,
    pub data: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct EventSequence {
    pub id: i64,
    pub seq: i64,
}

/// Snapshot of how an OAuth client authenticated, stored as JSON alongside
/// requests and tokens.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientAuth {
    pub method: String,
    #[serde(default)]
    pub alg: String,
    #[serde(default)]
    pub kid: String,
    #[serde(default)]
    pub jkt: String,
    #[serde(default)]
    pub jti: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

/// The pushed authorization request parameters, stored as JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParRequestParameters {
    pub client_id: String,
    pub response_type: String,
    pub code_challenge: Option<String>,
    #[serde(default)]
    pub code_challenge_method: String,
    pub state: String,
    pub redirect_uri: String,
    pub scope: String,
    #[serde(default)]
    pub response_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dpop_jkt: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct OauthAuthorizationRequestRow {
    pub request_id: String,
    pub client_id: String,
    /// JSON-encoded ClientAuth
    pub client_auth: String,
    /// JSON-encoded ParRequestParameters
    pub parameters: String,
    pub sub: Option<String>,
    pub code: Option<String>,
    pub accepted: Option<bool>,
    pub ip: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct OauthTokenRow {
    pub id: i64,
    pub client_id: String,
    /// JSON-encoded ClientAuth
    pub client_auth: String,
    /// JSON-encoded ParRequestParameters
    pub parameters: String,
    pub sub: String,
    pub code: String,
    pub token: String,
    pub refresh_token: String,
    pub ip: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OauthAuthorizationRequestRow {
    pub fn client_auth(&self) -> serde_json::Result<ClientAuth> {
        serde_json::from_str(&self.client_auth)
    }

    pub fn parameters(&self) -> serde_json::Result<ParRequestParameters> {
        serde_json::from_str(&self.parameters)
    }
}

impl OauthTokenRow {
    pub fn client_auth(&self) -> serde_json::Result<ClientAuth> {
        serde_json::from_str(&self.client_auth)
    }

    pub fn parameters(&self) -> serde_json::Result<ParRequestParameters> {
        serde_json::from_str(&self.parameters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_status() {
        let repo = Repo {
            did: "did:plc:abc".to_string(),
            created_at: Utc::now(),
            email: "a@b.c".to_string(),
            email_confirmed_at: None,
            email_verification_code: None,
            email_verification_code_expires_at: None,
            password: String::new(),
            signing_key: vec![],
            rev: String::new(),
            root: vec![],
            preferences: None,
            deactivated: false,
        };
        assert!(repo.active());
        assert_eq!(repo.status(), None);

        let deactivated = Repo {
            deactivated: true,
            ..repo
        };
        assert!(!deactivated.active());
        assert_eq!(deactivated.status(), Some("deactivated"));
    }

    #[test]
    fn test_client_auth_round_trips_as_json() {
        let auth = ClientAuth {
            method: "private_key_jwt".to_string(),
            alg: "ES256".to_string(),
            kid: "key-1".to_string(),
            jkt: "thumb".to_string(),
            jti: "once".to_string(),
            exp: Some(1_700_000_000),
        };
        let json = serde_json::to_string(&auth).unwrap();
        let back: ClientAuth = serde_json::from_str(&json).unwrap();
        assert_eq!(back.method, "private_key_jwt");
        assert_eq!(back.exp, Some(1_700_000_000));
    }
}
