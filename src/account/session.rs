/// Legacy session tokens.
///
/// A session is a pair of ES256 JWTs sharing one `jti`: an access token
/// (`com.atproto.access`, 3 h) and a refresh token (`com.atproto.refresh`,
/// 7 d). Both are persisted by their full string so revocation and rotation
/// are row deletes, not denylists.
use crate::crypto::P256ServerKey;
use crate::db::Db;
use crate::error::{PdsError, PdsResult};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const SCOPE_ACCESS: &str = "com.atproto.access";
pub const SCOPE_REFRESH: &str = "com.atproto.refresh";
pub const SCOPE_APP_PASSWORD: &str = "com.atproto.appPass";

fn access_lifetime() -> Duration {
    Duration::hours(3)
}

fn refresh_lifetime() -> Duration {
    Duration::days(7)
}

/// Freshly minted token pair
#[derive(Debug, Clone)]
pub struct Session {
    pub access_jwt: String,
    pub refresh_jwt: String,
}

/// What a validated access token says about its caller
#[derive(Debug, Clone)]
pub struct ValidatedSession {
    pub did: String,
    pub scope: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    scope: String,
    aud: String,
    sub: String,
    iat: i64,
    exp: i64,
    jti: String,
}

pub struct SessionStore {
    db: Db,
    server_key: Arc<P256ServerKey>,
    server_did: String,
}

impl SessionStore {
    pub fn new(db: Db, server_key: Arc<P256ServerKey>, server_did: String) -> Self {
        Self {
            db,
            server_key,
            server_did,
        }
    }

    /// Mint and persist a session pair for a DID. App-password logins get
    /// the reduced `com.atproto.appPass` scope on their access token.
    pub async fn create_session(&self, did: &str, access_scope: &str) -> PdsResult<Session> {
        let now = Utc::now();
        let access_expires = now + access_lifetime();
        let refresh_expires = now + refresh_lifetime();
        let jti = uuid::Uuid::new_v4().to_string();

        let access_jwt = self.server_key.sign(&SessionClaims {
            scope: access_scope.to_string(),
            aud: self.server_did.clone(),
            sub: did.to_string(),
            iat: now.timestamp(),
            exp: access_expires.timestamp(),
            jti: jti.clone(),
        })?;

        let refresh_jwt = self.server_key.sign(&SessionClaims {
            scope: SCOPE_REFRESH.to_string(),
            aud: self.server_did.clone(),
            sub: did.to_string(),
            iat: now.timestamp(),
            exp: refresh_expires.timestamp(),
            jti,
        })?;

        let mut wtx = self.db.begin().await?;
        sqlx::query(
            "INSERT INTO tokens (token, did, refresh_token, created_at, expires_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&access_jwt)
        .bind(did)
        .bind(&refresh_jwt)
        .bind(now)
        .bind(access_expires)
        .execute(&mut *wtx.tx)
        .await
        .map_err(PdsError::Database)?;
        sqlx::query(
            "INSERT INTO refresh_tokens (token, did, created_at, expires_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&refresh_jwt)
        .bind(did)
        .bind(now)
        .bind(refresh_expires)
        .execute(&mut *wtx.tx)
        .await
        .map_err(PdsError::Database)?;
        wtx.commit().await?;

        Ok(Session {
            access_jwt,
            refresh_jwt,
        })
    }

    fn decode(&self, token: &str) -> PdsResult<SessionClaims> {
        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::ES256);
        validation.validate_aud = false;

        jsonwebtoken::decode::<SessionClaims>(token, &self.server_key.decoding_key(), &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => PdsError::ExpiredToken,
                _ => PdsError::InvalidToken,
            })
    }

    /// Validate an access token: signature, scope, and a live row.
    pub async fn validate_access_token(&self, token: &str) -> PdsResult<ValidatedSession> {
        let claims = self.decode(token)?;
        if claims.scope == SCOPE_REFRESH {
            return Err(PdsError::InvalidToken);
        }

        let row: Option<(String,)> = sqlx::query_as("SELECT did FROM tokens WHERE token = ?")
            .bind(token)
            .fetch_optional(self.db.reader())
            .await
            .map_err(PdsError::Database)?;
        if row.is_none() {
            return Err(PdsError::InvalidToken);
        }

        Ok(ValidatedSession {
            did: claims.sub,
            scope: claims.scope,
        })
    }

    /// Rotate a session. The refresh row delete is the atomic gate: the
    /// same refresh token cannot be redeemed twice.
    pub async fn refresh_session(&self, refresh_token: &str) -> PdsResult<(String, Session)> {
        let claims = self.decode(refresh_token)?;
        if claims.scope != SCOPE_REFRESH {
            return Err(PdsError::InvalidToken);
        }

        {
            let mut wtx = self.db.begin().await?;
            let deleted: Option<(String,)> = sqlx::query_as(
                "DELETE FROM refresh_tokens WHERE token = ? RETURNING did",
            )
            .bind(refresh_token)
            .fetch_optional(&mut *wtx.tx)
            .await
            .map_err(PdsError::Database)?;

            if deleted.is_none() {
                wtx.rollback().await?;
                return Err(PdsError::InvalidToken);
            }

            sqlx::query("DELETE FROM tokens WHERE refresh_token = ?")
                .bind(refresh_token)
                .execute(&mut *wtx.tx)
                .await
                .map_err(PdsError::Database)?;
            wtx.commit().await?;
        }

        let session = self.create_session(&claims.sub, SCOPE_ACCESS).await?;
        Ok((claims.sub, session))
    }

    /// Revoke a pair given either of its tokens.
    pub async fn delete_session(&self, token: &str) -> PdsResult<()> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT refresh_token FROM tokens WHERE token = ? OR refresh_token = ?",
        )
        .bind(token)
        .bind(token)
        .fetch_optional(self.db.reader())
        .await
        .map_err(PdsError::Database)?;
        let refresh_token = row.map(|(t,)| t).unwrap_or_else(|| token.to_string());

        let mut wtx = self.db.begin().await?;
        sqlx::query("DELETE FROM tokens WHERE token = ? OR refresh_token = ?")
            .bind(token)
            .bind(&refresh_token)
            .execute(&mut *wtx.tx)
            .await
            .map_err(PdsError::Database)?;
        sqlx::query("DELETE FROM refresh_tokens WHERE token = ?")
            .bind(&refresh_token)
            .execute(&mut *wtx.tx)
            .await
            .map_err(PdsError::Database)?;
        wtx.commit().await?;
        Ok(())
    }

    /// Drop every session a DID holds (password change, account delete).
    pub async fn revoke_all(&self, did: &str) -> PdsResult<()> {
        let mut wtx = self.db.begin().await?;
        sqlx::query("DELETE FROM tokens WHERE did = ?")
            .bind(did)
            .execute(&mut *wtx.tx)
            .await
            .map_err(PdsError::Database)?;
        sqlx::query("DELETE FROM refresh_tokens WHERE did = ?")
            .bind(did)
            .execute(&mut *wtx.tx)
            .await
            .map_err(PdsError::Database)?;
        wtx.commit().await?;
        Ok(())
    }

    /// Drop expired token rows (background job).
    pub async fn cleanup_expired(&self) -> PdsResult<u64> {
        let now = Utc::now();
        let a = self
            .db
            .exec(sqlx::query("DELETE FROM tokens WHERE expires_at < ?").bind(now))
            .await?;
        let b = self
            .db
            .exec(sqlx::query("DELETE FROM refresh_tokens WHERE expires_at < ?").bind(now))
            .await?;
        Ok(a.rows_affected() + b.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> SessionStore {
        let pool = crate::db::create_test_pool().await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let key = P256ServerKey::load_or_generate(&dir.path().join("k.jwk"))
            .await
            .unwrap();
        SessionStore::new(
            Db::new(pool),
            Arc::new(key),
            "did:web:pds.example.com".to_string(),
        )
    }

    #[tokio::test]
    async fn test_create_and_validate_session() {
        let store = test_store().await;
        let session = store
            .create_session("did:plc:alice", SCOPE_ACCESS)
            .await
            .unwrap();

        let validated = store
            .validate_access_token(&session.access_jwt)
            .await
            .unwrap();
        assert_eq!(validated.did, "did:plc:alice");
        assert_eq!(validated.scope, SCOPE_ACCESS);

        // the refresh token is not an access token
        assert!(store
            .validate_access_token(&session.refresh_jwt)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_refresh_rotates_and_burns_the_old_pair() {
        let store = test_store().await;
        let session = store
            .create_session("did:plc:alice", SCOPE_ACCESS)
            .await
            .unwrap();

        let (did, new_session) = store.refresh_session(&session.refresh_jwt).await.unwrap();
        assert_eq!(did, "did:plc:alice");
        assert_ne!(new_session.access_jwt, session.access_jwt);

        // the old pair is dead
        assert!(store
            .validate_access_token(&session.access_jwt)
            .await
            .is_err());
        assert!(store.refresh_session(&session.refresh_jwt).await.is_err());

        // the new one works
        assert!(store
            .validate_access_token(&new_session.access_jwt)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_delete_session_revokes_both_tokens() {
        let store = test_store().await;
        let session = store
            .create_session("did:plc:alice", SCOPE_ACCESS)
            .await
            .unwrap();

        store.delete_session(&session.access_jwt).await.unwrap();
        assert!(store
            .validate_access_token(&session.access_jwt)
            .await
            .is_err());
        assert!(store.refresh_session(&session.refresh_jwt).await.is_err());
    }

    #[tokio::test]
    async fn test_garbage_token_is_invalid() {
        let store = test_store().await;
        assert!(matches!(
            store.validate_access_token("not-a-jwt").await.unwrap_err(),
            PdsError::InvalidToken
        ));
    }
}
